//! Mailbox operations over Microsoft Graph.

pub mod client;
pub mod mailbox;
pub mod models;
pub mod query;

pub use client::{ClientOptions, MailClient};
pub use mailbox::{Mailbox, WellKnownFolder};
pub use models::{
    BodyType, EmailAddress, FileAttachment, ForwardDraft, ItemBody, MailFolder, OutgoingMessage,
    Recipient,
};
pub use query::QueryFilters;
