//! Microsoft Graph mailbox client with Azure AD token management.
//!
//! [`MailClient`] signs in through a [`auth::TokenProvider`] (delegated
//! username/password or application client credentials), keeps the token
//! fresh with a [`TokenGuard`], and exposes folder, message, send and move
//! operations on any mailbox the credentials can reach.

#![deny(clippy::all)]

pub mod auth;
pub mod config;
pub mod error;
pub mod http;
pub mod mail;

pub use auth::{Credentials, Flow, TokenGuard, TokenRecord};
pub use config::Config;
pub use error::{AuthError, GraphError, GraphResult};
pub use mail::{Mailbox, MailClient, QueryFilters};
