//! Azure AD authentication module.
//!
//! Provides the delegated and application token flows, token records with
//! decoded claims, and the freshness guard that refreshes expired tokens.

pub mod oauth;
pub mod token;
pub mod token_manager;

pub use oauth::{ApplicationFlow, Credentials, DelegatedFlow, Flow, TokenProvider};
pub use token::{SecretString, TokenRecord};
pub use token_manager::TokenGuard;
