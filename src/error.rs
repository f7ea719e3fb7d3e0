//! Error types for the graphmail library.
//!
//! Uses `thiserror` for library-style errors with automatic `Display` and `Error` implementations.

use thiserror::Error;

/// Token acquisition errors.
#[derive(Error, Debug)]
pub enum AuthError {
    /// The token endpoint answered with an OAuth2 error payload.
    #[error("{code}: {description}")]
    Provider { code: String, description: String },

    #[error("Token request failed: {0}")]
    Request(String),

    #[error("Invalid access token: {0}")]
    InvalidToken(String),

    #[error("Missing credential: {0}")]
    MissingCredential(&'static str),
}

impl AuthError {
    /// Build a provider error, flattening line breaks in the description.
    pub fn provider(code: impl Into<String>, description: &str) -> Self {
        Self::Provider {
            code: code.into(),
            description: flatten_description(description),
        }
    }
}

/// Maximum characters of a response body kept for logging.
pub(crate) const LOGGED_BODY_MAX_LEN: usize = 200;

pub(crate) fn truncate(body: &str, max: usize) -> &str {
    match body.char_indices().nth(max) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

/// Azure AD returns multi-line descriptions (trace ids, timestamps).
fn flatten_description(description: &str) -> String {
    description
        .replace("\r\n", " --- ")
        .replace(['\n', '\r'], " --- ")
}

/// Errors surfaced by mailbox operations.
#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    /// The server reported `ErrorItemNotFound`.
    #[error("Item not found: {message}")]
    NotFound { message: String },

    #[error("Graph request failed: HTTP {status}")]
    Http { status: u16, body: String },

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Failed to parse API response: {0}")]
    Decode(String),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Pagination stopped after {limit} pages")]
    PageLimitExceeded { limit: usize },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl GraphError {
    /// True when the server signalled the specific "item not found" condition.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true if this error means the held token is no good anymore.
    pub fn requires_reauthentication(&self) -> bool {
        matches!(
            self,
            Self::Auth(AuthError::Provider { .. } | AuthError::InvalidToken(_))
                | Self::Http { status: 401, .. }
        )
    }

    /// Returns a user-friendly message for display in the CLI.
    pub fn user_message(&self) -> &str {
        match self {
            Self::Auth(AuthError::MissingCredential(_)) => {
                "Credentials are incomplete. Check the configuration."
            }
            Self::Auth(_) => "Sign-in failed. Check the configured credentials.",
            Self::NotFound { .. } => "The requested item does not exist.",
            Self::Http { status: 401, .. } => "Authentication expired. Sign in again.",
            Self::Http { status: 403, .. } => "Insufficient permissions for this operation.",
            Self::Http { status: 429, .. } => "Too many requests. Please wait a moment.",
            Self::Http { .. } => "The mailbox service rejected the request.",
            Self::Validation(_) => "The request parameters are invalid.",
            Self::Network(_) => "Network error. Check your connection.",
            Self::PageLimitExceeded { .. } => {
                "Too many result pages. Narrow the query or raise the page limit."
            }
            Self::Config(_) => "Configuration error. Please check settings.",
            _ => "An error occurred. Please try again.",
        }
    }
}

pub type GraphResult<T> = Result<T, GraphError>;
