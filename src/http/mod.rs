//! HTTP plumbing shared by all Graph calls.
//!
//! [`HttpSession`] owns the connection pool and retry policy; the
//! [`response`] functions turn raw responses into results.

pub mod response;
pub mod session;

pub use session::{HttpSession, RetryPolicy};
