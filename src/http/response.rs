//! Response normalization.
//!
//! Graph reports a missing item with the `ErrorItemNotFound` code. Callers
//! usually treat that as an expected outcome, so it gets its own error
//! variant; every other failure becomes [`GraphError::Http`].

use reqwest::Response;
use serde_json::Value;
use tracing::debug;

use crate::error::{truncate, GraphError, GraphResult, LOGGED_BODY_MAX_LEN};

/// Graph error code for a missing item.
pub const ERROR_ITEM_NOT_FOUND: &str = "ErrorItemNotFound";

/// Parsed JSON body; `Value::Null` for empty success bodies (202, 204).
pub async fn json(response: Response) -> GraphResult<Value> {
    let status = response.status().as_u16();
    let body = response.bytes().await?;
    classify(status, &body)?;

    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(&body).map_err(|e| GraphError::Decode(e.to_string()))
}

/// Raw body bytes, without JSON parsing.
pub async fn bytes(response: Response) -> GraphResult<Vec<u8>> {
    let status = response.status().as_u16();
    let body = response.bytes().await?;
    classify(status, &body)?;
    Ok(body.to_vec())
}

/// Status check only; the body is discarded.
pub async fn empty(response: Response) -> GraphResult<()> {
    let status = response.status().as_u16();
    let body = response.bytes().await?;
    classify(status, &body)
}

/// Map a status and body onto the error taxonomy.
pub fn classify(status: u16, body: &[u8]) -> GraphResult<()> {
    let error = serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|payload| payload.get("error").cloned());

    if let Some(error) = &error {
        if error.get("code").and_then(Value::as_str) == Some(ERROR_ITEM_NOT_FOUND) {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or(ERROR_ITEM_NOT_FOUND)
                .to_string();
            return Err(GraphError::NotFound { message });
        }
    }

    if !(200..300).contains(&status) {
        let body = String::from_utf8_lossy(body).into_owned();
        debug!("HTTP {}: {}", status, truncate(&body, LOGGED_BODY_MAX_LEN));
        return Err(GraphError::Http { status, body });
    }

    Ok(())
}
