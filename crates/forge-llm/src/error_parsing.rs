//! Provider error-body parsing.
//!
//! Providers report failures as JSON bodies of varying shape. This module
//! extracts a human-readable message and a retryable classification, and
//! wraps the result as [`AgentError::ApiCall`] with the raw body preserved
//! for downstream sub-classification (insufficient credits lives on the
//! body, not here).

use serde_json::Value;
use tracing::debug;

use forge_core::error::AgentError;

/// Status codes retried by default when the body carries no explicit
/// `retryable` flag.
fn status_retryable(status: u16) -> bool {
    matches!(status, 408 | 429 | 529) || (500..600).contains(&status)
}

/// Parsed provider failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiErrorInfo {
    /// HTTP status code.
    pub status: u16,
    /// Best-effort human-readable message.
    pub message: String,
    /// Provider error code, when the body carries one.
    pub code: Option<String>,
    /// Whether the request should be retried.
    pub retryable: bool,
}

impl ApiErrorInfo {
    /// Convert into the persisted error taxonomy, keeping the raw body.
    #[must_use]
    pub fn into_error(self, body: &str) -> AgentError {
        AgentError::ApiCall {
            status: self.status,
            message: self.message,
            body: (!body.is_empty()).then(|| body.to_owned()),
            retryable: self.retryable,
        }
    }
}

/// Parse a provider error response.
///
/// Handles the common shapes: `{"error": {"message", "code", "retryable"}}`,
/// `{"error": "text"}`, `{"message": "text"}`, and plain-text bodies. An
/// explicit `retryable` field in the body overrides the status-based
/// default in both directions.
#[must_use]
pub fn parse_api_error(status: u16, body: &str) -> ApiErrorInfo {
    let mut message = None;
    let mut code = None;
    let mut retryable = None;

    if let Ok(json) = serde_json::from_str::<Value>(body) {
        let error = json.get("error").unwrap_or(&json);
        match error {
            Value::String(text) => message = Some(text.clone()),
            Value::Object(obj) => {
                message = obj
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_owned);
                code = obj
                    .get("code")
                    .and_then(Value::as_str)
                    .map(str::to_owned)
                    .or_else(|| obj.get("type").and_then(Value::as_str).map(str::to_owned));
                retryable = obj.get("retryable").and_then(Value::as_bool);
            }
            _ => {}
        }
        if retryable.is_none() {
            retryable = json.get("retryable").and_then(Value::as_bool);
        }
    }

    let message = message
        .filter(|m| !m.is_empty())
        .or_else(|| {
            let trimmed = body.trim();
            (!trimmed.is_empty() && !trimmed.starts_with('{'))
                .then(|| truncate(trimmed, 500))
        })
        .unwrap_or_else(|| format!("request failed with status {status}"));

    let retryable = retryable.unwrap_or_else(|| status_retryable(status));

    debug!(status, retryable, code = code.as_deref(), "parsed provider error");
    ApiErrorInfo {
        status,
        message,
        code,
        retryable,
    }
}

/// Shorthand: parse and wrap in one step.
#[must_use]
pub fn api_error(status: u16, body: &str) -> AgentError {
    parse_api_error(status, body).into_error(body)
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        text.to_owned()
    } else {
        let mut end = max;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text[..end].to_owned()
    }
}
