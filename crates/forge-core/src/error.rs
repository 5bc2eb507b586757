//! The assistant-message-level error taxonomy.
//!
//! [`AgentError`] is both a Rust error type (`thiserror`) and a persisted
//! value: it is written onto the assistant message's metadata whenever a
//! request ends abnormally, so the caller can render the failure later.
//!
//! Classification drives the agent loop:
//!
//! - `aborted` stops the runner outright (never retried)
//! - `api-key` and `unknown` are fatal to the turn
//! - `api-call` (unless flagged non-retryable), `no-such-tool`, and
//!   `invalid-tool-input` are retried with exponential backoff
//! - an insufficient-credits signal embedded in an `api-call` body always
//!   stops, regardless of the retryable flag

use serde::{Deserialize, Serialize};

/// Body substrings that mark a provider "insufficient credits" condition.
///
/// Matched case-insensitively against the raw `api-call` response body.
const CREDIT_MARKERS: &[&str] = &[
    "insufficient credit",
    "credit balance",
    "insufficient_quota",
    "billing_not_active",
];

/// Error recorded on an assistant message when a request ends abnormally.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum AgentError {
    /// The request was cancelled mid-flight.
    #[error("request aborted")]
    Aborted,

    /// Credential resolution failed before the request was sent.
    #[error("API key resolution failed: {message}")]
    ApiKey {
        /// Human-readable failure description.
        message: String,
    },

    /// The provider returned an HTTP or stream error.
    #[error("API call failed (status {status}): {message}")]
    #[serde(rename_all = "camelCase")]
    ApiCall {
        /// HTTP status code (0 when the failure happened below HTTP).
        status: u16,
        /// Human-readable failure description.
        message: String,
        /// Raw response body, kept for sub-classification.
        #[serde(skip_serializing_if = "Option::is_none")]
        body: Option<String>,
        /// Whether the provider considers this failure retryable.
        retryable: bool,
    },

    /// The model produced input that failed the tool's schema.
    #[error("invalid input for tool `{tool_name}`: {message}")]
    #[serde(rename_all = "camelCase")]
    InvalidToolInput {
        /// Tool whose schema rejected the input.
        tool_name: String,
        /// Validation failure description.
        message: String,
    },

    /// The model invoked a tool name not present in the active tool set.
    #[error("no such tool: {tool_name}")]
    #[serde(rename_all = "camelCase")]
    NoSuchTool {
        /// The unrecognized tool name.
        tool_name: String,
    },

    /// Anything else. Always captured to the observability sink.
    #[error("{message}")]
    Unknown {
        /// Failure description.
        message: String,
    },
}

impl AgentError {
    /// Stable kind discriminator, matching the serialized `kind` tag.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Aborted => "aborted",
            Self::ApiKey { .. } => "api-key",
            Self::ApiCall { .. } => "api-call",
            Self::InvalidToolInput { .. } => "invalid-tool-input",
            Self::NoSuchTool { .. } => "no-such-tool",
            Self::Unknown { .. } => "unknown",
        }
    }

    /// Whether the surrounding request should be retried.
    ///
    /// Insufficient credits always wins over the retryable flag.
    #[must_use]
    pub fn retryable(&self) -> bool {
        if self.insufficient_credits() {
            return false;
        }
        match self {
            Self::ApiCall { retryable, .. } => *retryable,
            Self::NoSuchTool { .. } | Self::InvalidToolInput { .. } => true,
            Self::Aborted | Self::ApiKey { .. } | Self::Unknown { .. } => false,
        }
    }

    /// Whether this is a provider insufficient-credits condition.
    ///
    /// Detected from the raw `api-call` response body; providers signal this
    /// in the body rather than with a dedicated status code.
    #[must_use]
    pub fn insufficient_credits(&self) -> bool {
        match self {
            Self::ApiCall {
                body: Some(body), ..
            } => {
                let lower = body.to_lowercase();
                CREDIT_MARKERS.iter().any(|m| lower.contains(m))
            }
            _ => false,
        }
    }

    /// Wrap an arbitrary failure as `unknown`.
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::Unknown {
            message: message.into(),
        }
    }
}
