//! Sessions and messages.
//!
//! A [`Session`] owns an ordered set of [`Message`]s; a message owns an
//! ordered list of parts (see [`crate::part`]). Assistant messages are
//! created empty at request start and filled incrementally as streamed
//! parts arrive — one assistant message per LLM request attempt.

use serde::{Deserialize, Serialize};

use crate::error::AgentError;
use crate::ids;

/// A conversation.
///
/// Created when the conversation starts; `updated_at` is refreshed on each
/// turn. Never mutated by more than one agent runner at a time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Unique session id (`ses_` prefix).
    pub id: String,
    /// Display title.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Parent session, when this session was spawned from another.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_session_id: Option<String>,
    /// ISO 8601 creation time.
    pub created_at: String,
    /// ISO 8601 last-update time.
    pub updated_at: String,
}

impl Session {
    /// Create a new session with a fresh id and timestamps.
    #[must_use]
    pub fn new(title: Option<&str>, parent_session_id: Option<&str>) -> Self {
        let now = ids::now_rfc3339();
        Self {
            id: ids::session_id(),
            title: title.map(str::to_owned),
            parent_session_id: parent_session_id.map(str::to_owned),
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// Refresh the `updated_at` timestamp.
    pub fn touch(&mut self) {
        self.updated_at = ids::now_rfc3339();
    }
}

/// Message role discriminator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    /// End-user input.
    User,
    /// Global system instruction.
    System,
    /// Model output.
    Assistant,
    /// Agent-scoped system/context injected per turn.
    SessionContext,
}

/// Why the model stopped generating.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinishReason {
    /// Natural end of response.
    Stop,
    /// The model requested tool execution.
    ToolCalls,
    /// Output token limit reached.
    Length,
    /// The request was cancelled or timed out mid-stream.
    Aborted,
    /// The request failed.
    Error,
}

/// Token usage reported by the provider at stream finish.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    /// Prompt tokens consumed.
    pub input_tokens: u64,
    /// Completion tokens produced.
    pub output_tokens: u64,
}

/// One message in a session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique message id (`msg_` prefix).
    pub id: String,
    /// Session this message belongs to.
    pub session_id: String,
    /// Role discriminator.
    pub role: Role,
    /// ISO 8601 creation time.
    pub created_at: String,
    /// Model that produced this message (assistant messages only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    /// Stop reason (assistant messages only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
    /// Token usage (assistant messages only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    /// Error recorded when the producing request ended abnormally.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<AgentError>,
    /// Milliseconds from request start to first streamed chunk.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_to_first_chunk_ms: Option<u64>,
    /// Milliseconds from request start to stream finish.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Output tokens per second, derived from usage and duration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_per_second: Option<f64>,
}

impl Message {
    /// Create a message with a fresh id in the given session.
    #[must_use]
    pub fn new(session_id: &str, role: Role) -> Self {
        Self {
            id: ids::message_id(),
            session_id: session_id.to_owned(),
            role,
            created_at: ids::now_rfc3339(),
            model_id: None,
            finish_reason: None,
            usage: None,
            error: None,
            time_to_first_chunk_ms: None,
            duration_ms: None,
            tokens_per_second: None,
        }
    }

    /// Create a user message.
    #[must_use]
    pub fn user(session_id: &str) -> Self {
        Self::new(session_id, Role::User)
    }

    /// Create an empty assistant message bound to a model.
    ///
    /// Persisted immediately at request start so a crash mid-stream still
    /// leaves a record.
    #[must_use]
    pub fn assistant(session_id: &str, model_id: &str) -> Self {
        let mut msg = Self::new(session_id, Role::Assistant);
        msg.model_id = Some(model_id.to_owned());
        msg
    }

    /// Whether this assistant message was superseded by a retry: it carries
    /// a retryable error and produced nothing the model needs to see again.
    #[must_use]
    pub fn is_superseded(&self) -> bool {
        self.role == Role::Assistant && self.error.as_ref().is_some_and(AgentError::retryable)
    }
}

/// A message together with its ordered parts — the unit of history assembly.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageWithParts {
    /// The message record.
    pub message: Message,
    /// Parts in emission order.
    pub parts: Vec<crate::part::Part>,
}
