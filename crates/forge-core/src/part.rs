//! Parts — the atomic streamed/persisted unit of a message.
//!
//! Every part belongs to exactly one message and one session; its id is
//! assigned once and never reused. Updates are keyed overwrites (same part
//! id replaces the stored record), never appends.
//!
//! Tool-call parts carry a state machine:
//! `input-streaming` → `input-available` → (`output-available` | `output-error`).
//! An `input-streaming` part with no terminal `tool-call` event by
//! end-of-stream is an orphan and is surfaced as a data-integrity warning.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids;
use crate::message::Message;

/// Streaming state of a text or reasoning span.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SpanState {
    /// Deltas are still arriving.
    Streaming,
    /// The span is complete.
    Done,
}

/// Why a tool call ended in `output-error`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolErrorReason {
    /// The tool's deadline fired before it completed.
    Timeout,
    /// An external stop cancelled the call.
    Manual,
}

/// Tool-call part state machine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum ToolCallState {
    /// Argument JSON is still streaming from the model.
    #[serde(rename_all = "camelCase")]
    InputStreaming {
        /// Partial argument JSON accumulated so far.
        input_text: String,
    },
    /// Input is finalized; the call is ready to execute.
    #[serde(rename_all = "camelCase")]
    InputAvailable {
        /// Parsed tool input.
        input: Value,
    },
    /// The tool completed successfully.
    #[serde(rename_all = "camelCase")]
    OutputAvailable {
        /// Parsed tool input.
        input: Value,
        /// Typed tool output.
        output: Value,
    },
    /// The tool failed, timed out, or was cancelled.
    #[serde(rename_all = "camelCase")]
    OutputError {
        /// Parsed tool input (may be `null` if input never finalized).
        input: Value,
        /// Failure description, visible to the model on the next request.
        message: String,
        /// Cancellation reason, when the failure was not the tool's own.
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<ToolErrorReason>,
    },
}

impl ToolCallState {
    /// Whether this state is terminal (`output-available` or `output-error`).
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::OutputAvailable { .. } | Self::OutputError { .. })
    }
}

/// Part content, discriminated by `type`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PartContent {
    /// Streamed model text.
    Text {
        /// Accumulated text.
        text: String,
        /// Streaming state.
        state: SpanState,
    },
    /// Streamed model reasoning.
    Reasoning {
        /// Accumulated reasoning text.
        text: String,
        /// Streaming state.
        state: SpanState,
    },
    /// A tool invocation requested by the model.
    #[serde(rename_all = "camelCase")]
    ToolCall {
        /// Provider-assigned tool-call id.
        tool_call_id: String,
        /// Tool name as emitted by the model.
        tool_name: String,
        /// Set when the named tool was not in the active tool set.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        unavailable: bool,
        /// Call state machine.
        #[serde(flatten)]
        call: ToolCallState,
    },
    /// A cited source.
    #[serde(rename_all = "camelCase")]
    Source {
        /// Source URL.
        url: String,
        /// Source title, when provided.
        #[serde(skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },
    /// Marks the beginning of one LLM request attempt within a turn.
    #[serde(rename_all = "camelCase")]
    StepStart {
        /// Step count at the time of the attempt (1-based).
        step: u32,
    },
    /// Side-channel payload (e.g. a commit reference).
    Data {
        /// Payload discriminator.
        kind: String,
        /// Opaque payload.
        payload: Value,
    },
}

/// One part of a message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    /// Unique part id (`prt_` prefix). Assigned once, never reused.
    pub id: String,
    /// Owning message.
    pub message_id: String,
    /// Owning session (must match the message's session).
    pub session_id: String,
    /// Content, discriminated by `type`.
    #[serde(flatten)]
    pub content: PartContent,
}

impl Part {
    /// Create a part owned by `message` with a fresh id.
    #[must_use]
    pub fn new(message: &Message, content: PartContent) -> Self {
        Self {
            id: ids::part_id(),
            message_id: message.id.clone(),
            session_id: message.session_id.clone(),
            content,
        }
    }

    /// Whether this part's ownership ids agree with `message`.
    ///
    /// A save that violates this must fail validation before any write.
    #[must_use]
    pub fn belongs_to(&self, message: &Message) -> bool {
        self.message_id == message.id && self.session_id == message.session_id
    }

    /// The tool-call id, when this is a tool-call part.
    #[must_use]
    pub fn tool_call_id(&self) -> Option<&str> {
        match &self.content {
            PartContent::ToolCall { tool_call_id, .. } => Some(tool_call_id),
            _ => None,
        }
    }
}
