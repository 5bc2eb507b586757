//! Event types for the agent engine.
//!
//! Two event families:
//!
//! - **[`StreamEvent`]**: low-level LLM streaming events from a provider
//!   (text/reasoning deltas, tool-call construction, finish). Purely
//!   in-memory; the stream request turns them into persisted parts.
//! - **[`ForgeEvent`]**: parent notifications emitted upward by the session
//!   controller and agent runner (done/paused/resumed/tool usage).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AgentError;
use crate::message::{FinishReason, TokenUsage};

// ─────────────────────────────────────────────────────────────────────────────
// StreamEvent — LLM provider streaming events
// ─────────────────────────────────────────────────────────────────────────────

/// Events emitted during LLM response streaming.
///
/// Span events (`text-*`, `reasoning-*`, `tool-input-*`) are keyed by a
/// provider-assigned id — one id per in-flight span or tool call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamEvent {
    /// Text span opened.
    TextStart {
        /// Provider-assigned span id.
        id: String,
    },
    /// Incremental text content.
    TextDelta {
        /// Provider-assigned span id.
        id: String,
        /// Text fragment.
        delta: String,
    },
    /// Text span closed.
    TextEnd {
        /// Provider-assigned span id.
        id: String,
    },
    /// Reasoning span opened.
    ReasoningStart {
        /// Provider-assigned span id.
        id: String,
    },
    /// Incremental reasoning content.
    ReasoningDelta {
        /// Provider-assigned span id.
        id: String,
        /// Reasoning fragment.
        delta: String,
    },
    /// Reasoning span closed.
    ReasoningEnd {
        /// Provider-assigned span id.
        id: String,
    },
    /// Tool call opened; argument JSON will stream.
    #[serde(rename_all = "camelCase")]
    ToolInputStart {
        /// Provider-assigned tool-call id.
        id: String,
        /// Tool name as emitted by the model.
        tool_name: String,
    },
    /// Incremental tool argument JSON.
    ToolInputDelta {
        /// Provider-assigned tool-call id.
        id: String,
        /// Partial JSON fragment.
        delta: String,
    },
    /// Tool call input finalized.
    ///
    /// May arrive with no prior `tool-input-start` — the call is then
    /// created ad hoc.
    #[serde(rename_all = "camelCase")]
    ToolCall {
        /// Provider-assigned tool-call id.
        id: String,
        /// Tool name as emitted by the model.
        tool_name: String,
        /// Finalized tool input.
        input: Value,
    },
    /// Provider-side tool error (validation/execution caught upstream).
    ///
    /// Written as a terminal `output-error` part without aborting the stream.
    #[serde(rename_all = "camelCase")]
    ToolError {
        /// Provider-assigned tool-call id.
        id: String,
        /// Tool name as emitted by the model.
        tool_name: String,
        /// Failure description.
        message: String,
    },
    /// A cited source.
    Source {
        /// Source URL.
        url: String,
        /// Source title, when provided.
        #[serde(skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },
    /// Stream completed; records usage and finish reason.
    #[serde(rename_all = "camelCase")]
    Finish {
        /// Stop reason reported by the provider.
        finish_reason: FinishReason,
        /// Token usage for the request.
        usage: TokenUsage,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// ForgeEvent — parent notifications
// ─────────────────────────────────────────────────────────────────────────────

/// Notifications emitted upward by the session controller and agent runner.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ForgeEvent {
    /// The agent runner reached its terminal state.
    #[serde(rename = "agent.done")]
    #[serde(rename_all = "camelCase")]
    AgentDone {
        /// Owning session.
        session_id: String,
        /// Terminal error, if the turn ended abnormally.
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<AgentError>,
    },
    /// The runner is blocked on interactive tool resolution.
    #[serde(rename = "agent.paused")]
    #[serde(rename_all = "camelCase")]
    AgentPaused {
        /// Owning session.
        session_id: String,
    },
    /// All pending interactive calls resolved; the loop resumed.
    #[serde(rename = "agent.resumed")]
    #[serde(rename_all = "camelCase")]
    AgentResumed {
        /// Owning session.
        session_id: String,
    },
    /// A tool is about to execute.
    #[serde(rename = "agent.usingTool")]
    #[serde(rename_all = "camelCase")]
    UsingTool {
        /// Owning session.
        session_id: String,
        /// Tool name.
        tool: String,
        /// Whether the tool is guaranteed not to mutate project state.
        read_only: bool,
    },
    /// The session controller finished.
    #[serde(rename = "session.done")]
    #[serde(rename_all = "camelCase")]
    SessionDone {
        /// Owning session.
        session_id: String,
        /// Final error, if any turn ended abnormally.
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<AgentError>,
        /// Whether any non-read-only tool ran during the session's lifetime.
        used_non_read_only_tools: bool,
    },
}

impl ForgeEvent {
    /// The session this event belongs to.
    #[must_use]
    pub fn session_id(&self) -> &str {
        match self {
            Self::AgentDone { session_id, .. }
            | Self::AgentPaused { session_id }
            | Self::AgentResumed { session_id }
            | Self::UsingTool { session_id, .. }
            | Self::SessionDone { session_id, .. } => session_id,
        }
    }

    /// Stable event-type discriminator, matching the serialized `type` tag.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::AgentDone { .. } => "agent.done",
            Self::AgentPaused { .. } => "agent.paused",
            Self::AgentResumed { .. } => "agent.resumed",
            Self::UsingTool { .. } => "agent.usingTool",
            Self::SessionDone { .. } => "session.done",
        }
    }
}
