//! Provider-format request assembly.
//!
//! Pure transformations from stored history to a model-ready message list:
//! no side effects on stored data. The runtime calls [`build_model_messages`]
//! before every request attempt.
//!
//! Rules:
//!
//! - Agent context messages come first, as system content.
//! - Assistant messages superseded by a retry (retryable error, nothing the
//!   model needs to see again) are skipped.
//! - Terminal tool-call parts produce a tool-result message directly after
//!   their assistant message, preserving part order.
//! - Tool-call ids are sanitized to the provider-safe alphabet.
//! - Cache boundaries are marked on the last system message and the final
//!   message of the list.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use forge_core::message::{MessageWithParts, Role};
use forge_core::part::{PartContent, ToolCallState};

/// Providers accept `[A-Za-z0-9_-]`, at most this many characters.
const TOOL_CALL_ID_MAX_LEN: usize = 64;

/// An agent-provided system/context message injected per turn.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextMessage {
    /// Role the context is injected as.
    pub role: Role,
    /// Context text.
    pub text: String,
}

impl ContextMessage {
    /// A system-role context message.
    #[must_use]
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            text: text.into(),
        }
    }
}

/// Role of a provider-formatted message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderRole {
    /// System instruction.
    System,
    /// User turn.
    User,
    /// Assistant turn.
    Assistant,
    /// Tool results for the preceding assistant turn.
    Tool,
}

/// One content block of a provider-formatted message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ProviderContent {
    /// Plain text.
    Text {
        /// The text.
        text: String,
    },
    /// Model reasoning, replayed for providers that accept it.
    Reasoning {
        /// The reasoning text.
        text: String,
    },
    /// A tool invocation the assistant made.
    #[serde(rename_all = "camelCase")]
    ToolUse {
        /// Sanitized tool-call id.
        id: String,
        /// Tool name.
        name: String,
        /// Finalized input.
        input: Value,
    },
    /// The result of a tool invocation.
    #[serde(rename_all = "camelCase")]
    ToolResult {
        /// Sanitized tool-call id this result answers.
        id: String,
        /// Output value, or the error text for failed calls.
        output: Value,
        /// Whether the call failed.
        is_error: bool,
    },
}

/// A provider-formatted message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderMessage {
    /// Message role.
    pub role: ProviderRole,
    /// Ordered content blocks.
    pub content: Vec<ProviderContent>,
    /// Provider cache boundary marker (e.g. prompt-cache breakpoint).
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cache_boundary: bool,
}

impl ProviderMessage {
    fn new(role: ProviderRole) -> Self {
        Self {
            role,
            content: Vec::new(),
            cache_boundary: false,
        }
    }
}

/// Sanitize a provider tool-call id.
///
/// Characters outside `[A-Za-z0-9_-]` become `_`; the result is truncated
/// to 64 characters and never empty.
#[must_use]
pub fn sanitize_tool_call_id(raw: &str) -> String {
    let mut id: String = raw
        .chars()
        .take(TOOL_CALL_ID_MAX_LEN)
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if id.is_empty() {
        id.push_str("call");
    }
    id
}

/// Build the model-ready message list from session history plus the agent's
/// context messages.
#[must_use]
pub fn build_model_messages(
    history: &[MessageWithParts],
    context: &[ContextMessage],
) -> Vec<ProviderMessage> {
    let mut out = Vec::new();

    for ctx in context {
        let role = match ctx.role {
            Role::User => ProviderRole::User,
            // Session-context collapses into system content.
            Role::System | Role::SessionContext | Role::Assistant => ProviderRole::System,
        };
        let mut msg = ProviderMessage::new(role);
        msg.content.push(ProviderContent::Text {
            text: ctx.text.clone(),
        });
        out.push(msg);
    }

    for entry in history {
        match entry.message.role {
            Role::User => push_plain(&mut out, ProviderRole::User, entry),
            Role::System | Role::SessionContext => {
                push_plain(&mut out, ProviderRole::System, entry);
            }
            Role::Assistant => {
                if entry.message.is_superseded() {
                    continue;
                }
                push_assistant(&mut out, entry);
            }
        }
    }

    mark_cache_boundaries(&mut out);
    out
}

fn push_plain(out: &mut Vec<ProviderMessage>, role: ProviderRole, entry: &MessageWithParts) {
    let mut msg = ProviderMessage::new(role);
    for part in &entry.parts {
        if let PartContent::Text { text, .. } = &part.content {
            msg.content.push(ProviderContent::Text { text: text.clone() });
        }
    }
    if !msg.content.is_empty() {
        out.push(msg);
    }
}

fn push_assistant(out: &mut Vec<ProviderMessage>, entry: &MessageWithParts) {
    let mut assistant = ProviderMessage::new(ProviderRole::Assistant);
    let mut results = ProviderMessage::new(ProviderRole::Tool);

    for part in &entry.parts {
        match &part.content {
            PartContent::Text { text, .. } => {
                assistant
                    .content
                    .push(ProviderContent::Text { text: text.clone() });
            }
            PartContent::Reasoning { text, .. } => {
                assistant
                    .content
                    .push(ProviderContent::Reasoning { text: text.clone() });
            }
            PartContent::ToolCall {
                tool_call_id,
                tool_name,
                call,
                ..
            } => {
                let id = sanitize_tool_call_id(tool_call_id);
                match call {
                    // Never finalized — nothing the model can act on.
                    ToolCallState::InputStreaming { .. } => {}
                    ToolCallState::InputAvailable { input } => {
                        assistant.content.push(ProviderContent::ToolUse {
                            id,
                            name: tool_name.clone(),
                            input: input.clone(),
                        });
                    }
                    ToolCallState::OutputAvailable { input, output } => {
                        assistant.content.push(ProviderContent::ToolUse {
                            id: id.clone(),
                            name: tool_name.clone(),
                            input: input.clone(),
                        });
                        results.content.push(ProviderContent::ToolResult {
                            id,
                            output: output.clone(),
                            is_error: false,
                        });
                    }
                    ToolCallState::OutputError { input, message, .. } => {
                        assistant.content.push(ProviderContent::ToolUse {
                            id: id.clone(),
                            name: tool_name.clone(),
                            input: input.clone(),
                        });
                        results.content.push(ProviderContent::ToolResult {
                            id,
                            output: Value::String(message.clone()),
                            is_error: true,
                        });
                    }
                }
            }
            // Step markers, sources, and data payloads are bookkeeping —
            // the model never sees them.
            PartContent::StepStart { .. }
            | PartContent::Source { .. }
            | PartContent::Data { .. } => {}
        }
    }

    if !assistant.content.is_empty() {
        out.push(assistant);
    }
    if !results.content.is_empty() {
        out.push(results);
    }
}

/// Mark provider cache boundaries: the last system message and the final
/// message of the list.
fn mark_cache_boundaries(messages: &mut [ProviderMessage]) {
    if let Some(last_system) = messages
        .iter_mut()
        .rev()
        .find(|m| m.role == ProviderRole::System)
    {
        last_system.cache_boundary = true;
    }
    if let Some(last) = messages.last_mut() {
        last.cache_boundary = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_core::error::AgentError;
    use forge_core::message::Message;
    use forge_core::part::{Part, SpanState};
    use serde_json::json;

    fn user_entry(session: &str, text: &str) -> MessageWithParts {
        let message = Message::user(session);
        let parts = vec![Part::new(
            &message,
            PartContent::Text {
                text: text.into(),
                state: SpanState::Done,
            },
        )];
        MessageWithParts { message, parts }
    }

    fn assistant_entry(session: &str, parts_of: impl FnOnce(&Message) -> Vec<Part>) -> MessageWithParts {
        let message = Message::assistant(session, "m");
        let parts = parts_of(&message);
        MessageWithParts { message, parts }
    }

    // ── sanitize_tool_call_id ────────────────────────────────────────────

    #[test]
    fn sanitize_keeps_safe_chars() {
        assert_eq!(sanitize_tool_call_id("tc_abc-123"), "tc_abc-123");
    }

    #[test]
    fn sanitize_replaces_unsafe_chars() {
        assert_eq!(sanitize_tool_call_id("tc.1:2/3"), "tc_1_2_3");
    }

    #[test]
    fn sanitize_truncates_to_64() {
        let long = "x".repeat(100);
        assert_eq!(sanitize_tool_call_id(&long).len(), 64);
    }

    #[test]
    fn sanitize_never_empty() {
        assert_eq!(sanitize_tool_call_id(""), "call");
    }

    // ── build_model_messages ─────────────────────────────────────────────

    #[test]
    fn context_messages_come_first_as_system() {
        let out = build_model_messages(
            &[user_entry("s", "hi")],
            &[ContextMessage::system("You build apps.")],
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].role, ProviderRole::System);
        assert_eq!(out[1].role, ProviderRole::User);
    }

    #[test]
    fn session_context_role_collapses_to_system() {
        let ctx = ContextMessage {
            role: Role::SessionContext,
            text: "Project uses React.".into(),
        };
        let out = build_model_messages(&[], &[ctx]);
        assert_eq!(out[0].role, ProviderRole::System);
    }

    #[test]
    fn superseded_assistant_messages_skipped() {
        let mut failed = assistant_entry("s", |_| vec![]);
        failed.message.error = Some(AgentError::NoSuchTool {
            tool_name: "ghost".into(),
        });
        let good = assistant_entry("s", |m| {
            vec![Part::new(
                m,
                PartContent::Text {
                    text: "done".into(),
                    state: SpanState::Done,
                },
            )]
        });

        let out = build_model_messages(&[user_entry("s", "go"), failed, good], &[]);
        assert_eq!(out.len(), 2); // user + surviving assistant
        assert_eq!(out[1].role, ProviderRole::Assistant);
    }

    #[test]
    fn aborted_assistant_messages_are_kept() {
        // Aborted is not retryable, so the message was not superseded.
        let mut aborted = assistant_entry("s", |m| {
            vec![Part::new(
                m,
                PartContent::Text {
                    text: "partial".into(),
                    state: SpanState::Done,
                },
            )]
        });
        aborted.message.error = Some(AgentError::Aborted);

        let out = build_model_messages(&[aborted], &[]);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn terminal_tool_calls_produce_result_message() {
        let entry = assistant_entry("s", |m| {
            vec![
                Part::new(
                    m,
                    PartContent::ToolCall {
                        tool_call_id: "tc_1".into(),
                        tool_name: "read_file".into(),
                        unavailable: false,
                        call: ToolCallState::OutputAvailable {
                            input: json!({"path": "a.txt"}),
                            output: json!("contents"),
                        },
                    },
                ),
                Part::new(
                    m,
                    PartContent::ToolCall {
                        tool_call_id: "tc_2".into(),
                        tool_name: "write_file".into(),
                        unavailable: false,
                        call: ToolCallState::OutputError {
                            input: json!({}),
                            message: "denied".into(),
                            reason: None,
                        },
                    },
                ),
            ]
        });

        let out = build_model_messages(&[entry], &[]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].role, ProviderRole::Assistant);
        assert_eq!(out[0].content.len(), 2);
        assert_eq!(out[1].role, ProviderRole::Tool);
        assert_eq!(
            out[1].content,
            vec![
                ProviderContent::ToolResult {
                    id: "tc_1".into(),
                    output: json!("contents"),
                    is_error: false,
                },
                ProviderContent::ToolResult {
                    id: "tc_2".into(),
                    output: json!("denied"),
                    is_error: true,
                },
            ]
        );
    }

    #[test]
    fn input_streaming_tool_calls_are_dropped() {
        let entry = assistant_entry("s", |m| {
            vec![Part::new(
                m,
                PartContent::ToolCall {
                    tool_call_id: "tc_1".into(),
                    tool_name: "bash".into(),
                    unavailable: false,
                    call: ToolCallState::InputStreaming {
                        input_text: "{\"com".into(),
                    },
                },
            )]
        });
        let out = build_model_messages(&[entry], &[]);
        assert!(out.is_empty());
    }

    #[test]
    fn bookkeeping_parts_invisible_to_model() {
        let entry = assistant_entry("s", |m| {
            vec![
                Part::new(m, PartContent::StepStart { step: 1 }),
                Part::new(
                    m,
                    PartContent::Data {
                        kind: "commit".into(),
                        payload: json!({"sha": "abc"}),
                    },
                ),
                Part::new(
                    m,
                    PartContent::Text {
                        text: "hello".into(),
                        state: SpanState::Done,
                    },
                ),
            ]
        });
        let out = build_model_messages(&[entry], &[]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].content.len(), 1);
    }

    #[test]
    fn cache_boundaries_on_last_system_and_final_message() {
        let out = build_model_messages(
            &[user_entry("s", "hi")],
            &[
                ContextMessage::system("first"),
                ContextMessage::system("second"),
            ],
        );
        assert!(!out[0].cache_boundary);
        assert!(out[1].cache_boundary); // last system
        assert!(out[2].cache_boundary); // final message
    }

    #[test]
    fn unsafe_tool_ids_sanitized_in_both_places() {
        let entry = assistant_entry("s", |m| {
            vec![Part::new(
                m,
                PartContent::ToolCall {
                    tool_call_id: "call|weird".into(),
                    tool_name: "bash".into(),
                    unavailable: false,
                    call: ToolCallState::OutputAvailable {
                        input: json!({}),
                        output: json!("ok"),
                    },
                },
            )]
        });
        let out = build_model_messages(&[entry], &[]);
        let ProviderContent::ToolUse { id, .. } = &out[0].content[0] else {
            panic!("expected tool use");
        };
        assert_eq!(id, "call_weird");
        let ProviderContent::ToolResult { id, .. } = &out[1].content[0] else {
            panic!("expected tool result");
        };
        assert_eq!(id, "call_weird");
    }
}
