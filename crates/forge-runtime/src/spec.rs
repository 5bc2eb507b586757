//! The [`AgentSpec`] trait — per-agent-type policy.
//!
//! The engine is generic over agent behavior: what context the model sees,
//! what tools it may call, when the loop continues, and what side effects
//! bracket a turn (snapshotting, auto-committing) all live behind this
//! trait.

use async_trait::async_trait;

use forge_llm::format::ContextMessage;
use forge_store::MessageWithParts;
use forge_tools::ToolRegistry;

/// Handed to the lifecycle hooks of one turn.
#[derive(Clone, Debug)]
pub struct TurnContext {
    /// Session the turn belongs to.
    pub session_id: String,
    /// The user message that triggered the turn.
    pub parent_message_id: String,
}

/// Per-agent-type policy object.
#[async_trait]
pub trait AgentSpec: Send + Sync {
    /// Initial system/context messages injected before session history.
    async fn context_messages(&self, session_id: &str) -> Vec<ContextMessage>;

    /// The tool set this agent may call.
    fn tools(&self) -> ToolRegistry;

    /// Whether the loop should issue another LLM request given the full
    /// session history.
    fn should_continue(&self, history: &[MessageWithParts]) -> bool;

    /// Fire-and-forget side effects at turn start (e.g. snapshotting).
    async fn on_start(&self, _ctx: &TurnContext) {}

    /// Side effects at turn end (e.g. auto-committing changes).
    async fn on_finish(&self, _ctx: &TurnContext) {}
}
