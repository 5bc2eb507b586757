//! The [`AppTool`] trait and per-invocation [`ToolContext`].

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use forge_core::tool::ToolDefinition;

use crate::errors::ToolError;

/// Per-invocation context handed to a tool's `execute`.
#[derive(Clone, Debug)]
pub struct ToolContext {
    /// Id of the tool-call part being executed.
    pub tool_call_id: String,
    /// Session the invocation belongs to.
    pub session_id: String,
    /// Cancelled when the invocation times out or the session is stopped.
    /// Tools must honor this at every await point.
    pub cancellation: CancellationToken,
}

/// A named capability the model can invoke.
///
/// Implementations live outside the engine; the executor only sees this
/// contract. `execute` runs on the runner task, so long-running work must
/// be genuinely async and cancellation-aware.
#[async_trait]
pub trait AppTool: Send + Sync {
    /// Unique tool name within the active tool set.
    fn name(&self) -> &str;

    /// Wire-level definition presented to the model.
    fn definition(&self) -> ToolDefinition;

    /// Whether the tool only reads state. The first non-read-only
    /// invocation flips the session's coarse status irreversibly.
    fn read_only(&self) -> bool {
        false
    }

    /// Whether the result comes from outside the automated loop (e.g. a
    /// human choice). Interactive calls pause the runner instead of
    /// executing.
    fn interactive(&self) -> bool {
        false
    }

    /// Execution deadline, possibly input-dependent.
    fn timeout(&self, _input: &Value) -> Duration {
        Duration::from_secs(60)
    }

    /// Run the tool.
    async fn execute(&self, input: Value, ctx: &ToolContext) -> Result<Value, ToolError>;
}
