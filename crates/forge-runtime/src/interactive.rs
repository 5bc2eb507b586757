//! Pending interactive tool calls, resolved by external events.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

/// Resolution payload for one interactive call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum InteractiveOutcome {
    /// The call succeeded with this output.
    Success {
        /// Typed tool output.
        output: Value,
    },
    /// The call failed.
    Error {
        /// Failure description.
        message: String,
    },
}

/// Routes `updateInteractiveToolCall` events to the waiting runner via
/// oneshot channels keyed by tool-call id.
///
/// Shared between the controller (which resolves) and the runner (which
/// registers and awaits). Resolving an unknown id is a no-op.
#[derive(Default)]
pub struct InteractiveTracker {
    pending: HashMap<String, oneshot::Sender<InteractiveOutcome>>,
}

impl InteractiveTracker {
    /// An empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending call, returning the receiver that will deliver
    /// its resolution. Registering the same id again replaces the previous
    /// channel (the stale receiver errors).
    pub fn register(&mut self, tool_call_id: &str) -> oneshot::Receiver<InteractiveOutcome> {
        let (tx, rx) = oneshot::channel();
        let _ = self.pending.insert(tool_call_id.to_owned(), tx);
        rx
    }

    /// Resolve a pending call. Returns `false` (no-op) when the id is not
    /// pending or the runner already gave up waiting.
    pub fn resolve(&mut self, tool_call_id: &str, outcome: InteractiveOutcome) -> bool {
        match self.pending.remove(tool_call_id) {
            Some(tx) => tx.send(outcome).is_ok(),
            None => {
                debug!(tool_call_id, "resolution for unknown tool call ignored");
                false
            }
        }
    }

    /// Whether a call is pending.
    #[must_use]
    pub fn has_pending(&self, tool_call_id: &str) -> bool {
        self.pending.contains_key(tool_call_id)
    }

    /// Number of pending calls.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Drop all pending channels (waiting receivers error out).
    pub fn cancel_all(&mut self) {
        self.pending.clear();
    }
}
