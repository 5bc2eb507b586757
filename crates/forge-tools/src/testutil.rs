//! Shared test utilities for tool and engine tests.
//!
//! Compiled into the normal build so downstream crates' test suites can use
//! them; nothing here is reachable from production paths.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use forge_core::tool::ToolDefinition;

use crate::errors::ToolError;
use crate::traits::{AppTool, ToolContext};

/// Build a standard test [`ToolContext`].
#[must_use]
pub fn make_ctx() -> ToolContext {
    ToolContext {
        tool_call_id: "tc_test".into(),
        session_id: "ses_test".into(),
        cancellation: CancellationToken::new(),
    }
}

/// A configurable scripted tool.
///
/// Returns a fixed result (or error) after an optional delay, honoring
/// cancellation during the delay. Tracks how many times it ran.
pub struct StaticTool {
    name: String,
    read_only: bool,
    interactive: bool,
    timeout: Duration,
    delay: Duration,
    outcome: Result<Value, ToolError>,
    required: Vec<String>,
    calls: Arc<AtomicUsize>,
}

impl StaticTool {
    /// A tool with the given name that immediately succeeds with `"ok"`.
    #[must_use]
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            read_only: false,
            interactive: false,
            timeout: Duration::from_secs(60),
            delay: Duration::ZERO,
            outcome: Ok(json!("ok")),
            required: Vec::new(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Set the read-only flag.
    #[must_use]
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Set the interactive flag.
    #[must_use]
    pub fn interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    /// Set the execution deadline.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sleep this long before producing the outcome.
    #[must_use]
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Succeed with this value.
    #[must_use]
    pub fn returning(mut self, value: Value) -> Self {
        self.outcome = Ok(value);
        self
    }

    /// Fail with this execution error.
    #[must_use]
    pub fn failing(mut self, message: &str) -> Self {
        self.outcome = Err(ToolError::execution(message));
        self
    }

    /// Declare required input properties.
    #[must_use]
    pub fn requiring(mut self, names: &[&str]) -> Self {
        self.required = names.iter().map(|&n| n.to_owned()).collect();
        self
    }

    /// Shared call counter, for asserting how many times the tool ran.
    #[must_use]
    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl AppTool for StaticTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: format!("Test tool `{}`", self.name),
            input_schema: json!({
                "type": "object",
                "properties": {},
                "required": self.required,
            }),
            output_schema: None,
        }
    }

    fn read_only(&self) -> bool {
        self.read_only
    }

    fn interactive(&self) -> bool {
        self.interactive
    }

    fn timeout(&self, _input: &Value) -> Duration {
        self.timeout
    }

    async fn execute(&self, _input: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let _ = self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::select! {
                () = tokio::time::sleep(self.delay) => {}
                () = ctx.cancellation.cancelled() => return Err(ToolError::Cancelled),
            }
        }
        self.outcome.clone()
    }
}
