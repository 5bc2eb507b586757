//! # forge-runtime
//!
//! The agent execution engine: nested cooperative state machines that drive
//! one conversation turn from "user message queued" through LLM streaming,
//! sequential tool execution, interactive pauses, and turn completion.
//!
//! Layering, leaves first:
//!
//! - **[`stream_request`]**: one streaming LLM attempt with incremental
//!   part persistence and a chunk watchdog.
//! - **[`executor`]**: one tool invocation under a deadline with
//!   cancellation.
//! - **[`AgentRunner`]**: the repeated request → tool-execution cycle for
//!   one turn, with retries and the step budget.
//! - **[`SessionController`]**: owns a session's queued messages and
//!   supervises one runner at a time.
//!
//! Cancellation propagates top-down (controller → runner → executor/stream)
//! via [`tokio_util::sync::CancellationToken`]; every level reaches a
//! terminal, persisted state before reporting completion upward.
//!
//! ## Crate Position
//!
//! Depends on: forge-core, forge-store, forge-llm, forge-tools.

#![deny(unsafe_code)]

mod agent_runner;
mod config;
mod errors;
mod event_emitter;
mod executor;
mod interactive;
mod session_controller;
mod spec;
mod stream_request;

pub use agent_runner::{AgentRunner, RunnerDeps};
pub use config::RunnerConfig;
pub use errors::RuntimeError;
pub use event_emitter::EventEmitter;
pub use executor::execute_tool_call;
pub use interactive::{InteractiveOutcome, InteractiveTracker};
pub use session_controller::{
    RunState, SessionControl, SessionController, SessionHandle, SessionStatus, StatusHandle,
    ToolStatus,
};
pub use spec::{AgentSpec, TurnContext};
pub use stream_request::{StreamOutcome, StreamRequest};
