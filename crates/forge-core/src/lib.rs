//! # forge-core
//!
//! Foundation types for the Forge agent engine.
//!
//! This crate provides the shared vocabulary that all other Forge crates
//! depend on:
//!
//! - **Ids**: [`ids`] — prefixed UUID v7 constructors for sessions, messages,
//!   parts, and tool calls
//! - **Messages**: [`message::Session`], [`message::Message`] with role-specific
//!   metadata (model id, finish reason, usage, error, timings)
//! - **Parts**: [`part::Part`] — the atomic streamed/persisted unit, including
//!   the tool-call part state machine
//! - **Errors**: [`error::AgentError`] — the assistant-message-level error
//!   taxonomy with retry classification
//! - **Events**: [`events::StreamEvent`] for LLM streaming,
//!   [`events::ForgeEvent`] for session/agent lifecycle notifications
//! - **Retry**: [`retry::RetryPolicy`] with exponential backoff
//! - **Tools**: [`tool::ToolDefinition`] — the wire-level tool description
//!
//! ## Crate Position
//!
//! Foundation crate. Depended on by all other forge crates.

#![deny(unsafe_code)]

pub mod error;
pub mod events;
pub mod ids;
pub mod logging;
pub mod message;
pub mod part;
pub mod retry;
pub mod tool;
