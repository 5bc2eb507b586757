//! # forge-llm
//!
//! The language-model boundary of the Forge engine.
//!
//! - **[`LanguageModel`]**: an opaque streaming call — the engine never sees
//!   HTTP, credentials, or provider wire formats, only a stream of
//!   [`forge_core::events::StreamEvent`]s.
//! - **[`format`]**: pure request-assembly transforms (history → provider
//!   messages, tool-call id sanitizing, cache-boundary marking). No side
//!   effects on stored data.
//! - **[`error_parsing`]**: provider error-body parsing into the
//!   [`forge_core::error::AgentError`] taxonomy.
//!
//! ## Crate Position
//!
//! Depends on: forge-core. Depended on by: forge-runtime.

#![deny(unsafe_code)]

pub mod error_parsing;
pub mod format;
mod model;

pub use model::{LanguageModel, ModelRequest, ModelStream};
