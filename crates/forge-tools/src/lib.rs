//! # forge-tools
//!
//! The tool boundary of the Forge engine: the [`AppTool`] trait every
//! capability implements, the [`ToolRegistry`] that resolves names to
//! implementations, and input validation against the declared schema.
//!
//! Tool implementations themselves (shell, filesystem, search, ...) live
//! outside this workspace; the engine only depends on the contract here.
//!
//! ## Crate Position
//!
//! Depends on: forge-core. Depended on by: forge-runtime.

#![deny(unsafe_code)]

mod errors;
mod registry;
mod traits;
mod validation;

pub mod testutil;

pub use errors::ToolError;
pub use registry::ToolRegistry;
pub use traits::{AppTool, ToolContext};
pub use validation::validate_input;
