//! # forge-store
//!
//! Durable keyed storage for sessions, messages, and parts.
//!
//! - **[`Store`]**: the async store trait — every method is fallible,
//!   cancellable via a [`CancellationToken`], and returns a `Result` rather
//!   than panicking.
//! - **[`SqliteStore`]**: the production backend — r2d2-pooled SQLite with
//!   migrations at open and full-record upserts for every write.
//! - **[`MemoryStore`]**: an in-process backend for tests and ephemeral
//!   sessions.
//!
//! All writes are full-record upserts keyed by id, so independent sessions
//! need no cross-session locking: ids are globally unique and a write never
//! partially mutates a record in place.
//!
//! ## Crate Position
//!
//! Depends on: forge-core. Depended on by: forge-runtime.

#![deny(unsafe_code)]

pub mod errors;
pub mod memory;
pub mod sqlite;
mod traits;

pub use errors::{Result, StoreError};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{MessageWithParts, Store};

use tokio_util::sync::CancellationToken;

/// Fail fast with [`StoreError::Cancelled`] when the token has fired.
pub(crate) fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(StoreError::Cancelled)
    } else {
        Ok(())
    }
}
