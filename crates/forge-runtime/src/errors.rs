//! Runtime-level errors.

use forge_store::StoreError;

/// Failures surfaced by the session controller and its handle.
///
/// Stream- and tool-level failures never appear here — they are persisted
/// onto messages and parts as part of the error taxonomy. This type only
/// covers the engine's own plumbing.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The controller task has terminated; the handle is stale.
    #[error("session closed")]
    SessionClosed,

    /// A store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}
