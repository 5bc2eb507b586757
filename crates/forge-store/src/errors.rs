//! Store error types.

/// Errors returned by store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Session id not present in the store.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Message id not present in the store.
    #[error("message not found: {0}")]
    MessageNotFound(String),

    /// A part's ownership ids disagree with its message. Rejected before
    /// any write.
    #[error("part {part_id} does not belong to message {message_id}")]
    PartOwnership {
        /// Offending part.
        part_id: String,
        /// Message the save targeted.
        message_id: String,
    },

    /// The operation's cancellation token fired.
    #[error("store operation cancelled")]
    Cancelled,

    /// SQLite error.
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    /// Connection pool error.
    #[error(transparent)]
    Pool(#[from] r2d2::Error),

    /// JSON (de)serialization failure.
    #[error("serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Store result alias.
pub type Result<T> = std::result::Result<T, StoreError>;
