//! The [`Store`] trait — the durable get/save interface the engine runs
//! against.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use forge_core::message::{Message, Session};
use forge_core::part::Part;

use crate::Result;

pub use forge_core::message::MessageWithParts;

/// Durable keyed storage for sessions, messages, and parts.
///
/// Every method is cancellable via the token and fallible. Writes are
/// full-record upserts: saving an existing id overwrites in place, never
/// merges. Part saves validate ownership: a part whose
/// `message_id`/`session_id` disagree with its message is rejected before
/// any write.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert or overwrite a session record.
    async fn save_session(&self, session: &Session, cancel: &CancellationToken) -> Result<()>;

    /// Fetch a session by id.
    async fn get_session(
        &self,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Session>>;

    /// Insert or overwrite a message record (metadata only, parts untouched).
    async fn save_message(&self, message: &Message, cancel: &CancellationToken) -> Result<()>;

    /// Atomically persist a message and its parts — all-or-nothing.
    async fn save_message_with_parts(
        &self,
        message: &Message,
        parts: &[Part],
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Insert or overwrite one part. Same part id overwrites in place and
    /// keeps the part's original position in emission order.
    async fn save_part(&self, part: &Part, cancel: &CancellationToken) -> Result<()>;

    /// Insert or overwrite several parts in order.
    async fn save_parts(&self, parts: &[Part], cancel: &CancellationToken) -> Result<()>;

    /// All messages of a session, ordered by creation, each with its parts
    /// in emission order.
    async fn get_messages_with_parts(
        &self,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<MessageWithParts>>;

    /// Parts of one message in emission order.
    async fn get_parts(&self, message_id: &str, cancel: &CancellationToken) -> Result<Vec<Part>>;

    /// Remove a message and its parts.
    async fn remove_message(&self, message_id: &str, cancel: &CancellationToken) -> Result<()>;

    /// Remove a session with all its messages and parts.
    async fn remove_session(&self, session_id: &str, cancel: &CancellationToken) -> Result<()>;
}
