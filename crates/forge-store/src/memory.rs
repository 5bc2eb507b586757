//! In-memory [`Store`] backend for tests and ephemeral sessions.
//!
//! Mirrors the SQLite backend's semantics exactly: keyed upserts, emission
//! order preserved across overwrites, and ownership validation before any
//! write.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use forge_core::message::{Message, Session};
use forge_core::part::Part;

use crate::traits::{MessageWithParts, Store};
use crate::{Result, StoreError, check_cancelled};

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, Session>,
    messages: HashMap<String, Message>,
    /// Message ids per session in insertion order.
    session_messages: HashMap<String, Vec<String>>,
    parts: HashMap<String, Part>,
    /// Part ids per message in emission order. Upserts keep position.
    message_parts: HashMap<String, Vec<String>>,
}

impl Inner {
    fn upsert_message(&mut self, message: &Message) {
        if self.messages.insert(message.id.clone(), message.clone()).is_none() {
            self.session_messages
                .entry(message.session_id.clone())
                .or_default()
                .push(message.id.clone());
        }
    }

    fn upsert_part(&mut self, part: &Part) -> Result<()> {
        let owner = self
            .messages
            .get(&part.message_id)
            .ok_or_else(|| StoreError::MessageNotFound(part.message_id.clone()))?;
        if !part.belongs_to(owner) {
            return Err(StoreError::PartOwnership {
                part_id: part.id.clone(),
                message_id: part.message_id.clone(),
            });
        }
        if self.parts.insert(part.id.clone(), part.clone()).is_none() {
            self.message_parts
                .entry(part.message_id.clone())
                .or_default()
                .push(part.id.clone());
        }
        Ok(())
    }

    fn parts_of(&self, message_id: &str) -> Vec<Part> {
        self.message_parts
            .get(message_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.parts.get(id).cloned())
            .collect()
    }
}

/// In-memory store backed by a single mutex-guarded map set.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn save_session(&self, session: &Session, cancel: &CancellationToken) -> Result<()> {
        check_cancelled(cancel)?;
        let _ = self
            .inner
            .lock()
            .sessions
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get_session(
        &self,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Session>> {
        check_cancelled(cancel)?;
        Ok(self.inner.lock().sessions.get(session_id).cloned())
    }

    async fn save_message(&self, message: &Message, cancel: &CancellationToken) -> Result<()> {
        check_cancelled(cancel)?;
        self.inner.lock().upsert_message(message);
        Ok(())
    }

    async fn save_message_with_parts(
        &self,
        message: &Message,
        parts: &[Part],
        cancel: &CancellationToken,
    ) -> Result<()> {
        check_cancelled(cancel)?;
        // Validate before any write — all-or-nothing.
        for part in parts {
            if !part.belongs_to(message) {
                return Err(StoreError::PartOwnership {
                    part_id: part.id.clone(),
                    message_id: message.id.clone(),
                });
            }
        }
        let mut inner = self.inner.lock();
        inner.upsert_message(message);
        for part in parts {
            inner.upsert_part(part)?;
        }
        Ok(())
    }

    async fn save_part(&self, part: &Part, cancel: &CancellationToken) -> Result<()> {
        check_cancelled(cancel)?;
        self.inner.lock().upsert_part(part)
    }

    async fn save_parts(&self, parts: &[Part], cancel: &CancellationToken) -> Result<()> {
        check_cancelled(cancel)?;
        let mut inner = self.inner.lock();
        for part in parts {
            inner.upsert_part(part)?;
        }
        Ok(())
    }

    async fn get_messages_with_parts(
        &self,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<MessageWithParts>> {
        check_cancelled(cancel)?;
        let inner = self.inner.lock();
        Ok(inner
            .session_messages
            .get(session_id)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.messages.get(id))
            .map(|message| MessageWithParts {
                message: message.clone(),
                parts: inner.parts_of(&message.id),
            })
            .collect())
    }

    async fn get_parts(&self, message_id: &str, cancel: &CancellationToken) -> Result<Vec<Part>> {
        check_cancelled(cancel)?;
        Ok(self.inner.lock().parts_of(message_id))
    }

    async fn remove_message(&self, message_id: &str, cancel: &CancellationToken) -> Result<()> {
        check_cancelled(cancel)?;
        let mut inner = self.inner.lock();
        let Some(message) = inner.messages.remove(message_id) else {
            return Err(StoreError::MessageNotFound(message_id.to_owned()));
        };
        if let Some(ids) = inner.session_messages.get_mut(&message.session_id) {
            ids.retain(|id| id != message_id);
        }
        if let Some(part_ids) = inner.message_parts.remove(message_id) {
            for id in part_ids {
                let _ = inner.parts.remove(&id);
            }
        }
        Ok(())
    }

    async fn remove_session(&self, session_id: &str, cancel: &CancellationToken) -> Result<()> {
        check_cancelled(cancel)?;
        let mut inner = self.inner.lock();
        let _ = inner.sessions.remove(session_id);
        let message_ids = inner.session_messages.remove(session_id).unwrap_or_default();
        for message_id in message_ids {
            let _ = inner.messages.remove(&message_id);
            if let Some(part_ids) = inner.message_parts.remove(&message_id) {
                for id in part_ids {
                    let _ = inner.parts.remove(&id);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use forge_core::message::Role;
    use forge_core::part::{PartContent, SpanState};

    fn text_part(message: &Message, text: &str) -> Part {
        Part::new(
            message,
            PartContent::Text {
                text: text.into(),
                state: SpanState::Done,
            },
        )
    }

    #[tokio::test]
    async fn session_round_trip() {
        let store = MemoryStore::new();
        let cancel = CancellationToken::new();
        let session = Session::new(Some("app"), None);

        store.save_session(&session, &cancel).await.unwrap();
        let loaded = store.get_session(&session.id, &cancel).await.unwrap();
        assert_eq!(loaded, Some(session));
    }

    #[tokio::test]
    async fn get_unknown_session_returns_none() {
        let store = MemoryStore::new();
        let cancel = CancellationToken::new();
        assert!(store.get_session("nope", &cancel).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn messages_keep_insertion_order() {
        let store = MemoryStore::new();
        let cancel = CancellationToken::new();
        let first = Message::user("ses_1");
        let second = Message::assistant("ses_1", "m");

        store.save_message(&first, &cancel).await.unwrap();
        store.save_message(&second, &cancel).await.unwrap();

        let history = store.get_messages_with_parts("ses_1", &cancel).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].message.id, first.id);
        assert_eq!(history[1].message.id, second.id);
    }

    #[tokio::test]
    async fn part_upsert_overwrites_in_place() {
        let store = MemoryStore::new();
        let cancel = CancellationToken::new();
        let message = Message::assistant("ses_1", "m");
        store.save_message(&message, &cancel).await.unwrap();

        let mut part = text_part(&message, "first");
        store.save_part(&part, &cancel).await.unwrap();

        part.content = PartContent::Text {
            text: "second".into(),
            state: SpanState::Done,
        };
        store.save_part(&part, &cancel).await.unwrap();

        let parts = store.get_parts(&message.id, &cancel).await.unwrap();
        assert_eq!(parts.len(), 1);
        assert_matches!(&parts[0].content, PartContent::Text { text, .. } if text == "second");
    }

    #[tokio::test]
    async fn part_upsert_keeps_emission_order() {
        let store = MemoryStore::new();
        let cancel = CancellationToken::new();
        let message = Message::assistant("ses_1", "m");
        store.save_message(&message, &cancel).await.unwrap();

        let mut a = text_part(&message, "a");
        let b = text_part(&message, "b");
        store.save_part(&a, &cancel).await.unwrap();
        store.save_part(&b, &cancel).await.unwrap();

        // Overwrite the first part after the second was inserted.
        a.content = PartContent::Text {
            text: "a2".into(),
            state: SpanState::Done,
        };
        store.save_part(&a, &cancel).await.unwrap();

        let parts = store.get_parts(&message.id, &cancel).await.unwrap();
        assert_eq!(parts[0].id, a.id);
        assert_eq!(parts[1].id, b.id);
    }

    #[tokio::test]
    async fn part_ownership_violation_rejected() {
        let store = MemoryStore::new();
        let cancel = CancellationToken::new();
        let message = Message::assistant("ses_1", "m");
        let foreign = Message::assistant("ses_2", "m");
        store.save_message(&message, &cancel).await.unwrap();
        store.save_message(&foreign, &cancel).await.unwrap();

        let mut part = text_part(&foreign, "x");
        // Claim to belong to `message` while carrying the foreign session id.
        part.message_id = message.id.clone();

        let err = store.save_part(&part, &cancel).await.unwrap_err();
        assert_matches!(err, StoreError::PartOwnership { .. });
        assert!(store.get_parts(&message.id, &cancel).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn save_message_with_parts_validates_before_write() {
        let store = MemoryStore::new();
        let cancel = CancellationToken::new();
        let message = Message::assistant("ses_1", "m");
        let good = text_part(&message, "good");
        let mut bad = text_part(&message, "bad");
        bad.session_id = "ses_other".into();

        let err = store
            .save_message_with_parts(&message, &[good, bad], &cancel)
            .await
            .unwrap_err();
        assert_matches!(err, StoreError::PartOwnership { .. });

        // All-or-nothing: nothing was written.
        assert!(
            store
                .get_messages_with_parts("ses_1", &cancel)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn save_part_without_message_fails() {
        let store = MemoryStore::new();
        let cancel = CancellationToken::new();
        let message = Message::assistant("ses_1", "m");
        let part = text_part(&message, "x");

        let err = store.save_part(&part, &cancel).await.unwrap_err();
        assert_matches!(err, StoreError::MessageNotFound(_));
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let store = MemoryStore::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let session = Session::new(None, None);
        let err = store.save_session(&session, &cancel).await.unwrap_err();
        assert_matches!(err, StoreError::Cancelled);
    }

    #[tokio::test]
    async fn remove_message_drops_parts() {
        let store = MemoryStore::new();
        let cancel = CancellationToken::new();
        let message = Message::user("ses_1");
        let part = text_part(&message, "x");
        store
            .save_message_with_parts(&message, &[part], &cancel)
            .await
            .unwrap();

        store.remove_message(&message.id, &cancel).await.unwrap();
        assert!(store.get_parts(&message.id, &cancel).await.unwrap().is_empty());
        assert!(
            store
                .get_messages_with_parts("ses_1", &cancel)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn remove_session_drops_everything() {
        let store = MemoryStore::new();
        let cancel = CancellationToken::new();
        let session = Session::new(None, None);
        store.save_session(&session, &cancel).await.unwrap();

        let message = Message::user(&session.id);
        let part = text_part(&message, "x");
        store
            .save_message_with_parts(&message, &[part], &cancel)
            .await
            .unwrap();

        store.remove_session(&session.id, &cancel).await.unwrap();
        assert!(store.get_session(&session.id, &cancel).await.unwrap().is_none());
        assert!(
            store
                .get_messages_with_parts(&session.id, &cancel)
                .await
                .unwrap()
                .is_empty()
        );
    }
}
