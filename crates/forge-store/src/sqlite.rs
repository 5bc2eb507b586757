//! SQLite [`Store`] backend.
//!
//! r2d2-pooled connections, migrations at open, and full-record upserts for
//! every write. Messages and parts keep a monotonically increasing `seq`
//! rowid assigned on first insert; upserts overwrite the JSON record but
//! never move a row, so emission order survives overwrites.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{OptionalExtension, params};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use forge_core::message::{Message, Session};
use forge_core::part::Part;

use crate::traits::{MessageWithParts, Store};
use crate::{Result, StoreError, check_cancelled};

/// Pooled connection alias.
type Pool = r2d2::Pool<SqliteConnectionManager>;
type PooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

const MIGRATIONS: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    record TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS messages (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    session_id TEXT NOT NULL,
    record TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id);
CREATE TABLE IF NOT EXISTS parts (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    message_id TEXT NOT NULL,
    session_id TEXT NOT NULL,
    record TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_parts_message ON parts(message_id);
CREATE INDEX IF NOT EXISTS idx_parts_session ON parts(session_id);
";

/// SQLite-backed store.
pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    const BUSY_MAX_RETRIES: u32 = 32;

    /// Open (or create) a database file and run migrations.
    #[instrument(skip_all)]
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA foreign_keys = ON;",
            )
        });
        Self::from_manager(manager, 8)
    }

    /// Open an in-memory database (single connection, for tests).
    pub fn in_memory() -> Result<Self> {
        Self::from_manager(SqliteConnectionManager::memory(), 1)
    }

    fn from_manager(manager: SqliteConnectionManager, max_size: u32) -> Result<Self> {
        let pool = r2d2::Pool::builder().max_size(max_size).build(manager)?;
        {
            let conn = pool.get()?;
            conn.execute_batch(MIGRATIONS)?;
        }
        debug!("sqlite store opened");
        Ok(Self { pool })
    }

    fn conn(&self) -> Result<PooledConnection> {
        Ok(self.pool.get()?)
    }

    /// Retry an operation on `SQLite` BUSY/LOCKED with linear backoff + jitter.
    fn retry_on_busy<T>(&self, mut f: impl FnMut() -> Result<T>) -> Result<T> {
        let mut attempts = 0;
        loop {
            match f() {
                Ok(value) => return Ok(value),
                Err(err) if Self::is_busy(&err) && attempts < Self::BUSY_MAX_RETRIES => {
                    attempts += 1;
                    let base_ms = u64::from(attempts).saturating_mul(10).min(500);
                    let jitter_range = base_ms / 4;
                    let jitter = if jitter_range > 0 {
                        rand::random::<u64>() % (jitter_range * 2 + 1)
                    } else {
                        0
                    };
                    let backoff_ms = base_ms.saturating_sub(jitter_range) + jitter;
                    std::thread::sleep(Duration::from_millis(backoff_ms));
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn is_busy(err: &StoreError) -> bool {
        match err {
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(code, _)) => matches!(
                code.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    fn upsert_message_tx(tx: &rusqlite::Connection, message: &Message) -> Result<()> {
        let record = serde_json::to_string(message)?;
        let _ = tx.execute(
            "INSERT INTO messages (id, session_id, record) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET record = excluded.record",
            params![message.id, message.session_id, record],
        )?;
        Ok(())
    }

    /// Upsert one part, validating ownership against the stored message row.
    fn upsert_part_tx(tx: &rusqlite::Connection, part: &Part) -> Result<()> {
        let owner_session: Option<String> = tx
            .query_row(
                "SELECT session_id FROM messages WHERE id = ?1",
                params![part.message_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(owner_session) = owner_session else {
            return Err(StoreError::MessageNotFound(part.message_id.clone()));
        };
        if owner_session != part.session_id {
            return Err(StoreError::PartOwnership {
                part_id: part.id.clone(),
                message_id: part.message_id.clone(),
            });
        }
        let record = serde_json::to_string(part)?;
        let _ = tx.execute(
            "INSERT INTO parts (id, message_id, session_id, record) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET record = excluded.record",
            params![part.id, part.message_id, part.session_id, record],
        )?;
        Ok(())
    }

    fn parts_of(conn: &rusqlite::Connection, message_id: &str) -> Result<Vec<Part>> {
        let mut stmt =
            conn.prepare("SELECT record FROM parts WHERE message_id = ?1 ORDER BY seq")?;
        let rows = stmt.query_map(params![message_id], |row| row.get::<_, String>(0))?;
        let mut parts = Vec::new();
        for record in rows {
            parts.push(serde_json::from_str(&record?)?);
        }
        Ok(parts)
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn save_session(&self, session: &Session, cancel: &CancellationToken) -> Result<()> {
        check_cancelled(cancel)?;
        self.retry_on_busy(|| {
            let conn = self.conn()?;
            let record = serde_json::to_string(session)?;
            let _ = conn.execute(
                "INSERT INTO sessions (id, record) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET record = excluded.record",
                params![session.id, record],
            )?;
            Ok(())
        })
    }

    async fn get_session(
        &self,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Session>> {
        check_cancelled(cancel)?;
        let conn = self.conn()?;
        let record: Option<String> = conn
            .query_row(
                "SELECT record FROM sessions WHERE id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;
        match record {
            Some(record) => Ok(Some(serde_json::from_str(&record)?)),
            None => Ok(None),
        }
    }

    async fn save_message(&self, message: &Message, cancel: &CancellationToken) -> Result<()> {
        check_cancelled(cancel)?;
        self.retry_on_busy(|| {
            let conn = self.conn()?;
            Self::upsert_message_tx(&conn, message)
        })
    }

    #[instrument(skip_all, fields(message_id = %message.id, parts = parts.len()))]
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
        self.retry_on_busy(|| {
            let conn = self.conn()?;
            let tx = conn.unchecked_transaction()?;
            Self::upsert_message_tx(&tx, message)?;
            for part in parts {
                Self::upsert_part_tx(&tx, part)?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    async fn save_part(&self, part: &Part, cancel: &CancellationToken) -> Result<()> {
        check_cancelled(cancel)?;
        self.retry_on_busy(|| {
            let conn = self.conn()?;
            Self::upsert_part_tx(&conn, part)
        })
    }

    async fn save_parts(&self, parts: &[Part], cancel: &CancellationToken) -> Result<()> {
        check_cancelled(cancel)?;
        self.retry_on_busy(|| {
            let conn = self.conn()?;
            let tx = conn.unchecked_transaction()?;
            for part in parts {
                Self::upsert_part_tx(&tx, part)?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    async fn get_messages_with_parts(
        &self,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<MessageWithParts>> {
        check_cancelled(cancel)?;
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT record FROM messages WHERE session_id = ?1 ORDER BY seq")?;
        let rows = stmt.query_map(params![session_id], |row| row.get::<_, String>(0))?;
        let mut result = Vec::new();
        for record in rows {
            let message: Message = serde_json::from_str(&record?)?;
            let parts = Self::parts_of(&conn, &message.id)?;
            result.push(MessageWithParts { message, parts });
        }
        Ok(result)
    }

    async fn get_parts(&self, message_id: &str, cancel: &CancellationToken) -> Result<Vec<Part>> {
        check_cancelled(cancel)?;
        let conn = self.conn()?;
        Self::parts_of(&conn, message_id)
    }

    async fn remove_message(&self, message_id: &str, cancel: &CancellationToken) -> Result<()> {
        check_cancelled(cancel)?;
        self.retry_on_busy(|| {
            let conn = self.conn()?;
            let tx = conn.unchecked_transaction()?;
            let removed = tx.execute("DELETE FROM messages WHERE id = ?1", params![message_id])?;
            if removed == 0 {
                return Err(StoreError::MessageNotFound(message_id.to_owned()));
            }
            let _ = tx.execute("DELETE FROM parts WHERE message_id = ?1", params![message_id])?;
            tx.commit()?;
            Ok(())
        })
    }

    async fn remove_session(&self, session_id: &str, cancel: &CancellationToken) -> Result<()> {
        check_cancelled(cancel)?;
        self.retry_on_busy(|| {
            let conn = self.conn()?;
            let tx = conn.unchecked_transaction()?;
            let _ = tx.execute("DELETE FROM sessions WHERE id = ?1", params![session_id])?;
            let _ = tx.execute(
                "DELETE FROM messages WHERE session_id = ?1",
                params![session_id],
            )?;
            let _ = tx.execute(
                "DELETE FROM parts WHERE session_id = ?1",
                params![session_id],
            )?;
            tx.commit()?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use forge_core::part::{PartContent, SpanState, ToolCallState};
    use serde_json::json;

    fn store() -> SqliteStore {
        SqliteStore::in_memory().unwrap()
    }

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
        let store = store();
        let cancel = CancellationToken::new();
        let mut session = Session::new(Some("app"), None);
        store.save_session(&session, &cancel).await.unwrap();

        session.touch();
        store.save_session(&session, &cancel).await.unwrap();

        let loaded = store.get_session(&session.id, &cancel).await.unwrap().unwrap();
        assert_eq!(loaded.updated_at, session.updated_at);
    }

    #[tokio::test]
    async fn open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("forge.db")).unwrap();
        let cancel = CancellationToken::new();

        let session = Session::new(None, None);
        store.save_session(&session, &cancel).await.unwrap();
        assert!(store.get_session(&session.id, &cancel).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn part_upsert_overwrites_and_keeps_order() {
        let store = store();
        let cancel = CancellationToken::new();
        let message = Message::assistant("ses_1", "m");
        store.save_message(&message, &cancel).await.unwrap();

        let mut a = text_part(&message, "a");
        let b = text_part(&message, "b");
        store.save_part(&a, &cancel).await.unwrap();
        store.save_part(&b, &cancel).await.unwrap();

        a.content = PartContent::Text {
            text: "a-latest".into(),
            state: SpanState::Done,
        };
        store.save_part(&a, &cancel).await.unwrap();

        let parts = store.get_parts(&message.id, &cancel).await.unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].id, a.id);
        assert_matches!(&parts[0].content, PartContent::Text { text, .. } if text == "a-latest");
        assert_eq!(parts[1].id, b.id);
    }

    #[tokio::test]
    async fn tool_call_part_round_trips_through_json_column() {
        let store = store();
        let cancel = CancellationToken::new();
        let message = Message::assistant("ses_1", "m");
        store.save_message(&message, &cancel).await.unwrap();

        let part = Part::new(
            &message,
            PartContent::ToolCall {
                tool_call_id: "tc_1".into(),
                tool_name: "read_file".into(),
                unavailable: false,
                call: ToolCallState::OutputAvailable {
                    input: json!({"path": "a.txt"}),
                    output: json!("contents"),
                },
            },
        );
        store.save_part(&part, &cancel).await.unwrap();

        let parts = store.get_parts(&message.id, &cancel).await.unwrap();
        assert_eq!(parts, vec![part]);
    }

    #[tokio::test]
    async fn ownership_validated_against_stored_message() {
        let store = store();
        let cancel = CancellationToken::new();
        let message = Message::assistant("ses_1", "m");
        store.save_message(&message, &cancel).await.unwrap();

        let mut part = text_part(&message, "x");
        part.session_id = "ses_other".into();

        let err = store.save_part(&part, &cancel).await.unwrap_err();
        assert_matches!(err, StoreError::PartOwnership { .. });
    }

    #[tokio::test]
    async fn atomic_save_rolls_back_on_bad_part() {
        let store = store();
        let cancel = CancellationToken::new();
        let message = Message::assistant("ses_1", "m");
        let good = text_part(&message, "good");
        let mut bad = text_part(&message, "bad");
        bad.message_id = "msg_other".into();

        let err = store
            .save_message_with_parts(&message, &[good, bad], &cancel)
            .await
            .unwrap_err();
        assert_matches!(err, StoreError::PartOwnership { .. });
        assert!(
            store
                .get_messages_with_parts("ses_1", &cancel)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn history_orders_messages_by_insert() {
        let store = store();
        let cancel = CancellationToken::new();
        let user = Message::user("ses_1");
        let assistant = Message::assistant("ses_1", "m");
        store
            .save_message_with_parts(&user, &[text_part(&user, "hi")], &cancel)
            .await
            .unwrap();
        store
            .save_message_with_parts(&assistant, &[text_part(&assistant, "hello")], &cancel)
            .await
            .unwrap();

        let history = store.get_messages_with_parts("ses_1", &cancel).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].message.id, user.id);
        assert_eq!(history[1].message.id, assistant.id);
        assert_eq!(history[1].parts.len(), 1);
    }

    #[tokio::test]
    async fn remove_message_cascades_to_parts() {
        let store = store();
        let cancel = CancellationToken::new();
        let message = Message::user("ses_1");
        store
            .save_message_with_parts(&message, &[text_part(&message, "x")], &cancel)
            .await
            .unwrap();

        store.remove_message(&message.id, &cancel).await.unwrap();
        assert!(store.get_parts(&message.id, &cancel).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn remove_unknown_message_errors() {
        let store = store();
        let cancel = CancellationToken::new();
        let err = store.remove_message("msg_nope", &cancel).await.unwrap_err();
        assert_matches!(err, StoreError::MessageNotFound(_));
    }

    #[tokio::test]
    async fn remove_session_cascades() {
        let store = store();
        let cancel = CancellationToken::new();
        let session = Session::new(None, None);
        store.save_session(&session, &cancel).await.unwrap();
        let message = Message::user(&session.id);
        store
            .save_message_with_parts(&message, &[text_part(&message, "x")], &cancel)
            .await
            .unwrap();

        store.remove_session(&session.id, &cancel).await.unwrap();
        assert!(store.get_session(&session.id, &cancel).await.unwrap().is_none());
        assert!(store.get_parts(&message.id, &cancel).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let store = store();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = store
            .get_messages_with_parts("ses_1", &cancel)
            .await
            .unwrap_err();
        assert_matches!(err, StoreError::Cancelled);
    }
}
