use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::task;

use crate::models::{
    trim_to_millis, Conversation, ConversationUpdate, Message, MessageExtras, MessageIdentity,
    MessageStatus, MessageUpdate, Role,
};

const CONVERSATION_COLUMNS: &str = "id, title, description, is_starred, is_system_generated, system_purpose, is_unread, created_at, updated_at";
const MESSAGE_COLUMNS: &str =
    "id, optimistic, conversation_id, role, content, status, created_at, updated_at, extras";

/// Result of an insert-or-update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted,
    Updated,
    /// An identical record was already stored; nothing was written.
    Unchanged,
}

impl PutOutcome {
    pub fn is_write(&self) -> bool {
        !matches!(self, PutOutcome::Unchanged)
    }
}

#[derive(Debug, Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create data directory: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;

        Ok(db)
    }

    /// Create an in-memory database (used for testing)
    pub fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Raw SQL against the connection, for installing failure triggers.
    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn.lock().execute_batch(sql)?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER NOT NULL
            );",
        )?;

        let version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if version < 1 {
            conn.execute_batch(
                "CREATE TABLE conversations (
                    id TEXT PRIMARY KEY,
                    title TEXT NOT NULL,
                    description TEXT,
                    is_starred INTEGER NOT NULL DEFAULT 0,
                    is_system_generated INTEGER NOT NULL DEFAULT 0,
                    system_purpose TEXT,
                    is_unread INTEGER NOT NULL DEFAULT 0,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL
                );

                CREATE TABLE messages (
                    id TEXT PRIMARY KEY,
                    optimistic INTEGER NOT NULL DEFAULT 0,
                    conversation_id TEXT NOT NULL,
                    role TEXT NOT NULL,
                    content TEXT NOT NULL,
                    status TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL,
                    extras TEXT
                );

                CREATE INDEX idx_conversations_updated ON conversations(updated_at DESC);
                CREATE INDEX idx_messages_conversation ON messages(conversation_id, created_at);
                CREATE INDEX idx_messages_created ON messages(created_at);

                INSERT INTO schema_version (version) VALUES (1);",
            )?;
        }

        if version < 2 {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS settings (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                );

                UPDATE schema_version SET version = 2;",
            )?;
        }

        Ok(())
    }

    // --- Conversations ---

    pub async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        let conn = self.conn.clone();
        let id = id.to_string();
        task::spawn_blocking(move || {
            let conn = conn.lock();
            select_conversation(&conn, &id)
        })
        .await?
    }

    pub async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        let conn = self.conn.clone();
        task::spawn_blocking(move || {
            let conn = conn.lock();
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM conversations ORDER BY updated_at DESC, id ASC",
                CONVERSATION_COLUMNS
            ))?;
            let conversations = stmt
                .query_map([], |row| Ok(row_to_conversation(row)))?
                .collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .collect::<Result<Vec<_>, _>>()?;
            Ok(conversations)
        })
        .await?
    }

    pub async fn upsert_conversation(&self, conversation: &Conversation) -> Result<PutOutcome> {
        let conn = self.conn.clone();
        let conv = conversation.clone().normalized();
        task::spawn_blocking(move || {
            let conn = conn.lock();
            let outcome = match select_conversation(&conn, &conv.id)? {
                Some(existing) if existing == conv => PutOutcome::Unchanged,
                Some(_) => PutOutcome::Updated,
                None => PutOutcome::Inserted,
            };
            if outcome.is_write() {
                write_conversation(&conn, &conv)?;
            }
            Ok(outcome)
        })
        .await?
    }

    /// Merge `update` into the stored conversation and bump `updated_at`.
    /// Returns `None` when no conversation has this id.
    pub async fn update_conversation(
        &self,
        id: &str,
        update: ConversationUpdate,
    ) -> Result<Option<Conversation>> {
        let conn = self.conn.clone();
        let id = id.to_string();
        task::spawn_blocking(move || {
            let conn = conn.lock();
            let Some(mut conv) = select_conversation(&conn, &id)? else {
                return Ok(None);
            };
            update.apply_to(&mut conv);
            conv.updated_at = bumped(conv.updated_at);
            write_conversation(&conn, &conv)?;
            Ok(Some(conv))
        })
        .await?
    }

    /// Remove conversations and every message referencing them in one
    /// transaction. Returns the ids that actually existed.
    pub async fn delete_conversations(&self, ids: &[String]) -> Result<Vec<String>> {
        let conn = self.conn.clone();
        let ids = ids.to_vec();
        task::spawn_blocking(move || {
            let mut conn = conn.lock();
            let tx = conn.transaction()?;
            let mut removed = Vec::new();
            for id in &ids {
                tx.execute(
                    "DELETE FROM messages WHERE conversation_id = ?1",
                    params![id],
                )?;
                let rows = tx.execute("DELETE FROM conversations WHERE id = ?1", params![id])?;
                if rows > 0 {
                    removed.push(id.clone());
                }
            }
            tx.commit()?;
            Ok(removed)
        })
        .await?
    }

    // --- Messages ---

    pub async fn get_message(&self, id: &str) -> Result<Option<Message>> {
        let conn = self.conn.clone();
        let id = id.to_string();
        task::spawn_blocking(move || {
            let conn = conn.lock();
            select_message(&conn, &id)
        })
        .await?
    }

    pub async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let conn = self.conn.clone();
        let conversation_id = conversation_id.to_string();
        task::spawn_blocking(move || {
            let conn = conn.lock();
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM messages WHERE conversation_id = ?1 ORDER BY created_at ASC, id ASC",
                MESSAGE_COLUMNS
            ))?;
            let messages = stmt
                .query_map(params![conversation_id], |row| Ok(row_to_message(row)))?
                .collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .collect::<Result<Vec<_>, _>>()?;
            Ok(messages)
        })
        .await?
    }

    pub async fn count_messages(&self, conversation_id: &str) -> Result<usize> {
        let conn = self.conn.clone();
        let conversation_id = conversation_id.to_string();
        task::spawn_blocking(move || {
            let conn = conn.lock();
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1",
                params![conversation_id],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
        .await?
    }

    pub async fn upsert_message(&self, message: &Message) -> Result<PutOutcome> {
        let conn = self.conn.clone();
        let msg = message.clone().normalized();
        task::spawn_blocking(move || {
            let conn = conn.lock();
            let outcome = message_outcome(&conn, &msg)?;
            if outcome.is_write() {
                write_message(&conn, &msg)?;
            }
            Ok(outcome)
        })
        .await?
    }

    /// Write a batch in one transaction. Returns the records that were
    /// inserted or changed, with their outcome.
    pub async fn upsert_messages(&self, messages: &[Message]) -> Result<Vec<(PutOutcome, Message)>> {
        let conn = self.conn.clone();
        let messages: Vec<Message> = messages.iter().cloned().map(Message::normalized).collect();
        task::spawn_blocking(move || {
            let mut conn = conn.lock();
            let tx = conn.transaction()?;
            let mut written = Vec::new();
            for msg in messages {
                let outcome = message_outcome(&tx, &msg)?;
                if outcome.is_write() {
                    write_message(&tx, &msg)?;
                    written.push((outcome, msg));
                }
            }
            tx.commit()?;
            Ok(written)
        })
        .await?
    }

    /// Delete `temp_id` and store `replacement` in a single transaction.
    /// Returns `false` (and writes nothing) when `temp_id` does not exist.
    pub async fn replace_message(&self, temp_id: &str, replacement: &Message) -> Result<bool> {
        let conn = self.conn.clone();
        let temp_id = temp_id.to_string();
        let replacement = replacement.clone().normalized();
        task::spawn_blocking(move || {
            let mut conn = conn.lock();
            let tx = conn.transaction()?;
            let exists: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM messages WHERE id = ?1",
                    params![temp_id],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Ok(false);
            }
            tx.execute("DELETE FROM messages WHERE id = ?1", params![temp_id])?;
            write_message(&tx, &replacement)?;
            tx.commit()?;
            Ok(true)
        })
        .await?
    }

    /// Merge `update` into the stored message and bump `updated_at`.
    /// Returns `None` when no message has this id.
    pub async fn update_message(&self, id: &str, update: MessageUpdate) -> Result<Option<Message>> {
        let conn = self.conn.clone();
        let id = id.to_string();
        task::spawn_blocking(move || {
            let conn = conn.lock();
            let Some(mut msg) = select_message(&conn, &id)? else {
                return Ok(None);
            };
            update.apply_to(&mut msg);
            msg.updated_at = bumped(msg.updated_at);
            write_message(&conn, &msg)?;
            Ok(Some(msg))
        })
        .await?
    }

    /// Returns the deleted message, or `None` if it did not exist.
    pub async fn delete_message(&self, id: &str) -> Result<Option<Message>> {
        let conn = self.conn.clone();
        let id = id.to_string();
        task::spawn_blocking(move || {
            let conn = conn.lock();
            let Some(msg) = select_message(&conn, &id)? else {
                return Ok(None);
            };
            conn.execute("DELETE FROM messages WHERE id = ?1", params![id])?;
            Ok(Some(msg))
        })
        .await?
    }

    // --- Settings ---

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.clone();
        let key = key.to_string();
        task::spawn_blocking(move || {
            let conn = conn.lock();
            let result: Option<String> = conn
                .query_row(
                    "SELECT value FROM settings WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(result)
        })
        .await?
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.clone();
        let key = key.to_string();
        let value = value.to_string();
        task::spawn_blocking(move || {
            let conn = conn.lock();
            conn.execute(
                "INSERT INTO settings (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = ?2",
                params![key, value],
            )?;
            Ok(())
        })
        .await?
    }
}

// --- Row helpers ---

/// Next `updated_at` for an edit: now, but strictly after the previous value.
fn bumped(previous: DateTime<Utc>) -> DateTime<Utc> {
    let now = trim_to_millis(Utc::now());
    now.max(previous + Duration::milliseconds(1))
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| anyhow::anyhow!("Invalid timestamp: {}", ms))
}

fn select_conversation(conn: &Connection, id: &str) -> Result<Option<Conversation>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM conversations WHERE id = ?1",
        CONVERSATION_COLUMNS
    ))?;
    let result = stmt
        .query_row(params![id], |row| Ok(row_to_conversation(row)))
        .optional()?;
    result.transpose()
}

fn write_conversation(conn: &Connection, conv: &Conversation) -> Result<()> {
    conn.execute(
        "INSERT INTO conversations (id, title, description, is_starred, is_system_generated, system_purpose, is_unread, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(id) DO UPDATE SET
            title = ?2, description = ?3, is_starred = ?4, is_system_generated = ?5,
            system_purpose = ?6, is_unread = ?7, created_at = ?8, updated_at = ?9",
        params![
            conv.id,
            conv.title,
            conv.description,
            conv.is_starred as i32,
            conv.is_system_generated as i32,
            conv.system_purpose,
            conv.is_unread as i32,
            conv.created_at.timestamp_millis(),
            conv.updated_at.timestamp_millis(),
        ],
    )?;
    Ok(())
}

fn select_message(conn: &Connection, id: &str) -> Result<Option<Message>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM messages WHERE id = ?1",
        MESSAGE_COLUMNS
    ))?;
    let result = stmt
        .query_row(params![id], |row| Ok(row_to_message(row)))
        .optional()?;
    result.transpose()
}

fn message_outcome(conn: &Connection, msg: &Message) -> Result<PutOutcome> {
    Ok(match select_message(conn, msg.id())? {
        Some(existing) if &existing == msg => PutOutcome::Unchanged,
        Some(_) => PutOutcome::Updated,
        None => PutOutcome::Inserted,
    })
}

fn write_message(conn: &Connection, msg: &Message) -> Result<()> {
    let extras = if msg.extras.is_empty() {
        None
    } else {
        Some(serde_json::to_string(&msg.extras).context("Failed to encode message extras")?)
    };
    conn.execute(
        "INSERT INTO messages (id, optimistic, conversation_id, role, content, status, created_at, updated_at, extras)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(id) DO UPDATE SET
            optimistic = ?2, conversation_id = ?3, role = ?4, content = ?5,
            status = ?6, created_at = ?7, updated_at = ?8, extras = ?9",
        params![
            msg.id(),
            msg.is_optimistic() as i32,
            msg.conversation_id,
            msg.role.as_str(),
            msg.content,
            msg.status.as_str(),
            msg.created_at.timestamp_millis(),
            msg.updated_at.timestamp_millis(),
            extras,
        ],
    )?;
    Ok(())
}

fn row_to_conversation(row: &rusqlite::Row) -> Result<Conversation> {
    let is_starred: i32 = row.get(3)?;
    let is_system_generated: i32 = row.get(4)?;
    let is_unread: i32 = row.get(6)?;

    Ok(Conversation {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        is_starred: is_starred != 0,
        is_system_generated: is_system_generated != 0,
        system_purpose: row.get(5)?,
        is_unread: is_unread != 0,
        created_at: from_millis(row.get(7)?)?,
        updated_at: from_millis(row.get(8)?)?,
    })
}

fn row_to_message(row: &rusqlite::Row) -> Result<Message> {
    let id: String = row.get(0)?;
    let optimistic: i32 = row.get(1)?;
    let role_str: String = row.get(3)?;
    let status_str: String = row.get(5)?;
    let extras_json: Option<String> = row.get(8)?;

    let extras = match extras_json {
        Some(json) => serde_json::from_str::<MessageExtras>(&json)
            .with_context(|| format!("Corrupt extras for message {}", id))?,
        None => MessageExtras::default(),
    };

    Ok(Message {
        identity: if optimistic != 0 {
            MessageIdentity::Pending(id)
        } else {
            MessageIdentity::Confirmed(id)
        },
        conversation_id: row.get(2)?,
        role: Role::from_str(&role_str)
            .ok_or_else(|| anyhow::anyhow!("Unknown role: {}", role_str))?,
        content: row.get(4)?,
        status: MessageStatus::from_str(&status_str)
            .ok_or_else(|| anyhow::anyhow!("Unknown status: {}", status_str))?,
        created_at: from_millis(row.get(6)?)?,
        updated_at: from_millis(row.get(7)?)?,
        extras,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn message_at(id: &str, conv: &str, minutes_ago: i64) -> Message {
        let mut msg = Message::confirmed(id, conv, Role::User, format!("body of {}", id));
        msg.created_at = trim_to_millis(Utc::now() - Duration::minutes(minutes_ago));
        msg.updated_at = msg.created_at;
        msg
    }

    #[tokio::test]
    async fn test_schema_initialization() {
        let db = Database::new_in_memory().unwrap();
        assert!(db.list_conversations().await.unwrap().is_empty());
        assert!(db.get_setting("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_conversation_upsert_outcomes() {
        let db = Database::new_in_memory().unwrap();
        let mut conv = Conversation::new("c1", "First");

        assert_eq!(db.upsert_conversation(&conv).await.unwrap(), PutOutcome::Inserted);
        assert_eq!(db.upsert_conversation(&conv).await.unwrap(), PutOutcome::Unchanged);

        conv.title = "Renamed".to_string();
        assert_eq!(db.upsert_conversation(&conv).await.unwrap(), PutOutcome::Updated);

        let fetched = db.get_conversation("c1").await.unwrap().unwrap();
        assert_eq!(fetched.title, "Renamed");
    }

    #[tokio::test]
    async fn test_conversations_ordered_by_updated_desc() {
        let db = Database::new_in_memory().unwrap();
        for (id, minutes_ago) in [("old", 30), ("new", 1), ("mid", 10)] {
            let mut conv = Conversation::new(id, id);
            conv.created_at = trim_to_millis(Utc::now() - Duration::hours(1));
            conv.updated_at = trim_to_millis(Utc::now() - Duration::minutes(minutes_ago));
            db.upsert_conversation(&conv).await.unwrap();
        }
        let ids: Vec<String> = db
            .list_conversations()
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec!["new", "mid", "old"]);
    }

    #[tokio::test]
    async fn test_messages_sorted_by_created_at_regardless_of_insert_order() {
        let db = Database::new_in_memory().unwrap();
        db.upsert_message(&message_at("m3", "c1", 1)).await.unwrap();
        db.upsert_message(&message_at("m1", "c1", 30)).await.unwrap();
        db.upsert_message(&message_at("m2", "c1", 10)).await.unwrap();
        db.upsert_message(&message_at("other", "c2", 20)).await.unwrap();

        let ids: Vec<String> = db
            .list_messages("c1")
            .await
            .unwrap()
            .iter()
            .map(|m| m.id().to_string())
            .collect();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);
        assert_eq!(db.count_messages("c1").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_message_round_trip_keeps_identity_and_extras() {
        let db = Database::new_in_memory().unwrap();
        let mut msg = Message::pending("tmp-1", "c1", Role::User, "hello");
        msg.extras.attachments = vec![serde_json::json!({"name": "photo.png"})];
        msg.extras.reply_to = Some("m0".to_string());
        db.upsert_message(&msg).await.unwrap();

        let fetched = db.get_message("tmp-1").await.unwrap().unwrap();
        assert_eq!(fetched, msg);
        assert!(fetched.is_optimistic());
    }

    #[tokio::test]
    async fn test_replace_message_swaps_identity() {
        let db = Database::new_in_memory().unwrap();
        let pending = Message::pending("tmp-1", "c1", Role::User, "hello");
        db.upsert_message(&pending).await.unwrap();

        let mut confirmed = pending.clone();
        confirmed.identity = MessageIdentity::Confirmed("srv-42".to_string());
        confirmed.status = MessageStatus::Sent;

        assert!(db.replace_message("tmp-1", &confirmed).await.unwrap());
        assert!(db.get_message("tmp-1").await.unwrap().is_none());
        assert_eq!(db.get_message("srv-42").await.unwrap().unwrap(), confirmed);

        // Temporary id already gone: nothing written.
        let mut other = confirmed.clone();
        other.identity = MessageIdentity::Confirmed("srv-99".to_string());
        assert!(!db.replace_message("tmp-1", &other).await.unwrap());
        assert!(db.get_message("srv-99").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_message_bumps_updated_at() {
        let db = Database::new_in_memory().unwrap();
        let msg = message_at("m1", "c1", 5);
        db.upsert_message(&msg).await.unwrap();

        let updated = db
            .update_message("m1", MessageUpdate::content("edited"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.content, "edited");
        assert!(updated.updated_at > msg.updated_at);
        assert_eq!(updated.created_at, msg.created_at);

        assert!(db
            .update_message("missing", MessageUpdate::content("x"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_delete_conversations_removes_messages() {
        let db = Database::new_in_memory().unwrap();
        db.upsert_conversation(&Conversation::new("c1", "One")).await.unwrap();
        db.upsert_conversation(&Conversation::new("c2", "Two")).await.unwrap();
        db.upsert_message(&message_at("m1", "c1", 2)).await.unwrap();
        db.upsert_message(&message_at("m2", "c2", 2)).await.unwrap();

        let removed = db
            .delete_conversations(&["c1".to_string(), "ghost".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, vec!["c1".to_string()]);
        assert!(db.get_conversation("c1").await.unwrap().is_none());
        assert!(db.list_messages("c1").await.unwrap().is_empty());
        assert_eq!(db.list_messages("c2").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_bulk_upsert_reports_only_changes() {
        let db = Database::new_in_memory().unwrap();
        let a = message_at("a", "c1", 3);
        let b = message_at("b", "c1", 2);
        db.upsert_message(&a).await.unwrap();

        let written = db.upsert_messages(&[a.clone(), b.clone()]).await.unwrap();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].0, PutOutcome::Inserted);
        assert_eq!(written[0].1.id(), "b");
    }

    #[tokio::test]
    async fn test_reopen_persists_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("echo-sync.db");
        {
            let db = Database::open(&path).unwrap();
            db.upsert_conversation(&Conversation::new("c1", "Kept")).await.unwrap();
            db.set_setting("k", "v").await.unwrap();
        }
        let db = Database::open(&path).unwrap();
        assert_eq!(db.get_conversation("c1").await.unwrap().unwrap().title, "Kept");
        assert_eq!(db.get_setting("k").await.unwrap().as_deref(), Some("v"));
    }
}
