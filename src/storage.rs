//! SQLite storage for local state that must survive a restart
//!
//! Holds the durable mirror of the sync queue, the dead-letter list, the server ids
//! of registered sessions, and settings.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::sync::{DeadLetter, SyncQueueItem};
use crate::types::{RemoteSessionId, SessionId};

/// Storage backend using SQLite
pub struct Storage {
    conn: Mutex<Connection>,
}

/// Serialized `VoiceConfig`
pub const SETTING_VOICE_CONFIG: &str = "voice_config";
pub const SETTING_OPENAI_API_KEY: &str = "openai_api_key";
pub const SETTING_BACKEND_URL: &str = "backend_url";
pub const SETTING_BACKEND_API_KEY: &str = "backend_api_key";

impl Storage {
    /// Open or create a database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    /// Open the database in the platform data directory
    pub fn open_default() -> Result<Self> {
        let path = Self::default_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        info!("Opening storage at {}", path.display());
        Self::open(path)
    }

    /// Default database location, e.g. `~/.local/share/liftvoice/liftvoice.db`
    pub fn default_path() -> Result<PathBuf> {
        dirs::data_dir()
            .map(|dir| dir.join("liftvoice").join("liftvoice.db"))
            .ok_or_else(|| Error::Config("no data directory on this platform".to_string()))
    }

    /// Create an in-memory database (useful for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sync_queue (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                session_id TEXT NOT NULL,
                op TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                enqueued_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS dead_letters (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                op TEXT NOT NULL,
                retry_count INTEGER NOT NULL,
                error TEXT NOT NULL,
                failed_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS remote_sessions (
                session_id TEXT PRIMARY KEY,
                remote_id TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_sync_queue_session ON sync_queue(session_id);
            "#,
        )?;

        info!("Database schema initialized");
        Ok(())
    }

    // ========== Sync queue ==========

    /// Append an item to the back of the durable queue
    ///
    /// An item already present is moved to the back with its new retry count.
    pub fn save_sync_item(&self, item: &SyncQueueItem) -> Result<()> {
        let op = serde_json::to_string(&item.op)?;
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT OR REPLACE INTO sync_queue (id, session_id, op, retry_count, enqueued_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                item.id.to_string(),
                item.session_id.to_string(),
                op,
                item.retry_count,
                item.enqueued_at.to_rfc3339(),
            ],
        )?;
        debug!("Persisted sync item {}", item.id);
        Ok(())
    }

    /// Record a failed attempt without moving the item
    pub fn update_retry_count(&self, id: Uuid, retry_count: u32) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE sync_queue SET retry_count = ?2 WHERE id = ?1",
            params![id.to_string(), retry_count],
        )?;
        Ok(rows > 0)
    }

    /// Remove an item from the durable queue
    pub fn remove_sync_item(&self, id: Uuid) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "DELETE FROM sync_queue WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(rows > 0)
    }

    /// Load the queue in enqueue order
    pub fn load_sync_queue(&self) -> Result<Vec<SyncQueueItem>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, session_id, op, retry_count, enqueued_at FROM sync_queue ORDER BY seq",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, u32>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut items = Vec::new();
        for row in rows {
            let (id, session_id, op, retry_count, enqueued_at) = row?;
            items.push(SyncQueueItem {
                id: parse_uuid(&id)?,
                session_id: parse_uuid(&session_id)?,
                op: serde_json::from_str(&op)?,
                retry_count,
                enqueued_at: parse_timestamp(&enqueued_at)?,
            });
        }
        Ok(items)
    }

    /// Number of items in the durable queue
    pub fn sync_queue_len(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM sync_queue", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Record an item that can never be synced
    pub fn save_dead_letter(&self, letter: &DeadLetter) -> Result<()> {
        let op = serde_json::to_string(&letter.item.op)?;
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT OR REPLACE INTO dead_letters (id, session_id, op, retry_count, error, failed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                letter.item.id.to_string(),
                letter.item.session_id.to_string(),
                op,
                letter.item.retry_count,
                letter.error,
                letter.failed_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// All dead letters, oldest first
    pub fn get_dead_letters(&self) -> Result<Vec<DeadLetter>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, session_id, op, retry_count, error, failed_at FROM dead_letters ORDER BY failed_at",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, u32>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut letters = Vec::new();
        for row in rows {
            let (id, session_id, op, retry_count, error, failed_at) = row?;
            let failed_at = parse_timestamp(&failed_at)?;
            letters.push(DeadLetter {
                item: SyncQueueItem {
                    id: parse_uuid(&id)?,
                    session_id: parse_uuid(&session_id)?,
                    op: serde_json::from_str(&op)?,
                    retry_count,
                    enqueued_at: failed_at,
                },
                error,
                failed_at,
            });
        }
        Ok(letters)
    }

    // ========== Remote sessions ==========

    pub fn save_remote_session(&self, session_id: SessionId, remote_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO remote_sessions (session_id, remote_id) VALUES (?1, ?2)",
            params![session_id.to_string(), remote_id],
        )?;
        Ok(())
    }

    /// Server ids of every session registered so far
    pub fn load_remote_sessions(&self) -> Result<HashMap<SessionId, RemoteSessionId>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT session_id, remote_id FROM remote_sessions")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut sessions = HashMap::new();
        for row in rows {
            let (session_id, remote_id) = row?;
            sessions.insert(parse_uuid(&session_id)?, remote_id);
        }
        Ok(sessions)
    }

    /// Forget sessions that no longer have anything queued
    pub fn prune_remote_sessions(&self, keep: &[SessionId]) -> Result<usize> {
        let conn = self.conn.lock();
        let keep: Vec<String> = keep.iter().map(Uuid::to_string).collect();
        let mut removed = 0;
        let mut stmt = conn.prepare("SELECT session_id FROM remote_sessions")?;
        let ids: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<_, _>>()?;
        for id in ids.iter().filter(|id| !keep.contains(*id)) {
            removed += conn.execute(
                "DELETE FROM remote_sessions WHERE session_id = ?1",
                params![id],
            )?;
        }
        Ok(removed)
    }

    // ========== Settings ==========

    /// Save or update a setting value
    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO settings (key, value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
            params![key, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Get a setting value
    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let value = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Delete a setting
    pub fn delete_setting(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM settings WHERE key = ?1", params![key])?;
        Ok(())
    }
}

fn parse_uuid(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| Error::Config(format!("corrupt id '{value}': {e}")))
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Config(format!("corrupt timestamp '{value}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::SyncOp;
    use crate::types::{SessionMetadata, SessionType};

    fn item(op: SyncOp) -> SyncQueueItem {
        SyncQueueItem::new(Uuid::new_v4(), op)
    }

    fn register() -> SyncOp {
        SyncOp::RegisterSession {
            session_type: SessionType::Free,
            metadata: SessionMetadata::for_user("u1"),
        }
    }

    #[test]
    fn test_queue_preserves_order() {
        let storage = Storage::in_memory().unwrap();
        let a = item(register());
        let b = item(SyncOp::RevertLastSet {
            workout_id: "w1".to_string(),
        });
        storage.save_sync_item(&a).unwrap();
        storage.save_sync_item(&b).unwrap();

        let loaded = storage.load_sync_queue().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, a.id);
        assert_eq!(loaded[1].id, b.id);
        assert_eq!(loaded[1].op, b.op);
    }

    #[test]
    fn test_requeue_moves_to_back() {
        let storage = Storage::in_memory().unwrap();
        let mut a = item(register());
        let b = item(register());
        storage.save_sync_item(&a).unwrap();
        storage.save_sync_item(&b).unwrap();

        a.retry_count = 1;
        storage.save_sync_item(&a).unwrap();

        let loaded = storage.load_sync_queue().unwrap();
        assert_eq!(loaded[0].id, b.id);
        assert_eq!(loaded[1].id, a.id);
        assert_eq!(loaded[1].retry_count, 1);
        assert_eq!(storage.sync_queue_len().unwrap(), 2);
    }

    #[test]
    fn test_update_retry_count_keeps_position() {
        let storage = Storage::in_memory().unwrap();
        let a = item(register());
        let b = item(register());
        storage.save_sync_item(&a).unwrap();
        storage.save_sync_item(&b).unwrap();

        assert!(storage.update_retry_count(a.id, 2).unwrap());
        assert!(!storage.update_retry_count(Uuid::new_v4(), 1).unwrap());

        let loaded = storage.load_sync_queue().unwrap();
        assert_eq!(loaded[0].id, a.id);
        assert_eq!(loaded[0].retry_count, 2);
        assert_eq!(loaded[1].id, b.id);
    }

    #[test]
    fn test_remove_sync_item() {
        let storage = Storage::in_memory().unwrap();
        let a = item(register());
        storage.save_sync_item(&a).unwrap();
        assert!(storage.remove_sync_item(a.id).unwrap());
        assert!(!storage.remove_sync_item(a.id).unwrap());
        assert_eq!(storage.sync_queue_len().unwrap(), 0);
    }

    #[test]
    fn test_settings() {
        let storage = Storage::in_memory().unwrap();
        assert_eq!(storage.get_setting("missing").unwrap(), None);
        storage.set_setting(SETTING_BACKEND_URL, "https://a").unwrap();
        storage.set_setting(SETTING_BACKEND_URL, "https://b").unwrap();
        assert_eq!(
            storage.get_setting(SETTING_BACKEND_URL).unwrap().as_deref(),
            Some("https://b")
        );
        storage.delete_setting(SETTING_BACKEND_URL).unwrap();
        assert_eq!(storage.get_setting(SETTING_BACKEND_URL).unwrap(), None);
    }

    #[test]
    fn test_remote_sessions() {
        let storage = Storage::in_memory().unwrap();
        let kept = Uuid::new_v4();
        let dropped = Uuid::new_v4();
        storage.save_remote_session(kept, "r1").unwrap();
        storage.save_remote_session(dropped, "r2").unwrap();

        assert_eq!(storage.prune_remote_sessions(&[kept]).unwrap(), 1);
        let sessions = storage.load_remote_sessions().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions.get(&kept).map(String::as_str), Some("r1"));
    }

    #[test]
    fn test_dead_letters() {
        let storage = Storage::in_memory().unwrap();
        let letter = DeadLetter {
            item: item(register()),
            error: "rejected".to_string(),
            failed_at: Utc::now(),
        };
        storage.save_dead_letter(&letter).unwrap();
        let letters = storage.get_dead_letters().unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].error, "rejected");
        assert_eq!(letters[0].item.id, letter.item.id);
    }
}
