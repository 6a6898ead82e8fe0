use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{ParleyError, Result};
use crate::model::{ChatSession, ChatTurn};

/// SQLite-backed mirror of chat sessions.
///
/// Uses a single `Connection` behind `Arc<Mutex<>>` so it can be shared
/// across async tasks. All blocking SQLite calls go through
/// [`with_conn`](Self::with_conn) which runs them on the Tokio blocking
/// thread-pool.
#[derive(Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl SqliteStorage {
    /// Open (or create) a file-backed SQLite database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ParleyError::Storage(format!("failed to create db dir: {e}")))?;
        }
        let conn = Connection::open(&path)
            .map_err(|e| ParleyError::Storage(format!("failed to open SQLite database: {e}")))?;

        Self::configure_and_init(conn, path)
    }

    /// Open an in-memory SQLite database (useful for tests).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| {
            ParleyError::Storage(format!("failed to open in-memory SQLite database: {e}"))
        })?;

        Self::configure_and_init(conn, PathBuf::from(":memory:"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn configure_and_init(conn: Connection, path: PathBuf) -> Result<Self> {
        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .map_err(|e| ParleyError::Storage(format!("failed to set WAL mode: {e}")))?;

        let storage = Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        };

        storage.create_tables()?;
        Ok(storage)
    }

    /// Create all tables and indexes (idempotent).
    fn create_tables(&self) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| ParleyError::Storage(format!("failed to acquire database lock: {e}")))?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS chat_sessions (
                session_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                client_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                last_activity_at TEXT NOT NULL,
                history TEXT NOT NULL DEFAULT '[]'
            );

            CREATE INDEX IF NOT EXISTS idx_chat_sessions_activity
                ON chat_sessions(last_activity_at);
            ",
        )
        .map_err(|e| ParleyError::Storage(format!("failed to create tables: {e}")))?;

        Ok(())
    }

    /// Run a blocking closure against the SQLite connection on the Tokio
    /// blocking thread-pool.
    pub(crate) async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|e| {
                ParleyError::Storage(format!("failed to acquire database lock: {e}"))
            })?;
            f(&conn)
        })
        .await
        .map_err(|e| ParleyError::Storage(format!("task join error: {e}")))?
    }

    /// Insert or replace the full session row.
    pub async fn save_session(&self, session: &ChatSession) -> Result<()> {
        let history: Vec<&ChatTurn> = session.history.iter().collect();
        let history = serde_json::to_string(&history)?;
        let session_id = session.session_id.clone();
        let user_id = session.user_id.clone();
        let client_id = session.client_id.clone();
        let created_at = session.created_at.to_rfc3339();
        let last_activity_at = session.last_activity_at.to_rfc3339();

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO chat_sessions
                    (session_id, user_id, client_id, created_at, last_activity_at, history)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(session_id) DO UPDATE SET
                    last_activity_at = excluded.last_activity_at,
                    history = excluded.history",
                params![
                    session_id,
                    user_id,
                    client_id,
                    created_at,
                    last_activity_at,
                    history
                ],
            )
            .map_err(|e| ParleyError::Storage(format!("failed to save session: {e}")))?;
            Ok(())
        })
        .await
    }

    pub async fn load_session(&self, session_id: &str) -> Result<Option<ChatSession>> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT session_id, user_id, client_id, created_at, last_activity_at, history
                     FROM chat_sessions WHERE session_id = ?1",
                    params![session_id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, String>(5)?,
                        ))
                    },
                )
                .optional()
                .map_err(|e| ParleyError::Storage(format!("failed to load session: {e}")))?;

            let Some((session_id, user_id, client_id, created_at, last_activity_at, history)) = row
            else {
                return Ok(None);
            };

            let history: VecDeque<ChatTurn> = serde_json::from_str(&history)?;
            Ok(Some(ChatSession {
                session_id,
                user_id,
                client_id,
                created_at: parse_ts(&created_at)?,
                last_activity_at: parse_ts(&last_activity_at)?,
                history,
            }))
        })
        .await
    }

    /// Delete a session row. Missing rows are not an error.
    pub async fn delete_session(&self, session_id: &str) -> Result<bool> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            let n = conn
                .execute(
                    "DELETE FROM chat_sessions WHERE session_id = ?1",
                    params![session_id],
                )
                .map_err(|e| ParleyError::Storage(format!("failed to delete session: {e}")))?;
            Ok(n > 0)
        })
        .await
    }

    /// Delete sessions whose last activity is at or before `cutoff`.
    pub async fn delete_inactive_since(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let cutoff = cutoff.to_rfc3339();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM chat_sessions WHERE last_activity_at <= ?1",
                params![cutoff],
            )
            .map_err(|e| ParleyError::Storage(format!("failed to sweep sessions: {e}")))
        })
        .await
    }

    pub async fn count_sessions(&self) -> Result<usize> {
        self.with_conn(|conn| {
            let n: i64 = conn
                .query_row("SELECT COUNT(*) FROM chat_sessions", [], |row| row.get(0))
                .map_err(|e| ParleyError::Storage(e.to_string()))?;
            Ok(n as usize)
        })
        .await
    }
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ParleyError::Storage(format!("bad timestamp '{s}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn open_in_memory_creates_tables() {
        let storage = SqliteStorage::open_in_memory().expect("should open in-memory DB");
        assert_eq!(storage.path().to_str().unwrap(), ":memory:");

        let conn = storage.conn.lock().unwrap();
        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        assert!(tables.contains(&"chat_sessions".to_string()));
    }

    #[test]
    fn create_tables_is_idempotent() {
        let storage = SqliteStorage::open_in_memory().expect("should open in-memory DB");
        storage.create_tables().expect("idempotent create_tables");
    }

    #[tokio::test]
    async fn save_and_load_session() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let mut session = ChatSession::new("alice", "acme");
        session.push_turn(ChatTurn::user("what's blocking TSK-42?"), 10);
        storage.save_session(&session).await.unwrap();

        let loaded = storage
            .load_session(&session.session_id)
            .await
            .unwrap()
            .expect("session should exist");
        assert_eq!(loaded.user_id, "alice");
        assert_eq!(loaded.client_id, "acme");
        assert_eq!(loaded.history.len(), 1);
        assert_eq!(loaded.history[0].text, "what's blocking TSK-42?");
    }

    #[tokio::test]
    async fn save_does_not_reassign_owner() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let session = ChatSession::new("alice", "acme");
        storage.save_session(&session).await.unwrap();

        let mut hijack = session.clone();
        hijack.user_id = "mallory".into();
        storage.save_session(&hijack).await.unwrap();

        let loaded = storage.load_session(&session.session_id).await.unwrap().unwrap();
        assert_eq!(loaded.user_id, "alice");
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let session = ChatSession::new("alice", "acme");
        storage.save_session(&session).await.unwrap();
        assert!(storage.delete_session(&session.session_id).await.unwrap());
        assert!(!storage.delete_session(&session.session_id).await.unwrap());
        assert!(storage.load_session(&session.session_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_inactive_since_cutoff() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let mut old = ChatSession::new("alice", "acme");
        old.last_activity_at = Utc::now() - Duration::minutes(45);
        let fresh = ChatSession::new("bob", "acme");
        storage.save_session(&old).await.unwrap();
        storage.save_session(&fresh).await.unwrap();

        let removed = storage
            .delete_inactive_since(Utc::now() - Duration::minutes(30))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(storage.count_sessions().await.unwrap(), 1);
    }

    #[test]
    fn open_file_based_db() {
        let dir = std::env::temp_dir().join(format!("parley-test-{}", uuid::Uuid::now_v7()));
        let db_path = dir.join("sessions.db");

        let storage = SqliteStorage::open(&db_path).expect("should open file DB");
        assert_eq!(storage.path(), db_path);

        drop(storage);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
