use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension};

use super::LocalStore;
use crate::error::StoreError;
use crate::types::{RemoteId, Thread};

/// SQLite-backed [`LocalStore`].
///
/// A single connection behind a mutex: the engine calls the store
/// synchronously after every mutation, and writes are small.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens (or creates) the database at `path`, configures WAL mode and
    /// applies schema migrations via the `schema_version` table.
    ///
    /// `busy_timeout` is set through the `Connection` method rather than a
    /// PRAGMA string so it takes effect regardless of pragma caching.
    ///
    /// Missing parent directories are created. Any WAL left behind by a
    /// previous run is checkpointed before migration, so the main file is
    /// current when the schema version is read.
    ///
    /// # Errors
    ///
    /// [`StoreError::Io`] if the parent directory cannot be created, and
    /// [`StoreError::Sqlite`] if the file cannot be opened, the pragmas are
    /// rejected or a migration step fails.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;",
        )?;
        conn.busy_timeout(Duration::from_secs(5))?;
        // Checkpoint any leftover WAL from a previous run.
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        super::schema::migrate(&mut conn)?;
        tracing::debug!(path = %path.display(), "opened local store");
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Private in-memory database, mostly for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let mut conn = Connection::open_in_memory()?;
        super::schema::migrate(&mut conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("sqlite connection mutex poisoned".to_owned()))
    }

    pub fn schema_version(&self) -> Result<i64, StoreError> {
        let conn = self.lock()?;
        Ok(conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| r.get(0))?)
    }
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

impl LocalStore for SqliteStore {
    fn load(&self) -> Result<Vec<Thread>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT payload FROM threads ORDER BY position ASC")?;
        let payloads = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let mut threads = Vec::with_capacity(payloads.len());
        for payload in payloads {
            match serde_json::from_str::<Thread>(&payload) {
                Ok(thread) => threads.push(thread),
                Err(error) => tracing::error!(%error, "skipping unreadable stored thread"),
            }
        }
        Ok(threads)
    }

    fn save(&self, threads: &[Thread]) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        tx.execute("DELETE FROM threads", [])?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO threads (id, route, version, position, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for (position, thread) in threads.iter().enumerate() {
                let payload = serde_json::to_string(thread)?;
                insert.execute(rusqlite::params![
                    thread.id.as_str(),
                    &thread.scope.route,
                    &thread.scope.version,
                    position as i64,
                    payload,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn load_tombstones(&self) -> Result<Vec<RemoteId>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT remote_issue_id FROM tombstones ORDER BY removed_at, remote_issue_id")?;
        let ids = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .map(|row| row.map(RemoteId::new))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    /// Tombstones only grow: ids missing from `ids` are kept.
    fn save_tombstones(&self, ids: &[RemoteId]) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let now = now_secs();
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO tombstones (remote_issue_id, removed_at) VALUES (?1, ?2)
                 ON CONFLICT(remote_issue_id) DO NOTHING",
            )?;
            for id in ids {
                insert.execute(rusqlite::params![id.as_str(), now])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn preference(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.lock()?;
        Ok(conn
            .query_row("SELECT value FROM preferences WHERE key = ?1", [key], |r| r.get(0))
            .optional()?)
    }

    fn set_preference(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO preferences (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            rusqlite::params![key, value],
        )?;
        tx.commit()?;
        Ok(())
    }
}
