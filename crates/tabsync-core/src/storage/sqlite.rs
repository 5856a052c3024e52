//! SQLite-backed persistent store adapter
//!
//! One database file holds every document, partitioned by `doc_key`. All
//! writes run inside transactions so a crash mid-flush can never expose a
//! half-applied batch to a later loader.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;
use uuid::Uuid;

use super::error::{StorageError, StorageResult};
use super::schema::{init_schema, needs_init};
use super::{PersistedDocument, StorageAdapter};
use crate::records::{ChangeEntry, Record, RecordId, Snapshot};
use crate::session::{SessionId, SessionInfo};

/// Persistent store adapter over a local SQLite database.
pub struct SqliteAdapter {
    conn: Mutex<Connection>,
}

impl SqliteAdapter {
    /// Open or create the database at `path`.
    ///
    /// Any failure to open is reported as `Unavailable`; callers are expected
    /// to fall back to in-memory-only operation.
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Unavailable {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        }

        let conn = Connection::open(path).map_err(|e| StorageError::Unavailable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        Self::init(conn, path.to_path_buf())
    }

    /// Open an in-memory database (for testing and ephemeral documents).
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory().map_err(|e| StorageError::Unavailable {
            path: PathBuf::from(":memory:"),
            reason: e.to_string(),
        })?;
        Self::init(conn, PathBuf::from(":memory:"))
    }

    fn init(conn: Connection, path: PathBuf) -> StorageResult<Self> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        if needs_init(&conn) {
            init_schema(&conn)?;
        }
        debug!(?path, "opened persistence database");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run a closure against the raw connection (test hook).
    #[cfg(test)]
    pub(crate) fn with_connection<R>(&self, f: impl FnOnce(&Connection) -> R) -> R {
        f(&self.conn.lock())
    }
}

impl StorageAdapter for SqliteAdapter {
    fn load(&self, key: &str) -> StorageResult<PersistedDocument> {
        let conn = self.conn.lock();

        let snapshot = conn
            .query_row(
                "SELECT schema_version, records FROM snapshots WHERE doc_key = ?1",
                params![key],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                    ))
                },
            )
            .optional()?
            .map(|(schema_version, records_json)| {
                let records: HashMap<RecordId, Record> = serde_json::from_str(&records_json)?;
                Ok::<_, StorageError>(Snapshot::new(schema_version as u32, records))
            })
            .transpose()?;

        let mut stmt =
            conn.prepare("SELECT entry FROM changes WHERE doc_key = ?1 ORDER BY seq ASC")?;
        let rows = stmt.query_map(params![key], |row| row.get::<_, String>(0))?;

        let mut changes = Vec::new();
        for row in rows {
            let entry: ChangeEntry = serde_json::from_str(&row?)?;
            changes.push(entry);
        }

        Ok(PersistedDocument { snapshot, changes })
    }

    fn write_changes(&self, key: &str, batch: &[ChangeEntry]) -> StorageResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let next_seq: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM changes WHERE doc_key = ?1",
            params![key],
            |row| row.get(0),
        )?;

        for (offset, entry) in batch.iter().enumerate() {
            let encoded = serde_json::to_string(entry)?;
            tx.execute(
                "INSERT INTO changes (doc_key, seq, record_id, entry) VALUES (?1, ?2, ?3, ?4)",
                params![key, next_seq + offset as i64, entry.record_id().as_str(), encoded],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    fn write_snapshot(&self, key: &str, snapshot: &Snapshot) -> StorageResult<()> {
        let records_json = serde_json::to_string(&snapshot.records)?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT OR REPLACE INTO snapshots (doc_key, schema_version, records, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                key,
                snapshot.schema_version as i64,
                records_json,
                Utc::now().to_rfc3339()
            ],
        )?;

        // Adds and updates are folded into the snapshot, but delete
        // tombstones must outlive it: a sibling that reconciles after
        // compaction sees only "record absent", which the merge leaves
        // untouched, so without the tombstone the delete never reaches it.
        tx.execute(
            "DELETE FROM changes
             WHERE doc_key = ?1 AND json_extract(entry, '$.kind') != 'removed'",
            params![key],
        )?;
        // A tombstone for a record the snapshot carries again would replay
        // on top of it and wrongly delete the re-added record.
        {
            let mut stmt = tx.prepare(
                "DELETE FROM changes
                 WHERE doc_key = ?1 AND record_id = ?2
                   AND json_extract(entry, '$.kind') = 'removed'",
            )?;
            for id in snapshot.records.keys() {
                stmt.execute(params![key, id.as_str()])?;
            }
        }

        tx.commit()?;
        debug!(key, records = snapshot.records.len(), "wrote compacted snapshot");
        Ok(())
    }

    fn clear(&self, key: &str) -> StorageResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM snapshots WHERE doc_key = ?1", params![key])?;
        tx.execute("DELETE FROM changes WHERE doc_key = ?1", params![key])?;
        tx.execute("DELETE FROM sessions WHERE doc_key = ?1", params![key])?;
        tx.commit()?;
        Ok(())
    }

    fn change_log_bytes(&self, key: &str) -> StorageResult<u64> {
        let conn = self.conn.lock();
        let bytes: i64 = conn.query_row(
            "SELECT COALESCE(SUM(LENGTH(entry)), 0) FROM changes WHERE doc_key = ?1",
            params![key],
            |row| row.get(0),
        )?;
        Ok(bytes as u64)
    }

    fn put_session(&self, key: &str, session: &SessionInfo) -> StorageResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO sessions (doc_key, session_id, user_id, registered_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                key,
                session.session_id.to_string(),
                session.user_id,
                session.registered_at.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    fn remove_session(&self, key: &str, session_id: SessionId) -> StorageResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM sessions WHERE doc_key = ?1 AND session_id = ?2",
            params![key, session_id.to_string()],
        )?;
        Ok(())
    }

    fn list_sessions(&self, key: &str) -> StorageResult<Vec<SessionInfo>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT session_id, user_id, registered_at FROM sessions
             WHERE doc_key = ?1 ORDER BY registered_at ASC",
        )?;
        let rows = stmt.query_map(params![key], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut sessions = Vec::new();
        for row in rows {
            let (session_id, user_id, registered_at) = row?;
            let session_id = Uuid::parse_str(&session_id).map_err(|e| StorageError::Corrupt {
                details: format!("invalid session id '{}': {}", session_id, e),
            })?;
            let registered_at = DateTime::parse_from_rfc3339(&registered_at)
                .map_err(|e| StorageError::Corrupt {
                    details: format!("invalid session timestamp '{}': {}", registered_at, e),
                })?
                .with_timezone(&Utc);
            sessions.push(SessionInfo {
                session_id,
                user_id,
                registered_at,
            });
        }

        Ok(sessions)
    }
}
