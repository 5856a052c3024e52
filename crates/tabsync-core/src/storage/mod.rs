//! Persistent store adapter
//!
//! Wraps a durable local key-value database behind a narrow, transactional
//! contract. All sessions for a persistence key share the same partitions;
//! concurrent writers are serialized by the database's own transaction
//! discipline, never by in-process locks across sessions.

pub mod error;
pub mod schema;
pub mod sqlite;

pub use error::{StorageError, StorageResult};
pub use sqlite::SqliteAdapter;

use crate::records::{ChangeEntry, Snapshot};
use crate::session::{SessionId, SessionInfo};

/// What a loader sees for one persistence key: the latest snapshot (if any)
/// plus every change entry recorded after it, in commit order.
#[derive(Debug, Clone, Default)]
pub struct PersistedDocument {
    pub snapshot: Option<Snapshot>,
    pub changes: Vec<ChangeEntry>,
}

impl PersistedDocument {
    /// True when nothing has ever been persisted for the key.
    pub fn is_empty(&self) -> bool {
        self.snapshot.is_none() && self.changes.is_empty()
    }
}

/// Transactional storage contract shared by all sessions of a persistence key.
///
/// Writes are durable once they return `Ok`. `write_changes` is atomic per
/// batch: a crash mid-flush never leaves a partially-applied batch visible to
/// a subsequent `load`.
pub trait StorageAdapter: Send + Sync {
    /// Read the latest snapshot and subsequent change log for `key`.
    fn load(&self, key: &str) -> StorageResult<PersistedDocument>;

    /// Append a batch of change entries, all-or-nothing.
    fn write_changes(&self, key: &str, batch: &[ChangeEntry]) -> StorageResult<()>;

    /// Replace the compacted base state and clear superseded change entries
    /// in the same transaction. Delete tombstones for records absent from
    /// `snapshot` are retained so siblings that reconcile after compaction
    /// still observe the removal.
    fn write_snapshot(&self, key: &str, snapshot: &Snapshot) -> StorageResult<()>;

    /// Delete every partition for `key` (hard reset / sign-out).
    fn clear(&self, key: &str) -> StorageResult<()>;

    /// Current byte size of the change log for `key`, used to trigger
    /// compaction.
    fn change_log_bytes(&self, key: &str) -> StorageResult<u64>;

    /// Upsert a session into the advisory registry partition.
    fn put_session(&self, key: &str, session: &SessionInfo) -> StorageResult<()>;

    /// Remove a session from the registry partition.
    fn remove_session(&self, key: &str, session_id: SessionId) -> StorageResult<()>;

    /// List registered sessions for `key`, oldest first.
    fn list_sessions(&self, key: &str) -> StorageResult<Vec<SessionInfo>>;
}
