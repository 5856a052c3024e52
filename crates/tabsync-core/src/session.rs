//! Session/user metadata registry
//!
//! Tracks which sessions (tabs/processes) are attached to a persistence key.
//! The registry is advisory: it backs presence UI, not correctness. A session
//! that crashes without its closing broadcast leaves a stale row behind,
//! which is tolerated rather than expired by heartbeat.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::storage::{StorageAdapter, StorageResult};

/// Unique id for one attached client instance.
pub type SessionId = Uuid;

/// Identifier handed to [`SessionRegistry::subscribe`], used to unsubscribe.
pub type RegistryListenerId = u64;

/// One attached session for a persistence key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub user_id: String,
    pub registered_at: DateTime<Utc>,
}

type MembershipListener = Arc<dyn Fn(&[SessionInfo]) + Send + Sync>;

/// Registry of active sessions, scoped to one persistence key.
///
/// Membership is persisted through the storage adapter's sessions partition
/// so a reloading tab can see who else was recently active. Observers are
/// notified on every membership change seen by this process.
pub struct SessionRegistry {
    adapter: Arc<dyn StorageAdapter>,
    key: String,
    listeners: Mutex<Vec<(RegistryListenerId, MembershipListener)>>,
    next_listener_id: AtomicU64,
}

impl SessionRegistry {
    /// Create a registry view over the sessions partition for `key`.
    pub fn new(adapter: Arc<dyn StorageAdapter>, key: impl Into<String>) -> Self {
        Self {
            adapter,
            key: key.into(),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
        }
    }

    /// The persistence key this registry is scoped to.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Register a session and notify observers.
    pub fn register(&self, session_id: SessionId, user_id: &str) -> StorageResult<()> {
        let info = SessionInfo {
            session_id,
            user_id: user_id.to_string(),
            registered_at: Utc::now(),
        };
        self.adapter.put_session(&self.key, &info)?;
        debug!(key = %self.key, %session_id, user_id, "session registered");
        self.refresh()
    }

    /// Remove a session and notify observers.
    pub fn unregister(&self, session_id: SessionId) -> StorageResult<()> {
        self.adapter.remove_session(&self.key, session_id)?;
        debug!(key = %self.key, %session_id, "session unregistered");
        self.refresh()
    }

    /// All currently registered sessions, oldest first.
    pub fn active_sessions(&self) -> StorageResult<Vec<SessionInfo>> {
        self.adapter.list_sessions(&self.key)
    }

    /// Deduplicated, sorted user ids across registered sessions.
    pub fn active_user_ids(&self) -> StorageResult<Vec<String>> {
        let mut ids: Vec<String> = self
            .active_sessions()?
            .into_iter()
            .map(|s| s.user_id)
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    /// Register a membership observer; returns an id for unsubscribing.
    pub fn subscribe(
        &self,
        listener: impl Fn(&[SessionInfo]) + Send + Sync + 'static,
    ) -> RegistryListenerId {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push((id, Arc::new(listener)));
        id
    }

    /// Remove an observer. Safe to call with an unknown id.
    pub fn unsubscribe(&self, id: RegistryListenerId) {
        self.listeners.lock().retain(|(lid, _)| *lid != id);
    }

    /// Re-read membership and notify observers. Called by the sync client
    /// when a sibling announces it is closing.
    pub fn refresh(&self) -> StorageResult<()> {
        let sessions = self.active_sessions()?;
        // Snapshot under the lock, call outside it so listeners can
        // re-enter subscribe/unsubscribe.
        let snapshot: Vec<MembershipListener> = {
            let guard = self.listeners.lock();
            guard.iter().map(|(_, l)| Arc::clone(l)).collect()
        };
        for listener in snapshot {
            listener(&sessions);
        }
        Ok(())
    }
}
