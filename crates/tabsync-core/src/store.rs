//! In-memory document store
//!
//! The store is the source of truth the application reads and writes. It
//! knows nothing about persistence; the sync client observes it through
//! [`DocumentStore::subscribe`] and feeds remote state back in through
//! [`DocumentStore::merge_remote_changes`], which deliberately does NOT
//! notify subscribers so merged-in changes are never re-buffered.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::records::{ChangeBatch, Record, RecordId};

/// Identifier handed out by [`DocumentStore::subscribe`].
pub type SubscriptionId = u64;

type ChangeListener = Arc<dyn Fn(&ChangeBatch) + Send + Sync>;

/// Contract between the sync client and whatever holds the live document.
///
/// Local mutations must reach subscribers as [`ChangeBatch`]es; remote
/// mutations arrive through `merge_remote_changes` and must not echo back
/// out through subscribers.
pub trait DocumentStore: Send + Sync {
    /// Observe local mutations. The listener runs on the mutating thread.
    fn subscribe(&self, listener: Box<dyn Fn(&ChangeBatch) + Send + Sync>) -> SubscriptionId;

    /// Stop observing. Safe to call with an unknown id.
    fn unsubscribe(&self, id: SubscriptionId);

    /// Copy of the full live document, used for snapshot compaction.
    fn get_snapshot(&self) -> HashMap<RecordId, Record>;

    /// Apply already-versioned records and removals loaded from storage or
    /// received from a sibling session. Subscribers are not notified.
    fn merge_remote_changes(&self, puts: Vec<Record>, removes: Vec<RecordId>);
}

/// Reference [`DocumentStore`] backed by a hash map.
///
/// Local writes stamp logical versions: a new record starts at version 1,
/// each overwrite of an existing id bumps the stored version by one. The
/// version is what last-writer-wins merging compares, so it only ever moves
/// forward for a given record.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<RecordId, Record>>,
    listeners: Mutex<Vec<(SubscriptionId, ChangeListener)>>,
    next_subscription_id: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            next_subscription_id: AtomicU64::new(1),
        }
    }

    /// Create or overwrite a record locally and notify subscribers.
    pub fn put(&self, type_name: &str, id: RecordId, payload: Value) -> Record {
        let (record, batch) = {
            let mut records = self.records.lock();
            match records.get(&id) {
                Some(existing) => {
                    let previous = existing.clone();
                    let current = previous.bumped(payload);
                    records.insert(id, current.clone());
                    let batch = ChangeBatch {
                        updated: vec![(previous, current.clone())],
                        ..Default::default()
                    };
                    (current, batch)
                }
                None => {
                    let record = Record::new(id.clone(), type_name, payload);
                    records.insert(id, record.clone());
                    let batch = ChangeBatch {
                        added: vec![record.clone()],
                        ..Default::default()
                    };
                    (record, batch)
                }
            }
        };
        self.emit(&batch);
        record
    }

    /// Delete a record locally and notify subscribers. No-op for unknown ids.
    pub fn remove(&self, id: &RecordId) -> Option<Record> {
        let removed = self.records.lock().remove(id);
        if removed.is_some() {
            let batch = ChangeBatch {
                removed: vec![id.clone()],
                ..Default::default()
            };
            self.emit(&batch);
        }
        removed
    }

    /// Read one record.
    pub fn get(&self, id: &RecordId) -> Option<Record> {
        self.records.lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    fn emit(&self, batch: &ChangeBatch) {
        // Snapshot under the lock, call outside it so a listener can
        // subscribe or unsubscribe without deadlocking.
        let snapshot: Vec<ChangeListener> = {
            let guard = self.listeners.lock();
            guard.iter().map(|(_, l)| Arc::clone(l)).collect()
        };
        for listener in snapshot {
            listener(batch);
        }
    }
}

impl DocumentStore for MemoryStore {
    fn subscribe(&self, listener: Box<dyn Fn(&ChangeBatch) + Send + Sync>) -> SubscriptionId {
        let id = self.next_subscription_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push((id, Arc::from(listener)));
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.listeners.lock().retain(|(sid, _)| *sid != id);
    }

    fn get_snapshot(&self) -> HashMap<RecordId, Record> {
        self.records.lock().clone()
    }

    fn merge_remote_changes(&self, puts: Vec<Record>, removes: Vec<RecordId>) {
        let mut records = self.records.lock();
        for record in puts {
            records.insert(record.id.clone(), record);
        }
        for id in removes {
            records.remove(&id);
        }
    }
}
