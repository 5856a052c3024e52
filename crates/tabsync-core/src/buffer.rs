//! Change buffer
//!
//! Accumulates a session's mutations between flushes, coalescing multiple
//! writes to the same record into one net entry. Intermediate states are not
//! persisted: a record created and then edited within one flush window is
//! stored as a single `added` entry carrying the final payload, and a record
//! created and then removed within one window cancels out entirely.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::records::{ChangeBatch, ChangeEntry, RecordId};

/// Coalescing buffer of pending change entries.
///
/// All methods take `&self`; internal state is guarded by a mutex so the
/// flush timer can drain while the store listener records new entries.
#[derive(Default)]
pub struct ChangeBuffer {
    inner: Mutex<BufferInner>,
}

#[derive(Default)]
struct BufferInner {
    /// Record ids in first-touch order
    order: Vec<RecordId>,
    /// Net entry per record id
    entries: HashMap<RecordId, ChangeEntry>,
}

impl ChangeBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one change entry, coalescing against any pending entry for the
    /// same record id.
    pub fn record(&self, entry: ChangeEntry) {
        let mut inner = self.inner.lock();
        let id = entry.record_id().clone();

        let next = match (inner.entries.remove(&id), entry) {
            // First touch in this window.
            (None, entry) => Some(entry),

            // Still unseen by the persistence layer: stays an add with the
            // latest payload, and cancels out entirely when removed.
            (Some(ChangeEntry::Added { .. }), ChangeEntry::Updated { record, .. }) => {
                Some(ChangeEntry::Added { record })
            }
            (Some(ChangeEntry::Added { .. }), ChangeEntry::Added { record }) => {
                Some(ChangeEntry::Added { record })
            }
            (Some(ChangeEntry::Added { .. }), ChangeEntry::Removed { .. }) => None,

            // Persisted record: keep the original pre-window state as
            // `previous`, carry only the latest payload.
            (Some(ChangeEntry::Updated { previous, .. }), ChangeEntry::Updated { record, .. }) => {
                Some(ChangeEntry::Updated { record, previous })
            }
            (Some(ChangeEntry::Updated { previous, .. }), ChangeEntry::Added { record }) => {
                Some(ChangeEntry::Updated { record, previous })
            }
            (Some(ChangeEntry::Updated { .. }), ChangeEntry::Removed { id }) => {
                Some(ChangeEntry::Removed { id })
            }

            // Removed then re-created within one window: the loader upserts,
            // so the net effect is an add with the final payload.
            (Some(ChangeEntry::Removed { .. }), ChangeEntry::Added { record }) => {
                Some(ChangeEntry::Added { record })
            }
            (Some(ChangeEntry::Removed { .. }), ChangeEntry::Updated { record, .. }) => {
                Some(ChangeEntry::Added { record })
            }
            (Some(ChangeEntry::Removed { id: prev }), ChangeEntry::Removed { .. }) => {
                Some(ChangeEntry::Removed { id: prev })
            }
        };

        match next {
            Some(entry) => {
                if !inner.order.contains(&id) {
                    inner.order.push(id.clone());
                }
                inner.entries.insert(id, entry);
            }
            None => {
                inner.order.retain(|existing| existing != &id);
            }
        }
    }

    /// Record every mutation in a store change batch.
    pub fn record_batch(&self, batch: &ChangeBatch) {
        for record in &batch.added {
            self.record(ChangeEntry::Added {
                record: record.clone(),
            });
        }
        for (previous, record) in &batch.updated {
            self.record(ChangeEntry::Updated {
                record: record.clone(),
                previous: previous.clone(),
            });
        }
        for id in &batch.removed {
            self.record(ChangeEntry::Removed { id: id.clone() });
        }
    }

    /// Atomically return and clear all buffered entries, in first-touch order.
    pub fn drain(&self) -> Vec<ChangeEntry> {
        let mut inner = self.inner.lock();
        let inner = std::mem::take(&mut *inner);
        let mut entries = inner.entries;
        inner
            .order
            .into_iter()
            .filter_map(|id| entries.remove(&id))
            .collect()
    }

    /// True when no entries are pending.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Number of pending net entries.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }
}
