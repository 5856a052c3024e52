//! Loading and merging persisted state into a live store
//!
//! Replays a [`PersistedDocument`] (snapshot plus change log) into a record
//! map, then folds that into a [`DocumentStore`] with last-writer-wins by
//! logical version. Merging is idempotent and commutative across sessions:
//! replaying the same persisted state twice, or in a different interleaving,
//! converges on the same store contents.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::records::{ChangeEntry, Record, RecordId};
use crate::storage::PersistedDocument;
use crate::store::DocumentStore;

/// What a merge actually changed in the live store.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Records inserted or overwritten because the loaded version won.
    pub applied: usize,
    /// Records deleted because the log carried a removal for them.
    pub removed: usize,
}

impl MergeOutcome {
    /// True when the merge left the store untouched.
    pub fn is_noop(&self) -> bool {
        self.applied == 0 && self.removed == 0
    }
}

/// Replay a persisted document into `(records, tombstones)`.
///
/// The snapshot seeds the map; change entries are applied in log order, so a
/// later entry for the same id supersedes an earlier one. Removals both drop
/// the record and leave a tombstone, which the merge uses to propagate the
/// delete into stores that still hold the record.
pub fn materialize(doc: &PersistedDocument) -> (HashMap<RecordId, Record>, HashSet<RecordId>) {
    let mut records: HashMap<RecordId, Record> = doc
        .snapshot
        .as_ref()
        .map(|s| s.records.clone())
        .unwrap_or_default();
    let mut tombstones = HashSet::new();

    for entry in &doc.changes {
        match entry {
            ChangeEntry::Added { record } | ChangeEntry::Updated { record, .. } => {
                tombstones.remove(&record.id);
                records.insert(record.id.clone(), record.clone());
            }
            ChangeEntry::Removed { id } => {
                records.remove(id);
                tombstones.insert(id.clone());
            }
        }
    }

    (records, tombstones)
}

/// Fold persisted state into a live store, last-writer-wins by version.
///
/// A loaded record is applied only when the store has no record for that id
/// or holds a strictly older version; equal or newer local versions win and
/// keep any unflushed local edit intact. Tombstones only remove records the
/// store actually holds.
pub fn merge_into_store(store: &dyn DocumentStore, doc: &PersistedDocument) -> MergeOutcome {
    let (loaded, tombstones) = materialize(doc);
    let live = store.get_snapshot();

    let puts: Vec<Record> = loaded
        .into_values()
        .filter(|record| match live.get(&record.id) {
            Some(existing) => existing.version < record.version,
            None => true,
        })
        .collect();

    let removes: Vec<RecordId> = tombstones
        .into_iter()
        .filter(|id| live.contains_key(id))
        .collect();

    let outcome = MergeOutcome {
        applied: puts.len(),
        removed: removes.len(),
    };

    if !outcome.is_noop() {
        debug!(
            applied = outcome.applied,
            removed = outcome.removed,
            "merged persisted state into store"
        );
        store.merge_remote_changes(puts, removes);
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::Snapshot;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn versioned(id: &str, version: u64, payload: serde_json::Value) -> Record {
        let mut record = Record::new(id, "shape", payload);
        record.version = version;
        record
    }

    #[test]
    fn test_materialize_replays_log_over_snapshot() {
        let base = versioned("shape:a", 1, json!({"x": 1}));
        let mut records = HashMap::new();
        records.insert(base.id.clone(), base.clone());

        let doc = PersistedDocument {
            snapshot: Some(Snapshot::new(1, records)),
            changes: vec![
                ChangeEntry::Updated {
                    record: versioned("shape:a", 2, json!({"x": 2})),
                    previous: base,
                },
                ChangeEntry::Added {
                    record: versioned("shape:b", 1, json!({"y": 0})),
                },
                ChangeEntry::Removed {
                    id: RecordId::new("shape:b"),
                },
            ],
        };

        let (materialized, tombstones) = materialize(&doc);
        assert_eq!(materialized.len(), 1);
        assert_eq!(materialized[&RecordId::new("shape:a")].version, 2);
        assert!(tombstones.contains(&RecordId::new("shape:b")));
    }

    #[test]
    fn test_re_add_clears_tombstone() {
        let doc = PersistedDocument {
            snapshot: None,
            changes: vec![
                ChangeEntry::Removed {
                    id: RecordId::new("shape:a"),
                },
                ChangeEntry::Added {
                    record: versioned("shape:a", 1, json!({})),
                },
            ],
        };

        let (materialized, tombstones) = materialize(&doc);
        assert!(materialized.contains_key(&RecordId::new("shape:a")));
        assert!(tombstones.is_empty());
    }

    #[test]
    fn test_merge_newer_loaded_version_wins() {
        let store = MemoryStore::new();
        store.put("shape", RecordId::new("shape:a"), json!({"x": "local"}));

        let doc = PersistedDocument {
            snapshot: None,
            changes: vec![ChangeEntry::Added {
                record: versioned("shape:a", 5, json!({"x": "remote"})),
            }],
        };

        let outcome = merge_into_store(&store, &doc);
        assert_eq!(outcome.applied, 1);
        let merged = store.get(&RecordId::new("shape:a")).unwrap();
        assert_eq!(merged.version, 5);
        assert_eq!(merged.payload, json!({"x": "remote"}));
    }

    #[test]
    fn test_merge_keeps_newer_local_version() {
        let store = MemoryStore::new();
        let id = RecordId::new("shape:a");
        store.put("shape", id.clone(), json!({"x": 1}));
        store.put("shape", id.clone(), json!({"x": 2})); // version 2

        let doc = PersistedDocument {
            snapshot: None,
            changes: vec![ChangeEntry::Added {
                record: versioned("shape:a", 1, json!({"x": "stale"})),
            }],
        };

        let outcome = merge_into_store(&store, &doc);
        assert!(outcome.is_noop());
        assert_eq!(store.get(&id).unwrap().payload, json!({"x": 2}));
    }

    #[test]
    fn test_tombstone_removes_live_record() {
        let store = MemoryStore::new();
        let id = RecordId::new("shape:a");
        store.put("shape", id.clone(), json!({}));

        let doc = PersistedDocument {
            snapshot: None,
            changes: vec![ChangeEntry::Removed { id: id.clone() }],
        };

        let outcome = merge_into_store(&store, &doc);
        assert_eq!(outcome.removed, 1);
        assert!(store.get(&id).is_none());
    }

    #[test]
    fn test_snapshot_absence_does_not_delete_unflushed_records() {
        // A record the snapshot never saw (e.g. created locally and not yet
        // flushed) must survive a merge that carries no tombstone for it.
        let store = MemoryStore::new();
        let unflushed = RecordId::new("shape:local-only");
        store.put("shape", unflushed.clone(), json!({}));

        let doc = PersistedDocument {
            snapshot: Some(Snapshot::new(1, HashMap::new())),
            changes: vec![],
        };

        merge_into_store(&store, &doc);
        assert!(store.get(&unflushed).is_some());
    }

    #[test]
    fn test_merge_is_idempotent() {
        let store = MemoryStore::new();
        let doc = PersistedDocument {
            snapshot: None,
            changes: vec![
                ChangeEntry::Added {
                    record: versioned("shape:a", 3, json!({"x": 1})),
                },
                ChangeEntry::Removed {
                    id: RecordId::new("shape:b"),
                },
            ],
        };

        let first = merge_into_store(&store, &doc);
        assert_eq!(first.applied, 1);

        let second = merge_into_store(&store, &doc);
        assert!(second.is_noop());
        assert_eq!(store.len(), 1);
    }
}
