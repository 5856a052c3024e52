//! Data model for synced documents
//!
//! A document is a flat collection of [`Record`]s keyed by [`RecordId`].
//! The payload schema belongs to the embedding application; this layer only
//! needs the id, the type discriminant, and the version counter.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque record identifier, unique within one document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId(pub String);

impl RecordId {
    /// Create an id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random id.
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RecordId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// One versioned unit of document state.
///
/// `version` is a logical counter bumped on every local save. Conflict
/// resolution between sessions is last-writer-wins by this counter; equal
/// versions are assumed to be identical records.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record {
    /// Unique identifier within the document
    pub id: RecordId,
    /// Logical kind of the record (shape, page, setting, ...)
    pub type_name: String,
    /// Logical version counter, monotonically increasing per save
    pub version: u64,
    /// Opaque payload, schema owned by the embedder
    pub payload: serde_json::Value,
}

impl Record {
    /// Create a version-1 record.
    pub fn new(id: impl Into<RecordId>, type_name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            type_name: type_name.into(),
            version: 1,
            payload,
        }
    }

    /// Return a copy with the version bumped by one.
    pub fn bumped(&self, payload: serde_json::Value) -> Self {
        Self {
            id: self.id.clone(),
            type_name: self.type_name.clone(),
            version: self.version + 1,
            payload,
        }
    }
}

/// Full materialized document state at a point in time.
///
/// Only one snapshot is live per persistence key; writing a new one
/// supersedes the previous snapshot and its change log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    /// Document schema version; a mismatch at load is surfaced, never migrated here
    pub schema_version: u32,
    /// All records, keyed by id
    pub records: HashMap<RecordId, Record>,
}

impl Snapshot {
    /// Create a snapshot from a record map.
    pub fn new(schema_version: u32, records: HashMap<RecordId, Record>) -> Self {
        Self {
            schema_version,
            records,
        }
    }
}

/// One net add/update/remove operation on a record, queued for persistence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeEntry {
    /// A record created in this session
    Added { record: Record },
    /// A record updated in this session, with its pre-update state
    Updated { record: Record, previous: Record },
    /// A record removed in this session
    Removed { id: RecordId },
}

impl ChangeEntry {
    /// The id of the record this entry concerns.
    pub fn record_id(&self) -> &RecordId {
        match self {
            ChangeEntry::Added { record } => &record.id,
            ChangeEntry::Updated { record, .. } => &record.id,
            ChangeEntry::Removed { id } => id,
        }
    }
}

/// A batch of store mutations delivered in one reactive tick.
#[derive(Debug, Clone, Default)]
pub struct ChangeBatch {
    pub added: Vec<Record>,
    /// `(previous, current)` pairs
    pub updated: Vec<(Record, Record)>,
    pub removed: Vec<RecordId>,
}

impl ChangeBatch {
    /// True when the batch carries no mutations.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Total number of mutations in the batch.
    pub fn len(&self) -> usize {
        self.added.len() + self.updated.len() + self.removed.len()
    }
}
