//! Storage error handling
//!
//! Typed errors for the persistent store adapter. Availability failures
//! (`Unavailable`) put the client into in-memory-only mode; transient
//! read/write failures are retried with backoff by the sync client before
//! being treated as fatal.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur in the persistent store adapter
#[derive(Error, Debug)]
pub enum StorageError {
    /// The underlying database cannot be opened at all
    #[error("storage unavailable at '{path}': {reason}")]
    Unavailable { path: PathBuf, reason: String },

    /// A specific database operation failed
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Failed to encode or decode persisted record data
    #[error("failed to encode persisted data: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Filesystem error while preparing storage
    #[error("I/O error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Persisted rows that cannot be interpreted (bad uuid, bad timestamp)
    #[error("invalid persisted data: {details}")]
    Corrupt { details: String },

    /// Persisted document schema is incompatible with the running code
    #[error("persisted schema version {persisted} does not match expected {expected}")]
    SchemaMismatch { persisted: u32, expected: u32 },
}

impl StorageError {
    /// True when the database could not be opened; callers degrade to
    /// in-memory-only operation instead of retrying.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StorageError::Unavailable { .. })
    }

    /// True when a retry with backoff is worthwhile.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Database(_) | StorageError::Io { .. })
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
