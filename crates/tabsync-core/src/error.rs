//! Error types for the sync client

use thiserror::Error;

use crate::storage::StorageError;

/// Errors surfaced by the sync client
#[derive(Error, Debug)]
pub enum SyncError {
    /// A storage operation failed after retries were exhausted
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The client has been closed (or its task has exited)
    #[error("sync client is closed")]
    ClientClosed,
}

/// Result type for sync client operations
pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_passes_through() {
        let err: SyncError = StorageError::Corrupt {
            details: "bad uuid".to_string(),
        }
        .into();
        assert!(err.to_string().contains("bad uuid"));
    }

    #[test]
    fn test_closed_message() {
        assert_eq!(SyncError::ClientClosed.to_string(), "sync client is closed");
    }
}
