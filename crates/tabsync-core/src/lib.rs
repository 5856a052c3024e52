//! Tabsync Core Library
//!
//! This crate keeps an in-memory document store consistent with a durable
//! local database across multiple concurrent sessions (tabs, windows,
//! processes) of the same application, without any server.
//!
//! # Architecture
//!
//! Each session runs one [`SyncClient`] attached to a shared
//! [`DocumentStore`]. Local mutations are coalesced in a change buffer and
//! flushed to storage on a timer as atomic batches; every flush is announced
//! on a broadcast bus so sibling sessions reload and merge. Conflicts
//! resolve last-writer-wins by per-record logical version, which makes the
//! merge idempotent and order-independent.
//!
//! Persisted state is a snapshot plus a change log; the client periodically
//! compacts the log back into a snapshot. If storage cannot be opened, the
//! client degrades to in-memory-only operation instead of failing.
//!
//! # Quick Start
//!
//! ```text
//! let store = Arc::new(MemoryStore::new());
//! let adapter = Arc::new(SqliteAdapter::open(&config.database_path())?);
//! let bus = Arc::new(BroadcastBus::new());
//!
//! let client = SyncClient::start(
//!     store.clone(),
//!     adapter,
//!     bus,
//!     SyncOptions::new("my-document", "alice"),
//! );
//!
//! store.put("shape", RecordId::new("shape:1"), json!({"x": 0}));
//! client.close().await?;
//! ```
//!
//! # Modules
//!
//! - `client`: Sync client lifecycle (main entry point)
//! - `store`: In-memory document store and its observer contract
//! - `records`: Records, snapshots, and change entries
//! - `buffer`: Coalescing change buffer
//! - `merge`: Loading persisted state and last-writer-wins merging
//! - `broadcast`: Cross-session notification bus
//! - `session`: Advisory session/presence registry
//! - `storage`: Persistent store adapter (SQLite-backed)
//! - `config`: Persistence tuning configuration

pub mod broadcast;
pub mod buffer;
pub mod client;
pub mod config;
pub mod error;
pub mod merge;
pub mod records;
pub mod session;
pub mod storage;
pub mod store;

pub use broadcast::{BroadcastBus, BusMessage};
pub use buffer::ChangeBuffer;
pub use client::{hard_reset, SyncClient, SyncOptions, SyncStatus};
pub use config::SyncConfig;
pub use error::{SyncError, SyncResult};
pub use merge::{merge_into_store, MergeOutcome};
pub use records::{ChangeBatch, ChangeEntry, Record, RecordId, Snapshot};
pub use session::{SessionId, SessionInfo, SessionRegistry};
pub use storage::{PersistedDocument, SqliteAdapter, StorageAdapter, StorageError};
pub use store::{DocumentStore, MemoryStore, SubscriptionId};
