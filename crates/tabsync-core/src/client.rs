//! Sync client
//!
//! Owns the lifecycle of one session attached to a persistence key: load and
//! merge persisted state at startup, buffer local mutations, flush them on a
//! timer with retry, compact the change log into snapshots, and exchange
//! change/closing notifications with sibling sessions over the broadcast bus.
//!
//! All of that runs on a spawned task; the [`SyncClient`] handle talks to it
//! through a command channel and observes it through a status watch.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broadcast::{BroadcastBus, BusMessage};
use crate::buffer::ChangeBuffer;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::merge::merge_into_store;
use crate::records::Snapshot;
use crate::session::{SessionId, SessionRegistry};
use crate::storage::{StorageAdapter, StorageError, StorageResult};
use crate::store::{DocumentStore, SubscriptionId};

/// Callback invoked when the initial load cannot produce persisted state.
pub type LoadErrorCallback = Arc<dyn Fn(&SyncError) + Send + Sync>;

/// Options for starting a sync client.
pub struct SyncOptions {
    /// Namespace for everything this client persists and broadcasts
    pub persistence_key: String,
    /// User shown in the session registry
    pub user_id: String,
    /// Document schema version this build reads and writes
    pub schema_version: u32,
    /// Persistence tuning knobs
    pub config: SyncConfig,
    /// Invoked when startup cannot use persisted state (unavailable,
    /// corrupt, or schema-incompatible storage)
    pub on_load_error: Option<LoadErrorCallback>,
}

impl SyncOptions {
    pub fn new(persistence_key: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            persistence_key: persistence_key.into(),
            user_id: user_id.into(),
            schema_version: 1,
            config: SyncConfig::default(),
            on_load_error: None,
        }
    }
}

/// Observable lifecycle of a sync client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStatus {
    /// Task not yet running
    Initializing,
    /// Reading persisted state
    Loading,
    /// Serving the application; `persisted` is false when storage was
    /// unavailable and the client fell back to in-memory-only operation
    Ready { persisted: bool },
    /// Draining the final flush
    Closing,
    /// Task has exited cleanly
    Closed,
    /// Unrecoverable failure; local edits keep working but nothing is
    /// persisted or broadcast anymore
    Error { message: String },
}

/// Commands sent to the client task
enum Command {
    /// Flush buffered changes now instead of waiting for the timer
    Flush(oneshot::Sender<SyncResult<()>>),
    /// Flush, announce departure, and shut the task down
    Close(oneshot::Sender<()>),
}

/// How the task is allowed to touch storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Normal operation: buffer, flush, compact, broadcast
    Persisted,
    /// Storage unavailable at startup; serve the store without persistence
    Memory,
    /// Terminal failure; only `close` still does anything
    Failed,
}

/// Handle to a running sync client.
///
/// Cheap to clone is not a goal here; hold it wherever the document lives
/// and call [`SyncClient::close`] before dropping it so the final flush and
/// departure broadcast happen.
pub struct SyncClient {
    session_id: SessionId,
    persistence_key: String,
    command_tx: mpsc::Sender<Command>,
    status_rx: watch::Receiver<SyncStatus>,
}

impl SyncClient {
    /// Start a client for one (store, persistence key) pairing.
    ///
    /// Subscribes to the bus and registers the session before returning, so
    /// no sibling broadcast published after this call can be missed. The
    /// load/flush machinery runs on a spawned task.
    pub fn start(
        store: Arc<dyn DocumentStore>,
        adapter: Arc<dyn StorageAdapter>,
        bus: Arc<BroadcastBus>,
        options: SyncOptions,
    ) -> Self {
        let session_id = Uuid::new_v4();
        let (command_tx, command_rx) = mpsc::channel(16);
        let (status_tx, status_rx) = watch::channel(SyncStatus::Initializing);

        let bus_rx = bus.subscribe(&options.persistence_key, session_id);
        let registry = SessionRegistry::new(Arc::clone(&adapter), options.persistence_key.clone());
        if let Err(err) = registry.register(session_id, &options.user_id) {
            warn!(
                key = %options.persistence_key,
                error = %err,
                "could not register session; presence will be incomplete"
            );
        }

        let task = ClientTask {
            session_id,
            key: options.persistence_key.clone(),
            schema_version: options.schema_version,
            config: options.config,
            store,
            adapter,
            bus,
            registry,
            buffer: Arc::new(ChangeBuffer::new()),
            status_tx,
            on_load_error: options.on_load_error,
            mode: Mode::Persisted,
            store_subscription: None,
            flushes_since_compaction: 0,
        };
        tokio::spawn(task.run(command_rx, bus_rx));

        Self {
            session_id,
            persistence_key: options.persistence_key,
            command_tx,
            status_rx,
        }
    }

    /// This client's session id.
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// The persistence key this client serves.
    pub fn persistence_key(&self) -> &str {
        &self.persistence_key
    }

    /// Current lifecycle status.
    pub fn status(&self) -> SyncStatus {
        self.status_rx.borrow().clone()
    }

    /// Watch lifecycle transitions.
    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status_rx.clone()
    }

    /// Flush buffered changes now instead of waiting for the timer.
    pub async fn force_flush(&self) -> SyncResult<()> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(Command::Flush(tx))
            .await
            .map_err(|_| SyncError::ClientClosed)?;
        rx.await.map_err(|_| SyncError::ClientClosed)?
    }

    /// Flush, broadcast departure, unregister the session, and stop the task.
    ///
    /// Idempotent: closing an already-closed client is a no-op.
    pub async fn close(&self) -> SyncResult<()> {
        let (tx, rx) = oneshot::channel();
        if self.command_tx.send(Command::Close(tx)).await.is_err() {
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }
}

/// Wipe every persisted partition for `key`: snapshot, change log, sessions.
///
/// Intended for sign-out flows. Must not run while a client for the key is
/// active, since that client would flush its buffer right back.
pub fn hard_reset(adapter: &dyn StorageAdapter, key: &str) -> StorageResult<()> {
    info!(key, "hard reset of persisted state");
    adapter.clear(key)
}

struct ClientTask {
    session_id: SessionId,
    key: String,
    schema_version: u32,
    config: SyncConfig,
    store: Arc<dyn DocumentStore>,
    adapter: Arc<dyn StorageAdapter>,
    bus: Arc<BroadcastBus>,
    registry: SessionRegistry,
    buffer: Arc<ChangeBuffer>,
    status_tx: watch::Sender<SyncStatus>,
    on_load_error: Option<LoadErrorCallback>,
    mode: Mode,
    store_subscription: Option<SubscriptionId>,
    flushes_since_compaction: u32,
}

impl ClientTask {
    async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<Command>,
        mut bus_rx: mpsc::UnboundedReceiver<BusMessage>,
    ) {
        self.load_initial_state().await;

        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.flush_interval_ms.max(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut bus_open = true;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if !self.buffer.is_empty() {
                        if let Err(err) = self.flush().await {
                            warn!(key = %self.key, error = %err, "periodic flush failed");
                        }
                    } else {
                        // Broadcasts are best-effort; reconcile on the timer
                        // too so a missed notification cannot leave this
                        // session stale forever.
                        self.reload_from_siblings();
                    }
                }

                msg = bus_rx.recv(), if bus_open => {
                    match msg {
                        Some(BusMessage::Changed) => self.reload_from_siblings(),
                        Some(BusMessage::Closing { session_id }) => {
                            debug!(key = %self.key, %session_id, "sibling session closing");
                            if let Err(err) = self.registry.refresh() {
                                warn!(key = %self.key, error = %err, "could not refresh session registry");
                            }
                        }
                        None => {
                            // Bus dropped us; keep flushing on the timer.
                            bus_open = false;
                        }
                    }
                }

                cmd = command_rx.recv() => {
                    match cmd {
                        Some(Command::Flush(ack)) => {
                            let _ = ack.send(self.flush().await);
                        }
                        Some(Command::Close(ack)) => {
                            self.shutdown().await;
                            let _ = ack.send(());
                            break;
                        }
                        None => {
                            // Handle dropped without close(); shut down anyway.
                            self.shutdown().await;
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn load_initial_state(&mut self) {
        let _ = self.status_tx.send(SyncStatus::Loading);

        let doc = match self.load_with_retry().await {
            Ok(doc) => doc,
            Err(err) if err.is_unavailable() => {
                let err = SyncError::Storage(err);
                warn!(
                    key = %self.key,
                    error = %err,
                    "storage unavailable; running in-memory only"
                );
                self.report_load_error(&err);
                self.mode = Mode::Memory;
                let _ = self.status_tx.send(SyncStatus::Ready { persisted: false });
                return;
            }
            Err(err) => {
                let err = SyncError::Storage(err);
                error!(key = %self.key, error = %err, "could not load persisted state");
                self.report_load_error(&err);
                self.enter_failed(&err);
                return;
            }
        };

        if let Some(snapshot) = &doc.snapshot {
            if snapshot.schema_version != self.schema_version {
                let err = SyncError::Storage(StorageError::SchemaMismatch {
                    persisted: snapshot.schema_version,
                    expected: self.schema_version,
                });
                error!(key = %self.key, error = %err, "refusing to load incompatible document");
                self.report_load_error(&err);
                self.enter_failed(&err);
                return;
            }
        }

        let outcome = merge_into_store(self.store.as_ref(), &doc);
        info!(
            key = %self.key,
            applied = outcome.applied,
            removed = outcome.removed,
            "loaded persisted state"
        );

        // Only now start buffering local mutations; everything merged above
        // is already persisted and must not be written back.
        let buffer = Arc::clone(&self.buffer);
        let subscription = self
            .store
            .subscribe(Box::new(move |batch| buffer.record_batch(batch)));
        self.store_subscription = Some(subscription);

        self.mode = Mode::Persisted;
        let _ = self.status_tx.send(SyncStatus::Ready { persisted: true });
    }

    async fn load_with_retry(&self) -> StorageResult<crate::storage::PersistedDocument> {
        self.with_retry(|| self.adapter.load(&self.key), "load").await
    }

    /// Flush the buffer as one atomic batch, announce it, maybe compact.
    async fn flush(&mut self) -> SyncResult<()> {
        match self.mode {
            Mode::Failed => return Err(SyncError::ClientClosed),
            Mode::Memory => return Ok(()),
            Mode::Persisted => {}
        }

        let entries = self.buffer.drain();
        if entries.is_empty() {
            return Ok(());
        }

        let written = self
            .with_retry(
                || self.adapter.write_changes(&self.key, &entries),
                "change flush",
            )
            .await;
        if let Err(err) = written {
            let err = SyncError::Storage(err);
            error!(
                key = %self.key,
                entries = entries.len(),
                error = %err,
                "flush failed after retries"
            );
            self.enter_failed(&err);
            return Err(err);
        }

        debug!(key = %self.key, entries = entries.len(), "flushed change batch");
        self.flushes_since_compaction += 1;
        self.bus
            .publish(&self.key, self.session_id, BusMessage::Changed);
        self.maybe_compact().await;
        Ok(())
    }

    /// Rewrite the snapshot from live store state when the change log has
    /// grown past either threshold. Failures here are not fatal: the log
    /// that the snapshot would have superseded is still intact.
    async fn maybe_compact(&mut self) {
        let by_count = self.flushes_since_compaction >= self.config.compact_every;
        let by_bytes = match self.adapter.change_log_bytes(&self.key) {
            Ok(bytes) => bytes >= self.config.compact_bytes,
            Err(err) => {
                warn!(key = %self.key, error = %err, "could not measure change log");
                false
            }
        };
        if !by_count && !by_bytes {
            return;
        }

        let snapshot = Snapshot::new(self.schema_version, self.store.get_snapshot());
        let written = self
            .with_retry(
                || self.adapter.write_snapshot(&self.key, &snapshot),
                "snapshot compaction",
            )
            .await;
        match written {
            Ok(()) => {
                self.flushes_since_compaction = 0;
                info!(
                    key = %self.key,
                    records = snapshot.records.len(),
                    "compacted change log into snapshot"
                );
            }
            Err(err) => {
                warn!(
                    key = %self.key,
                    error = %err,
                    "snapshot compaction failed; will retry on a later flush"
                );
            }
        }
    }

    /// A sibling flushed: re-read persisted state and merge it in.
    /// Last-writer-wins keeps our unflushed local edits intact.
    fn reload_from_siblings(&mut self) {
        if self.mode != Mode::Persisted {
            return;
        }
        match self.adapter.load(&self.key) {
            Ok(doc) => {
                let outcome = merge_into_store(self.store.as_ref(), &doc);
                if !outcome.is_noop() {
                    debug!(
                        key = %self.key,
                        applied = outcome.applied,
                        removed = outcome.removed,
                        "merged sibling changes"
                    );
                }
            }
            Err(err) => {
                warn!(key = %self.key, error = %err, "could not reload after sibling change");
            }
        }
    }

    async fn shutdown(&mut self) {
        let _ = self.status_tx.send(SyncStatus::Closing);

        if let Err(err) = self.flush().await {
            warn!(key = %self.key, error = %err, "final flush failed during close");
        }

        self.bus.publish(
            &self.key,
            self.session_id,
            BusMessage::Closing {
                session_id: self.session_id,
            },
        );
        self.bus.unsubscribe(&self.key, self.session_id);

        if let Some(subscription) = self.store_subscription.take() {
            self.store.unsubscribe(subscription);
        }
        if let Err(err) = self.registry.unregister(self.session_id) {
            warn!(key = %self.key, error = %err, "could not unregister session");
        }

        let _ = self.status_tx.send(SyncStatus::Closed);
        debug!(key = %self.key, session_id = %self.session_id, "sync client closed");
    }

    /// Retry a storage operation with exponential backoff. Only transient
    /// errors are retried; everything else surfaces immediately.
    async fn with_retry<T>(
        &self,
        op: impl Fn() -> StorageResult<T>,
        what: &str,
    ) -> StorageResult<T> {
        let mut delay = Duration::from_millis(self.config.initial_retry_delay_ms);
        let max_delay = Duration::from_millis(self.config.max_retry_delay_ms);
        let mut attempt = 1u32;

        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.config.max_write_retries => {
                    warn!(
                        key = %self.key,
                        attempt,
                        error = %err,
                        "{what} failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(max_delay);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Stop touching storage and the bus; local edits keep working.
    fn enter_failed(&mut self, err: &SyncError) {
        if let Some(subscription) = self.store_subscription.take() {
            self.store.unsubscribe(subscription);
        }
        self.mode = Mode::Failed;
        let _ = self.status_tx.send(SyncStatus::Error {
            message: err.to_string(),
        });
    }

    fn report_load_error(&self, err: &SyncError) {
        if let Some(callback) = &self.on_load_error {
            callback(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{ChangeEntry, RecordId};
    use crate::storage::{PersistedDocument, SqliteAdapter};
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::collections::HashMap;
    use std::path::PathBuf;

    fn options(key: &str) -> SyncOptions {
        SyncOptions {
            persistence_key: key.to_string(),
            user_id: "user-1".to_string(),
            schema_version: 1,
            config: SyncConfig {
                // Flush only on demand so tests control timing.
                flush_interval_ms: 60_000,
                ..Default::default()
            },
            on_load_error: None,
        }
    }

    async fn wait_for_settled(client: &SyncClient) -> SyncStatus {
        let mut rx = client.subscribe_status();
        // Bind before returning: the watch ref borrows `rx`.
        let status = rx
            .wait_for(|s| matches!(s, SyncStatus::Ready { .. } | SyncStatus::Error { .. }))
            .await
            .unwrap()
            .clone();
        status
    }

    /// Adapter whose storage can never be opened.
    struct OfflineAdapter;

    impl OfflineAdapter {
        fn unavailable() -> StorageError {
            StorageError::Unavailable {
                path: PathBuf::from("/blocked/documents.db"),
                reason: "permission denied".to_string(),
            }
        }
    }

    impl StorageAdapter for OfflineAdapter {
        fn load(&self, _key: &str) -> StorageResult<PersistedDocument> {
            Err(Self::unavailable())
        }
        fn write_changes(
            &self,
            _key: &str,
            _batch: &[crate::records::ChangeEntry],
        ) -> StorageResult<()> {
            Err(Self::unavailable())
        }
        fn write_snapshot(&self, _key: &str, _snapshot: &Snapshot) -> StorageResult<()> {
            Err(Self::unavailable())
        }
        fn clear(&self, _key: &str) -> StorageResult<()> {
            Err(Self::unavailable())
        }
        fn change_log_bytes(&self, _key: &str) -> StorageResult<u64> {
            Err(Self::unavailable())
        }
        fn put_session(
            &self,
            _key: &str,
            _session: &crate::session::SessionInfo,
        ) -> StorageResult<()> {
            Err(Self::unavailable())
        }
        fn remove_session(&self, _key: &str, _session_id: SessionId) -> StorageResult<()> {
            Err(Self::unavailable())
        }
        fn list_sessions(&self, _key: &str) -> StorageResult<Vec<crate::session::SessionInfo>> {
            Err(Self::unavailable())
        }
    }

    #[tokio::test]
    async fn test_force_flush_persists_buffered_changes() {
        let adapter: Arc<dyn StorageAdapter> = Arc::new(SqliteAdapter::open_in_memory().unwrap());
        let bus = Arc::new(BroadcastBus::new());
        let store = Arc::new(MemoryStore::new());

        let client = SyncClient::start(
            store.clone(),
            Arc::clone(&adapter),
            bus,
            options("doc-1"),
        );
        assert_eq!(
            wait_for_settled(&client).await,
            SyncStatus::Ready { persisted: true }
        );

        store.put("shape", RecordId::new("shape:a"), json!({"x": 1}));
        client.force_flush().await.unwrap();

        let doc = adapter.load("doc-1").unwrap();
        assert_eq!(doc.changes.len(), 1);
        assert_eq!(doc.changes[0].record_id().as_str(), "shape:a");
    }

    #[tokio::test]
    async fn test_close_flushes_and_unregisters() {
        let adapter: Arc<dyn StorageAdapter> = Arc::new(SqliteAdapter::open_in_memory().unwrap());
        let bus = Arc::new(BroadcastBus::new());
        let store = Arc::new(MemoryStore::new());

        let client = SyncClient::start(
            store.clone(),
            Arc::clone(&adapter),
            bus,
            options("doc-1"),
        );
        wait_for_settled(&client).await;
        assert_eq!(adapter.list_sessions("doc-1").unwrap().len(), 1);

        store.put("shape", RecordId::new("shape:a"), json!({}));
        client.close().await.unwrap();

        assert_eq!(client.status(), SyncStatus::Closed);
        assert_eq!(adapter.load("doc-1").unwrap().changes.len(), 1);
        assert!(adapter.list_sessions("doc-1").unwrap().is_empty());

        // Closing again is a no-op.
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_schema_mismatch_is_terminal() {
        let adapter: Arc<dyn StorageAdapter> = Arc::new(SqliteAdapter::open_in_memory().unwrap());
        adapter
            .write_snapshot("doc-1", &Snapshot::new(2, HashMap::new()))
            .unwrap();

        let bus = Arc::new(BroadcastBus::new());
        let store = Arc::new(MemoryStore::new());
        let reported = Arc::new(parking_lot::Mutex::new(None));

        let mut opts = options("doc-1");
        let reported_clone = Arc::clone(&reported);
        opts.on_load_error = Some(Arc::new(move |err: &SyncError| {
            *reported_clone.lock() = Some(err.to_string());
        }));

        let client = SyncClient::start(store.clone(), adapter, bus, opts);
        let status = wait_for_settled(&client).await;
        assert!(matches!(status, SyncStatus::Error { ref message } if message.contains("schema")));
        assert!(reported.lock().as_ref().unwrap().contains("schema"));

        // Flushing a failed client is rejected, closing still works.
        store.put("shape", RecordId::new("shape:a"), json!({}));
        assert!(client.force_flush().await.is_err());
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unavailable_storage_degrades_to_memory() {
        let adapter: Arc<dyn StorageAdapter> = Arc::new(OfflineAdapter);
        let bus = Arc::new(BroadcastBus::new());
        let store = Arc::new(MemoryStore::new());

        let client = SyncClient::start(store.clone(), adapter, bus, options("doc-1"));
        assert_eq!(
            wait_for_settled(&client).await,
            SyncStatus::Ready { persisted: false }
        );

        // Local edits and flushes work; flushes are just no-ops.
        store.put("shape", RecordId::new("shape:a"), json!({}));
        client.force_flush().await.unwrap();
        assert!(store.get(&RecordId::new("shape:a")).is_some());

        client.close().await.unwrap();
        assert_eq!(client.status(), SyncStatus::Closed);
    }

    #[tokio::test]
    async fn test_compaction_folds_log_into_snapshot() {
        let adapter: Arc<dyn StorageAdapter> = Arc::new(SqliteAdapter::open_in_memory().unwrap());
        let bus = Arc::new(BroadcastBus::new());
        let store = Arc::new(MemoryStore::new());

        let mut opts = options("doc-1");
        opts.config.compact_every = 1;
        let client = SyncClient::start(store.clone(), Arc::clone(&adapter), bus, opts);
        wait_for_settled(&client).await;

        store.put("shape", RecordId::new("shape:a"), json!({"x": 1}));
        client.force_flush().await.unwrap();

        let doc = adapter.load("doc-1").unwrap();
        let snapshot = doc.snapshot.expect("compaction should have written a snapshot");
        assert!(snapshot.records.contains_key(&RecordId::new("shape:a")));
        assert!(doc.changes.is_empty());
    }

    /// Poll until `pred` holds or a generous deadline passes. Broadcast
    /// delivery and the sibling's reload run on another task, so these
    /// tests wait instead of asserting immediately.
    async fn wait_until(mut pred: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if pred() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        pred()
    }

    fn start_pair(
        adapter: &Arc<dyn StorageAdapter>,
        bus: &Arc<BroadcastBus>,
        key: &str,
    ) -> (Arc<MemoryStore>, SyncClient, Arc<MemoryStore>, SyncClient) {
        let store_a = Arc::new(MemoryStore::new());
        let client_a = SyncClient::start(
            store_a.clone(),
            Arc::clone(adapter),
            Arc::clone(bus),
            options(key),
        );
        let store_b = Arc::new(MemoryStore::new());
        let client_b = SyncClient::start(
            store_b.clone(),
            Arc::clone(adapter),
            Arc::clone(bus),
            options(key),
        );
        (store_a, client_a, store_b, client_b)
    }

    #[tokio::test]
    async fn test_sibling_receives_flushed_changes() {
        let adapter: Arc<dyn StorageAdapter> = Arc::new(SqliteAdapter::open_in_memory().unwrap());
        let bus = Arc::new(BroadcastBus::new());
        let (store_a, client_a, store_b, client_b) = start_pair(&adapter, &bus, "doc-1");
        wait_for_settled(&client_a).await;
        wait_for_settled(&client_b).await;

        let id = RecordId::new("shape:a");
        store_a.put("shape", id.clone(), json!({"x": 1}));
        client_a.force_flush().await.unwrap();

        assert!(wait_until(|| store_b.get(&id).is_some()).await);
        assert_eq!(store_b.get(&id).unwrap().version, 1);

        // The merged record must not be re-buffered and re-flushed by B.
        client_b.force_flush().await.unwrap();
        assert_eq!(adapter.load("doc-1").unwrap().changes.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_edits_to_different_records_converge() {
        let adapter: Arc<dyn StorageAdapter> = Arc::new(SqliteAdapter::open_in_memory().unwrap());
        let bus = Arc::new(BroadcastBus::new());
        let (store_a, client_a, store_b, client_b) = start_pair(&adapter, &bus, "doc-1");
        wait_for_settled(&client_a).await;
        wait_for_settled(&client_b).await;

        let id_a = RecordId::new("shape:a");
        let id_b = RecordId::new("shape:b");
        store_a.put("shape", id_a.clone(), json!({"from": "a"}));
        store_b.put("shape", id_b.clone(), json!({"from": "b"}));

        client_a.force_flush().await.unwrap();
        client_b.force_flush().await.unwrap();

        assert!(wait_until(|| store_a.get(&id_b).is_some() && store_b.get(&id_a).is_some()).await);
        assert_eq!(store_a.get_snapshot(), store_b.get_snapshot());
    }

    #[tokio::test]
    async fn test_same_record_resolves_to_latest_version() {
        let adapter: Arc<dyn StorageAdapter> = Arc::new(SqliteAdapter::open_in_memory().unwrap());
        let bus = Arc::new(BroadcastBus::new());
        let (store_a, client_a, store_b, client_b) = start_pair(&adapter, &bus, "doc-1");
        wait_for_settled(&client_a).await;
        wait_for_settled(&client_b).await;

        let id = RecordId::new("shape:a");
        store_a.put("shape", id.clone(), json!({"step": 1}));
        client_a.force_flush().await.unwrap();
        assert!(wait_until(|| store_b.get(&id).is_some()).await);

        // B edits on top of the merged record, so its version is newer.
        store_b.put("shape", id.clone(), json!({"step": 2}));
        client_b.force_flush().await.unwrap();
        assert!(wait_until(|| {
            store_a.get(&id).map(|r| r.version) == Some(2)
        })
        .await);

        assert_eq!(store_a.get(&id).unwrap().payload, json!({"step": 2}));
        assert_eq!(store_a.get_snapshot(), store_b.get_snapshot());
    }

    #[tokio::test]
    async fn test_compaction_triggers_on_byte_threshold() {
        let adapter: Arc<dyn StorageAdapter> = Arc::new(SqliteAdapter::open_in_memory().unwrap());
        let bus = Arc::new(BroadcastBus::new());
        let store = Arc::new(MemoryStore::new());

        let mut opts = options("doc-1");
        // Count-based compaction can never fire; only the byte threshold can.
        opts.config.compact_every = u32::MAX;
        opts.config.compact_bytes = 1;
        let client = SyncClient::start(store.clone(), Arc::clone(&adapter), bus, opts);
        wait_for_settled(&client).await;

        store.put("shape", RecordId::new("shape:a"), json!({"x": 1}));
        client.force_flush().await.unwrap();

        let doc = adapter.load("doc-1").unwrap();
        let snapshot = doc
            .snapshot
            .expect("byte threshold should have triggered a snapshot");
        assert!(snapshot.records.contains_key(&RecordId::new("shape:a")));
        assert!(doc.changes.is_empty());
    }

    #[tokio::test]
    async fn test_removal_survives_compaction() {
        let adapter: Arc<dyn StorageAdapter> = Arc::new(SqliteAdapter::open_in_memory().unwrap());
        let bus = Arc::new(BroadcastBus::new());

        // A compacts after every flush; B reconciles only from what A leaves
        // behind in storage.
        let store_a = Arc::new(MemoryStore::new());
        let mut opts_a = options("doc-1");
        opts_a.config.compact_every = 1;
        let client_a = SyncClient::start(
            store_a.clone(),
            Arc::clone(&adapter),
            Arc::clone(&bus),
            opts_a,
        );
        let store_b = Arc::new(MemoryStore::new());
        let client_b = SyncClient::start(
            store_b.clone(),
            Arc::clone(&adapter),
            Arc::clone(&bus),
            options("doc-1"),
        );
        wait_for_settled(&client_a).await;
        wait_for_settled(&client_b).await;

        let id = RecordId::new("shape:r1");
        store_a.put("shape", id.clone(), json!({"x": 1}));
        client_a.force_flush().await.unwrap();
        assert!(wait_until(|| store_b.get(&id).is_some()).await);

        store_a.remove(&id);
        client_a.force_flush().await.unwrap();

        // The compacted snapshot no longer has r1, and the tombstone
        // survived compaction.
        let doc = adapter.load("doc-1").unwrap();
        assert!(!doc.snapshot.unwrap().records.contains_key(&id));
        assert!(
            matches!(&doc.changes[..], [ChangeEntry::Removed { id: removed }] if removed == &id)
        );

        // So the sibling drops the record instead of retaining it forever.
        assert!(wait_until(|| store_b.get(&id).is_none()).await);
    }

    #[tokio::test]
    async fn test_removal_propagates_to_siblings() {
        let adapter: Arc<dyn StorageAdapter> = Arc::new(SqliteAdapter::open_in_memory().unwrap());
        let bus = Arc::new(BroadcastBus::new());
        let (store_a, client_a, store_b, client_b) = start_pair(&adapter, &bus, "doc-1");
        wait_for_settled(&client_a).await;
        wait_for_settled(&client_b).await;

        let id = RecordId::new("shape:a");
        store_a.put("shape", id.clone(), json!({}));
        client_a.force_flush().await.unwrap();
        assert!(wait_until(|| store_b.get(&id).is_some()).await);

        store_b.remove(&id);
        client_b.force_flush().await.unwrap();
        assert!(wait_until(|| store_a.get(&id).is_none()).await);
    }

    #[tokio::test]
    async fn test_late_session_loads_earlier_state() {
        let dir = tempfile::tempdir().unwrap();
        let adapter: Arc<dyn StorageAdapter> =
            Arc::new(SqliteAdapter::open(&dir.path().join("documents.db")).unwrap());
        let bus = Arc::new(BroadcastBus::new());

        let store_a = Arc::new(MemoryStore::new());
        let client_a = SyncClient::start(
            store_a.clone(),
            Arc::clone(&adapter),
            Arc::clone(&bus),
            options("doc-1"),
        );
        wait_for_settled(&client_a).await;
        store_a.put("shape", RecordId::new("shape:a"), json!({"x": 1}));
        client_a.close().await.unwrap();

        // A session started after the first one closed sees its state.
        let store_b = Arc::new(MemoryStore::new());
        let client_b = SyncClient::start(store_b.clone(), adapter, bus, options("doc-1"));
        assert_eq!(
            wait_for_settled(&client_b).await,
            SyncStatus::Ready { persisted: true }
        );
        assert_eq!(
            store_b.get(&RecordId::new("shape:a")).unwrap().payload,
            json!({"x": 1})
        );
    }

    #[tokio::test]
    async fn test_hard_reset_wipes_all_partitions() {
        let adapter = SqliteAdapter::open_in_memory().unwrap();
        adapter
            .write_snapshot("doc-1", &Snapshot::new(1, HashMap::new()))
            .unwrap();

        hard_reset(&adapter, "doc-1").unwrap();
        assert!(adapter.load("doc-1").unwrap().is_empty());
    }
}
