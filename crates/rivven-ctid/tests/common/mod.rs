//! Shared fixtures for scan integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use rivven_ctid::common::{ConnectionPool, MemoryDatabase, RetryConfig};
use rivven_ctid::{
    CursorState, CursorStore, MemoryCursorStore, MemoryRowSink, Result, RowAddress, RowSink,
    ScanConfig, ScannedRow, SnapshotOrchestrator, StreamId,
};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Initialize tracing for tests
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("rivven_ctid=debug")
        .with_test_writer()
        .try_init();
}

/// Database, checkpoint store and sink shared across runs of a test.
pub struct Harness {
    pub db: MemoryDatabase,
    pub store: Arc<RecordingStore>,
    pub sink: Arc<MemoryRowSink>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_db(MemoryDatabase::new())
    }

    pub fn with_db(db: MemoryDatabase) -> Self {
        Self {
            db,
            store: Arc::new(RecordingStore::new()),
            sink: Arc::new(MemoryRowSink::new()),
        }
    }

    pub fn pool(&self, size: usize) -> Arc<ConnectionPool> {
        Arc::new(ConnectionPool::new(Arc::new(self.db.clone()), size))
    }

    pub fn orchestrator(&self, config: ScanConfig) -> SnapshotOrchestrator {
        let pool = self.pool(config.max_sessions);
        SnapshotOrchestrator::new(config, pool, self.store.clone(), self.sink.clone())
    }

    /// Orchestrator whose sink cancels `cancel` after `batches` deliveries.
    pub fn interrupted(
        &self,
        config: ScanConfig,
        batches: usize,
        cancel: &CancellationToken,
    ) -> SnapshotOrchestrator {
        let pool = self.pool(config.max_sessions);
        let sink = Arc::new(CancelAfter::new(self.sink.clone(), batches, cancel.clone()));
        SnapshotOrchestrator::new(config, pool, self.store.clone(), sink)
    }
}

/// Forwards to an inner sink and raises the cancellation signal once the
/// given number of batches went through.
pub struct CancelAfter {
    inner: Arc<MemoryRowSink>,
    remaining: AtomicUsize,
    cancel: CancellationToken,
}

impl CancelAfter {
    pub fn new(inner: Arc<MemoryRowSink>, batches: usize, cancel: CancellationToken) -> Self {
        Self {
            inner,
            remaining: AtomicUsize::new(batches),
            cancel,
        }
    }
}

#[async_trait]
impl RowSink for CancelAfter {
    async fn emit(&self, stream: &StreamId, rows: Vec<ScannedRow>) -> Result<()> {
        self.inner.emit(stream, rows).await?;
        let before = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .unwrap_or(0);
        if before <= 1 {
            self.cancel.cancel();
        }
        Ok(())
    }
}

/// Memory store that also keeps every state ever saved.
pub struct RecordingStore {
    inner: MemoryCursorStore,
    saved: Mutex<Vec<CursorState>>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryCursorStore::new(),
            saved: Mutex::new(Vec::new()),
        }
    }

    pub fn history(&self) -> Vec<CursorState> {
        self.saved.lock().clone()
    }

    pub fn clear_history(&self) {
        self.saved.lock().clear();
    }
}

#[async_trait]
impl CursorStore for RecordingStore {
    async fn save(&self, state: &CursorState) -> Result<()> {
        self.inner.save(state).await?;
        self.saved.lock().push(state.clone());
        Ok(())
    }

    async fn load(&self, stream: &StreamId) -> Result<Option<CursorState>> {
        self.inner.load(stream).await
    }

    async fn delete(&self, stream: &StreamId) -> Result<()> {
        self.inner.delete(stream).await
    }

    async fn list(&self) -> Result<Vec<StreamId>> {
        self.inner.list().await
    }
}

/// Retries with tiny, deterministic delays.
pub fn fast_retry(max_retries: u32) -> RetryConfig {
    RetryConfig::builder()
        .max_retries(max_retries)
        .retry_delay(Duration::from_millis(1))
        .max_delay(Duration::from_millis(5))
        .jitter(0.0)
        .build()
}

pub fn addresses(rows: &[ScannedRow]) -> BTreeSet<RowAddress> {
    rows.iter().map(|row| row.address).collect()
}

/// The `id` column of every row, in delivery order.
pub fn ids(rows: &[ScannedRow]) -> Vec<u64> {
    rows.iter()
        .filter_map(|row| row.values.get("id").and_then(|v| v.as_u64()))
        .collect()
}

pub fn distinct_ids(rows: &[ScannedRow]) -> BTreeSet<u64> {
    ids(rows).into_iter().collect()
}
