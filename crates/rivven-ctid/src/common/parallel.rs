//! # Parallel Scans
//!
//! Runs many streams concurrently, one tokio task per stream.
//!
//! Streams share nothing but the connection pool, the cursor store and the
//! sink. A stream that fails (or panics) produces a `Failed` report for
//! itself only; its siblings run to completion. How many streams actually
//! read at once is bounded by the pool, the rest wait for admission.
//!
//! ## Usage
//!
//! ```ignore
//! use rivven_ctid::common::{ParallelScanner, ScanConfig};
//!
//! let scanner = ParallelScanner::new(ScanConfig::default(), pool, store, sink);
//! let reports = scanner.run(streams, CancellationToken::new()).await;
//! for report in reports.iter().filter(|r| !r.is_completed()) {
//!     eprintln!("{} stopped: {:?}", report.stream, report.stop_reason);
//! }
//! ```

use crate::common::{
    ConnectionPool, ScanConfig, ScanError, ScanReport, ScanStatsSnapshot, SharedCursorStore,
    SharedRowSink, SnapshotOrchestrator, StreamDescriptor,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Scans a set of streams concurrently.
pub struct ParallelScanner {
    orchestrator: Arc<SnapshotOrchestrator>,
}

impl ParallelScanner {
    pub fn new(
        config: ScanConfig,
        pool: Arc<ConnectionPool>,
        store: SharedCursorStore,
        sink: SharedRowSink,
    ) -> Self {
        Self::from_orchestrator(SnapshotOrchestrator::new(config, pool, store, sink))
    }

    pub fn from_orchestrator(orchestrator: SnapshotOrchestrator) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
        }
    }

    pub fn stats(&self) -> ScanStatsSnapshot {
        self.orchestrator.stats()
    }

    /// Scan every stream; reports come back in input order.
    ///
    /// Cancelling `cancel` stops all streams; each one gets a child token.
    pub async fn run(
        &self,
        streams: Vec<StreamDescriptor>,
        cancel: CancellationToken,
    ) -> Vec<ScanReport> {
        info!("Scanning {} streams in parallel", streams.len());

        let handles: Vec<_> = streams
            .into_iter()
            .map(|stream| {
                let orchestrator = self.orchestrator.clone();
                let token = cancel.child_token();
                let task_stream = stream.clone();
                let handle =
                    tokio::spawn(async move { orchestrator.run(&task_stream, token).await });
                (stream, handle)
            })
            .collect();

        let mut reports = Vec::with_capacity(handles.len());
        for (stream, handle) in handles {
            let report = match handle.await {
                Ok(report) => report,
                Err(e) => {
                    error!("Scan task for {} aborted: {}", stream.id, e);
                    ScanReport::failed(
                        &stream,
                        &ScanError::other(format!("scan task aborted: {}", e)),
                    )
                }
            };
            reports.push(report);
        }

        let completed = reports.iter().filter(|r| r.is_completed()).count();
        info!(
            "Parallel scan finished: {} completed, {} stopped",
            completed,
            reports.len() - completed
        );
        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{MemoryCursorStore, MemoryDatabase, MemoryRowSink, ScanPhase};

    #[tokio::test]
    async fn test_failure_is_isolated() {
        let db = MemoryDatabase::new();
        let sink = Arc::new(MemoryRowSink::new());
        let good = StreamDescriptor::new("public", "good");
        let missing = StreamDescriptor::new("public", "missing");
        db.create_table(&good.id, 10);
        db.populate(&good.id, 30, 3).unwrap();

        let pool = Arc::new(ConnectionPool::new(Arc::new(db.clone()), 2));
        let scanner = ParallelScanner::new(
            ScanConfig::default(),
            pool,
            Arc::new(MemoryCursorStore::new()),
            sink.clone(),
        );

        let reports = scanner
            .run(vec![missing.clone(), good.clone()], CancellationToken::new())
            .await;

        assert_eq!(reports[0].stream, missing.id);
        assert_eq!(reports[0].phase, ScanPhase::Failed);
        assert_eq!(reports[1].phase, ScanPhase::Completed);
        assert_eq!(sink.count(&good.id).await, 30);

        let stats = scanner.stats();
        assert_eq!(stats.streams_completed, 1);
        assert_eq!(stats.streams_failed, 1);
    }
}
