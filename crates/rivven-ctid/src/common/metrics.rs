//! # Scan Metrics
//!
//! Lock-free counters for table scans, mirrored to the `metrics` facade
//! so any installed exporter (Prometheus, StatsD, ...) picks them up.
//!
//! | Metric | Labels |
//! |---|---|
//! | `rivven_ctid_rows_total` | `stream` |
//! | `rivven_ctid_chunks_total` | `stream` |
//! | `rivven_ctid_checkpoints_total` | `stream` |
//! | `rivven_ctid_read_retries_total` | `stream` |
//! | `rivven_ctid_replans_total` | `stream` |
//! | `rivven_ctid_streams_completed_total` | |
//! | `rivven_ctid_streams_failed_total` | `code` |
//! | `rivven_ctid_streams_cancelled_total` | |

use crate::common::StreamId;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Scan counters shared by every stream of a run.
#[derive(Debug)]
pub struct ScanStats {
    start_time: Instant,
    rows: AtomicU64,
    chunks: AtomicU64,
    checkpoints: AtomicU64,
    retries: AtomicU64,
    replans: AtomicU64,
    streams_completed: AtomicU64,
    streams_failed: AtomicU64,
    streams_cancelled: AtomicU64,
}

impl Default for ScanStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            rows: AtomicU64::new(0),
            chunks: AtomicU64::new(0),
            checkpoints: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            replans: AtomicU64::new(0),
            streams_completed: AtomicU64::new(0),
            streams_failed: AtomicU64::new(0),
            streams_cancelled: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn record_rows(&self, stream: &StreamId, rows: u64) {
        self.rows.fetch_add(rows, Ordering::Relaxed);
        metrics::counter!("rivven_ctid_rows_total", "stream" => stream.full_name())
            .increment(rows);
    }

    #[inline]
    pub fn record_chunk(&self, stream: &StreamId) {
        self.chunks.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("rivven_ctid_chunks_total", "stream" => stream.full_name())
            .increment(1);
    }

    #[inline]
    pub fn record_checkpoint(&self, stream: &StreamId) {
        self.checkpoints.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("rivven_ctid_checkpoints_total", "stream" => stream.full_name())
            .increment(1);
    }

    pub fn record_retry(&self, stream: &StreamId) {
        self.retries.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("rivven_ctid_read_retries_total", "stream" => stream.full_name())
            .increment(1);
    }

    pub fn record_replan(&self, stream: &StreamId) {
        self.replans.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("rivven_ctid_replans_total", "stream" => stream.full_name())
            .increment(1);
    }

    pub fn record_completed(&self) {
        self.streams_completed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("rivven_ctid_streams_completed_total").increment(1);
    }

    pub fn record_failed(&self, code: &'static str) {
        self.streams_failed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("rivven_ctid_streams_failed_total", "code" => code).increment(1);
    }

    pub fn record_cancelled(&self) {
        self.streams_cancelled.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("rivven_ctid_streams_cancelled_total").increment(1);
    }

    pub fn snapshot(&self) -> ScanStatsSnapshot {
        let elapsed_secs = self.start_time.elapsed().as_secs_f64().max(0.001);
        let rows = self.rows.load(Ordering::Relaxed);

        ScanStatsSnapshot {
            rows,
            chunks: self.chunks.load(Ordering::Relaxed),
            checkpoints: self.checkpoints.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            replans: self.replans.load(Ordering::Relaxed),
            streams_completed: self.streams_completed.load(Ordering::Relaxed),
            streams_failed: self.streams_failed.load(Ordering::Relaxed),
            streams_cancelled: self.streams_cancelled.load(Ordering::Relaxed),
            rows_per_second: rows as f64 / elapsed_secs,
        }
    }
}

/// Point-in-time copy of [`ScanStats`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanStatsSnapshot {
    pub rows: u64,
    pub chunks: u64,
    pub checkpoints: u64,
    pub retries: u64,
    pub replans: u64,
    pub streams_completed: u64,
    pub streams_failed: u64,
    pub streams_cancelled: u64,
    pub rows_per_second: f64,
}
