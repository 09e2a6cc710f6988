//! # Snapshot Orchestration
//!
//! Drives one stream's scan from start to a terminal phase.
//!
//! ```text
//!  NotStarted ──► Resolving ──► Scanning ◄──► Checkpointing
//!                    ▲             │                │
//!                    │ replan      │ plan exhausted │ cancel / fatal
//!                    └─────────────┤                ▼
//!                                  ▼            Aborting ──► Failed
//!                              Completed
//! ```
//!
//! Per chunk the order is fixed: read (retrying transient errors in place),
//! hand the rows to the sink, then persist a checkpoint. A checkpoint is
//! never written for rows the sink has not accepted, so delivery is
//! at-least-once: after a crash the rows between the last checkpoint and
//! the crash are sent again.
//!
//! ## Recovery
//!
//! | Condition | Handling |
//! |---|---|
//! | transient read error | retry same chunk with backoff, fail stream when exhausted |
//! | storage reorganized mid-scan | drop cursor, re-plan from the lowest address |
//! | saved cursor from another storage generation | drop cursor, full re-scan |
//! | table gone | fail stream |
//! | cursor regression | fail stream |
//! | cancellation | stop, last checkpoint stays authoritative |

use crate::common::{
    Chunk, ConnectionPool, CursorState, CursorStateManager, ErrorCategory, FallbackCursor,
    PhysicalStorageId, PlannedChunk, RangePlan, RangePlanner, Result, ScanConfig, ScanConnection,
    ScanError, ScanPosition, ScanStats, ScanStatsSnapshot, ScanStrategy, ScannedRow,
    SharedCursorStore, SharedRowSink, StreamDescriptor, StreamId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle phase of a stream scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanPhase {
    NotStarted,
    Resolving,
    Scanning,
    Checkpointing,
    Completed,
    Aborting,
    Failed,
}

impl ScanPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Resolving => "resolving",
            Self::Scanning => "scanning",
            Self::Checkpointing => "checkpointing",
            Self::Completed => "completed",
            Self::Aborting => "aborting",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ScanPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a scan ended before completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StopReason {
    /// The cancellation signal was raised.
    Cancelled,
    /// A fatal error for this stream.
    Error {
        code: String,
        category: ErrorCategory,
        message: String,
    },
}

impl StopReason {
    pub fn from_error(err: &ScanError) -> Self {
        match err {
            ScanError::Cancelled => Self::Cancelled,
            other => Self::Error {
                code: other.error_code().to_string(),
                category: other.category(),
                message: other.to_string(),
            },
        }
    }
}

/// Outcome of one stream scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanReport {
    pub stream: StreamId,
    pub strategy: ScanStrategy,
    /// `Completed` or `Failed`
    pub phase: ScanPhase,
    pub rows_emitted: u64,
    pub chunks_read: u64,
    pub checkpoints_written: u64,
    /// Forced re-plans after the storage was reorganized mid-scan
    pub replans: u32,
    /// The scan deliberately started over from the lowest address
    pub forced_rescan: bool,
    /// Position the next run resumes from
    pub last_checkpoint: Option<CursorState>,
    pub stop_reason: Option<StopReason>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ScanReport {
    pub fn is_completed(&self) -> bool {
        self.phase == ScanPhase::Completed
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.stop_reason, Some(StopReason::Cancelled))
    }

    /// Report for a stream whose scan could not run at all.
    pub fn failed(stream: &StreamDescriptor, err: &ScanError) -> Self {
        let now = Utc::now();
        Self {
            stream: stream.id.clone(),
            strategy: stream.strategy,
            phase: ScanPhase::Failed,
            rows_emitted: 0,
            chunks_read: 0,
            checkpoints_written: 0,
            replans: 0,
            forced_rescan: false,
            last_checkpoint: None,
            stop_reason: Some(StopReason::from_error(err)),
            started_at: now,
            finished_at: now,
        }
    }
}

/// Mutable bookkeeping for one run.
struct ScanRun {
    stream: StreamId,
    strategy: ScanStrategy,
    phase: ScanPhase,
    rows_emitted: u64,
    chunks_read: u64,
    checkpoints_written: u64,
    replans: u32,
    forced_rescan: bool,
    last_checkpoint: Option<CursorState>,
    started_at: DateTime<Utc>,
    rows_since_checkpoint: u64,
    last_checkpoint_at: Instant,
}

impl ScanRun {
    fn new(stream: &StreamDescriptor) -> Self {
        Self {
            stream: stream.id.clone(),
            strategy: stream.strategy,
            phase: ScanPhase::NotStarted,
            rows_emitted: 0,
            chunks_read: 0,
            checkpoints_written: 0,
            replans: 0,
            forced_rescan: false,
            last_checkpoint: None,
            started_at: Utc::now(),
            rows_since_checkpoint: 0,
            last_checkpoint_at: Instant::now(),
        }
    }

    fn transition(&mut self, next: ScanPhase) {
        if self.phase != next {
            debug!(stream = %self.stream, from = %self.phase, to = %next, "Scan phase transition");
            self.phase = next;
        }
    }

    fn finish(self, stop_reason: Option<StopReason>) -> ScanReport {
        ScanReport {
            stream: self.stream,
            strategy: self.strategy,
            phase: self.phase,
            rows_emitted: self.rows_emitted,
            chunks_read: self.chunks_read,
            checkpoints_written: self.checkpoints_written,
            replans: self.replans,
            forced_rescan: self.forced_rescan,
            last_checkpoint: self.last_checkpoint,
            stop_reason,
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }
}

/// Runs resumable scans of single streams.
///
/// Holds one pool slot for the whole duration of a stream's scan.
pub struct SnapshotOrchestrator {
    config: ScanConfig,
    pool: Arc<ConnectionPool>,
    store: SharedCursorStore,
    sink: SharedRowSink,
    stats: Arc<ScanStats>,
}

impl SnapshotOrchestrator {
    pub fn new(
        config: ScanConfig,
        pool: Arc<ConnectionPool>,
        store: SharedCursorStore,
        sink: SharedRowSink,
    ) -> Self {
        Self {
            config,
            pool,
            store,
            sink,
            stats: Arc::new(ScanStats::new()),
        }
    }

    /// Share counters with other orchestrators.
    pub fn with_stats(mut self, stats: Arc<ScanStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub fn stats(&self) -> ScanStatsSnapshot {
        self.stats.snapshot()
    }

    /// Scan a stream until it completes, fails or is cancelled.
    pub async fn run(&self, stream: &StreamDescriptor, cancel: CancellationToken) -> ScanReport {
        let mut run = ScanRun::new(stream);
        info!("Starting {} scan of {}", stream.strategy, stream.id);

        let stop_reason = match self.execute(stream, &cancel, &mut run).await {
            Ok(()) => {
                run.transition(ScanPhase::Completed);
                self.stats.record_completed();
                info!(
                    "Completed scan of {}: {} rows, {} chunks, {} checkpoints",
                    stream.id, run.rows_emitted, run.chunks_read, run.checkpoints_written
                );
                None
            }
            Err(err) => {
                run.transition(ScanPhase::Aborting);
                let resume_from = run
                    .last_checkpoint
                    .as_ref()
                    .and_then(CursorState::position)
                    .map_or_else(|| "the beginning".to_string(), |p| p.to_string());

                if matches!(err, ScanError::Cancelled) {
                    self.stats.record_cancelled();
                    info!(
                        "Scan of {} cancelled; next run resumes after {}",
                        stream.id, resume_from
                    );
                } else {
                    self.stats.record_failed(err.error_code());
                    error!(
                        stream = %stream.id,
                        code = err.error_code(),
                        "Scan failed: {}; next run resumes after {}",
                        err,
                        resume_from
                    );
                }
                run.transition(ScanPhase::Failed);
                Some(StopReason::from_error(&err))
            }
        };

        run.finish(stop_reason)
    }

    async fn execute(
        &self,
        stream: &StreamDescriptor,
        cancel: &CancellationToken,
        run: &mut ScanRun,
    ) -> Result<()> {
        self.config.validate()?;

        let connection = self.pool.acquire(cancel).await?;
        let version = self
            .with_retry(stream, cancel, "engine version", || connection.engine_version())
            .await?;
        ScanStrategy::for_engine(version, Some(stream.strategy))?;

        let planner = RangePlanner::new(self.config.chunk_blocks, self.config.fallback_window);
        let mut cursor =
            CursorStateManager::new(stream.id.clone(), stream.strategy, self.store.clone());

        loop {
            match self
                .scan(stream, &*connection, &planner, &mut cursor, cancel, run)
                .await
            {
                Err(ScanError::RangeInvalid { expected, found }) => {
                    run.replans += 1;
                    self.stats.record_replan(&stream.id);
                    if run.replans > self.config.max_replans {
                        return Err(ScanError::RangeInvalid { expected, found });
                    }

                    warn!(
                        stream = %stream.id,
                        "Storage reorganized mid-scan ({} -> {}); recovering with a full re-scan (replan {}/{})",
                        expected,
                        found,
                        run.replans,
                        self.config.max_replans
                    );
                    cursor.reset().await?;
                    run.forced_rescan = true;
                    run.last_checkpoint = None;
                    run.rows_since_checkpoint = 0;
                }
                other => return other,
            }
        }
    }

    /// One pass over the table, from resolution to the end of the plan.
    async fn scan(
        &self,
        stream: &StreamDescriptor,
        connection: &dyn ScanConnection,
        planner: &RangePlanner,
        cursor: &mut CursorStateManager,
        cancel: &CancellationToken,
        run: &mut ScanRun,
    ) -> Result<()> {
        run.transition(ScanPhase::Resolving);
        let storage_id = self
            .with_retry(stream, cancel, "resolve", || connection.resolve(&stream.id))
            .await?;

        let resume = match cursor.load().await? {
            Some(saved) => match cursor.resume_point(&saved, &storage_id) {
                Some(position) => {
                    info!("Resuming {} after {}", stream.id, position);
                    run.last_checkpoint = Some(saved);
                    Some(position)
                }
                None => {
                    warn!(
                        "Discarding stale cursor for {} (storage {}, strategy {}); current storage is {}, re-scanning from the lowest address",
                        stream.id, saved.physical_storage_id, saved.strategy, storage_id
                    );
                    cursor.reset().await?;
                    run.forced_rescan = true;
                    None
                }
            },
            None => None,
        };

        let plan = self
            .plan(stream, connection, planner, &storage_id, resume, cancel)
            .await?;
        debug!(
            "Planned {} chunks for {} on storage {}",
            plan.remaining(),
            stream.id,
            storage_id
        );

        cursor.begin(storage_id.clone(), resume);
        run.transition(ScanPhase::Scanning);

        for chunk in plan {
            if cancel.is_cancelled() {
                return Err(ScanError::Cancelled);
            }

            let data: Chunk = self
                .with_retry(stream, cancel, "read", || {
                    connection.read(&stream.id, &chunk)
                })
                .await?;
            data.verify(&chunk)?;
            run.chunks_read += 1;
            self.stats.record_chunk(&stream.id);
            debug!("Read {} rows from {} {}", data.len(), stream.id, chunk);

            self.deliver(stream, &storage_id, &chunk, data.rows, cursor, cancel, run)
                .await?;

            if self
                .config
                .checkpoint
                .at_chunk_end(run.last_checkpoint_at.elapsed())
            {
                self.checkpoint(
                    stream,
                    &storage_id,
                    chunk.end_position(),
                    cursor,
                    cancel,
                    run,
                )
                .await?;
            }

            if let Some(delay) = self.config.throttle_delay {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(ScanError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        cursor.complete().await
    }

    async fn plan(
        &self,
        stream: &StreamDescriptor,
        connection: &dyn ScanConnection,
        planner: &RangePlanner,
        storage_id: &PhysicalStorageId,
        resume: Option<ScanPosition>,
        cancel: &CancellationToken,
    ) -> Result<RangePlan> {
        match stream.strategy {
            ScanStrategy::Position => {
                let blocks = self
                    .with_retry(stream, cancel, "block count", || {
                        connection.block_count(&stream.id)
                    })
                    .await?;
                Ok(match resume {
                    Some(ScanPosition::Address(last)) => {
                        planner.resume_after(storage_id.clone(), blocks, last)
                    }
                    _ => planner.plan(storage_id.clone(), blocks),
                })
            }
            ScanStrategy::Fallback => {
                let ceiling = self
                    .with_retry(stream, cancel, "watermark", || {
                        connection.visibility_watermark()
                    })
                    .await?;
                let saved = match resume {
                    Some(ScanPosition::Visibility(watermark)) => watermark,
                    _ => 0,
                };
                // Bounds are taken after the watermark, so every row at or
                // below the ceiling has already committed.
                let bounds = self
                    .with_retry(stream, cancel, "visibility bounds", || {
                        connection.visibility_bounds(&stream.id)
                    })
                    .await?;
                let (floor, ceiling) = match bounds {
                    Some((low, high)) => (saved.max(low.saturating_sub(1)), ceiling.min(high)),
                    None => (saved, saved),
                };
                debug!(
                    "Visibility plan for {}: ({}, {}]",
                    stream.id, floor, ceiling
                );
                Ok(planner.plan_visibility(floor, ceiling.max(floor)))
            }
        }
    }

    /// Hand a chunk's rows to the sink, checkpointing every N rows if asked to.
    #[allow(clippy::too_many_arguments)]
    async fn deliver(
        &self,
        stream: &StreamDescriptor,
        storage_id: &PhysicalStorageId,
        chunk: &PlannedChunk,
        mut rows: Vec<ScannedRow>,
        cursor: &mut CursorStateManager,
        cancel: &CancellationToken,
        run: &mut ScanRun,
    ) -> Result<()> {
        let every_rows = self.config.checkpoint.every_rows;

        while !rows.is_empty() {
            let take = match every_rows {
                Some(n) => (n.saturating_sub(run.rows_since_checkpoint) as usize).clamp(1, rows.len()),
                None => rows.len(),
            };
            let rest = rows.split_off(take);
            let batch = std::mem::replace(&mut rows, rest);

            let position = batch.last().map(|last| match chunk {
                PlannedChunk::Position { .. } => ScanPosition::Address(last.address),
                PlannedChunk::Fallback { .. } => {
                    ScanPosition::Visibility(FallbackCursor::after_rows(last, rows.first()).watermark)
                }
            });

            let count = batch.len() as u64;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ScanError::Cancelled),
                result = self.sink.emit(&stream.id, batch) => result?,
            }
            run.rows_emitted += count;
            run.rows_since_checkpoint += count;
            self.stats.record_rows(&stream.id, count);

            if let (Some(n), Some(position)) = (every_rows, position) {
                if run.rows_since_checkpoint >= n {
                    self.checkpoint(stream, storage_id, position, cursor, cancel, run)
                        .await?;
                }
            }
        }

        Ok(())
    }

    async fn checkpoint(
        &self,
        stream: &StreamDescriptor,
        storage_id: &PhysicalStorageId,
        position: ScanPosition,
        cursor: &mut CursorStateManager,
        cancel: &CancellationToken,
        run: &mut ScanRun,
    ) -> Result<()> {
        run.transition(ScanPhase::Checkpointing);

        let state = cursor.emit_position(storage_id, position)?;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ScanError::Cancelled),
            result = cursor.persist(&state) => result?,
        }

        run.checkpoints_written += 1;
        run.rows_since_checkpoint = 0;
        run.last_checkpoint_at = Instant::now();
        run.last_checkpoint = Some(state);
        self.stats.record_checkpoint(&stream.id);
        debug!("Checkpointed {} at {}", stream.id, position);

        run.transition(ScanPhase::Scanning);
        Ok(())
    }

    /// Run `op`, retrying transient errors with backoff. Cancellation wins
    /// over both the operation and the backoff sleep.
    async fn with_retry<T, F, Fut>(
        &self,
        stream: &StreamDescriptor,
        cancel: &CancellationToken,
        what: &str,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let retry = &self.config.retry;
        let mut attempt = 0u32;

        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ScanError::Cancelled),
                result = op() => result,
            };

            match result {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retriable() => {
                    if !retry.should_retry(attempt) {
                        return Err(ScanError::RetriesExhausted {
                            attempts: attempt + 1,
                            last: err.to_string(),
                        });
                    }
                    let delay = retry.delay_for_attempt(attempt);
                    attempt += 1;
                    self.stats.record_retry(&stream.id);
                    warn!(
                        "Transient error during {} of {} (retry {}/{} in {:?}): {}",
                        what,
                        stream.id,
                        attempt,
                        retry.max_retries(),
                        delay,
                        err
                    );

                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(ScanError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}
