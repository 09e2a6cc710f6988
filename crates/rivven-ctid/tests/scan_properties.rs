//! End-to-end scan behavior against the in-memory engine.
//!
//! Covers completeness, resumability after interruption, storage
//! reorganization between and during runs, retries, cancellation and the
//! fallback strategy.
//!
//! ```bash
//! cargo test -p rivven-ctid --test scan_properties
//! ```

mod common;

use common::{addresses, distinct_ids, fast_retry, ids, init_tracing, Harness};
use pretty_assertions::assert_eq;
use rivven_ctid::common::{describe_stream, EngineVersion, MemoryDatabase, PlannedChunk};
use rivven_ctid::{
    CheckpointPolicy, ChunkReader, CursorStore, FileCursorStore, MemoryRowSink, ParallelScanner,
    RowAddress, ScanConfig, ScanConnector, ScanPhase, ScanPosition, ScanRange, ScanStrategy,
    SnapshotOrchestrator, StopReason, StreamDescriptor, StreamId, VisibilityWindow,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn orders() -> StreamDescriptor {
    StreamDescriptor::new("public", "orders")
}

fn chunked(blocks: u64) -> ScanConfig {
    ScanConfig::builder()
        .chunk_blocks(blocks)
        .retry(fast_retry(3))
        .build()
}

fn stop_code(report: &rivven_ctid::ScanReport) -> Option<String> {
    match &report.stop_reason {
        Some(StopReason::Error { code, .. }) => Some(code.clone()),
        _ => None,
    }
}

// ============================================================================
// Completeness
// ============================================================================

#[tokio::test]
async fn test_every_row_delivered_in_address_order() -> anyhow::Result<()> {
    init_tracing();
    let h = Harness::new();
    h.db.create_table(&orders().id, 10);
    h.db.populate(&orders().id, 1_000, 25)?;

    let report = h
        .orchestrator(chunked(7))
        .run(&orders(), CancellationToken::new())
        .await;

    assert!(report.is_completed());
    assert_eq!(report.rows_emitted, 1_000);
    assert_eq!(report.chunks_read, 15);
    assert_eq!(report.checkpoints_written, 15);
    assert!(!report.forced_rescan);

    let delivered = h.sink.rows(&orders().id).await;
    assert_eq!(delivered, h.db.rows(&orders().id));
    Ok(())
}

#[tokio::test]
async fn test_deleted_rows_leave_gaps_not_errors() -> anyhow::Result<()> {
    let h = Harness::new();
    h.db.create_table(&orders().id, 10);
    h.db.populate(&orders().id, 100, 10)?;
    for block in 0..10 {
        h.db.delete(&orders().id, RowAddress::new(block, 3))?;
    }
    // Block 4 is empty
    for slot in 1..=10 {
        h.db.delete(&orders().id, RowAddress::new(4, slot))?;
    }

    let report = h
        .orchestrator(chunked(2))
        .run(&orders(), CancellationToken::new())
        .await;

    assert!(report.is_completed());
    assert_eq!(report.rows_emitted, 81);
    assert_eq!(
        addresses(&h.sink.rows(&orders().id).await),
        addresses(&h.db.rows(&orders().id))
    );
    Ok(())
}

#[tokio::test]
async fn test_table_with_no_live_rows() -> anyhow::Result<()> {
    let h = Harness::new();
    h.db.create_table(&orders().id, 10);
    h.db.populate(&orders().id, 30, 30)?;
    for block in 0..3 {
        for slot in 1..=10 {
            h.db.delete(&orders().id, RowAddress::new(block, slot))?;
        }
    }

    let report = h
        .orchestrator(chunked(1))
        .run(&orders(), CancellationToken::new())
        .await;

    assert!(report.is_completed());
    assert_eq!(report.rows_emitted, 0);
    assert_eq!(report.chunks_read, 3);
    // Dead blocks still advance the cursor; only a zero-block table skips checkpoints
    assert_eq!(report.checkpoints_written, 3);
    assert_eq!(h.sink.count(&orders().id).await, 0);
    Ok(())
}

#[tokio::test]
async fn test_empty_table_reads_nothing() -> anyhow::Result<()> {
    let h = Harness::new();
    h.db.create_table(&orders().id, 10);

    let report = h
        .orchestrator(chunked(4))
        .run(&orders(), CancellationToken::new())
        .await;

    assert_eq!(report.phase, ScanPhase::Completed);
    assert_eq!(report.chunks_read, 0);
    assert!(h.db.reads().is_empty());
    assert!(h.store.history().is_empty());
    Ok(())
}

// ============================================================================
// Resumability
// ============================================================================

#[tokio::test]
async fn test_resume_after_cancellation() -> anyhow::Result<()> {
    init_tracing();
    let h = Harness::new();
    h.db.create_table(&orders().id, 10);
    h.db.populate(&orders().id, 500, 10)?;

    // The third chunk is delivered but its checkpoint loses to the signal
    let cancel = CancellationToken::new();
    let first = h.interrupted(chunked(10), 3, &cancel).run(&orders(), cancel).await;

    assert_eq!(first.phase, ScanPhase::Failed);
    assert!(first.is_cancelled());
    assert_eq!(first.rows_emitted, 300);
    assert_eq!(first.checkpoints_written, 2);
    let saved = h
        .store
        .load(&orders().id)
        .await?
        .expect("cursor persisted");
    assert_eq!(saved.last_address, Some(RowAddress::block_end(19)));

    h.db.clear_reads();
    let second = h
        .orchestrator(chunked(10))
        .run(&orders(), CancellationToken::new())
        .await;

    assert!(second.is_completed());
    assert!(!second.forced_rescan);
    assert_eq!(second.rows_emitted, 300);
    let reads = h.db.reads();
    assert_eq!(
        reads[0].chunk,
        PlannedChunk::Position {
            storage_id: h.db.storage_id_of(&orders().id).expect("table"),
            range: ScanRange::blocks(20, 30),
        }
    );

    // At-least-once: the interrupted chunk is delivered twice, nothing is lost
    let delivered = h.sink.rows(&orders().id).await;
    assert_eq!(delivered.len(), 600);
    assert_eq!(distinct_ids(&delivered).len(), 500);
    assert!(h.store.load(&orders().id).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_large_table_resumes_at_next_chunk() -> anyhow::Result<()> {
    init_tracing();
    let h = Harness::new();
    h.db.create_table(&orders().id, 100);
    h.db.populate(&orders().id, 250_000, 1_000)?;
    // 100 blocks of 100 rows: 10,000 rows per chunk, 25 chunks
    let config = || chunked(100);

    let cancel = CancellationToken::new();
    let first = h.interrupted(config(), 13, &cancel).run(&orders(), cancel).await;

    assert!(first.is_cancelled());
    assert_eq!(first.checkpoints_written, 12);
    let checkpoint = first.last_checkpoint.clone().expect("checkpoint");
    assert_eq!(checkpoint.last_address, Some(RowAddress::block_end(1_199)));

    h.db.clear_reads();
    let second = h.orchestrator(config()).run(&orders(), CancellationToken::new()).await;

    assert!(second.is_completed());
    assert_eq!(second.chunks_read, 13);
    assert_eq!(second.rows_emitted, 130_000);

    let reads = h.db.reads();
    match &reads[0].chunk {
        PlannedChunk::Position { range, .. } => {
            assert_eq!(range.lower, RowAddress::block_start(1_200));
            assert_eq!(range.upper, RowAddress::block_start(1_300));
        }
        other => panic!("expected a position chunk, got {}", other),
    }

    let delivered = h.sink.rows(&orders().id).await;
    assert_eq!(distinct_ids(&delivered).len(), 250_000);
    assert_eq!(delivered.len(), 260_000);
    Ok(())
}

#[tokio::test]
async fn test_resume_mid_block_after_row_checkpoint() -> anyhow::Result<()> {
    let h = Harness::new();
    h.db.create_table(&orders().id, 10);
    h.db.populate(&orders().id, 100, 10)?;

    let config = || {
        ScanConfig::builder()
            .chunk_blocks(5)
            .checkpoint(CheckpointPolicy::every_rows(15))
            .build()
    };

    // 15 rows, checkpoint at (1,5); then 15 more and cancel
    let cancel = CancellationToken::new();
    let first = h.interrupted(config(), 2, &cancel).run(&orders(), cancel).await;
    assert!(first.is_cancelled());
    assert_eq!(first.rows_emitted, 30);
    assert_eq!(
        first.last_checkpoint.and_then(|s| s.last_address),
        Some(RowAddress::new(1, 5))
    );

    h.db.clear_reads();
    let second = h.orchestrator(config()).run(&orders(), CancellationToken::new()).await;
    assert!(second.is_completed());
    assert_eq!(second.rows_emitted, 85);

    match &h.db.reads()[0].chunk {
        PlannedChunk::Position { range, .. } => {
            assert_eq!(range.lower, RowAddress::new(1, 6));
            assert_eq!(range.upper, RowAddress::block_start(5));
        }
        other => panic!("expected a position chunk, got {}", other),
    }
    assert_eq!(distinct_ids(&h.sink.rows(&orders().id).await).len(), 100);
    Ok(())
}

#[tokio::test]
async fn test_file_store_resume_across_processes() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = MemoryDatabase::new();
    db.create_table(&orders().id, 10);
    db.populate(&orders().id, 200, 10)?;
    let sink = Arc::new(MemoryRowSink::new());

    {
        let store = Arc::new(FileCursorStore::new(dir.path()).await?);
        let cancel = CancellationToken::new();
        let interrupting = Arc::new(common::CancelAfter::new(sink.clone(), 2, cancel.clone()));
        let orchestrator = SnapshotOrchestrator::new(
            chunked(5),
            Arc::new(rivven_ctid::common::ConnectionPool::new(Arc::new(db.clone()), 1)),
            store,
            interrupting,
        );
        let report = orchestrator.run(&orders(), cancel).await;
        assert!(report.is_cancelled());
    }

    // A fresh store reads the checkpoint back from disk
    let store = Arc::new(FileCursorStore::new(dir.path()).await?);
    let saved = store.load(&orders().id).await?.expect("cursor on disk");
    assert_eq!(saved.position(), Some(ScanPosition::Address(RowAddress::block_end(4))));

    let orchestrator = SnapshotOrchestrator::new(
        chunked(5),
        Arc::new(rivven_ctid::common::ConnectionPool::new(Arc::new(db.clone()), 1)),
        store.clone(),
        sink.clone(),
    );
    let report = orchestrator.run(&orders(), CancellationToken::new()).await;

    assert!(report.is_completed());
    assert_eq!(report.rows_emitted, 150);
    assert!(store.list().await?.is_empty());
    assert_eq!(distinct_ids(&sink.rows(&orders().id).await).len(), 200);
    Ok(())
}

// ============================================================================
// Storage reorganization
// ============================================================================

#[tokio::test]
async fn test_reorganized_between_runs_rescans_from_start() -> anyhow::Result<()> {
    init_tracing();
    let h = Harness::new();
    let original = h.db.create_table(&orders().id, 10);
    h.db.populate(&orders().id, 300, 10)?;

    let cancel = CancellationToken::new();
    let first = h.interrupted(chunked(10), 2, &cancel).run(&orders(), cancel).await;
    assert!(first.is_cancelled());
    assert_eq!(
        first.last_checkpoint.as_ref().map(|s| &s.physical_storage_id),
        Some(&original)
    );

    for slot in 1..=10 {
        h.db.delete(&orders().id, RowAddress::new(0, slot))?;
    }
    let rewritten = h.db.reorganize(&orders().id)?;
    assert_ne!(rewritten, original);

    h.db.clear_reads();
    h.sink.clear().await;
    let second = h.orchestrator(chunked(10)).run(&orders(), CancellationToken::new()).await;

    assert!(second.is_completed());
    assert!(second.forced_rescan);
    assert_eq!(
        h.db.reads()[0].chunk,
        PlannedChunk::Position {
            storage_id: rewritten,
            range: ScanRange::blocks(0, 10),
        }
    );
    assert_eq!(h.sink.rows(&orders().id).await, h.db.rows(&orders().id));
    assert_eq!(second.rows_emitted, 290);
    Ok(())
}

#[tokio::test]
async fn test_reorganized_mid_scan_replans() -> anyhow::Result<()> {
    init_tracing();
    let h = Harness::new();
    h.db.create_table(&orders().id, 10);
    h.db.populate(&orders().id, 200, 10)?;
    h.db.reorganize_on_read(&orders().id, 3);

    let orchestrator = h.orchestrator(chunked(5));
    let report = orchestrator.run(&orders(), CancellationToken::new()).await;

    assert!(report.is_completed());
    assert_eq!(report.replans, 1);
    assert!(report.forced_rescan);
    assert_eq!(report.chunks_read, 6);
    assert_eq!(report.rows_emitted, 300);
    assert_eq!(orchestrator.stats().replans, 1);

    let rewritten = h.db.storage_id_of(&orders().id).expect("table");
    let reads = h.db.reads();
    assert_eq!(
        reads[2].chunk,
        PlannedChunk::Position {
            storage_id: rewritten,
            range: ScanRange::blocks(0, 5),
        }
    );
    assert_eq!(distinct_ids(&h.sink.rows(&orders().id).await).len(), 200);
    Ok(())
}

#[tokio::test]
async fn test_replan_budget_exhausted() -> anyhow::Result<()> {
    let h = Harness::new();
    h.db.create_table(&orders().id, 10);
    h.db.populate(&orders().id, 100, 10)?;
    h.db.reorganize_on_read(&orders().id, 2);

    let config = ScanConfig::builder().chunk_blocks(5).max_replans(0).build();
    let report = h.orchestrator(config).run(&orders(), CancellationToken::new()).await;

    assert_eq!(report.phase, ScanPhase::Failed);
    assert_eq!(stop_code(&report).as_deref(), Some("range_invalid"));
    assert_eq!(report.rows_emitted, 50);
    Ok(())
}

#[tokio::test]
async fn test_replan_restarts_row_checkpoint_count() -> anyhow::Result<()> {
    let h = Harness::new();
    h.db.create_table(&orders().id, 10);
    h.db.populate(&orders().id, 100, 10)?;
    h.db.reorganize_on_read(&orders().id, 2);

    let config = ScanConfig::builder()
        .chunk_blocks(1)
        .checkpoint(CheckpointPolicy {
            every_chunk: false,
            every_rows: Some(15),
            interval: None,
        })
        .build();
    let report = h.orchestrator(config).run(&orders(), CancellationToken::new()).await;

    assert!(report.is_completed());
    assert_eq!(report.replans, 1);
    // Rows read before the rewrite do not count toward the first checkpoint
    assert_eq!(h.store.history()[0].last_address, Some(RowAddress::new(1, 5)));
    assert_eq!(distinct_ids(&h.sink.rows(&orders().id).await).len(), 100);
    Ok(())
}

// ============================================================================
// Checkpoint monotonicity
// ============================================================================

#[tokio::test]
async fn test_checkpoints_never_move_backwards() -> anyhow::Result<()> {
    let h = Harness::new();
    let storage = h.db.create_table(&orders().id, 7);
    h.db.populate(&orders().id, 400, 3)?;

    let config = ScanConfig::builder()
        .chunk_blocks(4)
        .checkpoint(CheckpointPolicy {
            every_chunk: true,
            every_rows: Some(11),
            interval: None,
        })
        .build();
    let report = h.orchestrator(config).run(&orders(), CancellationToken::new()).await;
    assert!(report.is_completed());

    let history = h.store.history();
    assert!(history.len() as u64 == report.checkpoints_written);
    assert!(history.iter().all(|s| s.physical_storage_id == storage));

    let positions: Vec<_> = history.iter().filter_map(|s| s.position()).collect();
    assert_eq!(positions.len(), history.len());
    assert!(positions.windows(2).all(|w| w[0] <= w[1]));
    Ok(())
}

#[tokio::test]
async fn test_reread_of_same_chunk_is_identical() -> anyhow::Result<()> {
    let db = MemoryDatabase::new();
    let storage = db.create_table(&orders().id, 10);
    db.populate(&orders().id, 55, 5)?;

    let connection = db.connect().await?;
    let chunk = PlannedChunk::Position {
        storage_id: storage,
        range: ScanRange::blocks(2, 5),
    };
    let first = connection.read(&orders().id, &chunk).await?;
    let second = connection.read(&orders().id, &chunk).await?;

    assert_eq!(first, second);
    assert_eq!(first.len(), 30);
    first.verify(&chunk)?;
    Ok(())
}

// ============================================================================
// Failures and retries
// ============================================================================

#[tokio::test]
async fn test_transient_read_errors_are_retried() -> anyhow::Result<()> {
    let h = Harness::new();
    h.db.create_table(&orders().id, 10);
    h.db.populate(&orders().id, 60, 10)?;
    h.db.fail_next_reads(2);

    let orchestrator = h.orchestrator(chunked(2));
    let report = orchestrator.run(&orders(), CancellationToken::new()).await;

    assert!(report.is_completed());
    assert_eq!(report.rows_emitted, 60);
    assert_eq!(h.db.failed_reads(), 2);
    assert_eq!(orchestrator.stats().retries, 2);
    Ok(())
}

#[tokio::test]
async fn test_retry_budget_exhausted() -> anyhow::Result<()> {
    let h = Harness::new();
    h.db.create_table(&orders().id, 10);
    h.db.populate(&orders().id, 60, 10)?;
    h.db.fail_next_reads(10);

    let config = ScanConfig::builder()
        .chunk_blocks(2)
        .retry(fast_retry(2))
        .build();
    let orchestrator = h.orchestrator(config);
    let report = orchestrator.run(&orders(), CancellationToken::new()).await;

    assert_eq!(report.phase, ScanPhase::Failed);
    assert_eq!(stop_code(&report).as_deref(), Some("retries_exhausted"));
    assert_eq!(h.db.failed_reads(), 3);
    assert_eq!(report.rows_emitted, 0);
    assert_eq!(orchestrator.stats().streams_failed, 1);
    Ok(())
}

#[tokio::test]
async fn test_missing_table_fails_stream() -> anyhow::Result<()> {
    let h = Harness::new();
    let report = h
        .orchestrator(chunked(2))
        .run(&orders(), CancellationToken::new())
        .await;

    assert_eq!(report.phase, ScanPhase::Failed);
    assert_eq!(stop_code(&report).as_deref(), Some("storage_unavailable"));
    assert!(report.last_checkpoint.is_none());
    Ok(())
}

#[tokio::test]
async fn test_dropped_table_keeps_cursor() -> anyhow::Result<()> {
    let h = Harness::new();
    h.db.create_table(&orders().id, 10);
    h.db.populate(&orders().id, 100, 10)?;

    let cancel = CancellationToken::new();
    h.interrupted(chunked(2), 2, &cancel).run(&orders(), cancel).await;
    let saved = h.store.load(&orders().id).await?;
    assert!(saved.is_some());

    h.db.drop_table(&orders().id);
    let report = h.orchestrator(chunked(2)).run(&orders(), CancellationToken::new()).await;

    assert_eq!(stop_code(&report).as_deref(), Some("storage_unavailable"));
    assert_eq!(h.store.load(&orders().id).await?, saved);
    Ok(())
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn test_cancel_interrupts_slow_read() -> anyhow::Result<()> {
    let h = Harness::new();
    h.db.create_table(&orders().id, 10);
    h.db.populate(&orders().id, 100, 10)?;
    h.db.set_read_delay(Some(Duration::from_secs(30)));

    let orchestrator = h.orchestrator(chunked(2));
    let stream = orders();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let canceller = async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    };

    let (report, ()) = tokio::time::timeout(Duration::from_secs(5), async {
        tokio::join!(orchestrator.run(&stream, cancel), canceller)
    })
    .await?;

    assert!(report.is_cancelled());
    assert_eq!(report.chunks_read, 0);
    assert_eq!(orchestrator.stats().streams_cancelled, 1);
    Ok(())
}

#[tokio::test]
async fn test_cancelled_before_start() -> anyhow::Result<()> {
    let h = Harness::new();
    h.db.create_table(&orders().id, 10);
    h.db.populate(&orders().id, 10, 10)?;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = h.orchestrator(chunked(2)).run(&orders(), cancel).await;

    assert!(report.is_cancelled());
    assert_eq!(report.phase, ScanPhase::Failed);
    assert!(h.db.reads().is_empty());
    assert_eq!(h.db.max_open_connections(), 0);
    Ok(())
}

// ============================================================================
// Fallback strategy
// ============================================================================

async fn fallback_harness() -> anyhow::Result<(Harness, StreamDescriptor)> {
    let h = Harness::with_db(MemoryDatabase::with_version(EngineVersion::new(11, 22)));
    h.db.create_table(&orders().id, 10);
    // Visibility values 1..=10, ten rows each
    h.db.populate(&orders().id, 100, 10)?;

    let connection = h.db.connect().await?;
    let stream = describe_stream(&*connection, orders().id, &ScanConfig::default()).await?;
    Ok((h, stream))
}

fn windowed(width: u64) -> ScanConfig {
    ScanConfig::builder()
        .fallback_window(width)
        .retry(fast_retry(3))
        .build()
}

#[tokio::test]
async fn test_fallback_scan_orders_by_visibility() -> anyhow::Result<()> {
    init_tracing();
    let (h, stream) = fallback_harness().await?;
    assert_eq!(stream.strategy, ScanStrategy::Fallback);
    // Row 1 moves to the end with visibility 11
    h.db.update(&stream.id, RowAddress::new(0, 1), serde_json::json!({"id": 1}))?;

    let report = h.orchestrator(windowed(3)).run(&stream, CancellationToken::new()).await;

    assert!(report.is_completed());
    assert_eq!(report.strategy, ScanStrategy::Fallback);
    assert_eq!(report.rows_emitted, 100);
    assert_eq!(report.chunks_read, 4);

    let delivered = h.sink.rows(&stream.id).await;
    assert!(delivered.windows(2).all(|w| w[0].visibility <= w[1].visibility));
    assert_eq!(ids(&delivered).last(), Some(&1));
    Ok(())
}

#[tokio::test]
async fn test_fallback_row_checkpoints_do_not_split_transactions() -> anyhow::Result<()> {
    let (h, stream) = fallback_harness().await?;

    let config = ScanConfig::builder()
        .fallback_window(3)
        .checkpoint(CheckpointPolicy::every_rows(4))
        .build();
    let report = h.orchestrator(config).run(&stream, CancellationToken::new()).await;
    assert!(report.is_completed());

    let watermarks: Vec<u64> = h
        .store
        .history()
        .iter()
        .filter_map(|s| s.fallback_watermark)
        .collect();
    assert_eq!(watermarks.len() as u64, report.checkpoints_written);
    assert!(watermarks.windows(2).all(|w| w[0] <= w[1]));
    // Rows 1-4 share visibility 1 with row 5, so the first cursor stays below it
    assert_eq!(watermarks[0], 0);
    Ok(())
}

#[tokio::test]
async fn test_fallback_resume_survives_reorganization() -> anyhow::Result<()> {
    let (h, stream) = fallback_harness().await?;

    let cancel = CancellationToken::new();
    let first = h.interrupted(windowed(3), 2, &cancel).run(&stream, cancel).await;
    assert!(first.is_cancelled());
    assert_eq!(
        first.last_checkpoint.as_ref().and_then(|s| s.fallback_watermark),
        Some(3)
    );

    h.db.reorganize(&stream.id)?;
    h.db.clear_reads();
    let second = h.orchestrator(windowed(3)).run(&stream, CancellationToken::new()).await;

    assert!(second.is_completed());
    assert!(!second.forced_rescan);
    assert_eq!(
        h.db.reads()[0].chunk,
        PlannedChunk::Fallback {
            window: VisibilityWindow::new(3, 6),
        }
    );
    assert_eq!(second.rows_emitted, 70);
    assert_eq!(distinct_ids(&h.sink.rows(&stream.id).await).len(), 100);
    Ok(())
}

#[tokio::test]
async fn test_position_strategy_refused_on_old_engine() -> anyhow::Result<()> {
    let db = MemoryDatabase::with_version(EngineVersion::new(11, 22));
    db.create_table(&orders().id, 10);
    let connection = db.connect().await?;

    let config = ScanConfig::builder()
        .strategy_override(ScanStrategy::Position)
        .build();
    let err = describe_stream(&*connection, orders().id, &config)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "config_error");
    Ok(())
}

#[tokio::test]
async fn test_position_descriptor_fails_on_old_engine() -> anyhow::Result<()> {
    let h = Harness::with_db(MemoryDatabase::with_version(EngineVersion::new(11, 22)));
    h.db.create_table(&orders().id, 10);
    h.db.populate(&orders().id, 30, 10)?;
    assert_eq!(orders().strategy, ScanStrategy::Position);

    let report = h.orchestrator(chunked(2)).run(&orders(), CancellationToken::new()).await;

    assert_eq!(report.phase, ScanPhase::Failed);
    assert_eq!(stop_code(&report).as_deref(), Some("config_error"));
    assert!(h.db.reads().is_empty());
    assert!(h.store.history().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_fallback_never_passes_open_transaction() -> anyhow::Result<()> {
    let h = Harness::with_db(MemoryDatabase::with_version(EngineVersion::new(11, 22)));
    let id = orders().id;
    h.db.create_table(&id, 10);
    h.db.populate(&id, 20, 1)?;
    let xid = h.db.begin_transaction();
    h.db.insert_in(xid, &id, serde_json::json!({"id": 1000}))?;
    h.db.populate(&id, 30, 1)?;

    let connection = h.db.connect().await?;
    let stream = describe_stream(&*connection, id.clone(), &ScanConfig::default()).await?;
    drop(connection);

    let cancel = CancellationToken::new();
    let first = h.interrupted(windowed(5), 3, &cancel).run(&stream, cancel).await;
    assert!(first.is_cancelled());
    let watermarks: Vec<u64> = h
        .store
        .history()
        .iter()
        .filter_map(|s| s.fallback_watermark)
        .collect();
    assert!(!watermarks.is_empty());
    assert!(watermarks.iter().all(|w| *w < xid), "{:?}", watermarks);
    assert!(!distinct_ids(&h.sink.rows(&id).await).contains(&1000));

    // Commits after the first run's snapshot
    assert!(h.db.commit(xid));
    let second = h.orchestrator(windowed(5)).run(&stream, CancellationToken::new()).await;

    assert!(second.is_completed());
    let delivered = distinct_ids(&h.sink.rows(&id).await);
    assert!(delivered.contains(&1000));
    assert_eq!(delivered, distinct_ids(&h.db.rows(&id)));
    assert_eq!(delivered.len(), 51);
    Ok(())
}

#[tokio::test]
async fn test_fallback_plan_starts_at_oldest_row() -> anyhow::Result<()> {
    let h = Harness::with_db(MemoryDatabase::with_version(EngineVersion::new(11, 22)));
    let id = orders().id;
    h.db.create_table(&id, 10);
    h.db.advance_xid(1_000_000);

    let connection = h.db.connect().await?;
    let stream = describe_stream(&*connection, id.clone(), &ScanConfig::default()).await?;
    drop(connection);

    let empty = h.orchestrator(windowed(5)).run(&stream, CancellationToken::new()).await;
    assert!(empty.is_completed());
    assert_eq!(empty.chunks_read, 0);

    // Visibility 1_000_001..=1_000_005, four rows each
    h.db.populate(&id, 20, 4)?;
    let report = h.orchestrator(windowed(5)).run(&stream, CancellationToken::new()).await;

    assert!(report.is_completed());
    assert_eq!(report.chunks_read, 1);
    assert_eq!(report.rows_emitted, 20);
    assert_eq!(
        h.db.reads()[0].chunk,
        PlannedChunk::Fallback {
            window: VisibilityWindow::new(1_000_000, 1_000_005),
        }
    );
    Ok(())
}

// ============================================================================
// Parallel streams
// ============================================================================

#[tokio::test]
async fn test_parallel_streams_respect_pool_bound() -> anyhow::Result<()> {
    init_tracing();
    let h = Harness::new();
    let streams: Vec<StreamDescriptor> = (0..6)
        .map(|i| StreamDescriptor::new("public", format!("t{}", i)))
        .collect();
    for stream in &streams {
        h.db.create_table(&stream.id, 10);
        h.db.populate(&stream.id, 100, 10)?;
    }
    h.db.set_read_delay(Some(Duration::from_millis(2)));

    let config = ScanConfig::builder().chunk_blocks(2).max_sessions(2).build();
    let scanner = ParallelScanner::new(config, h.pool(2), h.store.clone(), h.sink.clone());
    let reports = scanner.run(streams.clone(), CancellationToken::new()).await;

    assert_eq!(reports.len(), 6);
    assert!(reports.iter().all(|r| r.is_completed()));
    assert!(h.db.max_open_connections() <= 2);
    assert_eq!(h.db.open_connections(), 0);
    for stream in &streams {
        assert_eq!(h.sink.count(&stream.id).await, 100);
    }
    assert_eq!(scanner.stats().rows, 600);
    Ok(())
}

#[tokio::test]
async fn test_parallel_cancel_stops_all_streams() -> anyhow::Result<()> {
    let h = Harness::new();
    let streams: Vec<StreamDescriptor> = (0..3)
        .map(|i| StreamDescriptor::new("public", format!("t{}", i)))
        .collect();
    for stream in &streams {
        h.db.create_table(&stream.id, 10);
        h.db.populate(&stream.id, 50, 10)?;
    }
    h.db.set_read_delay(Some(Duration::from_secs(30)));

    let scanner = ParallelScanner::new(chunked(1), h.pool(3), h.store.clone(), h.sink.clone());
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let reports =
        tokio::time::timeout(Duration::from_secs(5), scanner.run(streams, cancel)).await?;
    assert!(reports.iter().all(|r| r.is_cancelled()));
    Ok(())
}

#[tokio::test]
async fn test_streams_are_independent_cursors() -> anyhow::Result<()> {
    let h = Harness::new();
    let a = StreamId::new("public", "a");
    let b = StreamId::new("sales", "a");
    h.db.create_table(&a, 10);
    h.db.create_table(&b, 10);
    h.db.populate(&a, 40, 10)?;
    h.db.populate(&b, 40, 10)?;

    let cancel = CancellationToken::new();
    let stream_a = StreamDescriptor::new("public", "a");
    h.interrupted(chunked(1), 1, &cancel).run(&stream_a, cancel).await;

    assert!(h.store.load(&a).await?.is_none());
    assert!(h.store.load(&b).await?.is_none());

    let cancel = CancellationToken::new();
    h.interrupted(chunked(1), 2, &cancel).run(&stream_a, cancel).await;
    assert!(h.store.load(&a).await?.is_some());
    assert!(h.store.load(&b).await?.is_none());
    Ok(())
}
