//! # rivven-ctid - Resumable physical-position table snapshots
//!
//! Reads whole tables in chunks of physical row addresses (PostgreSQL `ctid`),
//! checkpointing after each chunk so an interrupted snapshot resumes where it
//! stopped instead of starting over.
//!
//! ## Features
//!
//! - `postgres` - PostgreSQL reader (TID range scans on 14+, TID lists on 12/13,
//!   `xmin` fallback below 12)
//! - `full` - All engines
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐    ┌──────────────┐    ┌──────────────┐
//! │StorageLocator │───►│ RangePlanner │───►│ ChunkReader  │
//! │ storage id,   │    │ [lower,upper)│    │ rows of one  │
//! │ block count   │    │ or xmin win. │    │ chunk        │
//! └───────────────┘    └──────────────┘    └──────┬───────┘
//!                                                 │
//!                                                 ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                  SnapshotOrchestrator                    │
//! │  Resolving → Scanning ⇄ Checkpointing → Completed        │
//! └───────────────┬──────────────────────────┬───────────────┘
//!                 ▼                          ▼
//!         ┌───────────────┐          ┌───────────────┐
//!         │   RowSink     │          │ CursorStore   │
//!         └───────────────┘          └───────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # async fn example() -> anyhow::Result<()> {
//! use rivven_ctid::common::{ConnectionPool, MemoryDatabase};
//! use rivven_ctid::{
//!     MemoryCursorStore, MemoryRowSink, ScanConfig, SnapshotOrchestrator, StreamDescriptor,
//! };
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! let db = MemoryDatabase::new();
//! let stream = StreamDescriptor::new("public", "orders");
//! db.create_table(&stream.id, 100);
//! db.populate(&stream.id, 10_000, 50)?;
//!
//! let config = ScanConfig::builder().chunk_blocks(10).build();
//! let pool = Arc::new(ConnectionPool::new(Arc::new(db), config.max_sessions));
//! let orchestrator = SnapshotOrchestrator::new(
//!     config,
//!     pool,
//!     Arc::new(MemoryCursorStore::new()),
//!     Arc::new(MemoryRowSink::new()),
//! );
//!
//! let report = orchestrator.run(&stream, CancellationToken::new()).await;
//! assert!(report.is_completed());
//! # Ok(())
//! # }
//! ```
//!
//! ## Public API Organization
//!
//! ### Tier 1: Core Types (crate root)
//! Running a snapshot - `SnapshotOrchestrator`, `ScanConfig`, `ScanReport`.
//!
//! ### Tier 2: Extension Points (crate root)
//! Traits to plug in storage engines, sinks and checkpoint stores.
//!
//! ### Tier 3: Advanced Types (`common` module)
//! Planner, cursor manager, pool and the in-memory engine.

pub mod common;

// =============================================================================
// TIER 1: Core Types
// =============================================================================

pub use common::{
    // Error handling
    ErrorCategory,
    Result,
    ScanError,
    // Running a scan
    CheckpointPolicy,
    ParallelScanner,
    ScanConfig,
    ScanPhase,
    ScanReport,
    SnapshotOrchestrator,
    StopReason,
    // Addressing
    PhysicalStorageId,
    RowAddress,
    ScanPosition,
    ScanRange,
    ScanStrategy,
    StreamDescriptor,
    StreamId,
    VisibilityWindow,
};

// =============================================================================
// TIER 2: Extension Points
// =============================================================================

pub use common::{ChunkReader, ScanConnection, ScanConnector, StorageLocator};
pub use common::{CursorState, CursorStore, FileCursorStore, MemoryCursorStore};
pub use common::{ChannelRowSink, MemoryRowSink, RowSink, ScannedRow};

// =============================================================================
// TIER 3: Advanced Types - Available via `common::` module
// =============================================================================
//   - common::RangePlanner, RangePlan, PlannedChunk
//   - common::CursorStateManager, FallbackCursor
//   - common::ConnectionPool, PooledConnection
//   - common::RetryConfig, RetryConfigBuilder
//   - common::ScanStats, ScanStatsSnapshot
//   - common::MemoryDatabase (in-process engine for tests and demos)

// PostgreSQL - feature-gated
#[cfg(feature = "postgres")]
pub mod postgres;
