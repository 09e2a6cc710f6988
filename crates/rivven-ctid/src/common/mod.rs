//! # Common Scan Types and Traits
//!
//! Engine-agnostic building blocks of a physical-position table scan:
//!
//! - [`RowAddress`], [`ScanRange`], [`VisibilityWindow`] - what a chunk covers
//! - [`StorageLocator`] - table allocation metadata
//! - [`RangePlanner`] - splits a table into [`PlannedChunk`]s
//! - [`ChunkReader`] - reads the rows of one chunk
//! - [`CursorStateManager`] - monotonic, resumable scan position
//! - [`CursorStore`] - checkpoint persistence
//! - [`RowSink`] - downstream row delivery
//! - [`ConnectionPool`] - bounded reader sessions
//! - [`SnapshotOrchestrator`] - per-stream scan state machine
//! - [`ParallelScanner`] - many streams at once
//! - [`ScanStats`] - counters, mirrored to the `metrics` facade
//! - [`MemoryDatabase`] - in-process engine for tests
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  SnapshotOrchestrator                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ConnectionPool ──► ScanConnection (StorageLocator +        │
//! │                                     ChunkReader)            │
//! │  RangePlanner   ──► PlannedChunk::Position | ::Fallback     │
//! │  CursorState    ──► CursorStore (memory, file)              │
//! │  rows           ──► RowSink (memory, channel)               │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod address;
pub(crate) mod config;
mod error;
mod locator;
mod memory;
mod metrics;
mod orchestrator;
mod parallel;
mod planner;
mod pool;
mod reader;
mod resilience;
mod sink;
mod state;
pub(crate) mod store;
mod stream;

pub use address::{PhysicalStorageId, RowAddress, ScanPosition, ScanRange, VisibilityWindow};
pub use config::{CheckpointPolicy, ScanConfig, ScanConfigBuilder};
pub use error::{ErrorCategory, Result, ScanError};
pub use locator::{describe_stream, is_valid, StorageLocator};
pub use memory::{MemoryConnection, MemoryDatabase, ReadRecord};
pub use metrics::{ScanStats, ScanStatsSnapshot};
pub use orchestrator::{ScanPhase, ScanReport, SnapshotOrchestrator, StopReason};
pub use parallel::ParallelScanner;
pub use planner::{PlannedChunk, RangePlan, RangePlanner};
pub use pool::{ConnectionPool, PooledConnection, ScanConnection, ScanConnector};
pub use reader::{Chunk, ChunkReader, ScannedRow};
pub use resilience::{RetryConfig, RetryConfigBuilder};
pub use sink::{ChannelRowSink, MemoryRowSink, RowBatch, RowSink, SharedRowSink};
pub use state::{CursorState, CursorStateManager, FallbackCursor};
pub use store::{CursorStore, FileCursorStore, MemoryCursorStore, SharedCursorStore};
pub use stream::{EngineVersion, ScanStrategy, StreamDescriptor, StreamId};
