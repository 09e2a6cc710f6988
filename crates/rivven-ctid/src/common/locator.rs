//! Storage metadata lookups.

use crate::common::{
    EngineVersion, PhysicalStorageId, Result, ScanConfig, ScanStrategy, StreamDescriptor, StreamId,
};
use async_trait::async_trait;
use tracing::debug;

/// Read-only metadata queries against the storage engine.
#[async_trait]
pub trait StorageLocator: Send + Sync {
    /// Current physical allocation of a table.
    ///
    /// Fails with `StorageUnavailable` if the table no longer exists.
    async fn resolve(&self, stream: &StreamId) -> Result<PhysicalStorageId>;

    /// Number of blocks in the table's current allocation.
    async fn block_count(&self, stream: &StreamId) -> Result<u64>;

    /// Highest visibility value at or below which no transaction is still
    /// in flight. Rows stamped above it may not be visible yet.
    async fn visibility_watermark(&self) -> Result<u64>;

    /// Lowest and highest visibility value among the table's visible rows,
    /// or `None` if it has none.
    async fn visibility_bounds(&self, stream: &StreamId) -> Result<Option<(u64, u64)>>;

    /// Version of the engine behind this session.
    async fn engine_version(&self) -> Result<EngineVersion>;
}

/// Whether a saved storage id still describes the table's allocation.
///
/// A mismatch means storage was reorganized since the checkpoint was taken.
pub fn is_valid(saved: &PhysicalStorageId, current: &PhysicalStorageId) -> bool {
    saved == current
}

/// Build a descriptor for a table, choosing the strategy its engine permits.
pub async fn describe_stream<L: StorageLocator + ?Sized>(
    locator: &L,
    id: StreamId,
    config: &ScanConfig,
) -> Result<StreamDescriptor> {
    let version = locator.engine_version().await?;
    let strategy = ScanStrategy::for_engine(version, config.strategy_override)?;
    // Fail early if the table is gone
    let storage_id = locator.resolve(&id).await?;

    debug!(
        "Described {} on engine {}: strategy={}, storage={}",
        id, version, strategy, storage_id
    );

    Ok(StreamDescriptor {
        id,
        key_hint: None,
        strategy,
    })
}
