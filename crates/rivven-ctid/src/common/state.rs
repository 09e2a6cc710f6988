//! # Cursor State
//!
//! The persisted scan position of one stream and the manager that advances it.
//!
//! ## Wire format
//!
//! ```json
//! {
//!   "streamNamespace": "public",
//!   "streamName": "users",
//!   "physicalStorageId": "16384",
//!   "lastAddress": {"block": 1999, "offset": 4294967295},
//!   "strategy": "position",
//!   "fallbackWatermark": null
//! }
//! ```
//!
//! ## Invariants
//!
//! - Within one storage generation a cursor only moves forward. An attempt
//!   to move it backward is a [`ScanError::StateRegression`].
//! - A position cursor is only meaningful against the storage id it was
//!   taken on. A fallback cursor survives reorganization but not a change
//!   of strategy.

use crate::common::{
    is_valid, PhysicalStorageId, Result, RowAddress, ScanError, ScanPosition, ScanStrategy,
    ScannedRow, StreamId,
};
use crate::common::store::SharedCursorStore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Persisted scan position of a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorState {
    pub stream_namespace: String,
    pub stream_name: String,
    pub physical_storage_id: PhysicalStorageId,
    pub last_address: Option<RowAddress>,
    pub strategy: ScanStrategy,
    pub fallback_watermark: Option<u64>,
}

impl CursorState {
    pub fn stream_id(&self) -> StreamId {
        StreamId::new(self.stream_namespace.clone(), self.stream_name.clone())
    }

    /// Recorded progress, in the units of the cursor's strategy.
    pub fn position(&self) -> Option<ScanPosition> {
        match self.strategy {
            ScanStrategy::Position => self.last_address.map(ScanPosition::Address),
            ScanStrategy::Fallback => self.fallback_watermark.map(ScanPosition::Visibility),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Fallback progress: every row with visibility at or below the watermark
/// has been delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FallbackCursor {
    pub watermark: u64,
}

impl FallbackCursor {
    pub fn new(watermark: u64) -> Self {
        Self { watermark }
    }

    /// Cursor after delivering `delivered`, with `next` the first row not
    /// yet delivered.
    ///
    /// Rows sharing a visibility value must not be split across the
    /// watermark, so if `next` has the same value the cursor stops one short.
    pub fn after_rows(delivered: &ScannedRow, next: Option<&ScannedRow>) -> Self {
        let visibility = delivered.visibility;
        match next {
            Some(row) if row.visibility == visibility => Self::new(visibility.saturating_sub(1)),
            _ => Self::new(visibility),
        }
    }
}

/// Produces and validates a stream's [`CursorState`].
///
/// `emit` is pure bookkeeping; persisting goes through the store handle.
pub struct CursorStateManager {
    stream: StreamId,
    strategy: ScanStrategy,
    store: SharedCursorStore,
    generation: Option<PhysicalStorageId>,
    last: Option<ScanPosition>,
}

impl CursorStateManager {
    pub fn new(stream: StreamId, strategy: ScanStrategy, store: SharedCursorStore) -> Self {
        Self {
            stream,
            strategy,
            store,
            generation: None,
            last: None,
        }
    }

    pub fn stream(&self) -> &StreamId {
        &self.stream
    }

    /// Storage generation the cursor is currently advancing in.
    pub fn generation(&self) -> Option<&PhysicalStorageId> {
        self.generation.as_ref()
    }

    /// Last emitted position.
    pub fn last(&self) -> Option<ScanPosition> {
        self.last
    }

    /// Last persisted state for this stream.
    pub async fn load(&self) -> Result<Option<CursorState>> {
        self.store.load(&self.stream).await
    }

    /// Position to resume after, if `saved` is still usable against `current`.
    pub fn resume_point(
        &self,
        saved: &CursorState,
        current: &PhysicalStorageId,
    ) -> Option<ScanPosition> {
        if saved.strategy != self.strategy {
            debug!(
                "Cursor for {} was taken with strategy {}, scanning with {}",
                self.stream, saved.strategy, self.strategy
            );
            return None;
        }
        match self.strategy {
            ScanStrategy::Position if !is_valid(&saved.physical_storage_id, current) => {
                debug!(
                    "Storage of {} changed from {} to {}",
                    self.stream, saved.physical_storage_id, current
                );
                None
            }
            _ => saved.position(),
        }
    }

    /// Start a generation at `storage_id`, optionally resuming after `resume`.
    pub fn begin(&mut self, storage_id: PhysicalStorageId, resume: Option<ScanPosition>) {
        self.generation = Some(storage_id);
        self.last = resume;
    }

    /// Cursor state for a position scan that has delivered everything up
    /// to and including `address`.
    pub fn emit(
        &mut self,
        storage_id: &PhysicalStorageId,
        address: RowAddress,
    ) -> Result<CursorState> {
        self.emit_position(storage_id, ScanPosition::Address(address))
    }

    /// Cursor state for a fallback scan.
    pub fn emit_fallback(
        &mut self,
        storage_id: &PhysicalStorageId,
        cursor: FallbackCursor,
    ) -> Result<CursorState> {
        self.emit_position(storage_id, ScanPosition::Visibility(cursor.watermark))
    }

    pub fn emit_position(
        &mut self,
        storage_id: &PhysicalStorageId,
        position: ScanPosition,
    ) -> Result<CursorState> {
        match (self.strategy, position) {
            (ScanStrategy::Position, ScanPosition::Address(_))
            | (ScanStrategy::Fallback, ScanPosition::Visibility(_)) => {}
            _ => {
                return Err(ScanError::other(format!(
                    "{} cursor for {} cannot record position {}",
                    self.strategy, self.stream, position
                )))
            }
        }

        match &self.generation {
            Some(generation) if generation != storage_id => {
                // A fallback cursor is not tied to the allocation
                if self.strategy == ScanStrategy::Position {
                    return Err(ScanError::range_invalid(generation, storage_id));
                }
                self.generation = Some(storage_id.clone());
            }
            Some(_) => {}
            None => self.generation = Some(storage_id.clone()),
        }

        if let Some(previous) = self.last {
            if position < previous {
                return Err(ScanError::state_regression(&self.stream, previous, position));
            }
        }
        self.last = Some(position);

        let (last_address, fallback_watermark) = match position {
            ScanPosition::Address(address) => (Some(address), None),
            ScanPosition::Visibility(watermark) => (None, Some(watermark)),
        };

        Ok(CursorState {
            stream_namespace: self.stream.namespace.clone(),
            stream_name: self.stream.name.clone(),
            physical_storage_id: storage_id.clone(),
            last_address,
            strategy: self.strategy,
            fallback_watermark,
        })
    }

    /// Persist an emitted state.
    pub async fn persist(&self, state: &CursorState) -> Result<()> {
        self.store.save(state).await
    }

    /// Forget all progress: delete the persisted cursor and leave the
    /// current generation.
    pub async fn reset(&mut self) -> Result<()> {
        self.store.delete(&self.stream).await?;
        self.generation = None;
        self.last = None;
        info!("Reset cursor for {}", self.stream);
        Ok(())
    }

    /// Drop the persisted cursor once the scan reached its upper bound.
    pub async fn complete(&self) -> Result<()> {
        self.store.delete(&self.stream).await
    }
}
