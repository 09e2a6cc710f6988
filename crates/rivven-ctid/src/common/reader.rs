//! # Chunk Reading
//!
//! A [`ChunkReader`] returns the rows of one [`PlannedChunk`] in ascending
//! scan order: by address for position chunks, by visibility value for
//! fallback chunks. Order is provided by the engine; readers do not re-sort.
//!
//! Reading the same chunk twice against the same allocation returns the
//! same rows, which is what makes in-place retries safe.

use crate::common::{PlannedChunk, Result, RowAddress, ScanError, StreamId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A row as read from the table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScannedRow {
    pub address: RowAddress,
    /// Epoch-extended visibility value (xmin)
    pub visibility: u64,
    /// Column values keyed by column name
    pub values: serde_json::Value,
}

impl ScannedRow {
    pub fn new(address: RowAddress, visibility: u64, values: serde_json::Value) -> Self {
        Self {
            address,
            visibility,
            values,
        }
    }
}

/// Rows of one planned chunk.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Chunk {
    pub rows: Vec<ScannedRow>,
    pub highest_address: Option<RowAddress>,
    pub highest_visibility: Option<u64>,
}

impl Chunk {
    pub fn new(rows: Vec<ScannedRow>) -> Self {
        let highest_address = rows.iter().map(|r| r.address).max();
        let highest_visibility = rows.iter().map(|r| r.visibility).max();
        Self {
            rows,
            highest_address,
            highest_visibility,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Check that every row belongs to `planned` and rows are in scan order.
    pub fn verify(&self, planned: &PlannedChunk) -> Result<()> {
        match planned {
            PlannedChunk::Position { range, .. } => {
                if let Some(row) = self.rows.iter().find(|r| !range.contains(&r.address)) {
                    return Err(ScanError::other(format!(
                        "Row {} outside planned range {}",
                        row.address, range
                    )));
                }
                if self.rows.windows(2).any(|w| w[0].address >= w[1].address) {
                    return Err(ScanError::other(format!(
                        "Rows of range {} are not in ascending address order",
                        range
                    )));
                }
            }
            PlannedChunk::Fallback { window } => {
                if let Some(row) = self.rows.iter().find(|r| !window.contains(r.visibility)) {
                    return Err(ScanError::other(format!(
                        "Row with xid {} outside planned window {}",
                        row.visibility, window
                    )));
                }
                if self.rows.windows(2).any(|w| w[0].visibility > w[1].visibility) {
                    return Err(ScanError::other(format!(
                        "Rows of window {} are not in visibility order",
                        window
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Reads the rows of a planned chunk.
///
/// Implementations fail with `RangeInvalid` when a position chunk's storage
/// id no longer matches the table, and with `TransientRead` for failures
/// that are safe to retry with the same chunk.
#[async_trait]
pub trait ChunkReader: Send + Sync {
    async fn read(&self, stream: &StreamId, chunk: &PlannedChunk) -> Result<Chunk>;
}
