//! # Range Planning
//!
//! Splits a table's address space into ordered, non-overlapping chunks.
//!
//! Position plans are aligned on multiples of `chunk_blocks`, so a plan
//! resumed mid-table yields the same boundaries as the original plan: at
//! most one partial range, then the regular grid.
//!
//! ```text
//! blocks:   0        1000       2000       3000    3412
//! plan:     [────────)[─────────)[─────────)[───────)
//! resume after (1534,7):
//!                       [(1534,8)─)[─────────)[───────)
//! ```
//!
//! Fallback plans cover `(after, through]` of the visibility counter in
//! windows of `fallback_window`.

use crate::common::{
    PhysicalStorageId, RowAddress, ScanPosition, ScanRange, VisibilityWindow,
};
use std::fmt;

/// One unit of work for the chunk reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedChunk {
    /// Rows whose address lies in `range`, in the given storage generation.
    Position {
        storage_id: PhysicalStorageId,
        range: ScanRange,
    },
    /// Rows whose visibility value lies in `window`.
    Fallback { window: VisibilityWindow },
}

impl PlannedChunk {
    /// Progress recorded once the whole chunk has been delivered.
    pub fn end_position(&self) -> ScanPosition {
        match self {
            Self::Position { range, .. } => ScanPosition::Address(range.last_address()),
            Self::Fallback { window } => ScanPosition::Visibility(window.through),
        }
    }

    pub fn storage_id(&self) -> Option<&PhysicalStorageId> {
        match self {
            Self::Position { storage_id, .. } => Some(storage_id),
            Self::Fallback { .. } => None,
        }
    }
}

impl fmt::Display for PlannedChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Position { storage_id, range } => write!(f, "{}@{}", range, storage_id),
            Self::Fallback { window } => write!(f, "xid {}", window),
        }
    }
}

/// Produces [`RangePlan`]s.
#[derive(Debug, Clone, Copy)]
pub struct RangePlanner {
    chunk_blocks: u64,
    fallback_window: u64,
}

impl RangePlanner {
    pub fn new(chunk_blocks: u64, fallback_window: u64) -> Self {
        Self {
            chunk_blocks: chunk_blocks.max(1),
            fallback_window: fallback_window.max(1),
        }
    }

    pub fn chunk_blocks(&self) -> u64 {
        self.chunk_blocks
    }

    /// Plan the whole allocation from the lowest address.
    pub fn plan(&self, storage_id: PhysicalStorageId, block_count: u64) -> RangePlan {
        self.plan_from(storage_id, block_count, RowAddress::MIN)
    }

    /// Plan every range at or after `start`.
    pub fn plan_from(
        &self,
        storage_id: PhysicalStorageId,
        block_count: u64,
        start: RowAddress,
    ) -> RangePlan {
        RangePlan {
            inner: PlanState::Position {
                storage_id,
                next: start,
                block_count,
                chunk_blocks: self.chunk_blocks,
            },
        }
    }

    /// Continue after the last delivered address.
    pub fn resume_after(
        &self,
        storage_id: PhysicalStorageId,
        block_count: u64,
        last: RowAddress,
    ) -> RangePlan {
        self.plan_from(storage_id, block_count, last.successor())
    }

    /// Plan visibility windows covering `(after, through]`.
    pub fn plan_visibility(&self, after: u64, through: u64) -> RangePlan {
        RangePlan {
            inner: PlanState::Fallback {
                after,
                through,
                width: self.fallback_window,
            },
        }
    }
}

/// Lazy, finite sequence of [`PlannedChunk`]s in ascending order.
#[derive(Debug, Clone)]
pub struct RangePlan {
    inner: PlanState,
}

#[derive(Debug, Clone)]
enum PlanState {
    Position {
        storage_id: PhysicalStorageId,
        next: RowAddress,
        block_count: u64,
        chunk_blocks: u64,
    },
    Fallback {
        after: u64,
        through: u64,
        width: u64,
    },
}

impl RangePlan {
    /// Number of chunks left.
    pub fn remaining(&self) -> u64 {
        match &self.inner {
            PlanState::Position {
                next,
                block_count,
                chunk_blocks,
                ..
            } => {
                if next.block >= *block_count {
                    return 0;
                }
                let first_end = next_boundary(next.block, *chunk_blocks).min(*block_count);
                1 + (*block_count - first_end).div_ceil(*chunk_blocks)
            }
            PlanState::Fallback {
                after,
                through,
                width,
            } => through.saturating_sub(*after).div_ceil(*width),
        }
    }
}

impl Iterator for RangePlan {
    type Item = PlannedChunk;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.inner {
            PlanState::Position {
                storage_id,
                next,
                block_count,
                chunk_blocks,
            } => {
                if next.block >= *block_count {
                    return None;
                }
                let end = next_boundary(next.block, *chunk_blocks).min(*block_count);
                let range = ScanRange::new(*next, RowAddress::block_start(end));
                *next = range.upper;
                Some(PlannedChunk::Position {
                    storage_id: storage_id.clone(),
                    range,
                })
            }
            PlanState::Fallback {
                after,
                through,
                width,
            } => {
                if *after >= *through {
                    return None;
                }
                let end = after.saturating_add(*width).min(*through);
                let window = VisibilityWindow::new(*after, end);
                *after = end;
                Some(PlannedChunk::Fallback { window })
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = usize::try_from(self.remaining()).unwrap_or(usize::MAX);
        (remaining, Some(remaining))
    }
}

/// First grid boundary strictly above `block`.
fn next_boundary(block: u64, chunk_blocks: u64) -> u64 {
    (block / chunk_blocks).saturating_add(1).saturating_mul(chunk_blocks)
}
