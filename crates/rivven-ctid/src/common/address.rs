//! # Physical Addressing
//!
//! Row addresses and the ranges built from them.
//!
//! A [`RowAddress`] is a `(block, offset)` pair, the same shape as a
//! PostgreSQL tuple identifier (`ctid`). Ordering is only meaningful within a
//! single [`PhysicalStorageId`] generation: once the engine rewrites the
//! table, old addresses point at nothing in particular.
//!
//! ```text
//!  block 0          block 1          block 2          block 3
//! ┌────────────────┬────────────────┬────────────────┬────────────────┐
//! │(0,1) (0,2) ... │(1,1) (1,2) ... │(2,1) ...       │(3,1) ...       │
//! └────────────────┴────────────────┴────────────────┴────────────────┘
//! [(0,0) ─────── ScanRange ──────── (2,0))[(2,0) ──── ScanRange ── (4,0))
//! ```

use crate::common::{Result, ScanError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Opaque identifier of a table's current on-disk allocation.
///
/// For PostgreSQL this is the relation filenode. It changes whenever the
/// engine reorganizes storage (`VACUUM FULL`, `CLUSTER`, table rewrites).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PhysicalStorageId(String);

impl PhysicalStorageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PhysicalStorageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<u32> for PhysicalStorageId {
    fn from(filenode: u32) -> Self {
        Self(filenode.to_string())
    }
}

/// Position of a row inside one physical allocation.
///
/// Ordered by block, then offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowAddress {
    pub block: u64,
    pub offset: u32,
}

impl RowAddress {
    /// Lowest possible address; no row lives here.
    pub const MIN: RowAddress = RowAddress {
        block: 0,
        offset: 0,
    };

    pub const fn new(block: u64, offset: u32) -> Self {
        Self { block, offset }
    }

    /// First address of a block.
    pub const fn block_start(block: u64) -> Self {
        Self { block, offset: 0 }
    }

    /// Last address of a block (sentinel, never a real row).
    pub const fn block_end(block: u64) -> Self {
        Self {
            block,
            offset: u32::MAX,
        }
    }

    /// The next address in scan order.
    pub fn successor(&self) -> Self {
        if self.offset == u32::MAX {
            Self::block_start(self.block.saturating_add(1))
        } else {
            Self::new(self.block, self.offset + 1)
        }
    }

    /// The previous address in scan order, `None` for [`RowAddress::MIN`].
    pub fn predecessor(&self) -> Option<Self> {
        if self.offset > 0 {
            Some(Self::new(self.block, self.offset - 1))
        } else if self.block > 0 {
            Some(Self::block_end(self.block - 1))
        } else {
            None
        }
    }
}

impl fmt::Display for RowAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.block, self.offset)
    }
}

impl FromStr for RowAddress {
    type Err = ScanError;

    /// Parse the tuple-identifier text form `(block,offset)`.
    fn from_str(s: &str) -> Result<Self> {
        let inner = s
            .trim()
            .strip_prefix('(')
            .and_then(|rest| rest.strip_suffix(')'))
            .ok_or_else(|| ScanError::serialization(format!("Invalid row address: {}", s)))?;

        let (block, offset) = inner
            .split_once(',')
            .ok_or_else(|| ScanError::serialization(format!("Invalid row address: {}", s)))?;

        let block = block
            .trim()
            .parse::<u64>()
            .map_err(|e| ScanError::serialization(format!("Invalid block in {}: {}", s, e)))?;
        let offset = offset
            .trim()
            .parse::<u32>()
            .map_err(|e| ScanError::serialization(format!("Invalid offset in {}: {}", s, e)))?;

        Ok(Self { block, offset })
    }
}

/// Half-open address range `[lower, upper)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScanRange {
    pub lower: RowAddress,
    pub upper: RowAddress,
}

impl ScanRange {
    pub fn new(lower: RowAddress, upper: RowAddress) -> Self {
        Self { lower, upper }
    }

    /// Range covering whole blocks `[first, end)`.
    pub fn blocks(first: u64, end: u64) -> Self {
        Self::new(RowAddress::block_start(first), RowAddress::block_start(end))
    }

    pub fn contains(&self, address: &RowAddress) -> bool {
        *address >= self.lower && *address < self.upper
    }

    pub fn is_empty(&self) -> bool {
        self.lower >= self.upper
    }

    /// Highest address covered by this range.
    ///
    /// Recording it as the cursor after the range is fully delivered makes
    /// resumption start exactly at `upper`.
    pub fn last_address(&self) -> RowAddress {
        self.upper.predecessor().unwrap_or(RowAddress::MIN)
    }

    /// Blocks touched by this range, `[first, end)`.
    pub fn block_span(&self) -> (u64, u64) {
        let end = if self.upper.offset == 0 {
            self.upper.block
        } else {
            self.upper.block.saturating_add(1)
        };
        (self.lower.block, end)
    }
}

impl fmt::Display for ScanRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.lower, self.upper)
    }
}

/// Window over the transaction-visibility counter, `(after, through]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VisibilityWindow {
    pub after: u64,
    pub through: u64,
}

impl VisibilityWindow {
    pub fn new(after: u64, through: u64) -> Self {
        Self { after, through }
    }

    pub fn contains(&self, visibility: u64) -> bool {
        visibility > self.after && visibility <= self.through
    }

    pub fn is_empty(&self) -> bool {
        self.through <= self.after
    }
}

impl fmt::Display for VisibilityWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}]", self.after, self.through)
    }
}

/// How far a scan has progressed, in the units of its strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ScanPosition {
    /// Everything at or below this address has been delivered.
    Address(RowAddress),
    /// Everything at or below this visibility value has been delivered.
    Visibility(u64),
}

impl fmt::Display for ScanPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Address(address) => write!(f, "{}", address),
            Self::Visibility(watermark) => write!(f, "xid {}", watermark),
        }
    }
}
