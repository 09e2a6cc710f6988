//! Stream identity and scan strategy selection.

use crate::common::{Result, ScanError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical table identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId {
    pub namespace: String,
    pub name: String,
}

impl StreamId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// `namespace.name`, used as the checkpoint key.
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.name)
    }
}

/// How a stream's rows are enumerated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStrategy {
    /// Walk the physical address space in block ranges.
    Position,
    /// Walk the transaction-visibility counter in windows.
    Fallback,
}

impl ScanStrategy {
    /// Pick the strategy permitted by an engine version.
    ///
    /// Engines older than 12 must use [`ScanStrategy::Fallback`]; asking for
    /// `Position` there is a configuration error.
    pub fn for_engine(version: EngineVersion, requested: Option<ScanStrategy>) -> Result<Self> {
        match requested {
            Some(ScanStrategy::Position) if !version.supports_stable_addressing() => {
                Err(ScanError::config(format!(
                    "position scans are not supported on engine version {}",
                    version
                )))
            }
            Some(strategy) => Ok(strategy),
            None if version.supports_stable_addressing() => Ok(ScanStrategy::Position),
            None => Ok(ScanStrategy::Fallback),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Position => "position",
            Self::Fallback => "fallback",
        }
    }
}

impl fmt::Display for ScanStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage engine version (major.minor).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EngineVersion {
    pub major: u32,
    pub minor: u32,
}

impl EngineVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Decode a numeric server version.
    ///
    /// From 10 onwards the encoding is `major * 10000 + minor` (`140005` is
    /// 14.5); before that it is `major * 10000 + minor * 100 + patch`
    /// (`90624` is 9.6).
    pub fn from_version_num(num: u32) -> Self {
        if num >= 100_000 {
            Self::new(num / 10_000, num % 10_000)
        } else {
            Self::new(num / 10_000, (num / 100) % 100)
        }
    }

    /// Addresses stay meaningful across concurrent maintenance.
    pub fn supports_stable_addressing(&self) -> bool {
        self.major >= 12
    }

    /// Native range predicates over tuple identifiers.
    pub fn supports_tid_range_scan(&self) -> bool {
        self.major >= 14
    }
}

impl fmt::Display for EngineVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// A table to snapshot, as produced from configuration and discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub id: StreamId,
    /// Declared primary/unique key columns, informational only
    pub key_hint: Option<Vec<String>>,
    pub strategy: ScanStrategy,
}

impl StreamDescriptor {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: StreamId::new(namespace, name),
            key_hint: None,
            strategy: ScanStrategy::Position,
        }
    }

    pub fn with_key_hint(mut self, columns: Vec<String>) -> Self {
        self.key_hint = Some(columns);
        self
    }

    pub fn with_strategy(mut self, strategy: ScanStrategy) -> Self {
        self.strategy = strategy;
        self
    }
}
