//! # Scan Configuration
//!
//! Per-stream tunables consumed read-only by the scan loop.
//!
//! Physical chunk width and checkpoint frequency are independent knobs:
//! a wide chunk can still be checkpointed every few thousand rows, and a
//! narrow chunk can be checkpointed only every few chunks.
//!
//! ## Example
//!
//! ```rust
//! use rivven_ctid::common::{CheckpointPolicy, ScanConfig};
//!
//! let config = ScanConfig::builder()
//!     .chunk_blocks(2_000)
//!     .checkpoint(CheckpointPolicy::every_rows(50_000))
//!     .max_sessions(8)
//!     .build();
//!
//! assert_eq!(config.chunk_blocks, 2_000);
//! assert!(config.validate().is_ok());
//! ```

use crate::common::{Result, RetryConfig, ScanError, ScanStrategy};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// When the scan loop persists a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointPolicy {
    /// Checkpoint after every fully read chunk
    pub every_chunk: bool,
    /// Also checkpoint after every N rows handed to the sink
    pub every_rows: Option<u64>,
    /// Also checkpoint at chunk end once this much time has passed
    #[serde(with = "option_duration_ms", rename = "interval_ms")]
    pub interval: Option<Duration>,
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        Self {
            every_chunk: true,
            every_rows: None,
            interval: None,
        }
    }
}

impl CheckpointPolicy {
    /// Checkpoint after every chunk only.
    pub fn every_chunk() -> Self {
        Self::default()
    }

    /// Checkpoint every `rows` rows and at every chunk end.
    pub fn every_rows(rows: u64) -> Self {
        Self {
            every_chunk: true,
            every_rows: Some(rows.max(1)),
            interval: None,
        }
    }

    /// Checkpoint at chunk ends, at most once per `interval`.
    pub fn interval(interval: Duration) -> Self {
        Self {
            every_chunk: false,
            every_rows: None,
            interval: Some(interval),
        }
    }

    /// Whether a chunk end should produce a checkpoint.
    pub fn at_chunk_end(&self, since_last: Duration) -> bool {
        self.every_chunk || self.interval.is_some_and(|i| since_last >= i)
    }
}

/// Configuration for a table scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Blocks per planned position range
    pub chunk_blocks: u64,
    /// Visibility-counter width per fallback window
    pub fallback_window: u64,
    /// Checkpoint triggers
    pub checkpoint: CheckpointPolicy,
    /// Backoff for transient read errors
    pub retry: RetryConfig,
    /// Forced re-plans (storage reorganized mid-scan) before giving up
    pub max_replans: u32,
    /// Concurrent reader sessions across all streams
    pub max_sessions: usize,
    /// Force a strategy instead of deriving it from the engine version
    pub strategy_override: Option<ScanStrategy>,
    /// Pause between chunks
    #[serde(with = "option_duration_ms", rename = "throttle_delay_ms")]
    pub throttle_delay: Option<Duration>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            chunk_blocks: 1_000,
            fallback_window: 100_000,
            checkpoint: CheckpointPolicy::default(),
            retry: RetryConfig::default(),
            max_replans: 3,
            max_sessions: 4,
            strategy_override: None,
            throttle_delay: None,
        }
    }
}

impl ScanConfig {
    pub fn builder() -> ScanConfigBuilder {
        ScanConfigBuilder::default()
    }

    /// Small chunks, frequent checkpoints: less re-read work after a restart.
    pub fn fine_grained() -> Self {
        Self {
            chunk_blocks: 100,
            fallback_window: 10_000,
            checkpoint: CheckpointPolicy::every_rows(10_000),
            ..Default::default()
        }
    }

    /// Large chunks, fewer round trips and checkpoint writes.
    pub fn high_throughput() -> Self {
        Self {
            chunk_blocks: 10_000,
            fallback_window: 1_000_000,
            checkpoint: CheckpointPolicy::interval(Duration::from_secs(30)),
            max_sessions: 8,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_blocks == 0 {
            return Err(ScanError::config("chunk_blocks must be at least 1"));
        }
        if self.fallback_window == 0 {
            return Err(ScanError::config("fallback_window must be at least 1"));
        }
        if self.max_sessions == 0 {
            return Err(ScanError::config("max_sessions must be at least 1"));
        }
        if self.checkpoint.every_rows == Some(0) {
            return Err(ScanError::config("checkpoint.every_rows must be at least 1"));
        }
        if !self.checkpoint.every_chunk
            && self.checkpoint.every_rows.is_none()
            && self.checkpoint.interval.is_none()
        {
            return Err(ScanError::config(
                "checkpoint policy has no trigger; scans would not be resumable",
            ));
        }
        Ok(())
    }
}

/// Builder for ScanConfig.
#[derive(Default)]
pub struct ScanConfigBuilder {
    config: ScanConfig,
}

impl ScanConfigBuilder {
    pub fn chunk_blocks(mut self, blocks: u64) -> Self {
        self.config.chunk_blocks = blocks.max(1);
        self
    }

    pub fn fallback_window(mut self, width: u64) -> Self {
        self.config.fallback_window = width.max(1);
        self
    }

    pub fn checkpoint(mut self, policy: CheckpointPolicy) -> Self {
        self.config.checkpoint = policy;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn max_replans(mut self, replans: u32) -> Self {
        self.config.max_replans = replans;
        self
    }

    pub fn max_sessions(mut self, sessions: usize) -> Self {
        self.config.max_sessions = sessions.max(1);
        self
    }

    pub fn strategy_override(mut self, strategy: ScanStrategy) -> Self {
        self.config.strategy_override = Some(strategy);
        self
    }

    pub fn throttle_delay(mut self, delay: Duration) -> Self {
        self.config.throttle_delay = Some(delay);
        self
    }

    pub fn build(self) -> ScanConfig {
        self.config
    }
}

/// Serde helpers: `Duration` as integer milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

pub(crate) mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
