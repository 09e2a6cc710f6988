//! Retry configuration for transient read failures
//!
//! Bounded exponential backoff with deterministic jitter. A chunk read that
//! fails with a retriable error is re-issued against the same range; when
//! the budget is spent the stream fails, its siblings keep going.

use crate::common::config::duration_ms;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff policy for one chunk read.
///
/// # Example
///
/// ```rust
/// use rivven_ctid::common::RetryConfig;
/// use std::time::Duration;
///
/// let retry = RetryConfig::builder()
///     .max_retries(5)
///     .retry_delay(Duration::from_millis(200))
///     .max_delay(Duration::from_secs(5))
///     .jitter(0.0)
///     .build();
///
/// assert_eq!(retry.max_retries(), 5);
/// assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(400));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first read (`0` disables retrying)
    max_retries: u32,
    /// Delay before the first retry, doubled per attempt
    #[serde(with = "duration_ms", rename = "retry_delay_ms")]
    retry_delay: Duration,
    /// Upper bound for a single backoff sleep
    #[serde(with = "duration_ms", rename = "max_delay_ms")]
    max_delay: Duration,
    /// Spread factor in `0.0..=1.0` so sibling streams do not retry in lockstep
    jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            jitter: 0.25,
        }
    }
}

impl RetryConfig {
    pub fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder::default()
    }

    /// Fail on the first transient error.
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    pub fn is_enabled(&self) -> bool {
        self.max_retries > 0
    }

    /// Whether a read that already failed `attempt` retries may go again.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// Sleep before retry number `attempt + 1`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let doubled = self
            .retry_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);
        if self.jitter <= 0.0 {
            return doubled;
        }
        let secs = doubled.as_secs_f64();
        Duration::from_secs_f64((secs + secs * self.jitter * spread(attempt)).max(0.0))
    }
}

/// Deterministic value in `-1.0..1.0` (golden ratio sequence).
fn spread(attempt: u32) -> f64 {
    let fraction = (attempt as f64 * 0.618033988749895).fract();
    fraction * 2.0 - 1.0
}

/// Builder for [`RetryConfig`].
#[derive(Debug, Clone, Default)]
pub struct RetryConfigBuilder {
    retry: RetryConfig,
}

impl RetryConfigBuilder {
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.retry.max_retries = retries;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry.retry_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.retry.max_delay = delay;
        self
    }

    /// Clamped to `0.0..=1.0`.
    pub fn jitter(mut self, factor: f64) -> Self {
        self.retry.jitter = factor.clamp(0.0, 1.0);
        self
    }

    pub fn build(self) -> RetryConfig {
        self.retry
    }
}
