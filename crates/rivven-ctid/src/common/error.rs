//! Error types for physical-position snapshot scans
//!
//! Feature-gated error variants for engine-specific errors.
//! Includes error classification for retry decisions, alerting and
//! per-stream failure reporting.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error categories for metrics and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Table or storage metadata problems (dropped table, reorganized storage)
    Storage,
    /// Reading rows from the live table
    Read,
    /// Cursor/checkpoint state problems
    State,
    /// Configuration errors (invalid settings)
    Configuration,
    /// Downstream sink or checkpoint store errors
    Delivery,
    /// Serialization errors (JSON)
    Serialization,
    /// Other/unknown errors
    Other,
}

/// Errors raised while planning, reading or checkpointing a table scan.
#[derive(Error, Debug)]
pub enum ScanError {
    /// PostgreSQL client error
    #[cfg(feature = "postgres")]
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// The table no longer exists (dropped or renamed mid-run)
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// The physical storage was reorganized while a range was being read
    #[error("Range invalid: storage changed from {expected} to {found}")]
    RangeInvalid {
        /// Storage id the range was planned against
        expected: String,
        /// Storage id observed by the reader
        found: String,
    },

    /// Connection drop, timeout or other retriable read failure
    #[error("Transient read error: {0}")]
    TransientRead(String),

    /// Transient read retries were exhausted
    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Number of attempts made (first try included)
        attempts: u32,
        /// The last transient error observed
        last: String,
    },

    /// Cursor attempted to move backward within a storage generation
    #[error("State regression for {stream}: {attempted} < {previous}")]
    StateRegression {
        /// Stream whose cursor regressed
        stream: String,
        /// Previously emitted position
        previous: String,
        /// Rejected position
        attempted: String,
    },

    /// The cancellation signal was raised. Not a failure: the last
    /// persisted checkpoint stays authoritative.
    #[error("Scan cancelled")]
    Cancelled,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Row sink rejected a chunk
    #[error("Sink error: {0}")]
    Sink(String),

    /// Checkpoint store failure
    #[error("Checkpoint store error: {0}")]
    Store(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Connection pool was closed while waiting for admission
    #[error("Connection pool closed")]
    PoolClosed,

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl ScanError {
    /// Create a storage unavailable error
    pub fn storage_unavailable(msg: impl Into<String>) -> Self {
        Self::StorageUnavailable(msg.into())
    }

    /// Create a range invalid error from the expected and observed storage ids
    pub fn range_invalid(expected: impl ToString, found: impl ToString) -> Self {
        Self::RangeInvalid {
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }

    /// Create a transient read error
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientRead(msg.into())
    }

    /// Create a state regression error
    pub fn state_regression(
        stream: impl ToString,
        previous: impl ToString,
        attempted: impl ToString,
    ) -> Self {
        Self::StateRegression {
            stream: stream.to_string(),
            previous: previous.to_string(),
            attempted: attempted.to_string(),
        }
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a sink error
    pub fn sink(msg: impl Into<String>) -> Self {
        Self::Sink(msg.into())
    }

    /// Create a checkpoint store error
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a generic error
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Check if this error is retriable in place (same range, after backoff).
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::TransientRead(_) => true,

            #[cfg(feature = "postgres")]
            Self::Postgres(e) => is_transient_pg_error(e),

            Self::Io(e) => {
                use std::io::ErrorKind;
                matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::TimedOut
                        | ErrorKind::Interrupted
                )
            }

            Self::StorageUnavailable(_)
            | Self::RangeInvalid { .. }
            | Self::RetriesExhausted { .. }
            | Self::StateRegression { .. }
            | Self::Cancelled
            | Self::Config(_)
            | Self::Sink(_)
            | Self::Store(_)
            | Self::Serialization(_)
            | Self::Json(_)
            | Self::PoolClosed
            | Self::Other(_) => false,
        }
    }

    /// Check if this error ends the stream's scan.
    ///
    /// `RangeInvalid` is recoverable by a forced re-plan and cancellation is
    /// a clean stop; everything else that is not retriable is fatal.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::RangeInvalid { .. } | Self::Cancelled) && !self.is_retriable()
    }

    /// Get the error category for metrics and alerting.
    pub fn category(&self) -> ErrorCategory {
        match self {
            #[cfg(feature = "postgres")]
            Self::Postgres(_) => ErrorCategory::Read,
            Self::StorageUnavailable(_) => ErrorCategory::Storage,
            Self::RangeInvalid { .. } => ErrorCategory::Storage,
            Self::TransientRead(_) => ErrorCategory::Read,
            Self::RetriesExhausted { .. } => ErrorCategory::Read,
            Self::StateRegression { .. } => ErrorCategory::State,
            Self::Cancelled => ErrorCategory::Other,
            Self::Config(_) => ErrorCategory::Configuration,
            Self::Sink(_) => ErrorCategory::Delivery,
            Self::Store(_) => ErrorCategory::Delivery,
            Self::Serialization(_) => ErrorCategory::Serialization,
            Self::Json(_) => ErrorCategory::Serialization,
            Self::Io(_) => ErrorCategory::Other,
            Self::PoolClosed => ErrorCategory::Other,
            Self::Other(_) => ErrorCategory::Other,
        }
    }

    /// Get a metric-safe error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            #[cfg(feature = "postgres")]
            Self::Postgres(_) => "postgres_error",
            Self::StorageUnavailable(_) => "storage_unavailable",
            Self::RangeInvalid { .. } => "range_invalid",
            Self::TransientRead(_) => "transient_read",
            Self::RetriesExhausted { .. } => "retries_exhausted",
            Self::StateRegression { .. } => "state_regression",
            Self::Cancelled => "cancelled",
            Self::Config(_) => "config_error",
            Self::Sink(_) => "sink_error",
            Self::Store(_) => "store_error",
            Self::Serialization(_) => "serialization_error",
            Self::Json(_) => "json_error",
            Self::Io(_) => "io_error",
            Self::PoolClosed => "pool_closed",
            Self::Other(_) => "unknown",
        }
    }
}

/// Check if a PostgreSQL error is transient.
#[cfg(feature = "postgres")]
fn is_transient_pg_error(e: &tokio_postgres::Error) -> bool {
    if e.is_closed() {
        return true;
    }
    if let Some(db_error) = e.as_db_error() {
        let code = db_error.code().code();
        // Connection exception class (08xxx)
        if code.starts_with("08") {
            return true;
        }
        // Transaction rollback class (40xxx)
        if code.starts_with("40") {
            return true;
        }
        // Insufficient resources class (53xxx)
        if code.starts_with("53") {
            return true;
        }
        // Operator intervention class (57xxx) - except query_canceled
        if code.starts_with("57") && code != "57014" {
            return true;
        }
        return false;
    }

    let msg = e.to_string().to_lowercase();
    msg.contains("connection") || msg.contains("timeout") || msg.contains("temporarily")
}

/// Result type for scan operations
pub type Result<T> = std::result::Result<T, ScanError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ScanError::range_invalid("16384", "16391");
        assert!(err.to_string().contains("16384"));
        assert!(err.to_string().contains("16391"));

        let err = ScanError::state_regression("public.users", "(5,1)", "(4,9)");
        assert!(err.to_string().contains("public.users"));
    }

    #[test]
    fn test_error_is_retriable() {
        assert!(ScanError::transient("connection reset").is_retriable());
        assert!(ScanError::Io(std::io::Error::from(std::io::ErrorKind::TimedOut)).is_retriable());

        assert!(!ScanError::storage_unavailable("public.users").is_retriable());
        assert!(!ScanError::range_invalid("1", "2").is_retriable());
        assert!(!ScanError::state_regression("s", "2", "1").is_retriable());
        assert!(!ScanError::Cancelled.is_retriable());
    }

    #[test]
    fn test_error_is_fatal() {
        assert!(ScanError::storage_unavailable("gone").is_fatal());
        assert!(ScanError::state_regression("s", "2", "1").is_fatal());
        assert!(ScanError::RetriesExhausted {
            attempts: 4,
            last: "timeout".into()
        }
        .is_fatal());

        assert!(!ScanError::range_invalid("1", "2").is_fatal());
        assert!(!ScanError::Cancelled.is_fatal());
        assert!(!ScanError::transient("x").is_fatal());
    }

    #[test]
    fn test_error_category() {
        assert_eq!(
            ScanError::storage_unavailable("x").category(),
            ErrorCategory::Storage
        );
        assert_eq!(ScanError::transient("x").category(), ErrorCategory::Read);
        assert_eq!(
            ScanError::state_regression("s", "2", "1").category(),
            ErrorCategory::State
        );
        assert_eq!(
            ScanError::config("x").category(),
            ErrorCategory::Configuration
        );
        assert_eq!(ScanError::sink("x").category(), ErrorCategory::Delivery);
    }

    #[test]
    fn test_error_code() {
        assert_eq!(ScanError::range_invalid("1", "2").error_code(), "range_invalid");
        assert_eq!(ScanError::Cancelled.error_code(), "cancelled");
        assert_eq!(ScanError::config("x").error_code(), "config_error");
    }
}
