//! # Connection Pool
//!
//! Bounds how many reader sessions are open at once across all streams.
//!
//! Admission is a semaphore: a stream scan that finds the pool saturated
//! waits until a sibling finishes. The permit travels with the
//! [`PooledConnection`] and is released when the session is dropped.

use crate::common::{ChunkReader, Result, ScanError, StorageLocator};
use async_trait::async_trait;
use std::ops::Deref;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A reader session: metadata lookups plus chunk reads.
pub trait ScanConnection: StorageLocator + ChunkReader {}

impl<T: StorageLocator + ChunkReader> ScanConnection for T {}

/// Opens reader sessions.
#[async_trait]
pub trait ScanConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn ScanConnection>>;
}

/// Bounded pool of reader sessions.
pub struct ConnectionPool {
    connector: Arc<dyn ScanConnector>,
    semaphore: Arc<Semaphore>,
    size: usize,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn ScanConnector>, size: usize) -> Self {
        let size = size.max(1);
        Self {
            connector,
            semaphore: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Sessions that could be opened right now without waiting.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Wait for admission, then open a session.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<PooledConnection> {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ScanError::Cancelled),
            permit = self.semaphore.clone().acquire_owned() => {
                permit.map_err(|_| ScanError::PoolClosed)?
            }
        };

        let connection = self.connector.connect().await?;
        debug!(
            "Opened reader session ({} of {} in use)",
            self.size - self.semaphore.available_permits(),
            self.size
        );

        Ok(PooledConnection {
            connection,
            _permit: permit,
        })
    }

    /// Refuse further admissions. Open sessions are unaffected.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }
}

/// A reader session holding a pool slot.
pub struct PooledConnection {
    connection: Arc<dyn ScanConnection>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledConnection {
    type Target = dyn ScanConnection;

    fn deref(&self) -> &Self::Target {
        self.connection.as_ref()
    }
}
