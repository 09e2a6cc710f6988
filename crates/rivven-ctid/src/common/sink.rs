//! Row delivery.
//!
//! The scan loop hands each batch of rows to a [`RowSink`] and only
//! checkpoints once `emit` returned `Ok`. Returning means the rows are
//! accepted; what happens to them afterwards is the sink's business.

use crate::common::{Result, ScanError, ScannedRow, StreamId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

/// Downstream consumer of scanned rows.
#[async_trait]
pub trait RowSink: Send + Sync {
    /// Accept rows of one stream, in scan order.
    async fn emit(&self, stream: &StreamId, rows: Vec<ScannedRow>) -> Result<()>;
}

/// Shared handle to a row sink.
pub type SharedRowSink = Arc<dyn RowSink>;

/// Collects rows in memory, per stream.
#[derive(Debug, Default)]
pub struct MemoryRowSink {
    rows: RwLock<HashMap<StreamId, Vec<ScannedRow>>>,
}

impl MemoryRowSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All rows received for a stream, in arrival order.
    pub async fn rows(&self, stream: &StreamId) -> Vec<ScannedRow> {
        self.rows
            .read()
            .await
            .get(stream)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn count(&self, stream: &StreamId) -> usize {
        self.rows.read().await.get(stream).map_or(0, Vec::len)
    }

    pub async fn clear(&self) {
        self.rows.write().await.clear();
    }
}

#[async_trait]
impl RowSink for MemoryRowSink {
    async fn emit(&self, stream: &StreamId, rows: Vec<ScannedRow>) -> Result<()> {
        self.rows
            .write()
            .await
            .entry(stream.clone())
            .or_default()
            .extend(rows);
        Ok(())
    }
}

/// A batch of rows sent through a [`ChannelRowSink`].
#[derive(Debug, Clone)]
pub struct RowBatch {
    pub stream: StreamId,
    pub rows: Vec<ScannedRow>,
}

/// Forwards rows into a bounded channel.
///
/// A full channel blocks the scan loop, so a slow consumer throttles reads.
#[derive(Debug, Clone)]
pub struct ChannelRowSink {
    tx: mpsc::Sender<RowBatch>,
}

impl ChannelRowSink {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<RowBatch>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl RowSink for ChannelRowSink {
    async fn emit(&self, stream: &StreamId, rows: Vec<ScannedRow>) -> Result<()> {
        self.tx
            .send(RowBatch {
                stream: stream.clone(),
                rows,
            })
            .await
            .map_err(|_| ScanError::sink("row channel closed"))
    }
}
