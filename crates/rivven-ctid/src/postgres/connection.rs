//! PostgreSQL reader sessions.

use super::query::{
    self, fallback_query, max_tuples_per_page, parse_row, position_query, split_by_epoch,
    visibility_bounds, visibility_bounds_query, CTID_COLUMN, ROW_COLUMN, XMAX_COLUMN, XMIN_COLUMN,
};
use crate::common::{
    Chunk, ChunkReader, EngineVersion, PhysicalStorageId, PlannedChunk, Result, ScanConnection,
    ScanConnector, ScanError, ScanRange, ScannedRow, StorageLocator, StreamId, VisibilityWindow,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error};

/// Opens [`PostgresScanConnection`]s from a connection string.
#[derive(Debug, Clone)]
pub struct PostgresConnector {
    conn_str: String,
}

impl PostgresConnector {
    pub fn new(conn_str: impl Into<String>) -> Self {
        Self {
            conn_str: conn_str.into(),
        }
    }
}

#[async_trait]
impl ScanConnector for PostgresConnector {
    async fn connect(&self) -> Result<Arc<dyn ScanConnection>> {
        let connection = PostgresScanConnection::connect(&self.conn_str).await?;
        Ok(Arc::new(connection))
    }
}

/// One PostgreSQL session serving metadata lookups and chunk reads.
///
/// Position reads check the relation filenode before and after the query;
/// a change means the table was rewritten and the range is void.
pub struct PostgresScanConnection {
    client: tokio_postgres::Client,
    version: EngineVersion,
    max_tuples: u32,
}

impl PostgresScanConnection {
    pub async fn connect(conn_str: &str) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(conn_str, tokio_postgres::NoTls)
            .await
            .map_err(|e| ScanError::transient(format!("PostgreSQL connection failed: {}", e)))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("PostgreSQL connection error: {}", e);
            }
        });

        Self::from_client(client).await
    }

    /// Wrap an established client, reading server version and page size.
    pub async fn from_client(client: tokio_postgres::Client) -> Result<Self> {
        let version_num: i32 = client.query_one(query::VERSION_QUERY, &[]).await?.get(0);
        let block_size: i32 = client.query_one(query::BLOCK_SIZE_QUERY, &[]).await?.get(0);

        let version = EngineVersion::from_version_num(version_num.max(0) as u32);
        let max_tuples = max_tuples_per_page(block_size.max(0) as u32);
        debug!(
            "PostgreSQL {} (block size {}, up to {} tuples per page)",
            version, block_size, max_tuples
        );

        Ok(Self {
            client,
            version,
            max_tuples,
        })
    }

    pub fn client(&self) -> &tokio_postgres::Client {
        &self.client
    }

    pub fn version(&self) -> EngineVersion {
        self.version
    }

    async fn filenode(&self, stream: &StreamId) -> Result<PhysicalStorageId> {
        let row = self
            .client
            .query_opt(query::FILENODE_QUERY, &[&stream.namespace, &stream.name])
            .await?;
        match row.and_then(|r| r.get::<_, Option<i64>>(0)) {
            Some(filenode) => Ok(PhysicalStorageId::new(filenode.to_string())),
            None => Err(ScanError::storage_unavailable(format!(
                "table {} does not exist",
                stream
            ))),
        }
    }

    async fn fetch(
        &self,
        stream: &StreamId,
        sql: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> Result<Vec<ScannedRow>> {
        let rows = self
            .client
            .query(sql, params)
            .await
            .map_err(|e| map_query_error(stream, e))?;

        rows.iter()
            .map(|row| {
                let ctid: String = row.try_get(CTID_COLUMN)?;
                let xmin: String = row.try_get(XMIN_COLUMN)?;
                let xmax: i64 = row.try_get(XMAX_COLUMN)?;
                let values: String = row.try_get(ROW_COLUMN)?;
                parse_row(&ctid, &xmin, xmax, &values)
            })
            .collect()
    }

    async fn read_range(
        &self,
        stream: &StreamId,
        storage_id: &PhysicalStorageId,
        range: &ScanRange,
    ) -> Result<Vec<ScannedRow>> {
        let before = self.filenode(stream).await?;
        if &before != storage_id {
            return Err(ScanError::range_invalid(storage_id, before));
        }

        let sql = position_query(stream, range, self.version, self.max_tuples);
        let rows = self.fetch(stream, &sql, &[]).await?;

        let after = self.filenode(stream).await?;
        if &after != storage_id {
            return Err(ScanError::range_invalid(storage_id, after));
        }
        Ok(rows)
    }

    async fn read_window(
        &self,
        stream: &StreamId,
        window: &VisibilityWindow,
    ) -> Result<Vec<ScannedRow>> {
        let sql = fallback_query(stream);
        let mut rows = Vec::new();
        for segment in split_by_epoch(window) {
            let part = self
                .fetch(stream, &sql, &[&segment.after, &segment.through])
                .await?;
            let base = u64::from(segment.epoch) << 32;
            rows.extend(part.into_iter().map(|mut row| {
                // The segment pins the epoch
                row.visibility = base | (row.visibility & u64::from(u32::MAX));
                row
            }));
        }
        Ok(rows)
    }
}

#[async_trait]
impl StorageLocator for PostgresScanConnection {
    async fn resolve(&self, stream: &StreamId) -> Result<PhysicalStorageId> {
        self.filenode(stream).await
    }

    async fn block_count(&self, stream: &StreamId) -> Result<u64> {
        let row = self
            .client
            .query_opt(query::BLOCK_COUNT_QUERY, &[&stream.namespace, &stream.name])
            .await?
            .ok_or_else(|| {
                ScanError::storage_unavailable(format!("table {} does not exist", stream))
            })?;
        let blocks: i64 = row.get(0);
        Ok(blocks.max(0) as u64)
    }

    async fn visibility_watermark(&self) -> Result<u64> {
        let xmin: i64 = self
            .client
            .query_one(query::SNAPSHOT_XMIN_QUERY, &[])
            .await?
            .get(0);
        Ok((xmin.max(1) - 1) as u64)
    }

    async fn visibility_bounds(&self, stream: &StreamId) -> Result<Option<(u64, u64)>> {
        let row = self
            .client
            .query_one(&visibility_bounds_query(stream), &[])
            .await
            .map_err(|e| map_query_error(stream, e))?;
        let xmax: i64 = row.try_get(0)?;
        let raw = [row.try_get(1)?, row.try_get(2)?, row.try_get(3)?, row.try_get(4)?];
        Ok(visibility_bounds(xmax, raw))
    }

    async fn engine_version(&self) -> Result<EngineVersion> {
        Ok(self.version)
    }
}

#[async_trait]
impl ChunkReader for PostgresScanConnection {
    async fn read(&self, stream: &StreamId, chunk: &PlannedChunk) -> Result<Chunk> {
        let rows = match chunk {
            PlannedChunk::Position { storage_id, range } => {
                self.read_range(stream, storage_id, range).await?
            }
            PlannedChunk::Fallback { window } => self.read_window(stream, window).await?,
        };
        debug!("Read {} rows from {} {}", rows.len(), stream, chunk);
        Ok(Chunk::new(rows))
    }
}

/// Primary key columns of a table, in index order.
pub async fn discover_key_columns(
    client: &tokio_postgres::Client,
    stream: &StreamId,
) -> Result<Vec<String>> {
    let rows = client
        .query(query::KEY_COLUMNS_QUERY, &[&stream.namespace, &stream.name])
        .await?;
    Ok(rows.iter().map(|row| row.get(0)).collect())
}

fn map_query_error(stream: &StreamId, e: tokio_postgres::Error) -> ScanError {
    let undefined = e
        .as_db_error()
        .is_some_and(|db| query::is_undefined_table(db.code().code()));
    if undefined {
        ScanError::storage_unavailable(format!("table {} does not exist", stream))
    } else {
        ScanError::Postgres(e)
    }
}
