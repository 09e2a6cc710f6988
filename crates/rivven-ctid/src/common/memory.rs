//! # In-Memory Storage Engine
//!
//! A small heap-organized table store with physical addressing, used to
//! exercise scans without a database server.
//!
//! - Rows live in fixed-capacity blocks; addresses are `(block, slot)` with
//!   slots numbered from 1.
//! - Every write is stamped with a visibility value from a shared counter.
//!   Writes made through [`MemoryDatabase::begin_transaction`] stay invisible
//!   until committed and hold the visibility watermark below their xid.
//! - [`MemoryDatabase::reorganize`] compacts a table into a fresh allocation
//!   with a new storage id, like `VACUUM FULL`.
//! - Faults can be injected: transient read errors, a reorganization in the
//!   middle of a scan, and slow reads.
//!
//! ```rust
//! use rivven_ctid::common::{MemoryDatabase, StreamId};
//!
//! let db = MemoryDatabase::new();
//! let users = StreamId::new("public", "users");
//! db.create_table(&users, 100);
//! db.populate(&users, 250, 50).unwrap();
//!
//! assert_eq!(db.row_count(&users), 250);
//! assert_eq!(db.block_count_of(&users), 3);
//! ```

use crate::common::{
    Chunk, ChunkReader, EngineVersion, PhysicalStorageId, PlannedChunk, Result, RowAddress,
    ScanConnection, ScanConnector, ScanError, ScannedRow, StorageLocator, StreamId,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const FIRST_STORAGE_ID: u32 = 16_384;

#[derive(Debug, Clone)]
struct StoredRow {
    visibility: u64,
    values: Value,
}

#[derive(Debug)]
struct MemoryTable {
    storage_id: PhysicalStorageId,
    tuples_per_block: usize,
    blocks: Vec<Vec<Option<StoredRow>>>,
    next_id: u64,
}

impl MemoryTable {
    fn append(&mut self, row: StoredRow) -> RowAddress {
        let needs_block = self
            .blocks
            .last()
            .map_or(true, |block| block.len() >= self.tuples_per_block);
        if needs_block {
            self.blocks.push(Vec::with_capacity(self.tuples_per_block));
        }
        let block_no = self.blocks.len() - 1;
        let block = &mut self.blocks[block_no];
        block.push(Some(row));
        RowAddress::new(block_no as u64, block.len() as u32)
    }

    fn slot_mut(&mut self, address: RowAddress) -> Option<&mut Option<StoredRow>> {
        let block = self.blocks.get_mut(usize::try_from(address.block).ok()?)?;
        let slot = (address.offset as usize).checked_sub(1)?;
        block.get_mut(slot)
    }

    /// Committed live rows in address order.
    fn live_rows<'a>(
        &'a self,
        in_flight: &'a BTreeSet<u64>,
    ) -> impl Iterator<Item = ScannedRow> + 'a {
        self.blocks.iter().enumerate().flat_map(move |(block_no, block)| {
            block.iter().enumerate().filter_map(move |(slot, row)| {
                row.as_ref()
                    .filter(|row| !in_flight.contains(&row.visibility))
                    .map(|row| {
                        ScannedRow::new(
                            RowAddress::new(block_no as u64, slot as u32 + 1),
                            row.visibility,
                            row.values.clone(),
                        )
                    })
            })
        })
    }
}

/// A read served by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadRecord {
    pub stream: StreamId,
    pub chunk: PlannedChunk,
    pub rows: usize,
}

#[derive(Debug, Default)]
struct Faults {
    transient_failures: u32,
    reorganize_on_read: Option<(StreamId, usize)>,
    read_delay: Option<Duration>,
}

#[derive(Debug)]
struct DatabaseState {
    version: EngineVersion,
    tables: HashMap<StreamId, MemoryTable>,
    next_storage_id: u32,
    next_xid: u64,
    in_flight: BTreeSet<u64>,
    faults: Faults,
    reads: Vec<ReadRecord>,
    failed_reads: usize,
    open_connections: usize,
    max_open_connections: usize,
}

impl DatabaseState {
    fn allocate_storage(&mut self) -> PhysicalStorageId {
        let id = PhysicalStorageId::from(self.next_storage_id);
        self.next_storage_id += 1;
        id
    }

    fn next_xid(&mut self) -> u64 {
        let xid = self.next_xid;
        self.next_xid += 1;
        xid
    }

    /// Every xid below the oldest open transaction has finished.
    fn watermark(&self) -> u64 {
        let horizon = self.in_flight.first().copied().unwrap_or(self.next_xid);
        horizon.saturating_sub(1)
    }

    fn table(&self, stream: &StreamId) -> Result<&MemoryTable> {
        self.tables
            .get(stream)
            .ok_or_else(|| ScanError::storage_unavailable(format!("table {} does not exist", stream)))
    }

    fn table_mut(&mut self, stream: &StreamId) -> Result<&mut MemoryTable> {
        self.tables
            .get_mut(stream)
            .ok_or_else(|| ScanError::storage_unavailable(format!("table {} does not exist", stream)))
    }

    fn reorganize(&mut self, stream: &StreamId) -> Result<PhysicalStorageId> {
        let storage_id = self.allocate_storage();
        let table = self.table_mut(stream)?;

        let rows: Vec<StoredRow> = table
            .blocks
            .drain(..)
            .flatten()
            .flatten()
            .collect();
        table.storage_id = storage_id.clone();
        for row in rows {
            table.append(row);
        }

        debug!("Reorganized {} into storage {}", stream, storage_id);
        Ok(storage_id)
    }
}

/// Shared handle to an in-memory database.
///
/// Clones refer to the same data. Also acts as a [`ScanConnector`].
#[derive(Debug, Clone)]
pub struct MemoryDatabase {
    state: Arc<Mutex<DatabaseState>>,
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::with_version(EngineVersion::new(16, 0))
    }

    pub fn with_version(version: EngineVersion) -> Self {
        Self {
            state: Arc::new(Mutex::new(DatabaseState {
                version,
                tables: HashMap::new(),
                next_storage_id: FIRST_STORAGE_ID,
                next_xid: 1,
                in_flight: BTreeSet::new(),
                faults: Faults::default(),
                reads: Vec::new(),
                failed_reads: 0,
                open_connections: 0,
                max_open_connections: 0,
            })),
        }
    }

    pub fn version(&self) -> EngineVersion {
        self.state.lock().version
    }

    /// Create an empty table. Replaces any existing table of that name.
    pub fn create_table(&self, stream: &StreamId, tuples_per_block: usize) -> PhysicalStorageId {
        let mut state = self.state.lock();
        let storage_id = state.allocate_storage();
        state.tables.insert(
            stream.clone(),
            MemoryTable {
                storage_id: storage_id.clone(),
                tuples_per_block: tuples_per_block.max(1),
                blocks: Vec::new(),
                next_id: 1,
            },
        );
        storage_id
    }

    pub fn drop_table(&self, stream: &StreamId) -> bool {
        self.state.lock().tables.remove(stream).is_some()
    }

    /// Insert one row in its own transaction.
    pub fn insert(&self, stream: &StreamId, values: Value) -> Result<RowAddress> {
        let mut state = self.state.lock();
        let visibility = state.next_xid();
        let table = state.table_mut(stream)?;
        Ok(table.append(StoredRow { visibility, values }))
    }

    /// Allocate an xid whose writes stay invisible until
    /// [`commit`](Self::commit) is called.
    pub fn begin_transaction(&self) -> u64 {
        let mut state = self.state.lock();
        let xid = state.next_xid();
        state.in_flight.insert(xid);
        xid
    }

    /// Insert a row as part of an open transaction.
    pub fn insert_in(&self, xid: u64, stream: &StreamId, values: Value) -> Result<RowAddress> {
        let mut state = self.state.lock();
        if !state.in_flight.contains(&xid) {
            return Err(ScanError::other(format!("transaction {} is not open", xid)));
        }
        let table = state.table_mut(stream)?;
        Ok(table.append(StoredRow {
            visibility: xid,
            values,
        }))
    }

    /// Make an open transaction's rows visible.
    pub fn commit(&self, xid: u64) -> bool {
        self.state.lock().in_flight.remove(&xid)
    }

    /// Insert rows in a single transaction; they share one visibility value.
    pub fn insert_batch(
        &self,
        stream: &StreamId,
        rows: impl IntoIterator<Item = Value>,
    ) -> Result<Vec<RowAddress>> {
        let mut state = self.state.lock();
        let visibility = state.next_xid();
        let table = state.table_mut(stream)?;
        Ok(rows
            .into_iter()
            .map(|values| table.append(StoredRow { visibility, values }))
            .collect())
    }

    /// Insert `count` rows `{"id": n}` with `rows_per_xid` rows per transaction.
    pub fn populate(&self, stream: &StreamId, count: usize, rows_per_xid: usize) -> Result<()> {
        let rows_per_xid = rows_per_xid.max(1);
        let mut state = self.state.lock();
        let mut remaining = count;
        while remaining > 0 {
            let batch = remaining.min(rows_per_xid);
            let visibility = state.next_xid();
            let table = state.table_mut(stream)?;
            for _ in 0..batch {
                let values = json!({ "id": table.next_id });
                table.next_id += 1;
                table.append(StoredRow { visibility, values });
            }
            remaining -= batch;
        }
        Ok(())
    }

    /// Delete a row in place. Returns whether a live row was there.
    pub fn delete(&self, stream: &StreamId, address: RowAddress) -> Result<bool> {
        let mut state = self.state.lock();
        let table = state.table_mut(stream)?;
        Ok(table
            .slot_mut(address)
            .and_then(|slot| slot.take())
            .is_some())
    }

    /// Write a new row version at the end of the table and retire the old one.
    pub fn update(&self, stream: &StreamId, address: RowAddress, values: Value) -> Result<RowAddress> {
        let mut state = self.state.lock();
        let visibility = state.next_xid();
        let table = state.table_mut(stream)?;
        if table.slot_mut(address).and_then(|slot| slot.take()).is_none() {
            return Err(ScanError::other(format!(
                "no live row at {} in {}",
                address, stream
            )));
        }
        Ok(table.append(StoredRow { visibility, values }))
    }

    /// Rewrite a table into a new allocation (`VACUUM FULL`).
    pub fn reorganize(&self, stream: &StreamId) -> Result<PhysicalStorageId> {
        self.state.lock().reorganize(stream)
    }

    /// Burn visibility values, as concurrent transactions elsewhere would.
    pub fn advance_xid(&self, count: u64) {
        self.state.lock().next_xid += count;
    }

    pub fn storage_id_of(&self, stream: &StreamId) -> Option<PhysicalStorageId> {
        self.state
            .lock()
            .tables
            .get(stream)
            .map(|t| t.storage_id.clone())
    }

    pub fn block_count_of(&self, stream: &StreamId) -> u64 {
        self.state
            .lock()
            .tables
            .get(stream)
            .map_or(0, |t| t.blocks.len() as u64)
    }

    pub fn row_count(&self, stream: &StreamId) -> usize {
        let state = self.state.lock();
        state
            .tables
            .get(stream)
            .map_or(0, |t| t.live_rows(&state.in_flight).count())
    }

    /// All committed live rows in address order.
    pub fn rows(&self, stream: &StreamId) -> Vec<ScannedRow> {
        let state = self.state.lock();
        state
            .tables
            .get(stream)
            .map(|t| t.live_rows(&state.in_flight).collect())
            .unwrap_or_default()
    }

    /// Fail the next `count` reads with a transient error.
    pub fn fail_next_reads(&self, count: u32) {
        self.state.lock().faults.transient_failures = count;
    }

    /// Reorganize `stream` right before serving its `nth` read from now on
    /// (1-based).
    pub fn reorganize_on_read(&self, stream: &StreamId, nth: usize) {
        self.state.lock().faults.reorganize_on_read = Some((stream.clone(), nth.max(1)));
    }

    pub fn set_read_delay(&self, delay: Option<Duration>) {
        self.state.lock().faults.read_delay = delay;
    }

    /// Reads served successfully, oldest first.
    pub fn reads(&self) -> Vec<ReadRecord> {
        self.state.lock().reads.clone()
    }

    pub fn reads_of(&self, stream: &StreamId) -> Vec<ReadRecord> {
        self.state
            .lock()
            .reads
            .iter()
            .filter(|r| &r.stream == stream)
            .cloned()
            .collect()
    }

    pub fn clear_reads(&self) {
        self.state.lock().reads.clear();
    }

    pub fn failed_reads(&self) -> usize {
        self.state.lock().failed_reads
    }

    pub fn open_connections(&self) -> usize {
        self.state.lock().open_connections
    }

    /// Highest number of simultaneously open sessions seen.
    pub fn max_open_connections(&self) -> usize {
        self.state.lock().max_open_connections
    }

    fn read_chunk(&self, stream: &StreamId, chunk: &PlannedChunk) -> Result<Chunk> {
        let mut state = self.state.lock();

        if state.faults.transient_failures > 0 {
            state.faults.transient_failures -= 1;
            state.failed_reads += 1;
            return Err(ScanError::transient(format!(
                "connection reset while reading {} {}",
                stream, chunk
            )));
        }

        let reorganize_now = match &mut state.faults.reorganize_on_read {
            Some((target, remaining)) if *target == *stream => {
                *remaining -= 1;
                *remaining == 0
            }
            _ => false,
        };
        if reorganize_now {
            state.faults.reorganize_on_read = None;
            state.reorganize(stream)?;
        }

        let table = state.table(stream)?;
        let in_flight = &state.in_flight;
        let rows: Vec<ScannedRow> = match chunk {
            PlannedChunk::Position { storage_id, range } => {
                if *storage_id != table.storage_id {
                    return Err(ScanError::range_invalid(storage_id, &table.storage_id));
                }
                let (first, end) = range.block_span();
                let end = end.min(table.blocks.len() as u64);
                (first..end)
                    .flat_map(|block_no| {
                        let block = &table.blocks[block_no as usize];
                        block.iter().enumerate().filter_map(move |(slot, row)| {
                            row.as_ref()
                                .filter(|row| !in_flight.contains(&row.visibility))
                                .map(|row| {
                                    ScannedRow::new(
                                        RowAddress::new(block_no, slot as u32 + 1),
                                        row.visibility,
                                        row.values.clone(),
                                    )
                                })
                        })
                    })
                    .filter(|row| range.contains(&row.address))
                    .collect()
            }
            PlannedChunk::Fallback { window } => {
                let mut rows: Vec<_> = table
                    .live_rows(in_flight)
                    .filter(|row| window.contains(row.visibility))
                    .collect();
                rows.sort_by_key(|row| (row.visibility, row.address));
                rows
            }
        };

        state.reads.push(ReadRecord {
            stream: stream.clone(),
            chunk: chunk.clone(),
            rows: rows.len(),
        });
        Ok(Chunk::new(rows))
    }
}

#[async_trait]
impl ScanConnector for MemoryDatabase {
    async fn connect(&self) -> Result<Arc<dyn ScanConnection>> {
        {
            let mut state = self.state.lock();
            state.open_connections += 1;
            state.max_open_connections = state.max_open_connections.max(state.open_connections);
        }
        Ok(Arc::new(MemoryConnection { db: self.clone() }))
    }
}

/// A session on a [`MemoryDatabase`].
#[derive(Debug)]
pub struct MemoryConnection {
    db: MemoryDatabase,
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        let mut state = self.db.state.lock();
        state.open_connections = state.open_connections.saturating_sub(1);
    }
}

#[async_trait]
impl StorageLocator for MemoryConnection {
    async fn resolve(&self, stream: &StreamId) -> Result<PhysicalStorageId> {
        let state = self.db.state.lock();
        Ok(state.table(stream)?.storage_id.clone())
    }

    async fn block_count(&self, stream: &StreamId) -> Result<u64> {
        let state = self.db.state.lock();
        Ok(state.table(stream)?.blocks.len() as u64)
    }

    async fn visibility_watermark(&self) -> Result<u64> {
        Ok(self.db.state.lock().watermark())
    }

    async fn visibility_bounds(&self, stream: &StreamId) -> Result<Option<(u64, u64)>> {
        let state = self.db.state.lock();
        let table = state.table(stream)?;
        let mut visibility = table.live_rows(&state.in_flight).map(|row| row.visibility);
        let first = match visibility.next() {
            Some(v) => v,
            None => return Ok(None),
        };
        Ok(Some(visibility.fold((first, first), |(low, high), v| {
            (low.min(v), high.max(v))
        })))
    }

    async fn engine_version(&self) -> Result<EngineVersion> {
        Ok(self.db.version())
    }
}

#[async_trait]
impl ChunkReader for MemoryConnection {
    async fn read(&self, stream: &StreamId, chunk: &PlannedChunk) -> Result<Chunk> {
        let delay = self.db.state.lock().faults.read_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.db.read_chunk(stream, chunk)
    }
}
