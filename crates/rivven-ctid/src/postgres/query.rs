//! SQL text and result parsing for tuple-identifier scans.
//!
//! Everything here is pure so it can be tested without a server.
//!
//! | Server | Position predicate |
//! |---|---|
//! | 14+ | `ctid >= '(a,0)'::tid AND ctid < '(b,0)'::tid` (TID range scan) |
//! | 12, 13 | `ctid = ANY(ARRAY(<every candidate tid of the blocks>))` (TID scan) |
//! | < 12 | position scans not offered, fallback on `xmin` |

use crate::common::{
    EngineVersion, Result, RowAddress, ScanError, ScanRange, ScannedRow, StreamId,
    VisibilityWindow,
};

/// Size of the page header in bytes.
const PAGE_HEADER_SIZE: u32 = 24;
/// Minimum footprint of one heap tuple: aligned tuple header plus line pointer.
const MIN_TUPLE_FOOTPRINT: u32 = 28;

pub(crate) const CTID_COLUMN: &str = "__rivven_ctid";
pub(crate) const XMIN_COLUMN: &str = "__rivven_xmin";
pub(crate) const XMAX_COLUMN: &str = "__rivven_xmax";
pub(crate) const ROW_COLUMN: &str = "__rivven_row";

pub(crate) const VERSION_QUERY: &str = "SELECT current_setting('server_version_num')::int";

pub(crate) const BLOCK_SIZE_QUERY: &str = "SELECT current_setting('block_size')::int";

pub(crate) const FILENODE_QUERY: &str = r#"
    SELECT pg_relation_filenode(c.oid)::bigint
    FROM pg_class c
    JOIN pg_namespace n ON n.oid = c.relnamespace
    WHERE n.nspname = $1 AND c.relname = $2
"#;

pub(crate) const BLOCK_COUNT_QUERY: &str = r#"
    SELECT (pg_relation_size(c.oid) / current_setting('block_size')::bigint)::bigint
    FROM pg_class c
    JOIN pg_namespace n ON n.oid = c.relnamespace
    WHERE n.nspname = $1 AND c.relname = $2
"#;

/// Epoch-extended snapshot xmin. Every xid below it has committed or
/// aborted; xids from xmin up to xmax may still be in flight.
pub(crate) const SNAPSHOT_XMIN_QUERY: &str =
    "SELECT txid_snapshot_xmin(txid_current_snapshot())::bigint";

pub(crate) const KEY_COLUMNS_QUERY: &str = r#"
    SELECT a.attname
    FROM pg_index i
    JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
    JOIN pg_class c ON c.oid = i.indrelid
    JOIN pg_namespace n ON n.oid = c.relnamespace
    WHERE n.nspname = $1 AND c.relname = $2
    AND i.indisprimary
    ORDER BY array_position(i.indkey, a.attnum)
"#;

/// Most tuples a heap page of `block_size` bytes can hold.
pub fn max_tuples_per_page(block_size: u32) -> u32 {
    block_size.saturating_sub(PAGE_HEADER_SIZE) / MIN_TUPLE_FOOTPRINT
}

/// Quote an identifier, doubling embedded quotes.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

pub fn qualified_name(stream: &StreamId) -> String {
    format!("{}.{}", quote_ident(&stream.namespace), quote_ident(&stream.name))
}

fn tid_literal(address: &RowAddress) -> String {
    format!("'({},{})'::tid", address.block, address.offset)
}

fn select_list() -> String {
    format!(
        "t.ctid::text AS {}, t.xmin::text AS {}, \
         txid_snapshot_xmax(txid_current_snapshot())::bigint AS {}, \
         row_to_json(t)::text AS {}",
        CTID_COLUMN, XMIN_COLUMN, XMAX_COLUMN, ROW_COLUMN
    )
}

/// Query for the rows of one address range, ordered by `ctid`.
pub fn position_query(
    stream: &StreamId,
    range: &ScanRange,
    version: EngineVersion,
    max_tuples: u32,
) -> String {
    let predicate = if version.supports_tid_range_scan() {
        format!(
            "t.ctid >= {} AND t.ctid < {}",
            tid_literal(&range.lower),
            tid_literal(&range.upper)
        )
    } else {
        let (first, end) = range.block_span();
        let mut predicate = format!(
            "t.ctid = ANY(ARRAY(SELECT format('(%s,%s)', i, j)::tid \
             FROM generate_series({}, {}) AS i, generate_series(1, {}) AS j))",
            first,
            end.saturating_sub(1),
            max_tuples
        );
        if range.lower.offset > 0 {
            predicate.push_str(&format!(" AND t.ctid >= {}", tid_literal(&range.lower)));
        }
        if range.upper.offset > 0 {
            predicate.push_str(&format!(" AND t.ctid < {}", tid_literal(&range.upper)));
        }
        predicate
    };

    format!(
        "SELECT {} FROM {} AS t WHERE {} ORDER BY t.ctid",
        select_list(),
        qualified_name(stream),
        predicate
    )
}

/// Query for rows whose 32-bit `xmin` lies in `($1, $2]`, ordered by `xmin`.
pub fn fallback_query(stream: &StreamId) -> String {
    format!(
        "SELECT {} FROM {} AS t \
         WHERE t.xmin::text::bigint > $1 AND t.xmin::text::bigint <= $2 \
         ORDER BY t.xmin::text::bigint, t.ctid",
        select_list(),
        qualified_name(stream)
    )
}

/// Lowest and highest raw `xmin` of the table's visible rows, split at the
/// low 32 bits of the snapshot xmax so each side can be epoch-extended.
///
/// Columns: snapshot xmax, then min/max of the current-epoch side, then
/// min/max of the previous-epoch side. Aggregates are NULL on an empty table.
pub fn visibility_bounds_query(stream: &StreamId) -> String {
    format!(
        "WITH snap AS (\
             SELECT txid_snapshot_xmax(txid_current_snapshot())::bigint AS xmax), \
         r AS (SELECT t.xmin::text::bigint AS x FROM {} AS t) \
         SELECT (SELECT xmax FROM snap), \
         min(x) FILTER (WHERE x <= ((SELECT xmax FROM snap) & 4294967295)), \
         max(x) FILTER (WHERE x <= ((SELECT xmax FROM snap) & 4294967295)), \
         min(x) FILTER (WHERE x > ((SELECT xmax FROM snap) & 4294967295)), \
         max(x) FILTER (WHERE x > ((SELECT xmax FROM snap) & 4294967295)) \
         FROM r",
        qualified_name(stream)
    )
}

/// Epoch-extended `(lowest, highest)` visibility from the raw aggregates of
/// [`visibility_bounds_query`]. `None` when the table has no visible rows.
pub fn visibility_bounds(snapshot_xmax: i64, raw: [Option<i64>; 4]) -> Option<(u64, u64)> {
    let xmax = snapshot_xmax.max(0) as u64;
    let extended: Vec<u64> = raw
        .iter()
        .flatten()
        .map(|&x| extend_xid(x as u32, xmax))
        .collect();
    let low = extended.iter().min()?;
    let high = extended.iter().max()?;
    Some((*low, *high))
}

/// Part of a visibility window inside a single xid epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochSegment {
    pub epoch: u32,
    /// Exclusive lower bound on the 32-bit xid
    pub after: i64,
    /// Inclusive upper bound on the 32-bit xid
    pub through: i64,
}

/// Split an epoch-extended window into per-epoch 32-bit windows.
pub fn split_by_epoch(window: &VisibilityWindow) -> Vec<EpochSegment> {
    if window.is_empty() {
        return Vec::new();
    }

    let first_epoch = (window.after + 1) >> 32;
    let last_epoch = window.through >> 32;

    (first_epoch..=last_epoch)
        .map(|epoch| {
            let base = epoch << 32;
            let after = window.after.max(base.saturating_sub(1));
            let through = window.through.min(base | u64::from(u32::MAX));
            EpochSegment {
                epoch: epoch as u32,
                after: after as i64 - base as i64,
                through: (through - base) as i64,
            }
        })
        .collect()
}

/// Extend a 32-bit xid to 64 bits, relative to a settled snapshot xmax.
pub fn extend_xid(xid: u32, snapshot_xmax: u64) -> u64 {
    let epoch = snapshot_xmax >> 32;
    let candidate = (epoch << 32) | u64::from(xid);
    if candidate > snapshot_xmax && epoch > 0 {
        candidate - (1u64 << 32)
    } else {
        candidate
    }
}

/// Build a row from the text columns of a scan query.
pub fn parse_row(ctid: &str, xmin: &str, snapshot_xmax: i64, row: &str) -> Result<ScannedRow> {
    let address: RowAddress = ctid.parse()?;
    let xid: u32 = xmin
        .parse()
        .map_err(|e| ScanError::serialization(format!("Invalid xmin {:?}: {}", xmin, e)))?;
    let values: serde_json::Value = serde_json::from_str(row)?;

    Ok(ScannedRow::new(
        address,
        extend_xid(xid, snapshot_xmax.max(0) as u64),
        values,
    ))
}

/// Classify a server error: a missing relation means the table is gone.
pub fn is_undefined_table(code: &str) -> bool {
    code == "42P01"
}
