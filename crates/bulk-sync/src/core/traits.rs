//! Seams between the engine and the databases it talks to.
//!
//! Every connection is exclusively owned by one unit of work (`&mut self`):
//! the orchestrator opens a fresh source connection per range and drops it
//! when the range finishes.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::core::{Batch, Column, TableRef};
use crate::error::Result;
use crate::planner::KeyDomain;

/// Half-open scan `lower <= filter_column < upper` over a source table.
#[derive(Debug, Clone)]
pub struct RangeScan<'a> {
    pub table: &'a TableRef,
    pub columns: &'a [Column],
    pub filter_column: &'a str,
    pub lower: i64,
    pub upper: i64,
    /// Rows per emitted batch.
    pub batch_size: usize,
}

/// Where a set-based load reads its chunks from.
#[derive(Clone)]
pub struct CopySource {
    /// Wildcard URL handed to `COPY INTO`, e.g. `https://acct.blob.core.windows.net/c/p/T/00004/*`.
    pub url: String,
    /// Object-store prefix the wildcard expands under.
    pub prefix: String,
    /// Storage account key for the `CREDENTIAL` clause.
    pub secret: Option<String>,
}

impl std::fmt::Debug for CopySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CopySource")
            .field("url", &self.url)
            .field("prefix", &self.prefix)
            .field("secret", &self.secret.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Read-only aggregate queries used by reconciliation. Both sides implement it.
#[async_trait]
pub trait TableProbe: Send {
    /// `COUNT_BIG(*)`.
    async fn row_count(&mut self, table: &TableRef) -> Result<u64>;

    /// Number of distinct key values appearing more than once.
    async fn duplicate_keys(&mut self, table: &TableRef, key_column: &str) -> Result<u64>;

    /// Number of NULLs in `column`.
    async fn null_count(&mut self, table: &TableRef, column: &str) -> Result<u64>;

    /// `(MIN, MAX)` of an integer column, `None` for an empty table.
    async fn key_bounds(&mut self, table: &TableRef, column: &str) -> Result<Option<(i64, i64)>>;

    /// `(SUM, AVG)` of a numeric column as floating point.
    async fn sum_avg(&mut self, table: &TableRef, column: &str)
        -> Result<(Option<f64>, Option<f64>)>;
}

/// A connection to the database rows are exported from.
#[async_trait]
pub trait SourceReader: TableProbe {
    /// Round-trip `SELECT 1`.
    async fn ping(&mut self) -> Result<()>;

    /// Column list in ordinal order.
    async fn describe_table(&mut self, table: &TableRef) -> Result<Vec<Column>>;

    /// Key extent and row count, `None` for an empty table.
    async fn key_domain(&mut self, table: &TableRef, key_column: &str)
        -> Result<Option<KeyDomain>>;

    /// `MAX(column)`, `None` for an empty table.
    async fn max_value(&mut self, table: &TableRef, column: &str) -> Result<Option<i64>>;

    /// Rows the scan would return.
    async fn count_range(&mut self, scan: &RangeScan<'_>) -> Result<u64>;

    /// Stream the scan's rows in unordered batches of at most `scan.batch_size`.
    ///
    /// A failed scan returns the error; it may also be sent down the channel
    /// first. Streaming stops early without error if the receiver is dropped.
    async fn stream_range(
        &mut self,
        scan: &RangeScan<'_>,
        tx: mpsc::Sender<Result<Batch>>,
    ) -> Result<()>;
}

/// A connection to the database rows are loaded into.
#[async_trait]
pub trait TargetWriter: TableProbe {
    /// Round-trip `SELECT 1`.
    async fn ping(&mut self) -> Result<()>;

    /// Column names in ordinal order, `None` when the table doesn't exist.
    async fn table_columns(&mut self, table: &TableRef) -> Result<Option<Vec<String>>>;

    /// Create `table` distributed on `key_column`.
    async fn create_table(
        &mut self,
        table: &TableRef,
        columns: &[Column],
        key_column: &str,
    ) -> Result<()>;

    /// Delete `lower <= column < upper`. Returns rows deleted.
    async fn delete_range(
        &mut self,
        table: &TableRef,
        column: &str,
        lower: i64,
        upper: i64,
    ) -> Result<u64>;

    /// Load every chunk under `source` in one statement. Returns rows loaded.
    async fn copy_into(
        &mut self,
        table: &TableRef,
        columns: &[Column],
        source: &CopySource,
    ) -> Result<u64>;
}

/// Opens connections on demand.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn source(&self) -> Result<Box<dyn SourceReader>>;
    async fn target(&self) -> Result<Box<dyn TargetWriter>>;
}
