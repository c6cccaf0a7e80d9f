//! In-memory source used by tests and dry runs.
//!
//! Rows live behind a shared handle so a test can keep inspecting (and
//! mutating) the data while the orchestrator holds connections to it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::core::{Batch, Column, RangeScan, Row, SourceReader, SqlValue, TableProbe, TableRef};
use crate::error::{Result, SyncError};
use crate::planner::KeyDomain;

#[derive(Debug, Default)]
struct TableData {
    columns: Vec<Column>,
    rows: Vec<Row>,
}

#[derive(Debug, Clone, Copy)]
struct Failure {
    remaining: u32,
    mid_stream: bool,
}

#[derive(Debug, Default)]
struct State {
    tables: HashMap<TableRef, TableData>,
    /// Injected failures keyed by scan lower bound.
    failures: HashMap<i64, Failure>,
    /// Lower bound of every scan that started streaming.
    streamed: Vec<i64>,
    /// Rows inserted right after the next `MAX(column)` read.
    pending_inserts: Vec<(TableRef, Vec<Row>)>,
    connections: usize,
}

/// Shared handle to an in-memory database.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    state: Arc<Mutex<State>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create or replace a table.
    pub fn add_table(&self, table: TableRef, columns: Vec<Column>, rows: Vec<Row>) {
        self.lock().tables.insert(table, TableData { columns, rows });
    }

    /// Append rows to an existing table, simulating a live source.
    pub fn append_rows(&self, table: &TableRef, rows: Vec<Row>) {
        if let Some(data) = self.lock().tables.get_mut(table) {
            data.rows.extend(rows);
        }
    }

    /// Insert `rows` as soon as the next `MAX(column)` query has been answered,
    /// simulating a writer racing the snapshot read.
    pub fn insert_after_next_max(&self, table: &TableRef, rows: Vec<Row>) {
        self.lock().pending_inserts.push((table.clone(), rows));
    }

    /// Fail the next `times` scans starting at `lower` before any row is sent.
    pub fn fail_range(&self, lower: i64, times: u32) {
        self.lock().failures.insert(
            lower,
            Failure {
                remaining: times,
                mid_stream: false,
            },
        );
    }

    /// Fail the next `times` scans starting at `lower` after the first batch.
    pub fn fail_mid_stream(&self, lower: i64, times: u32) {
        self.lock().failures.insert(
            lower,
            Failure {
                remaining: times,
                mid_stream: true,
            },
        );
    }

    /// Remove all injected failures.
    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Number of scans that reached the streaming stage.
    pub fn stream_calls(&self) -> usize {
        self.lock().streamed.len()
    }

    /// Lower bounds of streamed scans, in call order.
    pub fn streamed_lowers(&self) -> Vec<i64> {
        self.lock().streamed.clone()
    }

    /// Connections opened so far.
    pub fn connections(&self) -> usize {
        self.lock().connections
    }

    /// Open a connection.
    pub fn connect(&self) -> MemorySourceConnection {
        self.lock().connections += 1;
        MemorySourceConnection {
            source: self.clone(),
        }
    }
}

/// One connection to a [`MemorySource`].
#[derive(Debug)]
pub struct MemorySourceConnection {
    source: MemorySource,
}

impl MemorySourceConnection {
    fn with_table<T>(&self, table: &TableRef, f: impl FnOnce(&TableData) -> Result<T>) -> Result<T> {
        let state = self.source.lock();
        let data = state
            .tables
            .get(table)
            .ok_or_else(|| SyncError::Config(format!("table {} not found", table.full_name())))?;
        f(data)
    }

    fn column_values(
        &self,
        table: &TableRef,
        column: &str,
    ) -> Result<Vec<SqlValue>> {
        self.with_table(table, |data| {
            let idx = column_index(&data.columns, table, column)?;
            Ok(data.rows.iter().map(|r| r[idx].clone()).collect())
        })
    }

    fn scan_rows(&self, scan: &RangeScan<'_>) -> Result<Vec<Row>> {
        self.with_table(scan.table, |data| {
            let filter_idx = column_index(&data.columns, scan.table, scan.filter_column)?;
            let projection = scan
                .columns
                .iter()
                .map(|c| column_index(&data.columns, scan.table, &c.name))
                .collect::<Result<Vec<_>>>()?;
            Ok(data
                .rows
                .iter()
                .filter(|row| {
                    row[filter_idx]
                        .as_i64()
                        .is_some_and(|k| k >= scan.lower && k < scan.upper)
                })
                .map(|row| projection.iter().map(|&i| row[i].clone()).collect())
                .collect())
        })
    }

    fn take_failure(&self, lower: i64) -> Option<bool> {
        let mut state = self.source.lock();
        let failure = state.failures.get_mut(&lower)?;
        if failure.remaining == 0 {
            return None;
        }
        failure.remaining -= 1;
        Some(failure.mid_stream)
    }
}

fn column_index(columns: &[Column], table: &TableRef, name: &str) -> Result<usize> {
    columns
        .iter()
        .position(|c| c.name.eq_ignore_ascii_case(name))
        .ok_or_else(|| {
            SyncError::Config(format!(
                "column {} not found in {}",
                name,
                table.full_name()
            ))
        })
}

fn injected(lower: i64) -> SyncError {
    SyncError::transient(format!("scan at {}", lower), "injected connection reset")
}

#[async_trait]
impl TableProbe for MemorySourceConnection {
    async fn row_count(&mut self, table: &TableRef) -> Result<u64> {
        self.with_table(table, |data| Ok(data.rows.len() as u64))
    }

    async fn duplicate_keys(&mut self, table: &TableRef, key_column: &str) -> Result<u64> {
        Ok(count_duplicates(&self.column_values(table, key_column)?))
    }

    async fn null_count(&mut self, table: &TableRef, column: &str) -> Result<u64> {
        let values = self.column_values(table, column)?;
        Ok(values.iter().filter(|v| v.is_null()).count() as u64)
    }

    async fn key_bounds(&mut self, table: &TableRef, column: &str) -> Result<Option<(i64, i64)>> {
        Ok(bounds(&self.column_values(table, column)?))
    }

    async fn sum_avg(
        &mut self,
        table: &TableRef,
        column: &str,
    ) -> Result<(Option<f64>, Option<f64>)> {
        Ok(sum_avg(&self.column_values(table, column)?))
    }
}

#[async_trait]
impl SourceReader for MemorySourceConnection {
    async fn ping(&mut self) -> Result<()> {
        Ok(())
    }

    async fn describe_table(&mut self, table: &TableRef) -> Result<Vec<Column>> {
        self.with_table(table, |data| Ok(data.columns.clone()))
    }

    async fn key_domain(&mut self, table: &TableRef, key_column: &str) -> Result<Option<KeyDomain>> {
        let values = self.column_values(table, key_column)?;
        Ok(bounds(&values).map(|(min_key, max_key)| KeyDomain {
            min_key,
            max_key,
            total_rows: values.len() as u64,
        }))
    }

    async fn max_value(&mut self, table: &TableRef, column: &str) -> Result<Option<i64>> {
        let max = bounds(&self.column_values(table, column)?).map(|(_, max)| max);
        let pending = std::mem::take(&mut self.source.lock().pending_inserts);
        for (table, rows) in pending {
            self.source.append_rows(&table, rows);
        }
        Ok(max)
    }

    async fn count_range(&mut self, scan: &RangeScan<'_>) -> Result<u64> {
        Ok(self.scan_rows(scan)?.len() as u64)
    }

    async fn stream_range(
        &mut self,
        scan: &RangeScan<'_>,
        tx: mpsc::Sender<Result<Batch>>,
    ) -> Result<()> {
        self.source.lock().streamed.push(scan.lower);

        let failure = self.take_failure(scan.lower);
        if failure == Some(false) {
            let _ = tx.send(Err(injected(scan.lower))).await;
            return Err(injected(scan.lower));
        }

        let rows = self.scan_rows(scan)?;
        let mut sent = 0usize;
        for chunk in rows.chunks(scan.batch_size.max(1)) {
            if sent == 1 && failure == Some(true) {
                let _ = tx.send(Err(injected(scan.lower))).await;
                return Err(injected(scan.lower));
            }
            if tx.send(Ok(Batch::new(chunk.to_vec()))).await.is_err() {
                // Receiver gone: the exporter already failed.
                return Ok(());
            }
            sent += 1;
        }
        Ok(())
    }
}

/// Distinct values occurring more than once, ignoring NULLs.
pub(crate) fn count_duplicates(values: &[SqlValue]) -> u64 {
    let mut seen: HashMap<i64, u32> = HashMap::new();
    for k in values.iter().filter_map(SqlValue::as_i64) {
        *seen.entry(k).or_default() += 1;
    }
    seen.values().filter(|&&n| n > 1).count() as u64
}

pub(crate) fn bounds(values: &[SqlValue]) -> Option<(i64, i64)> {
    let mut keys = values.iter().filter_map(SqlValue::as_i64);
    let first = keys.next()?;
    Some(keys.fold((first, first), |(lo, hi), k| (lo.min(k), hi.max(k))))
}

pub(crate) fn sum_avg(values: &[SqlValue]) -> (Option<f64>, Option<f64>) {
    let nums: Vec<f64> = values.iter().filter_map(SqlValue::as_f64).collect();
    if nums.is_empty() {
        return (None, None);
    }
    let sum: f64 = nums.iter().sum();
    (Some(sum), Some(sum / nums.len() as f64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SqlNullType;

    fn seeded() -> (MemorySource, TableRef) {
        let source = MemorySource::new();
        let table = TableRef::new("dbo", "T");
        source.add_table(
            table.clone(),
            vec![Column::new("id", "bigint"), Column::new("amount", "float")],
            vec![
                vec![SqlValue::I64(5), SqlValue::F64(1.0)],
                vec![SqlValue::I64(1), SqlValue::F64(2.0)],
                vec![SqlValue::I64(5), SqlValue::Null(SqlNullType::F64)],
                vec![SqlValue::I64(9), SqlValue::F64(3.0)],
            ],
        );
        (source, table)
    }

    #[tokio::test]
    async fn test_probe_queries() {
        let (source, table) = seeded();
        let mut conn = source.connect();
        assert_eq!(conn.row_count(&table).await.unwrap(), 4);
        assert_eq!(conn.duplicate_keys(&table, "id").await.unwrap(), 1);
        assert_eq!(conn.null_count(&table, "amount").await.unwrap(), 1);
        assert_eq!(conn.key_bounds(&table, "id").await.unwrap(), Some((1, 9)));
        assert_eq!(
            conn.sum_avg(&table, "amount").await.unwrap(),
            (Some(6.0), Some(2.0))
        );
    }

    #[tokio::test]
    async fn test_key_domain_and_unknown_table() {
        let (source, table) = seeded();
        let mut conn = source.connect();
        let domain = conn.key_domain(&table, "id").await.unwrap().unwrap();
        assert_eq!((domain.min_key, domain.max_key, domain.total_rows), (1, 9, 4));
        assert!(conn
            .row_count(&TableRef::new("dbo", "Missing"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_injected_failure_is_consumed() {
        let (source, table) = seeded();
        source.fail_range(1, 1);
        let columns = vec![Column::new("id", "bigint")];
        let scan = RangeScan {
            table: &table,
            columns: &columns,
            filter_column: "id",
            lower: 1,
            upper: 10,
            batch_size: 10,
        };

        let (tx, _rx) = mpsc::channel(4);
        assert!(source.connect().stream_range(&scan, tx).await.is_err());

        let (tx, mut rx) = mpsc::channel(4);
        source.connect().stream_range(&scan, tx).await.unwrap();
        let batch = rx.recv().await.unwrap().unwrap();
        assert_eq!(batch.len(), 4);
        assert_eq!(source.streamed_lowers(), vec![1, 1]);
    }
}
