//! In-memory target that loads staged chunks the way `COPY INTO` would.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use futures::TryStreamExt;
use object_store::path::Path;
use object_store::ObjectStore;
use rust_decimal::Decimal;

use crate::core::{Column, CopySource, Row, SqlNullType, SqlValue, TableProbe, TableRef, TargetWriter};
use crate::error::{Result, SyncError};
use crate::export::chunk::decode_rows;
use crate::source::{bounds, count_duplicates, sum_avg};

#[derive(Debug, Default)]
struct TableData {
    columns: Vec<Column>,
    rows: Vec<Row>,
}

#[derive(Debug, Default)]
struct State {
    tables: HashMap<TableRef, TableData>,
    copy_calls: usize,
    delete_calls: usize,
    create_calls: usize,
    copy_failures: u32,
}

/// Shared handle to an in-memory warehouse reading chunks from `store`.
#[derive(Clone)]
pub struct MemoryTarget {
    state: Arc<Mutex<State>>,
    store: Arc<dyn ObjectStore>,
}

impl std::fmt::Debug for MemoryTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTarget").finish_non_exhaustive()
    }
}

impl MemoryTarget {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            state: Arc::default(),
            store,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create or replace a table, e.g. to simulate one that already exists.
    pub fn add_table(&self, table: TableRef, columns: Vec<Column>, rows: Vec<Row>) {
        self.lock().tables.insert(table, TableData { columns, rows });
    }

    /// Append rows directly, bypassing the load path.
    pub fn insert_rows(&self, table: &TableRef, rows: Vec<Row>) {
        if let Some(data) = self.lock().tables.get_mut(table) {
            data.rows.extend(rows);
        }
    }

    /// Snapshot of a table's rows.
    pub fn rows(&self, table: &TableRef) -> Vec<Row> {
        self.lock()
            .tables
            .get(table)
            .map(|d| d.rows.clone())
            .unwrap_or_default()
    }

    /// Fail the next `times` `COPY INTO` calls.
    pub fn fail_copy(&self, times: u32) {
        self.lock().copy_failures = times;
    }

    pub fn copy_calls(&self) -> usize {
        self.lock().copy_calls
    }

    pub fn delete_calls(&self) -> usize {
        self.lock().delete_calls
    }

    pub fn create_calls(&self) -> usize {
        self.lock().create_calls
    }

    pub fn connect(&self) -> MemoryTargetConnection {
        MemoryTargetConnection {
            target: self.clone(),
        }
    }

    async fn read_chunks(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = Path::from(prefix);
        let metas: Vec<_> = self.store.list(Some(&prefix)).try_collect().await?;
        let mut keys: Vec<Path> = metas.into_iter().map(|m| m.location).collect();
        keys.sort();

        let mut texts = Vec::with_capacity(keys.len());
        for key in keys {
            let bytes = self.store.get(&key).await?.bytes().await?;
            let text = String::from_utf8(bytes.to_vec()).map_err(|e| {
                SyncError::Config(format!("chunk {} is not UTF-8: {}", key, e))
            })?;
            texts.push(text);
        }
        Ok(texts)
    }
}

/// One connection to a [`MemoryTarget`].
#[derive(Debug)]
pub struct MemoryTargetConnection {
    target: MemoryTarget,
}

impl MemoryTargetConnection {
    fn column_values(&self, table: &TableRef, column: &str) -> Result<Vec<SqlValue>> {
        let state = self.target.lock();
        let data = state
            .tables
            .get(table)
            .ok_or_else(|| SyncError::target(table.full_name(), "table does not exist"))?;
        let idx = data
            .columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(column))
            .ok_or_else(|| SyncError::target(table.full_name(), format!("no column {}", column)))?;
        Ok(data.rows.iter().map(|r| r[idx].clone()).collect())
    }
}

/// Parse one staged field back into a typed value.
fn parse_field(field: Option<String>, column: &Column) -> Result<SqlValue> {
    let ty = column.data_type.to_lowercase();
    let Some(text) = field else {
        let null = match ty.as_str() {
            "bigint" | "int" | "smallint" | "tinyint" => SqlNullType::I64,
            "float" | "real" => SqlNullType::F64,
            "decimal" | "numeric" | "money" | "smallmoney" => SqlNullType::Decimal,
            "bit" => SqlNullType::Bool,
            "datetime" | "datetime2" | "smalldatetime" => SqlNullType::DateTime,
            "date" => SqlNullType::Date,
            _ => SqlNullType::String,
        };
        return Ok(SqlValue::Null(null));
    };

    let bad = |e: &dyn std::fmt::Display| {
        SyncError::Config(format!(
            "cannot load '{}' into {} {}: {}",
            text, column.name, column.data_type, e
        ))
    };

    let value = match ty.as_str() {
        "bigint" | "int" | "smallint" | "tinyint" => {
            SqlValue::I64(text.parse().map_err(|e| bad(&e))?)
        }
        "float" | "real" => SqlValue::F64(text.parse().map_err(|e| bad(&e))?),
        "decimal" | "numeric" | "money" | "smallmoney" => {
            SqlValue::Decimal(Decimal::from_str(&text).map_err(|e| bad(&e))?)
        }
        "bit" => SqlValue::Bool(text == "1"),
        "datetime" | "datetime2" | "smalldatetime" => SqlValue::DateTime(
            NaiveDateTime::parse_from_str(&text, "%Y-%m-%d %H:%M:%S%.f").map_err(|e| bad(&e))?,
        ),
        "date" => SqlValue::Date(NaiveDate::parse_from_str(&text, "%Y-%m-%d").map_err(|e| bad(&e))?),
        _ => SqlValue::Text(text),
    };
    Ok(value)
}

#[async_trait]
impl TableProbe for MemoryTargetConnection {
    async fn row_count(&mut self, table: &TableRef) -> Result<u64> {
        let state = self.target.lock();
        state
            .tables
            .get(table)
            .map(|d| d.rows.len() as u64)
            .ok_or_else(|| SyncError::target(table.full_name(), "table does not exist"))
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
impl TargetWriter for MemoryTargetConnection {
    async fn ping(&mut self) -> Result<()> {
        Ok(())
    }

    async fn table_columns(&mut self, table: &TableRef) -> Result<Option<Vec<String>>> {
        Ok(self
            .target
            .lock()
            .tables
            .get(table)
            .map(|d| d.columns.iter().map(|c| c.name.clone()).collect()))
    }

    async fn create_table(
        &mut self,
        table: &TableRef,
        columns: &[Column],
        _key_column: &str,
    ) -> Result<()> {
        let mut state = self.target.lock();
        if state.tables.contains_key(table) {
            return Err(SyncError::target(
                table.full_name(),
                "There is already an object with that name",
            ));
        }
        state.create_calls += 1;
        state.tables.insert(
            table.clone(),
            TableData {
                columns: columns.to_vec(),
                rows: Vec::new(),
            },
        );
        Ok(())
    }

    async fn delete_range(
        &mut self,
        table: &TableRef,
        column: &str,
        lower: i64,
        upper: i64,
    ) -> Result<u64> {
        let mut state = self.target.lock();
        state.delete_calls += 1;
        let data = state
            .tables
            .get_mut(table)
            .ok_or_else(|| SyncError::target(table.full_name(), "table does not exist"))?;
        let idx = data
            .columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(column))
            .ok_or_else(|| SyncError::target(table.full_name(), format!("no column {}", column)))?;

        let before = data.rows.len();
        data.rows
            .retain(|r| !r[idx].as_i64().is_some_and(|k| k >= lower && k < upper));
        Ok((before - data.rows.len()) as u64)
    }

    async fn copy_into(
        &mut self,
        table: &TableRef,
        columns: &[Column],
        source: &CopySource,
    ) -> Result<u64> {
        {
            let mut state = self.target.lock();
            state.copy_calls += 1;
            if state.copy_failures > 0 {
                state.copy_failures -= 1;
                return Err(SyncError::target(table.full_name(), "injected COPY INTO failure"));
            }
        }

        // Parse everything before touching the table: a statement loads all or nothing.
        let mut loaded: Vec<Row> = Vec::new();
        for text in self.target.read_chunks(&source.prefix).await? {
            for fields in decode_rows(&text)? {
                if fields.len() != columns.len() {
                    return Err(SyncError::target(
                        table.full_name(),
                        format!("expected {} fields, found {}", columns.len(), fields.len()),
                    ));
                }
                let row = fields
                    .into_iter()
                    .zip(columns)
                    .map(|(f, c)| parse_field(f, c))
                    .collect::<Result<Row>>()?;
                loaded.push(row);
            }
        }

        let mut state = self.target.lock();
        let data = state
            .tables
            .get_mut(table)
            .ok_or_else(|| SyncError::target(table.full_name(), "table does not exist"))?;
        let n = loaded.len() as u64;
        data.rows.extend(loaded);
        Ok(n)
    }
}
