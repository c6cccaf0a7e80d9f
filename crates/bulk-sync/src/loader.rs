//! Set-based load of staged ranges into the target.
//!
//! Each range is loaded with one `COPY INTO` over a wildcard matching all of
//! its chunks. The load is made idempotent by first deleting the range's key
//! span from the target, so running it twice leaves exactly one copy.

use std::collections::BTreeSet;

use tracing::{debug, info};

use crate::core::{Column, TableRef, TargetWriter};
use crate::error::{Result, SyncError};
use crate::planner::Range;
use crate::storage::ChunkStore;

/// What happened to the target table during preparation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TablePreparation {
    Created,
    Existing,
}

/// Load parameters that don't change between ranges.
#[derive(Debug, Clone)]
pub struct LoadRequest<'a> {
    /// Logical table name used in chunk keys.
    pub table_name: &'a str,
    pub target_table: &'a TableRef,
    pub columns: &'a [Column],
    /// Key column for full ranges, cursor column for delta ranges.
    pub filter_column: &'a str,
    /// Delete staged chunks after a successful load.
    pub cleanup_chunks: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub rows_deleted: u64,
    pub rows_loaded: u64,
    pub chunks_loaded: usize,
}

#[derive(Debug, Clone)]
pub struct BulkLoader {
    store: ChunkStore,
}

impl BulkLoader {
    pub fn new(store: ChunkStore) -> Self {
        Self { store }
    }

    /// Create the target table distributed on `key_column`, or check that an
    /// existing one has the source's columns.
    pub async fn prepare_table<T>(
        &self,
        target: &mut T,
        table: &TableRef,
        columns: &[Column],
        key_column: &str,
    ) -> Result<TablePreparation>
    where
        T: TargetWriter + ?Sized,
    {
        match target.table_columns(table).await? {
            None => {
                target.create_table(table, columns, key_column).await?;
                info!("Created target table {}", table.full_name());
                Ok(TablePreparation::Created)
            }
            Some(existing) => {
                check_columns(table, columns, &existing)?;
                debug!("Target table {} exists with matching columns", table.full_name());
                Ok(TablePreparation::Existing)
            }
        }
    }

    /// Replace the target's rows in `range` with the staged chunks.
    ///
    /// `expected_chunks` is what the exporter reported; fewer staged chunks
    /// means storage lost data and the range must be exported again.
    pub async fn load_range<T>(
        &self,
        target: &mut T,
        request: &LoadRequest<'_>,
        range: &Range,
        expected_chunks: usize,
    ) -> Result<LoadSummary>
    where
        T: TargetWriter + ?Sized,
    {
        let staged = self
            .store
            .list(&self.store.range_prefix(request.table_name, range))
            .await?;
        if staged.len() < expected_chunks {
            return Err(SyncError::target(
                request.target_table.full_name(),
                format!(
                    "range {} has {} staged chunk(s), expected {}",
                    range.label(),
                    staged.len(),
                    expected_chunks
                ),
            ));
        }

        let rows_deleted = target
            .delete_range(
                request.target_table,
                request.filter_column,
                range.lower,
                range.upper,
            )
            .await?;
        if rows_deleted > 0 {
            debug!(
                "Deleted {} existing row(s) of range {} from {}",
                rows_deleted,
                range.label(),
                request.target_table.full_name()
            );
        }

        // COPY INTO fails on a wildcard that matches nothing.
        let rows_loaded = if staged.is_empty() {
            0
        } else {
            let source = self.store.copy_source(request.table_name, range);
            target
                .copy_into(request.target_table, request.columns, &source)
                .await?
        };

        if request.cleanup_chunks {
            self.store
                .delete_from_sequence(request.table_name, range, 0)
                .await?;
        }

        debug!(
            "Loaded range {} into {}: {} row(s) from {} chunk(s)",
            range.label(),
            request.target_table.full_name(),
            rows_loaded,
            staged.len()
        );
        Ok(LoadSummary {
            rows_deleted,
            rows_loaded,
            chunks_loaded: staged.len(),
        })
    }
}

fn check_columns(table: &TableRef, source: &[Column], target: &[String]) -> Result<()> {
    let source: BTreeSet<String> = source.iter().map(|c| c.name.to_lowercase()).collect();
    let target: BTreeSet<String> = target.iter().map(|c| c.to_lowercase()).collect();

    let missing: Vec<&str> = source.difference(&target).map(String::as_str).collect();
    let extra: Vec<&str> = target.difference(&source).map(String::as_str).collect();
    if missing.is_empty() && extra.is_empty() {
        return Ok(());
    }

    let mut message = Vec::new();
    if !missing.is_empty() {
        message.push(format!("missing on target: {}", missing.join(", ")));
    }
    if !extra.is_empty() {
        message.push(format!("not in source: {}", extra.join(", ")));
    }
    Err(SyncError::schema_mismatch(table.full_name(), message.join("; ")))
}
