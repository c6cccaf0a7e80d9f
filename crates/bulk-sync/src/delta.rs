//! Incremental re-sync boundary for a live source.
//!
//! The snapshot cursor is captured once, before the first range of the full
//! load, and marks everything the full load is responsible for. A delta sync
//! then moves `cursor > boundary` rows through the normal export/load path
//! as one extra range, where the boundary is the snapshot for the first
//! delta and the last applied upper bound after that. A table whose cursor
//! column held no value at snapshot time has no boundary, and its first delta
//! starts at the bottom of the cursor type.
//!
//! Rows updated in place at or below the boundary without advancing the
//! cursor are not picked up.

use tracing::{debug, info};

use crate::core::{SourceReader, TableRef};
use crate::error::{Result, SyncError};
use crate::planner::Range;
use crate::watermark::Watermark;

#[derive(Debug, Clone, Copy, Default)]
pub struct DeltaCoordinator;

impl DeltaCoordinator {
    /// Record the current `MAX(cursor_column)` as the snapshot cursor, unless
    /// the watermark already has one. Returns the effective snapshot cursor.
    pub async fn capture_snapshot<S>(
        &self,
        source: &mut S,
        table: &TableRef,
        cursor_column: &str,
        watermark: &mut Watermark,
    ) -> Result<Option<i64>>
    where
        S: SourceReader + ?Sized,
    {
        if let Some(existing) = watermark.snapshot_cursor {
            return Ok(Some(existing));
        }
        match source.max_value(table, cursor_column).await? {
            Some(cursor) => {
                watermark.set_snapshot_cursor(cursor)?;
                info!(
                    "Captured snapshot cursor {}={} for {}",
                    cursor_column, cursor, watermark.table
                );
                Ok(Some(cursor))
            }
            None => Ok(None),
        }
    }

    /// First cursor value the next delta must pick up.
    pub fn lower_bound(&self, watermark: &Watermark) -> Result<i64> {
        if !watermark.is_complete() {
            return Err(SyncError::Config(format!(
                "delta sync of {} requires a complete full load (status is {})",
                watermark.table, watermark.status
            )));
        }
        if let Some(cursor) = watermark.delta_cursor {
            return Ok(cursor);
        }
        match watermark.snapshot_cursor {
            Some(snapshot) => snapshot
                .checked_add(1)
                .ok_or_else(|| SyncError::Watermark("snapshot cursor overflows".into())),
            None => {
                debug!(
                    "{} had no cursor values at snapshot time, delta starts from the beginning",
                    watermark.table
                );
                Ok(i64::MIN)
            }
        }
    }

    /// The delta range up to `new_max` inclusive, or `None` when nothing is new.
    pub fn next_range(&self, watermark: &Watermark, new_max: Option<i64>) -> Result<Option<Range>> {
        let lower = self.lower_bound(watermark)?;
        let Some(new_max) = new_max else {
            return Ok(None);
        };
        let upper = new_max
            .checked_add(1)
            .ok_or_else(|| SyncError::Config("cursor value is too large for delta sync".into()))?;
        if upper <= lower {
            debug!(
                "No new rows for {}: max cursor {} below boundary {}",
                watermark.table, new_max, lower
            );
            return Ok(None);
        }
        Ok(Some(Range::delta(lower, upper, 0)))
    }
}
