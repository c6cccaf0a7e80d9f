//! Streaming export of one range into staged chunks.
//!
//! The source streams unordered batches into a bounded channel while the
//! exporter normalizes, validates, encodes and uploads them one chunk per
//! batch. A failure anywhere aborts the whole range: the range is the unit of
//! atomicity, never the chunk.

pub mod chunk;
mod normalize;

pub use chunk::Chunk;
pub use normalize::normalize_batch;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

use crate::core::{Column, RangeScan, SourceReader, TableRef};
use crate::error::Result;
use crate::planner::Range;
use crate::storage::ChunkStore;
use crate::validate::{merge_rejections, LoadReadyValidator, Rejection};

/// What to export, independent of the range.
#[derive(Debug, Clone)]
pub struct ExportRequest<'a> {
    /// Logical table name used in chunk keys.
    pub table_name: &'a str,
    pub source_table: &'a TableRef,
    pub columns: &'a [Column],
    /// Key column for full ranges, cursor column for delta ranges.
    pub filter_column: &'a str,
    pub chunk_size: usize,
    pub read_ahead_batches: usize,
    pub validator: &'a LoadReadyValidator,
}

/// Outcome of exporting one range.
#[derive(Debug, Clone, Default)]
pub struct ExportSummary {
    pub chunks: Vec<Chunk>,
    pub rows_exported: u64,
    pub rows_kept: u64,
    pub rows_rejected: u64,
    pub rejections: Vec<Rejection>,
    pub truncated_values: u64,
}

/// Streams ranges from a source connection into a [`ChunkStore`].
#[derive(Debug, Clone)]
pub struct StreamExporter {
    store: ChunkStore,
}

impl StreamExporter {
    pub fn new(store: ChunkStore) -> Self {
        Self { store }
    }

    pub async fn export_range<S>(
        &self,
        source: &mut S,
        request: &ExportRequest<'_>,
        range: &Range,
    ) -> Result<ExportSummary>
    where
        S: SourceReader + ?Sized,
    {
        let scan = RangeScan {
            table: request.source_table,
            columns: request.columns,
            filter_column: request.filter_column,
            lower: range.lower,
            upper: range.upper,
            batch_size: request.chunk_size.max(1),
        };

        let expected = source.count_range(&scan).await?;
        if expected == 0 {
            debug!("Range {} is empty, skipping scan", range.label());
            self.store
                .delete_from_sequence(request.table_name, range, 0)
                .await?;
            return Ok(ExportSummary::default());
        }

        let (tx, mut rx) = mpsc::channel(request.read_ahead_batches.max(1));
        let producer = source.stream_range(&scan, tx);

        let store = &self.store;
        let consumer = async move {
            let mut summary = ExportSummary::default();
            let mut sequence = 0u32;

            while let Some(batch) = rx.recv().await {
                let mut batch = batch?;
                normalize_batch(&mut batch);

                let validated = request.validator.validate(batch);
                summary.rows_exported += validated.rows_in;
                summary.rows_kept += validated.rows_kept();
                summary.rows_rejected += validated.rows_rejected;
                summary.truncated_values += validated.truncated_values;
                merge_rejections(&mut summary.rejections, validated.rejections);

                if validated.batch.is_empty() {
                    continue;
                }

                let key = store.chunk_key(request.table_name, range, sequence);
                let text = chunk::encode_rows(&validated.batch.rows);
                store.put(&key, Bytes::from(text)).await?;
                debug!("Wrote chunk {} ({} rows)", key, validated.batch.len());

                summary.chunks.push(Chunk {
                    range_id: range.label(),
                    sequence,
                    row_count: validated.batch.len() as u64,
                    storage_key: key,
                });
                sequence += 1;
            }

            Ok::<_, crate::error::SyncError>(summary)
        };

        let (produced, consumed) = tokio::join!(producer, consumer);
        let summary = consumed?;
        produced?;

        // Chunks beyond this export's count are left over from an earlier,
        // larger attempt and would otherwise match the load wildcard.
        let stale = self
            .store
            .delete_from_sequence(request.table_name, range, summary.chunks.len() as u32)
            .await?;
        if stale > 0 {
            debug!("Removed {} stale chunk(s) of range {}", stale, range.label());
        }

        debug!(
            "Exported range {}: {} rows read, {} kept, {} rejected, {} chunk(s)",
            range.label(),
            summary.rows_exported,
            summary.rows_kept,
            summary.rows_rejected,
            summary.chunks.len()
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ValidationConfig;
    use crate::core::{SqlNullType, SqlValue};
    use crate::source::MemorySource;
    use chrono::NaiveDate;

    fn columns() -> Vec<Column> {
        vec![Column::new("id", "bigint"), Column::new("name", "varchar")]
    }

    fn validator() -> LoadReadyValidator {
        let now = NaiveDate::from_ymd_opt(2030, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        LoadReadyValidator::new(ValidationConfig::default(), 0, None, now)
    }

    fn range(lower: i64, upper: i64) -> Range {
        Range {
            id: 1,
            lower,
            upper,
            estimated_rows: 0,
            kind: Default::default(),
        }
    }

    fn source(n: i64) -> MemorySource {
        let source = MemorySource::new();
        let rows = (1..=n)
            .map(|i| vec![SqlValue::I64(i), SqlValue::Text(format!("row {}", i))])
            .collect();
        source.add_table(TableRef::new("dbo", "T"), columns(), rows);
        source
    }

    #[tokio::test]
    async fn test_export_splits_into_chunks() {
        let store = ChunkStore::in_memory("p");
        let exporter = StreamExporter::new(store.clone());
        let table = TableRef::new("dbo", "T");
        let cols = columns();
        let v = validator();
        let req = ExportRequest {
            table_name: "T",
            source_table: &table,
            columns: &cols,
            filter_column: "id",
            chunk_size: 4,
            read_ahead_batches: 2,
            validator: &v,
        };

        let mut conn = source(20).connect();
        let summary = exporter
            .export_range(&mut conn, &req, &range(1, 11))
            .await
            .unwrap();

        assert_eq!(summary.rows_exported, 10);
        assert_eq!(summary.rows_kept, 10);
        assert_eq!(summary.chunks.len(), 3);
        assert_eq!(store.list("p/T/00001").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_reexport_with_fewer_chunks_removes_stale_ones() {
        let store = ChunkStore::in_memory("p");
        let exporter = StreamExporter::new(store.clone());
        let table = TableRef::new("dbo", "T");
        let cols = columns();
        let v = validator();
        let mut req = ExportRequest {
            table_name: "T",
            source_table: &table,
            columns: &cols,
            filter_column: "id",
            chunk_size: 2,
            read_ahead_batches: 1,
            validator: &v,
        };
        let mem = source(10);

        exporter
            .export_range(&mut mem.connect(), &req, &range(1, 11))
            .await
            .unwrap();
        assert_eq!(store.list("p/T/00001").await.unwrap().len(), 5);

        req.chunk_size = 5;
        exporter
            .export_range(&mut mem.connect(), &req, &range(1, 11))
            .await
            .unwrap();
        assert_eq!(store.list("p/T/00001").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_empty_range_short_circuits() {
        let store = ChunkStore::in_memory("p");
        let exporter = StreamExporter::new(store.clone());
        let table = TableRef::new("dbo", "T");
        let cols = columns();
        let v = validator();
        let req = ExportRequest {
            table_name: "T",
            source_table: &table,
            columns: &cols,
            filter_column: "id",
            chunk_size: 2,
            read_ahead_batches: 1,
            validator: &v,
        };
        let mem = source(5);

        let summary = exporter
            .export_range(&mut mem.connect(), &req, &range(100, 200))
            .await
            .unwrap();
        assert!(summary.chunks.is_empty());
        assert_eq!(mem.stream_calls(), 0);
    }

    #[tokio::test]
    async fn test_counts_balance_with_rejections() {
        let store = ChunkStore::in_memory("p");
        let exporter = StreamExporter::new(store);
        let table = TableRef::new("dbo", "T");
        let cols = columns();
        let v = validator();
        let req = ExportRequest {
            table_name: "T",
            source_table: &table,
            columns: &cols,
            filter_column: "seq",
            chunk_size: 10,
            read_ahead_batches: 1,
            validator: &v,
        };

        // Filter on a second column so a NULL key can fall inside the range.
        let mem = MemorySource::new();
        mem.add_table(
            table.clone(),
            vec![Column::new("id", "bigint"), Column::new("seq", "bigint")],
            vec![
                vec![SqlValue::I64(1), SqlValue::I64(1)],
                vec![SqlValue::Null(SqlNullType::I64), SqlValue::I64(2)],
                vec![SqlValue::I64(3), SqlValue::I64(3)],
            ],
        );

        let summary = exporter
            .export_range(&mut mem.connect(), &req, &range(1, 4))
            .await
            .unwrap();
        assert_eq!(summary.rows_exported, 3);
        assert_eq!(summary.rows_rejected, 1);
        assert_eq!(
            summary.rows_exported,
            summary.rows_kept + summary.rows_rejected
        );
    }

    #[tokio::test]
    async fn test_mid_stream_failure_aborts_range() {
        let store = ChunkStore::in_memory("p");
        let exporter = StreamExporter::new(store);
        let table = TableRef::new("dbo", "T");
        let cols = columns();
        let v = validator();
        let req = ExportRequest {
            table_name: "T",
            source_table: &table,
            columns: &cols,
            filter_column: "id",
            chunk_size: 2,
            read_ahead_batches: 1,
            validator: &v,
        };
        let mem = source(10);
        mem.fail_mid_stream(1, 1);

        let err = exporter
            .export_range(&mut mem.connect(), &req, &range(1, 11))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
