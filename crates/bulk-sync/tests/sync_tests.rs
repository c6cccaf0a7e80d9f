//! End-to-end runs against the in-memory source, staging store and target.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bulk_sync::audit::MemoryAuditLog;
use bulk_sync::config::{Config, LoadType, RangePolicy};
use bulk_sync::core::{Column, Connector, SourceReader, SqlValue, TableRef, TargetWriter};
use bulk_sync::notify::{Level, MemoryNotifier};
use bulk_sync::watermark::{MemoryWatermarkStore, WatermarkStatus, WatermarkStore};
use bulk_sync::{
    ChunkStore, MemoryConnector, MemorySource, MemoryTarget, Orchestrator, SyncError,
    TableOutcome,
};

const CONFIG: &str = r#"
source:
  host: source.example
  database: warehouse
  auth:
    method: sql
    user: reader
    password: pw
target:
  host: synapse.example
  database: dw
  auth:
    method: sql
    user: loader
    password: pw
storage:
  kind: memory
  prefix: staging
watermark:
  backend: memory
retry:
  max_attempts: 1
  delay_secs: 0
tables:
  - name: FactSales
    key_column: Id
    chunk_size: 25
    range_policy:
      policy: fixed_width
      rows_per_range: 100
    numeric_columns: [Amount]
    not_null_columns: [Amount]
"#;

struct Harness {
    source: MemorySource,
    target: MemoryTarget,
    store: ChunkStore,
    watermarks: Arc<MemoryWatermarkStore>,
    notifier: MemoryNotifier,
    audit: MemoryAuditLog,
}

impl Harness {
    fn new(keys: impl IntoIterator<Item = i64>) -> Self {
        let source = MemorySource::new();
        source.add_table(source_table(), columns(), keys.into_iter().map(row).collect());
        let store = ChunkStore::in_memory("staging");
        let target = MemoryTarget::new(store.object_store());
        Self {
            source,
            target,
            store,
            watermarks: Arc::new(MemoryWatermarkStore::default()),
            notifier: MemoryNotifier::new(),
            audit: MemoryAuditLog::new(),
        }
    }

    fn orchestrator(&self, config: Config) -> Orchestrator {
        let connector = MemoryConnector::new(self.source.clone(), self.target.clone());
        self.orchestrator_with(config, Arc::new(connector))
    }

    fn orchestrator_with(&self, config: Config, connector: Arc<dyn Connector>) -> Orchestrator {
        Orchestrator::new(
            config,
            connector,
            self.store.clone(),
            self.watermarks.clone(),
        )
        .with_notifier(Arc::new(self.notifier.clone()))
        .with_audit(Arc::new(self.audit.clone()))
    }

    fn target_keys(&self) -> Vec<i64> {
        let mut keys: Vec<i64> = self
            .target
            .rows(&target_table())
            .iter()
            .filter_map(|r| r[0].as_i64())
            .collect();
        keys.sort_unstable();
        keys
    }
}

fn source_table() -> TableRef {
    TableRef::new("dbo", "FactSales")
}

fn target_table() -> TableRef {
    TableRef::new("dbo", "FactSales")
}

fn columns() -> Vec<Column> {
    vec![
        Column::new("Id", "bigint"),
        Column::new("Amount", "float"),
        Column::new("Region", "nvarchar"),
    ]
}

fn row(id: i64) -> Vec<SqlValue> {
    vec![
        SqlValue::I64(id),
        SqlValue::F64(id as f64 * 1.5),
        SqlValue::Text(format!("region-{}", id % 7)),
    ]
}

fn config() -> Config {
    Config::from_yaml(CONFIG).unwrap()
}

fn delta_config() -> Config {
    let mut config = config();
    config.tables[0].load_type = LoadType::Delta;
    config
}

/// Inserts `rows` into the source the first time a target connection is
/// opened, i.e. while the table is being set up.
struct InsertOnFirstTarget {
    inner: MemoryConnector,
    source: MemorySource,
    rows: std::sync::Mutex<Vec<Vec<SqlValue>>>,
    fired: AtomicBool,
}

#[async_trait]
impl Connector for InsertOnFirstTarget {
    async fn source(&self) -> bulk_sync::Result<Box<dyn SourceReader>> {
        self.inner.source().await
    }

    async fn target(&self) -> bulk_sync::Result<Box<dyn TargetWriter>> {
        if !self.fired.swap(true, Ordering::SeqCst) {
            let rows = std::mem::take(&mut *self.rows.lock().unwrap());
            self.source.append_rows(&source_table(), rows);
        }
        self.inner.target().await
    }
}

#[tokio::test]
async fn full_load_copies_every_row_and_reconciles() {
    let h = Harness::new(1..=1000);
    let report = h.orchestrator(config()).run(&[], false).await.unwrap();

    let table = &report.tables[0];
    assert_eq!(table.outcome, TableOutcome::Loaded);
    assert_eq!(table.ranges_planned, 10);
    assert_eq!(table.ranges_run, 10);
    assert_eq!(table.rows_loaded, 1000);
    assert_eq!(h.target_keys(), (1..=1000).collect::<Vec<_>>());

    let reconciliation = report.reconciliation.as_ref().unwrap();
    assert!(reconciliation.passed());
    assert!(report.to_error().is_none());

    let wm = h.watermarks.load("FactSales").await.unwrap();
    assert_eq!(wm.status, WatermarkStatus::Complete);
    assert_eq!(wm.ranges_completed.len(), 10);
    assert_eq!(wm.snapshot_cursor, Some(1000));
}

#[tokio::test]
async fn interrupted_run_resumes_without_duplicates() {
    let h = Harness::new(1..=1000);
    // Range 4 covers [301, 401).
    h.source.fail_mid_stream(301, 1);

    let err = h.orchestrator(config()).run(&[], true).await.unwrap_err();
    match &err {
        SyncError::RetriesExhausted {
            range_id, attempts, ..
        } => {
            assert_eq!(range_id, "00004");
            assert_eq!(*attempts, 1);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.exit_code(), 4);

    let wm = h.watermarks.load("FactSales").await.unwrap();
    assert_eq!(wm.ranges_completed, BTreeSet::from([1, 2, 3]));
    assert_eq!(wm.status, WatermarkStatus::Error);
    assert!(wm.last_error.is_some());
    assert_eq!(h.target_keys(), (1..=300).collect::<Vec<_>>());

    let streamed_before = h.source.stream_calls();
    let report = h.orchestrator(config()).run(&[], false).await.unwrap();
    let table = &report.tables[0];
    assert_eq!(table.ranges_skipped, 3);
    assert_eq!(table.ranges_run, 7);

    // Only ranges 4..=10 were read again.
    let resumed: Vec<i64> = h.source.streamed_lowers()[streamed_before..].to_vec();
    assert_eq!(resumed, (3..10).map(|i| i * 100 + 1).collect::<Vec<_>>());

    assert_eq!(h.target_keys(), (1..=1000).collect::<Vec<_>>());
    assert!(report.reconciliation.unwrap().passed());
}

#[tokio::test]
async fn range_loaded_but_not_recorded_is_replaced() {
    let h = Harness::new(1..=1000);
    h.source.fail_range(301, 1);
    h.orchestrator(config()).run(&[], true).await.unwrap_err();

    // Range 4 landed on the target but the process died before the watermark saw it.
    h.target
        .insert_rows(&target_table(), (301..401).map(row).collect());

    h.orchestrator(config()).run(&[], true).await.unwrap();
    assert_eq!(h.target_keys(), (1..=1000).collect::<Vec<_>>());
}

#[tokio::test]
async fn rerun_of_complete_table_reads_nothing() {
    let h = Harness::new(1..=1000);
    h.orchestrator(config()).run(&[], true).await.unwrap();
    let streamed = h.source.stream_calls();
    let copies = h.target.copy_calls();

    let report = h.orchestrator(config()).run(&[], true).await.unwrap();
    assert_eq!(report.tables[0].outcome, TableOutcome::Skipped);
    assert_eq!(report.tables[0].ranges_skipped, 10);
    assert_eq!(h.source.stream_calls(), streamed);
    assert_eq!(h.target.copy_calls(), copies);
    assert_eq!(h.target_keys().len(), 1000);
}

#[tokio::test]
async fn transient_copy_failure_is_retried() {
    let h = Harness::new(1..=1000);
    let mut config = config();
    config.retry.max_attempts = 3;
    h.target.fail_copy(2);

    let report = h.orchestrator(config).run(&[], true).await.unwrap();
    assert_eq!(report.tables[0].rows_loaded, 1000);
    assert_eq!(h.target_keys(), (1..=1000).collect::<Vec<_>>());

    let retries: Vec<_> = h
        .notifier
        .messages()
        .into_iter()
        .filter(|(level, msg)| *level == Level::Warning && msg.contains("retrying"))
        .collect();
    assert_eq!(retries.len(), 2);
}

#[tokio::test]
async fn changed_plan_is_refused() {
    let h = Harness::new(1..=1000);
    h.source.fail_range(301, 1);
    h.orchestrator(config()).run(&[], true).await.unwrap_err();

    let mut replanned = config();
    replanned.tables[0].range_policy = RangePolicy::FixedWidth {
        rows_per_range: 50,
        range_width: None,
    };
    let streamed = h.source.stream_calls();
    let err = h.orchestrator(replanned).run(&[], true).await.unwrap_err();
    assert!(matches!(err, SyncError::PlanChanged { ref table } if table == "FactSales"));
    assert_eq!(err.exit_code(), 2);
    assert_eq!(h.source.stream_calls(), streamed);

    // The existing record is left untouched.
    let wm = h.watermarks.load("FactSales").await.unwrap();
    assert_eq!(wm.ranges_completed.len(), 3);
}

#[tokio::test]
async fn schema_mismatch_stops_before_any_range() {
    let h = Harness::new(1..=100);
    h.target.add_table(
        target_table(),
        vec![Column::new("Id", "bigint"), Column::new("Total", "float")],
        Vec::new(),
    );

    let err = h.orchestrator(config()).run(&[], true).await.unwrap_err();
    match err {
        SyncError::SchemaMismatch { message, .. } => {
            assert!(message.contains("not in source: total"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(h.source.stream_calls(), 0);
    assert_eq!(h.target.copy_calls(), 0);
}

#[tokio::test]
async fn delta_picks_up_rows_after_snapshot() {
    let h = Harness::new(1..=500);
    let mut config = config();
    config.tables[0].load_type = LoadType::Delta;

    h.orchestrator(config.clone()).run(&[], true).await.unwrap();
    assert_eq!(h.target_keys().len(), 500);

    h.source.append_rows(&source_table(), vec![row(501), row(503)]);
    let report = h.orchestrator(config.clone()).delta(&[]).await.unwrap();
    let table = &report.tables[0];
    assert_eq!(table.outcome, TableOutcome::Delta);
    assert_eq!(table.rows_loaded, 2);

    let keys = h.target_keys();
    assert_eq!(keys.len(), 502);
    assert_eq!(&keys[498..], &[499, 500, 501, 503]);

    let wm = h.watermarks.load("FactSales").await.unwrap();
    assert_eq!(wm.delta_cursor, Some(504));

    // Nothing new: no further load.
    let copies = h.target.copy_calls();
    let report = h.orchestrator(config).delta(&[]).await.unwrap();
    assert_eq!(report.tables[0].outcome, TableOutcome::UpToDate);
    assert_eq!(h.target.copy_calls(), copies);
}

#[tokio::test]
async fn delta_before_full_load_is_refused() {
    let h = Harness::new(1..=10);
    let err = h.orchestrator(config()).delta(&[]).await.unwrap_err();
    assert!(matches!(err, SyncError::Config(_)));
}

#[tokio::test]
async fn reconciliation_reports_missing_rows() {
    let h = Harness::new(1..=1000);
    h.orchestrator(config()).run(&[], true).await.unwrap();

    h.source
        .append_rows(&source_table(), vec![row(1001), row(1002)]);
    let report = h.orchestrator(config()).reconcile(&[]).await.unwrap();
    assert!(!report.passed());
    assert!(matches!(
        report.to_error(),
        Some(SyncError::ReconciliationFailure { ref table, .. }) if table == "FactSales"
    ));
}

#[tokio::test]
async fn empty_table_completes_with_no_ranges() {
    let h = Harness::new(std::iter::empty());
    let report = h.orchestrator(config()).run(&[], true).await.unwrap();
    assert_eq!(report.tables[0].ranges_planned, 0);
    assert_eq!(report.tables[0].rows_loaded, 0);
    let wm = h.watermarks.load("FactSales").await.unwrap();
    assert_eq!(wm.status, WatermarkStatus::Complete);
}

#[tokio::test]
async fn plan_prefers_watermark_domain_and_reset_clears_it() {
    let h = Harness::new(1..=1000);
    h.source.fail_range(301, 1);
    h.orchestrator(config()).run(&[], true).await.unwrap_err();

    // The live source grows; the plan still uses the recorded domain.
    h.source
        .append_rows(&source_table(), (1001..=1500).map(row).collect());
    let orchestrator = h.orchestrator(config());
    let plans = orchestrator.plan(&[]).await.unwrap();
    assert_eq!(plans[0].domain_source, "watermark");
    assert_eq!(plans[0].ranges.len(), 10);
    assert_eq!(plans[0].completed, BTreeSet::from([1, 2, 3]));

    let cleared = orchestrator.reset(&["FactSales".to_string()]).await.unwrap();
    assert_eq!(cleared, vec!["FactSales".to_string()]);
    let plans = orchestrator.plan(&[]).await.unwrap();
    assert_eq!(plans[0].domain_source, "source");
    assert!(plans[0].completed.is_empty());
}

#[tokio::test]
async fn unknown_table_is_a_config_error() {
    let h = Harness::new(1..=10);
    let err = h
        .orchestrator(config())
        .run(&["Nope".to_string()], true)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Config(_)));
}

#[tokio::test]
async fn row_inserted_during_setup_is_loaded_by_delta() {
    let h = Harness::new(1..=1000);
    let connector = InsertOnFirstTarget {
        inner: MemoryConnector::new(h.source.clone(), h.target.clone()),
        source: h.source.clone(),
        rows: std::sync::Mutex::new(vec![row(1001)]),
        fired: AtomicBool::new(false),
    };
    h.orchestrator_with(delta_config(), Arc::new(connector))
        .run(&[], true)
        .await
        .unwrap();

    let wm = h.watermarks.load("FactSales").await.unwrap();
    assert_eq!(wm.snapshot_cursor, Some(1000));
    assert_eq!(wm.max_key, Some(1000));
    assert_eq!(h.target_keys().len(), 1000);

    let report = h.orchestrator(delta_config()).delta(&[]).await.unwrap();
    assert_eq!(report.tables[0].outcome, TableOutcome::Delta);
    assert_eq!(h.target_keys(), (1..=1001).collect::<Vec<_>>());
}

#[tokio::test]
async fn row_inserted_between_snapshot_and_domain_is_not_lost() {
    let h = Harness::new(1..=1000);
    h.source.insert_after_next_max(&source_table(), vec![row(1001)]);

    let report = h.orchestrator(delta_config()).run(&[], true).await.unwrap();
    assert_eq!(report.tables[0].ranges_planned, 10);

    // The plan stops at the snapshot; the new row is left to the delta.
    let wm = h.watermarks.load("FactSales").await.unwrap();
    assert_eq!(wm.snapshot_cursor, Some(1000));
    assert_eq!(wm.max_key, Some(1000));
    assert_eq!(h.target_keys(), (1..=1000).collect::<Vec<_>>());

    let report = h.orchestrator(delta_config()).run(&[], true).await.unwrap();
    assert_eq!(report.tables[0].outcome, TableOutcome::Delta);
    assert_eq!(report.tables[0].rows_loaded, 1);
    assert_eq!(h.target_keys(), (1..=1001).collect::<Vec<_>>());
}

#[tokio::test]
async fn empty_delta_table_picks_up_later_rows() {
    let h = Harness::new(std::iter::empty());
    h.orchestrator(delta_config()).run(&[], true).await.unwrap();
    let wm = h.watermarks.load("FactSales").await.unwrap();
    assert_eq!(wm.status, WatermarkStatus::Complete);
    assert_eq!(wm.snapshot_cursor, None);

    h.source.append_rows(&source_table(), vec![row(1), row(2)]);
    let report = h.orchestrator(delta_config()).run(&[], true).await.unwrap();
    assert_eq!(report.tables[0].outcome, TableOutcome::Delta);
    assert_eq!(report.tables[0].rows_loaded, 2);
    assert_eq!(h.target_keys(), vec![1, 2]);

    let wm = h.watermarks.load("FactSales").await.unwrap();
    assert_eq!(wm.delta_cursor, Some(3));

    let report = h.orchestrator(delta_config()).delta(&[]).await.unwrap();
    assert_eq!(report.tables[0].outcome, TableOutcome::UpToDate);
    assert_eq!(h.target_keys(), vec![1, 2]);
}

#[tokio::test]
async fn audit_trail_records_loads_and_checks() {
    let h = Harness::new(1..=1000);
    let report = h.orchestrator(config()).run(&[], false).await.unwrap();

    let loads = h.audit.loads();
    assert_eq!(loads.len(), 1);
    let load = &loads[0];
    assert_eq!(load.run_id, report.run_id);
    assert_eq!(load.table, "FactSales");
    assert_eq!(load.source_table, "dbo.FactSales");
    assert_eq!(load.outcome, Some(TableOutcome::Loaded));
    assert_eq!(load.load_type, LoadType::Full);
    assert_eq!((load.rows_read, load.rows_loaded, load.rows_rejected), (1000, 1000, 0));
    // 10 ranges of 100 rows in chunks of 25.
    assert_eq!(load.chunks, 40);
    assert!(load.success);

    let checks = h.audit.checks();
    assert_eq!(
        checks.len(),
        report.reconciliation.as_ref().unwrap().results.len()
    );
    assert!(checks.iter().all(|c| c.run_id == report.run_id && c.result.table == "FactSales"));
}

#[tokio::test]
async fn audit_trail_records_failed_table() {
    let h = Harness::new(1..=1000);
    h.source.fail_range(301, 1);
    h.orchestrator(config()).run(&[], true).await.unwrap_err();

    let loads = h.audit.loads();
    assert_eq!(loads.len(), 1);
    assert!(!loads[0].success);
    assert_eq!(loads[0].outcome, None);
    assert!(loads[0].error.as_deref().unwrap().contains("00004"));
    assert!(h.audit.checks().is_empty());
}

#[tokio::test]
async fn audit_trail_records_delta_range() {
    let h = Harness::new(1..=500);
    h.orchestrator(delta_config()).run(&[], true).await.unwrap();
    h.source.append_rows(&source_table(), vec![row(501), row(503)]);
    h.orchestrator(delta_config()).delta(&[]).await.unwrap();

    let loads = h.audit.loads();
    let delta = loads.last().unwrap();
    assert_eq!(delta.outcome, Some(TableOutcome::Delta));
    assert_eq!(delta.load_type, LoadType::Delta);
    assert_eq!(delta.delta_column.as_deref(), Some("Id"));
    assert_eq!((delta.delta_start, delta.delta_end), (Some(501), Some(504)));
    assert_eq!(delta.rows_loaded, 2);
}
