//! Sync orchestrator - main workflow coordinator.
//!
//! Per table: plan, then for every range not yet in the watermark run
//! export -> validate -> stage -> load, recording the range only once it has
//! been loaded. Ranges run one at a time, each on fresh connections, with
//! bounded retries. After the full load, reconciliation and (for delta
//! tables) an incremental sync follow.

mod connector;

pub use connector::{MemoryConnector, MssqlConnector};

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::audit::{AuditLog, CheckRecord, FileAuditLog, LoadRecord, MemoryAuditLog, SqlAuditLog};
use crate::config::{Config, LoadType, TableConfig, WatermarkBackend};
use crate::core::{Column, Connector, SourceReader, TableRef, TargetWriter};
use crate::delta::DeltaCoordinator;
use crate::error::{Result, SyncError};
use crate::export::{ExportRequest, ExportSummary, StreamExporter};
use crate::loader::{BulkLoader, LoadRequest, LoadSummary};
use crate::notify::{self, Level, MilestoneTracker, Notifier};
use crate::planner::{self, KeyDomain, Range};
use crate::reconcile::{ReconcileRequest, Reconciler, ReconciliationReport};
use crate::storage::ChunkStore;
use crate::validate::{merge_rejections, LoadReadyValidator, Rejection};
use crate::watermark::{
    FileWatermarkStore, MemoryWatermarkStore, SqlWatermarkStore, Watermark, WatermarkStatus,
    WatermarkStore,
};

/// What a run does with tables whose full load is already complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Full load with resume; complete delta tables get a delta sync.
    Run,
    /// Delta sync only; every selected table must be complete.
    DeltaOnly,
}

/// What happened to one table in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableOutcome {
    /// Full load ran (or resumed) to completion.
    Loaded,
    /// Already complete; nothing to do.
    Skipped,
    /// Delta range applied.
    Delta,
    /// Delta found no new rows.
    UpToDate,
}

impl TableOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableOutcome::Loaded => "loaded",
            TableOutcome::Skipped => "skipped",
            TableOutcome::Delta => "delta",
            TableOutcome::UpToDate => "up_to_date",
        }
    }
}

/// Per-table totals of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableReport {
    pub table: String,
    pub outcome: TableOutcome,
    pub ranges_planned: usize,
    pub ranges_run: usize,
    pub ranges_skipped: usize,
    pub rows_exported: u64,
    pub rows_loaded: u64,
    pub rows_rejected: u64,
    pub truncated_values: u64,
    pub chunks_written: u64,
    pub rejections: Vec<Rejection>,
    /// Cursor range `[start, end)` of an applied delta.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta_start: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta_end: Option<i64>,
    pub duration_seconds: f64,
}

impl TableReport {
    fn new(table: &str, outcome: TableOutcome) -> Self {
        Self {
            table: table.to_string(),
            outcome,
            ranges_planned: 0,
            ranges_run: 0,
            ranges_skipped: 0,
            rows_exported: 0,
            rows_loaded: 0,
            rows_rejected: 0,
            truncated_values: 0,
            chunks_written: 0,
            rejections: Vec::new(),
            delta_start: None,
            delta_end: None,
            duration_seconds: 0.0,
        }
    }

    fn add(&mut self, export: ExportSummary, load: LoadSummary) {
        self.ranges_run += 1;
        self.rows_exported += export.rows_exported;
        self.rows_loaded += load.rows_loaded;
        self.rows_rejected += export.rows_rejected;
        self.truncated_values += export.truncated_values;
        self.chunks_written += export.chunks.len() as u64;
        merge_rejections(&mut self.rejections, export.rejections);
    }
}

/// Result of a `run` or `delta` invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_seconds: f64,
    pub tables: Vec<TableReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconciliation: Option<ReconciliationReport>,
}

impl RunReport {
    pub fn rows_loaded(&self) -> u64 {
        self.tables.iter().map(|t| t.rows_loaded).sum()
    }

    /// Reconciliation failure to surface as the run's exit status.
    pub fn to_error(&self) -> Option<SyncError> {
        self.reconciliation.as_ref().and_then(|r| r.to_error())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// A table's plan, for `bulk-sync plan`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TablePlan {
    pub table: String,
    pub domain: Option<KeyDomain>,
    pub ranges: Vec<Range>,
    pub fingerprint: Option<String>,
    pub completed: BTreeSet<u32>,
    /// Where the key domain came from: `watermark` or `source`.
    pub domain_source: String,
}

/// Resolved names and layout of a table for one run.
struct TableContext {
    source_table: TableRef,
    target_table: TableRef,
    columns: Vec<Column>,
    validator: LoadReadyValidator,
}

/// Sync orchestrator.
pub struct Orchestrator {
    config: Config,
    connector: Arc<dyn Connector>,
    store: ChunkStore,
    watermarks: Arc<dyn WatermarkStore>,
    audit: Arc<dyn AuditLog>,
    notifier: Arc<dyn Notifier>,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        connector: Arc<dyn Connector>,
        store: ChunkStore,
        watermarks: Arc<dyn WatermarkStore>,
    ) -> Self {
        let notifier = notify::from_config(&config.notifier);
        Self {
            config,
            connector,
            store,
            watermarks,
            audit: Arc::new(MemoryAuditLog::new()),
            notifier,
            cancel: CancellationToken::new(),
        }
    }

    /// Build the production stack: tiberius connections, the configured
    /// object store and watermark backend.
    pub fn from_config(config: Config) -> Result<Self> {
        let connector = MssqlConnector::from_config(&config);
        let store = ChunkStore::from_config(&config.storage)?;
        let key = config.watermark_key();
        let (watermarks, audit): (Arc<dyn WatermarkStore>, Arc<dyn AuditLog>) =
            match config.watermark.backend {
                WatermarkBackend::File => (
                    Arc::new(FileWatermarkStore::new(config.watermark.dir.clone(), key)),
                    Arc::new(FileAuditLog::new(config.watermark.dir.clone())),
                ),
                WatermarkBackend::Sql => (
                    Arc::new(SqlWatermarkStore::new(
                        config.target.clone(),
                        connector.target_credential(),
                        config.watermark.schema.clone(),
                        key,
                    )),
                    Arc::new(SqlAuditLog::new(
                        config.target.clone(),
                        connector.target_credential(),
                        config.watermark.schema.clone(),
                    )),
                ),
                WatermarkBackend::Memory => (
                    Arc::new(MemoryWatermarkStore::new(key)),
                    Arc::new(MemoryAuditLog::new()),
                ),
            };
        Ok(Self::new(config, Arc::new(connector), store, watermarks).with_audit(audit))
    }

    /// Where per-run load stats and reconciliation results are appended.
    pub fn with_audit(mut self, audit: Arc<dyn AuditLog>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Token checked between ranges and during retry backoff.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Give in-flight notifications up to `timeout` to go out. Call before exit.
    pub async fn flush_notifications(&self, timeout: Duration) {
        self.notifier.flush(timeout).await;
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn watermarks(&self) -> &Arc<dyn WatermarkStore> {
        &self.watermarks
    }

    /// Full migration with resume for the selected tables (all when empty),
    /// followed by reconciliation unless skipped or disabled.
    pub async fn run(&self, tables: &[String], skip_reconcile: bool) -> Result<RunReport> {
        self.execute(tables, SyncMode::Run, skip_reconcile).await
    }

    /// Delta sync for tables whose full load is complete.
    pub async fn delta(&self, tables: &[String]) -> Result<RunReport> {
        self.execute(tables, SyncMode::DeltaOnly, true).await
    }

    async fn execute(
        &self,
        names: &[String],
        mode: SyncMode,
        skip_reconcile: bool,
    ) -> Result<RunReport> {
        let selected = self.config.select_tables(names)?;
        let run_id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let timer = Instant::now();

        self.watermarks.init().await?;
        self.init_audit().await;
        info!(
            "Starting run {} for {} table(s) (watermarks: {}, audit: {})",
            run_id,
            selected.len(),
            self.watermarks.backend_type(),
            self.audit.backend_type()
        );
        self.notifier.notify(
            Level::Info,
            &format!(
                "Sync started: {}",
                selected
                    .iter()
                    .map(|t| t.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        );

        let mut reports = Vec::with_capacity(selected.len());
        for table in &selected {
            let table_started = Utc::now();
            let result = match mode {
                SyncMode::Run => self.sync_table(table).await,
                SyncMode::DeltaOnly => self.delta_table(table, true).await,
            };
            match result {
                Ok(report) => {
                    self.audit_load(self.load_record(&run_id, table, table_started, Some(&report)))
                        .await;
                    reports.push(report);
                }
                Err(e) => {
                    error!("{} failed: {}", table.name, e);
                    self.audit_load(
                        self.load_record(&run_id, table, table_started, None)
                            .with_error(&e.to_string()),
                    )
                    .await;
                    self.notifier
                        .notify(Level::Error, &format!("{} failed: {}", table.name, e));
                    return Err(e);
                }
            }
        }

        let reconciliation = if skip_reconcile || !self.config.reconcile.enabled {
            None
        } else {
            Some(self.reconcile_configs(&run_id, &selected).await?)
        };

        let report = RunReport {
            run_id,
            started_at,
            completed_at: Utc::now(),
            duration_seconds: timer.elapsed().as_secs_f64(),
            tables: reports,
            reconciliation,
        };
        info!(
            "Run {} finished: {} table(s), {} row(s) loaded in {:.1}s",
            report.run_id,
            report.tables.len(),
            report.rows_loaded(),
            report.duration_seconds
        );
        self.notifier.notify(
            Level::Success,
            &format!(
                "Sync finished: {} row(s) loaded in {}",
                report.rows_loaded(),
                notify::format_eta(report.duration_seconds)
            ),
        );
        Ok(report)
    }

    /// Run the full load of one table, resuming from its watermark.
    async fn sync_table(&self, table: &TableConfig) -> Result<TableReport> {
        let mut watermark = self.watermarks.load(&table.name).await?;
        if watermark.is_complete() {
            if table.load_type == LoadType::Delta {
                return self.delta_table(table, false).await;
            }
            info!("{} is already complete, skipping", table.name);
            let mut report = TableReport::new(&table.name, TableOutcome::Skipped);
            report.ranges_planned = watermark.planned_ranges as usize;
            report.ranges_skipped = watermark.ranges_completed.len();
            return Ok(report);
        }

        let timer = Instant::now();
        let mut source = self.connector.source().await?;
        let ctx = self.table_context(source.as_mut(), table).await?;

        // Plan against the domain captured when the table started, so a live
        // source growing between sessions never shifts the boundaries.
        let domain = if watermark.is_started() {
            watermark.domain()
        } else {
            self.capture_domain(source.as_mut(), &ctx, table, &mut watermark)
                .await?
        };
        let ranges = match &domain {
            Some(domain) => {
                planner::plan(&table.range_policy, domain, table.get_max_range_rows())?
            }
            None => Vec::new(),
        };
        let fingerprint = planner::fingerprint(&ranges);
        watermark.check_plan(&fingerprint)?;

        {
            let mut target = self.connector.target().await?;
            BulkLoader::new(self.store.clone())
                .prepare_table(
                    target.as_mut(),
                    &ctx.target_table,
                    &ctx.columns,
                    &table.key_column,
                )
                .await?;
        }

        if !watermark.is_started() {
            watermark.begin(fingerprint, domain.as_ref(), ranges.len() as u32);
            watermark.set_status(WatermarkStatus::Exporting);
            self.watermarks.save(&watermark).await?;
            info!(
                "Planned {} range(s) for {} ({})",
                ranges.len(),
                table.name,
                domain.map_or("empty table".to_string(), |d| format!(
                    "keys {}..={}, ~{} rows",
                    d.min_key, d.max_key, d.total_rows
                ))
            );
        } else {
            info!(
                "Resuming {}: {}/{} range(s) complete",
                table.name,
                watermark.ranges_completed.len(),
                ranges.len()
            );
        }
        drop(source);

        let mut report = TableReport::new(&table.name, TableOutcome::Loaded);
        report.ranges_planned = ranges.len();
        let mut milestones = MilestoneTracker::new(&self.config.notifier.milestones);
        milestones.skip_through(watermark.progress_pct());

        for range in &ranges {
            if watermark.is_range_complete(range.id) {
                report.ranges_skipped += 1;
                continue;
            }
            if self.cancel.is_cancelled() {
                info!("Cancelled before range {} of {}", range.label(), table.name);
                return Err(SyncError::Cancelled);
            }

            let (export, load) = match self
                .run_range(table, &ctx, range, &table.key_column)
                .await
            {
                Ok(done) => done,
                Err(e) => {
                    if !matches!(e, SyncError::Cancelled) {
                        watermark.fail(&e);
                        self.watermarks.save(&watermark).await?;
                    }
                    return Err(e);
                }
            };

            watermark.complete_range(
                range.id,
                export.rows_exported,
                load.rows_loaded,
                export.rows_rejected,
            );
            watermark.set_status(WatermarkStatus::Loading);
            self.watermarks.save(&watermark).await?;
            report.add(export, load);

            if let Some(m) = milestones.observe(watermark.progress_pct()) {
                let message = notify::milestone_message(
                    &table.name,
                    m,
                    watermark.progress_pct(),
                    watermark.total_rows_exported,
                    watermark.total_rows_estimate,
                    timer.elapsed(),
                );
                self.notifier.notify(Level::Info, &message);
            }
        }

        watermark.set_status(WatermarkStatus::Complete);
        self.watermarks.save(&watermark).await?;
        report.duration_seconds = timer.elapsed().as_secs_f64();
        info!(
            "{} complete: {} range(s) run, {} skipped, {} row(s) loaded, {} rejected",
            table.name,
            report.ranges_run,
            report.ranges_skipped,
            report.rows_loaded,
            report.rows_rejected
        );
        Ok(report)
    }

    /// Snapshot the cursor, then read the key domain. A row written after the
    /// snapshot belongs to the delta side; when the cursor is the key itself the
    /// plan stops at the snapshot so no row falls between the two.
    async fn capture_domain(
        &self,
        source: &mut dyn SourceReader,
        ctx: &TableContext,
        table: &TableConfig,
        watermark: &mut Watermark,
    ) -> Result<Option<KeyDomain>> {
        let snapshot = DeltaCoordinator
            .capture_snapshot(&mut *source, &ctx.source_table, table.cursor(), watermark)
            .await?;
        let domain = source
            .key_domain(&ctx.source_table, &table.key_column)
            .await?;
        if !table.cursor().eq_ignore_ascii_case(&table.key_column) {
            return Ok(domain);
        }
        Ok(domain.and_then(|d| {
            let capped = d.capped_at(snapshot);
            if capped != Some(d) {
                debug!(
                    "Capped {} plan at snapshot {:?} (source max {})",
                    table.name, snapshot, d.max_key
                );
            }
            capped
        }))
    }

    /// Apply one delta range to a table whose full load is complete.
    async fn delta_table(&self, table: &TableConfig, explicit: bool) -> Result<TableReport> {
        let mut watermark = self.watermarks.load(&table.name).await?;
        if explicit && !watermark.is_complete() {
            return Err(SyncError::Config(format!(
                "{} has not completed its full load (status {}); run `bulk-sync run` first",
                table.name, watermark.status
            )));
        }

        let timer = Instant::now();
        let mut source = self.connector.source().await?;
        let ctx = self.table_context(source.as_mut(), table).await?;
        let new_max = source.max_value(&ctx.source_table, table.cursor()).await?;
        drop(source);

        let Some(range) = DeltaCoordinator.next_range(&watermark, new_max)? else {
            info!("{} is up to date", table.name);
            return Ok(TableReport::new(&table.name, TableOutcome::UpToDate));
        };
        info!(
            "Delta for {}: {} in [{}, {})",
            table.name,
            table.cursor(),
            range.lower,
            range.upper
        );

        {
            let mut target = self.connector.target().await?;
            BulkLoader::new(self.store.clone())
                .prepare_table(
                    target.as_mut(),
                    &ctx.target_table,
                    &ctx.columns,
                    &table.key_column,
                )
                .await?;
        }

        let mut report = TableReport::new(&table.name, TableOutcome::Delta);
        report.ranges_planned = 1;
        report.delta_start = Some(range.lower);
        report.delta_end = Some(range.upper);
        let (export, load) = match self.run_range(table, &ctx, &range, table.cursor()).await {
            Ok(done) => done,
            Err(e) => {
                if !matches!(e, SyncError::Cancelled) {
                    watermark.last_error = Some(e.to_string());
                    self.watermarks.save(&watermark).await?;
                }
                return Err(e);
            }
        };

        watermark.complete_delta(
            range.upper,
            export.rows_exported,
            load.rows_loaded,
            export.rows_rejected,
        );
        self.watermarks.save(&watermark).await?;
        report.add(export, load);
        report.duration_seconds = timer.elapsed().as_secs_f64();
        self.notifier.notify(
            Level::Success,
            &format!(
                "{}: delta loaded {} row(s), cursor now {}",
                table.name,
                report.rows_loaded,
                range.upper - 1
            ),
        );
        Ok(report)
    }

    async fn table_context(
        &self,
        source: &mut dyn SourceReader,
        table: &TableConfig,
    ) -> Result<TableContext> {
        let source_table = table.source_ref(&self.config.source.schema);
        let target_table = table.target_ref(&self.config.target.schema);
        let columns = source.describe_table(&source_table).await?;

        let find = |name: &str| columns.iter().position(|c| c.name.eq_ignore_ascii_case(name));
        let key_idx = find(&table.key_column).ok_or_else(|| {
            SyncError::Config(format!(
                "key column {} not found in {}",
                table.key_column,
                source_table.full_name()
            ))
        })?;
        if find(table.cursor()).is_none() {
            return Err(SyncError::Config(format!(
                "cursor column {} not found in {}",
                table.cursor(),
                source_table.full_name()
            )));
        }
        let date_idx = match &table.date_column {
            Some(name) => Some(find(name).ok_or_else(|| {
                SyncError::Config(format!(
                    "date column {} not found in {}",
                    name,
                    source_table.full_name()
                ))
            })?),
            None => None,
        };

        let now: NaiveDateTime = Utc::now().naive_utc();
        let validator =
            LoadReadyValidator::new(self.config.validation.clone(), key_idx, date_idx, now);
        Ok(TableContext {
            source_table,
            target_table,
            columns,
            validator,
        })
    }

    /// Export and load one range, retrying retryable failures.
    async fn run_range(
        &self,
        table: &TableConfig,
        ctx: &TableContext,
        range: &Range,
        filter_column: &str,
    ) -> Result<(ExportSummary, LoadSummary)> {
        let span = info_span!("range", table = %table.name, range_id = %range.label());
        async {
            let max_attempts = self.config.retry.max_attempts.max(1);
            let delay = Duration::from_secs(self.config.retry.delay_secs);
            let mut attempt = 1;
            loop {
                match self.attempt_range(table, ctx, range, filter_column).await {
                    Ok(done) => {
                        debug!(
                            "Range {} done: {} exported, {} loaded",
                            range.label(),
                            done.0.rows_exported,
                            done.1.rows_loaded
                        );
                        return Ok(done);
                    }
                    Err(e) if !e.is_retryable() => return Err(e),
                    Err(e) if attempt >= max_attempts => {
                        return Err(SyncError::RetriesExhausted {
                            table: table.name.clone(),
                            range_id: range.label(),
                            attempts: attempt,
                            last: Box::new(e),
                        });
                    }
                    Err(e) => {
                        warn!(
                            "Range {} attempt {}/{} failed: {}; retrying in {}s",
                            range.label(),
                            attempt,
                            max_attempts,
                            e,
                            delay.as_secs()
                        );
                        self.notifier.notify(
                            Level::Warning,
                            &format!(
                                "{} range {} attempt {}/{} failed, retrying: {}",
                                table.name,
                                range.label(),
                                attempt,
                                max_attempts,
                                e
                            ),
                        );
                        tokio::select! {
                            _ = self.cancel.cancelled() => return Err(SyncError::Cancelled),
                            _ = tokio::time::sleep(delay) => {}
                        }
                        attempt += 1;
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn attempt_range(
        &self,
        table: &TableConfig,
        ctx: &TableContext,
        range: &Range,
        filter_column: &str,
    ) -> Result<(ExportSummary, LoadSummary)> {
        let export = {
            let mut source = self.connector.source().await?;
            let request = ExportRequest {
                table_name: &table.name,
                source_table: &ctx.source_table,
                columns: &ctx.columns,
                filter_column,
                chunk_size: table.get_chunk_size(),
                read_ahead_batches: table.get_read_ahead_batches(),
                validator: &ctx.validator,
            };
            StreamExporter::new(self.store.clone())
                .export_range(source.as_mut(), &request, range)
                .await?
        };

        let mut target = self.connector.target().await?;
        let request = LoadRequest {
            table_name: &table.name,
            target_table: &ctx.target_table,
            columns: &ctx.columns,
            filter_column,
            cleanup_chunks: table.cleanup_chunks,
        };
        let load = BulkLoader::new(self.store.clone())
            .load_range(target.as_mut(), &request, range, export.chunks.len())
            .await?;
        Ok((export, load))
    }

    /// Run the five checks for the selected tables.
    pub async fn reconcile(&self, tables: &[String]) -> Result<ReconciliationReport> {
        let selected = self.config.select_tables(tables)?;
        let run_id = uuid::Uuid::new_v4().to_string();
        self.init_audit().await;
        self.reconcile_configs(&run_id, &selected).await
    }

    async fn reconcile_configs(
        &self,
        run_id: &str,
        tables: &[&TableConfig],
    ) -> Result<ReconciliationReport> {
        let reconciler = Reconciler::new(self.config.reconcile.aggregate_tolerance_pct);
        let mut report = ReconciliationReport::default();

        for table in tables {
            let source_table = table.source_ref(&self.config.source.schema);
            let target_table = table.target_ref(&self.config.target.schema);
            let request = ReconcileRequest {
                table_name: &table.name,
                source_table: &source_table,
                target_table: &target_table,
                key_column: &table.key_column,
                not_null_columns: &table.not_null_columns,
                numeric_columns: &table.numeric_columns,
            };
            let mut source = self.connector.source().await?;
            let mut target = self.connector.target().await?;
            let results = reconciler
                .reconcile(source.as_mut(), target.as_mut(), &request)
                .await?;
            if let Err(e) = self
                .audit
                .record_checks(&CheckRecord::for_run(run_id, &results))
                .await
            {
                warn!("Could not record reconciliation of {}: {}", table.name, e);
            }
            report.extend(results);
        }

        let level = if report.passed() {
            Level::Success
        } else {
            Level::Error
        };
        self.notifier.notify(
            level,
            &format!(
                "Reconciliation {}: {} check(s), {} failed, {} warning(s)",
                if report.passed() { "passed" } else { "FAILED" },
                report.results.len(),
                report.fatal_failures().len(),
                report.warnings()
            ),
        );
        Ok(report)
    }

    async fn init_audit(&self) {
        if let Err(e) = self.audit.init().await {
            warn!("Audit log unavailable ({}): {}", self.audit.backend_type(), e);
        }
    }

    async fn audit_load(&self, record: LoadRecord) {
        if let Err(e) = self.audit.record_load(&record).await {
            warn!("Could not record load stats of {}: {}", record.table, e);
        }
    }

    fn load_record(
        &self,
        run_id: &str,
        table: &TableConfig,
        started_at: DateTime<Utc>,
        report: Option<&TableReport>,
    ) -> LoadRecord {
        let ended_at = Utc::now();
        let load_type = match report.map(|r| r.outcome) {
            Some(TableOutcome::Delta | TableOutcome::UpToDate) => LoadType::Delta,
            Some(_) => LoadType::Full,
            None => table.load_type,
        };
        LoadRecord {
            run_id: run_id.to_string(),
            table: table.name.clone(),
            source_table: table.source_ref(&self.config.source.schema).full_name(),
            target_table: table.target_ref(&self.config.target.schema).full_name(),
            load_type,
            outcome: report.map(|r| r.outcome),
            delta_column: (load_type == LoadType::Delta).then(|| table.cursor().to_string()),
            delta_start: report.and_then(|r| r.delta_start),
            delta_end: report.and_then(|r| r.delta_end),
            started_at,
            ended_at,
            rows_read: report.map_or(0, |r| r.rows_exported),
            rows_loaded: report.map_or(0, |r| r.rows_loaded),
            rows_rejected: report.map_or(0, |r| r.rows_rejected),
            chunks: report.map_or(0, |r| r.chunks_written),
            duration_ms: (ended_at - started_at).num_milliseconds().max(0) as u64,
            success: true,
            error: None,
        }
    }

    /// Ranges for each selected table, without touching the target.
    pub async fn plan(&self, tables: &[String]) -> Result<Vec<TablePlan>> {
        let selected = self.config.select_tables(tables)?;
        let mut plans = Vec::with_capacity(selected.len());

        for table in selected {
            let watermark = self.watermarks.load(&table.name).await?;
            let (domain, domain_source) = match watermark.domain() {
                Some(domain) => (Some(domain), "watermark"),
                None => {
                    let mut source = self.connector.source().await?;
                    let source_table = table.source_ref(&self.config.source.schema);
                    (
                        source.key_domain(&source_table, &table.key_column).await?,
                        "source",
                    )
                }
            };
            let ranges = match &domain {
                Some(d) => planner::plan(&table.range_policy, d, table.get_max_range_rows())?,
                None => Vec::new(),
            };
            plans.push(TablePlan {
                table: table.name.clone(),
                domain,
                fingerprint: (!ranges.is_empty()).then(|| planner::fingerprint(&ranges)),
                ranges,
                completed: watermark.ranges_completed,
                domain_source: domain_source.to_string(),
            });
        }
        Ok(plans)
    }

    /// Watermarks of the selected tables (all configured tables when empty).
    pub async fn status(&self, tables: &[String]) -> Result<Vec<Watermark>> {
        let selected = self.config.select_tables(tables)?;
        let mut records = Vec::with_capacity(selected.len());
        for table in selected {
            records.push(self.watermarks.load(&table.name).await?);
        }
        Ok(records)
    }

    /// Forget progress so the tables are replanned on the next run.
    pub async fn reset(&self, tables: &[String]) -> Result<Vec<String>> {
        let selected = self.config.select_tables(tables)?;
        let mut cleared = Vec::with_capacity(selected.len());
        for table in selected {
            self.watermarks.clear(&table.name).await?;
            warn!("Cleared watermark for {}", table.name);
            cleared.push(table.name.clone());
        }
        Ok(cleared)
    }

    /// Open both endpoints and round-trip `SELECT 1`.
    pub async fn health_check(&self) -> Result<HealthReport> {
        let timer = Instant::now();
        let mut source = self.connector.source().await?;
        source.ping().await?;
        let source_ms = timer.elapsed().as_millis() as u64;

        let timer = Instant::now();
        let mut target: Box<dyn TargetWriter> = self.connector.target().await?;
        target.ping().await?;
        let target_ms = timer.elapsed().as_millis() as u64;

        info!(
            "Health check ok: source {}ms, target {}ms",
            source_ms, target_ms
        );
        Ok(HealthReport {
            source_ms,
            target_ms,
        })
    }
}

/// Round-trip latency of each endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub source_ms: u64,
    pub target_ms: u64,
}
