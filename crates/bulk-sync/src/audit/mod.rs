//! Per-run audit trail kept next to the watermarks.
//!
//! Every table a run touches gets one [`LoadRecord`], and every
//! reconciliation check one [`CheckRecord`]. Records are only ever appended.
//! Writing them is best effort: the orchestrator logs a failed write and
//! carries on, since the watermark alone decides correctness.

mod file;
mod sql;

pub use file::FileAuditLog;
pub use sql::SqlAuditLog;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::LoadType;
use crate::error::Result;
use crate::orchestrator::TableOutcome;
use crate::reconcile::ReconciliationResult;

/// Longest error text kept in a record.
pub const MAX_ERROR_CHARS: usize = 4000;

/// What one run did to one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadRecord {
    pub run_id: String,
    pub table: String,
    pub source_table: String,
    pub target_table: String,
    pub load_type: LoadType,
    /// `None` when the table failed.
    pub outcome: Option<TableOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta_column: Option<String>,
    /// Half-open cursor range of an applied delta.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta_start: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta_end: Option<i64>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub rows_read: u64,
    pub rows_loaded: u64,
    pub rows_rejected: u64,
    pub chunks: u64,
    pub duration_ms: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LoadRecord {
    /// Record the error, cut to [`MAX_ERROR_CHARS`].
    pub fn with_error(mut self, error: &str) -> Self {
        self.success = false;
        self.error = Some(error.chars().take(MAX_ERROR_CHARS).collect());
        self
    }
}

/// One reconciliation check as run by one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckRecord {
    pub run_id: String,
    pub checked_at: DateTime<Utc>,
    #[serde(flatten)]
    pub result: ReconciliationResult,
}

impl CheckRecord {
    pub fn for_run(run_id: &str, results: &[ReconciliationResult]) -> Vec<CheckRecord> {
        let checked_at = Utc::now();
        results
            .iter()
            .map(|result| CheckRecord {
                run_id: run_id.to_string(),
                checked_at,
                result: result.clone(),
            })
            .collect()
    }
}

#[async_trait]
pub trait AuditLog: Send + Sync {
    /// Create whatever the backend needs. Idempotent.
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn record_load(&self, record: &LoadRecord) -> Result<()>;

    async fn record_checks(&self, records: &[CheckRecord]) -> Result<()>;

    /// Backend name for logging.
    fn backend_type(&self) -> &'static str;
}

#[derive(Debug, Default)]
struct Records {
    loads: Vec<LoadRecord>,
    checks: Vec<CheckRecord>,
}

/// Audit records held in process memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryAuditLog {
    records: Arc<Mutex<Records>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Records> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn loads(&self) -> Vec<LoadRecord> {
        self.lock().loads.clone()
    }

    pub fn checks(&self) -> Vec<CheckRecord> {
        self.lock().checks.clone()
    }
}

#[async_trait]
impl AuditLog for MemoryAuditLog {
    async fn record_load(&self, record: &LoadRecord) -> Result<()> {
        self.lock().loads.push(record.clone());
        Ok(())
    }

    async fn record_checks(&self, records: &[CheckRecord]) -> Result<()> {
        self.lock().checks.extend_from_slice(records);
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}
