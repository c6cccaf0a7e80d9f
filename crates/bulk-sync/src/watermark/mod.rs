//! Durable per-table progress ledger enabling resume.
//!
//! A [`Watermark`] is only ever replaced as a whole record. The orchestrator
//! mutates it after a range has been both staged and loaded, so
//! `ranges_completed` only grows and a crash always leaves the previous
//! consistent record behind.

mod backend;
mod file;
mod memory;
mod sql;

pub use backend::WatermarkStore;
pub use file::FileWatermarkStore;
pub use memory::MemoryWatermarkStore;
pub use sql::SqlWatermarkStore;
pub(crate) use sql::create_schema_sql;

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::warn;

use crate::error::{Result, SyncError};
use crate::planner::KeyDomain;

type HmacSha256 = Hmac<Sha256>;

/// Record layout version. Records with any other version are refused.
pub const WATERMARK_VERSION: u32 = 1;

/// Table lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatermarkStatus {
    #[default]
    NotStarted,
    Exporting,
    ExportComplete,
    Loading,
    Complete,
    Error,
}

impl fmt::Display for WatermarkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WatermarkStatus::NotStarted => "not_started",
            WatermarkStatus::Exporting => "exporting",
            WatermarkStatus::ExportComplete => "export_complete",
            WatermarkStatus::Loading => "loading",
            WatermarkStatus::Complete => "complete",
            WatermarkStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Progress of one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Watermark {
    pub version: u32,

    pub table: String,

    pub status: WatermarkStatus,

    /// Ids of ranges that were exported and loaded.
    pub ranges_completed: BTreeSet<u32>,

    /// Number of ranges in the plan the record was built against.
    #[serde(default)]
    pub planned_ranges: u32,

    /// SHA-256 over the planned `(id, lower, upper)` list.
    #[serde(default)]
    pub plan_fingerprint: Option<String>,

    /// Key domain captured once, before the first range.
    #[serde(default)]
    pub min_key: Option<i64>,
    #[serde(default)]
    pub max_key: Option<i64>,
    #[serde(default)]
    pub total_rows_estimate: u64,

    pub total_rows_exported: u64,
    pub total_rows_loaded: u64,
    #[serde(default)]
    pub total_rows_rejected: u64,

    /// Cursor boundary between the full load and delta syncs. Never changes once set.
    pub snapshot_cursor: Option<i64>,

    /// Upper bound (exclusive) of the last applied delta.
    #[serde(default)]
    pub delta_cursor: Option<i64>,

    pub started_at: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,

    #[serde(default)]
    pub last_error: Option<String>,

    /// HMAC-SHA256 over the record with this field cleared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmac: Option<String>,
}

impl Watermark {
    /// Fresh `not_started` record.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            version: WATERMARK_VERSION,
            table: table.into(),
            status: WatermarkStatus::NotStarted,
            ranges_completed: BTreeSet::new(),
            planned_ranges: 0,
            plan_fingerprint: None,
            min_key: None,
            max_key: None,
            total_rows_estimate: 0,
            total_rows_exported: 0,
            total_rows_loaded: 0,
            total_rows_rejected: 0,
            snapshot_cursor: None,
            delta_cursor: None,
            started_at: None,
            last_updated: Utc::now(),
            last_error: None,
            hmac: None,
        }
    }

    pub fn is_started(&self) -> bool {
        self.plan_fingerprint.is_some()
    }

    pub fn is_complete(&self) -> bool {
        self.status == WatermarkStatus::Complete
    }

    pub fn is_range_complete(&self, id: u32) -> bool {
        self.ranges_completed.contains(&id)
    }

    /// Key domain recorded at initialisation.
    pub fn domain(&self) -> Option<KeyDomain> {
        Some(KeyDomain {
            min_key: self.min_key?,
            max_key: self.max_key?,
            total_rows: self.total_rows_estimate,
        })
    }

    /// Record the plan and key domain for a table about to start. An empty
    /// table has no domain and stays empty on resume.
    pub fn begin(&mut self, fingerprint: String, domain: Option<&KeyDomain>, planned_ranges: u32) {
        self.plan_fingerprint = Some(fingerprint);
        self.min_key = domain.map(|d| d.min_key);
        self.max_key = domain.map(|d| d.max_key);
        self.total_rows_estimate = domain.map_or(0, |d| d.total_rows);
        self.planned_ranges = planned_ranges;
        self.started_at.get_or_insert_with(Utc::now);
        self.touch();
    }

    /// Refuse to resume against a different plan.
    pub fn check_plan(&self, fingerprint: &str) -> Result<()> {
        match &self.plan_fingerprint {
            Some(existing) if existing != fingerprint => Err(SyncError::PlanChanged {
                table: self.table.clone(),
            }),
            _ => Ok(()),
        }
    }

    /// Set the snapshot cursor. A second, different value is refused.
    pub fn set_snapshot_cursor(&mut self, cursor: i64) -> Result<()> {
        match self.snapshot_cursor {
            Some(existing) if existing != cursor => Err(SyncError::Watermark(format!(
                "snapshot cursor of {} is already {} and cannot change to {}",
                self.table, existing, cursor
            ))),
            _ => {
                self.snapshot_cursor = Some(cursor);
                Ok(())
            }
        }
    }

    /// Record a range that was exported and loaded.
    pub fn complete_range(&mut self, id: u32, exported: u64, loaded: u64, rejected: u64) {
        if self.ranges_completed.insert(id) {
            self.total_rows_exported += exported;
            self.total_rows_loaded += loaded;
            self.total_rows_rejected += rejected;
        }
        self.last_error = None;
        self.touch();
    }

    /// Record an applied delta, advancing the delta cursor.
    pub fn complete_delta(&mut self, upper: i64, exported: u64, loaded: u64, rejected: u64) {
        if self.delta_cursor.map_or(true, |c| upper > c) {
            self.delta_cursor = Some(upper);
        }
        self.total_rows_exported += exported;
        self.total_rows_loaded += loaded;
        self.total_rows_rejected += rejected;
        self.last_error = None;
        self.touch();
    }

    pub fn set_status(&mut self, status: WatermarkStatus) {
        self.status = status;
        self.touch();
    }

    pub fn fail(&mut self, error: &SyncError) {
        self.status = WatermarkStatus::Error;
        self.last_error = Some(error.to_string());
        self.touch();
    }

    /// Completed share of the planned ranges, 0-100.
    pub fn progress_pct(&self) -> f64 {
        if self.planned_ranges == 0 {
            return 0.0;
        }
        self.ranges_completed.len() as f64 * 100.0 / self.planned_ranges as f64
    }

    fn touch(&mut self) {
        self.last_updated = Utc::now();
    }

    fn compute_hmac(&self, key: &[u8]) -> Result<String> {
        let mut unsigned = self.clone();
        unsigned.hmac = None;
        let content = serde_json::to_string(&unsigned)?;

        let mut mac = HmacSha256::new_from_slice(key)
            .map_err(|e| SyncError::Watermark(format!("invalid HMAC key: {}", e)))?;
        mac.update(content.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Serialize with a fresh signature.
    pub fn to_signed_json(&self, key: &[u8]) -> Result<String> {
        let mut signed = self.clone();
        signed.hmac = Some(self.compute_hmac(key)?);
        Ok(serde_json::to_string_pretty(&signed)?)
    }

    /// Parse and verify a persisted record.
    pub fn from_signed_json(content: &str, key: &[u8]) -> Result<Self> {
        let record: Self = serde_json::from_str(content)?;

        if record.version != WATERMARK_VERSION {
            return Err(SyncError::Watermark(format!(
                "watermark for {} has version {}, expected {}",
                record.table, record.version, WATERMARK_VERSION
            )));
        }

        match &record.hmac {
            Some(stored) => {
                let expected = record.compute_hmac(key)?;
                if stored != &expected {
                    return Err(SyncError::Watermark(format!(
                        "integrity check failed for {}: HMAC mismatch",
                        record.table
                    )));
                }
            }
            None => warn!(
                "Watermark for {} has no HMAC signature, integrity cannot be verified",
                record.table
            ),
        }

        Ok(record)
    }
}
