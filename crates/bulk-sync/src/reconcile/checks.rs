//! The individual source-vs-target checks, as pure functions over the
//! numbers the probes return.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which check produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    RowCount,
    DuplicateKey,
    NullCheck,
    IdRange,
    Aggregate,
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CheckKind::RowCount => "row_count",
            CheckKind::DuplicateKey => "duplicate_key",
            CheckKind::NullCheck => "null_check",
            CheckKind::IdRange => "id_range",
            CheckKind::Aggregate => "aggregate",
        };
        f.write_str(s)
    }
}

/// Whether a failing result fails the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Fatal,
    Warning,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Fatal => "fatal",
            Severity::Warning => "warning",
        })
    }
}

/// Outcome of one check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationResult {
    pub table: String,
    pub check_kind: CheckKind,
    /// Column or aggregate the check looked at, if not the whole table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    pub source_value: Option<f64>,
    pub target_value: Option<f64>,
    pub diff: Option<f64>,
    pub diff_pct: Option<f64>,
    pub pass: bool,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
}

impl ReconciliationResult {
    fn new(table: &str, check_kind: CheckKind, pass: bool) -> Self {
        Self {
            table: table.to_string(),
            check_kind,
            column: None,
            source_value: None,
            target_value: None,
            diff: None,
            diff_pct: None,
            pass,
            severity: Severity::Fatal,
            detail: String::new(),
        }
    }

    /// Failed and severe enough to fail the report.
    pub fn is_fatal_failure(&self) -> bool {
        !self.pass && self.severity == Severity::Fatal
    }
}

/// Target may lead a live source but must never trail it.
pub fn row_count(table: &str, source: u64, target: u64) -> ReconciliationResult {
    let diff = target as f64 - source as f64;
    let mut result = ReconciliationResult::new(table, CheckKind::RowCount, target >= source);
    result.source_value = Some(source as f64);
    result.target_value = Some(target as f64);
    result.diff = Some(diff);
    result.diff_pct = (source > 0).then(|| diff / source as f64 * 100.0);
    result
}

/// `duplicated_keys` is the number of key values appearing more than once.
pub fn duplicate_keys(table: &str, key_column: &str, duplicated_keys: u64) -> ReconciliationResult {
    let mut result =
        ReconciliationResult::new(table, CheckKind::DuplicateKey, duplicated_keys == 0);
    result.column = Some(key_column.to_string());
    result.target_value = Some(duplicated_keys as f64);
    result
}

/// Non-fatal: reported per column, never fails the run.
pub fn null_check(table: &str, column: &str, nulls: u64) -> ReconciliationResult {
    let mut result = ReconciliationResult::new(table, CheckKind::NullCheck, nulls == 0);
    result.column = Some(column.to_string());
    result.target_value = Some(nulls as f64);
    result.severity = Severity::Warning;
    result
}

/// Minimum keys must match exactly; the target maximum may trail a live
/// source but never exceed it.
pub fn id_range(
    table: &str,
    key_column: &str,
    source: Option<(i64, i64)>,
    target: Option<(i64, i64)>,
) -> ReconciliationResult {
    let mut result = match (source, target) {
        (None, None) => {
            let mut r = ReconciliationResult::new(table, CheckKind::IdRange, true);
            r.detail = "both tables are empty".into();
            r
        }
        (Some((s_min, s_max)), Some((t_min, t_max))) => {
            let pass = s_min == t_min && t_max <= s_max;
            let mut r = ReconciliationResult::new(table, CheckKind::IdRange, pass);
            r.source_value = Some(s_max as f64);
            r.target_value = Some(t_max as f64);
            r.diff = Some(t_max as f64 - s_max as f64);
            r.detail = format!(
                "min {} / {}, max {} / {} (source / target)",
                s_min, t_min, s_max, t_max
            );
            r
        }
        (source, target) => {
            let mut r = ReconciliationResult::new(table, CheckKind::IdRange, false);
            r.source_value = source.map(|(_, max)| max as f64);
            r.target_value = target.map(|(_, max)| max as f64);
            r.detail = if source.is_none() {
                "source is empty but target has rows".into()
            } else {
                "target is empty".into()
            };
            r
        }
    };
    result.column = Some(key_column.to_string());
    result
}

/// Relative parity within `tolerance_pct`. Two NULL or zero values agree.
pub fn aggregate(
    table: &str,
    label: String,
    source: Option<f64>,
    target: Option<f64>,
    tolerance_pct: f64,
) -> ReconciliationResult {
    let s = source.unwrap_or(0.0);
    let t = target.unwrap_or(0.0);
    let diff = t - s;

    let diff_pct = if s == 0.0 {
        if t == 0.0 {
            Some(0.0)
        } else {
            None
        }
    } else {
        Some(diff / s.abs() * 100.0)
    };
    let pass = diff_pct.is_some_and(|p| p.abs() <= tolerance_pct);

    let mut result = ReconciliationResult::new(table, CheckKind::Aggregate, pass);
    result.column = Some(label);
    result.source_value = source;
    result.target_value = target;
    result.diff = Some(diff);
    result.diff_pct = diff_pct;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_count_trailing_target_fails() {
        let r = row_count("T", 1_000_000, 999_998);
        assert_eq!(r.diff, Some(-2.0));
        assert!(!r.pass);
        assert!(r.is_fatal_failure());
    }

    #[test]
    fn test_row_count_leading_target_passes() {
        let r = row_count("T", 100, 105);
        assert!(r.pass);
        assert_eq!(r.diff_pct, Some(5.0));
        assert!(row_count("T", 0, 0).pass);
    }

    #[test]
    fn test_duplicates() {
        let r = duplicate_keys("T", "Id", 3);
        assert!(!r.pass);
        assert_eq!(r.target_value, Some(3.0));
        assert!(duplicate_keys("T", "Id", 0).pass);
    }

    #[test]
    fn test_null_check_is_warning() {
        let r = null_check("T", "CustomerKey", 4);
        assert!(!r.pass);
        assert!(!r.is_fatal_failure());
    }

    #[test]
    fn test_id_range_rules() {
        assert!(id_range("T", "Id", Some((1, 100)), Some((1, 100))).pass);
        assert!(id_range("T", "Id", Some((1, 120)), Some((1, 100))).pass);
        assert!(!id_range("T", "Id", Some((1, 100)), Some((1, 101))).pass);
        assert!(!id_range("T", "Id", Some((1, 100)), Some((2, 100))).pass);
        assert!(id_range("T", "Id", None, None).pass);
        assert!(!id_range("T", "Id", Some((1, 100)), None).pass);
    }

    #[test]
    fn test_aggregate_tolerance() {
        assert!(aggregate("T", "SUM(x)".into(), Some(1000.0), Some(1009.0), 1.0).pass);
        assert!(!aggregate("T", "SUM(x)".into(), Some(1000.0), Some(1011.0), 1.0).pass);
        assert!(aggregate("T", "SUM(x)".into(), None, None, 1.0).pass);
        assert!(aggregate("T", "SUM(x)".into(), Some(0.0), None, 1.0).pass);
        assert!(!aggregate("T", "SUM(x)".into(), Some(0.0), Some(5.0), 1.0).pass);
        assert!(aggregate("T", "AVG(x)".into(), Some(-50.0), Some(-50.2), 1.0).pass);
    }
}
