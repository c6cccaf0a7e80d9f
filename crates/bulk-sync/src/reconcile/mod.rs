//! Read-only post-load verification.
//!
//! The reconciler only ever issues aggregate queries through [`TableProbe`];
//! a failing check is reported and never rolled back.

pub mod checks;

pub use checks::{CheckKind, ReconciliationResult, Severity};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::{TableProbe, TableRef};
use crate::error::{Result, SyncError};

/// Everything the checks need to know about one table.
#[derive(Debug, Clone)]
pub struct ReconcileRequest<'a> {
    pub table_name: &'a str,
    pub source_table: &'a TableRef,
    pub target_table: &'a TableRef,
    pub key_column: &'a str,
    pub not_null_columns: &'a [String],
    pub numeric_columns: &'a [String],
}

#[derive(Debug, Clone)]
pub struct Reconciler {
    tolerance_pct: f64,
}

impl Reconciler {
    pub fn new(tolerance_pct: f64) -> Self {
        Self { tolerance_pct }
    }

    /// Run all five checks for one table.
    pub async fn reconcile<S, T>(
        &self,
        source: &mut S,
        target: &mut T,
        request: &ReconcileRequest<'_>,
    ) -> Result<Vec<ReconciliationResult>>
    where
        S: TableProbe + ?Sized,
        T: TableProbe + ?Sized,
    {
        let table = request.table_name;
        let mut results = Vec::new();

        let source_count = source.row_count(request.source_table).await?;
        let target_count = target.row_count(request.target_table).await?;
        results.push(checks::row_count(table, source_count, target_count));

        let duplicated = target
            .duplicate_keys(request.target_table, request.key_column)
            .await?;
        results.push(checks::duplicate_keys(table, request.key_column, duplicated));

        for column in request.not_null_columns {
            let nulls = target.null_count(request.target_table, column).await?;
            results.push(checks::null_check(table, column, nulls));
        }

        let source_bounds = source
            .key_bounds(request.source_table, request.key_column)
            .await?;
        let target_bounds = target
            .key_bounds(request.target_table, request.key_column)
            .await?;
        results.push(checks::id_range(
            table,
            request.key_column,
            source_bounds,
            target_bounds,
        ));

        for column in request.numeric_columns {
            let (s_sum, s_avg) = source.sum_avg(request.source_table, column).await?;
            let (t_sum, t_avg) = target.sum_avg(request.target_table, column).await?;
            results.push(checks::aggregate(
                table,
                format!("SUM({})", column),
                s_sum,
                t_sum,
                self.tolerance_pct,
            ));
            results.push(checks::aggregate(
                table,
                format!("AVG({})", column),
                s_avg,
                t_avg,
                self.tolerance_pct,
            ));
        }

        for r in &results {
            if r.pass {
                continue;
            }
            let column = r.column.as_deref().unwrap_or("-");
            match r.severity {
                Severity::Fatal => warn!(
                    "{}: {} check failed on {} (source {:?}, target {:?})",
                    table, r.check_kind, column, r.source_value, r.target_value
                ),
                Severity::Warning => info!(
                    "{}: {} found {:?} NULL(s) in {}",
                    table, r.check_kind, r.target_value, column
                ),
            }
        }
        Ok(results)
    }
}

/// All reconciliation results of a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub results: Vec<ReconciliationResult>,
}

impl ReconciliationReport {
    pub fn new(results: Vec<ReconciliationResult>) -> Self {
        Self { results }
    }

    pub fn extend(&mut self, results: Vec<ReconciliationResult>) {
        self.results.extend(results);
    }

    /// True when every fatal check passed.
    pub fn passed(&self) -> bool {
        !self.results.iter().any(ReconciliationResult::is_fatal_failure)
    }

    pub fn fatal_failures(&self) -> Vec<&ReconciliationResult> {
        self.results.iter().filter(|r| r.is_fatal_failure()).collect()
    }

    pub fn warnings(&self) -> usize {
        self.results
            .iter()
            .filter(|r| !r.pass && r.severity == Severity::Warning)
            .count()
    }

    /// Error to surface for the first table with a fatal failure.
    pub fn to_error(&self) -> Option<SyncError> {
        let failures = self.fatal_failures();
        let first = failures.first()?;
        Some(SyncError::ReconciliationFailure {
            table: first.table.clone(),
            failed: failures.len(),
        })
    }

    /// Plain-text table for the terminal and notifications.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "{:<24} {:<14} {:<24} {:>16} {:>16} {:>12} {:>9}  {}\n",
            "TABLE", "CHECK", "COLUMN", "SOURCE", "TARGET", "DIFF", "DIFF %", "RESULT"
        ));
        for r in &self.results {
            let result = match (r.pass, r.severity) {
                (true, _) => "PASS",
                (false, Severity::Fatal) => "FAIL",
                (false, Severity::Warning) => "WARN",
            };
            out.push_str(&format!(
                "{:<24} {:<14} {:<24} {:>16} {:>16} {:>12} {:>9}  {}\n",
                r.table,
                r.check_kind.to_string(),
                r.column.as_deref().unwrap_or("-"),
                fmt_num(r.source_value),
                fmt_num(r.target_value),
                fmt_num(r.diff),
                r.diff_pct.map_or("-".to_string(), |p| format!("{:.4}", p)),
                result
            ));
        }
        out.push_str(&format!(
            "\n{}: {} check(s), {} failed, {} warning(s)\n",
            if self.passed() { "PASSED" } else { "FAILED" },
            self.results.len(),
            self.fatal_failures().len(),
            self.warnings()
        ));
        out
    }
}

fn fmt_num(value: Option<f64>) -> String {
    match value {
        None => "-".to_string(),
        Some(v) if v.fract() == 0.0 && v.abs() < 1e15 => format!("{}", v as i64),
        Some(v) => format!("{:.4}", v),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Column, SqlValue};
    use crate::source::MemorySource;

    fn table(ids: &[i64]) -> (MemorySource, TableRef) {
        let mem = MemorySource::new();
        let t = TableRef::new("dbo", "FactSales");
        mem.add_table(
            t.clone(),
            vec![Column::new("Id", "bigint"), Column::new("Amount", "float")],
            ids.iter()
                .map(|&i| vec![SqlValue::I64(i), SqlValue::F64(i as f64 * 1.5)])
                .collect(),
        );
        (mem, t)
    }

    #[tokio::test]
    async fn test_matching_tables_pass() {
        let ids: Vec<i64> = (1..=100).collect();
        let (src, t) = table(&ids);
        let (dst, _) = table(&ids);
        let numeric = vec!["Amount".to_string()];
        let not_null = vec!["Amount".to_string()];
        let request = ReconcileRequest {
            table_name: "FactSales",
            source_table: &t,
            target_table: &t,
            key_column: "Id",
            not_null_columns: &not_null,
            numeric_columns: &numeric,
        };

        let results = Reconciler::new(1.0)
            .reconcile(&mut src.connect(), &mut dst.connect(), &request)
            .await
            .unwrap();
        // row count, duplicates, one null check, id range, SUM and AVG
        assert_eq!(results.len(), 6);
        let report = ReconciliationReport::new(results);
        assert!(report.passed());
        assert!(report.to_error().is_none());
        assert!(report.render().contains("PASSED: 6 check(s)"));
    }

    #[tokio::test]
    async fn test_three_duplicated_keys_fail() {
        let (src, t) = table(&(1..=10).collect::<Vec<_>>());
        let mut ids: Vec<i64> = (1..=10).collect();
        ids.extend([2, 5, 7]);
        let (dst, _) = table(&ids);
        let request = ReconcileRequest {
            table_name: "FactSales",
            source_table: &t,
            target_table: &t,
            key_column: "Id",
            not_null_columns: &[],
            numeric_columns: &[],
        };

        let results = Reconciler::new(1.0)
            .reconcile(&mut src.connect(), &mut dst.connect(), &request)
            .await
            .unwrap();
        let dup = results
            .iter()
            .find(|r| r.check_kind == CheckKind::DuplicateKey)
            .unwrap();
        assert!(!dup.pass);
        assert_eq!(dup.target_value, Some(3.0));

        let report = ReconciliationReport::new(results);
        assert!(!report.passed());
        assert!(matches!(
            report.to_error(),
            Some(SyncError::ReconciliationFailure { failed: 1, .. })
        ));
    }

    #[test]
    fn test_warning_does_not_fail_report() {
        let report = ReconciliationReport::new(vec![
            checks::row_count("T", 10, 10),
            checks::null_check("T", "Name", 2),
        ]);
        assert!(report.passed());
        assert_eq!(report.warnings(), 1);
        assert!(report.render().contains("WARN"));
    }
}
