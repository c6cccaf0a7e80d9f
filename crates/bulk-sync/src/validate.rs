//! Load-ready validation: the row-level quality gate applied before a batch
//! is persisted as a chunk.
//!
//! Rules run in a fixed order:
//!
//! 1. rows with a NULL key are rejected
//! 2. rows whose date column lies after the validation time are rejected
//! 3. over-length text is truncated (never rejected)
//!
//! Rejections are tallied per rule and never raised as errors.

use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::config::ValidationConfig;
use crate::core::{Batch, Row, SqlValue};

/// A validation rule that can reject rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rule {
    NullPrimaryKey,
    FutureDate,
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rule::NullPrimaryKey => write!(f, "null_primary_key"),
            Rule::FutureDate => write!(f, "future_date"),
        }
    }
}

/// Per-rule rejection tally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub rule: Rule,
    pub reason: String,
    pub count: u64,
}

/// Result of validating one batch.
#[derive(Debug)]
pub struct Validated {
    /// Rows that passed, possibly with truncated text.
    pub batch: Batch,
    pub rows_in: u64,
    pub rows_rejected: u64,
    pub rejections: Vec<Rejection>,
    pub truncated_values: u64,
}

impl Validated {
    pub fn rows_kept(&self) -> u64 {
        self.batch.len() as u64
    }
}

/// Validator bound to one table's column layout.
#[derive(Debug, Clone)]
pub struct LoadReadyValidator {
    config: ValidationConfig,
    key_idx: usize,
    date_idx: Option<usize>,
    now: NaiveDateTime,
}

impl LoadReadyValidator {
    /// `now` is the validation time the future-date rule compares against.
    pub fn new(
        config: ValidationConfig,
        key_idx: usize,
        date_idx: Option<usize>,
        now: NaiveDateTime,
    ) -> Self {
        Self {
            config,
            key_idx,
            date_idx,
            now,
        }
    }

    pub fn validate(&self, batch: Batch) -> Validated {
        let rows_in = batch.len() as u64;
        let mut null_pk = 0u64;
        let mut future = 0u64;
        let mut truncated_values = 0u64;
        let mut kept: Vec<Row> = Vec::with_capacity(batch.rows.len());

        for mut row in batch.rows {
            if self.config.reject_null_pk && row.get(self.key_idx).map_or(true, SqlValue::is_null) {
                null_pk += 1;
                continue;
            }

            if self.config.reject_future_dates && self.is_future(&row) {
                future += 1;
                continue;
            }

            if self.config.truncate_strings {
                for value in row.iter_mut() {
                    if let SqlValue::Text(s) = value {
                        if truncate_chars(s, self.config.max_string_length) {
                            truncated_values += 1;
                        }
                    }
                }
            }

            kept.push(row);
        }

        let mut rejections = Vec::new();
        if null_pk > 0 {
            rejections.push(Rejection {
                rule: Rule::NullPrimaryKey,
                reason: "key column is NULL".to_string(),
                count: null_pk,
            });
        }
        if future > 0 {
            rejections.push(Rejection {
                rule: Rule::FutureDate,
                reason: format!("date column is after {}", self.now),
                count: future,
            });
        }

        Validated {
            batch: Batch::new(kept),
            rows_in,
            rows_rejected: null_pk + future,
            rejections,
            truncated_values,
        }
    }

    fn is_future(&self, row: &Row) -> bool {
        self.date_idx
            .and_then(|idx| row.get(idx))
            .and_then(SqlValue::as_naive_datetime)
            .is_some_and(|ts| ts > self.now)
    }
}

/// Merge `incoming` tallies into `totals`, keeping one entry per rule.
pub fn merge_rejections(totals: &mut Vec<Rejection>, incoming: Vec<Rejection>) {
    for r in incoming {
        match totals.iter_mut().find(|t| t.rule == r.rule) {
            Some(existing) => existing.count += r.count,
            None => totals.push(r),
        }
    }
}

/// Truncate `s` to at most `max` characters. Returns whether anything was cut.
fn truncate_chars(s: &mut String, max: usize) -> bool {
    match s.char_indices().nth(max) {
        Some((byte_idx, _)) => {
            s.truncate(byte_idx);
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SqlNullType;
    use chrono::NaiveDate;

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn day(d: u32) -> SqlValue {
        SqlValue::Date(NaiveDate::from_ymd_opt(2024, 6, d).unwrap())
    }

    fn validator(config: ValidationConfig) -> LoadReadyValidator {
        LoadReadyValidator::new(config, 0, Some(1), now())
    }

    #[test]
    fn test_rejects_null_key_and_future_dates() {
        let batch = Batch::new(vec![
            vec![SqlValue::I64(1), day(1), "a".into()],
            vec![SqlValue::Null(SqlNullType::I64), day(1), "b".into()],
            vec![SqlValue::I64(3), day(2), "c".into()],
            vec![SqlValue::I64(4), SqlValue::Null(SqlNullType::Date), "d".into()],
        ]);

        let out = validator(ValidationConfig::default()).validate(batch);

        assert_eq!(out.rows_in, 4);
        assert_eq!(out.rows_kept(), 2);
        assert_eq!(out.rows_rejected, 2);
        assert_eq!(out.rows_in, out.rows_kept() + out.rows_rejected);
        assert_eq!(out.rejections.len(), 2);
        assert_eq!(out.rejections[0].rule, Rule::NullPrimaryKey);
        assert_eq!(out.rejections[1].rule, Rule::FutureDate);
    }

    #[test]
    fn test_null_key_rule_runs_first() {
        // Null key and future date on the same row counts once, under the first rule.
        let batch = Batch::new(vec![vec![SqlValue::Null(SqlNullType::I64), day(9)]]);
        let out = validator(ValidationConfig::default()).validate(batch);
        assert_eq!(out.rejections.len(), 1);
        assert_eq!(out.rejections[0].rule, Rule::NullPrimaryKey);
    }

    #[test]
    fn test_rules_can_be_disabled() {
        let config = ValidationConfig {
            reject_null_pk: false,
            reject_future_dates: false,
            ..ValidationConfig::default()
        };
        let batch = Batch::new(vec![
            vec![SqlValue::Null(SqlNullType::I64), day(1)],
            vec![SqlValue::I64(2), day(30)],
        ]);
        let out = validator(config).validate(batch);
        assert_eq!(out.rows_kept(), 2);
        assert!(out.rejections.is_empty());
    }

    #[test]
    fn test_truncates_without_rejecting() {
        let config = ValidationConfig {
            max_string_length: 3,
            ..ValidationConfig::default()
        };
        let batch = Batch::new(vec![
            vec![SqlValue::I64(1), day(1), "abcdef".into()],
            vec![SqlValue::I64(2), day(1), "ab".into()],
            vec![SqlValue::I64(3), day(1), "ééééé".into()],
        ]);
        let out = validator(config).validate(batch);
        assert_eq!(out.rows_kept(), 3);
        assert_eq!(out.rows_rejected, 0);
        assert_eq!(out.truncated_values, 2);
        assert_eq!(out.batch.rows[0][2], SqlValue::Text("abc".into()));
        assert_eq!(out.batch.rows[2][2], SqlValue::Text("ééé".into()));
    }

    #[test]
    fn test_merge_rejections() {
        let mut totals = vec![Rejection {
            rule: Rule::FutureDate,
            reason: "x".into(),
            count: 2,
        }];
        merge_rejections(
            &mut totals,
            vec![
                Rejection {
                    rule: Rule::FutureDate,
                    reason: "x".into(),
                    count: 3,
                },
                Rejection {
                    rule: Rule::NullPrimaryKey,
                    reason: "y".into(),
                    count: 1,
                },
            ],
        );
        assert_eq!(totals.len(), 2);
        assert_eq!(totals[0].count, 5);
    }
}
