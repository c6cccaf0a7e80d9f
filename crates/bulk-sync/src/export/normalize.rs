//! Per-batch value normalization applied before validation.

use crate::core::{Batch, SqlNullType, SqlValue};

/// Text values treated as NULL.
const NULL_MARKERS: [&str; 4] = ["nan", "None", "NULL", "null"];

/// Decimal places kept for non-integral floating point columns.
const FLOAT_DECIMALS: i32 = 10;

/// Largest magnitude at which an `f64` still converts to `i64` exactly.
const MAX_EXACT_INT: f64 = 9_007_199_254_740_992.0;

/// Normalize a batch in place:
///
/// - non-finite floats become NULL
/// - a float column whose non-null values in this batch are all whole becomes `I64`
/// - other float columns are rounded to ten decimal places
/// - textual null markers become NULL
pub fn normalize_batch(batch: &mut Batch) {
    let width = batch.rows.first().map_or(0, Vec::len);

    for row in batch.rows.iter_mut() {
        for value in row.iter_mut() {
            match value {
                SqlValue::F64(v) if !v.is_finite() => *value = SqlValue::Null(SqlNullType::F64),
                SqlValue::F32(v) if !v.is_finite() => *value = SqlValue::Null(SqlNullType::F32),
                SqlValue::Text(s) if NULL_MARKERS.contains(&s.as_str()) => {
                    *value = SqlValue::Null(SqlNullType::String)
                }
                _ => {}
            }
        }
    }

    for col in 0..width {
        let mut has_float = false;
        let mut all_whole = true;
        for row in &batch.rows {
            match row.get(col) {
                Some(SqlValue::F64(v)) => {
                    has_float = true;
                    all_whole &= is_whole(*v);
                }
                Some(SqlValue::F32(v)) => {
                    has_float = true;
                    all_whole &= is_whole(f64::from(*v));
                }
                _ => {}
            }
        }
        if !has_float {
            continue;
        }

        for row in batch.rows.iter_mut() {
            if let Some(value) = row.get_mut(col) {
                *value = match value {
                    SqlValue::F64(v) if all_whole => SqlValue::I64(*v as i64),
                    SqlValue::F32(v) if all_whole => SqlValue::I64(*v as i64),
                    SqlValue::Null(SqlNullType::F64 | SqlNullType::F32) if all_whole => {
                        SqlValue::Null(SqlNullType::I64)
                    }
                    SqlValue::F64(v) => SqlValue::F64(round(*v)),
                    SqlValue::F32(v) => SqlValue::F64(round(f64::from(*v))),
                    _ => continue,
                };
            }
        }
    }
}

fn is_whole(v: f64) -> bool {
    v.fract() == 0.0 && v.abs() <= MAX_EXACT_INT
}

fn round(v: f64) -> f64 {
    let scale = 10f64.powi(FLOAT_DECIMALS);
    let scaled = v * scale;
    if scaled.is_finite() && scaled.abs() < MAX_EXACT_INT {
        scaled.round() / scale
    } else {
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_finite_and_markers_become_null() {
        let mut batch = Batch::new(vec![vec![
            SqlValue::F64(f64::INFINITY),
            SqlValue::F64(f64::NAN),
            "None".into(),
            "nan".into(),
            "Nancy".into(),
        ]]);
        normalize_batch(&mut batch);
        let row = &batch.rows[0];
        assert!(row[0].is_null());
        assert!(row[1].is_null());
        assert!(row[2].is_null());
        assert!(row[3].is_null());
        assert_eq!(row[4], SqlValue::Text("Nancy".into()));
    }

    #[test]
    fn test_whole_float_column_becomes_integer() {
        let mut batch = Batch::new(vec![
            vec![SqlValue::F64(3.0), SqlValue::F64(1.5)],
            vec![SqlValue::Null(SqlNullType::F64), SqlValue::F64(2.0)],
            vec![SqlValue::F64(f64::NEG_INFINITY), SqlValue::F64(0.1 + 0.2)],
        ]);
        normalize_batch(&mut batch);

        assert_eq!(batch.rows[0][0], SqlValue::I64(3));
        assert_eq!(batch.rows[1][0], SqlValue::Null(SqlNullType::I64));
        assert_eq!(batch.rows[2][0], SqlValue::Null(SqlNullType::I64));

        assert_eq!(batch.rows[0][1], SqlValue::F64(1.5));
        assert_eq!(batch.rows[1][1], SqlValue::F64(2.0));
        assert_eq!(batch.rows[2][1], SqlValue::F64(0.3));
    }

    #[test]
    fn test_non_float_columns_untouched() {
        let mut batch = Batch::new(vec![vec![SqlValue::I32(1), "x".into()]]);
        normalize_batch(&mut batch);
        assert_eq!(batch.rows[0][0], SqlValue::I32(1));
    }
}
