//! Chunk naming and the pipe-delimited text encoding `COPY INTO` reads.
//!
//! Rows are `|`-separated and `\n`-terminated with no header. An empty,
//! unquoted field is NULL. Empty strings and fields containing `|`, `"`, CR
//! or LF are wrapped in double quotes with embedded quotes doubled.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::core::{Row, SqlValue};
use crate::error::{Result, SyncError};
use crate::planner::Range;

/// Field separator.
pub const FIELD_TERMINATOR: char = '|';

/// Row separator.
pub const ROW_TERMINATOR: char = '\n';

/// One persisted batch of a range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub range_id: String,
    pub sequence: u32,
    pub row_count: u64,
    pub storage_key: String,
}

/// Key prefix holding every chunk of `range`: `{prefix}/{table}/{label}`.
pub fn range_prefix(prefix: &str, table: &str, range: &Range) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        format!("{}/{}", table, range.label())
    } else {
        format!("{}/{}/{}", prefix, table, range.label())
    }
}

/// Deterministic chunk key: re-exporting a range overwrites, never duplicates.
pub fn chunk_key(prefix: &str, table: &str, range: &Range, sequence: u32) -> String {
    format!("{}/{:05}", range_prefix(prefix, table, range), sequence)
}

/// Sequence number encoded in the last path segment of a chunk key.
pub fn sequence_of(key: &str) -> Option<u32> {
    key.rsplit('/').next()?.parse().ok()
}

/// Encode rows into chunk text.
pub fn encode_rows(rows: &[Row]) -> String {
    let mut out = String::with_capacity(rows.len() * 64);
    for row in rows {
        for (i, value) in row.iter().enumerate() {
            if i > 0 {
                out.push(FIELD_TERMINATOR);
            }
            write_field(&mut out, value);
        }
        out.push(ROW_TERMINATOR);
    }
    out
}

fn write_field(out: &mut String, value: &SqlValue) {
    // Writing to a String cannot fail.
    let _ = match value {
        SqlValue::Null(_) => Ok(()),
        SqlValue::Bool(v) => write!(out, "{}", u8::from(*v)),
        SqlValue::I16(v) => write!(out, "{}", v),
        SqlValue::I32(v) => write!(out, "{}", v),
        SqlValue::I64(v) => write!(out, "{}", v),
        SqlValue::F32(v) if v.is_finite() => write!(out, "{}", v),
        SqlValue::F64(v) if v.is_finite() => write!(out, "{}", v),
        SqlValue::F32(_) | SqlValue::F64(_) => Ok(()),
        SqlValue::Text(s) => {
            write_text(out, s);
            Ok(())
        }
        SqlValue::Bytes(b) => write!(out, "{}", hex::encode_upper(b)),
        SqlValue::Uuid(u) => write!(out, "{}", u),
        SqlValue::Decimal(d) => write!(out, "{}", d),
        SqlValue::DateTime(dt) => write!(out, "{}", dt.format("%Y-%m-%d %H:%M:%S%.f")),
        SqlValue::DateTimeOffset(dt) => {
            write!(out, "{}", dt.format("%Y-%m-%d %H:%M:%S%.f %:z"))
        }
        SqlValue::Date(d) => write!(out, "{}", d.format("%Y-%m-%d")),
        SqlValue::Time(t) => write!(out, "{}", t.format("%H:%M:%S%.f")),
    };
}

fn write_text(out: &mut String, s: &str) {
    let needs_quotes = s.is_empty()
        || s.contains(|c: char| c == FIELD_TERMINATOR || c == '"' || c == '\r' || c == ROW_TERMINATOR);
    if !needs_quotes {
        out.push_str(s);
        return;
    }
    out.push('"');
    for c in s.chars() {
        if c == '"' {
            out.push('"');
        }
        out.push(c);
    }
    out.push('"');
}

/// Decode chunk text back into fields. `None` is NULL.
pub fn decode_rows(text: &str) -> Result<Vec<Vec<Option<String>>>> {
    let mut rows = Vec::new();
    let mut row: Vec<Option<String>> = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    field.push('"');
                } else {
                    in_quotes = false;
                }
            } else {
                field.push(c);
            }
            continue;
        }

        match c {
            '"' if field.is_empty() && !quoted => {
                quoted = true;
                in_quotes = true;
            }
            FIELD_TERMINATOR | ROW_TERMINATOR => {
                let value = std::mem::take(&mut field);
                row.push(if value.is_empty() && !quoted {
                    None
                } else {
                    Some(value)
                });
                quoted = false;
                if c == ROW_TERMINATOR {
                    rows.push(std::mem::take(&mut row));
                }
            }
            _ if quoted => {
                return Err(SyncError::Config(format!(
                    "malformed chunk: unexpected '{}' after closing quote",
                    c
                )));
            }
            _ => field.push(c),
        }
    }

    if in_quotes {
        return Err(SyncError::Config(
            "malformed chunk: unterminated quoted field".into(),
        ));
    }
    if !field.is_empty() || quoted || !row.is_empty() {
        return Err(SyncError::Config(
            "malformed chunk: missing final row terminator".into(),
        ));
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SqlNullType;
    use crate::planner::Range;
    use chrono::NaiveDate;

    fn range(id: u32) -> Range {
        Range {
            id,
            lower: 0,
            upper: 10,
            estimated_rows: 10,
            kind: Default::default(),
        }
    }

    #[test]
    fn test_chunk_keys_are_deterministic() {
        let r = range(4);
        assert_eq!(
            chunk_key("staging/", "FactSales", &r, 2),
            "staging/FactSales/00004/00002"
        );
        assert_eq!(chunk_key("", "FactSales", &r, 0), "FactSales/00004/00000");
        assert_eq!(
            chunk_key("p", "T", &Range::delta(501, 600, 1), 1),
            "p/T/delta-501/00001"
        );
        assert_eq!(sequence_of("p/T/00004/00012"), Some(12));
        assert_eq!(sequence_of("p/T/00004/_manifest"), None);
    }

    #[test]
    fn test_encode_quotes_only_when_needed() {
        let rows = vec![vec![
            SqlValue::I64(1),
            SqlValue::Null(SqlNullType::String),
            "".into(),
            "a|b".into(),
            "say \"hi\"".into(),
            "plain".into(),
            SqlValue::Bool(true),
        ]];
        assert_eq!(
            encode_rows(&rows),
            "1||\"\"|\"a|b\"|\"say \"\"hi\"\"\"|plain|1\n"
        );
    }

    #[test]
    fn test_encode_temporal_values() {
        let dt = NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_milli_opt(3, 4, 5, 600)
            .unwrap();
        let rows = vec![vec![
            SqlValue::DateTime(dt),
            SqlValue::Date(dt.date()),
            SqlValue::F64(f64::INFINITY),
        ]];
        assert_eq!(encode_rows(&rows), "2024-01-02 03:04:05.600|2024-01-02|\n");
    }

    #[test]
    fn test_decode_distinguishes_null_from_empty() {
        let text = encode_rows(&[
            vec![
                SqlValue::I64(7),
                SqlValue::Null(SqlNullType::String),
                "".into(),
            ],
            vec![SqlValue::I64(8), "line\nbreak".into(), "x|y".into()],
        ]);
        let rows = decode_rows(&text).unwrap();
        assert_eq!(
            rows,
            vec![
                vec![Some("7".to_string()), None, Some(String::new())],
                vec![
                    Some("8".to_string()),
                    Some("line\nbreak".to_string()),
                    Some("x|y".to_string())
                ],
            ]
        );
    }

    #[test]
    fn test_decode_rejects_malformed_text() {
        assert!(decode_rows("\"open|1\n").is_err());
        assert!(decode_rows("1|2").is_err());
        assert!(decode_rows("\"a\"b|1\n").is_err());
    }
}
