//! Range planning: cutting a table's key domain into units of work.
//!
//! A plan is an ascending list of [`Range`]s whose half-open spans
//! `[lower, upper)` cover `[min_key, max_key + 1)` exactly, with no gaps and
//! no overlaps. Plans are deterministic: the same policy and domain always
//! produce the same `(id, lower, upper)` list, which is what the watermark's
//! plan fingerprint relies on.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::RangePolicy;
use crate::error::{Result, SyncError};

/// Whether a range belongs to the full copy or to a delta sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeKind {
    /// Filters on the key column.
    #[default]
    Full,
    /// Filters on the cursor column.
    Delta,
}

/// One unit of export/load work over `[lower, upper)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    /// Sequential id, starting at 1.
    pub id: u32,
    /// Inclusive lower key.
    pub lower: i64,
    /// Exclusive upper key.
    pub upper: i64,
    /// Planner's row estimate.
    pub estimated_rows: u64,
    #[serde(default)]
    pub kind: RangeKind,
}

impl Range {
    /// Build the single logical range of a delta sync.
    pub fn delta(lower: i64, upper: i64, estimated_rows: u64) -> Self {
        Self {
            id: 0,
            lower,
            upper,
            estimated_rows,
            kind: RangeKind::Delta,
        }
    }

    /// Identity used in chunk keys, watermarks and logs.
    pub fn label(&self) -> String {
        match self.kind {
            RangeKind::Full => format!("{:05}", self.id),
            RangeKind::Delta => format!("delta-{}", self.lower),
        }
    }

    /// Number of key values the range spans.
    pub fn width(&self) -> i128 {
        i128::from(self.upper) - i128::from(self.lower)
    }

    pub fn contains(&self, key: i64) -> bool {
        key >= self.lower && key < self.upper
    }
}

/// Explicit range boundary from a prior distribution analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Boundary {
    pub lower: i64,
    pub upper: i64,
    #[serde(default)]
    pub estimated_rows: u64,
}

/// Observed extent of a table's key column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyDomain {
    pub min_key: i64,
    pub max_key: i64,
    pub total_rows: u64,
}

impl KeyDomain {
    /// The part of the domain at or below `ceiling`, `None` if nothing is left.
    /// `ceiling` of `None` means no key had been written yet.
    pub fn capped_at(self, ceiling: Option<i64>) -> Option<KeyDomain> {
        let ceiling = ceiling?;
        if self.min_key > ceiling {
            return None;
        }
        Some(KeyDomain {
            max_key: self.max_key.min(ceiling),
            ..self
        })
    }
}

/// Plan the ranges for `domain` under `policy`.
///
/// No returned range has an estimate above `max_range_rows` unless it spans a
/// single key and cannot be split any further.
pub fn plan(policy: &RangePolicy, domain: &KeyDomain, max_range_rows: u64) -> Result<Vec<Range>> {
    if domain.min_key > domain.max_key {
        return Err(SyncError::Config(format!(
            "min_key {} is greater than max_key {}",
            domain.min_key, domain.max_key
        )));
    }
    if max_range_rows == 0 {
        return Err(SyncError::Config("max_range_rows must be at least 1".into()));
    }
    let end = domain
        .max_key
        .checked_add(1)
        .ok_or_else(|| SyncError::Config("max_key is too large to plan".into()))?;

    let spans = match policy {
        RangePolicy::FixedWidth {
            rows_per_range,
            range_width,
        } => fixed_width(domain, end, *rows_per_range, *range_width)?,
        RangePolicy::DataDriven { boundaries } => data_driven(domain, end, boundaries)?,
    };

    let mut ranges = Vec::with_capacity(spans.len());
    for span in spans {
        split_to_ceiling(span, max_range_rows, &mut ranges);
    }
    for (i, range) in ranges.iter_mut().enumerate() {
        range.id = i as u32 + 1;
    }
    Ok(ranges)
}

/// SHA-256 over the planned `(id, lower, upper)` list.
pub fn fingerprint(ranges: &[Range]) -> String {
    let mut hasher = Sha256::new();
    for r in ranges {
        hasher.update(format!("{}:{}:{}\n", r.id, r.lower, r.upper).as_bytes());
    }
    hex::encode(hasher.finalize())
}

fn span(lower: i64, upper: i64, estimated_rows: u64) -> Range {
    Range {
        id: 0,
        lower,
        upper,
        estimated_rows,
        kind: RangeKind::Full,
    }
}

fn fixed_width(
    domain: &KeyDomain,
    end: i64,
    rows_per_range: u64,
    range_width: Option<i64>,
) -> Result<Vec<Range>> {
    if rows_per_range == 0 {
        return Err(SyncError::Config("rows_per_range must be at least 1".into()));
    }
    let domain_width = i128::from(end) - i128::from(domain.min_key);
    let total = i128::from(domain.total_rows);

    let width = match range_width {
        Some(w) if w <= 0 => {
            return Err(SyncError::Config("range_width must be at least 1".into()));
        }
        Some(w) => i128::from(w),
        // density = total / domain_width, so width = rows_per_range / density
        None if total == 0 => domain_width,
        None => (i128::from(rows_per_range) * domain_width + total - 1) / total,
    }
    .clamp(1, domain_width);

    let mut spans = Vec::new();
    let mut lower = i128::from(domain.min_key);
    while lower < i128::from(end) {
        let upper = (lower + width).min(i128::from(end));
        let estimated = (total * (upper - lower) + domain_width - 1) / domain_width;
        spans.push(span(lower as i64, upper as i64, estimated as u64));
        lower = upper;
    }
    Ok(spans)
}

fn data_driven(domain: &KeyDomain, end: i64, boundaries: &[Boundary]) -> Result<Vec<Range>> {
    if boundaries.is_empty() {
        return Err(SyncError::Config(
            "data_driven policy needs at least one boundary".into(),
        ));
    }
    for (i, b) in boundaries.iter().enumerate() {
        if b.upper <= b.lower {
            return Err(SyncError::Config(format!(
                "boundary {} has upper {} <= lower {}",
                i, b.upper, b.lower
            )));
        }
        if i > 0 {
            let prev = &boundaries[i - 1];
            if b.lower < prev.lower {
                return Err(SyncError::Config(format!(
                    "boundaries are not ascending at index {}",
                    i
                )));
            }
            if b.lower < prev.upper {
                return Err(SyncError::Config(format!(
                    "boundary {} overlaps boundary {}",
                    i,
                    i - 1
                )));
            }
        }
    }

    let clipped: Vec<Boundary> = boundaries
        .iter()
        .filter_map(|b| {
            let lower = b.lower.max(domain.min_key);
            let upper = b.upper.min(end);
            (upper > lower).then(|| Boundary {
                lower,
                upper,
                estimated_rows: b.estimated_rows,
            })
        })
        .collect();

    // Empty spans and gaps fold into the preceding work span; anything before
    // the first non-empty span folds into that span.
    let mut spans: Vec<Range> = Vec::new();
    for b in clipped.iter().filter(|b| b.estimated_rows > 0) {
        match spans.last_mut() {
            Some(prev) => {
                prev.upper = b.lower;
                spans.push(span(b.lower, b.upper, b.estimated_rows));
            }
            None => spans.push(span(domain.min_key, b.upper, b.estimated_rows)),
        }
    }
    match spans.last_mut() {
        Some(last) => last.upper = end,
        None => {
            let estimated = clipped.iter().map(|b| b.estimated_rows).sum();
            spans.push(span(domain.min_key, end, estimated));
        }
    }
    Ok(spans)
}

/// Split `range` into near-equal sub-spans until every estimate fits the ceiling.
fn split_to_ceiling(range: Range, max_rows: u64, out: &mut Vec<Range>) {
    let width = range.width();
    if range.estimated_rows <= max_rows || width <= 1 {
        out.push(range);
        return;
    }

    let parts = (i128::from(range.estimated_rows.div_ceil(max_rows))).min(width);
    let base_width = width / parts;
    let wide = width % parts;
    let est = i128::from(range.estimated_rows);

    let mut lower = i128::from(range.lower);
    let mut assigned = 0i128;
    for i in 0..parts {
        let w = base_width + i128::from(i < wide);
        let upper = lower + w;
        // Cumulative rounding keeps the sub-estimates summing to the original.
        let cumulative = est * (upper - i128::from(range.lower)) / width;
        let sub = span(lower as i64, upper as i64, (cumulative - assigned) as u64);
        assigned = cumulative;
        split_to_ceiling(sub, max_rows, out);
        lower = upper;
    }
}
