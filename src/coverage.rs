//! The coverage reading carried by a line, a line session or a datapoint.
//!
//! Archives store these as loosely typed JSON (`1`, `0`, `-1`, `null`, `true`,
//! `"1/2"`, `[[0, 4, 1]]`); `CoverageValue` is the typed form of that union.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::CovstoreError;

/// Outcome of classifying a coverage value for aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoverageKind {
    Hit,
    Miss,
    Partial,
    Skipped,
}

/// A column range within a line: `[start, end, hit]`. `None` bounds are open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "Vec<Value>", into = "Vec<Value>")]
pub struct PartialRange {
    pub start: Option<u32>,
    pub end: Option<u32>,
    pub hit: bool,
}

impl PartialRange {
    pub fn new(start: Option<u32>, end: Option<u32>, hit: bool) -> Self {
        Self { start, end, hit }
    }
}

impl TryFrom<Vec<Value>> for PartialRange {
    type Error = CovstoreError;

    fn try_from(items: Vec<Value>) -> Result<Self, Self::Error> {
        if items.len() < 3 {
            return Err(CovstoreError::Parse(format!(
                "partial range needs 3 elements, got {}",
                items.len()
            )));
        }
        let bound = |v: &Value| v.as_u64().map(|n| n as u32);
        let hit = CoverageValue::try_from(items[2].clone())?.is_truthy();
        Ok(Self {
            start: bound(&items[0]),
            end: bound(&items[1]),
            hit,
        })
    }
}

impl From<PartialRange> for Vec<Value> {
    fn from(range: PartialRange) -> Self {
        vec![
            json!(range.start),
            json!(range.end),
            json!(u8::from(range.hit)),
        ]
    }
}

/// A single coverage reading.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum CoverageValue {
    /// No reading (`null`). Identity for merging.
    #[default]
    Ignore,
    /// Explicitly skipped (`-1`). Absorbs everything when merged.
    Skipped,
    Miss,
    Hit(f64),
    /// Fractional coverage strictly between 0 and 1.
    PartialFraction(f64),
    /// Legacy boolean reading; `true` means partially covered.
    Flag(bool),
    /// `"covered/total"` branch reading.
    BranchRatio(u32, u32),
    /// Column-level ranges within the line.
    PartialRanges(Vec<PartialRange>),
}

impl CoverageValue {
    /// Build a value from a raw numeric reading.
    pub fn from_number(n: f64) -> Self {
        if n < 0.0 {
            CoverageValue::Skipped
        } else if n == 0.0 {
            CoverageValue::Miss
        } else if n < 1.0 {
            CoverageValue::PartialFraction(n)
        } else {
            CoverageValue::Hit(n)
        }
    }

    pub fn from_hits(hits: u64) -> Self {
        Self::from_number(hits as f64)
    }

    /// Numeric view of hit/miss/fraction readings.
    pub fn numeric(&self) -> Option<f64> {
        match self {
            CoverageValue::Miss => Some(0.0),
            CoverageValue::Hit(n) | CoverageValue::PartialFraction(n) => Some(*n),
            _ => None,
        }
    }

    pub fn is_ratio(&self) -> bool {
        matches!(self, CoverageValue::BranchRatio(..))
    }

    pub fn is_ranges(&self) -> bool {
        matches!(self, CoverageValue::PartialRanges(_))
    }

    /// Truthiness as the archive format understands it (`0`, `false`,
    /// `null` and empty range lists are falsy).
    pub fn is_truthy(&self) -> bool {
        match self {
            CoverageValue::Ignore | CoverageValue::Miss => false,
            CoverageValue::Flag(b) => *b,
            CoverageValue::PartialRanges(ranges) => !ranges.is_empty(),
            CoverageValue::Hit(_)
            | CoverageValue::PartialFraction(_)
            | CoverageValue::Skipped
            | CoverageValue::BranchRatio(..) => true,
        }
    }

    /// Classify for aggregation. `None` means the line is not counted at all.
    pub fn kind(&self) -> Option<CoverageKind> {
        match self {
            CoverageValue::Ignore => None,
            CoverageValue::Skipped => Some(CoverageKind::Skipped),
            CoverageValue::Miss | CoverageValue::Flag(false) => Some(CoverageKind::Miss),
            CoverageValue::Hit(_) => Some(CoverageKind::Hit),
            CoverageValue::PartialFraction(_) | CoverageValue::Flag(true) => {
                Some(CoverageKind::Partial)
            }
            CoverageValue::BranchRatio(covered, total) => Some(if covered == total {
                CoverageKind::Hit
            } else if *covered == 0 {
                CoverageKind::Miss
            } else {
                CoverageKind::Partial
            }),
            CoverageValue::PartialRanges(ranges) => ranges_to_ratio(ranges).kind(),
        }
    }

    /// Replace a range list by its `"hits/total"` equivalent; other values
    /// are returned unchanged.
    pub fn ranges_as_ratio(&self) -> CoverageValue {
        match self {
            CoverageValue::PartialRanges(ranges) => ranges_to_ratio(ranges),
            other => other.clone(),
        }
    }
}

/// `total` is the number of ranges, `hits` the number of ranges with a hit.
pub fn ranges_to_ratio(ranges: &[PartialRange]) -> CoverageValue {
    let hits = ranges.iter().filter(|r| r.hit).count() as u32;
    CoverageValue::BranchRatio(hits, ranges.len() as u32)
}

fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        json!(n as i64)
    } else {
        json!(n)
    }
}

impl TryFrom<Value> for CoverageValue {
    type Error = CovstoreError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Null => Ok(CoverageValue::Ignore),
            Value::Bool(b) => Ok(CoverageValue::Flag(b)),
            Value::Number(n) => n
                .as_f64()
                .map(CoverageValue::from_number)
                .ok_or_else(|| CovstoreError::Parse(format!("unrepresentable coverage {n}"))),
            Value::String(s) => parse_coverage_str(&s),
            Value::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Value::Array(parts) => PartialRange::try_from(parts),
                    other => Err(CovstoreError::Parse(format!(
                        "expected partial range, got {other}"
                    ))),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(CoverageValue::PartialRanges),
            Value::Object(_) => Err(CovstoreError::Parse(
                "coverage cannot be an object".to_string(),
            )),
        }
    }
}

fn parse_coverage_str(s: &str) -> Result<CoverageValue, CovstoreError> {
    if let Some((covered, total)) = s.split_once('/') {
        let covered = covered.trim().parse::<u32>();
        let total = total.trim().parse::<u32>();
        if let (Ok(covered), Ok(total)) = (covered, total) {
            return Ok(CoverageValue::BranchRatio(covered, total));
        }
    } else if let Ok(n) = s.trim().parse::<f64>() {
        return Ok(CoverageValue::from_number(n));
    }
    Err(CovstoreError::Parse(format!("unrecognised coverage '{s}'")))
}

impl From<CoverageValue> for Value {
    fn from(value: CoverageValue) -> Self {
        match value {
            CoverageValue::Ignore => Value::Null,
            CoverageValue::Skipped => json!(-1),
            CoverageValue::Miss => json!(0),
            CoverageValue::Hit(n) => number_value(n),
            CoverageValue::PartialFraction(f) => json!(f),
            CoverageValue::Flag(b) => Value::Bool(b),
            CoverageValue::BranchRatio(covered, total) => json!(format!("{covered}/{total}")),
            CoverageValue::PartialRanges(ranges) => Value::Array(
                ranges
                    .into_iter()
                    .map(|r| Value::Array(r.into()))
                    .collect(),
            ),
        }
    }
}

impl fmt::Display for CoverageValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoverageValue::BranchRatio(covered, total) => write!(f, "{covered}/{total}"),
            other => write!(f, "{}", Value::from(other.clone())),
        }
    }
}
