//! Fixed-shape aggregate statistics and the line aggregation that feeds them.

use std::borrow::Borrow;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::coverage::CoverageKind;
use crate::error::CovstoreError;
use crate::model::{Complexity, LineType, ReportLine};

/// Aggregate statistics for a file, a session, a diff or a whole report.
///
/// Persisted as a 13-element array in field order. An absent `diff` is
/// written as `0`, matching what older archives contain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct ReportTotals {
    pub files: u32,
    pub lines: u32,
    pub hits: u32,
    pub misses: u32,
    pub partials: u32,
    pub coverage: Option<String>,
    pub branches: u32,
    pub methods: u32,
    pub messages: u32,
    pub sessions: u32,
    pub complexity: Option<i64>,
    pub complexity_total: Option<i64>,
    pub diff: Option<Box<ReportTotals>>,
}

impl Default for ReportTotals {
    fn default() -> Self {
        Self {
            files: 0,
            lines: 0,
            hits: 0,
            misses: 0,
            partials: 0,
            coverage: None,
            branches: 0,
            methods: 0,
            messages: 0,
            sessions: 0,
            complexity: Some(0),
            complexity_total: Some(0),
            diff: None,
        }
    }
}

impl ReportTotals {
    /// Coverage as a float percentage, for display.
    pub fn coverage_percent(&self) -> Option<f64> {
        self.coverage.as_deref().and_then(|c| c.parse().ok())
    }

    /// Null the fields that are meaningless when no trackable line was seen.
    pub(crate) fn null_if_empty(mut self) -> Self {
        if self.lines == 0 {
            self.coverage = None;
            self.complexity = None;
            self.complexity_total = None;
        }
        self
    }
}

/// Render `hits / lines` as a percentage string.
///
/// `None` when there are no lines, `"100"` for full coverage and five
/// decimal places otherwise.
pub fn coverage_ratio(hits: u32, lines: u32) -> Option<String> {
    if lines == 0 {
        None
    } else if hits == lines {
        Some("100".to_string())
    } else {
        Some(format!("{:.5}", f64::from(hits) / f64::from(lines) * 100.0))
    }
}

/// Aggregate an iterator of lines into totals. `files` and `sessions` are
/// left at zero for the caller to fill.
pub fn line_totals<I>(lines: I) -> ReportTotals
where
    I: IntoIterator,
    I::Item: Borrow<ReportLine>,
{
    let mut totals = ReportTotals::default();
    let mut complexity = (0i64, 0i64);

    for line in lines {
        let line = line.borrow();
        match line.coverage.kind() {
            Some(CoverageKind::Hit) => totals.hits += 1,
            Some(CoverageKind::Miss) => totals.misses += 1,
            Some(CoverageKind::Partial) => totals.partials += 1,
            Some(CoverageKind::Skipped) | None => {}
        }
        match line.line_type {
            Some(LineType::Branch) => totals.branches += 1,
            Some(LineType::Method) => totals.methods += 1,
            None => {}
        }
        totals.messages += line.message_count();
        match line.complexity {
            Some(Complexity::Total(n)) => complexity.0 += n,
            Some(Complexity::Pair(covered, total)) => {
                complexity.0 += covered;
                complexity.1 += total;
            }
            None => {}
        }
    }

    totals.lines = totals.hits + totals.misses + totals.partials;
    totals.coverage = coverage_ratio(totals.hits, totals.lines);
    totals.complexity = Some(complexity.0);
    totals.complexity_total = Some(complexity.1);
    totals
}

/// Sum per-file totals into one record. `files` counts the inputs.
pub fn sum_totals<I>(items: I) -> ReportTotals
where
    I: IntoIterator,
    I::Item: Borrow<ReportTotals>,
{
    let mut sum = ReportTotals::default();
    let mut complexity = (0i64, 0i64);
    for item in items {
        let t = item.borrow();
        sum.files += 1;
        sum.lines += t.lines;
        sum.hits += t.hits;
        sum.misses += t.misses;
        sum.partials += t.partials;
        sum.branches += t.branches;
        sum.methods += t.methods;
        sum.messages += t.messages;
        complexity.0 += t.complexity.unwrap_or(0);
        complexity.1 += t.complexity_total.unwrap_or(0);
    }
    sum.coverage = coverage_ratio(sum.hits, sum.lines);
    sum.complexity = Some(complexity.0);
    sum.complexity_total = Some(complexity.1);
    sum
}

fn count(value: Option<&Value>) -> u32 {
    match value {
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0) as u32,
        Some(Value::String(s)) => s.parse().unwrap_or(0),
        _ => 0,
    }
}

fn optional_int(value: Option<&Value>) -> Option<i64> {
    match value {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::Null) => None,
        None => Some(0),
        Some(_) => None,
    }
}

impl TryFrom<Value> for ReportTotals {
    type Error = CovstoreError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let items = match value {
            Value::Array(items) => items,
            Value::Object(map) => {
                // Some writers emit the named form; normalise to positional.
                const FIELDS: [&str; 13] = [
                    "f", "n", "h", "m", "p", "c", "b", "d", "M", "s", "C", "N", "diff",
                ];
                FIELDS
                    .iter()
                    .map(|k| map.get(*k).cloned().unwrap_or(Value::Null))
                    .collect()
            }
            other => {
                return Err(CovstoreError::Parse(format!(
                    "totals must be an array, got {other}"
                )))
            }
        };

        let coverage = match items.get(5) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };
        let diff = match items.get(12) {
            Some(v @ (Value::Array(_) | Value::Object(_))) => {
                Some(Box::new(ReportTotals::try_from(v.clone())?))
            }
            _ => None,
        };

        Ok(Self {
            files: count(items.get(0)),
            lines: count(items.get(1)),
            hits: count(items.get(2)),
            misses: count(items.get(3)),
            partials: count(items.get(4)),
            coverage,
            branches: count(items.get(6)),
            methods: count(items.get(7)),
            messages: count(items.get(8)),
            sessions: count(items.get(9)),
            complexity: optional_int(items.get(10)),
            complexity_total: optional_int(items.get(11)),
            diff,
        })
    }
}

impl From<ReportTotals> for Value {
    fn from(t: ReportTotals) -> Self {
        json!([
            t.files,
            t.lines,
            t.hits,
            t.misses,
            t.partials,
            t.coverage,
            t.branches,
            t.methods,
            t.messages,
            t.sessions,
            t.complexity,
            t.complexity_total,
            match t.diff {
                Some(diff) => Value::from(*diff),
                None => json!(0),
            },
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coverage::CoverageValue;

    #[test]
    fn test_coverage_ratio() {
        assert_eq!(coverage_ratio(0, 0), None);
        assert_eq!(coverage_ratio(3, 3).as_deref(), Some("100"));
        assert_eq!(coverage_ratio(1, 3).as_deref(), Some("33.33333"));
        assert_eq!(coverage_ratio(0, 4).as_deref(), Some("0.00000"));
    }

    #[test]
    fn test_line_totals_classifies() {
        let lines = vec![
            ReportLine::new(CoverageValue::Hit(1.0)),
            ReportLine::new(CoverageValue::Miss),
            ReportLine::new(CoverageValue::BranchRatio(1, 2)).with_type(LineType::Branch),
            ReportLine::new(CoverageValue::Skipped),
            ReportLine::new(CoverageValue::Ignore),
            ReportLine::new(CoverageValue::Hit(3.0)).with_type(LineType::Method),
        ];
        let totals = line_totals(&lines);
        assert_eq!(totals.hits, 2);
        assert_eq!(totals.misses, 1);
        assert_eq!(totals.partials, 1);
        assert_eq!(totals.lines, 4);
        assert_eq!(totals.branches, 1);
        assert_eq!(totals.methods, 1);
        assert_eq!(totals.coverage.as_deref(), Some("50.00000"));
    }

    #[test]
    fn test_line_totals_complexity() {
        let mut a = ReportLine::new(CoverageValue::Hit(1.0));
        a.complexity = Some(Complexity::Total(2));
        let mut b = ReportLine::new(CoverageValue::Hit(1.0));
        b.complexity = Some(Complexity::Pair(1, 3));
        let totals = line_totals([a, b]);
        assert_eq!(totals.complexity, Some(3));
        assert_eq!(totals.complexity_total, Some(3));
    }

    #[test]
    fn test_empty_lines_have_no_coverage() {
        let totals = line_totals(Vec::<ReportLine>::new());
        assert_eq!(totals.lines, 0);
        assert_eq!(totals.coverage, None);
    }

    #[test]
    fn test_serializes_as_13_elements() {
        let totals = ReportTotals {
            files: 1,
            lines: 2,
            hits: 1,
            misses: 1,
            coverage: Some("50.00000".to_string()),
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_string(&totals).unwrap(),
            r#"[1,2,1,1,0,"50.00000",0,0,0,0,0,0,0]"#
        );
    }

    #[test]
    fn test_parse_with_nested_diff() {
        let totals: ReportTotals = serde_json::from_str(
            r#"[2,10,8,2,0,"80.00000",0,0,0,1,0,0,[1,2,2,0,0,"100",0,0,0,0,null,null,0]]"#,
        )
        .unwrap();
        assert_eq!(totals.files, 2);
        assert_eq!(totals.sessions, 1);
        let diff = totals.diff.unwrap();
        assert_eq!(diff.coverage.as_deref(), Some("100"));
        assert_eq!(diff.complexity, None);
    }

    #[test]
    fn test_sum_totals() {
        let a = line_totals([ReportLine::new(CoverageValue::Hit(1.0))]);
        let b = line_totals([ReportLine::new(CoverageValue::Miss)]);
        let sum = sum_totals([a, b]);
        assert_eq!(sum.files, 2);
        assert_eq!(sum.lines, 2);
        assert_eq!(sum.coverage.as_deref(), Some("50.00000"));
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        fn coverage_strategy() -> impl Strategy<Value = CoverageValue> {
            prop_oneof![
                Just(CoverageValue::Ignore),
                Just(CoverageValue::Skipped),
                Just(CoverageValue::Miss),
                (1u32..50).prop_map(|n| CoverageValue::Hit(f64::from(n))),
                (0u32..5, 1u32..5).prop_map(|(h, t)| CoverageValue::BranchRatio(h.min(t), t)),
                any::<bool>().prop_map(CoverageValue::Flag),
            ]
        }

        proptest! {
            #[test]
            fn prop_lines_is_sum_of_kinds(values in prop::collection::vec(coverage_strategy(), 0..40)) {
                let lines: Vec<ReportLine> = values.into_iter().map(ReportLine::new).collect();
                let totals = line_totals(&lines);
                prop_assert_eq!(totals.lines, totals.hits + totals.misses + totals.partials);
                prop_assert_eq!(totals.coverage.is_none(), totals.lines == 0);
            }
        }
    }
}
