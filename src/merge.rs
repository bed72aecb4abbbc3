//! Pure functions that combine coverage readings.
//!
//! Every binary merge here is commutative. `Ignore` is the identity and
//! `Skipped` absorbs anything it meets.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::coverage::{CoverageKind, CoverageValue, PartialRange};
use crate::model::{BranchRef, Complexity, CoverageDatapoint, LineSession, ReportLine};

/// Merge two coverage readings.
///
/// `missing` is the already-merged set of missing branches for the line, if
/// any session reported branch data. When present it decides the resulting
/// branch ratio outright.
pub fn merge_coverage(
    a: &CoverageValue,
    b: &CoverageValue,
    missing: Option<&[BranchRef]>,
) -> CoverageValue {
    use CoverageValue::*;

    match (a, b) {
        (Ignore, other) | (other, Ignore) => return other.clone(),
        (Skipped, _) | (_, Skipped) => return Skipped,
        _ => {}
    }

    if let (Some(x), Some(y)) = (a.numeric(), b.numeric()) {
        return if x >= y { a.clone() } else { b.clone() };
    }

    if a.is_ratio() || b.is_ratio() {
        let (a, b) = (a.ranges_as_ratio(), b.ranges_as_ratio());
        return match missing {
            Some(missing) => {
                let total = [&a, &b]
                    .into_iter()
                    .filter_map(|v| match v {
                        BranchRatio(_, total) => Some(*total),
                        _ => None,
                    })
                    .max()
                    .unwrap_or(0);
                BranchRatio(total.saturating_sub(missing.len() as u32), total)
            }
            None => merge_branch(&a, &b),
        };
    }

    match (a, b) {
        (PartialRanges(x), PartialRanges(y)) => return merge_partial_line(x, y),
        (Flag(x), Flag(y)) => return Flag(*x || *y),
        (Flag(flag), other) | (other, Flag(flag)) => {
            return if other.is_truthy() {
                other.clone()
            } else {
                Flag(*flag)
            };
        }
        _ => {}
    }

    // Numeric against ranges: compare as ratios.
    merge_coverage(&a.ranges_as_ratio(), &b.ranges_as_ratio(), missing)
}

/// Merge where at least one side is a branch ratio and no missing-branch
/// information is available.
///
/// Two unequal ratios take the componentwise maximum, which can yield a
/// numerator above the denominator for inconsistent inputs. Nothing
/// downstream normalises that.
fn merge_branch(a: &CoverageValue, b: &CoverageValue) -> CoverageValue {
    use CoverageValue::*;

    if a == b {
        return a.clone();
    }
    match (a, b) {
        (Skipped, _) | (_, Skipped) => Skipped,
        (Hit(_) | PartialFraction(_), _) => a.clone(),
        (_, Hit(_) | PartialFraction(_)) => b.clone(),
        (Miss | Ignore | Flag(_), _) => b.clone(),
        (_, Miss | Ignore | Flag(_)) => a.clone(),
        (BranchRatio(h1, t1), BranchRatio(h2, t2)) => BranchRatio(*h1.max(h2), *t1.max(t2)),
        _ => a.clone(),
    }
}

/// Fold a sequence of readings with `merge_coverage`. A single reading is
/// returned as-is.
pub fn merge_all<'a, I>(values: I, missing: Option<&[BranchRef]>) -> CoverageValue
where
    I: IntoIterator<Item = &'a CoverageValue>,
{
    let mut values = values.into_iter();
    let Some(first) = values.next() else {
        return CoverageValue::Ignore;
    };
    values.fold(first.clone(), |acc, v| merge_coverage(&acc, v, missing))
}

/// Union two lists of column ranges, keeping the best hit per column.
pub fn merge_partial_line(a: &[PartialRange], b: &[PartialRange]) -> CoverageValue {
    let mut all = Vec::with_capacity(a.len() + b.len());
    all.extend_from_slice(a);
    all.extend_from_slice(b);
    CoverageValue::PartialRanges(combine_partials(&all))
}

/// Collapse overlapping column ranges into contiguous runs.
///
/// Closed ranges are inclusive of `end`. Open ranges (`end == None`) run to
/// one past the furthest column seen and are re-emitted as a single open
/// tail.
pub fn combine_partials(ranges: &[PartialRange]) -> Vec<PartialRange> {
    let mut columns: BTreeMap<u32, bool> = BTreeMap::new();
    for range in ranges {
        if let Some(end) = range.end {
            let start = range.start.unwrap_or(0);
            for col in start..=end.max(start) {
                *columns.entry(col).or_insert(false) |= range.hit;
            }
        }
    }

    let open: Vec<&PartialRange> = ranges.iter().filter(|r| r.end.is_none()).collect();
    let last_column = open
        .iter()
        .map(|r| r.start.unwrap_or(0))
        .chain(columns.keys().next_back().copied())
        .max()
        .unwrap_or(0)
        + 1;
    let mut eol = None;
    for range in &open {
        for col in range.start.unwrap_or(0)..last_column {
            *columns.entry(col).or_insert(false) |= range.hit;
        }
        eol = Some(eol.unwrap_or(false) || range.hit);
    }

    let mut result: Vec<PartialRange> = Vec::new();
    for (col, hit) in columns {
        match result.last_mut() {
            Some(run) if run.hit == hit && run.end.map(|e| e + 1) == Some(col) => {
                run.end = Some(col);
            }
            _ => result.push(PartialRange::new(Some(col), Some(col), hit)),
        }
    }

    if let Some(eol) = eol {
        match result.last_mut() {
            Some(run) if run.hit == eol && run.end == Some(last_column - 1) => run.end = None,
            _ => result.push(PartialRange::new(Some(last_column), None, eol)),
        }
    }
    result
}

/// Merge missing-branch sets across sessions.
///
/// `None` when no session carries branch data. Otherwise a branch is missing
/// only if every branch-reporting session misses it; a session that fully
/// hit the line counts as missing nothing.
pub fn merge_missed_branches<'a, I>(sessions: I) -> Option<Vec<BranchRef>>
where
    I: IntoIterator<Item = &'a LineSession>,
{
    let sessions: Vec<&LineSession> = sessions.into_iter().collect();
    if sessions.iter().all(|s| s.branches.is_none()) {
        return None;
    }

    let mut missing: Option<BTreeSet<&BranchRef>> = None;
    for session in &sessions {
        match &session.branches {
            Some(branches) => {
                let set: BTreeSet<&BranchRef> = branches.iter().collect();
                missing = Some(match missing {
                    Some(acc) => acc.intersection(&set).copied().collect(),
                    None => set,
                });
            }
            None if session.coverage.kind() == Some(CoverageKind::Hit) => {
                return Some(Vec::new());
            }
            None => {}
        }
        if missing.as_ref().is_some_and(BTreeSet::is_empty) {
            return Some(Vec::new());
        }
    }
    Some(missing.unwrap_or_default().into_iter().cloned().collect())
}

pub fn merge_complexity(a: Option<Complexity>, b: Option<Complexity>) -> Option<Complexity> {
    match (a, b) {
        (None, other) | (other, None) => other,
        (Some(Complexity::Total(x)), Some(Complexity::Total(y))) => {
            Some(Complexity::Total(x.max(y)))
        }
        (Some(Complexity::Pair(c1, t1)), Some(Complexity::Pair(c2, t2))) => {
            Some(Complexity::Pair(c1.max(c2), t1.max(t2)))
        }
        (Some(pair @ Complexity::Pair(..)), Some(Complexity::Total(_)))
        | (Some(Complexity::Total(_)), Some(pair @ Complexity::Pair(..))) => Some(pair),
    }
}

/// Merge two readings from the same session.
pub fn merge_line_session(a: &LineSession, b: &LineSession) -> LineSession {
    let branches = merge_missed_branches([a, b]);
    let partials = match (&a.partials, &b.partials) {
        (None, None) => None,
        (x, y) => {
            let mut all: Vec<PartialRange> = x.iter().chain(y.iter()).flatten().copied().collect();
            all.sort_by_key(|r| r.start);
            Some(all)
        }
    };
    LineSession {
        id: a.id,
        coverage: merge_coverage(&a.coverage, &b.coverage, branches.as_deref()),
        branches,
        partials,
        complexity: merge_complexity(a.complexity, b.complexity),
    }
}

/// Union two session lists, merging entries that share an id.
pub fn merge_sessions(a: Vec<LineSession>, b: Vec<LineSession>) -> Vec<LineSession> {
    let mut merged = a;
    for session in b {
        match merged.iter_mut().find(|s| s.id == session.id) {
            Some(existing) => *existing = merge_line_session(existing, &session),
            None => merged.push(session),
        }
    }
    merged
}

/// Line coverage derived from its sessions.
pub fn coverage_from_sessions(sessions: &[LineSession]) -> CoverageValue {
    let missing = merge_missed_branches(sessions);
    merge_all(sessions.iter().map(|s| &s.coverage), missing.as_deref())
}

pub fn complexity_from_sessions(sessions: &[LineSession]) -> Option<Complexity> {
    sessions
        .iter()
        .fold(None, |acc, s| merge_complexity(acc, s.complexity))
}

/// Concatenate message payloads. Arrays append, objects union.
pub fn merge_messages(a: Option<Value>, b: Option<Value>) -> Option<Value> {
    match (a, b) {
        (None, other) | (other, None) => other,
        (Some(Value::Array(mut x)), Some(Value::Array(y))) => {
            x.extend(y);
            Some(Value::Array(x))
        }
        (Some(Value::Object(mut x)), Some(Value::Object(y))) => {
            x.extend(y);
            Some(Value::Object(x))
        }
        (Some(x), Some(_)) => Some(x),
    }
}

/// Union datapoints, dropping exact duplicates, in a stable order.
pub fn merge_datapoints(
    a: Option<Vec<CoverageDatapoint>>,
    b: Option<Vec<CoverageDatapoint>>,
) -> Option<Vec<CoverageDatapoint>> {
    if a.is_none() && b.is_none() {
        return None;
    }
    let mut all: Vec<CoverageDatapoint> = a.into_iter().chain(b).flatten().collect();
    all.sort_by_cached_key(CoverageDatapoint::sort_key);
    all.dedup();
    Some(all)
}

/// Merge two lines.
///
/// With `joined` the result's coverage and complexity are re-derived from
/// the merged sessions. Without it the left line's values are kept, which
/// is what an overwriting append wants.
pub fn merge_line(a: ReportLine, b: ReportLine, joined: bool) -> ReportLine {
    let sessions = merge_sessions(a.sessions, b.sessions);
    let (coverage, complexity) = if !joined {
        (a.coverage, a.complexity)
    } else if sessions.is_empty() {
        (
            merge_coverage(&a.coverage, &b.coverage, None),
            merge_complexity(a.complexity, b.complexity),
        )
    } else {
        (
            coverage_from_sessions(&sessions),
            complexity_from_sessions(&sessions),
        )
    };
    ReportLine {
        coverage,
        line_type: a.line_type.or(b.line_type),
        sessions,
        messages: merge_messages(a.messages, b.messages),
        complexity,
        datapoints: merge_datapoints(a.datapoints, b.datapoints),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LineType;
    use CoverageValue::*;

    fn range(start: u32, end: Option<u32>, hit: bool) -> PartialRange {
        PartialRange::new(Some(start), end, hit)
    }

    #[test]
    fn test_identity_and_absorption() {
        assert_eq!(merge_coverage(&Hit(3.0), &Ignore, None), Hit(3.0));
        assert_eq!(merge_coverage(&Ignore, &Miss, None), Miss);
        assert_eq!(merge_coverage(&Hit(3.0), &Skipped, None), Skipped);
        assert_eq!(merge_coverage(&Skipped, &BranchRatio(1, 2), None), Skipped);
    }

    #[test]
    fn test_numeric_takes_max() {
        assert_eq!(merge_coverage(&Miss, &Hit(2.0), None), Hit(2.0));
        assert_eq!(merge_coverage(&PartialFraction(0.5), &Miss, None), PartialFraction(0.5));
        assert_eq!(merge_coverage(&Hit(5.0), &Hit(2.0), None), Hit(5.0));
    }

    #[test]
    fn test_branch_ratio_with_missing() {
        let missing = vec![BranchRef::Index(1)];
        assert_eq!(
            merge_coverage(&BranchRatio(1, 3), &BranchRatio(2, 3), Some(&missing)),
            BranchRatio(2, 3)
        );
        assert_eq!(
            merge_coverage(&BranchRatio(1, 3), &Hit(1.0), Some(&[])),
            BranchRatio(3, 3)
        );
    }

    #[test]
    fn test_merge_branch_without_missing() {
        assert_eq!(merge_coverage(&BranchRatio(1, 2), &Hit(1.0), None), Hit(1.0));
        assert_eq!(merge_coverage(&BranchRatio(1, 2), &Miss, None), BranchRatio(1, 2));
        assert_eq!(
            merge_coverage(&BranchRatio(1, 2), &BranchRatio(2, 4), None),
            BranchRatio(2, 4)
        );
        assert_eq!(
            merge_coverage(&BranchRatio(3, 4), &BranchRatio(1, 2), None),
            BranchRatio(3, 4)
        );
    }

    #[test]
    fn test_flag_rules() {
        assert_eq!(merge_coverage(&Flag(true), &Flag(false), None), Flag(true));
        assert_eq!(merge_coverage(&Flag(true), &Miss, None), Flag(true));
        assert_eq!(merge_coverage(&Flag(true), &Hit(2.0), None), Hit(2.0));
        assert_eq!(merge_coverage(&Miss, &Flag(false), None), Flag(false));
    }

    #[test]
    fn test_ranges_merge() {
        let a = vec![range(0, Some(2), true), range(3, Some(5), false)];
        let b = vec![range(3, Some(4), true)];
        assert_eq!(
            merge_coverage(&PartialRanges(a), &PartialRanges(b), None),
            PartialRanges(vec![range(0, Some(4), true), range(5, Some(5), false)])
        );
    }

    #[test]
    fn test_open_ranges_extend_to_last_column() {
        let a = vec![range(0, Some(3), true), range(4, None, false)];
        let b = vec![range(2, None, true)];
        assert_eq!(
            merge_coverage(&PartialRanges(a), &PartialRanges(b), None),
            PartialRanges(vec![range(0, None, true)])
        );

        let a = vec![range(0, Some(1), true), range(2, None, false)];
        assert_eq!(
            combine_partials(&a),
            vec![range(0, Some(1), true), range(2, None, false)]
        );
    }

    #[test]
    fn test_ranges_against_numeric_become_ratio() {
        let ranges = PartialRanges(vec![range(0, Some(1), true), range(2, None, false)]);
        assert_eq!(merge_coverage(&ranges, &Miss, None), BranchRatio(1, 2));
        assert_eq!(merge_coverage(&Hit(1.0), &ranges, None), Hit(1.0));
    }

    #[test]
    fn test_merge_missed_branches() {
        let none = LineSession::new(0, Hit(1.0));
        assert_eq!(merge_missed_branches([&none]), None);

        let a = LineSession::new(0, BranchRatio(1, 3))
            .with_branches(vec![BranchRef::Index(1), BranchRef::Index(2)]);
        let b = LineSession::new(1, BranchRatio(2, 3)).with_branches(vec![BranchRef::Index(2)]);
        assert_eq!(merge_missed_branches([&a, &b]), Some(vec![BranchRef::Index(2)]));

        let full = LineSession::new(2, Hit(1.0));
        assert_eq!(merge_missed_branches([&a, &full]), Some(vec![]));

        let miss = LineSession::new(3, Miss);
        assert_eq!(
            merge_missed_branches([&a, &miss]),
            Some(vec![BranchRef::Index(1), BranchRef::Index(2)])
        );
    }

    #[test]
    fn test_merge_sessions_unions_by_id() {
        let a = vec![LineSession::new(0, Miss), LineSession::new(1, Hit(1.0))];
        let b = vec![LineSession::new(1, Hit(4.0)), LineSession::new(2, Miss)];
        let merged = merge_sessions(a, b);
        assert_eq!(
            merged,
            vec![
                LineSession::new(0, Miss),
                LineSession::new(1, Hit(4.0)),
                LineSession::new(2, Miss),
            ]
        );
    }

    #[test]
    fn test_merge_line_joined_and_overwrite() {
        let a = ReportLine::from_session(LineSession::new(0, Miss));
        let b = ReportLine::from_session(LineSession::new(1, Hit(1.0))).with_type(LineType::Method);

        let joined = merge_line(a.clone(), b.clone(), true);
        assert_eq!(joined.coverage, Hit(1.0));
        assert_eq!(joined.line_type, Some(LineType::Method));
        assert_eq!(joined.sessions.len(), 2);

        let kept = merge_line(a, b, false);
        assert_eq!(kept.coverage, Miss);
        assert_eq!(kept.sessions.len(), 2);
    }

    #[test]
    fn test_merge_line_branch_sessions() {
        let a = ReportLine::from_session(
            LineSession::new(0, BranchRatio(1, 2)).with_branches(vec![BranchRef::Index(0)]),
        );
        let b = ReportLine::from_session(
            LineSession::new(1, BranchRatio(1, 2)).with_branches(vec![BranchRef::Index(1)]),
        );
        assert_eq!(merge_line(a, b, true).coverage, BranchRatio(2, 2));
    }

    #[test]
    fn test_merge_datapoints_dedups_and_sorts() {
        let x = CoverageDatapoint::new(1, Hit(1.0), vec![2]);
        let y = CoverageDatapoint::new(0, Miss, vec![1]);
        let merged = merge_datapoints(Some(vec![x.clone(), y.clone()]), Some(vec![x.clone()]));
        assert_eq!(merged, Some(vec![y, x]));
        assert_eq!(merge_datapoints(None, None), None);
    }

    #[test]
    fn test_merge_complexity() {
        assert_eq!(
            merge_complexity(Some(Complexity::Total(2)), Some(Complexity::Total(5))),
            Some(Complexity::Total(5))
        );
        assert_eq!(
            merge_complexity(Some(Complexity::Pair(1, 4)), Some(Complexity::Pair(2, 3))),
            Some(Complexity::Pair(2, 4))
        );
        assert_eq!(merge_complexity(None, Some(Complexity::Total(1))), Some(Complexity::Total(1)));
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        fn coverage_strategy() -> impl Strategy<Value = CoverageValue> {
            let range = (0u32..8, prop::option::of(0u32..8), any::<bool>())
                .prop_map(|(s, e, hit)| PartialRange::new(Some(s), e.map(|e| e.max(s)), hit));
            prop_oneof![
                Just(Ignore),
                Just(Skipped),
                Just(Miss),
                (1u32..20).prop_map(|n| Hit(f64::from(n))),
                (1u32..4).prop_map(|n| PartialFraction(f64::from(n) / 4.0)),
                any::<bool>().prop_map(Flag),
                (0u32..6, 0u32..6).prop_map(|(h, t)| BranchRatio(h, t)),
                prop::collection::vec(range, 0..4).prop_map(PartialRanges),
            ]
        }

        proptest! {
            #[test]
            fn prop_ignore_is_identity(x in coverage_strategy()) {
                prop_assert_eq!(merge_coverage(&x, &Ignore, None), x.clone());
                prop_assert_eq!(merge_coverage(&Ignore, &x, None), x);
            }

            #[test]
            fn prop_skipped_absorbs(x in coverage_strategy()) {
                prop_assume!(x != Ignore);
                prop_assert_eq!(merge_coverage(&x, &Skipped, None), Skipped);
            }

            #[test]
            fn prop_merge_is_commutative(a in coverage_strategy(), b in coverage_strategy()) {
                prop_assert_eq!(merge_coverage(&a, &b, None), merge_coverage(&b, &a, None));
            }

            #[test]
            fn prop_merge_with_missing_is_commutative(
                a in coverage_strategy(),
                b in coverage_strategy(),
                n in 0usize..3,
            ) {
                let missing: Vec<BranchRef> = (0..n as i64).map(BranchRef::Index).collect();
                prop_assert_eq!(
                    merge_coverage(&a, &b, Some(&missing)),
                    merge_coverage(&b, &a, Some(&missing))
                );
            }
        }
    }
}
