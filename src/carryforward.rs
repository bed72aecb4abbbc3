//! Carrying coverage forward from a parent commit's report.
//!
//! A carried-forward report keeps only the sessions uploaded under the
//! requested flags, retyped so later uploads can tell them apart from
//! fresh data.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::info;

use crate::editable::EditableReport;
use crate::error::Result;
use crate::matcher::Matcher;
use crate::report::Report;
use crate::session::SessionType;

const DEFAULT_NAME: &str = "Carriedforward";

/// Name for a session after one more round of carrying forward.
///
/// Each leading `CF ` of the legacy naming counts as one round, and
/// `CF[n]` names have their counter incremented.
pub fn carriedforward_session_name(name: Option<&str>) -> String {
    let name = match name {
        None | Some("") => return DEFAULT_NAME.to_string(),
        Some(name) => name,
    };

    if name.starts_with("CF ") {
        let mut rest = name;
        let mut rounds = 0;
        while let Some(stripped) = rest.strip_prefix("CF ") {
            rest = stripped;
            rounds += 1;
        }
        return format!("CF[{rounds}] - {rest}");
    }

    if let Some((count, tail)) = bracketed_count(name) {
        return format!("CF[{}]{tail}", count + 1);
    }
    format!("CF[1] - {name}")
}

/// Split `CF[<n>]<tail>` into `n` and the tail.
fn bracketed_count(name: &str) -> Option<(u64, &str)> {
    let inner = name.strip_prefix("CF[")?;
    let close = inner.find(']')?;
    let digits = &inner[..close];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((digits.parse().ok()?, &inner[close + 1..]))
}

/// Copy `report`, keeping only files matching `paths` and sessions sharing
/// a flag with `flags`. Kept sessions are retyped and renamed as carried
/// forward; `session_extras` replaces their extras when given.
pub fn generate_carryforward_report(
    report: &Report,
    flags: &[&str],
    paths: Option<&[&str]>,
    session_extras: Option<&BTreeMap<String, Value>>,
) -> Result<EditableReport> {
    let mut editable = EditableReport::from(report.clone());

    if let Some(paths) = paths.filter(|p| !p.is_empty()) {
        let matcher = Matcher::new(paths.iter().copied())?;
        let excluded: Vec<String> = editable
            .files()
            .filter(|name| !matcher.matches(name))
            .map(str::to_string)
            .collect();
        for name in &excluded {
            editable.remove(name);
        }
    }

    let mut kept = Vec::new();
    let mut dropped = Vec::new();
    for (id, session) in editable.sessions() {
        if session.has_any_flag(flags) {
            kept.push(*id);
        } else {
            dropped.push(*id);
        }
    }
    editable.delete_multiple_sessions(dropped);

    for id in &kept {
        if let Some(session) = editable.sessions.get_mut(id) {
            session.session_type = SessionType::Carriedforward;
            session.name = Some(carriedforward_session_name(session.name.as_deref()));
            if let Some(extras) = session_extras {
                session.session_extras = extras.clone();
            }
        }
    }
    editable.invalidate();

    info!(
        sessions = kept.len(),
        files = editable.len(),
        "Generated carryforward report"
    );
    Ok(editable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coverage::CoverageValue;
    use crate::file::ReportFile;
    use crate::model::{LineSession, ReportLine};
    use crate::session::Session;

    #[test]
    fn test_session_names() {
        assert_eq!(carriedforward_session_name(None), "Carriedforward");
        assert_eq!(carriedforward_session_name(Some("")), "Carriedforward");
        assert_eq!(carriedforward_session_name(Some("CF CF CF Dude")), "CF[3] - Dude");
        assert_eq!(carriedforward_session_name(Some("CF[9] - X")), "CF[10] - X");
        assert_eq!(carriedforward_session_name(Some("CF[1] - unit")), "CF[2] - unit");
        assert_eq!(carriedforward_session_name(Some("unit")), "CF[1] - unit");
        assert_eq!(carriedforward_session_name(Some("CFoo")), "CF[1] - CFoo");
        assert_eq!(carriedforward_session_name(Some("CF[x] - y")), "CF[1] - CF[x] - y");
    }

    fn report() -> Report {
        let mut report = Report::new();
        report.add_session(Session::new(["simple"]));
        report.add_session(Session::new(["other"]).with_name("nightly"));
        for (name, session) in [("src/a.rs", 0), ("src/b.rs", 1), ("docs/c.rs", 0)] {
            let mut file = ReportFile::new(name);
            file.append(
                1,
                ReportLine::from_session(LineSession::new(session, CoverageValue::Hit(1.0))),
            )
            .unwrap();
            file.append(
                2,
                ReportLine::from_session(LineSession::new(session, CoverageValue::Miss)),
            )
            .unwrap();
            report.append(file, true).unwrap();
        }
        report
    }

    #[test]
    fn test_generate_keeps_matching_sessions() {
        let source = report();
        let cf = generate_carryforward_report(&source, &["simple"], None, None).unwrap();

        assert_eq!(cf.sessions().len(), 1);
        let session = cf.session(0).unwrap();
        assert_eq!(session.session_type, SessionType::Carriedforward);
        assert_eq!(session.name.as_deref(), Some("Carriedforward"));

        assert_eq!(cf.files().collect::<Vec<_>>(), vec!["docs/c.rs", "src/a.rs"]);
        assert_eq!(cf.get("src/a.rs").unwrap().get(1).unwrap(), source.get("src/a.rs").unwrap().get(1).unwrap());
        assert_eq!(cf.totals().sessions, 1);

        // The source report is untouched.
        assert_eq!(source.sessions().len(), 2);
        assert_eq!(source.len(), 3);
    }

    #[test]
    fn test_generate_with_paths_and_extras() {
        let source = report();
        let extras = BTreeMap::from([("carriedforward_from".to_string(), Value::from("abc123"))]);
        let cf = generate_carryforward_report(
            &source,
            &["other", "missing"],
            Some(&["src/"][..]),
            Some(&extras),
        )
        .unwrap();

        assert_eq!(cf.files().collect::<Vec<_>>(), vec!["src/b.rs"]);
        let session = cf.session(1).unwrap();
        assert_eq!(session.name.as_deref(), Some("CF[1] - nightly"));
        assert_eq!(session.session_extras, extras);
    }

    #[test]
    fn test_generate_without_matches() {
        let cf = generate_carryforward_report(&report(), &["nope"], None, None).unwrap();
        assert!(cf.is_empty());
        assert!(cf.sessions().is_empty());
    }
}
