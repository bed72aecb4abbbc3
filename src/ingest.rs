use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::coverage::CoverageValue;
use crate::error::{CovstoreError, Result};
use crate::file::ReportFile;
use crate::model::{BranchRef, LineSession, LineType, ReportLine};
use crate::parsers::lcov::LcovParser;
use crate::parsers::{CoverageData, FileCoverage, Parser};
use crate::report::Report;
use crate::session::Session;
use crate::store::{self, ArchiveStore};
use crate::totals::{sum_totals, ReportTotals};

/// Metadata for the session an upload creates.
#[derive(Debug, Clone, Default)]
pub struct Upload {
    pub flags: Vec<String>,
    pub name: Option<String>,
    /// Defaults to now.
    pub time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ingested {
    pub session_id: u32,
    pub files: usize,
    pub totals: ReportTotals,
}

/// Read an LCOV file and append it as a new session to the stored report
/// `report_name`, creating the report if needed.
pub fn ingest<S: ArchiveStore + ?Sized>(
    store: &mut S,
    report_name: &str,
    file_path: &Path,
    upload: &Upload,
) -> Result<Ingested> {
    let content = std::fs::read(file_path)?;
    let data = LcovParser.parse(&content)?;

    let mut report = match store::load_report(store, report_name) {
        Ok(report) => report,
        Err(CovstoreError::ReportNotFound(_)) => Report::new(),
        Err(e) => return Err(e),
    };
    let ingested = add_upload(&mut report, &data, upload)?;
    store::save_report(store, report_name, &report)?;

    info!(
        report = report_name,
        source = %file_path.display(),
        session = ingested.session_id,
        files = ingested.files,
        "Ingested upload"
    );
    Ok(ingested)
}

/// Append `data` to `report` under a new session. The session's totals
/// cover only what this upload contributed.
pub fn add_upload(report: &mut Report, data: &CoverageData, upload: &Upload) -> Result<Ingested> {
    let mut session = Session::new(upload.flags.iter().cloned());
    session.name = upload.name.clone();
    if let Some(time) = upload.time {
        session = session.with_time(time);
    }
    let (session_id, _) = report.add_session(session);

    let mut names = Vec::new();
    for file in &data.files {
        let file = report_file(file, session_id)?;
        let name = file.name().to_string();
        if report.append(file, true)? {
            names.push(name);
        }
    }

    let per_file: Vec<ReportTotals> = names
        .iter()
        .filter_map(|name| report.summary(name)?.session_totals.get(session_id).cloned())
        .collect();
    let mut totals = sum_totals(per_file);
    totals.sessions = 1;
    if let Some(session) = report.sessions.get_mut(&session_id) {
        session.totals = Some(totals.clone());
    }
    report.invalidate();

    Ok(Ingested {
        session_id,
        files: names.len(),
        totals,
    })
}

/// Convert one uploaded file into report lines for `session_id`.
///
/// Lines with branch arms become branch lines holding a `taken/total`
/// ratio and the untaken arms. Functions whose start line carries no other
/// data become method lines.
pub fn report_file(file: &FileCoverage, session_id: u32) -> Result<ReportFile> {
    let path = file.path.strip_prefix("./").unwrap_or(&file.path);
    let mut out = ReportFile::new(path);

    let mut arms: BTreeMap<u32, Vec<(u32, u64)>> = BTreeMap::new();
    for branch in &file.branches {
        arms.entry(branch.line_number)
            .or_default()
            .push((branch.branch_index, branch.hit_count));
    }

    for line in &file.lines {
        if arms.contains_key(&line.line_number) {
            continue;
        }
        let coverage = CoverageValue::from_hits(line.hit_count);
        out.append(
            line.line_number,
            ReportLine::from_session(LineSession::new(session_id, coverage)),
        )?;
    }

    for (ln, arms) in &arms {
        if *ln == 0 {
            continue;
        }
        let total = arms.len() as u32;
        let taken = arms.iter().filter(|(_, hits)| *hits > 0).count() as u32;
        let missing: Vec<BranchRef> = arms
            .iter()
            .filter(|(_, hits)| *hits == 0)
            .map(|(idx, _)| BranchRef::Index(i64::from(*idx)))
            .collect();
        let coverage = CoverageValue::BranchRatio(taken, total);
        let session = LineSession::new(session_id, coverage).with_branches(missing);
        out.append(*ln, ReportLine::from_session(session).with_type(LineType::Branch))?;
    }

    for function in &file.functions {
        let Some(start) = function.start_line.filter(|ln| *ln > 0) else { continue };
        if out.line(start).is_some() {
            continue;
        }
        let coverage = CoverageValue::from_hits(function.hit_count);
        out.append(
            start,
            ReportLine::from_session(LineSession::new(session_id, coverage)).with_type(LineType::Method),
        )?;
    }

    Ok(out)
}
