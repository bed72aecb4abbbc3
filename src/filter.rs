//! Read-only projections of a report by path pattern and session flag.

use std::borrow::Cow;
use std::cell::OnceCell;
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::diff::{self, CoverageSource, Diff, DiffTotals, LineSource};
use crate::error::Result;
use crate::file::ReportFile;
use crate::matcher::Matcher;
use crate::merge::{complexity_from_sessions, coverage_from_sessions};
use crate::model::ReportLine;
use crate::report::Report;
use crate::session::Session;
use crate::totals::{line_totals, sum_totals, ReportTotals};

/// Deployment switches for the single-session totals shortcut.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterOptions {
    pub use_session_totals: bool,
    /// Sessions uploaded before this instant never use the shortcut.
    pub session_totals_cutover: Option<DateTime<Utc>>,
}

impl Report {
    /// A view of the files matching every path pattern and the sessions
    /// sharing any of `flags`. Empty slices do not filter.
    pub fn filter(&self, paths: &[&str], flags: &[&str]) -> Result<FilteredReport<'_>> {
        self.filter_with_options(paths, flags, FilterOptions::default())
    }

    pub fn filter_with_options(
        &self,
        paths: &[&str],
        flags: &[&str],
        options: FilterOptions,
    ) -> Result<FilteredReport<'_>> {
        FilteredReport::new(self, options).filter(paths, flags)
    }
}

#[derive(Debug, Clone)]
pub struct FilteredReport<'a> {
    report: &'a Report,
    paths: Vec<Matcher>,
    flags: Vec<BTreeSet<String>>,
    options: FilterOptions,
    session_ids: OnceCell<Option<BTreeSet<u32>>>,
    totals: OnceCell<ReportTotals>,
}

impl<'a> FilteredReport<'a> {
    pub fn new(report: &'a Report, options: FilterOptions) -> Self {
        Self {
            report,
            paths: Vec::new(),
            flags: Vec::new(),
            options,
            session_ids: OnceCell::new(),
            totals: OnceCell::new(),
        }
    }

    /// Narrow further. The result matches what a single filter with both
    /// sets of criteria would produce.
    pub fn filter(&self, paths: &[&str], flags: &[&str]) -> Result<FilteredReport<'a>> {
        let mut narrowed = FilteredReport::new(self.report, self.options.clone());
        narrowed.paths = self.paths.clone();
        narrowed.flags = self.flags.clone();
        if !paths.is_empty() {
            narrowed.paths.push(Matcher::new(paths.iter().copied())?);
        }
        if !flags.is_empty() {
            narrowed
                .flags
                .push(flags.iter().map(|f| f.to_string()).collect());
        }
        Ok(narrowed)
    }

    pub fn report(&self) -> &'a Report {
        self.report
    }

    pub fn has_path_filter(&self) -> bool {
        self.paths.iter().any(|m| !m.is_empty())
    }

    pub fn has_flag_filter(&self) -> bool {
        !self.flags.is_empty()
    }

    pub fn should_include(&self, path: &str) -> bool {
        self.paths.iter().all(|m| m.matches(path))
    }

    /// Ids of the sessions that pass the flag filter, `None` when there is
    /// no flag filter.
    pub fn session_ids(&self) -> Option<&BTreeSet<u32>> {
        self.session_ids
            .get_or_init(|| {
                if self.flags.is_empty() {
                    return None;
                }
                Some(
                    self.report
                        .sessions()
                        .iter()
                        .filter(|(_, session)| {
                            self.flags
                                .iter()
                                .all(|wanted| session.flags.iter().any(|f| wanted.contains(f)))
                        })
                        .map(|(id, _)| *id)
                        .collect(),
                )
            })
            .as_ref()
    }

    pub fn sessions(&self) -> BTreeMap<u32, &'a Session> {
        let report = self.report;
        report
            .sessions()
            .iter()
            .filter(|(id, _)| self.session_ids().map_or(true, |ids| ids.contains(id)))
            .map(|(id, s)| (*id, s))
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<FilteredReportFile<'_>> {
        if !self.should_include(name) {
            return None;
        }
        let file = self.report.get(name)?;
        Some(FilteredReportFile::new(file, self.session_ids()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some_and(|f| !f.is_empty())
    }

    /// Names of the files in view. Under a flag filter, files left with no
    /// lines are not listed.
    pub fn files(&self) -> Vec<&'a str> {
        let report = self.report;
        report
            .files()
            .filter(|name| self.should_include(name))
            .filter(|name| !self.has_flag_filter() || self.contains(name))
            .collect()
    }

    pub fn totals(&self) -> &ReportTotals {
        self.totals.get_or_init(|| {
            if let Some(totals) = self.session_totals_shortcut() {
                debug!("Using precomputed session totals for filtered report");
                return totals;
            }
            self.compute_totals()
        })
    }

    fn compute_totals(&self) -> ReportTotals {
        let per_file: Vec<ReportTotals> = if self.has_flag_filter() {
            self.files()
                .into_iter()
                .filter_map(|name| self.get(name).map(|f| f.totals().clone()))
                .collect()
        } else {
            self.files()
                .into_iter()
                .filter_map(|name| self.report.file_totals(name))
                .collect()
        };
        let mut totals = sum_totals(per_file);
        totals.sessions = match self.session_ids() {
            Some(ids) => ids.len() as u32,
            None => self.report.sessions().len() as u32,
        };
        totals
    }

    /// A single-flag filter that selects exactly one session may reuse the
    /// totals stored on that session, when enabled and the session is
    /// recent enough.
    fn session_totals_shortcut(&self) -> Option<ReportTotals> {
        if !self.options.use_session_totals || self.has_path_filter() {
            return None;
        }
        if self.flags.len() != 1 || self.flags[0].len() != 1 {
            return None;
        }
        let ids = self.session_ids()?;
        if ids.len() != 1 {
            return None;
        }
        let id = ids.iter().next()?;
        let session = self.report.session(*id)?;
        if let Some(cutover) = self.options.session_totals_cutover {
            if session.timestamp()? < cutover {
                return None;
            }
        }
        session.totals.clone()
    }

    pub fn calculate_diff(&self, diff: &Diff) -> DiffTotals {
        diff::calculate_diff(self, diff)
    }

    /// Compute diff totals and record them on the diff. The underlying
    /// report is not touched.
    pub fn apply_diff(&self, diff: &mut Diff) -> Option<ReportTotals> {
        if diff.files.is_empty() {
            return None;
        }
        let result = self.calculate_diff(diff);
        for (path, totals) in result.files {
            if let Some(file) = diff.files.get_mut(&path) {
                file.totals = Some(totals);
            }
        }
        diff.totals = Some(result.totals.clone());
        Some(result.totals)
    }
}

impl<'r> CoverageSource for FilteredReport<'r> {
    type File<'a> = FilteredReportFile<'a> where Self: 'a;

    fn file(&self, path: &str) -> Option<FilteredReportFile<'_>> {
        self.get(path)
    }
}

/// One file seen through a session filter. Each line is re-derived from
/// the qualifying sessions only.
#[derive(Debug, Clone)]
pub struct FilteredReportFile<'a> {
    file: &'a ReportFile,
    session_ids: Option<&'a BTreeSet<u32>>,
    totals: OnceCell<ReportTotals>,
}

impl<'a> FilteredReportFile<'a> {
    pub fn new(file: &'a ReportFile, session_ids: Option<&'a BTreeSet<u32>>) -> Self {
        Self {
            file,
            session_ids,
            totals: OnceCell::new(),
        }
    }

    pub fn name(&self) -> &'a str {
        self.file.name()
    }

    pub fn get(&self, ln: u32) -> Result<Option<Cow<'a, ReportLine>>> {
        Ok(self.file.get(ln)?.and_then(|line| self.filter_line(line)))
    }

    fn filter_line(&self, line: &'a ReportLine) -> Option<Cow<'a, ReportLine>> {
        let Some(ids) = self.session_ids else {
            return Some(Cow::Borrowed(line));
        };
        let sessions: Vec<_> = line
            .sessions
            .iter()
            .filter(|s| ids.contains(&s.id))
            .cloned()
            .collect();
        if sessions.is_empty() {
            return None;
        }
        if sessions.len() == line.sessions.len() {
            return Some(Cow::Borrowed(line));
        }
        Some(Cow::Owned(ReportLine {
            coverage: coverage_from_sessions(&sessions),
            complexity: complexity_from_sessions(&sessions),
            line_type: line.line_type,
            messages: line.messages.clone(),
            datapoints: line.datapoints.as_ref().map(|dps| {
                dps.iter()
                    .filter(|dp| ids.contains(&dp.sessionid))
                    .cloned()
                    .collect()
            }),
            sessions,
        }))
    }

    pub fn lines(&self) -> impl Iterator<Item = (u32, Cow<'a, ReportLine>)> + '_ {
        self.file
            .lines()
            .filter_map(|(ln, line)| self.filter_line(line).map(|line| (ln, line)))
    }

    pub fn is_empty(&self) -> bool {
        self.lines().next().is_none()
    }

    pub fn totals(&self) -> &ReportTotals {
        self.totals
            .get_or_init(|| line_totals(self.lines().map(|(_, line)| line)))
    }
}

impl LineSource for FilteredReportFile<'_> {
    fn line_at(&self, ln: u32) -> Option<Cow<'_, ReportLine>> {
        self.file.line(ln).and_then(|line| self.filter_line(line))
    }
}
