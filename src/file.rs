//! Per-file line store.
//!
//! A file loaded from an archive keeps its chunk text untouched until
//! something needs the lines. Read-only access parses into a cache; the
//! first mutation takes ownership of the parsed lines and drops the text.

use std::cell::OnceCell;
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::diff::{self, DiffSegment};
use crate::error::{CovstoreError, Result};
use crate::merge::{self, coverage_from_sessions, complexity_from_sessions};
use crate::model::ReportLine;
use crate::totals::{line_totals, ReportTotals};

type Lines = Vec<Option<ReportLine>>;

/// Lines a file refuses to store: explicit line numbers and everything
/// after an end-of-file cutoff.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IgnoreRule {
    pub eof: Option<u32>,
    pub lines: BTreeSet<u32>,
}

impl IgnoreRule {
    pub fn matches(&self, ln: u32) -> bool {
        self.lines.contains(&ln) || self.eof.is_some_and(|eof| ln > eof)
    }
}

/// Header line of a serialized chunk.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ChunkDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    present_sessions: Option<Vec<u32>>,
}

#[derive(Debug, Clone)]
pub struct ReportFile {
    name: String,
    raw: Option<String>,
    lines: OnceCell<Lines>,
    present_sessions: OnceCell<BTreeSet<u32>>,
    totals: OnceCell<ReportTotals>,
    ignore: Option<IgnoreRule>,
}

impl ReportFile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            raw: None,
            lines: OnceCell::from(Vec::new()),
            present_sessions: OnceCell::new(),
            totals: OnceCell::new(),
            ignore: None,
        }
    }

    pub fn with_ignore(name: impl Into<String>, ignore: IgnoreRule) -> Self {
        let mut file = Self::new(name);
        file.ignore = Some(ignore);
        file
    }

    /// Wrap unparsed chunk text.
    pub(crate) fn from_raw(name: impl Into<String>, raw: String) -> Self {
        Self {
            name: name.into(),
            raw: Some(raw),
            lines: OnceCell::new(),
            present_sessions: OnceCell::new(),
            totals: OnceCell::new(),
            ignore: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Whether the chunk text has been parsed into lines yet.
    pub fn is_parsed(&self) -> bool {
        self.raw.is_none() || self.lines.get().is_some()
    }

    fn parsed(&self) -> &Lines {
        self.lines
            .get_or_init(|| parse_chunk(&self.name, self.raw.as_deref().unwrap_or("")))
    }

    /// Run `f` against owned, parsed lines. Drops the raw text and every
    /// derived cache.
    fn edit_lines<R>(&mut self, f: impl FnOnce(&mut Lines) -> R) -> R {
        let mut lines = match self.lines.take() {
            Some(lines) => lines,
            None => parse_chunk(&self.name, self.raw.as_deref().unwrap_or("")),
        };
        self.raw = None;
        self.invalidate();
        let result = f(&mut lines);
        while matches!(lines.last(), Some(None)) {
            lines.pop();
        }
        self.lines = OnceCell::from(lines);
        result
    }

    fn invalidate(&mut self) {
        self.totals = OnceCell::new();
        self.present_sessions = OnceCell::new();
    }

    /// Line `ln`, 1-indexed. Line 0 is a caller error.
    pub fn get(&self, ln: u32) -> Result<Option<&ReportLine>> {
        if ln == 0 {
            return Err(CovstoreError::InvalidLineNumber(ln));
        }
        Ok(self.line(ln))
    }

    pub(crate) fn line(&self, ln: u32) -> Option<&ReportLine> {
        let index = (ln as usize).checked_sub(1)?;
        self.parsed().get(index).and_then(Option::as_ref)
    }

    /// Merge `line` into whatever is stored at `ln`. Returns `false` when
    /// the ignore rule swallowed the write.
    pub fn append(&mut self, ln: u32, line: ReportLine) -> Result<bool> {
        self.append_with(ln, line, true)
    }

    pub(crate) fn append_with(&mut self, ln: u32, line: ReportLine, joined: bool) -> Result<bool> {
        if ln == 0 {
            return Err(CovstoreError::InvalidLineNumber(ln));
        }
        if self.ignores(ln) {
            return Ok(false);
        }
        self.edit_lines(|lines| {
            let slot = slot_mut(lines, ln);
            *slot = Some(match slot.take() {
                Some(existing) => merge::merge_line(existing, line, joined),
                None => line,
            });
        });
        Ok(true)
    }

    /// Overwrite line `ln` unconditionally.
    pub fn set(&mut self, ln: u32, line: ReportLine) -> Result<()> {
        if ln == 0 {
            return Err(CovstoreError::InvalidLineNumber(ln));
        }
        if self.ignores(ln) {
            return Ok(());
        }
        self.edit_lines(|lines| *slot_mut(lines, ln) = Some(line));
        Ok(())
    }

    pub fn remove(&mut self, ln: u32) -> Result<Option<ReportLine>> {
        if ln == 0 {
            return Err(CovstoreError::InvalidLineNumber(ln));
        }
        if self.line(ln).is_none() {
            return Ok(None);
        }
        Ok(self.edit_lines(|lines| lines.get_mut(ln as usize - 1).and_then(Option::take)))
    }

    /// Merge every line of `other` into this file.
    pub fn merge(&mut self, other: &ReportFile, joined: bool) -> Result<bool> {
        if other.is_empty() {
            return Ok(false);
        }
        for (ln, line) in other.lines() {
            self.append_with(ln, line.clone(), joined)?;
        }
        Ok(true)
    }

    /// Lines with data, in order.
    pub fn lines(&self) -> impl Iterator<Item = (u32, &ReportLine)> {
        self.parsed()
            .iter()
            .enumerate()
            .filter_map(|(i, line)| line.as_ref().map(|line| (i as u32 + 1, line)))
    }

    /// Number of lines with data.
    pub fn len(&self) -> usize {
        self.parsed().iter().filter(|l| l.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.parsed().iter().all(Option::is_none)
    }

    /// One past the last stored line.
    pub fn eof(&self) -> u32 {
        self.parsed().len() as u32 + 1
    }

    pub fn totals(&self) -> &ReportTotals {
        self.totals
            .get_or_init(|| line_totals(self.parsed().iter().flatten()))
    }

    /// Session ids with at least one reading in this file.
    ///
    /// For an unparsed chunk the ids come from its details header when it
    /// has one, so callers can skip files without parsing them.
    pub fn present_sessions(&self) -> &BTreeSet<u32> {
        self.present_sessions.get_or_init(|| {
            if self.lines.get().is_none() {
                if let Some(ids) = self.raw.as_deref().and_then(|raw| header_sessions(&self.name, raw)) {
                    return ids;
                }
            }
            self.parsed()
                .iter()
                .flatten()
                .flat_map(|line| line.sessions.iter().map(|s| s.id))
                .collect()
        })
    }

    pub fn ignore(&self) -> Option<&IgnoreRule> {
        self.ignore.as_ref()
    }

    fn ignores(&self, ln: u32) -> bool {
        self.ignore.as_ref().is_some_and(|rule| rule.matches(ln))
    }

    /// Install an ignore rule and drop stored lines it covers.
    pub fn ignore_lines<I>(&mut self, lines: I, eof: Option<u32>)
    where
        I: IntoIterator<Item = u32>,
    {
        let rule = IgnoreRule {
            eof,
            lines: lines.into_iter().collect(),
        };
        self.edit_lines(|stored| {
            for (i, slot) in stored.iter_mut().enumerate() {
                if rule.matches(i as u32 + 1) {
                    *slot = None;
                }
            }
        });
        self.ignore = Some(rule);
    }

    /// Aggregate only the lines a diff adds to this file.
    pub fn calculate_diff(&self, segments: &[DiffSegment]) -> ReportTotals {
        diff::segment_totals(self, segments)
    }

    /// Serialize to chunk text. A file that was never touched is written
    /// back byte for byte.
    pub fn encode(&self) -> Result<String> {
        if let (Some(raw), None) = (&self.raw, self.lines.get()) {
            return Ok(raw.clone());
        }
        let details = ChunkDetails {
            present_sessions: Some(self.present_sessions().iter().copied().collect()),
        };
        let mut out = serde_json::to_string(&details)?;
        for line in self.parsed() {
            out.push('\n');
            if let Some(line) = line {
                out.push_str(&serde_json::to_string(line)?);
            }
        }
        Ok(out)
    }

    /// Remap line numbers through a diff: base to head when `forward`,
    /// head to base otherwise. A diff that does not fit this file is logged
    /// and leaves it unchanged.
    pub fn shift_lines_by_diff(&mut self, segments: &[DiffSegment], forward: bool) -> bool {
        let plan = match ShiftPlan::build(segments, forward) {
            Ok(plan) => plan,
            Err(e) => {
                warn!(file = %self.name, error = %e, "Could not shift lines by diff");
                return false;
            }
        };
        self.edit_lines(|lines| {
            let mut shifted: Lines = Vec::with_capacity(lines.len());
            for (i, line) in lines.drain(..).enumerate() {
                let Some(line) = line else { continue };
                if let Some(dst) = plan.map(i as u32 + 1) {
                    *slot_mut(&mut shifted, dst) = Some(line);
                }
            }
            *lines = shifted;
        });
        true
    }

    /// Strip `ids` from every line and its datapoints. Lines left without
    /// sessions are dropped; lines that never carried session data keep
    /// their coverage.
    pub(crate) fn delete_sessions(&mut self, ids: &BTreeSet<u32>) {
        if self.present_sessions().is_disjoint(ids) {
            return;
        }
        self.edit_lines(|lines| {
            for slot in lines.iter_mut() {
                let Some(line) = slot else { continue };
                if let Some(datapoints) = &mut line.datapoints {
                    datapoints.retain(|dp| !ids.contains(&dp.sessionid));
                }
                if line.sessions.is_empty() {
                    continue;
                }
                line.sessions.retain(|s| !ids.contains(&s.id));
                if line.sessions.is_empty() {
                    *slot = None;
                    continue;
                }
                line.coverage = coverage_from_sessions(&line.sessions);
                line.complexity = complexity_from_sessions(&line.sessions);
            }
        });
    }

    /// Remove datapoints of `session_ids` tagged with any of `label_ids`.
    ///
    /// A session disappears from a line only when all its datapoints did.
    /// Coverage is re-derived from the surviving datapoints plus sessions
    /// that never had datapoints.
    pub(crate) fn delete_labels(&mut self, session_ids: &BTreeSet<u32>, label_ids: &BTreeSet<u32>) {
        if self.present_sessions().is_disjoint(session_ids) {
            return;
        }
        self.edit_lines(|lines| {
            for slot in lines.iter_mut() {
                let Some(line) = slot else { continue };
                let Some(datapoints) = line.datapoints.take() else { continue };

                let before: BTreeSet<u32> = datapoints.iter().map(|dp| dp.sessionid).collect();
                let kept: Vec<_> = datapoints
                    .into_iter()
                    .filter(|dp| {
                        !session_ids.contains(&dp.sessionid)
                            || dp.label_ids.iter().all(|l| !label_ids.contains(l))
                    })
                    .collect();
                let after: BTreeSet<u32> = kept.iter().map(|dp| dp.sessionid).collect();

                line.sessions
                    .retain(|s| !before.contains(&s.id) || after.contains(&s.id));
                if kept.is_empty() && line.sessions.is_empty() {
                    *slot = None;
                    continue;
                }

                let unlabelled = line.sessions.iter().filter(|s| !before.contains(&s.id));
                let coverages: Vec<_> = kept
                    .iter()
                    .map(|dp| &dp.coverage)
                    .chain(unlabelled.map(|s| &s.coverage))
                    .collect();
                line.coverage = merge::merge_all(coverages, None);
                line.datapoints = Some(kept);
            }
        });
    }

    /// Rename session `old` to `new` on every line.
    pub(crate) fn change_sessionid(&mut self, old: u32, new: u32) {
        if !self.present_sessions().contains(&old) {
            return;
        }
        self.edit_lines(|lines| {
            for line in lines.iter_mut().flatten() {
                for session in line.sessions.iter_mut().filter(|s| s.id == old) {
                    session.id = new;
                }
                for dp in line.datapoints.iter_mut().flatten() {
                    if dp.sessionid == old {
                        dp.sessionid = new;
                    }
                }
            }
        });
    }
}

fn slot_mut(lines: &mut Lines, ln: u32) -> &mut Option<ReportLine> {
    let index = ln as usize - 1;
    if lines.len() <= index {
        lines.resize(index + 1, None);
    }
    &mut lines[index]
}

fn parse_chunk(name: &str, raw: &str) -> Lines {
    let mut rows = raw.lines();
    rows.next();
    let mut lines: Lines = rows
        .enumerate()
        .map(|(i, row)| parse_line(name, i + 1, row))
        .collect();
    while matches!(lines.last(), Some(None)) {
        lines.pop();
    }
    debug!(file = name, lines = lines.len(), "Parsed chunk");
    lines
}

fn parse_line(name: &str, ln: usize, row: &str) -> Option<ReportLine> {
    let row = row.trim();
    if row.is_empty() || row == "null" {
        return None;
    }
    match serde_json::from_str::<ReportLine>(row) {
        Ok(line) => Some(line),
        Err(e) => {
            warn!(file = name, line = ln, error = %e, "Skipping malformed coverage line");
            None
        }
    }
}

fn header_sessions(name: &str, raw: &str) -> Option<BTreeSet<u32>> {
    let header = raw.lines().next()?.trim();
    if header.is_empty() || header == "null" {
        return None;
    }
    match serde_json::from_str::<ChunkDetails>(header) {
        Ok(details) => details.present_sessions.map(|ids| ids.into_iter().collect()),
        Err(e) => {
            warn!(file = name, error = %e, "Ignoring malformed chunk details");
            None
        }
    }
}

/// Line remapping derived from a file's diff segments.
struct ShiftPlan {
    hunks: Vec<Hunk>,
}

struct Hunk {
    /// Source-side span `[start, end)`.
    start: u32,
    end: u32,
    moved: BTreeMap<u32, Option<u32>>,
    delta: i64,
}

impl ShiftPlan {
    fn build(segments: &[DiffSegment], forward: bool) -> Result<Self> {
        let (removed, added) = if forward { ('-', '+') } else { ('+', '-') };
        let mut hunks: Vec<Hunk> = Vec::with_capacity(segments.len());

        for segment in segments {
            let past_end = || {
                CovstoreError::Diff(format!(
                    "segment {:?} runs past the last line number",
                    segment.header
                ))
            };
            let next = |n: u32| n.checked_add(1).ok_or_else(past_end);

            let (old_start, old_len, new_start, new_len) = segment.header_values()?;
            let (src_start, src_len, dst_start, dst_len) = if forward {
                (old_start, old_len, new_start, new_len)
            } else {
                (new_start, new_len, old_start, old_len)
            };
            let src_start = if src_len == 0 { next(src_start)? } else { src_start };
            let dst_start = if dst_len == 0 { next(dst_start)? } else { dst_start };
            let src_end = src_start.checked_add(src_len).ok_or_else(past_end)?;
            let dst_end = dst_start.checked_add(dst_len).ok_or_else(past_end)?;

            if let Some(prev) = hunks.last() {
                if src_start < prev.end {
                    return Err(CovstoreError::Diff(format!(
                        "segment at line {src_start} overlaps previous segment"
                    )));
                }
            }

            let mut moved = BTreeMap::new();
            let (mut src, mut dst) = (src_start, dst_start);
            for line in &segment.lines {
                match line.chars().next() {
                    Some(c) if c == removed => {
                        moved.insert(src, None);
                        src = next(src)?;
                    }
                    Some(c) if c == added => dst = next(dst)?,
                    _ => {
                        moved.insert(src, Some(dst));
                        src = next(src)?;
                        dst = next(dst)?;
                    }
                }
            }
            if src != src_end || dst != dst_end {
                return Err(CovstoreError::Diff(format!(
                    "segment lines do not match header {:?}",
                    segment.header
                )));
            }

            hunks.push(Hunk {
                start: src_start,
                end: src,
                moved,
                delta: i64::from(dst_len) - i64::from(src_len),
            });
        }
        Ok(Self { hunks })
    }

    fn map(&self, ln: u32) -> Option<u32> {
        let mut offset = 0i64;
        for hunk in &self.hunks {
            if ln < hunk.start {
                break;
            }
            if ln < hunk.end {
                return hunk.moved.get(&ln).copied().flatten();
            }
            offset += hunk.delta;
        }
        u32::try_from(i64::from(ln) + offset).ok().filter(|ln| *ln > 0)
    }
}
