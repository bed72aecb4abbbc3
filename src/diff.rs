//! Structured diffs and coverage restricted to the lines they add.
//!
//! A diff is usually produced from `git diff` output with
//! [`parse_unified_diff`], but the structured form is also accepted as JSON
//! from upstream services. The [`DiffSource`] trait abstracts over where the
//! unified diff text comes from.
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::process::Command;

use anyhow::Context;
use serde::de::Deserializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CovstoreError, Result};
use crate::file::ReportFile;
use crate::model::ReportLine;
use crate::report::Report;
use crate::totals::{line_totals, sum_totals, ReportTotals};

// ---------------------------------------------------------------------------
// Diff model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffFileType {
    New,
    Modified,
    Deleted,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Diff {
    #[serde(default)]
    pub files: BTreeMap<String, DiffFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub totals: Option<ReportTotals>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffFile {
    #[serde(rename = "type")]
    pub kind: DiffFileType,
    #[serde(default)]
    pub segments: Vec<DiffSegment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub totals: Option<ReportTotals>,
}

impl DiffFile {
    pub fn new(kind: DiffFileType) -> Self {
        Self {
            kind,
            segments: Vec::new(),
            totals: None,
        }
    }

    /// Only new and modified files contribute to diff coverage.
    pub fn contributes(&self) -> bool {
        matches!(self.kind, DiffFileType::New | DiffFileType::Modified)
    }
}

/// One hunk: `header` is `[old_start, old_len, new_start, new_len]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffSegment {
    #[serde(deserialize_with = "lenient_header")]
    pub header: Vec<Option<u32>>,
    #[serde(default)]
    pub lines: Vec<String>,
}

fn lenient_header<'de, D>(deserializer: D) -> std::result::Result<Vec<Option<u32>>, D::Error>
where
    D: Deserializer<'de>,
{
    let values = Vec::<Value>::deserialize(deserializer)?;
    Ok(values
        .into_iter()
        .map(|v| match v {
            Value::Number(n) => n.as_u64().map(|n| n as u32),
            Value::String(s) if s.is_empty() => None,
            Value::String(s) => s.parse().ok(),
            _ => None,
        })
        .collect())
}

impl DiffSegment {
    /// Header as `(old_start, old_len, new_start, new_len)`. Absent lengths
    /// default to 1, as in unified diff notation.
    pub fn header_values(&self) -> Result<(u32, u32, u32, u32)> {
        match self.header.as_slice() {
            [Some(old_start), old_len, Some(new_start), new_len] => Ok((
                *old_start,
                old_len.unwrap_or(1),
                *new_start,
                new_len.unwrap_or(1),
            )),
            _ => Err(CovstoreError::Diff(format!(
                "bad segment header {:?}",
                self.header
            ))),
        }
    }

    /// Head-side line numbers of the `+` lines.
    pub fn added_lines(&self) -> Vec<u32> {
        let mut ln = match self.header.get(2).copied().flatten() {
            Some(start) if start > 0 => start,
            _ => 1,
        };
        let mut added = Vec::new();
        for line in &self.lines {
            if line.starts_with('-') {
                continue;
            }
            if line.starts_with('+') {
                added.push(ln);
            }
            ln = ln.saturating_add(1);
        }
        added
    }
}

// ---------------------------------------------------------------------------
// Diff calculation
// ---------------------------------------------------------------------------

/// Read access to a file's lines, filtered or not.
pub trait LineSource {
    fn line_at(&self, ln: u32) -> Option<Cow<'_, ReportLine>>;
}

/// Read access to files by path.
pub trait CoverageSource {
    type File<'a>: LineSource
    where
        Self: 'a;

    fn file(&self, path: &str) -> Option<Self::File<'_>>;
}

impl<T: LineSource + ?Sized> LineSource for &T {
    fn line_at(&self, ln: u32) -> Option<Cow<'_, ReportLine>> {
        (**self).line_at(ln)
    }
}

impl LineSource for ReportFile {
    fn line_at(&self, ln: u32) -> Option<Cow<'_, ReportLine>> {
        self.line(ln).map(Cow::Borrowed)
    }
}

impl CoverageSource for Report {
    type File<'a> = &'a ReportFile;

    fn file(&self, path: &str) -> Option<&ReportFile> {
        self.get(path)
    }
}

/// Totals of a diff: one entry per touched file with data, plus the sum.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffTotals {
    pub files: BTreeMap<String, ReportTotals>,
    pub totals: ReportTotals,
}

/// Aggregate the lines `segments` add to `file`. Lines without data are
/// skipped.
pub fn segment_totals<L: LineSource + ?Sized>(file: &L, segments: &[DiffSegment]) -> ReportTotals {
    let lines: Vec<Cow<'_, ReportLine>> = segments
        .iter()
        .flat_map(DiffSegment::added_lines)
        .filter_map(|ln| file.line_at(ln))
        .collect();
    line_totals(lines)
}

/// Coverage of the lines a diff adds, per file and overall.
///
/// When no added line carries data, the overall coverage and complexity
/// are null rather than zero.
pub fn calculate_diff<S: CoverageSource + ?Sized>(source: &S, diff: &Diff) -> DiffTotals {
    let mut files = BTreeMap::new();
    for (path, diff_file) in &diff.files {
        if !diff_file.contributes() {
            continue;
        }
        if let Some(file) = source.file(path) {
            files.insert(path.clone(), segment_totals(&file, &diff_file.segments));
        }
    }
    let totals = sum_totals(files.values()).null_if_empty();
    DiffTotals { files, totals }
}

// ---------------------------------------------------------------------------
// Diff sources
// ---------------------------------------------------------------------------

/// A source for obtaining a unified diff.
pub trait DiffSource {
    /// Fetch the diff text.
    fn fetch_diff(&self) -> anyhow::Result<String>;
}

/// Diff from stdin.
pub struct StdinDiff;

impl DiffSource for StdinDiff {
    fn fetch_diff(&self) -> anyhow::Result<String> {
        std::io::read_to_string(std::io::stdin()).context("Failed to read diff from stdin")
    }
}

/// Diff from a git command (e.g., `git diff HEAD~1`).
pub struct GitDiff {
    /// Arguments to pass to `git diff`.
    pub args: String,
}

impl DiffSource for GitDiff {
    fn fetch_diff(&self) -> anyhow::Result<String> {
        let diff_args: Vec<&str> = self.args.split_whitespace().collect();
        let output = Command::new("git")
            .arg("diff")
            .args(&diff_args)
            .output()
            .context("Failed to run git diff")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("git diff failed: {stderr}");
        }

        String::from_utf8(output.stdout).context("git diff output not valid UTF-8")
    }
}

// ---------------------------------------------------------------------------
// Diff parsing
// ---------------------------------------------------------------------------

/// Prepend a path prefix to every file path in a diff.
pub fn apply_path_prefix(diff: Diff, prefix: &str) -> Diff {
    let prefix = prefix.trim_end_matches('/');
    Diff {
        files: diff
            .files
            .into_iter()
            .map(|(path, file)| (format!("{prefix}/{path}"), file))
            .collect(),
        totals: diff.totals,
    }
}

/// Strip common VCS prefixes: "b/" (default git), "a/" (some tools), and
/// any trailing timestamp. `--no-prefix` paths pass through.
fn diff_path(rest: &str) -> &str {
    let rest = rest.split('\t').next().unwrap_or(rest).trim_end();
    rest.strip_prefix("b/")
        .or_else(|| rest.strip_prefix("a/"))
        .unwrap_or(rest)
}

/// Parse a unified diff (e.g. `git diff` output) into the structured form.
///
/// Files whose old side is `/dev/null` are `new`, files whose new side is
/// `/dev/null` are `deleted`, everything else is `modified`.
pub fn parse_unified_diff(diff_text: &str) -> Diff {
    let mut diff = Diff::default();
    let mut old_path: Option<String> = None;
    let mut current: Option<(String, DiffFile)> = None;
    // Lines still expected in the current hunk, old side and new side.
    let mut remaining = (0u32, 0u32);

    for line in diff_text.lines() {
        if remaining.0 > 0 || remaining.1 > 0 {
            if line.starts_with('\\') {
                continue;
            }
            match line.chars().next() {
                Some('+') => remaining.1 = remaining.1.saturating_sub(1),
                Some('-') => remaining.0 = remaining.0.saturating_sub(1),
                _ => {
                    remaining.0 = remaining.0.saturating_sub(1);
                    remaining.1 = remaining.1.saturating_sub(1);
                }
            }
            if let Some(segment) = current.as_mut().and_then(|(_, f)| f.segments.last_mut()) {
                segment.lines.push(line.to_string());
            }
            continue;
        }

        if line.starts_with("diff --git ") {
            flush_file(&mut diff, current.take());
            old_path = None;
        } else if let Some(rest) = line.strip_prefix("--- ") {
            old_path = Some(diff_path(rest).to_string());
        } else if let Some(rest) = line.strip_prefix("+++ ") {
            flush_file(&mut diff, current.take());
            let new_path = diff_path(rest);
            let old = old_path.take();
            let (kind, path) = match old.as_deref() {
                Some("/dev/null") => (DiffFileType::New, new_path.to_string()),
                Some(old) if new_path == "/dev/null" => (DiffFileType::Deleted, old.to_string()),
                _ => (DiffFileType::Modified, new_path.to_string()),
            };
            current = Some((path, DiffFile::new(kind)));
        } else if line.starts_with("@@ ") {
            if let (Some((_, file)), Some(h)) = (current.as_mut(), parse_hunk_header(line)) {
                remaining = (h.1, h.3);
                file.segments.push(DiffSegment {
                    header: vec![Some(h.0), Some(h.1), Some(h.2), Some(h.3)],
                    lines: Vec::new(),
                });
            }
        }
    }
    flush_file(&mut diff, current);
    diff
}

fn flush_file(diff: &mut Diff, current: Option<(String, DiffFile)>) {
    if let Some((path, file)) = current {
        match diff.files.get_mut(&path) {
            Some(existing) => existing.segments.extend(file.segments),
            None => {
                diff.files.insert(path, file);
            }
        }
    }
}

/// Parse "@@ -10,5 +20,8 @@" into `(10, 5, 20, 8)`. Omitted lengths are 1.
fn parse_hunk_header(line: &str) -> Option<(u32, u32, u32, u32)> {
    let after_at = line.strip_prefix("@@ ")?;
    let mut parts = after_at.split(' ');
    let old = parts.next()?.strip_prefix('-')?;
    let new = parts.next()?.strip_prefix('+')?;

    let range = |part: &str| -> Option<(u32, u32)> {
        let mut nums = part.split(',');
        let start = nums.next()?.parse().ok()?;
        let len = match nums.next() {
            Some(len) => len.parse().ok()?,
            None => 1,
        };
        Some((start, len))
    };
    let (old_start, old_len) = range(old)?;
    let (new_start, new_len) = range(new)?;
    Some((old_start, old_len, new_start, new_len))
}
