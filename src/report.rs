//! The report container: a manifest of files, the chunk arena backing it,
//! and the sessions that contributed.

use std::cell::OnceCell;
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::diff::{self, Diff, DiffFileType, DiffTotals};
use crate::error::{CovstoreError, Result};
use crate::file::ReportFile;
use crate::model::ReportLine;
use crate::session::{Session, SessionTotalsArray};
use crate::totals::{line_totals, sum_totals, ReportTotals};

/// Manifest entry for one file: where its chunk lives and its cached totals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct FileSummary {
    pub file_index: usize,
    pub file_totals: ReportTotals,
    pub session_totals: SessionTotalsArray,
    pub diff_totals: Option<ReportTotals>,
}

impl FileSummary {
    fn for_file(file_index: usize, file: &ReportFile) -> Self {
        Self {
            file_index,
            file_totals: file.totals().clone(),
            session_totals: session_totals_of(file),
            diff_totals: None,
        }
    }
}

impl TryFrom<Value> for FileSummary {
    type Error = CovstoreError;

    fn try_from(value: Value) -> std::result::Result<Self, Self::Error> {
        let Value::Array(mut items) = value else {
            return Err(CovstoreError::Parse(
                "file summary must be an array".to_string(),
            ));
        };
        items.resize(4, Value::Null);
        let file_index = items[0]
            .as_u64()
            .ok_or_else(|| CovstoreError::Parse(format!("bad chunk index {}", items[0])))?
            as usize;
        let file_totals = match items[1].take() {
            Value::Null => ReportTotals::default(),
            v => ReportTotals::try_from(v)?,
        };
        let session_totals = SessionTotalsArray::try_from(items[2].take())?;
        let diff_totals = match items[3].take() {
            v @ (Value::Array(_) | Value::Object(_)) => Some(ReportTotals::try_from(v)?),
            _ => None,
        };
        Ok(Self {
            file_index,
            file_totals,
            session_totals,
            diff_totals,
        })
    }
}

impl From<FileSummary> for Value {
    fn from(s: FileSummary) -> Self {
        json!([
            s.file_index,
            Value::from(s.file_totals),
            Value::from(s.session_totals),
            s.diff_totals.map(Value::from),
        ])
    }
}

/// Per-session totals for a file, treating each session's reading as the
/// line's coverage.
fn session_totals_of(file: &ReportFile) -> SessionTotalsArray {
    let mut by_session: BTreeMap<u32, Vec<ReportLine>> = BTreeMap::new();
    for (_, line) in file.lines() {
        for session in &line.sessions {
            by_session.entry(session.id).or_default().push(ReportLine {
                coverage: session.coverage.clone(),
                line_type: line.line_type,
                complexity: session.complexity,
                ..Default::default()
            });
        }
    }
    let mut array = SessionTotalsArray::new();
    for (id, lines) in by_session {
        array.insert(id, line_totals(&lines));
    }
    array
}

#[derive(Debug, Clone, Default)]
pub struct Report {
    pub(crate) files: BTreeMap<String, FileSummary>,
    pub(crate) chunks: Vec<Option<ReportFile>>,
    pub(crate) sessions: BTreeMap<u32, Session>,
    pub(crate) labels_index: Option<BTreeMap<u32, String>>,
    totals: OnceCell<ReportTotals>,
}

impl Report {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_parts(
        files: BTreeMap<String, FileSummary>,
        chunks: Vec<Option<ReportFile>>,
        sessions: BTreeMap<u32, Session>,
        labels_index: Option<BTreeMap<u32, String>>,
    ) -> Self {
        Self {
            files,
            chunks,
            sessions,
            labels_index,
            totals: OnceCell::new(),
        }
    }

    pub(crate) fn invalidate(&mut self) {
        self.totals = OnceCell::new();
    }

    // -- Files ---------------------------------------------------------------

    pub fn get(&self, name: &str) -> Option<&ReportFile> {
        let summary = self.files.get(name)?;
        self.chunks.get(summary.file_index)?.as_ref()
    }

    pub(crate) fn get_mut(&mut self, name: &str) -> Option<&mut ReportFile> {
        let index = self.files.get(name)?.file_index;
        self.invalidate();
        self.chunks.get_mut(index)?.as_mut()
    }

    /// Like [`Report::get`] but a missing file is an error.
    pub fn file(&self, name: &str) -> Result<&ReportFile> {
        self.get(name)
            .ok_or_else(|| CovstoreError::FileNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// File names in manifest order.
    pub fn files(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReportFile> {
        self.files
            .values()
            .filter_map(|s| self.chunks.get(s.file_index).and_then(Option::as_ref))
    }

    pub fn summary(&self, name: &str) -> Option<&FileSummary> {
        self.files.get(name)
    }

    /// Number of files.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Insert `file`, or merge it into the file of the same name. Empty
    /// files are rejected.
    pub fn append(&mut self, file: ReportFile, joined: bool) -> Result<bool> {
        if file.is_empty() {
            return Ok(false);
        }
        let name = file.name().to_string();
        match self.files.get(&name).map(|s| s.file_index) {
            Some(index) => {
                if let Some(existing) = self.chunks.get_mut(index).and_then(Option::as_mut) {
                    existing.merge(&file, joined)?;
                } else {
                    if index >= self.chunks.len() {
                        warn!(
                            file = %name,
                            index,
                            chunks = self.chunks.len(),
                            "Manifest points past the end of the archive, growing chunks"
                        );
                        self.chunks.resize_with(index + 1, || None);
                    }
                    self.chunks[index] = Some(file);
                }
                self.refresh_summary(&name);
            }
            None => {
                let index = self.chunks.len();
                self.files.insert(name, FileSummary::for_file(index, &file));
                self.chunks.push(Some(file));
            }
        }
        self.invalidate();
        Ok(true)
    }

    /// Recompute a file's cached totals after its lines changed.
    pub(crate) fn refresh_summary(&mut self, name: &str) {
        let Some(summary) = self.files.get(name) else { return };
        let Some(Some(file)) = self.chunks.get(summary.file_index) else { return };
        let file_totals = file.totals().clone();
        let session_totals = session_totals_of(file);
        if let Some(summary) = self.files.get_mut(name) {
            summary.file_totals = file_totals;
            summary.session_totals = session_totals;
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<ReportFile> {
        let summary = self.files.remove(name)?;
        self.invalidate();
        self.chunks.get_mut(summary.file_index)?.take()
    }

    /// Rename a file. An existing file under `new` is dropped first.
    pub fn rename(&mut self, old: &str, new: &str) -> bool {
        if old == new {
            return self.files.contains_key(old);
        }
        if !self.files.contains_key(old) {
            return false;
        }
        self.remove(new);
        let Some(summary) = self.files.remove(old) else { return false };
        if let Some(Some(file)) = self.chunks.get_mut(summary.file_index) {
            file.set_name(new);
        }
        self.files.insert(new.to_string(), summary);
        self.invalidate();
        true
    }

    /// Apply `(before, after)` path fixes. `None` removes the file. When
    /// two files resolve to the same path the later one wins.
    pub fn resolve_paths<I, S>(&mut self, paths: I)
    where
        I: IntoIterator<Item = (S, Option<S>)>,
        S: AsRef<str>,
    {
        for (before, after) in paths {
            let before = before.as_ref();
            if !self.files.contains_key(before) {
                continue;
            }
            match after {
                None => {
                    self.remove(before);
                }
                Some(after) if after.as_ref() != before => {
                    self.rename(before, after.as_ref());
                }
                Some(_) => {}
            }
        }
        debug!(files = self.files.len(), "Resolved report paths");
    }

    /// Append every file of `other`. Sessions are not copied.
    pub fn merge(&mut self, other: &Report, joined: bool) -> Result<()> {
        for file in other.iter() {
            self.append(file.clone(), joined)?;
        }
        Ok(())
    }

    // -- Sessions ------------------------------------------------------------

    pub fn sessions(&self) -> &BTreeMap<u32, Session> {
        &self.sessions
    }

    pub fn session(&self, id: u32) -> Option<&Session> {
        self.sessions.get(&id)
    }

    /// First free id at or after the current session count.
    pub fn next_session_number(&self) -> u32 {
        let mut id = self.sessions.len() as u32;
        while self.sessions.contains_key(&id) {
            id += 1;
        }
        id
    }

    pub fn add_session(&mut self, mut session: Session) -> (u32, &Session) {
        let id = self.next_session_number();
        session.id = id;
        self.invalidate();
        (id, self.sessions.entry(id).or_insert(session))
    }

    /// Add a session under its own id.
    pub fn add_session_with_id(&mut self, session: Session) -> Result<&Session> {
        let id = session.id;
        if self.sessions.contains_key(&id) {
            return Err(CovstoreError::SessionExists(id));
        }
        self.invalidate();
        Ok(self.sessions.entry(id).or_insert(session))
    }

    /// Every flag used by any session.
    pub fn flags(&self) -> BTreeSet<&str> {
        self.sessions
            .values()
            .flat_map(|s| s.flags.iter().map(String::as_str))
            .collect()
    }

    // -- Labels --------------------------------------------------------------

    pub fn labels_index(&self) -> Option<&BTreeMap<u32, String>> {
        self.labels_index.as_ref()
    }

    pub fn set_labels_index(&mut self, index: BTreeMap<u32, String>) {
        self.labels_index = Some(index);
    }

    pub fn lookup_label_by_id(&self, id: u32) -> Option<&str> {
        self.labels_index.as_ref()?.get(&id).map(String::as_str)
    }

    // -- Totals --------------------------------------------------------------

    /// File totals without forcing a parse: live for parsed chunks, the
    /// manifest copy otherwise.
    pub fn file_totals(&self, name: &str) -> Option<ReportTotals> {
        let summary = self.files.get(name)?;
        match self.chunks.get(summary.file_index).and_then(Option::as_ref) {
            Some(file) if file.is_parsed() => Some(file.totals().clone()),
            _ => Some(summary.file_totals.clone()),
        }
    }

    /// Report-wide totals, computed once and cached until the next mutation.
    pub fn totals(&self) -> &ReportTotals {
        self.totals.get_or_init(|| {
            let per_file = self.files.keys().filter_map(|name| self.file_totals(name));
            let mut totals = sum_totals(per_file);
            totals.sessions = self.sessions.len() as u32;
            totals
        })
    }

    // -- Diffs ---------------------------------------------------------------

    pub fn calculate_diff(&self, diff: &Diff) -> DiffTotals {
        diff::calculate_diff(self, diff)
    }

    /// Compute diff totals and record them on the diff and in the manifest.
    pub fn apply_diff(&mut self, diff: &mut Diff) -> Option<ReportTotals> {
        if diff.files.is_empty() {
            return None;
        }
        let result = self.calculate_diff(diff);
        Some(self.record_diff(diff, &result))
    }

    /// Store `result` on the diff and in the manifest, returning its sum.
    pub fn record_diff(&mut self, diff: &mut Diff, result: &DiffTotals) -> ReportTotals {
        for (path, totals) in &result.files {
            if let Some(file) = diff.files.get_mut(path) {
                file.totals = Some(totals.clone());
            }
            if let Some(summary) = self.files.get_mut(path) {
                summary.diff_totals = Some(totals.clone());
            }
        }
        diff.totals = Some(result.totals.clone());
        result.totals.clone()
    }

    /// Move every modified file's line numbers across a diff.
    pub fn shift_lines_by_diff(&mut self, diff: &Diff, forward: bool) {
        for (path, diff_file) in &diff.files {
            if diff_file.kind != DiffFileType::Modified || diff_file.segments.is_empty() {
                continue;
            }
            let shifted = match self.get_mut(path) {
                Some(file) => file.shift_lines_by_diff(&diff_file.segments, forward),
                None => false,
            };
            if shifted {
                self.refresh_summary(path);
            }
        }
    }

    // -- Chunk arena ---------------------------------------------------------

    /// Whether the manifest indices name exactly the non-empty chunk slots.
    pub fn is_consistent(&self) -> bool {
        let indices: BTreeSet<usize> = self.files.values().map(|s| s.file_index).collect();
        let occupied: BTreeSet<usize> = self
            .chunks
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.as_ref().map(|_| i))
            .collect();
        indices.len() == self.files.len() && indices == occupied
    }

    /// Drop empty chunk slots and renumber the manifest. Refuses, with a
    /// warning, when the manifest and chunks disagree.
    pub fn repack(&mut self) -> bool {
        if !self.is_consistent() {
            warn!(
                files = self.files.len(),
                chunks = self.chunks.len(),
                "Report manifest does not match chunks, not repacking"
            );
            return false;
        }
        let mut order: Vec<(&String, usize)> =
            self.files.iter().map(|(name, s)| (name, s.file_index)).collect();
        order.sort_by_key(|(_, index)| *index);
        let renumbered: Vec<(String, usize)> = order
            .into_iter()
            .enumerate()
            .map(|(new, (name, old))| {
                debug!(file = %name, from = old, to = new, "Repacking chunk");
                (name.clone(), old)
            })
            .collect();

        let mut chunks = Vec::with_capacity(renumbered.len());
        for (new_index, (name, old_index)) in renumbered.into_iter().enumerate() {
            chunks.push(self.chunks[old_index].take());
            if let Some(summary) = self.files.get_mut(&name) {
                summary.file_index = new_index;
            }
        }
        self.chunks = chunks;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coverage::CoverageValue;
    use crate::diff::parse_unified_diff;
    use crate::model::LineSession;

    fn file_with(name: &str, lines: &[(u32, CoverageValue)], session: u32) -> ReportFile {
        let mut file = ReportFile::new(name);
        for (ln, coverage) in lines {
            file.append(*ln, ReportLine::from_session(LineSession::new(session, coverage.clone())))
                .unwrap();
        }
        file
    }

    fn sample() -> Report {
        let mut report = Report::new();
        report.add_session(Session::new(["unit"]));
        report
            .append(
                file_with("a.rs", &[(1, CoverageValue::Hit(1.0)), (2, CoverageValue::Miss)], 0),
                true,
            )
            .unwrap();
        report
            .append(file_with("b.rs", &[(1, CoverageValue::Hit(1.0))], 0), true)
            .unwrap();
        report
    }

    #[test]
    fn test_append_and_totals() {
        let report = sample();
        let totals = report.totals();
        assert_eq!(totals.files, 2);
        assert_eq!(totals.lines, 3);
        assert_eq!(totals.hits, 2);
        assert_eq!(totals.sessions, 1);
        assert_eq!(totals.coverage.as_deref(), Some("66.66667"));
    }

    #[test]
    fn test_append_rejects_empty_file() {
        let mut report = Report::new();
        assert!(!report.append(ReportFile::new("empty.rs"), true).unwrap());
        assert!(report.is_empty());
    }

    #[test]
    fn test_append_merges_into_existing() {
        let mut report = sample();
        let _ = report.totals();
        report
            .append(file_with("a.rs", &[(2, CoverageValue::Hit(3.0))], 1), true)
            .unwrap();
        assert_eq!(report.totals().hits, 3);
        let summary = report.summary("a.rs").unwrap();
        assert_eq!(summary.file_totals.hits, 2);
        assert_eq!(summary.session_totals.get(1).unwrap().hits, 1);
        assert_eq!(summary.session_totals.get(0).unwrap().misses, 1);
    }

    #[test]
    fn test_append_grows_chunks_for_stale_manifest_index() {
        let mut report =
            Report::from_json("", r#"{"files":{"a.rs":[3,null,null,null]},"sessions":{}}"#)
                .unwrap();
        let appended = report
            .append(file_with("a.rs", &[(1, CoverageValue::Hit(1.0))], 0), true)
            .unwrap();
        assert!(appended);
        let line = report.get("a.rs").unwrap().get(1).unwrap().unwrap();
        assert_eq!(line.coverage, CoverageValue::Hit(1.0));
        assert_eq!(report.totals().lines, 1);
    }

    #[test]
    fn test_file_lookup() {
        let report = sample();
        assert!(report.get("missing.rs").is_none());
        assert!(matches!(
            report.file("missing.rs"),
            Err(CovstoreError::FileNotFound(_))
        ));
        assert_eq!(report.files().collect::<Vec<_>>(), vec!["a.rs", "b.rs"]);
    }

    #[test]
    fn test_rename_and_remove() {
        let mut report = sample();
        assert!(report.rename("a.rs", "c.rs"));
        assert!(!report.contains("a.rs"));
        assert_eq!(report.get("c.rs").unwrap().name(), "c.rs");
        assert!(report.remove("b.rs").is_some());
        assert_eq!(report.len(), 1);
        assert_eq!(report.totals().lines, 2);
    }

    #[test]
    fn test_resolve_paths_later_wins() {
        let mut report = sample();
        report.resolve_paths(vec![
            ("a.rs", Some("src/x.rs")),
            ("b.rs", Some("src/x.rs")),
        ]);
        assert_eq!(report.files().collect::<Vec<_>>(), vec!["src/x.rs"]);
        assert_eq!(report.get("src/x.rs").unwrap().len(), 1);

        let mut report = sample();
        report.resolve_paths(vec![("a.rs", None), ("b.rs", Some("b.rs"))]);
        assert_eq!(report.files().collect::<Vec<_>>(), vec!["b.rs"]);
    }

    #[test]
    fn test_next_session_number_skips_taken() {
        let mut report = Report::new();
        let mut session = Session::new(["a"]);
        session.id = 1;
        report.add_session_with_id(session.clone()).unwrap();
        assert!(matches!(
            report.add_session_with_id(session),
            Err(CovstoreError::SessionExists(1))
        ));
        assert_eq!(report.next_session_number(), 2);
        let (id, _) = report.add_session(Session::new(["b"]));
        assert_eq!(id, 2);
        assert_eq!(report.flags(), BTreeSet::from(["a", "b"]));
    }

    #[test]
    fn test_repack() {
        let mut report = sample();
        report.remove("a.rs");
        assert_eq!(report.chunks.len(), 2);
        assert!(report.repack());
        assert_eq!(report.chunks.len(), 1);
        assert_eq!(report.summary("b.rs").unwrap().file_index, 0);
        assert!(report.get("b.rs").is_some());
    }

    #[test]
    fn test_repack_refuses_inconsistent_manifest() {
        let mut report = sample();
        report.files.get_mut("b.rs").unwrap().file_index = 7;
        assert!(!report.repack());
        assert_eq!(report.chunks.len(), 2);
    }

    #[test]
    fn test_apply_diff_records_totals() {
        let mut report = sample();
        let mut diff = parse_unified_diff(
            "--- a/a.rs\n+++ b/a.rs\n@@ -1,1 +1,2 @@\n x\n+y\n",
        );
        let totals = report.apply_diff(&mut diff).unwrap();
        assert_eq!(totals.lines, 1);
        assert_eq!(totals.misses, 1);
        assert_eq!(diff.files["a.rs"].totals.as_ref().unwrap().misses, 1);
        assert_eq!(report.summary("a.rs").unwrap().diff_totals.as_ref().unwrap().lines, 1);
    }

    #[test]
    fn test_diff_without_tracked_lines_nulls_coverage() {
        let report = sample();
        let diff = parse_unified_diff("--- a/a.rs\n+++ b/a.rs\n@@ -5,0 +6,1 @@\n+z\n");
        let result = report.calculate_diff(&diff);
        assert_eq!(result.totals.lines, 0);
        assert_eq!(result.totals.coverage, None);
        assert_eq!(result.totals.complexity, None);
        assert_eq!(result.files.len(), 1);
    }

    #[test]
    fn test_shift_lines_by_diff() {
        let mut report = sample();
        let diff = parse_unified_diff("--- a/a.rs\n+++ b/a.rs\n@@ -0,0 +1,2 @@\n+x\n+y\n");
        report.shift_lines_by_diff(&diff, true);
        let lines: Vec<u32> = report.get("a.rs").unwrap().lines().map(|(ln, _)| ln).collect();
        assert_eq!(lines, vec![3, 4]);
    }

    #[test]
    fn test_file_summary_encoding() {
        let report = sample();
        let summary = report.summary("a.rs").unwrap().clone();
        let encoded = serde_json::to_value(&summary).unwrap();
        assert_eq!(encoded[0], 0);
        assert_eq!(encoded[1][1], 2);
        assert!(encoded[3].is_null());
        let decoded: FileSummary = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, summary);

        let legacy: FileSummary = serde_json::from_str("[3, [0,1,1,0,0,\"100\",0,0,0,0,0,0,0]]").unwrap();
        assert_eq!(legacy.file_index, 3);
        assert!(legacy.session_totals.is_empty());
    }
}
