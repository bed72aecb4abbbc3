//! A report that supports removing sessions and labels after the fact.

use std::collections::BTreeSet;
use std::ops::{Deref, DerefMut};

use tracing::debug;

use crate::error::{CovstoreError, Result};
use crate::report::Report;

#[derive(Debug, Clone, Default)]
pub struct EditableReport {
    report: Report,
}

impl EditableReport {
    pub fn new(report: Report) -> Self {
        Self { report }
    }

    pub fn into_inner(self) -> Report {
        self.report
    }

    pub fn delete_session(&mut self, id: u32) {
        self.delete_multiple_sessions([id]);
    }

    /// Strip `ids` from every line and drop the sessions. Files left with
    /// no lines are removed from the report.
    pub fn delete_multiple_sessions<I>(&mut self, ids: I)
    where
        I: IntoIterator<Item = u32>,
    {
        let ids: BTreeSet<u32> = ids.into_iter().collect();
        if ids.is_empty() {
            return;
        }
        let names: Vec<String> = self.report.files().map(str::to_string).collect();
        let mut emptied = Vec::new();
        for name in names {
            let Some(file) = self.report.get_mut(&name) else { continue };
            if file.present_sessions().is_disjoint(&ids) {
                continue;
            }
            file.delete_sessions(&ids);
            if file.is_empty() {
                emptied.push(name);
            } else {
                self.report.refresh_summary(&name);
            }
        }
        for name in &emptied {
            debug!(file = %name, "Removing file left empty by session deletion");
            self.report.remove(name);
        }
        for summary in self.report.files.values_mut() {
            for id in &ids {
                summary.session_totals.remove(*id);
            }
        }
        for id in &ids {
            self.report.sessions.remove(id);
        }
        self.report.invalidate();
    }

    /// Remove the datapoints of `session_ids` tagged with any of
    /// `label_ids`. Sessions stay in the session map.
    pub fn delete_labels<S, L>(&mut self, session_ids: S, label_ids: L)
    where
        S: IntoIterator<Item = u32>,
        L: IntoIterator<Item = u32>,
    {
        let session_ids: BTreeSet<u32> = session_ids.into_iter().collect();
        let label_ids: BTreeSet<u32> = label_ids.into_iter().collect();
        if session_ids.is_empty() || label_ids.is_empty() {
            return;
        }
        let names: Vec<String> = self.report.files().map(str::to_string).collect();
        for name in names {
            let Some(file) = self.report.get_mut(&name) else { continue };
            if file.present_sessions().is_disjoint(&session_ids) {
                continue;
            }
            file.delete_labels(&session_ids, &label_ids);
            if file.is_empty() {
                self.report.remove(&name);
            } else {
                self.report.refresh_summary(&name);
            }
        }
        self.report.invalidate();
    }

    /// Renumber session `old` as `new` in the session map, on every line and
    /// in every file's session totals.
    pub fn change_sessionid(&mut self, old: u32, new: u32) -> Result<()> {
        if !self.report.sessions.contains_key(&old) {
            return Err(CovstoreError::SessionNotFound(old));
        }
        if old == new {
            return Ok(());
        }
        if self.report.sessions.contains_key(&new) {
            return Err(CovstoreError::SessionExists(new));
        }
        if let Some(mut session) = self.report.sessions.remove(&old) {
            session.id = new;
            self.report.sessions.insert(new, session);
        }

        let names: Vec<String> = self.report.files().map(str::to_string).collect();
        for name in names {
            if let Some(file) = self.report.get_mut(&name) {
                file.change_sessionid(old, new);
            }
            if let Some(summary) = self.report.files.get_mut(&name) {
                summary.session_totals.change_id(old, new);
            }
        }
        self.report.invalidate();
        Ok(())
    }
}

impl From<Report> for EditableReport {
    fn from(report: Report) -> Self {
        Self::new(report)
    }
}

impl From<EditableReport> for Report {
    fn from(editable: EditableReport) -> Self {
        editable.into_inner()
    }
}

impl Deref for EditableReport {
    type Target = Report;

    fn deref(&self) -> &Report {
        &self.report
    }
}

impl DerefMut for EditableReport {
    fn deref_mut(&mut self) -> &mut Report {
        &mut self.report
    }
}
