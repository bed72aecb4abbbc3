//! Shadow comparison against an external accelerated analyzer.
//!
//! A sampled fraction of loaded reports also hands their archive to an
//! [`Analyzer`]. Its answers are compared with the reference computation and
//! any disagreement is logged. Callers always get the reference result, and
//! analyzer failures never reach them.

use std::cell::{Cell, OnceCell};
use std::collections::BTreeMap;

use rand::Rng;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::diff::{Diff, DiffTotals};
use crate::error::Result;
use crate::file::ReportFile;
use crate::filter::FilterOptions;
use crate::report::Report;
use crate::totals::ReportTotals;

/// An external engine that can answer totals queries from archive bytes.
pub trait Analyzer {
    type Handle;

    /// Load an archive. `file_index` maps file names to chunk positions and
    /// `session_flags` maps session ids to their flags.
    fn parse(
        &self,
        file_index: &BTreeMap<String, usize>,
        archive: &[u8],
        session_flags: &BTreeMap<u32, Vec<String>>,
    ) -> anyhow::Result<Self::Handle>;

    fn totals(&self, handle: &Self::Handle) -> anyhow::Result<ReportTotals>;

    fn filtered_totals(
        &self,
        _handle: &Self::Handle,
        _paths: &[&str],
        _flags: &[&str],
    ) -> anyhow::Result<ReportTotals> {
        anyhow::bail!("analyzer does not support filtering")
    }

    /// Totals of the lines `diff` adds to `head`, given the `base` it was
    /// taken against.
    fn diff(
        &self,
        base: &Self::Handle,
        head: &Self::Handle,
        diff: &Diff,
    ) -> anyhow::Result<DiffTotals>;
}

type FilterKey = (Vec<String>, Vec<String>);

fn filter_key(paths: &[&str], flags: &[&str]) -> FilterKey {
    let owned = |items: &[&str]| -> Vec<String> { items.iter().map(|s| s.to_string()).collect() };
    (owned(paths), owned(flags))
}

pub struct ShadowReport<A: Analyzer> {
    report: Report,
    analyzer: Option<A>,
    options: FilterOptions,
    precomputed: Option<ReportTotals>,
    precomputed_filtered: BTreeMap<FilterKey, ReportTotals>,
    precomputed_diff: Option<DiffTotals>,
    handle: OnceCell<Option<A::Handle>>,
    mismatches: Cell<u32>,
}

impl<A: Analyzer> ShadowReport<A> {
    /// Wrap `report`, activating `analyzer` with probability `sample_rate`.
    pub fn new(report: Report, analyzer: Option<A>, sample_rate: f64) -> Self {
        Self::sampled(report, analyzer, sample_rate, &mut rand::rng())
    }

    pub fn from_config(report: Report, analyzer: Option<A>, config: &EngineConfig) -> Self {
        let mut shadow = Self::new(report, analyzer, config.analyzer_sample_rate);
        shadow.options = config.filter_options();
        shadow
    }

    pub fn sampled<R: Rng>(
        report: Report,
        analyzer: Option<A>,
        sample_rate: f64,
        rng: &mut R,
    ) -> Self {
        let analyzer = analyzer.filter(|_| rng.random::<f64>() < sample_rate);
        if analyzer.is_some() {
            debug!(sample_rate, "Shadow analyzer active for report");
        }
        Self {
            report,
            analyzer,
            options: FilterOptions::default(),
            precomputed: None,
            precomputed_filtered: BTreeMap::new(),
            precomputed_diff: None,
            handle: OnceCell::new(),
            mismatches: Cell::new(0),
        }
    }

    /// Totals already known for this report, served without computing.
    #[must_use]
    pub fn with_precomputed_totals(mut self, totals: ReportTotals) -> Self {
        self.precomputed = Some(totals);
        self
    }

    /// Totals already known for one path/flag filter.
    #[must_use]
    pub fn with_precomputed_filtered_totals(
        mut self,
        paths: &[&str],
        flags: &[&str],
        totals: ReportTotals,
    ) -> Self {
        self.precomputed_filtered.insert(filter_key(paths, flags), totals);
        self
    }

    /// Diff totals already known for the patch this report will be diffed
    /// against.
    #[must_use]
    pub fn with_precomputed_diff_totals(mut self, totals: DiffTotals) -> Self {
        self.precomputed_diff = Some(totals);
        self
    }

    pub fn report(&self) -> &Report {
        &self.report
    }

    pub fn into_inner(self) -> Report {
        self.report
    }

    pub fn is_shadowed(&self) -> bool {
        self.analyzer.is_some()
    }

    /// Number of analyzer answers that disagreed with the reference.
    pub fn mismatches(&self) -> u32 {
        self.mismatches.get()
    }

    fn handle(&self) -> Option<(&A, &A::Handle)> {
        let analyzer = self.analyzer.as_ref()?;
        let handle = self
            .handle
            .get_or_init(|| {
                let archive = match self.report.to_archive(false) {
                    Ok(archive) => archive,
                    Err(e) => {
                        warn!(error = %e, "Could not serialize report for analyzer");
                        return None;
                    }
                };
                let file_index = self
                    .report
                    .files
                    .iter()
                    .map(|(name, summary)| (name.clone(), summary.file_index))
                    .collect();
                let session_flags = self
                    .report
                    .sessions()
                    .iter()
                    .map(|(id, s)| (*id, s.flags.clone()))
                    .collect();
                match analyzer.parse(&file_index, archive.as_bytes(), &session_flags) {
                    Ok(handle) => Some(handle),
                    Err(e) => {
                        warn!(error = %e, "Analyzer failed to parse report");
                        None
                    }
                }
            })
            .as_ref()?;
        Some((analyzer, handle))
    }

    pub fn totals(&self) -> ReportTotals {
        if let Some(totals) = &self.precomputed {
            return totals.clone();
        }
        let reference = self.report.totals().clone();
        if let Some((analyzer, handle)) = self.handle() {
            self.compare("totals", analyzer.totals(handle), &reference);
        }
        reference
    }

    pub fn filtered_totals(&self, paths: &[&str], flags: &[&str]) -> Result<ReportTotals> {
        if paths.is_empty() && flags.is_empty() {
            return Ok(self.totals());
        }
        if let Some(totals) = self.precomputed_filtered.get(&filter_key(paths, flags)) {
            return Ok(totals.clone());
        }
        let reference = self
            .report
            .filter_with_options(paths, flags, self.options.clone())?
            .totals()
            .clone();
        if let Some((analyzer, handle)) = self.handle() {
            self.compare("filter", analyzer.filtered_totals(handle, paths, flags), &reference);
        }
        Ok(reference)
    }

    /// Patch coverage of `diff` over this report, which is both base and
    /// head.
    pub fn calculate_diff(&self, diff: &Diff) -> DiffTotals {
        self.diff_against(None, diff, "calculate_diff")
    }

    /// Patch coverage of `diff` over this report, taken against `base`.
    pub fn calculate_diff_against(&self, base: &ShadowReport<A>, diff: &Diff) -> DiffTotals {
        self.diff_against(Some(base), diff, "calculate_diff")
    }

    fn diff_against(
        &self,
        base: Option<&ShadowReport<A>>,
        diff: &Diff,
        operation: &str,
    ) -> DiffTotals {
        if let Some(totals) = &self.precomputed_diff {
            return totals.clone();
        }
        let reference = self.report.calculate_diff(diff);
        if let Some((analyzer, head)) = self.handle() {
            let base = match base {
                Some(report) => report.handle().map(|(_, handle)| handle),
                None => Some(head),
            };
            match base {
                Some(base) => self.compare(
                    operation,
                    analyzer.diff(base, head, diff).map(|d| d.totals),
                    &reference.totals,
                ),
                None => debug!(operation, "Base report has no analyzer handle, skipping comparison"),
            }
        }
        reference
    }

    pub fn apply_diff(&mut self, diff: &mut Diff) -> Option<ReportTotals> {
        if diff.files.is_empty() {
            return None;
        }
        let result = self.diff_against(None, diff, "apply_diff");
        Some(self.report.record_diff(diff, &result))
    }

    /// Append a file. The analyzer reloads from the updated archive on its
    /// next use.
    pub fn append(&mut self, file: ReportFile, joined: bool) -> Result<bool> {
        let appended = self.report.append(file, joined)?;
        if appended {
            self.precomputed = None;
            self.precomputed_filtered.clear();
            self.precomputed_diff = None;
            self.handle = OnceCell::new();
        }
        Ok(appended)
    }

    fn compare(
        &self,
        operation: &str,
        accelerated: anyhow::Result<ReportTotals>,
        reference: &ReportTotals,
    ) {
        match accelerated {
            Ok(totals) => {
                if totals.files != reference.files || totals.coverage != reference.coverage {
                    self.mismatches.set(self.mismatches.get() + 1);
                    warn!(
                        operation,
                        analyzer_files = totals.files,
                        reference_files = reference.files,
                        analyzer_coverage = ?totals.coverage,
                        reference_coverage = ?reference.coverage,
                        "Analyzer result diverges from reference"
                    );
                }
            }
            Err(e) => {
                warn!(operation, error = %e, "Analyzer call failed, using reference result");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coverage::CoverageValue;
    use crate::diff::parse_unified_diff;
    use crate::model::{LineSession, ReportLine};
    use crate::session::Session;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// Re-loads the archive into a reference report, optionally failing.
    #[derive(Default)]
    struct FakeAnalyzer {
        parses: Cell<u32>,
        fail_parse: bool,
        fail_totals: bool,
        diffed: Cell<Option<(usize, usize)>>,
    }

    impl Analyzer for &FakeAnalyzer {
        type Handle = usize;

        fn parse(
            &self,
            file_index: &BTreeMap<String, usize>,
            _archive: &[u8],
            _session_flags: &BTreeMap<u32, Vec<String>>,
        ) -> anyhow::Result<usize> {
            self.parses.set(self.parses.get() + 1);
            if self.fail_parse {
                anyhow::bail!("corrupt archive");
            }
            Ok(file_index.len())
        }

        fn totals(&self, files: &usize) -> anyhow::Result<ReportTotals> {
            if self.fail_totals {
                anyhow::bail!("engine error");
            }
            Ok(ReportTotals {
                files: *files as u32,
                ..Default::default()
            })
        }

        fn diff(&self, base: &usize, head: &usize, _diff: &Diff) -> anyhow::Result<DiffTotals> {
            self.diffed.set(Some((*base, *head)));
            if self.fail_totals {
                anyhow::bail!("engine error");
            }
            Ok(DiffTotals {
                files: BTreeMap::new(),
                totals: ReportTotals::default(),
            })
        }
    }

    fn report() -> Report {
        let mut report = Report::new();
        report.add_session(Session::new(["unit"]));
        let mut file = ReportFile::new("a.rs");
        file.append(1, ReportLine::from_session(LineSession::new(0, CoverageValue::Hit(1.0))))
            .unwrap();
        report.append(file, true).unwrap();
        report
    }

    fn file(name: &str) -> ReportFile {
        let mut file = ReportFile::new(name);
        file.append(1, ReportLine::from_session(LineSession::new(0, CoverageValue::Miss)))
            .unwrap();
        file
    }

    #[test]
    fn test_zero_sample_rate_never_parses() {
        let analyzer = FakeAnalyzer::default();
        let shadow = ShadowReport::new(report(), Some(&analyzer), 0.0);
        assert!(!shadow.is_shadowed());
        assert_eq!(shadow.totals().files, 1);
        assert_eq!(analyzer.parses.get(), 0);
    }

    #[test]
    fn test_full_sample_rate_parses_once() {
        let analyzer = FakeAnalyzer::default();
        let mut rng = StdRng::seed_from_u64(7);
        let shadow = ShadowReport::sampled(report(), Some(&analyzer), 1.0, &mut rng);
        assert!(shadow.is_shadowed());

        let totals = shadow.totals();
        assert_eq!(totals, *shadow.report().totals());
        shadow.totals();
        assert_eq!(analyzer.parses.get(), 1);
    }

    #[test]
    fn test_failures_fall_back_to_reference() {
        let failing_parse = FakeAnalyzer {
            fail_parse: true,
            ..Default::default()
        };
        let shadow = ShadowReport::new(report(), Some(&failing_parse), 1.0);
        assert_eq!(shadow.totals().lines, 1);
        assert_eq!(shadow.totals().lines, 1);
        assert_eq!(failing_parse.parses.get(), 1);

        let failing_totals = FakeAnalyzer {
            fail_totals: true,
            ..Default::default()
        };
        let shadow = ShadowReport::new(report(), Some(&failing_totals), 1.0);
        assert_eq!(shadow.totals().hits, 1);
        assert_eq!(shadow.filtered_totals(&["a"], &[]).unwrap().files, 1);

        let diff = parse_unified_diff("--- a/a.rs\n+++ b/a.rs\n@@ -0,0 +1,1 @@\n+x\n");
        assert_eq!(shadow.calculate_diff(&diff).totals.hits, 1);
    }

    #[test]
    fn test_precomputed_totals_win() {
        let analyzer = FakeAnalyzer::default();
        let precomputed = ReportTotals {
            files: 42,
            ..Default::default()
        };
        let shadow =
            ShadowReport::new(report(), Some(&analyzer), 1.0).with_precomputed_totals(precomputed);
        assert_eq!(shadow.totals().files, 42);
        assert_eq!(analyzer.parses.get(), 0);
    }

    #[test]
    fn test_append_reloads_analyzer() {
        let analyzer = FakeAnalyzer::default();
        let mut shadow = ShadowReport::new(report(), Some(&analyzer), 1.0);
        shadow.totals();
        assert_eq!(analyzer.parses.get(), 1);

        assert!(shadow.append(file("b.rs"), true).unwrap());
        assert_eq!(shadow.totals().files, 2);
        assert_eq!(analyzer.parses.get(), 2);
    }

    #[test]
    fn test_apply_diff_updates_report() {
        let mut shadow: ShadowReport<&FakeAnalyzer> = ShadowReport::new(report(), None, 1.0);
        let mut diff = parse_unified_diff("--- a/a.rs\n+++ b/a.rs\n@@ -0,0 +1,1 @@\n+x\n");
        let totals = shadow.apply_diff(&mut diff).unwrap();
        assert_eq!(totals.hits, 1);
        assert!(shadow.report().summary("a.rs").unwrap().diff_totals.is_some());
    }

    #[test]
    fn test_divergent_diff_is_logged_not_returned() {
        let analyzer = FakeAnalyzer::default();
        let shadow = ShadowReport::new(report(), Some(&analyzer), 1.0);
        let diff = parse_unified_diff("--- a/a.rs\n+++ b/a.rs\n@@ -0,0 +1,1 @@\n+x\n");

        let result = shadow.calculate_diff(&diff);
        assert_eq!(result.totals.files, 1);
        assert_eq!(result.totals.hits, 1);
        assert_eq!(shadow.mismatches(), 1);
        assert_eq!(analyzer.diffed.get(), Some((1, 1)));
    }

    #[test]
    fn test_diff_against_base_uses_both_handles() {
        let analyzer = FakeAnalyzer::default();
        let mut base = report();
        base.append(file("b.rs"), true).unwrap();
        let base = ShadowReport::new(base, Some(&analyzer), 1.0);
        let head = ShadowReport::new(report(), Some(&analyzer), 1.0);
        let diff = parse_unified_diff("--- a/a.rs\n+++ b/a.rs\n@@ -0,0 +1,1 @@\n+x\n");

        assert_eq!(head.calculate_diff_against(&base, &diff).totals.hits, 1);
        assert_eq!(analyzer.diffed.get(), Some((2, 1)));
        assert_eq!(head.mismatches(), 1);
        assert_eq!(base.mismatches(), 0);
    }

    #[test]
    fn test_failed_diff_is_not_a_mismatch() {
        let analyzer = FakeAnalyzer {
            fail_totals: true,
            ..Default::default()
        };
        let mut shadow = ShadowReport::new(report(), Some(&analyzer), 1.0);
        let mut diff = parse_unified_diff("--- a/a.rs\n+++ b/a.rs\n@@ -0,0 +1,1 @@\n+x\n");
        assert_eq!(shadow.apply_diff(&mut diff).unwrap().hits, 1);
        assert_eq!(shadow.mismatches(), 0);
        assert!(analyzer.diffed.get().is_some());
    }

    #[test]
    fn test_precomputed_filter_and_diff_totals_win() {
        let analyzer = FakeAnalyzer::default();
        let filtered = ReportTotals {
            files: 7,
            ..Default::default()
        };
        let patch = DiffTotals {
            files: BTreeMap::from([("a.rs".to_string(), filtered.clone())]),
            totals: filtered.clone(),
        };
        let mut shadow = ShadowReport::new(report(), Some(&analyzer), 1.0)
            .with_precomputed_filtered_totals(&["^a"], &[], filtered.clone())
            .with_precomputed_diff_totals(patch);

        assert_eq!(shadow.filtered_totals(&["^a"], &[]).unwrap().files, 7);
        let diff = parse_unified_diff("--- a/a.rs\n+++ b/a.rs\n@@ -0,0 +1,1 @@\n+x\n");
        assert_eq!(shadow.calculate_diff(&diff).totals.files, 7);
        assert_eq!(analyzer.parses.get(), 0);

        let mut diff = diff;
        assert_eq!(shadow.apply_diff(&mut diff).unwrap().files, 7);
        let summary = shadow.report().summary("a.rs").unwrap();
        assert_eq!(summary.diff_totals.as_ref().unwrap().files, 7);

        assert!(shadow.append(file("b.rs"), true).unwrap());
        assert_eq!(shadow.filtered_totals(&["^a"], &[]).unwrap().files, 1);
    }
}
