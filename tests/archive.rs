mod common;

use covstore::coverage::CoverageValue;
use covstore::file::ReportFile;
use covstore::model::{LineSession, ReportLine};
use covstore::report::Report;
use covstore::session::Session;
use covstore::store::{self, MemoryStore};
use proptest::prelude::*;

fn coverage_strategy() -> impl Strategy<Value = CoverageValue> {
    prop_oneof![
        Just(CoverageValue::Miss),
        (1u32..100).prop_map(|n| CoverageValue::Hit(f64::from(n))),
        (1u32..5)
            .prop_flat_map(|total| (0..=total, Just(total)))
            .prop_map(|(hit, total)| CoverageValue::BranchRatio(hit, total)),
    ]
}

/// `(file index, line number, session id, coverage)` readings.
fn readings_strategy() -> impl Strategy<Value = Vec<(usize, u32, u32, CoverageValue)>> {
    prop::collection::vec((0usize..3, 1u32..40, 0u32..3, coverage_strategy()), 1..60)
}

fn build_report(readings: &[(usize, u32, u32, CoverageValue)]) -> Report {
    let mut report = Report::new();
    for flag in ["unit", "integration", "ui"] {
        report.add_session(Session::new([flag]));
    }
    for (index, ln, session, coverage) in readings {
        let mut file = ReportFile::new(format!("src/file{index}.rs"));
        file.append(*ln, ReportLine::from_session(LineSession::new(*session, coverage.clone())))
            .unwrap();
        report.append(file, true).unwrap();
    }
    report
}

proptest! {
    #[test]
    fn prop_archive_round_trip_preserves_lines(readings in readings_strategy()) {
        let report = build_report(&readings);
        let mut store = MemoryStore::new();
        store::save_report(&mut store, "main", &report).unwrap();
        let loaded = store::load_report(&store, "main").unwrap();

        prop_assert_eq!(loaded.totals(), report.totals());
        prop_assert_eq!(loaded.files().collect::<Vec<_>>(), report.files().collect::<Vec<_>>());
        for name in report.files() {
            let before: Vec<(u32, ReportLine)> =
                report.get(name).unwrap().lines().map(|(ln, l)| (ln, l.clone())).collect();
            let after: Vec<(u32, ReportLine)> =
                loaded.get(name).unwrap().lines().map(|(ln, l)| (ln, l.clone())).collect();
            prop_assert_eq!(before, after);
        }
    }

    #[test]
    fn prop_untouched_archive_is_stable(readings in readings_strategy()) {
        let report = build_report(&readings);
        let (archive, manifest) = report.to_json().unwrap();
        let loaded = Report::from_json(&archive, &manifest).unwrap();
        let (again, _) = loaded.to_json().unwrap();
        prop_assert_eq!(archive, again);
    }

    #[test]
    fn prop_totals_sum_over_files(readings in readings_strategy()) {
        let report = build_report(&readings);
        let totals = report.totals();
        let lines: u32 = report.iter().map(|f| f.totals().lines).sum();
        prop_assert_eq!(totals.lines, lines);
        prop_assert_eq!(totals.lines, totals.hits + totals.misses + totals.partials);
        prop_assert_eq!(totals.files as usize, report.len());
    }
}

#[test]
fn archive_survives_sqlite_store() {
    let (mut store, _dir, db_path) = common::setup_store();
    let report = build_report(&[
        (0, 1, 0, CoverageValue::Hit(2.0)),
        (0, 1, 1, CoverageValue::Miss),
        (1, 3, 2, CoverageValue::BranchRatio(1, 2)),
    ]);
    store::save_report(&mut store, "main", &report).unwrap();
    drop(store);

    let store = covstore::store::SqliteStore::open(&db_path).unwrap();
    let loaded = store::load_report(&store, "main").unwrap();
    assert_eq!(loaded.totals().lines, 2);
    assert_eq!(loaded.totals().hits, 1);
    assert_eq!(loaded.totals().partials, 1);
    assert_eq!(loaded.sessions().len(), 3);
    assert_eq!(loaded.flags().into_iter().collect::<Vec<_>>(), vec!["integration", "ui", "unit"]);
}
