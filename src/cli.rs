//! Command handler functions for the covstore CLI.
//!
//! Each `cmd_*` function returns its output as a `String`, making them easy
//! to test without capturing stdout.

use std::fmt::Write;
use std::path::Path;

use anyhow::{Context, Result};

use crate::carryforward::generate_carryforward_report;
use crate::config::EngineConfig;
use crate::coverage::CoverageKind;
use crate::diff;
use crate::editable::EditableReport;
use crate::error::CovstoreError;
use crate::ingest::{self, Upload};
use crate::report::Report;
use crate::session::SessionType;
use crate::store::{self, ArchiveStore};

/// Largest run of non-instrumentable lines bridged when grouping uncovered
/// lines into ranges.
const MAX_BRIDGE_GAP: u32 = 2;

/// Coalesce sorted line numbers into `(start, end)` ranges, bridging small
/// gaps where every line in the gap is non-instrumentable.
///
/// Both `lines` and `all_instrumentable` must be sorted and deduplicated.
#[must_use]
pub fn coalesce_ranges(lines: &[u32], all_instrumentable: &[u32]) -> Vec<(u32, u32)> {
    let Some((&first, rest)) = lines.split_first() else {
        return Vec::new();
    };

    let mut ranges: Vec<(u32, u32)> = Vec::new();
    let mut start = first;
    let mut end = first;

    for &line in rest {
        let gap = line - end - 1;
        if gap <= MAX_BRIDGE_GAP
            && (end + 1..line).all(|l| all_instrumentable.binary_search(&l).is_err())
        {
            end = line;
        } else {
            ranges.push((start, end));
            start = line;
            end = line;
        }
    }

    ranges.push((start, end));
    ranges
}

/// Format line numbers into compact range notation, e.g. "1, 3-5, 8".
#[must_use]
pub fn format_line_ranges(lines: &[u32], all_instrumentable: &[u32]) -> String {
    coalesce_ranges(lines, all_instrumentable)
        .iter()
        .map(|&(start, end)| {
            if start == end {
                start.to_string()
            } else {
                format!("{start}-{end}")
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn percent(coverage: Option<&str>) -> String {
    match coverage {
        Some(c) => match c.parse::<f64>() {
            Ok(v) => format!("{v:.1}%"),
            Err(_) => format!("{c}%"),
        },
        None => "n/a".to_string(),
    }
}

fn load<S: ArchiveStore + ?Sized>(store: &S, name: &str) -> Result<Report> {
    store::load_report(store, name).with_context(|| format!("Failed to load report '{name}'"))
}

fn save<S: ArchiveStore + ?Sized>(store: &mut S, name: &str, report: &Report) -> Result<()> {
    store::save_report(store, name, report).with_context(|| format!("Failed to save report '{name}'"))
}

pub fn cmd_ingest<S: ArchiveStore + ?Sized>(
    store: &mut S,
    file: &Path,
    report: &str,
    upload: &Upload,
) -> Result<String> {
    let ingested = ingest::ingest(store, report, file, upload)
        .with_context(|| format!("Failed to ingest {}", file.display()))?;
    Ok(format!(
        "Ingested {} into '{}' as session {} ({} files, {} lines, {})\n",
        file.display(),
        report,
        ingested.session_id,
        ingested.files,
        ingested.totals.lines,
        percent(ingested.totals.coverage.as_deref()),
    ))
}

pub fn cmd_summary<S: ArchiveStore + ?Sized>(
    store: &S,
    report_name: &str,
    paths: &[&str],
    flags: &[&str],
    config: &EngineConfig,
) -> Result<String> {
    let report = load(store, report_name)?;
    let view = report.filter_with_options(paths, flags, config.filter_options())?;
    let totals = view.totals();

    let mut out = String::new();
    writeln!(out, "Report:     {report_name}").unwrap();
    if !paths.is_empty() {
        writeln!(out, "Paths:      {}", paths.join(", ")).unwrap();
    }
    if !flags.is_empty() {
        writeln!(out, "Flags:      {}", flags.join(", ")).unwrap();
    }
    writeln!(out, "Files:      {}", totals.files).unwrap();
    writeln!(out, "Sessions:   {}", totals.sessions).unwrap();
    writeln!(
        out,
        "Lines:      {}/{} ({})",
        totals.hits,
        totals.lines,
        percent(totals.coverage.as_deref())
    )
    .unwrap();
    writeln!(
        out,
        "            {} missed, {} partial",
        totals.misses, totals.partials
    )
    .unwrap();
    if totals.branches > 0 {
        writeln!(out, "Branches:   {}", totals.branches).unwrap();
    }
    if totals.methods > 0 {
        writeln!(out, "Methods:    {}", totals.methods).unwrap();
    }
    Ok(out)
}

pub fn cmd_files<S: ArchiveStore + ?Sized>(store: &S, report_name: &str) -> Result<String> {
    let report = load(store, report_name)?;

    let mut out = String::new();
    writeln!(
        out,
        "{:<60} {:>8} {:>8} {:>8} {:>8}",
        "FILE", "LINES", "HITS", "MISSES", "RATE"
    )
    .unwrap();
    writeln!(out, "{}", "-".repeat(96)).unwrap();

    for name in report.files() {
        let Some(totals) = report.file_totals(name) else { continue };
        writeln!(
            out,
            "{:<60} {:>8} {:>8} {:>8} {:>8}",
            name,
            totals.lines,
            totals.hits,
            totals.misses,
            percent(totals.coverage.as_deref())
        )
        .unwrap();
    }
    Ok(out)
}

pub fn cmd_lines<S: ArchiveStore + ?Sized>(
    store: &S,
    report_name: &str,
    source_file: &str,
    uncovered: bool,
) -> Result<String> {
    let report = load(store, report_name)?;
    let file = report.file(source_file)?;

    if uncovered {
        let instrumentable: Vec<u32> = file
            .lines()
            .filter(|(_, line)| line.coverage.kind().is_some())
            .map(|(ln, _)| ln)
            .collect();
        let missed: Vec<u32> = file
            .lines()
            .filter(|(_, line)| line.coverage.kind() == Some(CoverageKind::Miss))
            .map(|(ln, _)| ln)
            .collect();

        if missed.is_empty() {
            return Ok(format!(
                "All instrumentable lines are covered in '{source_file}'\n"
            ));
        }

        let mut out = String::new();
        writeln!(out, "Uncovered lines in '{source_file}':").unwrap();
        writeln!(out, "  {}", format_line_ranges(&missed, &instrumentable)).unwrap();
        writeln!(out, "  ({} lines)", missed.len()).unwrap();
        return Ok(out);
    }

    if file.is_empty() {
        return Ok(format!("No coverage data for '{source_file}'\n"));
    }

    let mut out = String::new();
    writeln!(out, "{:>6}  {:>10}  {:>8}", "LINE", "COVERAGE", "SESSIONS").unwrap();
    writeln!(out, "{}", "-".repeat(30)).unwrap();
    for (ln, line) in file.lines() {
        let marker = match line.coverage.kind() {
            Some(CoverageKind::Hit) => "✓",
            Some(CoverageKind::Miss) => "✗",
            Some(CoverageKind::Partial) => "~",
            Some(CoverageKind::Skipped) | None => "-",
        };
        writeln!(
            out,
            "{:>6}  {:>10}  {:>8}  {}",
            ln,
            line.coverage.to_string(),
            line.sessions.len(),
            marker
        )
        .unwrap();
    }
    Ok(out)
}

pub fn cmd_sessions<S: ArchiveStore + ?Sized>(store: &S, report_name: &str) -> Result<String> {
    let report = load(store, report_name)?;
    if report.sessions().is_empty() {
        return Ok(format!("No sessions in '{report_name}'.\n"));
    }

    let mut out = String::new();
    writeln!(
        out,
        "{:>4}  {:<24} {:<24} {:<15} {:>8}",
        "ID", "FLAGS", "NAME", "TYPE", "RATE"
    )
    .unwrap();
    writeln!(out, "{}", "-".repeat(80)).unwrap();
    for (id, session) in report.sessions() {
        let kind = match session.session_type {
            SessionType::Uploaded => "uploaded",
            SessionType::Carriedforward => "carriedforward",
        };
        writeln!(
            out,
            "{:>4}  {:<24} {:<24} {:<15} {:>8}",
            id,
            session.flags.join(","),
            session.name.as_deref().unwrap_or("-"),
            kind,
            percent(session.totals.as_ref().and_then(|t| t.coverage.as_deref())),
        )
        .unwrap();
    }
    Ok(out)
}

pub fn cmd_delete_sessions<S: ArchiveStore + ?Sized>(
    store: &mut S,
    report_name: &str,
    ids: &[u32],
) -> Result<String> {
    let report = load(store, report_name)?;
    if let Some(missing) = ids.iter().find(|id| report.session(**id).is_none()) {
        return Err(CovstoreError::SessionNotFound(*missing).into());
    }

    let mut editable = EditableReport::from(report);
    editable.delete_multiple_sessions(ids.iter().copied());
    save(store, report_name, &editable)?;

    Ok(format!(
        "Deleted {} session(s) from '{}' ({} files remain)\n",
        ids.len(),
        report_name,
        editable.len()
    ))
}

pub fn cmd_carryforward<S: ArchiveStore + ?Sized>(
    store: &mut S,
    report_name: &str,
    into: &str,
    flags: &[&str],
    paths: &[&str],
) -> Result<String> {
    let report = load(store, report_name)?;
    let paths = (!paths.is_empty()).then_some(paths);
    let carried = generate_carryforward_report(&report, flags, paths, None)?;
    save(store, into, &carried)?;

    Ok(format!(
        "Carried forward {} session(s) and {} files from '{}' into '{}'\n",
        carried.sessions().len(),
        carried.len(),
        report_name,
        into
    ))
}

/// Patch coverage of `diff_text` against a stored report. Accepts the
/// diff text directly so callers can obtain it from stdin or `git diff`.
pub fn cmd_diff_coverage<S: ArchiveStore + ?Sized>(
    store: &S,
    report_name: &str,
    diff_text: &str,
    path_prefix: Option<&str>,
) -> Result<String> {
    let report = load(store, report_name)?;
    let mut parsed = diff::parse_unified_diff(diff_text);
    if let Some(prefix) = path_prefix {
        parsed = diff::apply_path_prefix(parsed, prefix);
    }

    if parsed.files.values().all(|f| !f.contributes()) {
        return Ok("No added lines found in diff.\n".to_string());
    }

    let result = report.calculate_diff(&parsed);
    let mut out = String::new();
    writeln!(out, "Patch coverage for report '{report_name}':").unwrap();
    writeln!(
        out,
        "  Diff touches {} files, {} with coverage data",
        parsed.files.len(),
        result.files.len()
    )
    .unwrap();
    for (path, totals) in &result.files {
        if totals.lines > 0 {
            writeln!(out, "    {path}: {}/{}", totals.hits, totals.lines).unwrap();
        }
    }
    let totals = &result.totals;
    if totals.lines > 0 {
        writeln!(
            out,
            "  Of the added lines, {} are tracked, {} are covered",
            totals.lines, totals.hits
        )
        .unwrap();
        writeln!(out, "  Patch coverage: {}", percent(totals.coverage.as_deref())).unwrap();
    } else {
        writeln!(out, "  No tracked lines in diff (nothing to cover)").unwrap();
    }
    Ok(out)
}

pub fn cmd_repack<S: ArchiveStore + ?Sized>(store: &mut S, report_name: &str) -> Result<String> {
    let mut report = load(store, report_name)?;
    let before = report.chunks.len();
    if !report.repack() {
        anyhow::bail!("Report '{report_name}' failed its integrity check; not repacking");
    }
    save(store, report_name, &report)?;
    Ok(format!(
        "Repacked '{}': {} chunks -> {}\n",
        report_name,
        before,
        report.chunks.len()
    ))
}
