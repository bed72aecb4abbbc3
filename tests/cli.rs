mod common;

use std::path::Path;
use std::process::{Command, Output};

fn covstore(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_covstore"))
        .current_dir(dir)
        .env_remove("COVSTORE_LOG")
        .arg("--db")
        .arg(dir.join("test.db"))
        .args(args)
        .output()
        .unwrap()
}

fn stdout(output: &Output) -> String {
    assert!(
        output.status.success(),
        "covstore failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout.clone()).unwrap()
}

#[test]
fn ingest_then_summary() {
    let dir = tempfile::tempdir().unwrap();
    let lcov = common::fixture("sample.lcov");
    let lcov = lcov.to_str().unwrap();

    stdout(&covstore(dir.path(), &["ingest", lcov, "--report", "main", "--flag", "unit"]));
    let summary = stdout(&covstore(dir.path(), &["summary", "--report", "main"]));
    assert!(summary.contains("Lines:      4/8"), "{summary}");

    let sessions = stdout(&covstore(dir.path(), &["sessions"]));
    assert!(sessions.contains("unit"), "{sessions}");
}

#[test]
fn config_file_is_loaded() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::write_file(&dir, "engine.toml", "analyzer_sample_rate = 0.0\n");
    let lcov = common::fixture("sample.lcov");

    let output = covstore(
        dir.path(),
        &[
            "--config",
            config.to_str().unwrap(),
            "ingest",
            lcov.to_str().unwrap(),
        ],
    );
    stdout(&output);

    let summary = stdout(&covstore(
        dir.path(),
        &["--config", config.to_str().unwrap(), "summary", "--flag", "missing"],
    ));
    assert!(summary.contains("Flags:      missing"), "{summary}");
}

#[test]
fn missing_config_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let output = covstore(dir.path(), &["--config", "nope.toml", "sessions"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Failed to load configuration"), "{stderr}");
}
