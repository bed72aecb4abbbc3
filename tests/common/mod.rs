use std::path::PathBuf;

use covstore::store::SqliteStore;
use tempfile::TempDir;

/// Create a fresh temporary store, returning the store, dir handle, and db path.
/// The caller must hold onto `TempDir` to keep the temp directory alive.
pub fn setup_store() -> (SqliteStore, TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("test.db");
    let store = SqliteStore::open(&db_path).unwrap();
    (store, dir, db_path)
}

/// Write `content` to `name` inside `dir`.
#[allow(dead_code)]
pub fn write_file(dir: &TempDir, name: &str, content: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, content).unwrap();
    path
}

#[allow(dead_code)]
pub fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}
