//! Blob storage for archives and manifests.

use std::collections::HashMap;
use std::path::Path;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::error::{CovstoreError, Result};
use crate::report::Report;

pub const SCHEMA_VERSION: u32 = 1;

const SCHEMA: &str = include_str!("../schema.sql");

/// Read/write-by-key byte storage. Writes replace; there are no
/// transactions across keys.
pub trait ArchiveStore {
    /// `None` when the key has never been written.
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn write(&mut self, key: &str, value: &[u8]) -> Result<()>;
}

/// Open (or create) a covstore database at the given path.
pub fn open(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    conn.execute_batch("PRAGMA synchronous=NORMAL;")?;
    Ok(conn)
}

/// Ensure the schema is initialized. Safe to call on an already-initialized DB.
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;

    let version: Option<u32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .optional()?;
    match version {
        None => {
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                params![SCHEMA_VERSION],
            )?;
            Ok(())
        }
        Some(version) if version == SCHEMA_VERSION => Ok(()),
        Some(version) if version > SCHEMA_VERSION => Err(CovstoreError::Store(format!(
            "Database schema version {version} is newer than this binary supports ({SCHEMA_VERSION}). \
             Please upgrade covstore."
        ))),
        Some(version) => Err(CovstoreError::Store(format!(
            "No migration path from schema version {version} to {SCHEMA_VERSION}."
        ))),
    }
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = open(path)?;
        init_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl ArchiveStore for SqliteStore {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .conn
            .query_row("SELECT value FROM blob WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?)
    }

    fn write(&mut self, key: &str, value: &[u8]) -> Result<()> {
        self.conn.execute(
            "INSERT INTO blob (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, Utc::now().to_rfc3339()],
        )?;
        debug!(key, bytes = value.len(), "Stored blob");
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    blobs: HashMap<String, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

impl ArchiveStore for MemoryStore {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.get(key).cloned())
    }

    fn write(&mut self, key: &str, value: &[u8]) -> Result<()> {
        self.blobs.insert(key.to_string(), value.to_vec());
        Ok(())
    }
}

pub fn chunks_key(name: &str) -> String {
    format!("{name}/chunks.txt")
}

pub fn manifest_key(name: &str) -> String {
    format!("{name}/report.json")
}

/// Persist `report` under `name` as an archive and a manifest.
pub fn save_report<S: ArchiveStore + ?Sized>(store: &mut S, name: &str, report: &Report) -> Result<()> {
    let (archive, manifest) = report.to_json()?;
    store.write(&chunks_key(name), archive.as_bytes())?;
    store.write(&manifest_key(name), manifest.as_bytes())?;
    info!(
        report = name,
        files = report.len(),
        sessions = report.sessions().len(),
        "Saved report"
    );
    Ok(())
}

pub fn load_report<S: ArchiveStore + ?Sized>(store: &S, name: &str) -> Result<Report> {
    let (Some(archive), Some(manifest)) =
        (store.read(&chunks_key(name))?, store.read(&manifest_key(name))?)
    else {
        return Err(CovstoreError::ReportNotFound(name.to_string()));
    };
    let archive = String::from_utf8(archive)
        .map_err(|e| CovstoreError::Archive(format!("{name}: archive is not UTF-8: {e}")))?;
    let manifest = String::from_utf8(manifest)
        .map_err(|e| CovstoreError::Archive(format!("{name}: manifest is not UTF-8: {e}")))?;
    Report::from_json(&archive, &manifest)
}

/// Whether a report named `name` has been saved.
pub fn report_exists<S: ArchiveStore + ?Sized>(store: &S, name: &str) -> Result<bool> {
    Ok(store.read(&manifest_key(name))?.is_some())
}
