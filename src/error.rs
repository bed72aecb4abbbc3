use thiserror::Error;

#[derive(Error, Debug)]
pub enum CovstoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid path pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Line numbers start at 1, got {0}")]
    InvalidLineNumber(u32),

    #[error("File not found in report: {0}")]
    FileNotFound(String),

    #[error("Session not found: {0}")]
    SessionNotFound(u32),

    #[error("Session id {0} is already in use")]
    SessionExists(u32),

    #[error("Malformed archive: {0}")]
    Archive(String),

    #[error("Malformed diff: {0}")]
    Diff(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Report not found: {0}")]
    ReportNotFound(String),

    #[error("Storage error: {0}")]
    Store(String),
}

pub type Result<T> = std::result::Result<T, CovstoreError>;
