use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use covstore::cli;
use covstore::config::EngineConfig;
use covstore::diff::{DiffSource, GitDiff, StdinDiff};
use covstore::ingest::Upload;
use covstore::store::SqliteStore;

/// covstore: session-aware coverage reports in a SQLite blob store.
#[derive(Parser)]
#[command(name = "covstore", version, about)]
struct Cli {
    /// Path to the SQLite database (default: ./.covstore.db)
    #[arg(long, global = true, default_value = ".covstore.db")]
    db: PathBuf,

    /// Configuration file (default: ./covstore.toml if present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Append an LCOV file to a report as a new session.
    Ingest {
        /// Path to the LCOV file.
        file: PathBuf,

        /// Report to append to (created if missing).
        #[arg(long, default_value = "main")]
        report: String,

        /// Flag for the new session. Repeatable.
        #[arg(long = "flag")]
        flags: Vec<String>,

        /// Display name for the new session.
        #[arg(long)]
        name: Option<String>,
    },

    /// Show totals for a report, optionally filtered.
    Summary {
        #[arg(long, default_value = "main")]
        report: String,

        /// Only count files matching these patterns. Prefix with `!` to exclude.
        #[arg(long = "path")]
        paths: Vec<String>,

        /// Only count sessions carrying one of these flags.
        #[arg(long = "flag")]
        flags: Vec<String>,
    },

    /// List per-file coverage for a report.
    Files {
        #[arg(long, default_value = "main")]
        report: String,
    },

    /// Show line-level coverage for a source file.
    Lines {
        /// The source file path (as stored in the report).
        file: String,

        #[arg(long, default_value = "main")]
        report: String,

        /// Only list missed lines, grouped into ranges.
        #[arg(long)]
        uncovered: bool,
    },

    /// List the sessions of a report.
    Sessions {
        #[arg(long, default_value = "main")]
        report: String,
    },

    /// Remove sessions and their readings from a report.
    DeleteSessions {
        #[arg(long, default_value = "main")]
        report: String,

        /// Session ids to delete.
        #[arg(required = true)]
        ids: Vec<u32>,
    },

    /// Copy the flagged sessions of a report into a new carried-forward report.
    Carryforward {
        #[arg(long, default_value = "main")]
        report: String,

        /// Name of the report to write.
        #[arg(long)]
        into: String,

        /// Sessions to carry forward. Repeatable.
        #[arg(long = "flag", required = true)]
        flags: Vec<String>,

        /// Only carry forward files matching these patterns.
        #[arg(long = "path")]
        paths: Vec<String>,
    },

    /// Compute coverage for lines in a git diff (patch coverage).
    DiffCoverage {
        #[arg(long, default_value = "main")]
        report: String,

        /// Git diff arguments, e.g. "HEAD~1" or "main..HEAD".
        /// If omitted, reads a unified diff from stdin.
        #[arg(long)]
        git_diff: Option<String>,

        /// Optional path prefix to prepend to diff paths for matching
        /// against report paths.
        #[arg(long)]
        path_prefix: Option<String>,
    },

    /// Compact a report's chunk arena after deletions.
    Repack {
        #[arg(long, default_value = "main")]
        report: String,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("COVSTORE_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn as_strs(values: &[String]) -> Vec<&str> {
    values.iter().map(String::as_str).collect()
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_logging();

    let config = EngineConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    let mut store = SqliteStore::open(&args.db)
        .with_context(|| format!("Failed to open database {}", args.db.display()))?;

    let output = match args.command {
        Commands::Ingest {
            file,
            report,
            flags,
            name,
        } => {
            let upload = Upload {
                flags,
                name,
                time: None,
            };
            cli::cmd_ingest(&mut store, &file, &report, &upload)?
        }
        Commands::Summary {
            report,
            paths,
            flags,
        } => cli::cmd_summary(&store, &report, &as_strs(&paths), &as_strs(&flags), &config)?,
        Commands::Files { report } => cli::cmd_files(&store, &report)?,
        Commands::Lines {
            file,
            report,
            uncovered,
        } => cli::cmd_lines(&store, &report, &file, uncovered)?,
        Commands::Sessions { report } => cli::cmd_sessions(&store, &report)?,
        Commands::DeleteSessions { report, ids } => {
            cli::cmd_delete_sessions(&mut store, &report, &ids)?
        }
        Commands::Carryforward {
            report,
            into,
            flags,
            paths,
        } => cli::cmd_carryforward(
            &mut store,
            &report,
            &into,
            &as_strs(&flags),
            &as_strs(&paths),
        )?,
        Commands::DiffCoverage {
            report,
            git_diff,
            path_prefix,
        } => {
            let source: Box<dyn DiffSource> = match git_diff {
                Some(args) => Box::new(GitDiff { args }),
                None => Box::new(StdinDiff),
            };
            let diff_text = source.fetch_diff()?;
            cli::cmd_diff_coverage(&store, &report, &diff_text, path_prefix.as_deref())?
        }
        Commands::Repack { report } => cli::cmd_repack(&mut store, &report)?,
    };

    print!("{output}");
    Ok(())
}
