//! The archive text codec and its companion manifest.
//!
//! ```text
//! [<header-json>
//! <<<<< end_of_header >>>>>
//! ]<chunk-0>
//! <<<<< end_of_chunk >>>>>
//! <chunk-1>
//! ```
//!
//! A deleted chunk is written as `null` so later chunk indexes stay valid
//! until the report is repacked.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;
use crate::file::ReportFile;
use crate::report::{FileSummary, Report};
use crate::session::Session;

pub const END_OF_CHUNK: &str = "<<<<< end_of_chunk >>>>>";
pub const END_OF_HEADER: &str = "<<<<< end_of_header >>>>>";

const DELETED_CHUNK: &str = "null";

#[derive(Debug, Default, Serialize, Deserialize)]
struct ArchiveHeader {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    labels_index: Option<BTreeMap<u32, String>>,
}

/// The JSON document persisted alongside the archive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub files: BTreeMap<String, FileSummary>,
    #[serde(default)]
    pub sessions: BTreeMap<u32, Session>,
}

fn split_header(text: &str) -> (Option<&str>, &str) {
    let mut parts = text.splitn(3, '\n');
    let first = parts.next();
    match (first, parts.next()) {
        (Some(header), Some(marker)) if marker.trim_end_matches('\r') == END_OF_HEADER => {
            (Some(header), parts.next().unwrap_or(""))
        }
        _ => (None, text),
    }
}

fn parse_header(header: &str) -> Option<BTreeMap<u32, String>> {
    match serde_json::from_str::<ArchiveHeader>(header) {
        Ok(header) => header.labels_index,
        Err(e) => {
            warn!(error = %e, "Ignoring malformed archive header");
            None
        }
    }
}

impl Report {
    /// Build a report from archive text and its manifest. Chunks stay
    /// unparsed until a file is read.
    pub fn from_archive(text: &str, manifest: Manifest) -> Result<Report> {
        let (header, body) = split_header(text);
        let labels_index = header.and_then(parse_header);

        let names: BTreeMap<usize, &str> = manifest
            .files
            .iter()
            .map(|(name, summary)| (summary.file_index, name.as_str()))
            .collect();

        let separator = format!("\n{END_OF_CHUNK}\n");
        let chunks: Vec<Option<ReportFile>> = if body.is_empty() {
            Vec::new()
        } else {
            body.split(separator.as_str())
                .enumerate()
                .map(|(index, raw)| {
                    if raw.trim() == DELETED_CHUNK {
                        return None;
                    }
                    let name = names.get(&index).copied().unwrap_or_default();
                    Some(ReportFile::from_raw(name, raw.to_string()))
                })
                .collect()
        };
        debug!(
            chunks = chunks.len(),
            files = manifest.files.len(),
            sessions = manifest.sessions.len(),
            "Loaded archive"
        );

        let sessions = manifest
            .sessions
            .into_iter()
            .map(|(id, mut session)| {
                session.id = id;
                (id, session)
            })
            .collect();
        Ok(Report::from_parts(manifest.files, chunks, sessions, labels_index))
    }

    /// Same as [`Report::from_archive`] with the manifest still as JSON.
    pub fn from_json(text: &str, manifest_json: &str) -> Result<Report> {
        let manifest: Manifest = serde_json::from_str(manifest_json)?;
        Report::from_archive(text, manifest)
    }

    /// Serialize the chunk arena. Untouched chunks are copied through
    /// verbatim.
    pub fn to_archive(&self, with_header: bool) -> Result<String> {
        let mut out = String::new();
        if with_header {
            let header = ArchiveHeader {
                labels_index: self.labels_index.clone(),
            };
            out.push_str(&serde_json::to_string(&header)?);
            out.push('\n');
            out.push_str(END_OF_HEADER);
            out.push('\n');
        }
        let separator = format!("\n{END_OF_CHUNK}\n");
        for (index, chunk) in self.chunks.iter().enumerate() {
            if index > 0 {
                out.push_str(&separator);
            }
            match chunk {
                Some(file) => out.push_str(&file.encode()?),
                None => out.push_str(DELETED_CHUNK),
            }
        }
        Ok(out)
    }

    /// The manifest describing the current archive, with totals refreshed
    /// for every file that was parsed.
    pub fn to_manifest(&self) -> Manifest {
        let files = self
            .files
            .iter()
            .map(|(name, summary)| {
                let mut summary = summary.clone();
                if let Some(Some(file)) = self.chunks.get(summary.file_index) {
                    if file.is_parsed() {
                        summary.file_totals = file.totals().clone();
                    }
                }
                (name.clone(), summary)
            })
            .collect();
        Manifest {
            files,
            sessions: self.sessions.clone(),
        }
    }

    /// Archive text and manifest JSON, ready to be stored.
    pub fn to_json(&self) -> Result<(String, String)> {
        let archive = self.to_archive(true)?;
        let manifest = serde_json::to_string(&self.to_manifest())?;
        Ok((archive, manifest))
    }
}
