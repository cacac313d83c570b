//! Worksheet export
//!
//! Turns a finished job into a named document. Actual document formats are
//! plugged in through `DocumentRenderer`; only plain markdown ships here.

use std::fs;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::types::job::{GenerationJob, JobId, JobStatus};

static HEADING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^#[ \t]+(.+?)[ \t]*#*[ \t]*$").expect("valid heading regex"));

static UNSAFE_FILENAME_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9]").expect("valid filename regex"));

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("Job {id} has no exportable output (status: {status:?})")]
    NotExportable { id: JobId, status: JobStatus },

    #[error("Rendering failed: {0}")]
    Render(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Markdown to document bytes
pub trait DocumentRenderer {
    /// File extension without the dot
    fn extension(&self) -> &'static str;

    fn render(&self, markdown: &str, title: &str) -> Result<Vec<u8>, ExportError>;
}

/// Writes the markdown unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkdownRenderer;

impl DocumentRenderer for MarkdownRenderer {
    fn extension(&self) -> &'static str {
        "md"
    }

    fn render(&self, markdown: &str, _title: &str) -> Result<Vec<u8>, ExportError> {
        Ok(markdown.as_bytes().to_vec())
    }
}

/// A rendered document ready to be written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedDocument {
    pub filename: String,
    pub title: String,
    pub bytes: Vec<u8>,
}

impl ExportedDocument {
    /// Write into `dir`, returning the full path
    pub fn write_to(&self, dir: &Path) -> Result<PathBuf, ExportError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(&self.filename);
        fs::write(&path, &self.bytes)?;
        tracing::info!("Exported worksheet to {:?}", path);
        Ok(path)
    }
}

/// Title of a worksheet: its first level-one heading, else "<topic> - Klasse <grade>"
pub fn document_title(job: &GenerationJob) -> String {
    HEADING
        .captures(&job.output)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| format!("{} - Klasse {}", job.topic.label, job.grade))
}

/// File name derived from topic label and grade
pub fn export_filename(job: &GenerationJob, extension: &str) -> String {
    let stem = UNSAFE_FILENAME_CHARS.replace_all(&job.topic.label, "_");
    format!("{}_Klasse{}.{}", stem, job.grade, extension)
}

/// Render a successful job
pub fn export_job(
    job: &GenerationJob,
    renderer: &dyn DocumentRenderer,
) -> Result<ExportedDocument, ExportError> {
    if job.status != JobStatus::Success || job.output.trim().is_empty() {
        return Err(ExportError::NotExportable {
            id: job.id,
            status: job.status,
        });
    }

    let title = document_title(job);
    let bytes = renderer.render(&job.output, &title)?;
    Ok(ExportedDocument {
        filename: export_filename(job, renderer.extension()),
        title,
        bytes,
    })
}
