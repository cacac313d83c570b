//! HuggingFace model artifacts
//!
//! Resolves catalog sources to GGUF files in the models directory, downloading
//! them from the HuggingFace Hub when they are not present yet.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Invalid model source: {0}")]
    InvalidSource(String),

    #[error("Download failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Download failed with status: {0}")]
    Status(reqwest::StatusCode),

    #[error("Download incomplete: got {got} bytes, expected {expected}")]
    Incomplete { got: u64, expected: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A file inside a HuggingFace repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HuggingFaceSource {
    pub repo_id: String,
    pub filename: String,
    pub revision: String,
}

impl HuggingFaceSource {
    /// Parse `owner/repo/file.gguf` or a full `https://huggingface.co/.../blob|resolve/<rev>/file` URL
    pub fn parse(source: &str) -> Result<Self, DownloadError> {
        let source = source.trim();
        let source = source.split('?').next().unwrap_or(source);
        let source = source.split('#').next().unwrap_or(source);

        let path = source
            .trim_start_matches("https://huggingface.co/")
            .trim_start_matches("http://huggingface.co/");
        let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
        if parts.len() < 3 {
            return Err(DownloadError::InvalidSource(source.to_string()));
        }

        let repo_id = format!("{}/{}", parts[0], parts[1]);
        if let Some(pos) = parts.iter().position(|&p| p == "blob" || p == "resolve") {
            if parts.len() > pos + 2 {
                return Ok(Self {
                    repo_id,
                    filename: parts[pos + 2..].join("/"),
                    revision: parts[pos + 1].to_string(),
                });
            }
            return Err(DownloadError::InvalidSource(source.to_string()));
        }

        Ok(Self {
            repo_id,
            filename: parts[2..].join("/"),
            revision: "main".to_string(),
        })
    }

    /// Build the download URL for the file
    pub fn download_url(&self) -> String {
        format!(
            "https://huggingface.co/{}/resolve/{}/{}",
            self.repo_id, self.revision, self.filename
        )
    }

    /// File name used inside the models directory
    pub fn local_filename(&self) -> Result<String, DownloadError> {
        sanitize_local_filename(&self.filename)
    }
}

fn sanitize_local_filename(filename: &str) -> Result<String, DownloadError> {
    let trimmed = filename.trim().trim_start_matches('/');
    let flattened = trimmed.replace('\\', "/").replace('/', "__");

    let mut sanitized = String::with_capacity(flattened.len());
    for ch in flattened.chars() {
        let invalid = matches!(ch, '<' | '>' | ':' | '"' | '|' | '?' | '*');
        if invalid || ch.is_control() {
            sanitized.push('_');
        } else {
            sanitized.push(ch);
        }
    }

    while sanitized.ends_with('.') || sanitized.ends_with(' ') {
        sanitized.pop();
    }

    if sanitized.is_empty() {
        return Err(DownloadError::InvalidSource(filename.to_string()));
    }
    Ok(sanitized)
}

/// Local path of a source inside `models_dir`, whether or not it exists yet
pub fn local_model_path(models_dir: &Path, source: &HuggingFaceSource) -> Result<PathBuf, DownloadError> {
    Ok(models_dir.join(source.local_filename()?))
}

/// Ensure the artifact exists locally, downloading it if needed.
///
/// `progress` receives `(downloaded_bytes, total_bytes)`; `total_bytes` is 0
/// when the server does not announce a length.
pub async fn fetch_model(
    source: &HuggingFaceSource,
    models_dir: &Path,
    progress: impl Fn(u64, u64),
) -> Result<PathBuf, DownloadError> {
    fs::create_dir_all(models_dir)?;

    let output_path = local_model_path(models_dir, source)?;
    let temp_path = output_path.with_extension("gguf.tmp");

    if output_path.exists() && fs::metadata(&output_path)?.len() > 0 {
        tracing::info!("Model already present: {:?}", output_path);
        return Ok(output_path);
    }

    let download_url = source.download_url();
    tracing::info!("Downloading from: {}", download_url);
    let client = reqwest::Client::builder()
        .user_agent(concat!("schoolsheet/", env!("CARGO_PKG_VERSION")))
        .build()?;

    let mut response = client.get(&download_url).send().await?;
    if !response.status().is_success() {
        return Err(DownloadError::Status(response.status()));
    }

    let total_size = response.content_length().unwrap_or(0);
    tracing::info!("File size: {}", format_size(total_size));

    let mut temp_file = File::create(&temp_path).await?;
    let mut downloaded: u64 = 0;
    while let Some(chunk) = response.chunk().await? {
        temp_file.write_all(&chunk).await?;
        downloaded += chunk.len() as u64;
        progress(downloaded, total_size);
    }
    temp_file.flush().await?;
    drop(temp_file);

    if total_size > 0 && downloaded != total_size {
        let _ = fs::remove_file(&temp_path);
        return Err(DownloadError::Incomplete {
            got: downloaded,
            expected: total_size,
        });
    }

    fs::rename(&temp_path, &output_path)?;
    tracing::info!("Download complete: {:?}", output_path);
    Ok(output_path)
}

/// Get a human-readable size string
pub fn format_size(bytes: u64) -> String {
    let bytes = bytes as f64;
    if bytes < 1024.0 {
        format!("{} B", bytes as u64)
    } else if bytes < 1024.0 * 1024.0 {
        format!("{:.2} KB", bytes / 1024.0)
    } else if bytes < 1024.0 * 1024.0 * 1024.0 {
        format!("{:.2} MB", bytes / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes / (1024.0 * 1024.0 * 1024.0))
    }
}
