//! Persistent storage
//!
//! This module handles all data persistence: settings, the live job queue,
//! archived results and the cached-model set.

pub mod huggingface;
pub mod kv;
pub mod model_cache;
pub mod queue_store;
pub mod results;
pub mod settings;

use std::path::PathBuf;

use directories::ProjectDirs;
use thiserror::Error;

pub use kv::{FileStore, KeyValueStore, MemoryStore};

/// Environment variable overriding the data directory
pub const DATA_DIR_ENV: &str = "SCHOOLSHEET_DATA_DIR";

/// Errors raised by the persistence layer
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Could not determine data directory")]
    NoDataDir,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Directory holding settings, queue, results and downloaded models
pub fn get_data_dir() -> Result<PathBuf, StorageError> {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        if !dir.trim().is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }

    ProjectDirs::from("de", "schoolsheet", "Schoolsheet")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or(StorageError::NoDataDir)
}
