//! Settings storage
//!
//! Manages persistence of user preferences and engine settings.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::storage::{get_data_dir, StorageError};
use crate::types::config::{EngineConfig, DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE};
use crate::types::model::{find_model, DEFAULT_MODEL_ID, FALLBACK_MODEL_ID};

/// Environment override for the default model id
pub const MODEL_ID_ENV: &str = "SCHOOLSHEET_MODEL_ID";

/// Environment override for the fallback model id
pub const FALLBACK_MODEL_ID_ENV: &str = "SCHOOLSHEET_FALLBACK_MODEL_ID";

/// Application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AtelierSettings {
    /// Model loaded when the user has not picked one
    pub default_model_id: String,
    /// Smaller model tried when everything else fails
    pub fallback_model_id: String,
    /// Temperature parameter for text generation (0.0 - 2.0)
    pub temperature: f32,
    /// Maximum number of tokens to generate
    pub max_tokens: u32,
    /// Context window size
    pub context_size: u32,
    /// Number of GPU layers to offload (0 = CPU only)
    pub gpu_layers: u32,
    /// Accept machines without a usable GPU
    #[serde(default)]
    pub allow_cpu_inference: bool,
    /// Directory where model files (.gguf) are stored
    pub models_directory: PathBuf,
    /// Delay before a finished progress bar disappears
    #[serde(default = "default_progress_clear_delay_ms")]
    pub progress_clear_delay_ms: u64,
    /// Number of archived worksheets kept
    #[serde(default = "default_result_history_limit")]
    pub result_history_limit: usize,
}

fn default_progress_clear_delay_ms() -> u64 {
    1200
}

fn default_result_history_limit() -> usize {
    crate::storage::results::DEFAULT_RESULT_LIMIT
}

impl Default for AtelierSettings {
    fn default() -> Self {
        Self {
            default_model_id: DEFAULT_MODEL_ID.to_string(),
            fallback_model_id: FALLBACK_MODEL_ID.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            context_size: 8192,
            gpu_layers: 99, // Offload all layers to GPU by default
            allow_cpu_inference: false,
            models_directory: get_data_dir()
                .ok()
                .map(|d| d.join("models"))
                .unwrap_or_else(|| PathBuf::from("./models")),
            progress_clear_delay_ms: default_progress_clear_delay_ms(),
            result_history_limit: default_result_history_limit(),
        }
    }
}

impl AtelierSettings {
    /// Validate settings values
    ///
    /// Ensures all parameters are within acceptable ranges.
    pub fn validate(&mut self) {
        self.temperature = self.temperature.clamp(0.0, 2.0);

        // Valid context sizes
        let valid_context_sizes = [2048, 4096, 8192, 16384, 32768, 65536, 131072];
        if !valid_context_sizes.contains(&self.context_size) {
            self.context_size = *valid_context_sizes
                .iter()
                .min_by_key(|&&size| (size as i64 - self.context_size as i64).abs())
                .unwrap_or(&8192);
        }

        // Cap max_tokens to context_size (can't generate more than context allows)
        self.max_tokens = self.max_tokens.clamp(1, 65536);
        if self.max_tokens > self.context_size {
            self.max_tokens = self.context_size / 2;
        }

        if self.default_model_id.trim().is_empty() {
            self.default_model_id = DEFAULT_MODEL_ID.to_string();
        }
        if self.fallback_model_id.trim().is_empty() {
            self.fallback_model_id = FALLBACK_MODEL_ID.to_string();
        }
        for id in [&self.default_model_id, &self.fallback_model_id] {
            if find_model(id).is_none() {
                tracing::warn!("Model '{}' is not in the built-in catalog", id);
            }
        }

        self.progress_clear_delay_ms = self.progress_clear_delay_ms.min(60_000);
        self.result_history_limit = self.result_history_limit.clamp(1, 500);
    }

    /// Apply `SCHOOLSHEET_MODEL_ID` / `SCHOOLSHEET_FALLBACK_MODEL_ID`
    pub fn apply_env_overrides(&mut self) {
        if let Ok(id) = std::env::var(MODEL_ID_ENV) {
            if !id.trim().is_empty() {
                self.default_model_id = id.trim().to_string();
            }
        }
        if let Ok(id) = std::env::var(FALLBACK_MODEL_ID_ENV) {
            if !id.trim().is_empty() {
                self.fallback_model_id = id.trim().to_string();
            }
        }
    }

    /// Engine configuration derived from these settings
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            default_model_id: self.default_model_id.clone(),
            fallback_model_id: self.fallback_model_id.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            progress_clear_delay: Duration::from_millis(self.progress_clear_delay_ms),
        }
    }
}

/// Get the settings file path
fn get_settings_path() -> Result<PathBuf, StorageError> {
    Ok(get_data_dir()?.join("settings.json"))
}

/// Load settings from disk
///
/// Returns default settings if the file doesn't exist or is corrupted
pub fn load_settings() -> AtelierSettings {
    let mut settings = match load_settings_internal() {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            AtelierSettings::default()
        }
    };
    settings.apply_env_overrides();
    settings.validate();
    settings
}

/// Internal settings loading with error propagation
fn load_settings_internal() -> Result<AtelierSettings, StorageError> {
    let path = get_settings_path()?;

    if !path.exists() {
        tracing::info!("Settings file not found, using defaults");
        return Ok(AtelierSettings::default());
    }

    let json = fs::read_to_string(&path)?;
    let settings: AtelierSettings = serde_json::from_str(&json)?;

    tracing::debug!("Loaded settings from disk");
    Ok(settings)
}

/// Save settings to disk
pub fn save_settings(settings: &AtelierSettings) -> Result<(), StorageError> {
    let path = get_settings_path()?;

    // Ensure the parent directory exists
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json)?;

    tracing::debug!("Saved settings to disk");
    Ok(())
}
