//! Configuration types
//!
//! Engine configuration, derived from the persisted settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::model::{DEFAULT_MODEL_ID, FALLBACK_MODEL_ID};

/// Temperature used for worksheet generation
pub const DEFAULT_TEMPERATURE: f32 = 0.4;

/// Maximum tokens generated per worksheet
pub const DEFAULT_MAX_TOKENS: u32 = 2048;

/// Engine lifecycle configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Model loaded when nothing was requested explicitly
    pub default_model_id: String,
    /// Last model of the fallback chain
    pub fallback_model_id: String,
    /// Sampling temperature when a request does not set one
    pub temperature: f32,
    /// Token limit when a request does not set one
    pub max_tokens: u32,
    /// How long a completed progress snapshot stays visible
    pub progress_clear_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_model_id: DEFAULT_MODEL_ID.to_string(),
            fallback_model_id: FALLBACK_MODEL_ID.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            progress_clear_delay: Duration::from_millis(1200),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.default_model_id, DEFAULT_MODEL_ID);
        assert_eq!(config.fallback_model_id, FALLBACK_MODEL_ID);
        assert_eq!(config.max_tokens, 2048);
        assert_eq!(config.progress_clear_delay, Duration::from_millis(1200));
    }
}
