//! Model types
//!
//! Static catalog of the model variants the engine knows how to load.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use serde::Serialize;

/// Default model requested when nothing else was asked for
pub const DEFAULT_MODEL_ID: &str = "llama-3.2-3b-instruct-q4_k_m";

/// Smaller model tried last when the requested and default models fail
pub const FALLBACK_MODEL_ID: &str = "llama-3.2-1b-instruct-q4_k_m";

/// A loadable model variant
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelDescriptor {
    /// Unique model identifier
    pub id: &'static str,
    /// Display name for the UI
    pub label: &'static str,
    /// Approximate artifact size, for display only
    pub download_size_label: &'static str,
    /// Context window in tokens
    pub context_window_tokens: u32,
    /// Hardware features the model needs to run accelerated
    pub required_features: &'static [&'static str],
    /// HuggingFace location of the GGUF artifact (`owner/repo/file.gguf`)
    pub source: &'static str,
}

static MODEL_CATALOG: &[ModelDescriptor] = &[
    ModelDescriptor {
        id: DEFAULT_MODEL_ID,
        label: "Llama 3.2 3B Instruct",
        download_size_label: "~2.0 GB",
        context_window_tokens: 131072,
        required_features: &["f16"],
        source: "bartowski/Llama-3.2-3B-Instruct-GGUF/Llama-3.2-3B-Instruct-Q4_K_M.gguf",
    },
    ModelDescriptor {
        id: FALLBACK_MODEL_ID,
        label: "Llama 3.2 1B Instruct",
        download_size_label: "~0.8 GB",
        context_window_tokens: 131072,
        required_features: &[],
        source: "bartowski/Llama-3.2-1B-Instruct-GGUF/Llama-3.2-1B-Instruct-Q4_K_M.gguf",
    },
    ModelDescriptor {
        id: "qwen2.5-3b-instruct-q4_k_m",
        label: "Qwen 2.5 3B Instruct",
        download_size_label: "~2.1 GB",
        context_window_tokens: 32768,
        required_features: &["f16"],
        source: "Qwen/Qwen2.5-3B-Instruct-GGUF/qwen2.5-3b-instruct-q4_k_m.gguf",
    },
];

static MODEL_INDEX: Lazy<HashMap<&'static str, &'static ModelDescriptor>> =
    Lazy::new(|| MODEL_CATALOG.iter().map(|m| (m.id, m)).collect());

/// All known model variants, in display order
pub fn model_catalog() -> &'static [ModelDescriptor] {
    MODEL_CATALOG
}

/// Look up a model descriptor by id
pub fn find_model(id: &str) -> Option<&'static ModelDescriptor> {
    MODEL_INDEX.get(id).copied()
}

/// Human label for a model id, falling back to the id itself
pub fn model_label(id: &str) -> &str {
    find_model(id).map(|m| m.label).unwrap_or(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_ids_are_unique() {
        let catalog = model_catalog();
        assert_eq!(MODEL_INDEX.len(), catalog.len());
    }

    #[test]
    fn test_default_and_fallback_are_cataloged() {
        assert!(find_model(DEFAULT_MODEL_ID).is_some());
        assert!(find_model(FALLBACK_MODEL_ID).is_some());
        assert_ne!(DEFAULT_MODEL_ID, FALLBACK_MODEL_ID);
    }

    #[test]
    fn test_label_falls_back_to_id() {
        assert_eq!(model_label(FALLBACK_MODEL_ID), "Llama 3.2 1B Instruct");
        assert_eq!(model_label("custom-model"), "custom-model");
    }
}
