//! Cached model bookkeeping
//!
//! Persists the set of model ids that finished initializing on this device.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::storage::kv::{write_json, KeyValueStore};

/// Storage key of the cached-model set
pub const MODEL_CACHED_KEY: &str = "schoolsheet-atelier-model-cached";

/// Persistence façade for the cached-model set
#[derive(Clone)]
pub struct ModelCacheStore {
    store: Arc<dyn KeyValueStore>,
    default_model_id: String,
}

impl ModelCacheStore {
    pub fn new(store: Arc<dyn KeyValueStore>, default_model_id: impl Into<String>) -> Self {
        Self {
            store,
            default_model_id: default_model_id.into(),
        }
    }

    /// Load the cached set; unreadable data yields an empty set.
    ///
    /// A bare `true` is the legacy single-flag format and means the default
    /// model is cached.
    pub fn load(&self) -> BTreeSet<String> {
        let raw = match self.store.get(MODEL_CACHED_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return BTreeSet::new(),
            Err(e) => {
                tracing::warn!("Failed to read cached model list: {}", e);
                return BTreeSet::new();
            }
        };

        if raw.trim() == "true" {
            return BTreeSet::from([self.default_model_id.clone()]);
        }

        match serde_json::from_str::<Vec<serde_json::Value>>(&raw) {
            Ok(items) => items
                .into_iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect(),
            Err(e) => {
                tracing::warn!("Unable to parse cached model list: {}", e);
                BTreeSet::new()
            }
        }
    }

    /// Persist the cached set. Failures are logged, never propagated.
    pub fn save(&self, models: &BTreeSet<String>) {
        if let Err(e) = write_json(self.store.as_ref(), MODEL_CACHED_KEY, models) {
            tracing::warn!("Unable to persist cached model list: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::kv::BrokenStore;
    use crate::storage::MemoryStore;

    fn cache() -> (Arc<MemoryStore>, ModelCacheStore) {
        let store = Arc::new(MemoryStore::new());
        let cache = ModelCacheStore::new(store.clone(), "default-model");
        (store, cache)
    }

    #[test]
    fn test_empty_when_missing() {
        let (_, cache) = cache();
        assert!(cache.load().is_empty());
    }

    #[test]
    fn test_legacy_true_flag_means_default_model() {
        let (store, cache) = cache();
        store.set(MODEL_CACHED_KEY, "true").unwrap();
        assert_eq!(cache.load(), BTreeSet::from(["default-model".to_string()]));
    }

    #[test]
    fn test_non_string_entries_are_skipped() {
        let (store, cache) = cache();
        store.set(MODEL_CACHED_KEY, r#"["a", 3, null, "b"]"#).unwrap();
        assert_eq!(
            cache.load(),
            BTreeSet::from(["a".to_string(), "b".to_string()])
        );
    }

    #[test]
    fn test_save_then_load() {
        let (_, cache) = cache();
        let set = BTreeSet::from(["x".to_string(), "y".to_string()]);
        cache.save(&set);
        assert_eq!(cache.load(), set);
    }

    #[test]
    fn test_broken_storage_is_not_fatal() {
        let cache = ModelCacheStore::new(Arc::new(BrokenStore), "d");
        cache.save(&BTreeSet::from(["x".to_string()]));
        assert!(cache.load().is_empty());
    }
}
