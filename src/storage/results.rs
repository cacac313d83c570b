//! Result history
//!
//! Completed worksheets, newest first, capped to a fixed number of entries.

use std::sync::Arc;

use crate::storage::kv::{read_json, write_json, KeyValueStore};
use crate::types::job::{JobId, StoredResult};

/// Storage key of the result history
pub const RESULTS_KEY: &str = "school-sheet-results";

/// Number of results kept by default
pub const DEFAULT_RESULT_LIMIT: usize = 50;

/// Persistence façade for archived results
#[derive(Clone)]
pub struct ResultStore {
    store: Arc<dyn KeyValueStore>,
    limit: usize,
}

impl ResultStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_limit(store, DEFAULT_RESULT_LIMIT)
    }

    pub fn with_limit(store: Arc<dyn KeyValueStore>, limit: usize) -> Self {
        Self {
            store,
            limit: limit.max(1),
        }
    }

    fn load_all(&self) -> Vec<StoredResult> {
        read_json(self.store.as_ref(), RESULTS_KEY).unwrap_or_default()
    }

    fn save_all(&self, results: &[StoredResult]) {
        if let Err(e) = write_json(self.store.as_ref(), RESULTS_KEY, results) {
            tracing::warn!("Failed to save results: {}", e);
        }
    }

    /// Prepend a result, evicting the oldest entries beyond the cap
    pub fn append(&self, result: StoredResult) {
        let mut results = self.load_all();
        results.retain(|r| r.id != result.id);
        results.insert(0, result);
        results.truncate(self.limit);
        self.save_all(&results);
    }

    /// Remove the result with this id, if any
    pub fn remove(&self, id: JobId) {
        let mut results = self.load_all();
        let before = results.len();
        results.retain(|r| r.id != id);
        if results.len() != before {
            self.save_all(&results);
        }
    }

    /// Most recent results, newest first
    pub fn list_recent(&self, limit: usize) -> Vec<StoredResult> {
        let mut results = self.load_all();
        results.truncate(limit);
        results
    }

    pub fn get(&self, id: JobId) -> Option<StoredResult> {
        self.load_all().into_iter().find(|r| r.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::kv::BrokenStore;
    use crate::storage::MemoryStore;
    use crate::types::catalog::{sample_topic, Grade};
    use crate::types::job::GenerationJob;

    fn result(n: usize) -> StoredResult {
        let job = GenerationJob::new(sample_topic(&n.to_string()), Grade::Third, "deutsch", None, None);
        StoredResult::from_job(&job, "m", &format!("# Blatt {}", n))
    }

    #[test]
    fn test_append_keeps_newest_first_and_caps() {
        let store = ResultStore::with_limit(Arc::new(MemoryStore::new()), 3);
        let results: Vec<_> = (0..5).map(result).collect();
        for r in &results {
            store.append(r.clone());
        }

        let recent = store.list_recent(DEFAULT_RESULT_LIMIT);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].id, results[4].id);
        assert_eq!(recent[2].id, results[2].id);
    }

    #[test]
    fn test_default_cap_is_fifty() {
        let store = ResultStore::new(Arc::new(MemoryStore::new()));
        for n in 0..55 {
            store.append(result(n));
        }
        assert_eq!(store.list_recent(100).len(), 50);
    }

    #[test]
    fn test_remove() {
        let store = ResultStore::new(Arc::new(MemoryStore::new()));
        let a = result(1);
        let b = result(2);
        store.append(a.clone());
        store.append(b.clone());

        store.remove(a.id);
        assert!(store.get(a.id).is_none());
        assert!(store.get(b.id).is_some());
    }

    #[test]
    fn test_malformed_history_reads_as_empty() {
        let kv = Arc::new(MemoryStore::new());
        kv.set(RESULTS_KEY, "oops").unwrap();
        let store = ResultStore::new(kv);
        assert!(store.list_recent(50).is_empty());

        store.append(result(1));
        assert_eq!(store.list_recent(50).len(), 1);
    }

    #[test]
    fn test_broken_storage_is_not_fatal() {
        let store = ResultStore::new(Arc::new(BrokenStore));
        store.append(result(1));
        store.remove(result(2).id);
        assert!(store.list_recent(50).is_empty());
    }
}
