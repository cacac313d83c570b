//! Queue persistence
//!
//! Saves and restores the live job list, independently of the result history.

use std::sync::Arc;

use crate::storage::kv::{read_json, write_json, KeyValueStore};
use crate::types::job::GenerationJob;

/// Storage key of the live queue
pub const QUEUE_KEY: &str = "school-sheet-queue";

#[derive(Clone)]
pub struct QueueStore {
    store: Arc<dyn KeyValueStore>,
}

impl QueueStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Persist every job regardless of status
    pub fn save_queue(&self, jobs: &[GenerationJob]) {
        if let Err(e) = write_json(self.store.as_ref(), QUEUE_KEY, jobs) {
            tracing::warn!("Failed to save queue: {}", e);
        }
    }

    /// Load the queue verbatim; missing or malformed data yields an empty queue
    pub fn load_queue(&self) -> Vec<GenerationJob> {
        read_json(self.store.as_ref(), QUEUE_KEY).unwrap_or_default()
    }
}
