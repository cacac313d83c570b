//! Generation queue
//!
//! Ordered list of worksheet jobs, drained one at a time against the shared
//! engine. Every mutation replaces the published snapshot and re-persists the
//! whole list.

mod driver;
pub mod prompt;

use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{watch, Notify};

use crate::inference::EngineManager;
use crate::storage::queue_store::QueueStore;
use crate::storage::results::ResultStore;
use crate::types::catalog::{Grade, SubjectCatalog, Topic};
use crate::types::job::{GenerationJob, JobId, JobStatus};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Job {0} is still pending or running")]
    JobActive(JobId),
}

/// Job counts for status displays
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueSummary {
    /// `pending` + `running`
    pub active: usize,
    /// `success`
    pub completed: usize,
}

pub struct GenerationQueue {
    engine: Arc<EngineManager>,
    catalog: Arc<dyn SubjectCatalog>,
    store: QueueStore,
    results: ResultStore,
    jobs: Mutex<Vec<GenerationJob>>,
    snapshot_tx: watch::Sender<Vec<GenerationJob>>,
    wakeup: Notify,
}

impl GenerationQueue {
    /// Create the queue and rehydrate it from storage.
    ///
    /// A job persisted as `running` was interrupted by a restart; it goes back
    /// to `pending` at its original position with its partial output dropped.
    pub fn new(
        engine: Arc<EngineManager>,
        catalog: Arc<dyn SubjectCatalog>,
        store: QueueStore,
        results: ResultStore,
    ) -> Arc<Self> {
        let mut jobs = store.load_queue();
        let mut requeued = 0;
        for job in jobs.iter_mut().filter(|j| j.status == JobStatus::Running) {
            job.status = JobStatus::Pending;
            job.output.clear();
            job.model_id = None;
            requeued += 1;
        }
        if requeued > 0 {
            tracing::info!("Re-queued {} interrupted job(s)", requeued);
            store.save_queue(&jobs);
        }
        tracing::debug!("Restored queue with {} job(s)", jobs.len());

        let (snapshot_tx, _) = watch::channel(jobs.clone());
        Arc::new(Self {
            engine,
            catalog,
            store,
            results,
            jobs: Mutex::new(jobs),
            snapshot_tx,
            wakeup: Notify::new(),
        })
    }

    fn lock_jobs(&self) -> MutexGuard<'_, Vec<GenerationJob>> {
        self.jobs.lock().expect("queue mutex poisoned")
    }

    /// Persist and publish the current list
    fn commit(&self, jobs: &[GenerationJob]) {
        self.store.save_queue(jobs);
        self.publish(jobs);
    }

    fn publish(&self, jobs: &[GenerationJob]) {
        self.snapshot_tx.send_replace(jobs.to_vec());
    }

    pub fn engine(&self) -> &Arc<EngineManager> {
        &self.engine
    }

    pub fn results(&self) -> &ResultStore {
        &self.results
    }

    /// Append a `pending` job; the driver picks it up later
    pub fn enqueue(
        &self,
        topic: Topic,
        grade: Grade,
        subject_id: impl Into<String>,
        model_hint: Option<String>,
        specific_prompt: Option<String>,
    ) -> JobId {
        let job = GenerationJob::new(topic, grade, subject_id, model_hint, specific_prompt);
        let id = job.id;
        tracing::info!(
            "Enqueued job {} ({}, Klasse {})",
            id,
            job.topic.label,
            job.grade
        );

        {
            let mut jobs = self.lock_jobs();
            jobs.push(job);
            self.commit(&jobs);
        }
        self.wakeup.notify_one();
        id
    }

    /// Cancel a job. A running job's generation is interrupted first; its
    /// late output is discarded. Terminal jobs are left untouched.
    pub async fn cancel(&self, id: JobId) -> Result<(), QueueError> {
        let status = self.get(id).ok_or(QueueError::NotFound(id))?.status;

        if status == JobStatus::Running {
            self.engine.cancel().await;
        }

        let mut jobs = self.lock_jobs();
        let job = jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or(QueueError::NotFound(id))?;
        if job.status.is_terminal() {
            tracing::debug!("Job {} already {:?}, not cancelling", id, job.status);
            return Ok(());
        }
        job.status = JobStatus::Cancelled;
        tracing::info!("Cancelled job {}", id);
        self.commit(&jobs);
        Ok(())
    }

    /// Remove a finished job together with its archived result
    pub fn delete(&self, id: JobId) -> Result<GenerationJob, QueueError> {
        let removed = {
            let mut jobs = self.lock_jobs();
            let index = jobs
                .iter()
                .position(|j| j.id == id)
                .ok_or(QueueError::NotFound(id))?;
            if jobs[index].status.is_active() {
                return Err(QueueError::JobActive(id));
            }
            let removed = jobs.remove(index);
            self.commit(&jobs);
            removed
        };

        self.results.remove(id);
        tracing::info!("Deleted job {}", id);
        Ok(removed)
    }

    pub fn jobs(&self) -> Vec<GenerationJob> {
        self.lock_jobs().clone()
    }

    pub fn get(&self, id: JobId) -> Option<GenerationJob> {
        self.lock_jobs().iter().find(|j| j.id == id).cloned()
    }

    /// Most recently created job
    pub fn latest(&self) -> Option<GenerationJob> {
        self.lock_jobs().iter().max_by_key(|j| j.created_at).cloned()
    }

    pub fn summary(&self) -> QueueSummary {
        let jobs = self.lock_jobs();
        QueueSummary {
            active: jobs.iter().filter(|j| j.status.is_active()).count(),
            completed: jobs
                .iter()
                .filter(|j| j.status == JobStatus::Success)
                .count(),
        }
    }

    /// Subscribe to job list replacements
    pub fn subscribe(&self) -> watch::Receiver<Vec<GenerationJob>> {
        self.snapshot_tx.subscribe()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::inference::mock::MockRuntime;
    use crate::storage::MemoryStore;
    use crate::types::catalog::sample_topic;

    #[tokio::test]
    async fn test_enqueue_appends_pending_job_and_persists() {
        let runtime = MockRuntime::new();
        let store = Arc::new(MemoryStore::new());
        let queue = queue_with(&runtime, store.clone());

        let id = enqueue(&queue, "reime");
        let job = queue.get(id).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.model_id.is_none());
        assert!(job.output.is_empty());

        let persisted = QueueStore::new(store).load_queue();
        assert_eq!(persisted, queue.jobs());
        assert!(runtime.requests().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_pending_skips_running() {
        let runtime = MockRuntime::new();
        let queue = queue(&runtime);
        let id = enqueue(&queue, "reime");

        queue.cancel(id).await.unwrap();
        assert_eq!(queue.get(id).unwrap().status, JobStatus::Cancelled);

        assert_eq!(queue.process_next().await, None);
        assert!(runtime.requests().is_empty());
        assert_eq!(runtime.interrupts(), 0);
    }

    #[tokio::test]
    async fn test_cancel_unknown_job() {
        let queue = queue(&MockRuntime::new());
        let id = uuid::Uuid::new_v4();
        assert_eq!(queue.cancel(id).await, Err(QueueError::NotFound(id)));
        assert_eq!(queue.delete(id).unwrap_err(), QueueError::NotFound(id));
    }

    #[tokio::test]
    async fn test_cancel_terminal_job_is_a_no_op() {
        let runtime = MockRuntime::new();
        let queue = queue(&runtime);
        let id = enqueue(&queue, "reime");
        queue.process_next().await;

        queue.cancel(id).await.unwrap();
        assert_eq!(queue.get(id).unwrap().status, JobStatus::Success);
    }

    #[tokio::test]
    async fn test_delete_pending_is_rejected() {
        let queue = queue(&MockRuntime::new());
        let id = enqueue(&queue, "reime");
        assert_eq!(queue.delete(id).unwrap_err(), QueueError::JobActive(id));
        assert!(queue.get(id).is_some());
    }

    #[tokio::test]
    async fn test_delete_after_success_removes_job_and_result() {
        let runtime = MockRuntime::new();
        let queue = queue(&runtime);
        let id = enqueue(&queue, "reime");
        queue.process_next().await;
        assert!(queue.results().get(id).is_some());

        let removed = queue.delete(id).unwrap();
        assert_eq!(removed.id, id);
        assert!(queue.get(id).is_none());
        assert!(queue.results().get(id).is_none());
    }

    #[tokio::test]
    async fn test_rehydrated_running_job_is_pending_again() {
        let store = Arc::new(MemoryStore::new());
        let mut first = GenerationJob::new(sample_topic("a"), Grade::Second, "deutsch", None, None);
        first.status = JobStatus::Success;
        first.output = "fertig".to_string();
        let mut interrupted =
            GenerationJob::new(sample_topic("b"), Grade::Third, "deutsch", None, None);
        interrupted.status = JobStatus::Running;
        interrupted.output = "halb".to_string();
        interrupted.model_id = Some("default".to_string());
        QueueStore::new(store.clone()).save_queue(&[first.clone(), interrupted.clone()]);

        let queue = queue_with(&MockRuntime::new(), store.clone());
        let jobs = queue.jobs();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0], first);
        assert_eq!(jobs[1].id, interrupted.id);
        assert_eq!(jobs[1].status, JobStatus::Pending);
        assert!(jobs[1].output.is_empty());
        assert!(jobs[1].model_id.is_none());

        // The demotion is persisted right away
        let persisted = QueueStore::new(store).load_queue();
        assert!(persisted.iter().all(|j| j.status != JobStatus::Running));
    }

    #[tokio::test]
    async fn test_summary_and_latest() {
        let runtime = MockRuntime::new();
        let queue = queue(&runtime);
        assert_eq!(queue.summary(), QueueSummary::default());
        assert!(queue.latest().is_none());

        let first = enqueue(&queue, "a");
        queue.process_next().await;
        let second = enqueue(&queue, "b");

        assert_eq!(
            queue.summary(),
            QueueSummary {
                active: 1,
                completed: 1
            }
        );
        let latest = queue.latest().unwrap();
        assert_eq!(latest.id, second);
        assert_ne!(latest.id, first);
    }

    #[tokio::test]
    async fn test_subscribers_see_enqueued_jobs() {
        let queue = queue(&MockRuntime::new());
        let rx = queue.subscribe();
        let id = enqueue(&queue, "reime");
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow()[0].id, id);
    }
}
