//! Queue driver: claims the oldest pending job and runs it on the engine

use std::sync::{Arc, MutexGuard};

use crate::inference::{EngineError, GenerateRequest, GenerationOutput};
use crate::queue::prompt::{self, EMPTY_OUTPUT_MARKER, GENERIC_ERROR};
use crate::queue::GenerationQueue;
use crate::types::job::{GenerationJob, JobId, JobStatus, StoredResult};

impl GenerationQueue {
    /// Run the oldest `pending` job to completion.
    ///
    /// Returns `None` without doing anything while another job is running or
    /// the engine is busy, or when nothing is pending.
    pub async fn process_next(&self) -> Option<JobId> {
        if self.engine.is_generating() {
            return None;
        }

        let job = {
            let mut jobs = self.lock_jobs();
            if jobs.iter().any(|j| j.status == JobStatus::Running) {
                return None;
            }
            let bound_model = self
                .engine
                .active_model_id()
                .unwrap_or_else(|| self.engine.desired_model_id());
            let job = jobs.iter_mut().find(|j| j.status == JobStatus::Pending)?;
            job.status = JobStatus::Running;
            job.model_id = Some(bound_model);
            let claimed = job.clone();
            self.commit(&jobs);
            claimed
        };

        tracing::info!("Starting job {} ({})", job.id, job.topic.label);
        let outcome = self.execute(&job).await;
        self.settle(job.id, outcome);
        Some(job.id)
    }

    /// Process jobs until nothing is pending; returns the ids that ran, in order
    pub async fn drain(&self) -> Vec<JobId> {
        let mut processed = Vec::new();
        while let Some(id) = self.process_next().await {
            processed.push(id);
        }
        processed
    }

    /// Drive the queue forever, waking up on every enqueue and every engine
    /// state change
    pub async fn run(self: Arc<Self>) {
        let mut engine_updates = self.engine.subscribe();
        loop {
            engine_updates.borrow_and_update();
            self.drain().await;
            tokio::select! {
                _ = self.wakeup.notified() => {}
                changed = engine_updates.changed() => {
                    if changed.is_err() {
                        tracing::warn!("Engine snapshots closed, driver waits for enqueues only");
                        self.wakeup.notified().await;
                    }
                }
            }
        }
    }

    async fn execute(&self, job: &GenerationJob) -> Result<GenerationOutput, EngineError> {
        if let Some(hint) = job.model_hint.as_deref() {
            self.engine.initialize(Some(hint)).await?;
        }

        let request = GenerateRequest {
            messages: prompt::build_messages(job, self.catalog.as_ref()),
            ..GenerateRequest::default()
        };
        let mut generation = self.engine.generate_stream(request).await?;

        let model_id = generation.model_id().to_string();
        self.update_running(job.id, |j| j.model_id = Some(model_id));

        while let Some(chunk) = generation.next_chunk().await {
            let chunk = chunk?;
            if !self.append_output(job.id, &chunk) {
                tracing::debug!("Job {} is no longer running, dropping output", job.id);
                generation.stop();
                break;
            }
        }

        Ok(generation.finish())
    }

    /// Apply `f` if the job is still running, handing back the locked list
    fn modify_running(
        &self,
        id: JobId,
        f: impl FnOnce(&mut GenerationJob),
    ) -> Option<MutexGuard<'_, Vec<GenerationJob>>> {
        let mut jobs = self.lock_jobs();
        let job = jobs
            .iter_mut()
            .find(|j| j.id == id && j.status == JobStatus::Running)?;
        f(job);
        Some(jobs)
    }

    /// Apply and persist `f` if the job is still running; false otherwise
    fn update_running(&self, id: JobId, f: impl FnOnce(&mut GenerationJob)) -> bool {
        match self.modify_running(id, f) {
            Some(jobs) => {
                self.commit(&jobs);
                true
            }
            None => false,
        }
    }

    /// Publish a streamed chunk; the next transition writes it to storage
    fn append_output(&self, id: JobId, chunk: &str) -> bool {
        match self.modify_running(id, |j| j.output.push_str(chunk)) {
            Some(jobs) => {
                self.publish(&jobs);
                true
            }
            None => false,
        }
    }

    fn settle(&self, id: JobId, outcome: Result<GenerationOutput, EngineError>) {
        let mut archived = None;
        let settled = self.update_running(id, |job| match outcome {
            Ok(output) => {
                let text = if output.text.trim().is_empty() {
                    EMPTY_OUTPUT_MARKER.to_string()
                } else {
                    output.text
                };
                if text != EMPTY_OUTPUT_MARKER {
                    archived = Some(StoredResult::from_job(job, &output.model_id, &text));
                }
                job.status = JobStatus::Success;
                job.model_id = Some(output.model_id);
                job.output = text;
                job.error = None;
                tracing::info!("Job {} finished", id);
            }
            Err(e) => {
                let message = e.to_string();
                tracing::warn!("Job {} failed: {}", id, message);
                job.status = JobStatus::Error;
                job.error = Some(if message.trim().is_empty() {
                    GENERIC_ERROR.to_string()
                } else {
                    message
                });
            }
        });

        if !settled {
            tracing::debug!("Job {} was cancelled before it settled", id);
            return;
        }
        if let Some(result) = archived {
            self.results.append(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::inference::mock::{MockRuntime, Reply};
    use crate::queue::testing::*;
    use crate::queue::QueueError;
    use crate::storage::queue_store::QueueStore;
    use crate::storage::MemoryStore;
    use crate::system::capability::{CapabilityReport, StaticProbe};
    use crate::types::catalog::{sample_topic, Grade};

    #[tokio::test]
    async fn test_processes_job_and_archives_result() {
        let runtime = MockRuntime::new();
        runtime.push_reply(Reply::chunks(&["# Reime\n", "Aufgabe 1"]));
        let queue = queue(&runtime);
        let id = enqueue(&queue, "reime");

        assert_eq!(queue.process_next().await, Some(id));

        let job = queue.get(id).unwrap();
        assert_eq!(job.status, JobStatus::Success);
        assert_eq!(job.output, "# Reime\nAufgabe 1");
        assert_eq!(job.model_id.as_deref(), Some("default"));
        assert!(job.error.is_none());

        let stored = queue.results().get(id).unwrap();
        assert_eq!(stored.output, job.output);
        assert_eq!(stored.model_id, "default");
        assert_eq!(stored.created_at, job.created_at);

        let sent = runtime.requests();
        assert_eq!(sent[0].messages[0].content, prompt::SYSTEM_PROMPT);
        assert!(sent[0].messages[1].content.starts_with("Fach: Deutsch"));
    }

    #[tokio::test]
    async fn test_nothing_pending() {
        let queue = queue(&MockRuntime::new());
        assert_eq!(queue.process_next().await, None);
        assert!(queue.drain().await.is_empty());
    }

    #[tokio::test]
    async fn test_fifo_and_single_running_job() {
        let runtime = MockRuntime::new();
        let (reply, release) = Reply::held(&["A1", "A2"]);
        runtime.push_reply(reply);
        runtime.push_reply(Reply::chunks(&["B"]));
        let queue = queue(&runtime);
        let a = enqueue(&queue, "a");
        let b = enqueue(&queue, "b");

        let first = tokio::spawn({
            let queue = queue.clone();
            async move { queue.process_next().await }
        });
        wait_for(&queue, |jobs| jobs[0].output == "A1").await;

        // A is running: a second driver pass does nothing and B stays pending
        assert_eq!(queue.process_next().await, None);
        assert_eq!(queue.get(b).unwrap().status, JobStatus::Pending);
        assert_eq!(
            queue
                .jobs()
                .iter()
                .filter(|j| j.status == JobStatus::Running)
                .count(),
            1
        );

        release.add_permits(1);
        assert_eq!(first.await.unwrap(), Some(a));
        assert_eq!(queue.get(a).unwrap().status, JobStatus::Success);
        assert_eq!(queue.get(b).unwrap().status, JobStatus::Pending);

        assert_eq!(queue.process_next().await, Some(b));
        assert_eq!(queue.get(b).unwrap().output, "B");
    }

    #[tokio::test]
    async fn test_cancel_running_discards_late_chunks() {
        let runtime = MockRuntime::new();
        let (reply, release) = Reply::held(&["erster Teil", " zweiter Teil"]);
        runtime.push_reply(reply);
        let queue = queue(&runtime);
        let id = enqueue(&queue, "reime");

        let driver = tokio::spawn({
            let queue = queue.clone();
            async move { queue.process_next().await }
        });
        wait_for(&queue, |jobs| jobs[0].output == "erster Teil").await;

        queue.cancel(id).await.unwrap();
        assert_eq!(queue.get(id).unwrap().status, JobStatus::Cancelled);
        assert_eq!(runtime.interrupts(), 1);

        release.add_permits(1);
        driver.await.unwrap();

        let job = queue.get(id).unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.output, "erster Teil");
        assert!(queue.results().get(id).is_none());
        assert!(!queue.engine().is_generating());
    }

    #[tokio::test]
    async fn test_delete_running_is_rejected() {
        let runtime = MockRuntime::new();
        let (reply, release) = Reply::held(&["a", "b"]);
        runtime.push_reply(reply);
        let queue = queue(&runtime);
        let id = enqueue(&queue, "reime");

        let driver = tokio::spawn({
            let queue = queue.clone();
            async move { queue.process_next().await }
        });
        wait_for(&queue, |jobs| jobs[0].status == JobStatus::Running).await;

        assert_eq!(queue.delete(id).unwrap_err(), QueueError::JobActive(id));

        release.add_permits(1);
        driver.await.unwrap();
        assert!(queue.delete(id).is_ok());
    }

    #[tokio::test]
    async fn test_job_records_fallback_model() {
        let runtime = MockRuntime::new().failing(&["x"]);
        let queue = queue(&runtime);
        let id = queue.enqueue(
            sample_topic("reime"),
            Grade::Third,
            "deutsch",
            Some("x".to_string()),
            None,
        );

        queue.process_next().await;

        let job = queue.get(id).unwrap();
        assert_eq!(job.status, JobStatus::Success);
        assert_eq!(job.model_id.as_deref(), Some("default"));
        assert_eq!(queue.engine().active_model_id().as_deref(), Some("default"));
        assert_eq!(queue.results().get(id).unwrap().model_id, "default");
    }

    #[tokio::test]
    async fn test_model_hint_switches_engine() {
        let runtime = MockRuntime::new();
        let queue = queue(&runtime);
        let id = queue.enqueue(
            sample_topic("reime"),
            Grade::Second,
            "deutsch",
            Some("fallback".to_string()),
            None,
        );

        queue.process_next().await;
        assert_eq!(queue.get(id).unwrap().model_id.as_deref(), Some("fallback"));
        assert_eq!(queue.engine().desired_model_id(), "fallback");
    }

    #[tokio::test]
    async fn test_empty_output_gets_marker_and_is_not_archived() {
        let runtime = MockRuntime::new();
        runtime.push_reply(Reply::chunks(&[]));
        let queue = queue(&runtime);
        let id = enqueue(&queue, "reime");

        queue.process_next().await;

        let job = queue.get(id).unwrap();
        assert_eq!(job.status, JobStatus::Success);
        assert_eq!(job.output, EMPTY_OUTPUT_MARKER);
        assert!(queue.results().list_recent(50).is_empty());
    }

    #[tokio::test]
    async fn test_generation_error_marks_job() {
        let runtime = MockRuntime::new();
        runtime.push_reply(Reply::error("Kontext zu lang"));
        let queue = queue(&runtime);
        let failing = enqueue(&queue, "a");
        let next = enqueue(&queue, "b");

        assert_eq!(queue.drain().await, vec![failing, next]);

        let job = queue.get(failing).unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.error.as_deref(), Some("Generation failed: Kontext zu lang"));
        assert!(queue.results().get(failing).is_none());

        // A per-job failure leaves the engine usable
        assert_eq!(queue.get(next).unwrap().status, JobStatus::Success);
    }

    #[tokio::test]
    async fn test_unsupported_hardware_fails_job() {
        let runtime = MockRuntime::new();
        let queue = queue(&runtime);
        queue
            .engine()
            .detect_capability(&StaticProbe(CapabilityReport::unsupported("Keine GPU")));
        let id = enqueue(&queue, "reime");

        queue.process_next().await;

        let job = queue.get(id).unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.error.as_deref(), Some("Keine GPU"));
        assert_eq!(runtime.constructions(), 0);
    }

    #[tokio::test]
    async fn test_run_loop_picks_up_new_jobs() {
        let runtime = MockRuntime::new();
        let queue = queue(&runtime);
        let driver = tokio::spawn(queue.clone().run());

        let a = enqueue(&queue, "a");
        let b = enqueue(&queue, "b");
        wait_for(&queue, |jobs| {
            jobs.iter().all(|j| j.status == JobStatus::Success)
        })
        .await;

        let results = queue.results().list_recent(10);
        assert_eq!(results.len(), 2);
        // Newest first
        assert_eq!(results[0].id, b);
        assert_eq!(results[1].id, a);
        driver.abort();
    }

    #[tokio::test]
    async fn test_run_loop_resumes_when_engine_goes_idle() {
        let runtime = MockRuntime::new();
        let (reply, release) = Reply::held(&["fremd", "er Text"]);
        runtime.push_reply(reply);
        let queue = queue(&runtime);

        // A generation started outside the queue keeps the engine busy
        let mut outside = queue
            .engine()
            .generate_stream(GenerateRequest::default())
            .await
            .unwrap();
        assert!(queue.engine().is_generating());

        let driver = tokio::spawn(queue.clone().run());
        let id = enqueue(&queue, "reime");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.get(id).unwrap().status, JobStatus::Pending);

        release.add_permits(1);
        while let Some(chunk) = outside.next_chunk().await {
            chunk.unwrap();
        }
        drop(outside);

        // No further enqueue: the idle engine alone wakes the driver
        wait_for(&queue, |jobs| jobs[0].status == JobStatus::Success).await;
        assert_eq!(queue.get(id).unwrap().output, "# Arbeitsblatt\nAufgabe 1");
        driver.abort();
    }

    #[tokio::test]
    async fn test_streamed_output_is_saved_with_the_settled_job() {
        let runtime = MockRuntime::new();
        let store = Arc::new(MemoryStore::new());
        let (reply, release) = Reply::held(&["halb", " fertig"]);
        runtime.push_reply(reply);
        let queue = queue_with(&runtime, store.clone());
        let saved = QueueStore::new(store);
        let id = enqueue(&queue, "reime");

        let driver = tokio::spawn({
            let queue = queue.clone();
            async move { queue.process_next().await }
        });
        wait_for(&queue, |jobs| jobs[0].output == "halb").await;

        let on_disk = saved.load_queue();
        assert_eq!(on_disk[0].status, JobStatus::Running);
        assert!(on_disk[0].output.is_empty());

        release.add_permits(1);
        assert_eq!(driver.await.unwrap(), Some(id));

        let on_disk = saved.load_queue();
        assert_eq!(on_disk[0].status, JobStatus::Success);
        assert_eq!(on_disk[0].output, "halb fertig");
    }

    #[tokio::test]
    async fn test_restart_requeues_and_finishes_interrupted_job() {
        let runtime = MockRuntime::new();
        let store = Arc::new(MemoryStore::new());
        let (reply, _held) = Reply::held(&["halb", "fertig"]);
        runtime.push_reply(reply);

        let id = {
            let queue = queue_with(&runtime, store.clone());
            let id = enqueue(&queue, "reime");
            let driver = tokio::spawn({
                let queue = queue.clone();
                async move { queue.process_next().await }
            });
            wait_for(&queue, |jobs| jobs[0].output == "halb").await;
            driver.abort();
            tokio::time::sleep(Duration::from_millis(10)).await;
            id
        };

        let queue = queue_with(&runtime, store);
        assert_eq!(queue.get(id).unwrap().status, JobStatus::Pending);

        // The re-queued job keeps its place ahead of newer work
        let newer = enqueue(&queue, "neu");
        assert_eq!(queue.drain().await, vec![id, newer]);
        assert_eq!(queue.get(id).unwrap().status, JobStatus::Success);
        assert_eq!(queue.get(newer).unwrap().status, JobStatus::Success);
    }
}
