//! Scriptable in-process runtime for tests

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::inference::runtime::{
    ChatRequest, EngineHandle, InferenceRuntime, InitProgress, ProgressCallback, RuntimeError,
};
use crate::inference::streaming::{StreamToken, TokenStream};

/// One scripted completion
#[derive(Debug, Clone, Default)]
pub struct Reply {
    pub chunks: Vec<String>,
    pub final_text: Option<String>,
    pub error: Option<String>,
    /// Waited on after the first chunk
    pub hold: Option<Arc<Semaphore>>,
}

impl Reply {
    pub fn chunks(chunks: &[&str]) -> Self {
        Self {
            chunks: chunks.iter().map(|c| c.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn error(message: &str) -> Self {
        Self {
            error: Some(message.to_string()),
            ..Self::default()
        }
    }

    /// A reply that pauses after its first chunk until a permit is added
    pub fn held(chunks: &[&str]) -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        (
            Self {
                hold: Some(gate.clone()),
                ..Self::chunks(chunks)
            },
            gate,
        )
    }
}

#[derive(Default)]
struct MockState {
    failing: Mutex<HashSet<String>>,
    failing_reload: Mutex<HashSet<String>>,
    loaded: Mutex<Option<String>>,
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<ChatRequest>>,
    constructions: AtomicUsize,
    reloads: AtomicUsize,
    interrupts: AtomicUsize,
    no_reload: AtomicBool,
    construct_delay: Mutex<Duration>,
}

#[derive(Clone, Default)]
pub struct MockRuntime {
    state: Arc<MockState>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(self, model_ids: &[&str]) -> Self {
        self.break_models(model_ids);
        self
    }

    /// Every later load of these models fails
    pub fn break_models(&self, model_ids: &[&str]) {
        self.state
            .failing
            .lock()
            .unwrap()
            .extend(model_ids.iter().map(|id| id.to_string()));
    }

    /// In-place reloads to these models fail; fresh constructions still work
    pub fn failing_reload(self, model_ids: &[&str]) -> Self {
        self.state
            .failing_reload
            .lock()
            .unwrap()
            .extend(model_ids.iter().map(|id| id.to_string()));
        self
    }

    pub fn without_reload(self) -> Self {
        self.state.no_reload.store(true, Ordering::SeqCst);
        self
    }

    pub fn with_construct_delay(self, delay: Duration) -> Self {
        *self.state.construct_delay.lock().unwrap() = delay;
        self
    }

    pub fn heal(&self, model_id: &str) {
        self.state.failing.lock().unwrap().remove(model_id);
    }

    pub fn push_reply(&self, reply: Reply) {
        self.state.replies.lock().unwrap().push_back(reply);
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    /// Model currently held in memory
    pub fn loaded(&self) -> Option<String> {
        self.state.loaded.lock().unwrap().clone()
    }

    pub fn constructions(&self) -> usize {
        self.state.constructions.load(Ordering::SeqCst)
    }

    pub fn reloads(&self) -> usize {
        self.state.reloads.load(Ordering::SeqCst)
    }

    pub fn interrupts(&self) -> usize {
        self.state.interrupts.load(Ordering::SeqCst)
    }
}

impl MockState {
    /// Drops whatever was loaded before loading `model_id`
    async fn load(&self, model_id: &str, progress: &ProgressCallback) -> Result<(), RuntimeError> {
        *self.loaded.lock().unwrap() = None;
        progress(InitProgress::new(0.5, "Fetching shards"));
        let delay = *self.construct_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().unwrap().contains(model_id) {
            return Err(RuntimeError::ModelLoad(format!("{} is broken", model_id)));
        }
        progress(InitProgress::new(1.0, "Finished"));
        *self.loaded.lock().unwrap() = Some(model_id.to_string());
        Ok(())
    }
}

#[async_trait]
impl InferenceRuntime for MockRuntime {
    async fn create_engine(
        &self,
        model_id: &str,
        progress: ProgressCallback,
    ) -> Result<Arc<dyn EngineHandle>, RuntimeError> {
        self.state.constructions.fetch_add(1, Ordering::SeqCst);
        self.state.load(model_id, &progress).await?;
        Ok(Arc::new(MockHandle {
            state: self.state.clone(),
        }))
    }
}

struct MockHandle {
    state: Arc<MockState>,
}

#[async_trait]
impl EngineHandle for MockHandle {
    fn supports_reload(&self) -> bool {
        !self.state.no_reload.load(Ordering::SeqCst)
    }

    async fn reload(&self, model_id: &str, progress: ProgressCallback) -> Result<(), RuntimeError> {
        self.state.reloads.fetch_add(1, Ordering::SeqCst);
        if self.state.failing_reload.lock().unwrap().contains(model_id) {
            *self.state.loaded.lock().unwrap() = None;
            return Err(RuntimeError::ModelLoad(format!("{} does not fit", model_id)));
        }
        self.state.load(model_id, &progress).await
    }

    async fn complete_chat(&self, request: ChatRequest) -> Result<TokenStream, RuntimeError> {
        if self.state.loaded.lock().unwrap().is_none() {
            return Err(RuntimeError::Inference("No model loaded".to_string()));
        }
        self.state.requests.lock().unwrap().push(request);
        let reply = self
            .state
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Reply::chunks(&["# Arbeitsblatt\n", "Aufgabe 1"]));

        let (tx, stream) = TokenStream::channel();
        tokio::spawn(async move {
            if let Some(error) = reply.error {
                tx.send(StreamToken::Error(error));
                return;
            }
            for (i, chunk) in reply.chunks.into_iter().enumerate() {
                if i == 1 {
                    if let Some(hold) = &reply.hold {
                        if let Ok(permit) = hold.acquire().await {
                            permit.forget();
                        }
                    }
                }
                if tx.is_stopped() {
                    return;
                }
                tx.send(StreamToken::Token(chunk));
            }
            tx.send(StreamToken::Done(reply.final_text));
        });
        Ok(stream)
    }

    async fn interrupt(&self) {
        self.state.interrupts.fetch_add(1, Ordering::SeqCst);
    }
}
