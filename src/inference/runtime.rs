//! Inference runtime seam
//!
//! The engine manager talks to the model runtime only through these traits.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::inference::streaming::TokenStream;
use crate::types::message::ChatMessage;

/// Errors reported by an inference runtime
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("Download failed: {0}")]
    Download(String),

    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("In-place reload not supported")]
    ReloadUnsupported,

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Worker thread error: {0}")]
    Worker(String),
}

/// Initialization progress as reported by the runtime
#[derive(Debug, Clone, PartialEq)]
pub struct InitProgress {
    /// Fraction of the whole download + load pipeline, nominally 0..1
    pub progress: f32,
    pub text: Option<String>,
}

impl InitProgress {
    pub fn new(progress: f32, text: impl Into<String>) -> Self {
        Self {
            progress,
            text: Some(text.into()),
        }
    }
}

/// Receives initialization progress; may be called from any thread
pub type ProgressCallback = Arc<dyn Fn(InitProgress) + Send + Sync>;

/// A chat completion request
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Constructs engines for model ids
#[async_trait]
pub trait InferenceRuntime: Send + Sync {
    /// Download (if needed) and initialize an engine bound to `model_id`
    async fn create_engine(
        &self,
        model_id: &str,
        progress: ProgressCallback,
    ) -> Result<Arc<dyn EngineHandle>, RuntimeError>;
}

/// A live engine instance
#[async_trait]
pub trait EngineHandle: Send + Sync {
    /// Whether `reload` can swap the model without a new engine
    fn supports_reload(&self) -> bool {
        false
    }

    /// Rebind this engine to another model in place
    async fn reload(&self, model_id: &str, progress: ProgressCallback) -> Result<(), RuntimeError> {
        let _ = (model_id, progress);
        Err(RuntimeError::ReloadUnsupported)
    }

    /// Start a streaming chat completion
    async fn complete_chat(&self, request: ChatRequest) -> Result<TokenStream, RuntimeError>;

    /// Ask the running completion to stop as soon as possible
    async fn interrupt(&self);
}
