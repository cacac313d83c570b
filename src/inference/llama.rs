//! llama.cpp runtime
//!
//! # Architecture
//!
//! llama-cpp-2 types (`LlamaBackend`, `LlamaModel`, `LlamaContext`) hold raw
//! pointers that are not `Send`, so a dedicated worker thread keeps the
//! backend and the loaded model. The backend can only be initialized once per
//! process, so every engine of a runtime shares that one worker.
//!
//! The async side talks to the worker over a command channel; replies come
//! back on oneshot channels and tokens on a `TokenStream`.

use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use async_trait::async_trait;
use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaChatMessage, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use tokio::sync::oneshot;

use crate::inference::runtime::{
    ChatRequest, EngineHandle, InferenceRuntime, InitProgress, ProgressCallback, RuntimeError,
};
use crate::inference::streaming::{StreamToken, TokenSender, TokenStream};
use crate::storage::huggingface::{fetch_model, format_size, HuggingFaceSource};
use crate::storage::settings::AtelierSettings;
use crate::types::message::ChatMessage;
use crate::types::model::find_model;

/// Share of the progress scale used by the download; the rest is model loading
const DOWNLOAD_SHARE: f32 = 0.9;

/// Runtime parameters shared by every engine
#[derive(Debug, Clone)]
pub struct LlamaRuntimeConfig {
    /// Directory where model files (.gguf) are stored
    pub models_dir: PathBuf,
    /// Number of layers to offload (0 = CPU only)
    pub gpu_layers: u32,
    /// Upper bound for the context window
    pub context_size: u32,
}

impl From<&AtelierSettings> for LlamaRuntimeConfig {
    fn from(settings: &AtelierSettings) -> Self {
        Self {
            models_dir: settings.models_directory.clone(),
            gpu_layers: settings.gpu_layers,
            context_size: settings.context_size,
        }
    }
}

/// Downloads catalog models and runs them with llama.cpp
#[derive(Clone)]
pub struct LlamaRuntime {
    config: Arc<LlamaRuntimeConfig>,
    worker: Arc<Mutex<Option<Arc<LlamaWorker>>>>,
}

impl LlamaRuntime {
    pub fn new(config: LlamaRuntimeConfig) -> Self {
        Self {
            config: Arc::new(config),
            worker: Arc::new(Mutex::new(None)),
        }
    }

    /// The shared worker, started on first use
    fn worker(&self) -> Result<Arc<LlamaWorker>, RuntimeError> {
        let mut slot = self.worker.lock().expect("worker mutex poisoned");
        if let Some(worker) = slot.as_ref() {
            return Ok(worker.clone());
        }
        let worker = Arc::new(LlamaWorker::spawn(self.config.context_size)?);
        *slot = Some(worker.clone());
        Ok(worker)
    }

    /// Make sure the model file is present locally
    async fn fetch_artifact(
        &self,
        model_id: &str,
        progress: &ProgressCallback,
    ) -> Result<PathBuf, RuntimeError> {
        let descriptor =
            find_model(model_id).ok_or_else(|| RuntimeError::UnknownModel(model_id.to_string()))?;
        let source = HuggingFaceSource::parse(descriptor.source)
            .map_err(|e| RuntimeError::Download(e.to_string()))?;

        fetch_model(&source, &self.config.models_dir, |downloaded, total| {
            let fraction = if total > 0 {
                downloaded as f32 / total as f32
            } else {
                0.0
            };
            progress(InitProgress::new(
                fraction * DOWNLOAD_SHARE,
                format!("Downloading {} / {}", format_size(downloaded), format_size(total)),
            ));
        })
        .await
        .map_err(|e| RuntimeError::Download(e.to_string()))
    }

    async fn load_into(
        &self,
        worker: &LlamaWorker,
        model_id: &str,
        progress: &ProgressCallback,
    ) -> Result<(), RuntimeError> {
        let path = self.fetch_artifact(model_id, progress).await?;
        progress(InitProgress::new(DOWNLOAD_SHARE, "Loading weights"));
        worker.load_model(path, self.config.gpu_layers).await?;
        progress(InitProgress::new(1.0, "Model ready"));
        Ok(())
    }
}

#[async_trait]
impl InferenceRuntime for LlamaRuntime {
    async fn create_engine(
        &self,
        model_id: &str,
        progress: ProgressCallback,
    ) -> Result<Arc<dyn EngineHandle>, RuntimeError> {
        let worker = self.worker()?;
        self.load_into(&worker, model_id, &progress).await?;

        tracing::info!("llama.cpp engine ready with {}", model_id);
        Ok(Arc::new(LlamaHandle {
            runtime: self.clone(),
            worker,
            current_stop: Mutex::new(None),
        }))
    }
}

/// One llama.cpp engine backed by its worker thread
struct LlamaHandle {
    runtime: LlamaRuntime,
    worker: Arc<LlamaWorker>,
    current_stop: Mutex<Option<Arc<AtomicBool>>>,
}

#[async_trait]
impl EngineHandle for LlamaHandle {
    fn supports_reload(&self) -> bool {
        true
    }

    async fn reload(&self, model_id: &str, progress: ProgressCallback) -> Result<(), RuntimeError> {
        self.runtime.load_into(&self.worker, model_id, &progress).await
    }

    async fn complete_chat(&self, request: ChatRequest) -> Result<TokenStream, RuntimeError> {
        let (token_tx, stream) = TokenStream::channel();
        *self.current_stop.lock().expect("stop signal mutex poisoned") = Some(stream.stop_signal());
        self.worker.send(WorkerCommand::Generate { request, token_tx })?;
        Ok(stream)
    }

    async fn interrupt(&self) {
        if let Some(stop) = self
            .current_stop
            .lock()
            .expect("stop signal mutex poisoned")
            .as_ref()
        {
            stop.store(true, Ordering::Relaxed);
        }
    }
}

/// Commands sent to the worker thread
enum WorkerCommand {
    LoadModel {
        path: PathBuf,
        gpu_layers: u32,
        response_tx: oneshot::Sender<Result<(), RuntimeError>>,
    },
    Generate {
        request: ChatRequest,
        token_tx: TokenSender,
    },
    Shutdown,
}

struct LlamaWorker {
    command_tx: Sender<WorkerCommand>,
    handle: Option<JoinHandle<()>>,
}

impl LlamaWorker {
    fn spawn(context_size: u32) -> Result<Self, RuntimeError> {
        let (command_tx, command_rx) = mpsc::channel::<WorkerCommand>();
        let handle = thread::Builder::new()
            .name("llama-worker".to_string())
            .spawn(move || worker_thread_main(command_rx, context_size))
            .map_err(|e| RuntimeError::Worker(e.to_string()))?;

        tracing::info!("llama.cpp worker thread started");
        Ok(Self {
            command_tx,
            handle: Some(handle),
        })
    }

    fn send(&self, command: WorkerCommand) -> Result<(), RuntimeError> {
        self.command_tx
            .send(command)
            .map_err(|e| RuntimeError::Worker(e.to_string()))
    }

    async fn load_model(&self, path: PathBuf, gpu_layers: u32) -> Result<(), RuntimeError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(WorkerCommand::LoadModel {
            path,
            gpu_layers,
            response_tx,
        })?;
        response_rx
            .await
            .map_err(|e| RuntimeError::Worker(e.to_string()))?
    }
}

impl Drop for LlamaWorker {
    fn drop(&mut self) {
        let _ = self.command_tx.send(WorkerCommand::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Worker thread main loop
///
/// Owns the LlamaBackend and LlamaModel, processes commands from the engine handle.
fn worker_thread_main(command_rx: Receiver<WorkerCommand>, context_size: u32) {
    let backend = match LlamaBackend::init() {
        Ok(b) => Some(b),
        Err(e) => {
            tracing::error!("Failed to init backend: {}", e);
            None
        }
    };
    let mut model: Option<LlamaModel> = None;

    while let Ok(command) = command_rx.recv() {
        match command {
            WorkerCommand::LoadModel {
                path,
                gpu_layers,
                response_tx,
            } => {
                let result = match &backend {
                    Some(b) => {
                        // Release the previous weights before mapping the new ones
                        model = None;
                        let params = LlamaModelParams::default().with_n_gpu_layers(gpu_layers);
                        match LlamaModel::load_from_file(b, &path, &params) {
                            Ok(m) => {
                                tracing::info!(
                                    "Model loaded: {:?} ({} params, {} ctx)",
                                    path,
                                    m.n_params(),
                                    m.n_ctx_train()
                                );
                                model = Some(m);
                                Ok(())
                            }
                            Err(e) => Err(RuntimeError::ModelLoad(e.to_string())),
                        }
                    }
                    None => Err(RuntimeError::ModelLoad("backend not initialized".to_string())),
                };
                let _ = response_tx.send(result);
            }
            WorkerCommand::Generate { request, token_tx } => match (&backend, &model) {
                (Some(b), Some(m)) => {
                    if let Err(e) = run_generation(b, m, &request, context_size, &token_tx) {
                        token_tx.send(StreamToken::Error(e));
                    }
                }
                _ => {
                    token_tx.send(StreamToken::Error("No model loaded".to_string()));
                }
            },
            WorkerCommand::Shutdown => {
                tracing::info!("Worker thread shutting down");
                break;
            }
        }
    }
}

fn run_generation(
    backend: &LlamaBackend,
    model: &LlamaModel,
    request: &ChatRequest,
    context_size: u32,
    tx: &TokenSender,
) -> Result<(), String> {
    let prompt = match build_chat_prompt(model, &request.messages) {
        Ok(prompt) => prompt,
        Err(error) => {
            tracing::warn!("Chat template not applied: {error}");
            plain_prompt(&request.messages)
        }
    };

    let n_ctx = context_size.min(model.n_ctx_train()).max(2048);
    let ctx_params = LlamaContextParams::default()
        .with_n_ctx(NonZeroU32::new(n_ctx))
        .with_n_batch(n_ctx);
    let mut ctx = model
        .new_context(backend, ctx_params)
        .map_err(|e| format!("Failed to create context: {}", e))?;

    let tokens = model
        .str_to_token(&prompt, AddBos::Always)
        .map_err(|e| format!("Failed to tokenize: {}", e))?;
    if tokens.len() >= n_ctx as usize {
        return Err(format!(
            "Prompt has {} tokens, context holds {}",
            tokens.len(),
            n_ctx
        ));
    }
    tracing::debug!("Tokenized prompt into {} tokens", tokens.len());

    let budget = request.max_tokens.min(n_ctx - tokens.len() as u32);
    run_inference(&mut ctx, model, tokens, request.temperature, budget, n_ctx, tx)
}

fn build_chat_prompt(model: &LlamaModel, messages: &[ChatMessage]) -> Result<String, String> {
    let template = model
        .chat_template(None)
        .map_err(|e| format!("Failed to load chat template: {e}"))?;
    let chat = messages
        .iter()
        .map(|m| LlamaChatMessage::new(m.role.as_str().to_string(), m.content.clone()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("Failed to build chat message: {e}"))?;
    model
        .apply_chat_template(&template, &chat, true)
        .map_err(|e| format!("Failed to apply chat template: {e}"))
}

/// Prompt for models without a usable chat template
fn plain_prompt(messages: &[ChatMessage]) -> String {
    let mut prompt = String::new();
    for message in messages {
        prompt.push_str(message.role.as_str());
        prompt.push_str(":\n");
        prompt.push_str(&message.content);
        prompt.push_str("\n\n");
    }
    prompt.push_str("assistant:\n");
    prompt
}

/// Runs the inference loop
fn run_inference(
    ctx: &mut LlamaContext,
    model: &LlamaModel,
    prompt_tokens: Vec<llama_cpp_2::token::LlamaToken>,
    temperature: f32,
    max_tokens: u32,
    n_batch: u32,
    tx: &TokenSender,
) -> Result<(), String> {
    let mut batch = LlamaBatch::new(n_batch as usize, 1);
    let last = prompt_tokens.len().saturating_sub(1);
    for (i, token) in prompt_tokens.iter().enumerate() {
        batch
            .add(*token, i as i32, &[0], i == last)
            .map_err(|e| format!("Failed to add token to batch: {}", e))?;
    }
    ctx.decode(&mut batch)
        .map_err(|e| format!("Failed to decode prompt: {}", e))?;

    let mut sampler = if temperature < 0.01 {
        LlamaSampler::greedy()
    } else {
        LlamaSampler::chain_simple([
            LlamaSampler::top_k(40),
            LlamaSampler::top_p(0.95, 1),
            LlamaSampler::temp(temperature),
            LlamaSampler::dist(rand_seed()),
        ])
    };

    let mut n_decoded = prompt_tokens.len() as i32;
    let mut utf8 = Utf8Buffer::default();

    for _ in 0..max_tokens {
        if tx.is_stopped() {
            tracing::debug!("Generation stopped");
            break;
        }

        let token = sampler.sample(ctx, batch.n_tokens() - 1);
        sampler.accept(token);
        if model.is_eog_token(token) {
            tracing::debug!("End of generation token encountered");
            break;
        }

        let bytes = model
            .token_to_bytes(token, Special::Tokenize)
            .map_err(|e| format!("Failed to convert token to bytes: {}", e))?;
        if let Some(text) = utf8.push(&bytes) {
            if !tx.send(StreamToken::Token(text)) {
                tracing::debug!("Receiver dropped, stopping generation");
                break;
            }
        }

        batch.clear();
        batch
            .add(token, n_decoded, &[0], true)
            .map_err(|e| format!("Failed to add token to batch: {}", e))?;
        ctx.decode(&mut batch)
            .map_err(|e| format!("Failed to decode: {}", e))?;
        n_decoded += 1;
    }

    if let Some(rest) = utf8.flush() {
        tx.send(StreamToken::Token(rest));
    }
    tx.send(StreamToken::Done(None));
    Ok(())
}

/// Holds back incomplete UTF-8 sequences between tokens
#[derive(Debug, Default)]
struct Utf8Buffer {
    pending: Vec<u8>,
}

impl Utf8Buffer {
    /// Append bytes and return the longest complete prefix, if any
    fn push(&mut self, bytes: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(bytes);
        let valid = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            Err(e) => e.valid_up_to(),
        };
        if valid == 0 {
            return None;
        }
        let rest = self.pending.split_off(valid);
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending = rest;
        Some(text)
    }

    fn flush(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(text)
    }
}

/// Generates a random seed using system entropy
fn rand_seed() -> u32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    RandomState::new().build_hasher().finish() as u32
}
