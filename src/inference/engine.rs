//! Engine lifecycle manager
//!
//! Owns the single inference engine of the application session.
//!
//! # Architecture
//!
//! `EngineManager` is shared as `Arc<EngineManager>`. Observable state lives in
//! one `watch` snapshot that is replaced per event; bookkeeping that never
//! leaves the manager (the bound engine handle, the in-flight initialization,
//! the cached set) sits behind a short-lived `std::sync::Mutex` that is never
//! held across an await point.
//!
//! Initialization is coalesced: while one attempt chain runs, every caller
//! awaits the same shared future. Generation holds the engine gate for the
//! lifetime of its token stream, so a rebind to another model waits until the
//! running completion is done.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{watch, Mutex as AsyncMutex, OwnedMutexGuard};

use crate::inference::attempts::build_attempts;
use crate::inference::runtime::{
    ChatRequest, EngineHandle, InferenceRuntime, InitProgress, ProgressCallback, RuntimeError,
};
use crate::inference::streaming::{StreamToken, TokenStream};
use crate::storage::model_cache::ModelCacheStore;
use crate::system::capability::{CapabilityProbe, CapabilityReport};
use crate::types::config::EngineConfig;
use crate::types::message::ChatMessage;
use crate::types::model::{find_model, model_label};

const DEFAULT_UNSUPPORTED_REASON: &str = "Hardware acceleration is not supported on this machine.";

/// Errors surfaced by the engine manager
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("{0}")]
    Unsupported(String),

    #[error("Hardware capability has not been probed yet")]
    CapabilityUnknown,

    #[error("Failed to load model {model_id}: {reason}")]
    Initialization { model_id: String, reason: String },

    #[error("Generation failed: {0}")]
    Generation(String),

    #[error("No model loaded")]
    NoSession,
}

/// Lifecycle of the engine as seen by observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleStatus {
    Checking,
    Unsupported,
    Idle,
    Initializing,
    Ready,
    Error,
}

/// Initialization progress of one candidate model
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    /// Clamped to 0..=1; 1 means the candidate's assets are fully materialized
    pub fraction_complete: f32,
    pub message: String,
    pub target_model_id: String,
}

/// Everything an observer may display, replaced wholesale on every change
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineSnapshot {
    pub status: LifecycleStatus,
    pub progress: Option<ProgressSnapshot>,
    pub active_model_id: Option<String>,
    pub error: Option<String>,
    pub capability: Option<CapabilityReport>,
    pub cached_models: BTreeSet<String>,
    pub is_generating: bool,
}

/// Identity of the bound engine, handed out by `initialize`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSession {
    /// Increments each time a new engine instance is constructed
    pub id: u64,
    pub model_id: String,
}

/// Parameters of one generation
#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// Final result of a generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationOutput {
    pub text: String,
    /// Model that produced the text
    pub model_id: String,
}

type SharedInit = Shared<BoxFuture<'static, Result<EngineSession, EngineError>>>;

struct BoundSession {
    id: u64,
    model_id: String,
    handle: Arc<dyn EngineHandle>,
}

struct EngineState {
    capability: Option<CapabilityReport>,
    session: Option<BoundSession>,
    last_requested: String,
    inflight: Option<SharedInit>,
    cached: BTreeSet<String>,
    current_stop: Option<Arc<AtomicBool>>,
}

/// The single owner of the inference engine
pub struct EngineManager {
    runtime: Arc<dyn InferenceRuntime>,
    config: EngineConfig,
    cache_store: ModelCacheStore,
    state: Mutex<EngineState>,
    snapshot_tx: watch::Sender<EngineSnapshot>,
    engine_gate: Arc<AsyncMutex<()>>,
    next_session_id: AtomicU64,
}

impl EngineManager {
    /// Creates a manager in the `checking` state. Call `detect_capability` next.
    pub fn new(
        runtime: Arc<dyn InferenceRuntime>,
        config: EngineConfig,
        cache_store: ModelCacheStore,
    ) -> Arc<Self> {
        let cached = cache_store.load();
        let (snapshot_tx, _) = watch::channel(EngineSnapshot {
            status: LifecycleStatus::Checking,
            progress: None,
            active_model_id: None,
            error: None,
            capability: None,
            cached_models: cached.clone(),
            is_generating: false,
        });

        tracing::info!(
            "Engine manager created (default: {}, fallback: {}, {} cached)",
            config.default_model_id,
            config.fallback_model_id,
            cached.len()
        );

        Arc::new(Self {
            runtime,
            state: Mutex::new(EngineState {
                capability: None,
                session: None,
                last_requested: config.default_model_id.clone(),
                inflight: None,
                cached,
                current_stop: None,
            }),
            config,
            cache_store,
            snapshot_tx,
            engine_gate: Arc::new(AsyncMutex::new(())),
            next_session_id: AtomicU64::new(1),
        })
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, EngineState> {
        self.state.lock().expect("engine state mutex poisoned")
    }

    // =========================================================================
    // Observation
    // =========================================================================

    /// Subscribe to snapshot replacements
    pub fn subscribe(&self) -> watch::Receiver<EngineSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    pub fn status(&self) -> LifecycleStatus {
        self.snapshot_tx.borrow().status
    }

    pub fn progress(&self) -> Option<ProgressSnapshot> {
        self.snapshot_tx.borrow().progress.clone()
    }

    pub fn active_model_id(&self) -> Option<String> {
        self.snapshot_tx.borrow().active_model_id.clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.snapshot_tx.borrow().error.clone()
    }

    pub fn is_generating(&self) -> bool {
        self.snapshot_tx.borrow().is_generating
    }

    pub fn cached_models(&self) -> BTreeSet<String> {
        self.lock_state().cached.clone()
    }

    pub fn is_model_cached(&self, model_id: &str) -> bool {
        self.lock_state().cached.contains(model_id)
    }

    /// Model the next parameterless `initialize` will ask for
    pub fn desired_model_id(&self) -> String {
        self.lock_state().last_requested.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The bound session, only while the engine is `ready`
    pub fn current_session(&self) -> Option<EngineSession> {
        if self.status() != LifecycleStatus::Ready {
            return None;
        }
        self.lock_state().session.as_ref().map(|s| EngineSession {
            id: s.id,
            model_id: s.model_id.clone(),
        })
    }

    // =========================================================================
    // Capability
    // =========================================================================

    /// Run the probe and apply its report
    pub fn detect_capability(&self, probe: &dyn CapabilityProbe) -> CapabilityReport {
        let report = probe.probe();
        self.apply_capability(report.clone());
        report
    }

    /// Apply a capability report. Only `checking`, `idle` and `unsupported`
    /// react to it; later states keep their status.
    pub fn apply_capability(&self, report: CapabilityReport) {
        let has_session = {
            let mut state = self.lock_state();
            state.capability = Some(report.clone());
            state.session.is_some()
        };

        self.snapshot_tx.send_modify(|s| {
            s.capability = Some(report.clone());
            match (s.status, report.supported) {
                (LifecycleStatus::Checking | LifecycleStatus::Idle | LifecycleStatus::Unsupported, false) => {
                    s.status = LifecycleStatus::Unsupported;
                    s.error = Some(
                        report
                            .reason
                            .clone()
                            .unwrap_or_else(|| DEFAULT_UNSUPPORTED_REASON.to_string()),
                    );
                }
                (LifecycleStatus::Checking | LifecycleStatus::Unsupported, true) => {
                    s.status = if has_session {
                        LifecycleStatus::Ready
                    } else {
                        LifecycleStatus::Idle
                    };
                    s.error = None;
                }
                _ => {}
            }
        });

        if report.supported {
            tracing::info!("Hardware capability: supported");
        } else {
            tracing::warn!(
                "Hardware capability: unsupported ({})",
                report.reason.as_deref().unwrap_or("no reason given")
            );
        }
    }

    // =========================================================================
    // Initialization
    // =========================================================================

    /// Ensure an engine is bound, walking the fallback chain if needed.
    ///
    /// `None` reuses the last explicitly requested model (initially the
    /// configured default). Concurrent calls share one attempt chain.
    pub async fn initialize(
        self: &Arc<Self>,
        requested_model_id: Option<&str>,
    ) -> Result<EngineSession, EngineError> {
        self.ensure(requested_model_id, true).await
    }

    async fn ensure(
        self: &Arc<Self>,
        requested_model_id: Option<&str>,
        remember: bool,
    ) -> Result<EngineSession, EngineError> {
        let pending = {
            let mut state = self.lock_state();

            match &state.capability {
                None => return Err(EngineError::CapabilityUnknown),
                Some(report) if !report.supported => {
                    return Err(EngineError::Unsupported(
                        report
                            .reason
                            .clone()
                            .unwrap_or_else(|| DEFAULT_UNSUPPORTED_REASON.to_string()),
                    ));
                }
                Some(_) => {}
            }

            let preferred = requested_model_id
                .map(str::to_string)
                .unwrap_or_else(|| state.last_requested.clone());
            if remember {
                state.last_requested = preferred.clone();
            }

            let bound = state
                .session
                .as_ref()
                .filter(|s| s.model_id == preferred && self.status() != LifecycleStatus::Initializing)
                .map(|s| EngineSession {
                    id: s.id,
                    model_id: s.model_id.clone(),
                });

            if let Some(inflight) = state.inflight.clone() {
                tracing::debug!("Joining in-flight initialization");
                inflight
            } else if let Some(session) = bound {
                drop(state);
                self.mark_cached(&session.model_id);
                self.snapshot_tx.send_modify(|s| {
                    s.status = LifecycleStatus::Ready;
                    s.active_model_id = Some(session.model_id.clone());
                    s.error = None;
                });
                return Ok(session);
            } else {
                let attempts = build_attempts(
                    &preferred,
                    &self.config.default_model_id,
                    &self.config.fallback_model_id,
                );
                tracing::info!("Initializing engine, attempts: {:?}", attempts);
                let this = Arc::clone(self);
                let chain = async move { this.run_attempts(attempts).await }.boxed().shared();
                state.inflight = Some(chain.clone());
                chain
            }
        };

        pending.await
    }

    async fn run_attempts(self: Arc<Self>, attempts: Vec<String>) -> Result<EngineSession, EngineError> {
        let mut last_error: Option<EngineError> = None;

        for candidate in &attempts {
            match self.load_candidate(candidate).await {
                Ok(session) => {
                    self.lock_state().inflight = None;
                    tracing::info!("Engine ready with model {}", session.model_id);
                    return Ok(session);
                }
                Err(e) => {
                    tracing::warn!("Model {} failed to load: {}", candidate, e);
                    last_error = Some(e);
                }
            }
        }

        self.lock_state().inflight = None;
        let error = last_error.unwrap_or_else(|| EngineError::Initialization {
            model_id: String::new(),
            reason: "no model candidates".to_string(),
        });
        tracing::error!("All model candidates failed: {}", error);
        let message = error.to_string();
        self.snapshot_tx.send_modify(|s| {
            s.status = LifecycleStatus::Error;
            s.error = Some(message);
            s.progress = None;
        });
        Err(error)
    }

    async fn load_candidate(self: &Arc<Self>, target: &str) -> Result<EngineSession, EngineError> {
        self.snapshot_tx.send_modify(|s| {
            s.status = LifecycleStatus::Initializing;
            s.error = None;
            s.progress = Some(ProgressSnapshot {
                fraction_complete: 0.0,
                message: format!("Loading {}", model_label(target)),
                target_model_id: target.to_string(),
            });
        });

        let result = self.bind(target).await;
        let clear_progress = |s: &mut EngineSnapshot| {
            if s.progress.as_ref().is_some_and(|p| p.target_model_id == target) {
                s.progress = None;
            }
        };

        match result {
            Ok(session) => {
                self.mark_cached(target);
                self.snapshot_tx.send_modify(|s| {
                    s.status = LifecycleStatus::Ready;
                    s.active_model_id = Some(target.to_string());
                    clear_progress(s);
                });
                Ok(session)
            }
            Err(e) => {
                self.snapshot_tx.send_modify(clear_progress);
                Err(EngineError::Initialization {
                    model_id: target.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Bind the engine to `target`: no-op, in-place reload, or new construction
    async fn bind(self: &Arc<Self>, target: &str) -> Result<EngineSession, RuntimeError> {
        let existing = {
            let state = self.lock_state();
            state
                .session
                .as_ref()
                .map(|s| (s.id, s.model_id.clone(), s.handle.clone()))
        };

        let _gate = match &existing {
            Some((id, model_id, _)) if model_id == target => {
                return Ok(EngineSession {
                    id: *id,
                    model_id: model_id.clone(),
                });
            }
            // A running completion finishes on its current model first
            Some(_) => Some(self.engine_gate.clone().lock_owned().await),
            None => None,
        };

        let progress = self.progress_callback(target);

        if let Some((id, from, handle)) = existing {
            // The previous model may already be unloaded once a rebind starts
            self.unbind();
            if handle.supports_reload() {
                tracing::info!("Reloading engine in place: {} -> {}", from, target);
                let reloaded = handle.reload(target, progress.clone()).await;
                match reloaded {
                    Ok(()) => {
                        self.lock_state().session = Some(BoundSession {
                            id,
                            model_id: target.to_string(),
                            handle,
                        });
                        return Ok(EngineSession {
                            id,
                            model_id: target.to_string(),
                        });
                    }
                    Err(e) => {
                        tracing::warn!(
                            "In-place reload to {} failed, constructing a new engine: {}",
                            target,
                            e
                        );
                    }
                }
            }
        }

        let handle = self.runtime.create_engine(target, progress).await?;
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        self.lock_state().session = Some(BoundSession {
            id,
            model_id: target.to_string(),
            handle,
        });
        tracing::debug!("Constructed engine session {} for {}", id, target);

        Ok(EngineSession {
            id,
            model_id: target.to_string(),
        })
    }

    /// Forget the bound engine; nothing counts as loaded until a bind succeeds
    fn unbind(&self) {
        self.lock_state().session = None;
        self.snapshot_tx.send_modify(|s| s.active_model_id = None);
    }

    fn progress_callback(self: &Arc<Self>, target: &str) -> ProgressCallback {
        let weak: Weak<Self> = Arc::downgrade(self);
        let target = target.to_string();
        Arc::new(move |report: InitProgress| {
            if let Some(manager) = weak.upgrade() {
                manager.handle_progress(&target, report);
            }
        })
    }

    fn handle_progress(self: &Arc<Self>, target: &str, report: InitProgress) {
        let value = if report.progress.is_nan() {
            0.0
        } else {
            report.progress.clamp(0.0, 1.0)
        };
        let base = report
            .text
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| "Loading model artifacts".to_string());
        let message = match find_model(target) {
            Some(model) => format!("{} · {}", base, model.download_size_label),
            None => base,
        };

        self.snapshot_tx.send_modify(|s| {
            s.progress = Some(ProgressSnapshot {
                fraction_complete: value,
                message,
                target_model_id: target.to_string(),
            });
        });

        if value >= 1.0 {
            self.mark_cached(target);
            self.schedule_progress_clear(target);
        }
    }

    /// Drop a completed progress snapshot after the configured delay
    fn schedule_progress_clear(self: &Arc<Self>, target: &str) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let weak = Arc::downgrade(self);
        let target = target.to_string();
        let delay = self.config.progress_clear_delay;
        runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(manager) = weak.upgrade() {
                manager.snapshot_tx.send_if_modified(|s| {
                    let completed = s
                        .progress
                        .as_ref()
                        .is_some_and(|p| p.target_model_id == target && p.fraction_complete >= 1.0);
                    if completed {
                        s.progress = None;
                    }
                    completed
                });
            }
        });
    }

    fn mark_cached(&self, model_id: &str) {
        let updated = {
            let mut state = self.lock_state();
            if !state.cached.insert(model_id.to_string()) {
                return;
            }
            state.cached.clone()
        };

        self.cache_store.save(&updated);
        self.snapshot_tx.send_modify(|s| s.cached_models = updated);
        tracing::debug!("Model {} marked as cached", model_id);
    }

    // =========================================================================
    // Generation
    // =========================================================================

    /// Start a streaming generation on the active (or last requested) model.
    ///
    /// Callers must not overlap generations; the returned `Generation` keeps
    /// the engine busy until it is dropped.
    pub async fn generate_stream(
        self: &Arc<Self>,
        request: GenerateRequest,
    ) -> Result<Generation, EngineError> {
        let target = self
            .active_model_id()
            .unwrap_or_else(|| self.desired_model_id());
        self.ensure(Some(&target), false).await?;

        let gate = self.engine_gate.clone().lock_owned().await;

        // Whatever is bound now runs the request; a rebind may have happened
        // between `ensure` and taking the gate.
        let (model_id, handle) = {
            let state = self.lock_state();
            match state.session.as_ref() {
                Some(s) if self.status() == LifecycleStatus::Ready => {
                    (s.model_id.clone(), s.handle.clone())
                }
                _ => return Err(EngineError::NoSession),
            }
        };

        let busy = BusyGuard::engage(Arc::clone(self));
        let chat = ChatRequest {
            messages: request.messages,
            temperature: request.temperature.unwrap_or(self.config.temperature),
            max_tokens: request.max_tokens.unwrap_or(self.config.max_tokens),
        };

        tracing::debug!("Starting generation on {}", model_id);
        let stream = handle
            .complete_chat(chat)
            .await
            .map_err(|e| EngineError::Generation(e.to_string()))?;
        self.lock_state().current_stop = Some(stream.stop_signal());

        Ok(Generation {
            model_id,
            stream,
            accumulated: String::new(),
            final_text: None,
            finished: false,
            _busy: busy,
            _gate: gate,
        })
    }

    /// Run a generation to completion, reporting each chunk to `on_chunk`
    pub async fn generate(
        self: &Arc<Self>,
        request: GenerateRequest,
        mut on_chunk: impl FnMut(&str),
    ) -> Result<GenerationOutput, EngineError> {
        let mut generation = self.generate_stream(request).await?;
        while let Some(chunk) = generation.next_chunk().await {
            on_chunk(&chunk?);
        }
        Ok(generation.finish())
    }

    /// Best-effort interrupt of the running generation
    pub async fn cancel(&self) {
        let (stop, handle) = {
            let state = self.lock_state();
            (
                state.current_stop.clone(),
                state.session.as_ref().map(|s| s.handle.clone()),
            )
        };

        if let Some(stop) = stop {
            stop.store(true, Ordering::Relaxed);
        }
        if self.is_generating() {
            if let Some(handle) = handle {
                tracing::info!("Interrupting running generation");
                handle.interrupt().await;
            }
        }
    }
}

/// Marks the engine busy for as long as it lives
struct BusyGuard {
    manager: Arc<EngineManager>,
}

impl BusyGuard {
    fn engage(manager: Arc<EngineManager>) -> Self {
        manager.snapshot_tx.send_modify(|s| s.is_generating = true);
        Self { manager }
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.manager.lock_state().current_stop = None;
        self.manager
            .snapshot_tx
            .send_modify(|s| s.is_generating = false);
    }
}

/// A running generation, consumed chunk by chunk
pub struct Generation {
    model_id: String,
    stream: TokenStream,
    accumulated: String,
    final_text: Option<String>,
    finished: bool,
    _busy: BusyGuard,
    _gate: OwnedMutexGuard<()>,
}

impl Generation {
    /// Model this generation runs on
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Next text chunk; `None` once the completion is over
    pub async fn next_chunk(&mut self) -> Option<Result<String, EngineError>> {
        while !self.finished {
            match self.stream.next().await {
                Some(StreamToken::Token(text)) => {
                    if text.is_empty() {
                        continue;
                    }
                    self.accumulated.push_str(&text);
                    return Some(Ok(text));
                }
                Some(StreamToken::Done(text)) => {
                    self.final_text = text;
                    self.finished = true;
                }
                Some(StreamToken::Error(e)) => {
                    self.finished = true;
                    return Some(Err(EngineError::Generation(e)));
                }
                None => self.finished = true,
            }
        }
        None
    }

    /// Ask the runtime to stop producing tokens
    pub fn stop(&self) {
        self.stream.stop();
    }

    /// Final text: the streamed accumulation or the runtime's reported text,
    /// whichever is longer
    pub fn finish(self) -> GenerationOutput {
        let reported = self
            .final_text
            .as_deref()
            .map(str::trim)
            .unwrap_or_default();
        let text = if reported.chars().count() > self.accumulated.chars().count() {
            reported.to_string()
        } else {
            self.accumulated.clone()
        };

        GenerationOutput {
            text,
            model_id: self.model_id.clone(),
        }
    }
}
