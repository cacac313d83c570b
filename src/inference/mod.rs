//! On-device inference
//!
//! The engine lifecycle manager, the runtime seam it drives, and the
//! concrete llama.cpp runtime.

pub mod attempts;
pub mod engine;
pub mod runtime;
pub mod streaming;

#[cfg(feature = "llama")]
pub mod llama;

#[cfg(test)]
pub(crate) mod mock;

// Re-export main types for convenience
pub use attempts::build_attempts;
pub use engine::{
    EngineError, EngineManager, EngineSession, EngineSnapshot, GenerateRequest, Generation,
    GenerationOutput, LifecycleStatus, ProgressSnapshot,
};
pub use runtime::{ChatRequest, EngineHandle, InferenceRuntime, InitProgress, ProgressCallback, RuntimeError};
pub use streaming::{StreamToken, TokenSender, TokenStream};
