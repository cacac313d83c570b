//! System utilities
//!
//! Hardware detection and the capability probe consumed by the engine.

pub mod capability;
pub mod gpu;
