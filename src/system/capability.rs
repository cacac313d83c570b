//! Capability probe
//!
//! Answers one question: can this machine run the models accelerated?

use serde::{Deserialize, Serialize};

use crate::system::gpu::{compiled_backend, detect_gpu};

/// Outcome of a capability probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityReport {
    pub supported: bool,
    /// Advisory hint shown to the user when unsupported
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl CapabilityReport {
    pub fn supported() -> Self {
        Self {
            supported: true,
            reason: None,
        }
    }

    pub fn unsupported(reason: impl Into<String>) -> Self {
        Self {
            supported: false,
            reason: Some(reason.into()),
        }
    }
}

/// Side-effect free, repeatable hardware probe
pub trait CapabilityProbe: Send + Sync {
    fn probe(&self) -> CapabilityReport;
}

/// Probe backed by the compiled acceleration backend and GPU detection
#[derive(Debug, Clone, Default)]
pub struct AccelerationProbe {
    /// Accept machines without GPU acceleration
    pub allow_cpu: bool,
}

impl AccelerationProbe {
    pub fn new(allow_cpu: bool) -> Self {
        Self { allow_cpu }
    }
}

impl CapabilityProbe for AccelerationProbe {
    fn probe(&self) -> CapabilityReport {
        if self.allow_cpu {
            return CapabilityReport::supported();
        }

        let Some(backend) = compiled_backend() else {
            return CapabilityReport::unsupported(
                "Built without GPU acceleration. Rebuild with --features cuda, metal or vulkan, or enable allow_cpu_inference.",
            );
        };

        let gpu = detect_gpu();
        if gpu.is_available {
            tracing::info!("{} acceleration available on {}", backend, gpu.name);
            CapabilityReport::supported()
        } else {
            CapabilityReport::unsupported(format!(
                "No GPU detected for the {} backend. Check the graphics driver installation.",
                backend
            ))
        }
    }
}

/// Probe returning a fixed report
#[derive(Debug, Clone)]
pub struct StaticProbe(pub CapabilityReport);

impl CapabilityProbe for StaticProbe {
    fn probe(&self) -> CapabilityReport {
        self.0.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_allowed_is_always_supported() {
        let report = AccelerationProbe::new(true).probe();
        assert!(report.supported);
        assert!(report.reason.is_none());
    }

    #[test]
    fn test_probe_is_repeatable() {
        let probe = AccelerationProbe::default();
        assert_eq!(probe.probe(), probe.probe());
    }

    #[test]
    fn test_unsupported_carries_reason() {
        let report = StaticProbe(CapabilityReport::unsupported("no gpu")).probe();
        assert!(!report.supported);
        assert_eq!(report.reason.as_deref(), Some("no gpu"));
    }

    #[test]
    fn test_reason_is_omitted_from_json_when_absent() {
        let json = serde_json::to_string(&CapabilityReport::supported()).unwrap();
        assert_eq!(json, r#"{"supported":true}"#);
    }
}
