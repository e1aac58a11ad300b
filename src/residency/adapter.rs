//! Runtime adapter trait and an in-process mock implementation.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;

/// Errors reported by a model runtime.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdapterError {
    #[error("Model not found: {0}")]
    NotFound(String),

    #[error("Runtime backend error: {0}")]
    Backend(String),

    #[error("Accelerator out of memory: requested {requested_mb} MB")]
    OutOfMemory { requested_mb: u64 },
}

/// Trait abstracting the runtime that actually loads models onto the accelerator.
///
/// The coordinator never issues two concurrent calls for the same model name.
#[async_trait]
pub trait RuntimeAdapter: Send + Sync {
    /// Load `name` and return its resident footprint in MB.
    async fn load(&self, name: &str) -> Result<u64, AdapterError>;

    /// Unload `name`, freeing its accelerator memory.
    async fn unload(&self, name: &str) -> Result<(), AdapterError>;

    /// Whether the runtime currently holds `name` in memory.
    async fn is_resident(&self, name: &str) -> bool;
}

// -- Mock runtime (testing + dry runs) ----------------------------------------

#[derive(Default)]
struct MockState {
    footprints: HashMap<String, u64>,
    resident: HashSet<String>,
    fail_load: HashSet<String>,
    fail_unload: HashSet<String>,
    load_calls: HashMap<String, u32>,
    unload_calls: HashMap<String, u32>,
}

/// In-process runtime that pretends to load models.
///
/// Footprints come from [`with_footprint`](Self::with_footprint) or the
/// default; failures can be injected per model.
pub struct MockRuntime {
    default_footprint_mb: u64,
    latency: Duration,
    state: Mutex<MockState>,
}

impl MockRuntime {
    pub fn new(default_footprint_mb: u64) -> Self {
        Self {
            default_footprint_mb,
            latency: Duration::ZERO,
            state: Mutex::new(MockState::default()),
        }
    }

    /// Add artificial latency to every load and unload.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Set the footprint reported when `name` loads.
    pub fn with_footprint(self, name: &str, footprint_mb: u64) -> Self {
        self.state.lock().footprints.insert(name.to_string(), footprint_mb);
        self
    }

    /// Make every subsequent load of `name` fail (or succeed again).
    pub fn set_load_failure(&self, name: &str, fail: bool) {
        let mut s = self.state.lock();
        if fail {
            s.fail_load.insert(name.to_string());
        } else {
            s.fail_load.remove(name);
        }
    }

    /// Make every subsequent unload of `name` fail (or succeed again).
    pub fn set_unload_failure(&self, name: &str, fail: bool) {
        let mut s = self.state.lock();
        if fail {
            s.fail_unload.insert(name.to_string());
        } else {
            s.fail_unload.remove(name);
        }
    }

    pub fn load_calls(&self, name: &str) -> u32 {
        self.state.lock().load_calls.get(name).copied().unwrap_or(0)
    }

    pub fn unload_calls(&self, name: &str) -> u32 {
        self.state.lock().unload_calls.get(name).copied().unwrap_or(0)
    }

    /// Names currently held by the mock, sorted.
    pub fn resident_models(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().resident.iter().cloned().collect();
        names.sort();
        names
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

#[async_trait]
impl RuntimeAdapter for MockRuntime {
    async fn load(&self, name: &str) -> Result<u64, AdapterError> {
        {
            let mut s = self.state.lock();
            *s.load_calls.entry(name.to_string()).or_insert(0) += 1;
        }
        self.simulate_latency().await;

        let mut s = self.state.lock();
        if s.fail_load.contains(name) {
            return Err(AdapterError::Backend(format!("injected load failure for {name}")));
        }
        let footprint = s.footprints.get(name).copied().unwrap_or(self.default_footprint_mb);
        s.resident.insert(name.to_string());
        Ok(footprint)
    }

    async fn unload(&self, name: &str) -> Result<(), AdapterError> {
        {
            let mut s = self.state.lock();
            *s.unload_calls.entry(name.to_string()).or_insert(0) += 1;
        }
        self.simulate_latency().await;

        let mut s = self.state.lock();
        if s.fail_unload.contains(name) {
            return Err(AdapterError::Backend(format!("injected unload failure for {name}")));
        }
        if !s.resident.remove(name) {
            return Err(AdapterError::NotFound(name.to_string()));
        }
        Ok(())
    }

    async fn is_resident(&self, name: &str) -> bool {
        self.state.lock().resident.contains(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_reports_configured_footprint() {
        let runtime = MockRuntime::new(100).with_footprint("ocr", 4700);
        assert_eq!(runtime.load("ocr").await.unwrap(), 4700);
        assert_eq!(runtime.load("chat").await.unwrap(), 100);
        assert!(runtime.is_resident("ocr").await);
        assert_eq!(runtime.load_calls("ocr"), 1);
    }

    #[tokio::test]
    async fn test_mock_unload_unknown_model_fails() {
        let runtime = MockRuntime::new(100);
        let err = runtime.unload("ghost").await.unwrap_err();
        assert_eq!(err, AdapterError::NotFound("ghost".into()));
        assert_eq!(runtime.unload_calls("ghost"), 1);
    }

    #[tokio::test]
    async fn test_mock_failure_injection_toggles() {
        let runtime = MockRuntime::new(100);
        runtime.set_load_failure("embed", true);
        assert!(runtime.load("embed").await.is_err());
        runtime.set_load_failure("embed", false);
        assert!(runtime.load("embed").await.is_ok());
        assert_eq!(runtime.resident_models(), vec!["embed".to_string()]);
    }
}
