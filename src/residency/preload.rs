//! Best-effort startup preloading.
//!
//! Models are preloaded one at a time; a failure is logged and skipped.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::coordinator::ResidencyCoordinator;

/// Outcome of a preload pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreloadReport {
    pub loaded: Vec<String>,
    /// `(model, reason)` for every model that could not be preloaded.
    pub failed: Vec<(String, String)>,
}

impl PreloadReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Preloads models by acquiring and immediately releasing a lease on each.
pub struct ModelPreloader {
    coordinator: Arc<ResidencyCoordinator>,
}

impl ModelPreloader {
    pub fn new(coordinator: Arc<ResidencyCoordinator>) -> Self {
        Self { coordinator }
    }

    /// Preload the coordinator's configured list.
    pub async fn preload_configured(&self) -> PreloadReport {
        let names = self.coordinator.config().preload.clone();
        self.preload(&names).await
    }

    /// Preload `names` in order. Never fails; see [`PreloadReport::failed`].
    pub async fn preload(&self, names: &[String]) -> PreloadReport {
        let mut report = PreloadReport::default();
        for name in names {
            let acquired = self.coordinator.acquire_default(name).await;
            match acquired.and_then(|lease| lease.release()) {
                Ok(()) => {
                    info!(model = %name, "Preloaded model");
                    report.loaded.push(name.clone());
                }
                Err(e) => {
                    warn!(model = %name, error = %e, "Preload failed; continuing startup");
                    report.failed.push((name.clone(), e.to_string()));
                }
            }
        }
        report
    }
}
