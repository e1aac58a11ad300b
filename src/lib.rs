//! Residency-CORE
//!
//! Coordinates which models are resident on a memory-bounded accelerator.
//! Callers lease a model for the duration of one request; the coordinator
//! admits loads against a fixed budget, evicts idle models in LRU order, and
//! never evicts a model someone is using.
//!
//! # Design Principles
//!
//! - **Bounded**: committed memory never exceeds the configured budget
//! - **Safe**: a model with an outstanding lease is never unloaded
//! - **Shared**: concurrent requests for a loading model join one load
//! - **Passive**: no background threads; work happens inside caller calls
//!
//! The runtime itself (weights, kernels, devices) sits behind
//! [`residency::RuntimeAdapter`].

pub mod cli;
pub mod config;
#[cfg(feature = "http")]
pub mod http;
pub mod residency;
pub mod telemetry;

use std::sync::Arc;

use residency::{
    CoordinatorConfig, ModelPreloader, PreloadReport, ResidencyCoordinator, RuntimeAdapter,
    ShutdownReport,
};
use telemetry::LogConfig;

/// Runtime configuration.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    pub coordinator: CoordinatorConfig,
    pub log: LogConfig,
}

impl From<config::EnvConfig> for RuntimeConfig {
    fn from(env: config::EnvConfig) -> Self {
        Self {
            coordinator: env.coordinator,
            log: env.log,
        }
    }
}

/// The Residency-CORE runtime instance.
pub struct Runtime {
    pub config: RuntimeConfig,
    pub coordinator: Arc<ResidencyCoordinator>,
    pub preloader: ModelPreloader,
}

impl Runtime {
    /// Create a new runtime around `adapter`.
    pub fn new(config: RuntimeConfig, adapter: Arc<dyn RuntimeAdapter>) -> Self {
        let coordinator = Arc::new(ResidencyCoordinator::new(
            config.coordinator.clone(),
            adapter,
        ));
        let preloader = ModelPreloader::new(coordinator.clone());
        Self {
            config,
            coordinator,
            preloader,
        }
    }

    /// Preload the configured models. Startup proceeds whatever fails.
    pub async fn start(&self) -> PreloadReport {
        self.preloader.preload_configured().await
    }

    /// Drain leases for the configured shutdown timeout, then unload.
    pub async fn shutdown(&self) -> ShutdownReport {
        self.coordinator
            .shutdown(self.config.coordinator.shutdown_timeout)
            .await
    }
}
