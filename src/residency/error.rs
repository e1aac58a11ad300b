//! Error types surfaced by the residency coordinator.
//!
//! Adapter failures are logged in full where they happen and re-raised here
//! as coarse kinds, so callers never depend on adapter internals.

use thiserror::Error;

use super::lease::GrantId;

/// Errors returned by [`ResidencyCoordinator`](super::ResidencyCoordinator).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResidencyError {
    #[error("Model {model} is unserviceable: needs {required_mb} MB, budget is {budget_mb} MB")]
    Unserviceable {
        model: String,
        required_mb: u64,
        budget_mb: u64,
    },

    #[error("Timed out after {waited_ms}ms waiting for model {model}")]
    Timeout { model: String, waited_ms: u64 },

    #[error("Model {0} failed to load")]
    LoadFailed(String),

    #[error("Model {0} failed to unload")]
    UnloadFailed(String),

    #[error("Lease usage error: grant {0} is unknown or already released")]
    Usage(GrantId),

    #[error("Coordinator is shutting down")]
    ShuttingDown,
}

impl ResidencyError {
    /// Returns true if retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::LoadFailed(_) | Self::UnloadFailed(_)
        )
    }

    /// Returns true if this error indicates a caller bug.
    pub fn is_usage_error(&self) -> bool {
        matches!(self, Self::Usage(_))
    }

    /// Short category label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unserviceable { .. } => "unserviceable",
            Self::Timeout { .. } => "timeout",
            Self::LoadFailed(_) => "load_failed",
            Self::UnloadFailed(_) => "unload_failed",
            Self::Usage(_) => "usage",
            Self::ShuttingDown => "shutting_down",
        }
    }
}
