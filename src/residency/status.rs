//! Read-only status snapshots of the residency ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ledger::{Ledger, LedgerMetrics, ModelState};

/// Per-model view in a [`StatusReport`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelStatus {
    pub name: String,
    pub state: ModelState,
    pub footprint_mb: u64,
    pub estimated_footprint_mb: u64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub waiter_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Point-in-time coordinator status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub enabled: bool,
    pub budget_mb: u64,
    pub used_mb: u64,
    pub free_mb: u64,
    /// Sorted by name.
    pub models: Vec<ModelStatus>,
    pub metrics: LedgerMetrics,
}

impl StatusReport {
    pub fn model(&self, name: &str) -> Option<&ModelStatus> {
        self.models.iter().find(|m| m.name == name)
    }

    /// Names of resident models, sorted.
    pub fn resident(&self) -> Vec<&str> {
        self.models
            .iter()
            .filter(|m| m.state == ModelState::Resident)
            .map(|m| m.name.as_str())
            .collect()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}"))
    }
}

pub(crate) fn snapshot(ledger: &Ledger, enabled: bool) -> StatusReport {
    let mut models: Vec<ModelStatus> = ledger
        .resources()
        .map(|r| ModelStatus {
            name: r.name.clone(),
            state: r.state,
            footprint_mb: r.footprint_mb,
            estimated_footprint_mb: r.estimated_footprint_mb,
            last_used_at: r.last_used_at,
            waiter_count: r.waiter_count,
            last_error: r.last_error.clone(),
        })
        .collect();
    models.sort_by(|a, b| a.name.cmp(&b.name));

    StatusReport {
        enabled,
        budget_mb: ledger.budget_mb(),
        used_mb: ledger.used_mb(),
        free_mb: ledger.free_mb(),
        models,
        metrics: ledger.metrics,
    }
}
