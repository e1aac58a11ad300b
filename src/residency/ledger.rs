//! Residency ledger: the single source of truth for model state.
//!
//! The ledger is plain data. Callers wrap it in one mutex and hold that lock
//! only for bookkeeping, never across a runtime adapter call.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::error::ResidencyError;
use super::lease::GrantId;

/// Lifecycle state of a model on the accelerator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelState {
    Unloaded,
    Loading,
    Resident,
    Unloading,
    LoadFailed,
}

/// Outcome published to every caller joined on one load: `None` while in flight.
pub(crate) type LoadOutcome = Option<Result<(), ResidencyError>>;

/// Bookkeeping for one known model.
pub(crate) struct ModelResource {
    pub name: String,
    pub state: ModelState,
    /// Real footprint reported by the runtime; 0 until the first successful load.
    pub footprint_mb: u64,
    pub estimated_footprint_mb: u64,
    /// Cost held against the budget while `Loading`.
    pub reserved_mb: u64,
    pub last_used_seq: u64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub waiter_count: u32,
    pub last_error: Option<String>,
    /// Serializes load/unload transitions for this model.
    pub transition: Arc<tokio::sync::Mutex<()>>,
    pub load_watch: Option<watch::Receiver<LoadOutcome>>,
}

impl ModelResource {
    fn new(name: &str, estimated_footprint_mb: u64) -> Self {
        Self {
            name: name.to_string(),
            state: ModelState::Unloaded,
            footprint_mb: 0,
            estimated_footprint_mb,
            reserved_mb: 0,
            last_used_seq: 0,
            last_used_at: None,
            waiter_count: 0,
            last_error: None,
            transition: Arc::new(tokio::sync::Mutex::new(())),
            load_watch: None,
        }
    }

    /// Cost used for admission: the known footprint, else the estimate.
    pub fn admission_cost(&self) -> u64 {
        if self.footprint_mb > 0 {
            self.footprint_mb
        } else {
            self.estimated_footprint_mb
        }
    }

    /// Memory this entry currently holds or has reserved.
    pub fn committed_mb(&self) -> u64 {
        match self.state {
            ModelState::Resident | ModelState::Unloading => self.footprint_mb,
            ModelState::Loading => self.reserved_mb,
            ModelState::Unloaded | ModelState::LoadFailed => 0,
        }
    }

    pub fn is_evictable(&self) -> bool {
        self.state == ModelState::Resident && self.waiter_count == 0
    }
}

/// Cumulative coordinator counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerMetrics {
    pub leases_granted: u64,
    pub evictions: u64,
    pub admission_timeouts: u64,
    pub load_failures: u64,
    pub unload_failures: u64,
}

/// Process-wide residency bookkeeping.
pub(crate) struct Ledger {
    budget_mb: u64,
    default_estimate_mb: u64,
    estimates: HashMap<String, u64>,
    resources: HashMap<String, ModelResource>,
    grants: HashMap<GrantId, String>,
    next_grant: u64,
    clock: u64,
    accepting: bool,
    pub metrics: LedgerMetrics,
}

impl Ledger {
    pub fn new(budget_mb: u64, default_estimate_mb: u64, estimates: HashMap<String, u64>) -> Self {
        Self {
            budget_mb,
            default_estimate_mb,
            estimates,
            resources: HashMap::new(),
            grants: HashMap::new(),
            next_grant: 1,
            clock: 0,
            accepting: true,
            metrics: LedgerMetrics::default(),
        }
    }

    pub fn budget_mb(&self) -> u64 {
        self.budget_mb
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting
    }

    pub fn stop_accepting(&mut self) {
        self.accepting = false;
    }

    /// Get the entry for `name`, creating it on first reference.
    pub fn entry(&mut self, name: &str) -> &mut ModelResource {
        let estimate = self
            .estimates
            .get(name)
            .copied()
            .unwrap_or(self.default_estimate_mb);
        self.resources
            .entry(name.to_string())
            .or_insert_with(|| ModelResource::new(name, estimate))
    }

    pub fn get(&self, name: &str) -> Option<&ModelResource> {
        self.resources.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ModelResource> {
        self.resources.get_mut(name)
    }

    pub fn resources(&self) -> impl Iterator<Item = &ModelResource> {
        self.resources.values()
    }

    /// Sum of footprints of resident models, recomputed on every call.
    pub fn used_mb(&self) -> u64 {
        self.resources
            .values()
            .filter(|r| r.state == ModelState::Resident)
            .map(|r| r.footprint_mb)
            .sum()
    }

    /// Resident footprints plus in-flight reservations and unloads.
    pub fn committed_mb(&self) -> u64 {
        self.resources.values().map(ModelResource::committed_mb).sum()
    }

    /// Footprint of models currently being unloaded.
    pub fn unloading_mb(&self) -> u64 {
        self.resources
            .values()
            .filter(|r| r.state == ModelState::Unloading)
            .map(|r| r.footprint_mb)
            .sum()
    }

    pub fn free_mb(&self) -> u64 {
        self.budget_mb.saturating_sub(self.used_mb())
    }

    /// Refresh recency for `name`.
    pub fn touch(&mut self, name: &str) {
        self.clock += 1;
        let seq = self.clock;
        if let Some(r) = self.resources.get_mut(name) {
            r.last_used_seq = seq;
            r.last_used_at = Some(Utc::now());
        }
    }

    pub fn add_waiter(&mut self, name: &str) {
        self.entry(name).waiter_count += 1;
    }

    /// Undo an `add_waiter` for a caller that never received its lease.
    pub fn remove_waiter(&mut self, name: &str) {
        if let Some(r) = self.resources.get_mut(name) {
            debug_assert!(r.waiter_count > 0, "waiter underflow on {name}");
            r.waiter_count = r.waiter_count.saturating_sub(1);
        }
    }

    /// Record a grant for a caller already counted as a waiter.
    pub fn issue_grant(&mut self, name: &str) -> GrantId {
        let id = GrantId::new(self.next_grant);
        self.next_grant += 1;
        self.grants.insert(id, name.to_string());
        self.metrics.leases_granted += 1;
        self.touch(name);
        id
    }

    /// Retire a grant. Unknown or already-retired ids are a usage error.
    pub fn release(&mut self, id: GrantId) -> Result<String, ResidencyError> {
        let name = self.grants.remove(&id).ok_or(ResidencyError::Usage(id))?;
        self.remove_waiter(&name);
        self.touch(&name);
        Ok(name)
    }

    pub fn outstanding_grants(&self) -> usize {
        self.grants.len()
    }

    /// Zero-waiter resident models other than `exclude`, least recently used first.
    pub fn eviction_candidates(&self, exclude: Option<&str>) -> Vec<String> {
        let mut candidates: Vec<&ModelResource> = self
            .resources
            .values()
            .filter(|r| r.is_evictable() && Some(r.name.as_str()) != exclude)
            .collect();
        candidates.sort_by(|a, b| {
            a.last_used_seq
                .cmp(&b.last_used_seq)
                .then_with(|| a.name.cmp(&b.name))
        });
        candidates.into_iter().map(|r| r.name.clone()).collect()
    }
}
