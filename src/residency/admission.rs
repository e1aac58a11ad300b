//! Admission control and LRU eviction.
//!
//! Planning is a pure function of a locked ledger. Eviction re-checks each
//! candidate under its transition lock and the ledger lock before unloading,
//! since a waiter may have arrived after the plan was made.

use std::sync::Arc;

use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, warn};

use super::coordinator::Shared;
use super::ledger::{Ledger, ModelState};
use crate::telemetry;

/// Admission decision for one model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Admission {
    /// Fits within the budget now.
    Admit,
    /// Can never fit, whatever is evicted.
    Unserviceable,
    /// Fits once these models (LRU first) are evicted.
    Evict(Vec<String>),
    /// Does not fit even with every idle model evicted; wait for a release.
    Wait,
}

/// Decide whether `name` with admission cost `cost_mb` can become resident.
pub(crate) fn plan_admission(ledger: &Ledger, name: &str, cost_mb: u64) -> Admission {
    let budget = ledger.budget_mb();
    if cost_mb > budget {
        return Admission::Unserviceable;
    }

    let committed = ledger.committed_mb();
    if committed + cost_mb <= budget {
        return Admission::Admit;
    }

    let mut projected = committed;
    let mut chosen = Vec::new();
    for candidate in ledger.eviction_candidates(Some(name)) {
        let freed = ledger.get(&candidate).map_or(0, |r| r.footprint_mb);
        projected = projected.saturating_sub(freed);
        chosen.push(candidate);
        if projected + cost_mb <= budget {
            return Admission::Evict(chosen);
        }
    }

    Admission::Wait
}

/// Result of an eviction pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct EvictionOutcome {
    pub evicted: Vec<String>,
    pub failed: Vec<String>,
}

/// Evict `candidates` in order, skipping any that are busy or in use.
pub(crate) async fn evict(shared: &Arc<Shared>, candidates: &[String]) -> EvictionOutcome {
    let mut outcome = EvictionOutcome::default();
    for name in candidates {
        match evict_one(shared, name).await {
            EvictResult::Evicted => outcome.evicted.push(name.clone()),
            EvictResult::Failed => outcome.failed.push(name.clone()),
            EvictResult::Skipped => {}
        }
    }
    outcome
}

enum EvictResult {
    Evicted,
    Skipped,
    Failed,
}

async fn evict_one(shared: &Arc<Shared>, name: &str) -> EvictResult {
    let transition = match shared.ledger.lock().get(name) {
        Some(r) => r.transition.clone(),
        None => return EvictResult::Skipped,
    };
    let Ok(transition_guard) = transition.try_lock_owned() else {
        debug!(model = %name, "Eviction skipped: transition in progress");
        return EvictResult::Skipped;
    };

    {
        let mut ledger = shared.ledger.lock();
        let Some(resource) = ledger.get_mut(name) else {
            return EvictResult::Skipped;
        };
        if !resource.is_evictable() {
            debug!(
                model = %name,
                state = ?resource.state,
                waiters = resource.waiter_count,
                "Eviction skipped: candidate no longer idle"
            );
            return EvictResult::Skipped;
        }
        resource.state = ModelState::Unloading;
    }

    info!(model = %name, transition = "resident->unloading", "Evicting model");
    // Detached: the entry settles even if this caller is cancelled.
    let task = tokio::spawn(run_unload(shared.clone(), name.to_string(), transition_guard));
    match task.await {
        Ok(result) => result,
        Err(e) => {
            error!(model = %name, error = %e, "Unload task aborted");
            let mut ledger = shared.ledger.lock();
            if let Some(r) = ledger.get_mut(name) {
                if r.state == ModelState::Unloading {
                    r.state = ModelState::Resident;
                }
            }
            drop(ledger);
            shared.budget_changed.notify_waiters();
            EvictResult::Failed
        }
    }
}

/// Unload `name` and settle its entry. Holds the transition lock throughout.
async fn run_unload(
    shared: Arc<Shared>,
    name: String,
    _transition_guard: OwnedMutexGuard<()>,
) -> EvictResult {
    let result = shared.adapter.unload(&name).await;

    let mut ledger = shared.ledger.lock();
    let Some(resource) = ledger.get_mut(&name) else {
        return EvictResult::Skipped;
    };
    let evicted = match result {
        Ok(()) => {
            resource.state = ModelState::Unloaded;
            info!(model = %name, transition = "unloading->unloaded", "Model evicted");
            true
        }
        Err(e) => {
            // Memory is assumed still occupied.
            resource.state = ModelState::Resident;
            resource.last_error = Some(e.to_string());
            error!(
                model = %name,
                transition = "unloading->resident",
                error = %e,
                "Unload failed; model kept resident"
            );
            false
        }
    };
    if evicted {
        ledger.metrics.evictions += 1;
        telemetry::record_eviction(&name);
    } else {
        ledger.metrics.unload_failures += 1;
        telemetry::record_unload_failure(&name);
    }
    telemetry::record_usage(ledger.used_mb(), ledger.budget_mb());
    drop(ledger);

    // Either way the entry left Unloading; callers waiting on it must re-check.
    shared.budget_changed.notify_waiters();
    if evicted {
        EvictResult::Evicted
    } else {
        EvictResult::Failed
    }
}

/// Evict idle LRU models until `committed <= budget` again.
///
/// Runs after a load reported more than its estimate, and after a release
/// while over budget. `protect` is never chosen. Memory already being
/// unloaded counts as freed, so concurrent passes do not over-evict.
pub(crate) async fn rebalance(shared: &Arc<Shared>, protect: Option<&str>) {
    loop {
        let (overshoot, next) = {
            let ledger = shared.ledger.lock();
            let pending = ledger.committed_mb().saturating_sub(ledger.unloading_mb());
            let overshoot = pending.saturating_sub(ledger.budget_mb());
            (overshoot, ledger.eviction_candidates(protect).into_iter().next())
        };
        if overshoot == 0 {
            return;
        }
        let Some(candidate) = next else {
            warn!(
                protect = ?protect,
                overshoot_mb = overshoot,
                "Budget exceeded and no idle model to evict; retrying on next release"
            );
            return;
        };
        debug!(
            protect = ?protect,
            victim = %candidate,
            overshoot_mb = overshoot,
            "Rebalancing budget"
        );
        if !matches!(evict_one(shared, &candidate).await, EvictResult::Evicted) {
            warn!(victim = %candidate, "Rebalance eviction did not free memory");
            return;
        }
    }
}
