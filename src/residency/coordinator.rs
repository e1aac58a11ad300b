//! Lease lifecycle: acquire, join, queue, release.
//!
//! One ledger mutex guards all bookkeeping and is never held across an
//! adapter call. Loads run on detached tasks so a cancelled caller cannot
//! strand a model in `Loading`. Queued callers wait on a single "budget
//! changed" notification; wake-up order is unspecified.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument};

use super::adapter::RuntimeAdapter;
use super::admission::{self, Admission};
use super::error::ResidencyError;
use super::lease::{GrantId, Lease, PendingGrant};
use super::ledger::{Ledger, LoadOutcome, ModelState};
use super::status::{self, StatusReport};
use crate::telemetry::{self, LeaseSpan};

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// When false, leases bypass the ledger and models load unconditionally.
    pub enabled: bool,
    pub budget_mb: u64,
    pub default_timeout: Duration,
    /// Estimate for models without a configured one; 0 means unknown.
    pub default_estimate_mb: u64,
    pub estimates: HashMap<String, u64>,
    /// Models to load at startup, in order.
    pub preload: Vec<String>,
    pub shutdown_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            budget_mb: 12_000,
            default_timeout: Duration::from_secs(120),
            default_estimate_mb: 0,
            estimates: HashMap::new(),
            preload: Vec::new(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Result of [`ResidencyCoordinator::shutdown`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    /// Whether every lease was released before the drain timeout.
    pub drained: bool,
    pub unloaded: Vec<String>,
    pub remaining_leases: u32,
}

/// State shared between the coordinator, its leases and its load tasks.
pub(crate) struct Shared {
    pub ledger: Mutex<Ledger>,
    pub budget_changed: Notify,
    pub adapter: Arc<dyn RuntimeAdapter>,
}

impl Shared {
    /// Retire a grant and wake queued acquirers.
    ///
    /// If the ledger is still over budget (a load reported more than its
    /// estimate while every other model was leased), a rebalance pass is
    /// started now that this model may be evictable.
    pub fn release_grant(self: &Arc<Self>, grant: GrantId) -> Result<(), ResidencyError> {
        let released = {
            let mut ledger = self.ledger.lock();
            ledger.release(grant).map(|model| {
                let pending = ledger.committed_mb().saturating_sub(ledger.unloading_mb());
                (model, pending > ledger.budget_mb())
            })
        };
        match released {
            Ok((model, over_budget)) => {
                debug!(model = %model, grant = %grant, "Lease released");
                self.budget_changed.notify_waiters();
                if over_budget {
                    self.spawn_rebalance();
                }
                Ok(())
            }
            Err(e) => {
                error!(grant = %grant, "Lease released twice or never granted");
                Err(e)
            }
        }
    }

    fn spawn_rebalance(self: &Arc<Self>) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let shared = self.clone();
                handle.spawn(async move { admission::rebalance(&shared, None).await });
            }
            Err(_) => {
                warn!("Over budget after release but no runtime to rebalance on");
            }
        }
    }
}

/// One step of the acquire loop, decided under the ledger lock.
enum Step {
    Granted(Lease),
    Join(PendingGrant, watch::Receiver<LoadOutcome>),
    Load(PendingGrant, watch::Receiver<LoadOutcome>, LoadTask),
    Evict(Vec<String>),
    Wait,
}

/// Everything a detached load needs.
struct LoadTask {
    name: String,
    tx: watch::Sender<LoadOutcome>,
    transition: Arc<tokio::sync::Mutex<()>>,
}

/// Process-wide coordinator for accelerator model residency.
pub struct ResidencyCoordinator {
    config: CoordinatorConfig,
    shared: Arc<Shared>,
    bypass_grants: AtomicU64,
}

impl ResidencyCoordinator {
    pub fn new(config: CoordinatorConfig, adapter: Arc<dyn RuntimeAdapter>) -> Self {
        let ledger = Ledger::new(
            config.budget_mb,
            config.default_estimate_mb,
            config.estimates.clone(),
        );
        Self {
            config,
            shared: Arc::new(Shared {
                ledger: Mutex::new(ledger),
                budget_changed: Notify::new(),
                adapter,
            }),
            bypass_grants: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Acquire a lease on `name`, waiting at most `timeout` for admission.
    pub async fn acquire(&self, name: &str, timeout: Duration) -> Result<Lease, ResidencyError> {
        let started = Instant::now();
        let span = LeaseSpan::new(name);
        let result = if self.config.enabled {
            self.acquire_coordinated(name, timeout)
                .instrument(span.span().clone())
                .await
        } else {
            self.acquire_bypass(name)
                .instrument(span.span().clone())
                .await
        };
        span.record_outcome(&result, started.elapsed());
        result
    }

    /// Acquire with the configured default timeout.
    pub async fn acquire_default(&self, name: &str) -> Result<Lease, ResidencyError> {
        self.acquire(name, self.config.default_timeout).await
    }

    /// Run `work` while holding a lease on `name`; the lease is released on
    /// every exit path, including panics inside `work`.
    pub async fn with_lease<F, Fut, T>(&self, name: &str, work: F) -> Result<T, ResidencyError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let lease = self.acquire_default(name).await?;
        let output = work().await;
        lease.release()?;
        Ok(output)
    }

    /// Release a lease. Equivalent to [`Lease::release`].
    pub fn release(&self, lease: Lease) -> Result<(), ResidencyError> {
        lease.release()
    }

    /// Release by grant id. A second release of the same id is a usage error.
    pub fn release_grant(&self, grant: GrantId) -> Result<(), ResidencyError> {
        self.shared.release_grant(grant)
    }

    /// Snapshot of the ledger. Never waits on an in-flight load or unload.
    pub fn status(&self) -> StatusReport {
        let ledger = self.shared.ledger.lock();
        status::snapshot(&ledger, self.config.enabled)
    }

    /// Evict idle models whose last use is at least `idle_for` ago.
    pub async fn evict_idle(&self, idle_for: Duration) -> Vec<String> {
        let stale: Vec<String> = {
            let ledger = self.shared.ledger.lock();
            let now = chrono::Utc::now();
            ledger
                .eviction_candidates(None)
                .into_iter()
                .filter(|name| {
                    ledger
                        .get(name)
                        .and_then(|r| r.last_used_at)
                        .and_then(|at| now.signed_duration_since(at).to_std().ok())
                        .map_or(false, |idle| idle >= idle_for)
                })
                .collect()
        };
        if stale.is_empty() {
            return stale;
        }
        let outcome = admission::evict(&self.shared, &stale).await;
        info!(evicted = ?outcome.evicted, failed = ?outcome.failed, "Idle eviction pass");
        outcome.evicted
    }

    /// Stop admitting, drain outstanding leases, then unload every idle model.
    pub async fn shutdown(&self, drain_timeout: Duration) -> ShutdownReport {
        self.shared.ledger.lock().stop_accepting();
        self.shared.budget_changed.notify_waiters();
        info!(timeout_ms = drain_timeout.as_millis() as u64, "Coordinator draining");

        let deadline = Instant::now() + drain_timeout;
        let drained = loop {
            let notified = self.shared.budget_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.total_waiters() == 0 {
                break true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break self.total_waiters() == 0;
            }
        };

        let idle = self.shared.ledger.lock().eviction_candidates(None);
        let outcome = admission::evict(&self.shared, &idle).await;
        let remaining_leases =
            u32::try_from(self.shared.ledger.lock().outstanding_grants()).unwrap_or(u32::MAX);
        if drained {
            info!(unloaded = ?outcome.evicted, "Coordinator shut down");
        } else {
            warn!(remaining_leases, "Drain timed out; leased models left resident");
        }
        ShutdownReport {
            drained,
            unloaded: outcome.evicted,
            remaining_leases,
        }
    }

    fn total_waiters(&self) -> u32 {
        self.shared
            .ledger
            .lock()
            .resources()
            .map(|r| r.waiter_count)
            .sum()
    }

    async fn acquire_bypass(&self, name: &str) -> Result<Lease, ResidencyError> {
        let adapter = &self.shared.adapter;
        if !adapter.is_resident(name).await {
            adapter.load(name).await.map_err(|e| {
                error!(model = %name, error = %e, "Unconditional load failed");
                ResidencyError::LoadFailed(name.to_string())
            })?;
        }
        let grant = GrantId::new(self.bypass_grants.fetch_add(1, Ordering::Relaxed));
        Ok(Lease::bypass(grant, name.to_string()))
    }

    async fn acquire_coordinated(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<Lease, ResidencyError> {
        let started = Instant::now();
        let deadline = started + timeout;

        loop {
            // Register before checking so a release in between is not missed.
            let notified = self.shared.budget_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.admission_step(name)? {
                Step::Granted(lease) => return Ok(lease),
                Step::Join(pending, rx) => {
                    debug!(model = %name, "Joining in-flight load");
                    return self.await_load(pending, rx, deadline, started).await;
                }
                Step::Load(pending, rx, task) => {
                    tokio::spawn(run_load(self.shared.clone(), task));
                    return self.await_load(pending, rx, deadline, started).await;
                }
                Step::Evict(candidates) => {
                    let outcome = admission::evict(&self.shared, &candidates).await;
                    if !outcome.evicted.is_empty() {
                        continue;
                    }
                    if let Some(failed) = outcome.failed.into_iter().next() {
                        return Err(ResidencyError::UnloadFailed(failed));
                    }
                    // Every candidate was claimed meanwhile; wait like any queued caller.
                }
                Step::Wait => {}
            }

            debug!(model = %name, "Queued for budget");
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(self.timed_out(name, started));
            }
        }
    }

    fn admission_step(&self, name: &str) -> Result<Step, ResidencyError> {
        let mut ledger = self.shared.ledger.lock();
        if !ledger.is_accepting() {
            return Err(ResidencyError::ShuttingDown);
        }

        let entry = ledger.entry(name);
        match entry.state {
            ModelState::Resident => {
                ledger.add_waiter(name);
                let grant = ledger.issue_grant(name);
                telemetry::record_lease_granted(name);
                debug!(model = %name, grant = %grant, "Lease granted on resident model");
                return Ok(Step::Granted(Lease::new(
                    grant,
                    name.to_string(),
                    self.shared.clone(),
                )));
            }
            ModelState::Loading => {
                let Some(rx) = entry.load_watch.clone() else {
                    return Ok(Step::Wait);
                };
                ledger.add_waiter(name);
                let pending = PendingGrant::new(self.shared.clone(), name.to_string());
                return Ok(Step::Join(pending, rx));
            }
            ModelState::Unloading => return Ok(Step::Wait),
            ModelState::Unloaded | ModelState::LoadFailed => {}
        }

        let cost = entry.admission_cost();
        match admission::plan_admission(&ledger, name, cost) {
            Admission::Unserviceable => {
                let budget_mb = ledger.budget_mb();
                warn!(model = %name, required_mb = cost, budget_mb, "Model can never fit the budget");
                Err(ResidencyError::Unserviceable {
                    model: name.to_string(),
                    required_mb: cost,
                    budget_mb,
                })
            }
            Admission::Admit => {
                let (tx, rx) = watch::channel(None);
                let entry = ledger.entry(name);
                entry.state = ModelState::Loading;
                entry.reserved_mb = cost;
                entry.load_watch = Some(rx.clone());
                let transition = entry.transition.clone();
                ledger.add_waiter(name);
                info!(model = %name, reserved_mb = cost, transition = "unloaded->loading", "Admitted");
                let pending = PendingGrant::new(self.shared.clone(), name.to_string());
                let task = LoadTask {
                    name: name.to_string(),
                    tx,
                    transition,
                };
                Ok(Step::Load(pending, rx, task))
            }
            Admission::Evict(candidates) => {
                debug!(model = %name, victims = ?candidates, "Admission requires eviction");
                Ok(Step::Evict(candidates))
            }
            Admission::Wait => Ok(Step::Wait),
        }
    }

    async fn await_load(
        &self,
        pending: PendingGrant,
        mut rx: watch::Receiver<LoadOutcome>,
        deadline: Instant,
        started: Instant,
    ) -> Result<Lease, ResidencyError> {
        let outcome = match tokio::time::timeout_at(deadline, rx.wait_for(Option::is_some)).await
        {
            Ok(Ok(current)) => current.clone(),
            Ok(Err(_)) => None,
            Err(_) => {
                let model = pending.model().to_string();
                drop(pending);
                return Err(self.timed_out(&model, started));
            }
        };

        match outcome {
            Some(Ok(())) => {
                let lease = pending.into_lease();
                debug!(model = %lease.model(), grant = %lease.grant_id(), "Lease granted after load");
                Ok(lease)
            }
            Some(Err(e)) => Err(e),
            None => {
                let model = pending.model().to_string();
                drop(pending);
                self.reset_abandoned_load(&model);
                Err(ResidencyError::LoadFailed(model))
            }
        }
    }

    /// Recover an entry whose load task died without publishing an outcome.
    fn reset_abandoned_load(&self, name: &str) {
        let mut ledger = self.shared.ledger.lock();
        if let Some(r) = ledger.get_mut(name) {
            let abandoned = r
                .load_watch
                .as_ref()
                .map_or(false, |w| w.has_changed().is_err());
            if r.state == ModelState::Loading && abandoned {
                error!(model = %name, transition = "loading->unloaded", "Load task vanished");
                r.state = ModelState::Unloaded;
                r.reserved_mb = 0;
                r.load_watch = None;
            }
        }
        drop(ledger);
        self.shared.budget_changed.notify_waiters();
    }

    fn timed_out(&self, name: &str, started: Instant) -> ResidencyError {
        self.shared.ledger.lock().metrics.admission_timeouts += 1;
        telemetry::record_admission_timeout(name);
        let waited_ms = started.elapsed().as_millis() as u64;
        warn!(model = %name, waited_ms, "Admission timed out");
        ResidencyError::Timeout {
            model: name.to_string(),
            waited_ms,
        }
    }
}

/// Load a model on behalf of every caller joined on `task.tx`.
async fn run_load(shared: Arc<Shared>, task: LoadTask) {
    let LoadTask {
        name,
        tx,
        transition,
    } = task;
    let _transition_guard = transition.lock_owned().await;

    let started = std::time::Instant::now();
    let outcome = match shared.adapter.load(&name).await {
        Ok(footprint_mb) => {
            telemetry::record_load_latency(&name, started.elapsed());
            finish_load(&shared, &name, footprint_mb).await
        }
        Err(e) => {
            let mut ledger = shared.ledger.lock();
            ledger.metrics.load_failures += 1;
            if let Some(r) = ledger.get_mut(&name) {
                r.state = ModelState::LoadFailed;
                r.last_error = Some(e.to_string());
                error!(model = %name, transition = "loading->load_failed", error = %e, "Load failed");
                r.state = ModelState::Unloaded;
                r.reserved_mb = 0;
                r.load_watch = None;
            }
            telemetry::record_load_failure(&name);
            Err(ResidencyError::LoadFailed(name.clone()))
        }
    };

    // Receivers may all be gone (every caller timed out); that is fine.
    let _ = tx.send(Some(outcome));
    shared.budget_changed.notify_waiters();
}

/// Record a successful load, enforcing the budget against the real footprint.
async fn finish_load(
    shared: &Arc<Shared>,
    name: &str,
    footprint_mb: u64,
) -> Result<(), ResidencyError> {
    let budget_mb = {
        let mut ledger = shared.ledger.lock();
        let budget_mb = ledger.budget_mb();
        let entry = ledger.entry(name);
        let estimate = entry.reserved_mb;
        entry.footprint_mb = footprint_mb;
        entry.reserved_mb = 0;
        entry.load_watch = None;
        if footprint_mb > budget_mb {
            entry.state = ModelState::Unloading;
        } else {
            entry.state = ModelState::Resident;
            entry.last_error = None;
            if footprint_mb > estimate {
                debug!(model = %name, estimate_mb = estimate, footprint_mb, "Footprint above estimate");
            }
        }
        telemetry::record_usage(ledger.used_mb(), budget_mb);
        budget_mb
    };

    if footprint_mb <= budget_mb {
        info!(model = %name, footprint_mb, transition = "loading->resident", "Model resident");
        admission::rebalance(shared, Some(name)).await;
        return Ok(());
    }

    error!(
        model = %name,
        footprint_mb,
        budget_mb,
        "Loaded footprint exceeds the whole budget; unloading"
    );
    let unloaded = shared.adapter.unload(name).await;
    let mut ledger = shared.ledger.lock();
    if let Err(e) = unloaded {
        ledger.metrics.unload_failures += 1;
        telemetry::record_unload_failure(name);
        error!(model = %name, error = %e, "Unload of oversized model failed");
    }
    if let Some(r) = ledger.get_mut(name) {
        r.state = ModelState::Unloaded;
    }
    Err(ResidencyError::Unserviceable {
        model: name.to_string(),
        required_mb: footprint_mb,
        budget_mb,
    })
}
