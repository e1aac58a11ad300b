//! Leases: a caller's scoped right to use a resident model.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::coordinator::Shared;
use super::error::ResidencyError;

/// Monotonic identifier of one successful acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GrantId(u64);

impl GrantId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for GrantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// RAII lease on a resident model. Dropping it releases the grant.
///
/// Bypass leases (coordinator disabled) carry no ledger state and release is a no-op.
pub struct Lease {
    grant: GrantId,
    model: String,
    shared: Option<Arc<Shared>>,
    released: bool,
}

impl Lease {
    pub(crate) fn new(grant: GrantId, model: String, shared: Arc<Shared>) -> Self {
        Self {
            grant,
            model,
            shared: Some(shared),
            released: false,
        }
    }

    pub(crate) fn bypass(grant: GrantId, model: String) -> Self {
        Self {
            grant,
            model,
            shared: None,
            released: false,
        }
    }

    pub fn grant_id(&self) -> GrantId {
        self.grant
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn is_bypass(&self) -> bool {
        self.shared.is_none()
    }

    /// Release explicitly. Fails with a usage error if the grant was
    /// already released by id.
    pub fn release(mut self) -> Result<(), ResidencyError> {
        self.released = true;
        match &self.shared {
            Some(shared) => shared.release_grant(self.grant),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("grant", &self.grant)
            .field("model", &self.model)
            .field("bypass", &self.is_bypass())
            .finish()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Some(shared) = &self.shared {
            // Errors are already logged by release_grant.
            let _ = shared.release_grant(self.grant);
        }
    }
}

/// A caller counted as a waiter on a model that is still loading.
///
/// Dropped without [`into_lease`](Self::into_lease) (timeout, failure,
/// cancellation) it takes the waiter count back.
pub(crate) struct PendingGrant {
    shared: Arc<Shared>,
    model: String,
    armed: bool,
}

impl PendingGrant {
    /// Caller must already have added a waiter for `model`.
    pub fn new(shared: Arc<Shared>, model: String) -> Self {
        Self {
            shared,
            model,
            armed: true,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Convert into a lease once the model is resident.
    pub fn into_lease(mut self) -> Lease {
        self.armed = false;
        let grant = self.shared.ledger.lock().issue_grant(&self.model);
        crate::telemetry::record_lease_granted(&self.model);
        Lease::new(grant, std::mem::take(&mut self.model), self.shared.clone())
    }
}

impl Drop for PendingGrant {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.shared.ledger.lock().remove_waiter(&self.model);
        self.shared.budget_changed.notify_waiters();
    }
}
