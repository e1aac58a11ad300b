//! Lease acquisition spans.

use std::time::Duration;

use tracing::{info_span, Span};

use crate::residency::{Lease, ResidencyError};

/// Span covering one `acquire` call, from first admission check to grant.
#[derive(Debug, Clone)]
pub struct LeaseSpan {
    span: Span,
}

impl LeaseSpan {
    pub fn new(model: &str) -> Self {
        let span = info_span!(
            "lease_acquire",
            model = %model,
            status = tracing::field::Empty,
            grant = tracing::field::Empty,
            bypass = tracing::field::Empty,
            waited_ms = tracing::field::Empty,
            error.kind = tracing::field::Empty,
            error.message = tracing::field::Empty,
        );
        Self { span }
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Fill in the outcome: grant id on success, error kind otherwise.
    /// `waited` is the time from the call until the outcome was known.
    pub fn record_outcome(&self, result: &Result<Lease, ResidencyError>, waited: Duration) {
        let waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX);
        self.span.record("waited_ms", waited_ms);
        match result {
            Ok(lease) => {
                self.span.record("status", "granted");
                self.span.record("grant", lease.grant_id().id());
                self.span.record("bypass", lease.is_bypass());
            }
            Err(e) => {
                self.span.record("status", "rejected");
                self.span.record("error.kind", e.kind());
                self.span.record("error.message", e.to_string().as_str());
            }
        }
    }
}
