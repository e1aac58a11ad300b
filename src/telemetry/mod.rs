//! Telemetry module for Residency-CORE.
//!
//! Provides structured logging, lease spans, and metrics facade recording.

mod logging;
mod metrics;
mod spans;

pub use self::logging::{init_logging, LogConfig, LogError, LogFormat};
pub use self::metrics::{
    record_admission_timeout, record_eviction, record_lease_granted, record_load_failure,
    record_load_latency, record_unload_failure, record_usage,
};
pub use self::spans::LeaseSpan;
