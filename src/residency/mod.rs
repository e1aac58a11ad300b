//! Model residency coordination.
//!
//! Mediates access to a memory-bounded accelerator: admission against a
//! fixed budget, LRU eviction of idle models, and leases that keep a model
//! resident while callers use it.

mod adapter;
mod admission;
mod coordinator;
mod error;
mod lease;
mod ledger;
mod preload;
mod status;

pub use adapter::{AdapterError, MockRuntime, RuntimeAdapter};
pub use coordinator::{CoordinatorConfig, ResidencyCoordinator, ShutdownReport};
pub use error::ResidencyError;
pub use lease::{GrantId, Lease};
pub use ledger::{LedgerMetrics, ModelState};
pub use preload::{ModelPreloader, PreloadReport};
pub use status::{ModelStatus, StatusReport};
