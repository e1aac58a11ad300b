//! CLI subcommands for residency-core.
//!
//! Every command runs offline against the resolved configuration; none needs
//! a running process.
//!
//! ## Usage
//!
//! ```bash
//! residency-core config show       # Effective configuration
//! residency-core config validate   # Exit 1 on likely misconfiguration
//! residency-core plan ocr chat     # Dry run against a mock runtime
//! ```

pub mod config_cmd;
pub mod plan_cmd;

pub use config_cmd::{run_defaults, run_show, run_validate};
pub use plan_cmd::{plan, run_plan, PlanReport};

/// Exit code for a configuration that could not be loaded.
pub const EXIT_CONFIG_ERROR: i32 = 2;
