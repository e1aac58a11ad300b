//! Config CLI subcommands: show, defaults, validate.

use super::EXIT_CONFIG_ERROR;
use crate::config::{self, EffectiveConfig, EnvConfig};

/// Print effective config as key-value pairs to stdout.
pub fn run_show() -> i32 {
    match config::load() {
        Ok(env) => {
            print_config(&env.effective_config());
            0
        }
        Err(e) => {
            eprintln!("ERROR: {e}");
            EXIT_CONFIG_ERROR
        }
    }
}

/// Print default config values (no file, no env overrides) to stdout.
pub fn run_defaults() {
    print_config(&EnvConfig::default().effective_config());
}

/// Validate configuration for obvious misconfigurations.
///
/// Returns 0 if valid, 1 if any warnings are found, 2 if it cannot be loaded.
pub fn run_validate() -> i32 {
    match config::load() {
        Ok(env) => validate(&env),
        Err(e) => {
            eprintln!("ERROR: {e}");
            EXIT_CONFIG_ERROR
        }
    }
}

fn validate(env: &EnvConfig) -> i32 {
    let warnings = env.warnings();
    for warning in &warnings {
        eprintln!("WARNING: {warning}");
    }
    if warnings.is_empty() {
        println!("Configuration is valid.");
        0
    } else {
        1
    }
}

fn print_config(cfg: &EffectiveConfig) {
    let estimates: Vec<String> = cfg.estimates.iter().map(|(n, mb)| format!("{n}={mb}")).collect();
    println!("RESIDENCY_ENABLED={}", cfg.enabled);
    println!("RESIDENCY_BUDGET_MB={}", cfg.budget_mb);
    println!("RESIDENCY_WAIT_TIMEOUT_SECS={}", cfg.wait_timeout_secs);
    println!("RESIDENCY_DEFAULT_ESTIMATE_MB={}", cfg.default_estimate_mb);
    println!("RESIDENCY_PRELOAD={}", cfg.preload.join(","));
    println!("RESIDENCY_ESTIMATES={}", estimates.join(","));
    println!("RESIDENCY_SHUTDOWN_TIMEOUT_SECS={}", cfg.shutdown_timeout_secs);
    println!("RESIDENCY_LOG_FORMAT={}", cfg.log_format);
    println!("RESIDENCY_LOG_LEVEL={}", cfg.log_level);
}
