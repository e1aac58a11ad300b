//! Configuration loading from environment variables and an optional TOML file.
//!
//! Values resolve as defaults, then the file named by `RESIDENCY_CONFIG`,
//! then `RESIDENCY_*` environment variables. Invalid environment values fall
//! back to the lower layer without crashing; a malformed file is an error.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `RESIDENCY_CONFIG` | unset | Path to a TOML config file |
//! | `RESIDENCY_ENABLED` | true | Coordinator on/off (off = bypass) |
//! | `RESIDENCY_BUDGET_MB` | 12000 | Accelerator memory budget (MB) |
//! | `RESIDENCY_WAIT_TIMEOUT_SECS` | 120 | Default acquire wait (secs) |
//! | `RESIDENCY_DEFAULT_ESTIMATE_MB` | 0 | Estimate for unlisted models (0 = unknown) |
//! | `RESIDENCY_PRELOAD` | empty | Comma-separated preload list |
//! | `RESIDENCY_ESTIMATES` | empty | `name=mb,name=mb` footprint estimates |
//! | `RESIDENCY_SHUTDOWN_TIMEOUT_SECS` | 30 | Lease drain timeout (secs) |
//! | `RESIDENCY_LOG_FORMAT` | json | `json` or `pretty` |
//! | `RESIDENCY_LOG_LEVEL` | info | Tracing filter directive |

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::residency::CoordinatorConfig;
use crate::telemetry::{LogConfig, LogFormat};

pub const ENV_CONFIG_FILE: &str = "RESIDENCY_CONFIG";

/// Serializes env-mutating tests across modules.
#[cfg(test)]
pub(crate) static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
pub(crate) const ENV_KEYS: &[&str] = &[
    "RESIDENCY_CONFIG",
    "RESIDENCY_ENABLED",
    "RESIDENCY_BUDGET_MB",
    "RESIDENCY_WAIT_TIMEOUT_SECS",
    "RESIDENCY_DEFAULT_ESTIMATE_MB",
    "RESIDENCY_PRELOAD",
    "RESIDENCY_ESTIMATES",
    "RESIDENCY_SHUTDOWN_TIMEOUT_SECS",
    "RESIDENCY_LOG_FORMAT",
    "RESIDENCY_LOG_LEVEL",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file: {0}")]
    Parse(String),
}

/// All resolved configuration.
#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    pub coordinator: CoordinatorConfig,
    pub log: LogConfig,
}

/// Effective configuration summary (serializable).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectiveConfig {
    pub enabled: bool,
    pub budget_mb: u64,
    pub wait_timeout_secs: u64,
    pub default_estimate_mb: u64,
    pub preload: Vec<String>,
    pub estimates: Vec<(String, u64)>,
    pub shutdown_timeout_secs: u64,
    pub log_format: String,
    pub log_level: String,
}

/// On-disk layout of the TOML file. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    enabled: Option<bool>,
    budget_mb: Option<u64>,
    wait_timeout_secs: Option<u64>,
    default_estimate_mb: Option<u64>,
    preload: Option<Vec<String>>,
    estimates: Option<HashMap<String, u64>>,
    shutdown_timeout_secs: Option<u64>,
    log_format: Option<String>,
    log_level: Option<String>,
}

fn parse_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok()?.trim().parse::<u64>().ok()
}

fn parse_bool(key: &str) -> Option<bool> {
    match std::env::var(key).ok()?.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Split a comma-separated list, dropping blanks.
fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse `name=mb` pairs; malformed pairs are skipped.
fn parse_estimates(value: &str) -> HashMap<String, u64> {
    value
        .split(',')
        .filter_map(|pair| {
            let (name, mb) = pair.split_once('=')?;
            let name = name.trim();
            let mb = mb.trim().parse::<u64>().ok()?;
            (!name.is_empty()).then(|| (name.to_string(), mb))
        })
        .collect()
}

fn apply_file(config: &mut EnvConfig, file: FileConfig) {
    let c = &mut config.coordinator;
    if let Some(v) = file.enabled {
        c.enabled = v;
    }
    if let Some(v) = file.budget_mb {
        c.budget_mb = v;
    }
    if let Some(v) = file.wait_timeout_secs {
        c.default_timeout = Duration::from_secs(v);
    }
    if let Some(v) = file.default_estimate_mb {
        c.default_estimate_mb = v;
    }
    if let Some(v) = file.preload {
        c.preload = v;
    }
    if let Some(v) = file.estimates {
        c.estimates = v;
    }
    if let Some(v) = file.shutdown_timeout_secs {
        c.shutdown_timeout = Duration::from_secs(v);
    }
    if let Some(format) = file.log_format.as_deref().and_then(LogFormat::parse) {
        config.log.format = format;
    }
    if let Some(level) = file.log_level {
        config.log.level = level;
    }
}

fn apply_env(config: &mut EnvConfig) {
    let c = &mut config.coordinator;
    if let Some(v) = parse_bool("RESIDENCY_ENABLED") {
        c.enabled = v;
    }
    if let Some(v) = parse_u64("RESIDENCY_BUDGET_MB") {
        c.budget_mb = v;
    }
    if let Some(v) = parse_u64("RESIDENCY_WAIT_TIMEOUT_SECS") {
        c.default_timeout = Duration::from_secs(v);
    }
    if let Some(v) = parse_u64("RESIDENCY_DEFAULT_ESTIMATE_MB") {
        c.default_estimate_mb = v;
    }
    if let Ok(v) = std::env::var("RESIDENCY_PRELOAD") {
        c.preload = parse_list(&v);
    }
    if let Ok(v) = std::env::var("RESIDENCY_ESTIMATES") {
        c.estimates.extend(parse_estimates(&v));
    }
    if let Some(v) = parse_u64("RESIDENCY_SHUTDOWN_TIMEOUT_SECS") {
        c.shutdown_timeout = Duration::from_secs(v);
    }
    if let Some(format) = std::env::var("RESIDENCY_LOG_FORMAT")
        .ok()
        .as_deref()
        .and_then(LogFormat::parse)
    {
        config.log.format = format;
    }
    if let Ok(level) = std::env::var("RESIDENCY_LOG_LEVEL") {
        if !level.trim().is_empty() {
            config.log.level = level;
        }
    }
}

/// Floors: budget >= 1 MB, timeouts >= 1s.
fn clamp(config: &mut EnvConfig) {
    let c = &mut config.coordinator;
    c.budget_mb = c.budget_mb.max(1);
    c.default_timeout = c.default_timeout.max(Duration::from_secs(1));
    c.shutdown_timeout = c.shutdown_timeout.max(Duration::from_secs(1));
}

/// Parse a TOML document layered over the defaults (no environment).
pub fn from_toml_str(document: &str) -> Result<EnvConfig, ConfigError> {
    let file: FileConfig =
        toml::from_str(document).map_err(|e| ConfigError::Parse(e.to_string()))?;
    let mut config = EnvConfig::default();
    apply_file(&mut config, file);
    clamp(&mut config);
    Ok(config)
}

/// Load a TOML file, then apply environment overrides.
pub fn load_with_file(path: &Path) -> Result<EnvConfig, ConfigError> {
    let document = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut config = from_toml_str(&document)?;
    apply_env(&mut config);
    clamp(&mut config);
    Ok(config)
}

/// Load all configuration. Reads the `RESIDENCY_CONFIG` file when set.
pub fn load() -> Result<EnvConfig, ConfigError> {
    if let Ok(path) = std::env::var(ENV_CONFIG_FILE) {
        if !path.trim().is_empty() {
            return load_with_file(Path::new(path.trim()));
        }
    }
    let mut config = EnvConfig::default();
    apply_env(&mut config);
    clamp(&mut config);
    Ok(config)
}

impl EnvConfig {
    /// Return a serializable summary of all effective values.
    pub fn effective_config(&self) -> EffectiveConfig {
        let c = &self.coordinator;
        let mut estimates: Vec<(String, u64)> =
            c.estimates.iter().map(|(k, v)| (k.clone(), *v)).collect();
        estimates.sort();
        EffectiveConfig {
            enabled: c.enabled,
            budget_mb: c.budget_mb,
            wait_timeout_secs: c.default_timeout.as_secs(),
            default_estimate_mb: c.default_estimate_mb,
            preload: c.preload.clone(),
            estimates,
            shutdown_timeout_secs: c.shutdown_timeout.as_secs(),
            log_format: self.log.format.as_str().to_string(),
            log_level: self.log.level.clone(),
        }
    }

    /// Human-readable warnings about likely misconfiguration.
    pub fn warnings(&self) -> Vec<String> {
        let c = &self.coordinator;
        let mut warnings = Vec::new();

        let mut estimates: Vec<(&String, &u64)> = c.estimates.iter().collect();
        estimates.sort();
        for (name, mb) in estimates {
            if *mb > c.budget_mb {
                warnings.push(format!(
                    "estimate for {name} ({mb} MB) exceeds RESIDENCY_BUDGET_MB ({}); it can never load",
                    c.budget_mb
                ));
            }
        }

        let estimate_of = |name: &str| c.estimates.get(name).copied().unwrap_or(c.default_estimate_mb);
        let preload_total: u64 = c.preload.iter().map(|n| estimate_of(n)).sum();
        if preload_total > c.budget_mb {
            warnings.push(format!(
                "preload set needs {preload_total} MB but budget is {} MB; early entries will be evicted",
                c.budget_mb
            ));
        }
        for name in &c.preload {
            if estimate_of(name) == 0 {
                warnings.push(format!("preload model {name} has no footprint estimate"));
            }
        }

        if !c.enabled && !c.preload.is_empty() {
            warnings.push("coordinator disabled; preload loads without budget enforcement".into());
        }
        warnings
    }
}
