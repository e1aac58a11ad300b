//! residency-core entry point.
//!
//! ## CLI Subcommands
//!
//! - `residency-core config show|defaults|validate` - Inspect configuration
//! - `residency-core plan [NAME...]` - Capacity dry run against a mock runtime

use std::process::ExitCode;

use residency_core::cli::{self, config_cmd};
use residency_core::config as residency_config;
use residency_core::telemetry::{init_logging, LogConfig};

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("help");

    match command {
        "config" => {
            let subcommand = args.get(2).map(|s| s.as_str()).unwrap_or("show");
            match subcommand {
                "show" => exit_code(config_cmd::run_show()),
                "defaults" => {
                    config_cmd::run_defaults();
                    ExitCode::SUCCESS
                }
                "validate" => exit_code(config_cmd::run_validate()),
                _ => {
                    eprintln!("Unknown config subcommand: {}", subcommand);
                    print_command_help("config");
                    ExitCode::FAILURE
                }
            }
        }
        "plan" => {
            init_cli_logging();
            let names = &args[2..];
            exit_code(cli::run_plan(names).await)
        }
        "help" | "--help" | "-h" => {
            if let Some(subcommand) = args.get(2) {
                print_command_help(subcommand);
            } else {
                print_usage();
            }
            ExitCode::SUCCESS
        }
        "version" | "--version" | "-V" => {
            println!("residency-core {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
        _ => {
            eprintln!("Unknown command: {}", command);
            print_usage();
            ExitCode::FAILURE
        }
    }
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

/// Logs go to stderr so stdout stays machine-readable.
fn init_cli_logging() {
    let log = residency_config::load()
        .map(|env| env.log)
        .unwrap_or_else(|_| LogConfig::default());
    if let Err(e) = init_logging(&log) {
        eprintln!("Logging disabled: {}", e);
    }
}

fn print_usage() {
    let version = env!("CARGO_PKG_VERSION");
    eprintln!(
        "residency-core - accelerator model residency coordinator v{}

USAGE:
    residency-core [COMMAND] [OPTIONS]

COMMANDS:
    config       Inspect configuration (show, defaults, validate)
    plan         Dry-run preload and acquisition against the budget
    version      Show version information
    help         Show this help message

EXAMPLES:
    residency-core config show
    residency-core config validate
    RESIDENCY_ESTIMATES=ocr=4700,chat=6000 residency-core plan ocr chat

ENVIRONMENT:
    RESIDENCY_CONFIG              TOML config file (env vars override it)
    RESIDENCY_ENABLED             Coordinator on/off (default: true)
    RESIDENCY_BUDGET_MB           Accelerator budget in MB (default: 12000)
    RESIDENCY_WAIT_TIMEOUT_SECS   Default acquire wait (default: 120)
    RESIDENCY_DEFAULT_ESTIMATE_MB Estimate for unlisted models (default: 0)
    RESIDENCY_PRELOAD             Comma-separated preload list
    RESIDENCY_ESTIMATES           name=mb,name=mb footprint estimates
    RESIDENCY_SHUTDOWN_TIMEOUT_SECS Lease drain timeout (default: 30)
    RESIDENCY_LOG_FORMAT          json or pretty (default: json)
    RESIDENCY_LOG_LEVEL           Tracing filter (default: info)

EXIT CODES:
    0  Success
    1  Warnings or failed requests
    2  Configuration error
",
        version
    );
}

/// Print detailed help for a specific command.
fn print_command_help(command: &str) {
    match command {
        "config" => {
            eprintln!(
                "residency-core config - Inspect configuration

USAGE:
    residency-core config <SUBCOMMAND>

SUBCOMMANDS:
    show           Show effective configuration (file + environment)
    defaults       Show built-in defaults
    validate       Warn about estimates or preload sets that exceed the budget

EXAMPLES:
    residency-core config show
    RESIDENCY_CONFIG=/etc/residency.toml residency-core config validate
"
            );
        }
        "plan" => {
            eprintln!(
                "residency-core plan - Capacity dry run

USAGE:
    residency-core plan [NAME...]

DESCRIPTION:
    Preloads the configured list, then acquires and releases each NAME in
    order against a mock runtime whose footprints are the configured
    estimates. Prints the final status JSON to stdout.

EXIT CODES:
    0  Every preload and request succeeded
    1  At least one model failed (e.g. unserviceable)
    2  Configuration error
"
            );
        }
        _ => {
            eprintln!(
                "No detailed help available for '{}'. Use 'residency-core help' for general usage.",
                command
            );
        }
    }
}
