//! Undertow CLI - Command-line interface
//!
//! Runs deterministic scheduler scenarios and live loopback transfers.

mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use undertow_core::UndertowError;
use undertow_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "undertow")]
#[command(about = "Peer network engine: tick scheduler, transports and rate limiting")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: commands::Commands,

    /// Console log level (RUST_LOG overrides)
    #[arg(long, default_value = "info")]
    log_level: CliLogLevel,

    /// Directory for the per-run debug log
    #[arg(long)]
    logs_dir: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = init_tracing(cli.log_level.as_tracing_level(), cli.logs_dir.as_deref()) {
        eprintln!("Failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    match commands::handle_command(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<UndertowError>() {
                Some(engine_error) => eprintln!("Error: {}", engine_error.user_message()),
                None => eprintln!("Error: {e:#}"),
            }
            tracing::debug!("Command failed: {e:?}");
            ExitCode::FAILURE
        }
    }
}
