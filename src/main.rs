//! driftsync CLI - real-time directory replicator
//!
//! Usage: driftsync <command> [arguments]

mod cli;
mod run_cmd;
mod sync_cmd;

use std::process::ExitCode;

use cli::Command;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();

    // Handle help and version flags before parsing
    if let Some(first) = args.first() {
        match first.as_str() {
            "--help" | "-h" => {
                cli::print_usage();
                return ExitCode::SUCCESS;
            }
            "--version" | "-V" => {
                cli::print_version();
                return ExitCode::SUCCESS;
            }
            _ => {}
        }
    }

    if args.is_empty() {
        cli::print_usage();
        return ExitCode::from(1);
    }

    init_tracing();

    let command = match cli::parse_args(&args) {
        Ok(command) => command,
        Err(err) => {
            eprintln!("Error: {}", err);
            cli::print_usage();
            return ExitCode::from(1);
        }
    };

    let result = match command {
        Command::Run {
            config,
            full_sync_first,
        } => run_cmd::run_daemon(config, full_sync_first),
        Command::Sync { config, excludes } => sync_cmd::run_sync(config, excludes),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            ExitCode::from(1)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
