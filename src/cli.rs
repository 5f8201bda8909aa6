//! Command-line parsing for the driftsync binary.
//!
//! Usage: driftsync <command> [arguments]

use std::path::PathBuf;

/// Parsed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the replication daemon
    Run {
        config: PathBuf,
        /// Perform one full sync before watching
        full_sync_first: bool,
    },
    /// One-shot full replication, then exit
    Sync {
        config: PathBuf,
        excludes: Vec<String>,
    },
}

/// Parse command-line arguments (without the program name).
pub fn parse_args(args: &[String]) -> Result<Command, String> {
    let Some((command, rest)) = args.split_first() else {
        return Err("missing command".to_string());
    };

    match command.as_str() {
        "run" => {
            let mut config = None;
            let mut full_sync_first = false;
            let mut iter = rest.iter();
            while let Some(arg) = iter.next() {
                match arg.as_str() {
                    "--config" | "-c" => {
                        config = Some(PathBuf::from(
                            iter.next().ok_or("--config requires a path")?,
                        ));
                    }
                    "--full-sync-first" | "-r" => full_sync_first = true,
                    other => return Err(format!("unknown argument: {}", other)),
                }
            }
            Ok(Command::Run {
                config: config.ok_or("run requires --config <file>")?,
                full_sync_first,
            })
        }
        "sync" => {
            let mut config = None;
            let mut excludes = Vec::new();
            let mut iter = rest.iter();
            while let Some(arg) = iter.next() {
                match arg.as_str() {
                    "--config" | "-c" => {
                        config = Some(PathBuf::from(
                            iter.next().ok_or("--config requires a path")?,
                        ));
                    }
                    "--exclude" => {
                        excludes.push(iter.next().ok_or("--exclude requires a pattern")?.clone());
                    }
                    other => return Err(format!("unknown argument: {}", other)),
                }
            }
            Ok(Command::Sync {
                config: config.ok_or("sync requires --config <file>")?,
                excludes,
            })
        }
        other => Err(format!("unknown command: {}", other)),
    }
}

pub fn print_usage() {
    println!(
        "driftsync {} - real-time directory replicator

USAGE:
    driftsync run  --config <file> [--full-sync-first]
    driftsync sync --config <file> [--exclude <pattern>]...

COMMANDS:
    run     Watch the configured directory and replicate changes
    sync    Replicate the whole directory once, then exit

OPTIONS:
    -c, --config <file>     JSON configuration file
    -r, --full-sync-first   Full replication before watching starts
        --exclude <pat>     Exclude pattern for one-shot sync (repeatable)
    -h, --help              Show this help
    -V, --version           Show version information

Logging is controlled with RUST_LOG (default: info).",
        env!("CARGO_PKG_VERSION")
    );
}

pub fn print_version() {
    println!(
        "driftsync {} (commit {}, built {}, rustc {})",
        env!("CARGO_PKG_VERSION"),
        env!("DRIFTSYNC_COMMIT_SHA"),
        env!("DRIFTSYNC_BUILD_DATE"),
        env!("DRIFTSYNC_RUSTC_VERSION"),
    );
}
