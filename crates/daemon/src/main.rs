// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! driftd - The drift sync daemon.
//!
//! Keeps a local SQLite store at `~/.local/state/drift/` in sync with a
//! drift server over WebSocket.
//!
//! Usage:
//!   driftd [--config <path>] [--state-dir <path>] [--once] [--verbose]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;

mod daemon;
mod env;

use daemon::Daemon;

/// PID filename within the state directory.
const PID_NAME: &str = "driftd.pid";
/// Lock filename for single instance guarantee.
const LOCK_NAME: &str = "driftd.lock";
/// Log filename within the state directory.
const LOG_NAME: &str = "driftd.log";

#[derive(Parser, Debug)]
#[command(name = "driftd", version, about = "Local-first sync daemon")]
struct Args {
    /// Config file (default: $DRIFT_CONFIG, then <state-dir>/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding the database, lock and log files
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Run one sync cycle and exit
    #[arg(long)]
    once: bool,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let state_dir = resolve_state_dir(
        args.state_dir.clone(),
        env::state_dir(),
        env::xdg_state_home(),
        dirs::home_dir(),
    );
    if let Err(e) = fs::create_dir_all(&state_dir) {
        eprintln!("driftd: cannot create {}: {e}", state_dir.display());
        return ExitCode::FAILURE;
    }

    // One-shot runs are interactive, so they log to the terminal
    let log_path = (!args.once).then(|| state_dir.join(LOG_NAME));
    setup_logging(log_path.as_deref(), args.verbose);

    tracing::info!("driftd starting, state_dir={}", state_dir.display());

    let lock_path = state_dir.join(LOCK_NAME);
    let lock_file = match acquire_lock(&lock_path) {
        Ok(f) => f,
        Err(e) => {
            tracing::error!("failed to acquire lock: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let pid_path = state_dir.join(PID_NAME);
    if let Err(e) = write_pid_file(&pid_path) {
        tracing::error!("failed to write PID file: {}", e);
        return ExitCode::FAILURE;
    }

    let code = run(&args, &state_dir).await;

    let _ = fs::remove_file(&pid_path);
    drop(lock_file);
    tracing::info!("driftd stopped");
    code
}

async fn run(args: &Args, state_dir: &Path) -> ExitCode {
    let config_path = args.config.clone().or_else(env::config_path);
    let config = match daemon::load_config(config_path.as_deref(), state_dir) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let daemon = match Daemon::build(&config, state_dir) {
        Ok(daemon) => daemon,
        Err(e) => {
            tracing::error!("startup failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if args.once {
        return match daemon.run_once().await {
            Ok(report) if report.has_failures() => {
                tracing::warn!("{} record(s) failed to sync", report.failed);
                ExitCode::SUCCESS
            }
            Ok(_) => ExitCode::SUCCESS,
            Err(e) => {
                tracing::error!("sync failed: {}", e);
                ExitCode::FAILURE
            }
        };
    }

    match daemon.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

/// Flag, then `$DRIFT_STATE_DIR`, then `$XDG_STATE_HOME/drift`, then
/// `~/.local/state/drift`.
fn resolve_state_dir(
    flag: Option<PathBuf>,
    state_dir_env: Option<PathBuf>,
    xdg_state_home: Option<PathBuf>,
    home: Option<PathBuf>,
) -> PathBuf {
    if let Some(dir) = flag.or(state_dir_env) {
        return dir;
    }
    if let Some(dir) = xdg_state_home {
        return dir.join("drift");
    }
    home.map(|h| h.join(".local/state/drift"))
        .unwrap_or_else(|| PathBuf::from(".local/state/drift"))
}

fn setup_logging(log_path: Option<&Path>, verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // Try to open log file, fall back to stderr
    let file = log_path.and_then(|path| {
        fs::OpenOptions::new().create(true).append(true).open(path).ok()
    });
    match file {
        Some(file) => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(file)
            .with_ansi(false)
            .init(),
        None => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
    }
}

fn acquire_lock(lock_path: &Path) -> std::io::Result<fs::File> {
    use fs2::FileExt;

    let file = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(lock_path)?;
    file.try_lock_exclusive()
        .map_err(|_| std::io::Error::other("another driftd instance is using this state directory"))?;
    Ok(file)
}

fn write_pid_file(pid_path: &Path) -> std::io::Result<()> {
    fs::write(pid_path, format!("{}", std::process::id()))
}

#[cfg(test)]
#[path = "main_tests.rs"]
mod tests;
