// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! slotd: per-slot worker supervisor
//!
//! Runs one control loop per configured port, keeping each slot's worker in
//! line with the assignment the cluster publishes for this node.

use std::path::PathBuf;

use clap::Parser;
use slotd_daemon::{lifecycle, Config, LifecycleError, FATAL_EXIT_CODE};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "slotd", version, about = "Supervises the workers of a node's slots")]
struct Args {
    /// Path to the configuration file
    #[arg(default_value = "slotd.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = Config::load(&args.config)?;

    // Set up logging
    let log_guard = setup_logging(&config)?;

    info!("Starting slotd with config {}", args.config.display());

    let mut daemon = match lifecycle::startup(&config).await {
        Ok(d) => d,
        Err(e) => {
            error!("Failed to start daemon: {}", e);
            drop(log_guard);
            return Err(e.into());
        }
    };

    // Set up signal handlers
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    info!("Daemon ready, supervising {} slots", config.ports.len());

    let fatal = tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down...");
            false
        }
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down...");
            false
        }
        failure = daemon.next_failure() => match failure {
            Some(failure) => {
                error!(port = failure.port, "Slot failed: {}", failure.error);
                true
            }
            None => {
                error!("All slot loops exited");
                true
            }
        }
    };

    if fatal {
        // Workers stay up for the next daemon to recover
        drop(daemon);
        error!("Exiting with code {}", FATAL_EXIT_CODE);
        drop(log_guard);
        std::process::exit(FATAL_EXIT_CODE);
    }

    daemon.shutdown().await?;
    info!("Daemon stopped");
    Ok(())
}

fn setup_logging(
    config: &Config,
) -> Result<tracing_appender::non_blocking::WorkerGuard, LifecycleError> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let log_path = config.log_path();
    let log_dir = log_path
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&log_dir)?;

    // Set up file appender
    let file_name = log_path
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("slotd.log"));
    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // Set up subscriber with env filter
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(non_blocking))
        .init();

    Ok(guard)
}
