// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Entry point.  Parses the command line, initialises logging, connects to
// the local scheduler, and runs the daemon until a signal or auto-shutdown
// stops it.  Exit code 0 on a clean shutdown, 1 on fatal configuration or
// initialization errors.

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use druckwerk_cups::IppScheduler;
use druckwerkd::{Cli, Daemon};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    let runtime = tokio::runtime::Runtime::new()?;
    if let Err(e) = runtime.block_on(run(cli)) {
        tracing::error!(error = %e, "fatal");
        std::process::exit(1);
    }
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = cli.build_config()?;

    let scheduler = Arc::new(IppScheduler::new(
        &cli.cups_server,
        config.http_local_timeout(),
        config.http_remote_timeout(),
    )?);

    let hostname = cli.hostname.clone().unwrap_or_else(local_hostname);
    tracing::info!(
        scheduler = %cli.cups_server,
        hostname = %hostname,
        cache_dir = %config.cache_dir.display(),
        "druckwerkd starting"
    );

    let daemon = Daemon::new(config, scheduler, hostname).await?;
    daemon.run().await?;
    Ok(())
}

fn init_logging(cli: &Cli) {
    let default = if cli.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    match &cli.logfile {
        Some(path) => {
            match std::fs::OpenOptions::new().create(true).append(true).open(path) {
                Ok(file) => {
                    tracing_subscriber::fmt()
                        .with_env_filter(filter)
                        .with_writer(file)
                        .with_ansi(false)
                        .init();
                }
                Err(e) => {
                    tracing_subscriber::fmt().with_env_filter(filter).init();
                    tracing::warn!(path = %path.display(), error = %e, "cannot open log file, using stderr");
                }
            }
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}

/// The machine's hostname, for filtering announcements of our own queues.
fn local_hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .or_else(|_| std::fs::read_to_string("/etc/hostname"))
        .map(|s| s.trim().to_string())
        .ok()
        .filter(|s| !s.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "localhost".to_string())
}
