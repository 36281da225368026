//! fleetupd: the fleetup daemon.
//!
//! One binary for every role:
//! - `updater`: campaigns for leadership and coordinates rollouts
//! - `worker`: the node agent for this boot server
//! - `status` / `clear`: operator commands against the shared store
//!
//! # Usage
//!
//! ```text
//! fleetupd --config /etc/fleetup/config.toml updater
//! fleetupd worker
//! fleetupd status --json
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use fleetup_core::config::DEFAULT_CONFIG_PATH;
use fleetup_core::Config;
use tokio::sync::watch;
use tracing::info;

mod ops;
mod updater_mode;
mod worker_mode;

#[derive(Parser)]
#[command(name = "fleetupd", about = "Sequential rollouts for etcd boot servers", version)]
struct Cli {
    /// Configuration file.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the update coordinator.
    Updater,
    /// Run the node agent on this host.
    Worker,
    /// Print the current request, node statuses, current version, and leader.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Delete a halted request and its node statuses.
    Clear,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = Config::from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Command::Updater => updater_mode::run_updater(config).await,
        Command::Worker => worker_mode::run_worker(config).await,
        Command::Status { json } => ops::status(&config, json).await,
        Command::Clear => ops::clear(&config).await,
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new("info,fleetupd=debug,fleetup=debug")
    });
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Shutdown channel fed by SIGINT and SIGTERM.
pub(crate) fn shutdown_channel() -> anyhow::Result<(watch::Sender<bool>, watch::Receiver<bool>)> {
    let (tx, rx) = watch::channel(false);
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("installing SIGTERM handler")?;
    let signal_tx = tx.clone();
    tokio::spawn(async move {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    tracing::warn!(error = %e, "ctrl-c handler failed");
                    return;
                }
            }
            _ = sigterm.recv() => {}
        }
        info!("shutdown signal received");
        let _ = signal_tx.send(true);
    });
    Ok((tx, rx))
}

/// Host name of this machine.
pub(crate) fn hostname() -> anyhow::Result<String> {
    let name = gethostname::gethostname()
        .into_string()
        .map_err(|raw| anyhow::anyhow!("host name is not UTF-8: {raw:?}"))?;
    anyhow::ensure!(!name.is_empty(), "empty host name");
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn hostname_matches_the_os() {
        let name = hostname().unwrap();
        assert_eq!(gethostname::gethostname().to_str(), Some(name.as_str()));
    }
}
