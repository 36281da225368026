//! Updater mode: campaigns for the leader key and coordinates rollouts.
//!
//! In this mode, the daemon:
//! 1. Connects to the shared store
//! 2. Builds the release watcher and notification sink
//! 3. Runs the updater until SIGINT/SIGTERM, then resigns leadership

use std::sync::Arc;

use anyhow::Context;
use fleetup_core::{Config, KeySpace};
use fleetup_release::{GitHubClient, ReleaseWatcher};
use fleetup_updater::{Updater, UpdaterOptions};
use tracing::{error, info};

pub async fn run_updater(config: Config) -> anyhow::Result<()> {
    info!("fleetup daemon starting in updater mode");
    config.release.require_registry()?;

    let store = fleetup_store::connect(&config.store)
        .await
        .context("connecting to the shared store")?;
    info!(backend = ?config.store.backend, prefix = %config.store.prefix, "shared store connected");

    let registry = GitHubClient::new(&config.release, config.proxy.as_deref())?;
    let watcher = Arc::new(ReleaseWatcher::from_config(Arc::new(registry), &config.release));
    info!(
        channel = %watcher.channel(),
        repo = %format!("{}/{}", config.release.owner, config.release.repo),
        "release watcher initialized"
    );

    let notifier = fleetup_notify::from_config(&config.notify, config.proxy.as_deref())?;

    let id = match &config.updater.id {
        Some(id) => id.clone(),
        None => format!("{}-{}", crate::hostname()?, std::process::id()),
    };
    let options = UpdaterOptions::from_config(&config.updater, &id);
    let updater = Updater::new(
        store,
        KeySpace::new(&config.store.prefix),
        watcher,
        notifier,
        options,
    );

    let (_shutdown_tx, shutdown_rx) = crate::shutdown_channel()?;
    let handle = tokio::spawn(async move { updater.run(shutdown_rx).await });

    match handle.await.context("updater task panicked")? {
        Ok(()) => {
            info!("fleetup updater stopped");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "updater stopped");
            Err(e.into())
        }
    }
}
