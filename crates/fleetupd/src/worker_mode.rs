//! Worker mode: the node agent for this boot server.

use std::sync::Arc;

use anyhow::Context;
use fleetup_core::{Config, KeySpace};
use fleetup_release::{GitHubClient, PackageFetcher};
use fleetup_worker::{AgentOptions, DebProcedure, NodeAgent};
use tracing::info;

pub async fn run_worker(config: Config) -> anyhow::Result<()> {
    info!("fleetup daemon starting in worker mode");
    config.release.require_registry()?;

    let node = match &config.worker.node_id {
        Some(node) => node.clone(),
        None => crate::hostname()?,
    };

    let store = fleetup_store::connect(&config.store)
        .await
        .context("connecting to the shared store")?;
    info!(backend = ?config.store.backend, prefix = %config.store.prefix, "shared store connected");

    std::fs::create_dir_all(&config.worker.download_dir).with_context(|| {
        format!("creating {}", config.worker.download_dir.display())
    })?;
    let proxy = config.proxy.as_deref();
    let registry = GitHubClient::new(&config.release, proxy)?;
    let http = fleetup_release::http_client(proxy, config.worker.download_timeout)?;
    let fetcher = PackageFetcher::new(
        Arc::new(registry),
        http,
        config.release.clone(),
        &config.worker.download_dir,
        config.worker.download_timeout,
    );
    let procedure = DebProcedure::new(fetcher, &config.release.package, &config.worker);
    info!(
        %node,
        package = %config.release.package,
        services = ?config.worker.services,
        "update procedure initialized"
    );

    let agent = NodeAgent::new(
        store,
        KeySpace::new(&config.store.prefix),
        Arc::new(procedure),
        AgentOptions::from_config(&config.worker, &node),
    );

    let (_shutdown_tx, shutdown_rx) = crate::shutdown_channel()?;
    let handle = tokio::spawn(async move { agent.run(shutdown_rx).await });
    handle.await.context("node agent task panicked")??;

    info!("fleetup worker stopped");
    Ok(())
}
