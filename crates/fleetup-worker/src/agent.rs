//! NodeAgent: runs on every boot server and applies the rollout to it.
//!
//! The agent waits until every node ahead of it in the request has
//! succeeded, then drives the local [`UpdateProcedure`] and writes its own
//! status. It never touches another node's status or the request itself.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use fleetup_core::config::WorkerConfig;
use fleetup_core::{
    sleep_or_shutdown, unix_now, KeySpace, NodeId, NodeStatus, NodeStep, RetryError, RetryPolicy,
};
use fleetup_store::{Revision, SharedStore, Snapshot, Storage, StoreError, WatchStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{AgentError, AgentResult, StepError};
use crate::procedure::UpdateProcedure;

#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub node: NodeId,
    pub check_interval: Duration,
    /// Backoff for transient step and store failures.
    pub retry: RetryPolicy,
}

impl AgentOptions {
    pub fn from_config(config: &WorkerConfig, node: &str) -> Self {
        Self {
            node: node.to_string(),
            check_interval: config.check_interval,
            retry: RetryPolicy::new(config.retry_initial, config.retry_max, config.max_retries),
        }
    }
}

/// What one reconciliation pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing for this node to do.
    Idle,
    /// `blocking` is ahead of us and has not succeeded yet.
    Waiting { blocking: NodeId },
    /// This node reached a terminal step for `version`.
    Reported { version: String, step: NodeStep },
}

enum Failure {
    Step { step: &'static str, error: StepError },
    Cancelled,
}

pub struct NodeAgent {
    storage: Storage,
    procedure: Arc<dyn UpdateProcedure>,
    options: AgentOptions,
}

impl NodeAgent {
    pub fn new(
        store: Arc<dyn SharedStore>,
        keys: KeySpace,
        procedure: Arc<dyn UpdateProcedure>,
        options: AgentOptions,
    ) -> Self {
        Self {
            storage: Storage::new(store, keys),
            procedure,
            options,
        }
    }

    pub fn node(&self) -> &str {
        &self.options.node
    }

    /// Register, then reconcile on every store change and periodic tick
    /// until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> AgentResult<()> {
        if !self.register(&mut shutdown).await? {
            return Ok(());
        }
        info!(node = %self.options.node, "node agent started");

        let mut events: Option<WatchStream> = None;
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            match self.pass(&mut shutdown).await {
                Ok((outcome, revision)) => {
                    debug!(node = %self.options.node, ?outcome, "reconciled");
                    if events.is_none() {
                        events = self.open_watch(revision + 1).await;
                    }
                }
                Err(AgentError::Cancelled) => {
                    info!(node = %self.options.node, "shutdown during update, status left running");
                    return Ok(());
                }
                Err(AgentError::Store(e)) if e.is_conflict() => {
                    debug!(error = %e, "status changed underneath us, re-reading");
                    continue;
                }
                Err(AgentError::Store(e)) => {
                    warn!(node = %self.options.node, error = %e, "reconcile failed, retrying");
                    events = None;
                }
            }

            tokio::select! {
                _ = next_event(&mut events) => {}
                _ = tokio::time::sleep(self.options.check_interval) => {}
                Ok(()) = shutdown.changed() => {}
            }
        }
    }

    /// Returns `false` if shutdown came first.
    async fn register(&self, shutdown: &mut watch::Receiver<bool>) -> AgentResult<bool> {
        let mut attempt = 0;
        loop {
            match self.storage.register_node(&self.options.node).await {
                Ok(_) => return Ok(true),
                Err(e) if e.is_transient() => {
                    attempt += 1;
                    warn!(
                        node = %self.options.node,
                        attempt,
                        error = %e,
                        "registration failed, retrying"
                    );
                    if !sleep_or_shutdown(self.options.retry.delay(attempt), shutdown).await {
                        return Ok(false);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn open_watch(&self, start: Revision) -> Option<WatchStream> {
        match self.storage.watch(start).await {
            Ok(stream) => Some(stream),
            Err(e) => {
                debug!(error = %e, "watch unavailable, relying on periodic checks");
                None
            }
        }
    }

    /// One reconciliation pass against current store state.
    pub async fn reconcile(&self, shutdown: &mut watch::Receiver<bool>) -> AgentResult<Outcome> {
        self.pass(shutdown).await.map(|(outcome, _)| outcome)
    }

    async fn pass(&self, shutdown: &mut watch::Receiver<bool>) -> AgentResult<(Outcome, Revision)> {
        let snapshot = self.storage.snapshot().await?;
        let outcome = self.apply(&snapshot, shutdown).await?;
        Ok((outcome, snapshot.revision))
    }

    async fn apply(
        &self,
        snapshot: &Snapshot,
        shutdown: &mut watch::Receiver<bool>,
    ) -> AgentResult<Outcome> {
        let node = self.options.node.as_str();
        let Some((request, _)) = &snapshot.request else {
            return Ok(Outcome::Idle);
        };
        if request.is_failed() || !request.contains(node) {
            return Ok(Outcome::Idle);
        }
        let version = request.version.as_str();
        let own = snapshot.status(node).filter(|s| s.version == version);
        if own.is_some_and(|s| s.step.is_terminal()) {
            return Ok(Outcome::Idle);
        }

        let succeeded = |n: &str| {
            snapshot
                .status(n)
                .is_some_and(|s| s.version == version && s.step == NodeStep::Succeeded)
        };
        if let Some(blocking) = request.predecessors(node).iter().find(|n| !succeeded(n.as_str())) {
            debug!(node, %blocking, version, "waiting for turn");
            return Ok(Outcome::Waiting {
                blocking: blocking.clone(),
            });
        }

        let mut expected = snapshot.status_revision(node);
        let installed = match self
            .step("read installed version", shutdown, || self.procedure.installed_version())
            .await
        {
            Ok(installed) => installed,
            Err(failure) => return self.finish(version, expected, Err(failure), shutdown).await,
        };
        if installed.as_deref() == Some(version) {
            info!(node, version, "target version already installed");
            return self.finish(version, expected, Ok(()), shutdown).await;
        }

        if own.map(|s| s.step) == Some(NodeStep::Running) {
            info!(node, version, "resuming interrupted update");
        }
        let running = NodeStatus::new(node, version, NodeStep::Running, unix_now());
        expected = self.write_status(&running, expected, shutdown).await?;
        info!(node, version, from = ?installed, "updating node");

        let result = self.execute(version, shutdown).await;
        self.finish(version, expected, result, shutdown).await
    }

    /// fetch → stop → install → start → probe. Shutdown is honoured
    /// between steps only.
    async fn execute(
        &self,
        version: &str,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), Failure> {
        let package = self
            .step("fetch", shutdown, || self.procedure.fetch(version))
            .await?;
        checkpoint(shutdown)?;
        self.step("stop services", shutdown, || self.procedure.stop_services())
            .await?;
        checkpoint(shutdown)?;
        self.step("install", shutdown, || self.procedure.install(&package))
            .await?;
        checkpoint(shutdown)?;
        self.step("start services", shutdown, || self.procedure.start_services())
            .await?;
        checkpoint(shutdown)?;
        self.step("health probe", shutdown, || self.procedure.probe())
            .await
    }

    async fn step<T, F, Fut>(
        &self,
        name: &'static str,
        shutdown: &mut watch::Receiver<bool>,
        op: F,
    ) -> Result<T, Failure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StepError>>,
    {
        debug!(node = %self.options.node, step = name, "running step");
        self.options
            .retry
            .retry(name, shutdown, StepError::is_transient, op)
            .await
            .map_err(|e| match e {
                RetryError::Exhausted(error) | RetryError::Fatal(error) => {
                    Failure::Step { step: name, error }
                }
                RetryError::Cancelled => Failure::Cancelled,
            })
    }

    /// Write the terminal status for `result`.
    async fn finish(
        &self,
        version: &str,
        expected: Revision,
        result: Result<(), Failure>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> AgentResult<Outcome> {
        let node = self.options.node.as_str();
        let status = match result {
            Ok(()) => {
                info!(node, version, "node update succeeded");
                NodeStatus::new(node, version, NodeStep::Succeeded, unix_now())
            }
            Err(Failure::Step { step, error }) => {
                let message = format!("{step}: {error}");
                error!(node, version, %message, "node update failed");
                NodeStatus::new(node, version, NodeStep::Failed, unix_now()).with_message(message)
            }
            Err(Failure::Cancelled) => return Err(AgentError::Cancelled),
        };
        self.write_status(&status, expected, shutdown).await?;
        Ok(Outcome::Reported {
            version: version.to_string(),
            step: status.step,
        })
    }

    async fn write_status(
        &self,
        status: &NodeStatus,
        expected: Revision,
        shutdown: &mut watch::Receiver<bool>,
    ) -> AgentResult<Revision> {
        self.options
            .retry
            .retry("write status", shutdown, StoreError::is_transient, || {
                self.storage.put_status(status, expected)
            })
            .await
            .map_err(|e| match e.into_inner() {
                Some(e) => AgentError::Store(e),
                None => AgentError::Cancelled,
            })
    }
}

fn checkpoint(shutdown: &watch::Receiver<bool>) -> Result<(), Failure> {
    if *shutdown.borrow() {
        return Err(Failure::Cancelled);
    }
    Ok(())
}

/// Resolves on the next store event. Pends forever without a watch.
async fn next_event(events: &mut Option<WatchStream>) {
    let Some(stream) = events.as_mut() else {
        return std::future::pending().await;
    };
    match stream.next().await {
        Some(Ok(_)) => return,
        Some(Err(e)) => debug!(error = %e, "watch ended"),
        None => debug!("watch closed"),
    }
    *events = None;
}
