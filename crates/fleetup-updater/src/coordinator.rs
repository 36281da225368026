//! Updater: the elected coordinator of fleet rollouts.
//!
//! Every instance campaigns for the leader key; the winner proposes a
//! rollout when its release channel moves and supervises the running
//! request until it completes or fails. Each iteration re-reads the store
//! and re-derives its decision, and every write carries the leader guard,
//! so a failover never repeats a transition.

use std::sync::Arc;
use std::time::Duration;

use fleetup_core::config::UpdaterConfig;
use fleetup_core::{
    is_downgrade, sleep_or_shutdown, unix_now, KeySpace, NodeId, RetryPolicy, UpdateRequest,
};
use fleetup_notify::NotificationSink;
use fleetup_release::ReleaseWatcher;
use fleetup_store::{
    Election, LeaderGuard, Leadership, Revision, SharedStore, Snapshot, Storage, StoreError,
    WatchStream,
};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::controller::{self, Progress};
use crate::error::{UpdaterError, UpdaterResult};

/// Tunables for an [`Updater`].
#[derive(Debug, Clone)]
pub struct UpdaterOptions {
    /// Leader identity written into the leader record.
    pub id: String,
    /// Explicit rollout order. Empty means registered nodes sorted by id.
    pub nodes: Vec<NodeId>,
    pub lease_ttl: Duration,
    pub check_interval: Duration,
    pub node_timeout: Duration,
    pub transient_deadline: Duration,
    /// Pause between attempts while the store is unreachable.
    pub retry: RetryPolicy,
}

impl UpdaterOptions {
    pub fn from_config(config: &UpdaterConfig, id: &str) -> Self {
        Self {
            id: id.to_string(),
            nodes: config.nodes.clone(),
            lease_ttl: config.lease_ttl,
            check_interval: config.check_interval,
            node_timeout: config.node_timeout,
            transient_deadline: config.transient_deadline,
            retry: RetryPolicy::new(Duration::from_secs(1), config.check_interval, u32::MAX),
        }
    }
}

/// How a term of leadership ended.
enum Term {
    Shutdown,
    Lost,
}

/// Wait budget of the node currently being updated.
///
/// Held in memory only: a new leader starts the budget afresh.
#[derive(Default)]
struct NodeClock {
    current: Option<(String, NodeId, Instant)>,
}

impl NodeClock {
    /// Time spent waiting on `node` for `version`.
    fn observe(&mut self, version: &str, node: &str) -> Duration {
        match &self.current {
            Some((v, n, since)) if v == version && n == node => since.elapsed(),
            _ => {
                self.current = Some((version.to_string(), node.to_string(), Instant::now()));
                Duration::ZERO
            }
        }
    }

    fn reset(&mut self) {
        self.current = None;
    }
}

/// Tracks how long the store has been failing.
#[derive(Default)]
struct Outage {
    since: Option<Instant>,
}

impl Outage {
    fn clear(&mut self) {
        self.since = None;
    }

    /// Record a retryable failure; error out once it lasts past `deadline`.
    fn record(&mut self, e: &StoreError, deadline: Duration) -> UpdaterResult<()> {
        let since = *self.since.get_or_insert_with(Instant::now);
        if since.elapsed() > deadline {
            error!(error = %e, ?deadline, "store unavailable past deadline");
            return Err(UpdaterError::Unavailable(deadline));
        }
        warn!(error = %e, "store error, retrying");
        Ok(())
    }
}

/// Errors the loop rides out instead of stopping.
fn retryable(e: &StoreError) -> bool {
    e.is_transient() || matches!(e, StoreError::LeaseExpired(_) | StoreError::Compacted(_))
}

pub struct Updater {
    storage: Storage,
    election: Election,
    watcher: Arc<ReleaseWatcher>,
    notifier: Arc<dyn NotificationSink>,
    options: UpdaterOptions,
}

impl Updater {
    pub fn new(
        store: Arc<dyn SharedStore>,
        keys: KeySpace,
        watcher: Arc<ReleaseWatcher>,
        notifier: Arc<dyn NotificationSink>,
        options: UpdaterOptions,
    ) -> Self {
        let election = Election::new(store.clone(), &keys, &options.id, options.lease_ttl);
        Self {
            storage: Storage::new(store, keys),
            election,
            watcher,
            notifier,
            options,
        }
    }

    /// Campaign and coordinate until shutdown.
    ///
    /// Returns an error only for conditions an operator must look at: an
    /// ordering violation, or a store outage past the deadline.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> UpdaterResult<()> {
        let mut outage = Outage::default();
        let mut attempt = 0;
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            let leadership = match self.election.campaign(&mut shutdown).await {
                Ok(Some(leadership)) => leadership,
                Ok(None) => return Ok(()),
                Err(e) if retryable(&e) => {
                    outage.record(&e, self.options.transient_deadline)?;
                    attempt += 1;
                    if !sleep_or_shutdown(self.options.retry.delay(attempt), &mut shutdown).await {
                        return Ok(());
                    }
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            outage.clear();
            attempt = 0;

            match self.lead(leadership, &mut shutdown).await? {
                Term::Shutdown => return Ok(()),
                Term::Lost => warn!(id = %self.options.id, "leadership lost, campaigning again"),
            }
        }
    }

    async fn lead(
        &self,
        mut leadership: Leadership,
        shutdown: &mut watch::Receiver<bool>,
    ) -> UpdaterResult<Term> {
        let guard = leadership.guard().clone();
        let mut clock = NodeClock::default();
        let mut outage = Outage::default();
        let mut events: Option<WatchStream> = None;
        info!(id = %self.options.id, "coordinating rollouts");

        loop {
            if leadership.is_lost() {
                return Ok(Term::Lost);
            }
            if *shutdown.borrow() {
                leadership.resign().await;
                return Ok(Term::Shutdown);
            }

            match self.step(&guard, &mut clock).await {
                Ok(revision) => {
                    outage.clear();
                    if events.is_none() {
                        events = self.open_watch(revision + 1).await;
                    }
                }
                Err(UpdaterError::Store(e)) if e.is_conflict_on(guard.key()) => {
                    warn!(id = %self.options.id, "leader key changed underneath us");
                    return Ok(Term::Lost);
                }
                Err(UpdaterError::Store(e)) if e.is_conflict() => {
                    debug!(error = %e, "conflict, re-reading state");
                    continue;
                }
                Err(UpdaterError::Store(e)) if retryable(&e) => {
                    if let Err(fatal) = outage.record(&e, self.options.transient_deadline) {
                        leadership.resign().await;
                        return Err(fatal);
                    }
                    events = None;
                }
                Err(e) => {
                    leadership.resign().await;
                    return Err(e);
                }
            }

            tokio::select! {
                _ = next_event(&mut events) => {}
                _ = tokio::time::sleep(self.options.check_interval) => {}
                _ = leadership.lost() => {}
                Ok(()) = shutdown.changed() => {}
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

    /// One pass over durable state. Returns the revision it was read at.
    async fn step(&self, guard: &LeaderGuard, clock: &mut NodeClock) -> UpdaterResult<Revision> {
        let snapshot = self.storage.snapshot().await?;
        match &snapshot.request {
            None => {
                clock.reset();
                self.propose(&snapshot, guard).await?;
            }
            Some((request, _)) if request.is_failed() => {
                clock.reset();
                // A fix may be published before the operator clears the request.
                self.watcher.invalidate().await;
                debug!(version = %request.version, "rollout failed, waiting for operator");
            }
            Some((request, revision)) => {
                self.supervise(request, *revision, &snapshot, guard, clock)
                    .await?;
            }
        }
        Ok(snapshot.revision)
    }

    /// Idle → Proposed.
    async fn propose(&self, snapshot: &Snapshot, guard: &LeaderGuard) -> UpdaterResult<()> {
        let release = match self.watcher.latest().await {
            Ok(Some(release)) => release,
            Ok(None) => return Ok(()),
            Err(e) => {
                warn!(error = %e, "release lookup failed");
                return Ok(());
            }
        };
        if let Some(current) = &snapshot.current {
            if *current == release.version {
                return Ok(());
            }
            if is_downgrade(current, &release.version) {
                warn!(%current, candidate = %release.version, "skipping downgrade");
                return Ok(());
            }
        }

        let nodes = if self.options.nodes.is_empty() {
            snapshot.nodes.clone()
        } else {
            self.options.nodes.clone()
        };
        if nodes.is_empty() {
            warn!(version = %release.version, "no nodes to update");
            return Ok(());
        }

        let request = UpdateRequest::new(&release.version, nodes, unix_now());
        match self.storage.create_request(&request, guard).await {
            Ok(_) => {
                let message = format!(
                    "Rolling out {} ({} channel) to {} nodes",
                    request.version,
                    release.channel,
                    request.nodes.len()
                );
                self.notifier.notify_info(&request, &message).await;
                Ok(())
            }
            Err(e) if e.is_conflict_on(&self.storage.keys().request()) => {
                debug!("request already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// InProgress → Succeeded / Failed.
    async fn supervise(
        &self,
        request: &UpdateRequest,
        revision: Revision,
        snapshot: &Snapshot,
        guard: &LeaderGuard,
        clock: &mut NodeClock,
    ) -> UpdaterResult<()> {
        let statuses = snapshot.statuses_for(&request.version);
        let progress = match controller::evaluate(request, &statuses) {
            Ok(progress) => progress,
            Err(violation) => {
                let reason = violation.to_string();
                error!(version = %request.version, %reason, "rollout order violated");
                let failed = request.failed(Some(&violation.node), &reason);
                self.storage
                    .mark_request_failed(revision, &failed, guard)
                    .await?;
                self.notifier.notify_failure(&failed, &reason).await;
                return Err(violation.into());
            }
        };

        match progress {
            Progress::Completed => {
                self.storage
                    .retire_request(revision, &request.version, guard)
                    .await?;
                clock.reset();
                info!(version = %request.version, nodes = request.nodes.len(), "rollout succeeded");
                self.notifier.notify_succeeded(request).await;
            }
            Progress::NodeFailed { node, message } => {
                let reason = format!("node {node} failed: {message}");
                self.fail(request, revision, &node, &reason, guard).await?;
                clock.reset();
            }
            Progress::Waiting { index, node, step } => {
                let waited = clock.observe(&request.version, &node);
                if waited > self.options.node_timeout {
                    let reason = format!(
                        "node {node} timed out after {:?} (last step: {})",
                        self.options.node_timeout,
                        step.map(|s| s.to_string()).unwrap_or_else(|| "none".into())
                    );
                    self.fail(request, revision, &node, &reason, guard).await?;
                    clock.reset();
                } else {
                    debug!(
                        version = %request.version,
                        %node,
                        index,
                        ?step,
                        ?waited,
                        "waiting on node"
                    );
                }
            }
        }
        Ok(())
    }

    async fn fail(
        &self,
        request: &UpdateRequest,
        revision: Revision,
        node: &str,
        reason: &str,
        guard: &LeaderGuard,
    ) -> UpdaterResult<()> {
        let failed = request.failed(Some(node), reason);
        self.storage
            .mark_request_failed(revision, &failed, guard)
            .await?;
        warn!(version = %request.version, node, reason, "rollout failed");
        self.notifier.notify_failure(&failed, reason).await;
        Ok(())
    }
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
