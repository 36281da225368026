//! Lease-based leader election over the leader key.
//!
//! A candidate grants a lease and creates the leader key bound to it,
//! only if the key is absent. Losers wait for the key to be deleted
//! (resignation or lease expiry) and try again. The winner keeps the
//! lease alive in a background task and is told when it is lost.

use std::sync::Arc;
use std::time::Duration;

use fleetup_core::{unix_now, KeySpace, LeaderRecord};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::storage::LeaderGuard;
use crate::traits::{Compare, EventKind, LeaseId, SharedStore, Txn, TxnOp};

/// Candidate for the leader key.
pub struct Election {
    store: Arc<dyn SharedStore>,
    key: String,
    holder: String,
    ttl: Duration,
}

/// A won election. Dropping it stops renewing the lease.
pub struct Leadership {
    store: Arc<dyn SharedStore>,
    guard: LeaderGuard,
    lease: LeaseId,
    lost: watch::Receiver<bool>,
    keepalive: JoinHandle<()>,
}

impl Election {
    pub fn new(store: Arc<dyn SharedStore>, keys: &KeySpace, holder: &str, ttl: Duration) -> Self {
        Self {
            store,
            key: keys.leader(),
            holder: holder.to_string(),
            ttl,
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Block until this candidate leads. Returns `None` on shutdown.
    pub async fn campaign(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> StoreResult<Option<Leadership>> {
        loop {
            if *shutdown.borrow() {
                return Ok(None);
            }
            if let Some(leadership) = self.try_acquire().await? {
                return Ok(Some(leadership));
            }
            self.wait_for_vacancy(shutdown).await?;
        }
    }

    /// One attempt at creating the leader key.
    pub async fn try_acquire(&self) -> StoreResult<Option<Leadership>> {
        let lease = self.store.grant_lease(self.ttl).await?;
        let record = LeaderRecord {
            holder: self.holder.clone(),
            lease,
            acquired_at: unix_now(),
        };
        let value =
            serde_json::to_vec(&record).map_err(|e| StoreError::Serialize(e.to_string()))?;
        let txn = Txn::new()
            .when(Compare::absent(self.key.as_str()))
            .then(TxnOp::put_with_lease(self.key.as_str(), value, lease));

        match self.store.commit(txn).await {
            Ok(revision) => {
                info!(holder = %self.holder, lease, revision, "acquired leadership");
                let (lost_tx, lost) = watch::channel(false);
                let keepalive = spawn_keepalive(self.store.clone(), lease, self.ttl, lost_tx);
                Ok(Some(Leadership {
                    store: self.store.clone(),
                    guard: LeaderGuard::new(self.key.as_str(), revision),
                    lease,
                    lost,
                    keepalive,
                }))
            }
            Err(e) => {
                if let Err(revoke) = self.store.revoke_lease(lease).await {
                    debug!(lease, error = %revoke, "failed to revoke unused lease");
                }
                if e.is_conflict() {
                    debug!(holder = %self.holder, "leader key taken");
                    Ok(None)
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Wait until the leader key is deleted, shutdown is requested, or the
    /// watch can no longer tell us (the caller simply retries).
    async fn wait_for_vacancy(&self, shutdown: &mut watch::Receiver<bool>) -> StoreResult<()> {
        let Some(current) = self.store.get(&self.key).await? else {
            return Ok(());
        };
        let mut events = match self.store.watch(&self.key, current.mod_revision + 1).await {
            Ok(events) => events,
            Err(StoreError::Compacted(_)) => {
                tokio::time::sleep(self.ttl / 3).await;
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        debug!(holder = %self.holder, "standing by for leader key");
        loop {
            tokio::select! {
                event = events.next() => match event {
                    Some(Ok(event)) if event.key == self.key && event.kind == EventKind::Delete => {
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(StoreError::Compacted(_))) | None => return Ok(()),
                    Some(Err(e)) => return Err(e),
                },
                Ok(()) = shutdown.changed() => return Ok(()),
            }
        }
    }
}

fn spawn_keepalive(
    store: Arc<dyn SharedStore>,
    lease: LeaseId,
    ttl: Duration,
    lost: watch::Sender<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = ttl / 3;
        let mut deadline = Instant::now() + ttl;
        loop {
            tokio::time::sleep(interval).await;
            match store.renew_lease(lease).await {
                Ok(remaining) => deadline = Instant::now() + remaining,
                Err(StoreError::LeaseExpired(_)) => {
                    warn!(lease, "leader lease expired");
                    let _ = lost.send(true);
                    return;
                }
                Err(e) if Instant::now() >= deadline => {
                    warn!(lease, error = %e, "lease renewal failed past deadline");
                    let _ = lost.send(true);
                    return;
                }
                Err(e) => warn!(lease, error = %e, "lease renewal failed, retrying"),
            }
        }
    })
}

impl Leadership {
    pub fn guard(&self) -> &LeaderGuard {
        &self.guard
    }

    pub fn lease(&self) -> LeaseId {
        self.lease
    }

    pub fn is_lost(&self) -> bool {
        *self.lost.borrow()
    }

    /// Resolves once the lease can no longer be renewed.
    pub async fn lost(&mut self) {
        loop {
            if *self.lost.borrow_and_update() {
                return;
            }
            if self.lost.changed().await.is_err() {
                return;
            }
        }
    }

    /// Give up leadership so a standby can take over immediately.
    pub async fn resign(self) {
        self.keepalive.abort();
        match self.store.revoke_lease(self.lease).await {
            Ok(()) => info!(lease = self.lease, "resigned leadership"),
            Err(e) => debug!(lease = self.lease, error = %e, "resign: lease already gone"),
        }
    }
}

impl Drop for Leadership {
    fn drop(&mut self) {
        self.keepalive.abort();
    }
}
