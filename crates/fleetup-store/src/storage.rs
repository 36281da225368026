//! Typed access to the rollout key space.
//!
//! Every mutation of the update request carries the caller's
//! [`LeaderGuard`], so a deposed leader's writes fail with a conflict on
//! the leader key instead of clobbering its successor.

use std::collections::HashMap;
use std::sync::Arc;

use fleetup_core::{
    unix_now, KeySpace, LeaderRecord, NodeId, NodeRegistration, NodeStatus, UpdateRequest,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::traits::{Compare, Revision, SharedStore, Txn, TxnOp, WatchStream};

/// Proof of leadership: the leader key at the revision we created it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderGuard {
    key: String,
    revision: Revision,
}

impl LeaderGuard {
    pub fn new(key: impl Into<String>, revision: Revision) -> Self {
        Self {
            key: key.into(),
            revision,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn revision(&self) -> Revision {
        self.revision
    }

    fn compare(&self) -> Compare {
        Compare::revision(self.key.as_str(), self.revision)
    }
}

/// Everything under the prefix, read at one store revision.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub request: Option<(UpdateRequest, Revision)>,
    pub statuses: HashMap<NodeId, (NodeStatus, Revision)>,
    pub current: Option<String>,
    pub leader: Option<LeaderRecord>,
    /// Status records that failed to decode: node to (error, revision).
    pub malformed: HashMap<NodeId, (String, Revision)>,
    /// Registered nodes, sorted by id.
    pub nodes: Vec<NodeId>,
    pub revision: Revision,
}

impl Snapshot {
    pub fn status(&self, node: &str) -> Option<&NodeStatus> {
        self.statuses.get(node).map(|(status, _)| status)
    }

    /// Revision of `node`'s status key, `0` if absent. A malformed record
    /// still has a revision, so its owner can overwrite it.
    pub fn status_revision(&self, node: &str) -> Revision {
        self.statuses
            .get(node)
            .map(|(_, rev)| *rev)
            .or_else(|| self.malformed.get(node).map(|(_, rev)| *rev))
            .unwrap_or(0)
    }

    /// Statuses that refer to `version`. Others are leftovers of an
    /// earlier rollout.
    pub fn statuses_for(&self, version: &str) -> HashMap<NodeId, NodeStatus> {
        self.statuses
            .iter()
            .filter(|(_, (status, _))| status.version == version)
            .map(|(node, (status, _))| (node.clone(), status.clone()))
            .collect()
    }
}

fn encode<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| StoreError::Serialize(e.to_string()))
}

fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> StoreResult<T> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::Deserialize(format!("{key}: {e}")))
}

/// Typed operations over a [`SharedStore`].
#[derive(Clone)]
pub struct Storage {
    store: Arc<dyn SharedStore>,
    keys: KeySpace,
}

impl Storage {
    pub fn new(store: Arc<dyn SharedStore>, keys: KeySpace) -> Self {
        Self { store, keys }
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    pub fn store(&self) -> &Arc<dyn SharedStore> {
        &self.store
    }

    pub async fn snapshot(&self) -> StoreResult<Snapshot> {
        let (kvs, revision) = self.store.get_prefix(self.keys.prefix()).await?;
        let request_key = self.keys.request();
        let current_key = self.keys.current();
        let leader_key = self.keys.leader();

        let mut snapshot = Snapshot {
            revision,
            ..Snapshot::default()
        };
        for kv in kvs {
            if kv.key == request_key {
                snapshot.request = Some((decode(&kv.key, &kv.value)?, kv.mod_revision));
            } else if kv.key == current_key {
                let version = String::from_utf8(kv.value)
                    .map_err(|e| StoreError::Deserialize(format!("{}: {e}", kv.key)))?;
                snapshot.current = Some(version);
            } else if kv.key == leader_key {
                // Informational only: leadership is checked by the guard's compare.
                match decode::<LeaderRecord>(&kv.key, &kv.value) {
                    Ok(leader) => snapshot.leader = Some(leader),
                    Err(e) => warn!(error = %e, "ignoring unreadable leader record"),
                }
            } else if let Some(node) = self.keys.node_of_status(&kv.key) {
                match decode::<NodeStatus>(&kv.key, &kv.value) {
                    Ok(status) => {
                        snapshot
                            .statuses
                            .insert(node.to_string(), (status, kv.mod_revision));
                    }
                    Err(e) => {
                        warn!(node, error = %e, "unreadable node status");
                        snapshot
                            .malformed
                            .insert(node.to_string(), (e.to_string(), kv.mod_revision));
                    }
                }
            } else if let Some(node) = self.keys.node_of_registration(&kv.key) {
                snapshot.nodes.push(node.to_string());
            }
        }
        snapshot.nodes.sort();
        Ok(snapshot)
    }

    pub async fn current_version(&self) -> StoreResult<Option<String>> {
        let Some(kv) = self.store.get(&self.keys.current()).await? else {
            return Ok(None);
        };
        String::from_utf8(kv.value)
            .map(Some)
            .map_err(|e| StoreError::Deserialize(e.to_string()))
    }

    /// Store a new request. Fails with a conflict on the request key if
    /// one already exists.
    pub async fn create_request(
        &self,
        request: &UpdateRequest,
        guard: &LeaderGuard,
    ) -> StoreResult<Revision> {
        let key = self.keys.request();
        let txn = Txn::new()
            .when(guard.compare())
            .when(Compare::absent(key.as_str()))
            .then(TxnOp::put(key.as_str(), encode(request)?));
        let revision = self.store.commit(txn).await?;
        info!(
            version = %request.version,
            nodes = ?request.nodes,
            revision,
            "update request created"
        );
        Ok(revision)
    }

    /// Replace the request at `expected` with its failed form.
    pub async fn mark_request_failed(
        &self,
        expected: Revision,
        failed: &UpdateRequest,
        guard: &LeaderGuard,
    ) -> StoreResult<Revision> {
        let key = self.keys.request();
        let txn = Txn::new()
            .when(guard.compare())
            .when(Compare::revision(key.as_str(), expected))
            .then(TxnOp::put(key.as_str(), encode(failed)?));
        let revision = self.store.commit(txn).await?;
        info!(
            version = %failed.version,
            state = ?failed.state,
            revision,
            "update request marked failed"
        );
        Ok(revision)
    }

    /// Delete the request and every status, recording `version` as current.
    pub async fn retire_request(
        &self,
        expected: Revision,
        version: &str,
        guard: &LeaderGuard,
    ) -> StoreResult<Revision> {
        let key = self.keys.request();
        let txn = Txn::new()
            .when(guard.compare())
            .when(Compare::revision(key.as_str(), expected))
            .then(TxnOp::delete(key.as_str()))
            .then(TxnOp::delete_prefix(self.keys.status_prefix()))
            .then(TxnOp::put(self.keys.current(), version.as_bytes().to_vec()));
        let revision = self.store.commit(txn).await?;
        info!(version, revision, "update request retired");
        Ok(revision)
    }

    /// CAS this node's status. `expected` is `0` when no status exists yet.
    pub async fn put_status(
        &self,
        status: &NodeStatus,
        expected: Revision,
    ) -> StoreResult<Revision> {
        let key = self.keys.status(&status.node);
        let revision = self.store.cas_put(&key, expected, encode(status)?).await?;
        debug!(
            node = %status.node,
            version = %status.version,
            step = %status.step,
            revision,
            "status written"
        );
        Ok(revision)
    }

    pub async fn register_node(&self, node: &str) -> StoreResult<Revision> {
        let registration = NodeRegistration {
            node: node.to_string(),
            registered_at: unix_now(),
        };
        let revision = self
            .store
            .put(&self.keys.node(node), encode(&registration)?, None)
            .await?;
        debug!(node, revision, "node registered");
        Ok(revision)
    }

    /// Registered node ids, sorted.
    pub async fn list_nodes(&self) -> StoreResult<Vec<NodeId>> {
        let (kvs, _) = self.store.get_prefix(&self.keys.nodes_prefix()).await?;
        let mut nodes: Vec<NodeId> = kvs
            .iter()
            .filter_map(|kv| self.keys.node_of_registration(&kv.key))
            .map(str::to_string)
            .collect();
        nodes.sort();
        Ok(nodes)
    }

    /// Operator reset: drop the request and all statuses.
    ///
    /// Returns `false` if there was no request.
    pub async fn clear_request(&self) -> StoreResult<bool> {
        let key = self.keys.request();
        let Some(kv) = self.store.get(&key).await? else {
            return Ok(false);
        };
        let txn = Txn::new()
            .when(Compare::revision(key.as_str(), kv.mod_revision))
            .then(TxnOp::delete(key.as_str()))
            .then(TxnOp::delete_prefix(self.keys.status_prefix()));
        self.store.commit(txn).await?;
        info!("update request cleared");
        Ok(true)
    }

    /// Watch the whole prefix from `start_revision`.
    pub async fn watch(&self, start_revision: Revision) -> StoreResult<WatchStream> {
        self.store.watch(self.keys.prefix(), start_revision).await
    }
}
