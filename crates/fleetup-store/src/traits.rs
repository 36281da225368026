//! The shared store contract.
//!
//! `SharedStore` is object-safe (boxed futures) so the updater and the
//! worker hold an `Arc<dyn SharedStore>` and tests can swap the etcd
//! backend for the embedded one.

use std::time::Duration;

use fleetup_core::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::error::StoreResult;

/// Store-wide modification revision. `0` means "key absent".
pub type Revision = i64;

/// Identifier of a granted lease.
pub type LeaseId = i64;

/// A stored key with its revision metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    pub create_revision: Revision,
    pub mod_revision: Revision,
    pub lease: Option<LeaseId>,
}

/// A condition checked at commit time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compare {
    pub key: String,
    /// Expected modification revision; `0` requires the key to be absent.
    pub revision: Revision,
}

impl Compare {
    pub fn revision(key: impl Into<String>, revision: Revision) -> Self {
        Self {
            key: key.into(),
            revision,
        }
    }

    pub fn absent(key: impl Into<String>) -> Self {
        Self::revision(key, 0)
    }
}

/// A write applied when every compare holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOp {
    Put {
        key: String,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    },
    Delete {
        key: String,
    },
    DeletePrefix {
        prefix: String,
    },
}

impl TxnOp {
    pub fn put(key: impl Into<String>, value: Vec<u8>) -> Self {
        TxnOp::Put {
            key: key.into(),
            value,
            lease: None,
        }
    }

    pub fn put_with_lease(key: impl Into<String>, value: Vec<u8>, lease: LeaseId) -> Self {
        TxnOp::Put {
            key: key.into(),
            value,
            lease: Some(lease),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        TxnOp::Delete { key: key.into() }
    }

    pub fn delete_prefix(prefix: impl Into<String>) -> Self {
        TxnOp::DeletePrefix {
            prefix: prefix.into(),
        }
    }
}

/// All-or-nothing multi-key write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Txn {
    pub compares: Vec<Compare>,
    pub ops: Vec<TxnOp>,
}

impl Txn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn when(mut self, compare: Compare) -> Self {
        self.compares.push(compare);
        self
    }

    pub fn then(mut self, op: TxnOp) -> Self {
        self.ops.push(op);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Delete,
}

/// One change observed by a watch.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub key: String,
    /// New value for puts, `None` for deletes.
    pub value: Option<Vec<u8>>,
    pub revision: Revision,
}

/// Live change stream for a key prefix.
///
/// The producing task is aborted when the stream is dropped.
pub struct WatchStream {
    rx: mpsc::Receiver<StoreResult<WatchEvent>>,
    task: Option<AbortHandle>,
}

impl WatchStream {
    pub(crate) fn new(rx: mpsc::Receiver<StoreResult<WatchEvent>>, task: AbortHandle) -> Self {
        Self {
            rx,
            task: Some(task),
        }
    }

    /// Next event. `None` once the watch has ended.
    pub async fn next(&mut self) -> Option<StoreResult<WatchEvent>> {
        self.rx.recv().await
    }
}

impl Drop for WatchStream {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Linearizable key-value store with watch, lease, and transactions.
pub trait SharedStore: Send + Sync {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StoreResult<Option<KeyValue>>>;

    /// All keys under `prefix`, plus the store revision they were read at.
    fn get_prefix<'a>(
        &'a self,
        prefix: &'a str,
    ) -> BoxFuture<'a, StoreResult<(Vec<KeyValue>, Revision)>>;

    /// Unconditional write. Returns the new revision.
    fn put<'a>(
        &'a self,
        key: &'a str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> BoxFuture<'a, StoreResult<Revision>>;

    /// Unconditional delete. Returns whether the key existed.
    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StoreResult<bool>>;

    /// Apply `txn.ops` atomically if every compare holds.
    ///
    /// Fails with `Conflict` naming the first compare that did not hold.
    /// Returns the store revision after the commit.
    fn commit(&self, txn: Txn) -> BoxFuture<'_, StoreResult<Revision>>;

    /// Stream changes under `prefix`, starting at `start_revision`
    /// (`0` means "from now").
    fn watch<'a>(
        &'a self,
        prefix: &'a str,
        start_revision: Revision,
    ) -> BoxFuture<'a, StoreResult<WatchStream>>;

    fn grant_lease(&self, ttl: Duration) -> BoxFuture<'_, StoreResult<LeaseId>>;

    /// Refresh a lease. Returns its remaining time to live.
    fn renew_lease(&self, lease: LeaseId) -> BoxFuture<'_, StoreResult<Duration>>;

    /// Revoke a lease, deleting every key attached to it.
    fn revoke_lease(&self, lease: LeaseId) -> BoxFuture<'_, StoreResult<()>>;

    /// Write `value` only if `key` is still at `expected` (`0` = absent).
    fn cas_put<'a>(
        &'a self,
        key: &'a str,
        expected: Revision,
        value: Vec<u8>,
    ) -> BoxFuture<'a, StoreResult<Revision>> {
        let txn = Txn::new()
            .when(Compare::revision(key, expected))
            .then(TxnOp::put(key, value));
        self.commit(txn)
    }
}
