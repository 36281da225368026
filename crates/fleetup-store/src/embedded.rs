//! EmbeddedStore: redb-backed single-host implementation of `SharedStore`.
//!
//! Values are JSON-serialized [`StoredValue`]s carrying etcd-style
//! revisions, so CAS and watch semantics match the etcd backend. Writers
//! are serialized by the event-log mutex, which also keeps published
//! events in revision order. Leases live in memory only: keys attached to
//! a lease are removed when the store is reopened.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use fleetup_core::BoxFuture;
use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::tables::{StoredValue, KV, META, REVISION_KEY};
use crate::traits::*;

/// Convert any `Display` error into a `StoreError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StoreError::$variant(e.to_string())
    };
}

/// Events kept for watch replay.
const HISTORY_LIMIT: usize = 4096;

/// How often expired leases are swept.
const REAP_INTERVAL: Duration = Duration::from_millis(200);

const WATCH_BUFFER: usize = 256;

/// Thread-safe store backed by redb.
#[derive(Clone)]
pub struct EmbeddedStore {
    inner: Arc<Inner>,
}

struct Inner {
    db: Database,
    events: Mutex<EventLog>,
    leases: Mutex<HashMap<LeaseId, LeaseEntry>>,
    next_lease: AtomicI64,
}

struct EventLog {
    history: VecDeque<WatchEvent>,
    tx: broadcast::Sender<WatchEvent>,
}

struct LeaseEntry {
    ttl: Duration,
    deadline: Instant,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn encode(value: &StoredValue) -> StoreResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

fn decode(bytes: &[u8]) -> StoreResult<StoredValue> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

fn delete_event(key: &str, revision: Revision) -> WatchEvent {
    WatchEvent {
        kind: EventKind::Delete,
        key: key.to_string(),
        value: None,
        revision,
    }
}

impl EventLog {
    fn publish(&mut self, events: Vec<WatchEvent>) {
        for event in events {
            if self.history.len() >= HISTORY_LIMIT {
                self.history.pop_front();
            }
            self.history.push_back(event.clone());
            // No subscribers is fine.
            let _ = self.tx.send(event);
        }
    }
}

impl EmbeddedStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::from_database(db)?;
        let dropped = store.inner.delete_where(|lease| lease.is_some())?;
        debug!(?path, dropped, "embedded store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::from_database(db)?;
        debug!("in-memory embedded store opened");
        Ok(store)
    }

    fn from_database(db: Database) -> StoreResult<Self> {
        let (tx, _) = broadcast::channel(1024);
        let inner = Arc::new(Inner {
            db,
            events: Mutex::new(EventLog {
                history: VecDeque::new(),
                tx,
            }),
            leases: Mutex::new(HashMap::new()),
            next_lease: AtomicI64::new(1),
        });
        inner.ensure_tables()?;
        spawn_reaper(&inner);
        Ok(Self { inner })
    }

    /// Current store revision.
    pub fn revision(&self) -> StoreResult<Revision> {
        self.inner.current_revision()
    }
}

/// Sweep expired leases in the background while the store is alive.
fn spawn_reaper(inner: &Arc<Inner>) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        return;
    };
    let weak = Arc::downgrade(inner);
    handle.spawn(async move {
        loop {
            tokio::time::sleep(REAP_INTERVAL).await;
            let Some(inner) = weak.upgrade() else {
                break;
            };
            if let Err(e) = inner.expire_leases() {
                warn!(error = %e, "lease reaper failed");
            }
        }
    });
}

impl Inner {
    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Storage))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(KV).map_err(map_err!(Storage))?;
        txn.open_table(META).map_err(map_err!(Storage))?;
        txn.commit().map_err(map_err!(Storage))?;
        Ok(())
    }

    /// Run `f` in a write transaction; commit and publish its events on success.
    fn write<T>(
        &self,
        f: impl FnOnce(&WriteTransaction) -> StoreResult<(T, Vec<WatchEvent>)>,
    ) -> StoreResult<T> {
        let mut log = lock(&self.events);
        let txn = self.db.begin_write().map_err(map_err!(Storage))?;
        match f(&txn) {
            Ok((value, events)) => {
                txn.commit().map_err(map_err!(Storage))?;
                log.publish(events);
                Ok(value)
            }
            Err(e) => {
                txn.abort().map_err(map_err!(Storage))?;
                Err(e)
            }
        }
    }

    fn current_revision(&self) -> StoreResult<Revision> {
        let txn = self.db.begin_read().map_err(map_err!(Storage))?;
        let meta = txn.open_table(META).map_err(map_err!(Storage))?;
        let revision = meta
            .get(REVISION_KEY)
            .map_err(map_err!(Storage))?
            .map(|g| g.value())
            .unwrap_or(0);
        Ok(revision)
    }

    fn get(&self, key: &str) -> StoreResult<Option<KeyValue>> {
        let txn = self.db.begin_read().map_err(map_err!(Storage))?;
        let table = txn.open_table(KV).map_err(map_err!(Storage))?;
        match table.get(key).map_err(map_err!(Storage))? {
            Some(guard) => Ok(Some(decode(guard.value())?.into_key_value(key))),
            None => Ok(None),
        }
    }

    fn get_prefix(&self, prefix: &str) -> StoreResult<(Vec<KeyValue>, Revision)> {
        let txn = self.db.begin_read().map_err(map_err!(Storage))?;
        let table = txn.open_table(KV).map_err(map_err!(Storage))?;
        let meta = txn.open_table(META).map_err(map_err!(Storage))?;
        let revision = meta
            .get(REVISION_KEY)
            .map_err(map_err!(Storage))?
            .map(|g| g.value())
            .unwrap_or(0);
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Storage))? {
            let (key, value) = entry.map_err(map_err!(Storage))?;
            if key.value().starts_with(prefix) {
                results.push(decode(value.value())?.into_key_value(key.value()));
            }
        }
        Ok((results, revision))
    }

    /// Returns the revision after the commit and the number of changed keys.
    fn commit(&self, batch: &Txn) -> StoreResult<(Revision, usize)> {
        self.write(|txn| {
            let mut kv = txn.open_table(KV).map_err(map_err!(Storage))?;
            let mut meta = txn.open_table(META).map_err(map_err!(Storage))?;
            let current = meta
                .get(REVISION_KEY)
                .map_err(map_err!(Storage))?
                .map(|g| g.value())
                .unwrap_or(0);

            for cmp in &batch.compares {
                let found = kv
                    .get(cmp.key.as_str())
                    .map_err(map_err!(Storage))?
                    .map(|g| decode(g.value()))
                    .transpose()?
                    .map(|stored| stored.mod_revision)
                    .unwrap_or(0);
                if found != cmp.revision {
                    return Err(StoreError::Conflict {
                        key: cmp.key.clone(),
                    });
                }
            }

            let revision = current + 1;
            let mut events = Vec::new();
            for op in &batch.ops {
                match op {
                    TxnOp::Put { key, value, lease } => {
                        if let Some(id) = lease {
                            self.check_lease(*id)?;
                        }
                        let create_revision = kv
                            .get(key.as_str())
                            .map_err(map_err!(Storage))?
                            .map(|g| decode(g.value()))
                            .transpose()?
                            .map(|stored| stored.create_revision)
                            .unwrap_or(revision);
                        let stored = StoredValue {
                            value: value.clone(),
                            create_revision,
                            mod_revision: revision,
                            lease: *lease,
                        };
                        let bytes = encode(&stored)?;
                        kv.insert(key.as_str(), bytes.as_slice())
                            .map_err(map_err!(Storage))?;
                        events.push(WatchEvent {
                            kind: EventKind::Put,
                            key: key.clone(),
                            value: Some(value.clone()),
                            revision,
                        });
                    }
                    TxnOp::Delete { key } => {
                        if kv.remove(key.as_str()).map_err(map_err!(Storage))?.is_some() {
                            events.push(delete_event(key, revision));
                        }
                    }
                    TxnOp::DeletePrefix { prefix } => {
                        let mut keys = Vec::new();
                        for entry in kv.iter().map_err(map_err!(Storage))? {
                            let (k, _) = entry.map_err(map_err!(Storage))?;
                            let k = k.value().to_string();
                            if k.starts_with(prefix.as_str()) {
                                keys.push(k);
                            }
                        }
                        for key in keys {
                            kv.remove(key.as_str()).map_err(map_err!(Storage))?;
                            events.push(delete_event(&key, revision));
                        }
                    }
                }
            }

            // Like etcd, a transaction that changes nothing keeps the revision.
            if events.is_empty() {
                return Ok(((current, 0), events));
            }
            meta.insert(REVISION_KEY, revision)
                .map_err(map_err!(Storage))?;
            let changed = events.len();
            Ok(((revision, changed), events))
        })
    }

    /// Delete every key whose lease matches `pred`. Returns the number removed.
    fn delete_where(&self, pred: impl Fn(Option<LeaseId>) -> bool) -> StoreResult<usize> {
        self.write(|txn| {
            let mut kv = txn.open_table(KV).map_err(map_err!(Storage))?;
            let mut meta = txn.open_table(META).map_err(map_err!(Storage))?;
            let mut keys = Vec::new();
            for entry in kv.iter().map_err(map_err!(Storage))? {
                let (k, v) = entry.map_err(map_err!(Storage))?;
                if pred(decode(v.value())?.lease) {
                    keys.push(k.value().to_string());
                }
            }
            if keys.is_empty() {
                return Ok((0, Vec::new()));
            }
            let revision = meta
                .get(REVISION_KEY)
                .map_err(map_err!(Storage))?
                .map(|g| g.value())
                .unwrap_or(0)
                + 1;
            let mut events = Vec::with_capacity(keys.len());
            for key in &keys {
                kv.remove(key.as_str()).map_err(map_err!(Storage))?;
                events.push(delete_event(key, revision));
            }
            meta.insert(REVISION_KEY, revision)
                .map_err(map_err!(Storage))?;
            Ok((keys.len(), events))
        })
    }

    fn watch(&self, prefix: &str, start: Revision) -> StoreResult<WatchStream> {
        let (replay, mut rx) = {
            let log = lock(&self.events);
            let current = self.current_revision()?;
            let replay: Vec<WatchEvent> = if start > 0 && start <= current {
                match log.history.front() {
                    Some(front) if front.revision <= start => log
                        .history
                        .iter()
                        .filter(|e| e.revision >= start && e.key.starts_with(prefix))
                        .cloned()
                        .collect(),
                    front => {
                        let oldest = front.map(|e| e.revision).unwrap_or(current + 1);
                        return Err(StoreError::Compacted(oldest));
                    }
                }
            } else {
                Vec::new()
            };
            (replay, log.tx.subscribe())
        };

        let (tx, out) = mpsc::channel(WATCH_BUFFER);
        let prefix = prefix.to_string();
        let task = tokio::spawn(async move {
            for event in replay {
                if tx.send(Ok(event)).await.is_err() {
                    return;
                }
            }
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if event.key.starts_with(&prefix) && tx.send(Ok(event)).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(%prefix, skipped, "watch fell behind");
                        let _ = tx.send(Err(StoreError::Compacted(0))).await;
                        return;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
        Ok(WatchStream::new(out, task.abort_handle()))
    }

    // ── Leases ─────────────────────────────────────────────────────

    fn grant(&self, ttl: Duration) -> LeaseId {
        let id = self.next_lease.fetch_add(1, Ordering::Relaxed);
        lock(&self.leases).insert(
            id,
            LeaseEntry {
                ttl,
                deadline: Instant::now() + ttl,
            },
        );
        debug!(lease = id, ?ttl, "lease granted");
        id
    }

    fn check_lease(&self, id: LeaseId) -> StoreResult<()> {
        match lock(&self.leases).get(&id) {
            Some(entry) if entry.deadline > Instant::now() => Ok(()),
            _ => Err(StoreError::LeaseExpired(id)),
        }
    }

    fn renew(&self, id: LeaseId) -> StoreResult<Duration> {
        let now = Instant::now();
        let mut leases = lock(&self.leases);
        match leases.get_mut(&id) {
            Some(entry) if entry.deadline > now => {
                entry.deadline = now + entry.ttl;
                Ok(entry.ttl)
            }
            _ => Err(StoreError::LeaseExpired(id)),
        }
    }

    fn revoke(&self, id: LeaseId) -> StoreResult<()> {
        let existed = lock(&self.leases).remove(&id).is_some();
        self.delete_where(|lease| lease == Some(id))?;
        if existed {
            debug!(lease = id, "lease revoked");
            Ok(())
        } else {
            Err(StoreError::LeaseExpired(id))
        }
    }

    fn expire_leases(&self) -> StoreResult<()> {
        let expired: Vec<LeaseId> = {
            let mut leases = lock(&self.leases);
            let now = Instant::now();
            let ids: Vec<LeaseId> = leases
                .iter()
                .filter(|(_, entry)| entry.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            for id in &ids {
                leases.remove(id);
            }
            ids
        };
        if expired.is_empty() {
            return Ok(());
        }
        let removed = self.delete_where(|lease| lease.is_some_and(|l| expired.contains(&l)))?;
        debug!(?expired, removed, "leases expired");
        Ok(())
    }
}

impl SharedStore for EmbeddedStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StoreResult<Option<KeyValue>>> {
        Box::pin(async move {
            self.inner.expire_leases()?;
            self.inner.get(key)
        })
    }

    fn get_prefix<'a>(
        &'a self,
        prefix: &'a str,
    ) -> BoxFuture<'a, StoreResult<(Vec<KeyValue>, Revision)>> {
        Box::pin(async move {
            self.inner.expire_leases()?;
            self.inner.get_prefix(prefix)
        })
    }

    fn put<'a>(
        &'a self,
        key: &'a str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> BoxFuture<'a, StoreResult<Revision>> {
        Box::pin(async move {
            self.inner.expire_leases()?;
            let op = TxnOp::Put {
                key: key.to_string(),
                value,
                lease,
            };
            let (revision, _) = self.inner.commit(&Txn::new().then(op))?;
            Ok(revision)
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StoreResult<bool>> {
        Box::pin(async move {
            self.inner.expire_leases()?;
            let (_, changed) = self.inner.commit(&Txn::new().then(TxnOp::delete(key)))?;
            Ok(changed > 0)
        })
    }

    fn commit(&self, txn: Txn) -> BoxFuture<'_, StoreResult<Revision>> {
        Box::pin(async move {
            self.inner.expire_leases()?;
            let (revision, _) = self.inner.commit(&txn)?;
            Ok(revision)
        })
    }

    fn watch<'a>(
        &'a self,
        prefix: &'a str,
        start_revision: Revision,
    ) -> BoxFuture<'a, StoreResult<WatchStream>> {
        Box::pin(async move {
            self.inner.expire_leases()?;
            self.inner.watch(prefix, start_revision)
        })
    }

    fn grant_lease(&self, ttl: Duration) -> BoxFuture<'_, StoreResult<LeaseId>> {
        Box::pin(async move { Ok(self.inner.grant(ttl)) })
    }

    fn renew_lease(&self, lease: LeaseId) -> BoxFuture<'_, StoreResult<Duration>> {
        Box::pin(async move { self.inner.renew(lease) })
    }

    fn revoke_lease(&self, lease: LeaseId) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async move { self.inner.revoke(lease) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> EmbeddedStore {
        EmbeddedStore::open_in_memory().unwrap()
    }

    // ── Basic CRUD ─────────────────────────────────────────────────

    #[tokio::test]
    async fn put_and_get_track_revisions() {
        let store = store();
        let r1 = store.put("/a", b"one".to_vec(), None).await.unwrap();
        let r2 = store.put("/a", b"two".to_vec(), None).await.unwrap();
        assert_eq!(r2, r1 + 1);

        let kv = store.get("/a").await.unwrap().unwrap();
        assert_eq!(kv.value, b"two");
        assert_eq!(kv.create_revision, r1);
        assert_eq!(kv.mod_revision, r2);
        assert!(store.get("/missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn get_prefix_filters_and_reports_revision() {
        let store = store();
        store.put("/x/1", b"1".to_vec(), None).await.unwrap();
        store.put("/x/2", b"2".to_vec(), None).await.unwrap();
        let last = store.put("/y/1", b"3".to_vec(), None).await.unwrap();

        let (kvs, revision) = store.get_prefix("/x/").await.unwrap();
        assert_eq!(kvs.len(), 2);
        assert_eq!(revision, last);
    }

    #[tokio::test]
    async fn delete_reports_existence() {
        let store = store();
        store.put("/a", b"1".to_vec(), None).await.unwrap();
        assert!(store.delete("/a").await.unwrap());
        assert!(!store.delete("/a").await.unwrap());
    }

    #[tokio::test]
    async fn deleting_missing_key_keeps_revision() {
        let store = store();
        let rev = store.put("/a", b"1".to_vec(), None).await.unwrap();
        store.delete("/nothing").await.unwrap();
        assert_eq!(store.revision().unwrap(), rev);
    }

    // ── CAS / transactions ─────────────────────────────────────────

    #[tokio::test]
    async fn cas_put_absent_only_once() {
        let store = store();
        let rev = store.cas_put("/req", 0, b"first".to_vec()).await.unwrap();
        let err = store.cas_put("/req", 0, b"second".to_vec()).await.unwrap_err();
        assert!(err.is_conflict_on("/req"));

        store.cas_put("/req", rev, b"third".to_vec()).await.unwrap();
        assert_eq!(store.get("/req").await.unwrap().unwrap().value, b"third");
    }

    #[tokio::test]
    async fn failed_compare_applies_nothing() {
        let store = store();
        store.put("/guard", b"g".to_vec(), None).await.unwrap();
        let txn = Txn::new()
            .when(Compare::revision("/guard", 999))
            .then(TxnOp::put("/data", b"x".to_vec()));
        let err = store.commit(txn).await.unwrap_err();
        assert!(err.is_conflict_on("/guard"));
        assert!(store.get("/data").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn txn_applies_all_ops_at_one_revision() {
        let store = store();
        store.put("/s/a", b"1".to_vec(), None).await.unwrap();
        store.put("/s/b", b"2".to_vec(), None).await.unwrap();
        let req = store.put("/req", b"r".to_vec(), None).await.unwrap();

        let txn = Txn::new()
            .when(Compare::revision("/req", req))
            .then(TxnOp::delete("/req"))
            .then(TxnOp::delete_prefix("/s/"))
            .then(TxnOp::put("/current", b"2.0.0".to_vec()));
        let rev = store.commit(txn).await.unwrap();

        assert!(store.get("/req").await.unwrap().is_none());
        assert!(store.get_prefix("/s/").await.unwrap().0.is_empty());
        assert_eq!(store.get("/current").await.unwrap().unwrap().mod_revision, rev);
    }

    // ── Watch ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn watch_streams_prefix_events() {
        let store = store();
        let mut watch = store.watch("/w/", 0).await.unwrap();
        store.put("/other", b"-".to_vec(), None).await.unwrap();
        store.put("/w/a", b"1".to_vec(), None).await.unwrap();
        store.delete("/w/a").await.unwrap();

        let put = watch.next().await.unwrap().unwrap();
        assert_eq!(put.kind, EventKind::Put);
        assert_eq!(put.key, "/w/a");
        let del = watch.next().await.unwrap().unwrap();
        assert_eq!(del.kind, EventKind::Delete);
        assert!(del.value.is_none());
    }

    #[tokio::test]
    async fn watch_replays_from_start_revision() {
        let store = store();
        let first = store.put("/w/a", b"1".to_vec(), None).await.unwrap();
        store.put("/w/b", b"2".to_vec(), None).await.unwrap();

        let mut watch = store.watch("/w/", first + 1).await.unwrap();
        let replayed = watch.next().await.unwrap().unwrap();
        assert_eq!(replayed.key, "/w/b");
    }

    #[tokio::test]
    async fn watch_before_history_is_compacted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.redb");
        {
            let store = EmbeddedStore::open(&path).unwrap();
            store.put("/w/a", b"1".to_vec(), None).await.unwrap();
        }
        let store = EmbeddedStore::open(&path).unwrap();
        let err = store.watch("/w/", 1).await.err().unwrap();
        assert!(matches!(err, StoreError::Compacted(_)));
    }

    // ── Leases ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn expired_lease_deletes_keys() {
        let store = store();
        let lease = store.grant_lease(Duration::from_millis(100)).await.unwrap();
        store.put("/leader", b"me".to_vec(), Some(lease)).await.unwrap();
        let mut watch = store.watch("/leader", 0).await.unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;

        let event = watch.next().await.unwrap().unwrap();
        assert_eq!(event.kind, EventKind::Delete);
        assert!(store.get("/leader").await.unwrap().is_none());
        assert!(matches!(
            store.renew_lease(lease).await,
            Err(StoreError::LeaseExpired(_))
        ));
    }

    #[tokio::test]
    async fn renew_keeps_lease_alive() {
        let store = store();
        let lease = store.grant_lease(Duration::from_millis(300)).await.unwrap();
        store.put("/leader", b"me".to_vec(), Some(lease)).await.unwrap();
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            store.renew_lease(lease).await.unwrap();
        }
        assert!(store.get("/leader").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn revoke_deletes_attached_keys() {
        let store = store();
        let lease = store.grant_lease(Duration::from_secs(60)).await.unwrap();
        store.put("/leader", b"me".to_vec(), Some(lease)).await.unwrap();
        store.put("/plain", b"x".to_vec(), None).await.unwrap();

        store.revoke_lease(lease).await.unwrap();
        assert!(store.get("/leader").await.unwrap().is_none());
        assert!(store.get("/plain").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn put_with_unknown_lease_fails() {
        let store = store();
        let err = store.put("/k", b"v".to_vec(), Some(42)).await.unwrap_err();
        assert!(matches!(err, StoreError::LeaseExpired(42)));
        assert!(store.get("/k").await.unwrap().is_none());
    }

    fn put_raw(store: &EmbeddedStore, key: &str, bytes: &[u8]) {
        let txn = store.inner.db.begin_write().unwrap();
        txn.open_table(KV).unwrap().insert(key, bytes).unwrap();
        txn.commit().unwrap();
    }

    #[tokio::test]
    async fn lease_sweep_surfaces_unreadable_records() {
        let store = store();
        let lease = store.grant_lease(Duration::from_secs(60)).await.unwrap();
        store.put("/leader", b"me".to_vec(), Some(lease)).await.unwrap();
        put_raw(&store, "/broken", b"not json");

        assert!(matches!(
            store.revoke_lease(lease).await,
            Err(StoreError::Deserialize(_))
        ));
        // Nothing was half-deleted.
        assert!(store.get("/leader").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_prefix_removes_every_matching_key() {
        let store = store();
        store.put("/p/1", b"1".to_vec(), None).await.unwrap();
        put_raw(&store, "/p/2", b"not json");
        store.put("/q/1", b"3".to_vec(), None).await.unwrap();

        store
            .commit(Txn::new().then(TxnOp::delete_prefix("/p/")))
            .await
            .unwrap();
        let (kvs, _) = store.get_prefix("/").await.unwrap();
        let keys: Vec<_> = kvs.iter().map(|kv| kv.key.as_str()).collect();
        assert_eq!(keys, vec!["/q/1"]);
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[tokio::test]
    async fn persistence_survives_reopen_without_leased_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.redb");
        let rev = {
            let store = EmbeddedStore::open(&path).unwrap();
            let lease = store.grant_lease(Duration::from_secs(60)).await.unwrap();
            store.put("/leader", b"me".to_vec(), Some(lease)).await.unwrap();
            store.put("/current", b"1.0.0".to_vec(), None).await.unwrap()
        };

        let store = EmbeddedStore::open(&path).unwrap();
        let current = store.get("/current").await.unwrap().unwrap();
        assert_eq!(current.value, b"1.0.0");
        assert_eq!(current.mod_revision, rev);
        assert!(store.get("/leader").await.unwrap().is_none());
    }
}
