//! EtcdStore: `SharedStore` over an etcd v3 cluster.
//!
//! Every gRPC failure maps to `StoreError::Transient` so callers retry with
//! backoff, except lease lookups that etcd rejects outright.

use std::time::Duration;

use etcd_client::{
    Client, Compare as EtcdCompare, CompareOp, ConnectOptions, DeleteOptions, EventType,
    GetOptions, PutOptions, Txn as EtcdTxn, TxnOp as EtcdTxnOp, TxnOpResponse, WatchOptions,
};
use fleetup_core::BoxFuture;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::traits::*;

const WATCH_BUFFER: usize = 256;

/// Connection settings for [`EtcdStore::connect`].
#[derive(Debug, Clone, Default)]
pub struct EtcdOptions {
    pub endpoints: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout: Option<Duration>,
}

/// Store backed by an etcd cluster. Cheap to clone.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

fn transient(e: etcd_client::Error) -> StoreError {
    StoreError::Transient(e.to_string())
}

fn lease_error(lease: LeaseId, e: etcd_client::Error) -> StoreError {
    if e.to_string().contains("lease not found") {
        StoreError::LeaseExpired(lease)
    } else {
        transient(e)
    }
}

fn header_revision(header: Option<&etcd_client::ResponseHeader>) -> Revision {
    header.map(|h| h.revision()).unwrap_or(0)
}

fn convert_kv(kv: &etcd_client::KeyValue) -> StoreResult<KeyValue> {
    let key = kv
        .key_str()
        .map_err(|e| StoreError::Deserialize(e.to_string()))?;
    Ok(KeyValue {
        key: key.to_string(),
        value: kv.value().to_vec(),
        create_revision: kv.create_revision(),
        mod_revision: kv.mod_revision(),
        lease: (kv.lease() != 0).then_some(kv.lease()),
    })
}

fn convert_op(op: TxnOp) -> EtcdTxnOp {
    match op {
        TxnOp::Put { key, value, lease } => {
            let options = lease.map(|id| PutOptions::new().with_lease(id));
            EtcdTxnOp::put(key, value, options)
        }
        TxnOp::Delete { key } => EtcdTxnOp::delete(key, None),
        TxnOp::DeletePrefix { prefix } => {
            EtcdTxnOp::delete(prefix, Some(DeleteOptions::new().with_prefix()))
        }
    }
}

fn convert_compare(compare: &Compare) -> EtcdCompare {
    if compare.revision == 0 {
        EtcdCompare::create_revision(compare.key.as_str(), CompareOp::Equal, 0)
    } else {
        EtcdCompare::mod_revision(compare.key.as_str(), CompareOp::Equal, compare.revision)
    }
}

/// Name the compared key that no longer holds, given the mod revision each
/// probe read back (`None` where no probe answer came). If every key reads
/// as expected, it moved back after the txn; blame the first compare.
fn conflicting_key(compares: &[Compare], observed: &[Option<Revision>]) -> String {
    compares
        .iter()
        .zip(observed)
        .find(|&(compare, seen)| seen.is_some_and(|rev| rev != compare.revision))
        .map(|(compare, _)| compare)
        .or_else(|| compares.first())
        .map(|compare| compare.key.clone())
        .unwrap_or_default()
}

impl EtcdStore {
    pub async fn connect(options: EtcdOptions) -> StoreResult<Self> {
        let mut connect = ConnectOptions::new();
        if let (Some(user), Some(password)) = (&options.username, &options.password) {
            connect = connect.with_user(user.as_str(), password.as_str());
        }
        if let Some(timeout) = options.timeout {
            connect = connect.with_timeout(timeout).with_connect_timeout(timeout);
        }
        let client = Client::connect(&options.endpoints, Some(connect))
            .await
            .map_err(transient)?;
        info!(endpoints = ?options.endpoints, "connected to etcd");
        Ok(Self { client })
    }

    async fn commit_txn(&self, txn: Txn) -> StoreResult<Revision> {
        let compares: Vec<EtcdCompare> = txn.compares.iter().map(convert_compare).collect();
        // On failure, read back every compared key to name the one that moved.
        let probes: Vec<EtcdTxnOp> = txn
            .compares
            .iter()
            .map(|c| EtcdTxnOp::get(c.key.as_str(), None))
            .collect();
        let ops: Vec<EtcdTxnOp> = txn.ops.into_iter().map(convert_op).collect();

        let request = EtcdTxn::new().when(compares).and_then(ops).or_else(probes);
        let mut client = self.client.clone();
        let response = client.txn(request).await.map_err(transient)?;
        if response.succeeded() {
            return Ok(header_revision(response.header()));
        }

        let observed: Vec<Option<Revision>> = response
            .op_responses()
            .into_iter()
            .map(|op| match op {
                TxnOpResponse::Get(get) => {
                    Some(get.kvs().first().map(|kv| kv.mod_revision()).unwrap_or(0))
                }
                _ => None,
            })
            .collect();
        let key = conflicting_key(&txn.compares, &observed);
        Err(StoreError::Conflict { key })
    }

    async fn open_watch(&self, prefix: &str, start: Revision) -> StoreResult<WatchStream> {
        let mut options = WatchOptions::new().with_prefix();
        if start > 0 {
            options = options.with_start_revision(start);
        }
        let mut client = self.client.clone();
        let (watcher, mut stream) = client
            .watch(prefix, Some(options))
            .await
            .map_err(transient)?;

        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let prefix = prefix.to_string();
        let task = tokio::spawn(async move {
            // Dropping the watcher cancels the server-side watch.
            let _watcher = watcher;
            loop {
                let response = match stream.message().await {
                    Ok(Some(response)) => response,
                    Ok(None) => {
                        debug!(%prefix, "etcd watch closed");
                        return;
                    }
                    Err(e) => {
                        let _ = tx.send(Err(transient(e))).await;
                        return;
                    }
                };
                if response.compact_revision() > 0 {
                    let _ = tx
                        .send(Err(StoreError::Compacted(response.compact_revision())))
                        .await;
                    return;
                }
                if response.canceled() {
                    warn!(%prefix, reason = response.cancel_reason(), "etcd watch canceled");
                    let _ = tx
                        .send(Err(StoreError::Transient("watch canceled".into())))
                        .await;
                    return;
                }
                for event in response.events() {
                    let Some(kv) = event.kv() else { continue };
                    let converted = match convert_kv(kv) {
                        Ok(kv) => kv,
                        Err(e) => {
                            warn!(error = %e, "skipping undecodable watch event");
                            continue;
                        }
                    };
                    let event = match event.event_type() {
                        EventType::Put => WatchEvent {
                            kind: EventKind::Put,
                            key: converted.key,
                            value: Some(converted.value),
                            revision: converted.mod_revision,
                        },
                        EventType::Delete => WatchEvent {
                            kind: EventKind::Delete,
                            key: converted.key,
                            value: None,
                            revision: converted.mod_revision,
                        },
                    };
                    if tx.send(Ok(event)).await.is_err() {
                        return;
                    }
                }
            }
        });
        Ok(WatchStream::new(rx, task.abort_handle()))
    }

    async fn keep_alive_once(&self, lease: LeaseId) -> StoreResult<Duration> {
        let mut client = self.client.clone();
        let (mut keeper, mut stream) = client
            .lease_keep_alive(lease)
            .await
            .map_err(|e| lease_error(lease, e))?;
        keeper
            .keep_alive()
            .await
            .map_err(|e| lease_error(lease, e))?;
        match stream.message().await.map_err(|e| lease_error(lease, e))? {
            Some(response) if response.ttl() > 0 => {
                Ok(Duration::from_secs(response.ttl() as u64))
            }
            _ => Err(StoreError::LeaseExpired(lease)),
        }
    }
}

impl SharedStore for EtcdStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StoreResult<Option<KeyValue>>> {
        Box::pin(async move {
            let mut client = self.client.clone();
            let response = client.get(key, None).await.map_err(transient)?;
            response.kvs().first().map(convert_kv).transpose()
        })
    }

    fn get_prefix<'a>(
        &'a self,
        prefix: &'a str,
    ) -> BoxFuture<'a, StoreResult<(Vec<KeyValue>, Revision)>> {
        Box::pin(async move {
            let mut client = self.client.clone();
            let response = client
                .get(prefix, Some(GetOptions::new().with_prefix()))
                .await
                .map_err(transient)?;
            let kvs = response
                .kvs()
                .iter()
                .map(convert_kv)
                .collect::<StoreResult<Vec<_>>>()?;
            Ok((kvs, header_revision(response.header())))
        })
    }

    fn put<'a>(
        &'a self,
        key: &'a str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> BoxFuture<'a, StoreResult<Revision>> {
        Box::pin(async move {
            let mut client = self.client.clone();
            let options = lease.map(|id| PutOptions::new().with_lease(id));
            let response = client.put(key, value, options).await.map_err(|e| match lease {
                Some(id) => lease_error(id, e),
                None => transient(e),
            })?;
            Ok(header_revision(response.header()))
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StoreResult<bool>> {
        Box::pin(async move {
            let mut client = self.client.clone();
            let response = client.delete(key, None).await.map_err(transient)?;
            Ok(response.deleted() > 0)
        })
    }

    fn commit(&self, txn: Txn) -> BoxFuture<'_, StoreResult<Revision>> {
        Box::pin(self.commit_txn(txn))
    }

    fn watch<'a>(
        &'a self,
        prefix: &'a str,
        start_revision: Revision,
    ) -> BoxFuture<'a, StoreResult<WatchStream>> {
        Box::pin(self.open_watch(prefix, start_revision))
    }

    fn grant_lease(&self, ttl: Duration) -> BoxFuture<'_, StoreResult<LeaseId>> {
        Box::pin(async move {
            let mut client = self.client.clone();
            let secs = ttl.as_secs().max(1) as i64;
            let response = client.lease_grant(secs, None).await.map_err(transient)?;
            debug!(lease = response.id(), ttl = response.ttl(), "lease granted");
            Ok(response.id())
        })
    }

    fn renew_lease(&self, lease: LeaseId) -> BoxFuture<'_, StoreResult<Duration>> {
        Box::pin(self.keep_alive_once(lease))
    }

    fn revoke_lease(&self, lease: LeaseId) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async move {
            let mut client = self.client.clone();
            client
                .lease_revoke(lease)
                .await
                .map_err(|e| lease_error(lease, e))?;
            debug!(lease, "lease revoked");
            Ok(())
        })
    }
}
