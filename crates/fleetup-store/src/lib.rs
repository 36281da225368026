//! fleetup-store: the shared state store behind fleetup rollouts.
//!
//! [`SharedStore`] is the linearizable key-value contract: revisions on
//! every key, all-or-nothing transactions with compares, prefix watches,
//! and leases. Two backends implement it:
//!
//! - [`EtcdStore`] talks to the production etcd cluster.
//! - [`EmbeddedStore`] keeps everything in a local redb file (or in
//!   memory) for development and tests.
//!
//! [`Storage`] layers the rollout key space on top, and [`Election`]
//! provides lease-based leadership for the updater.

pub mod election;
pub mod embedded;
pub mod error;
pub mod etcd;
pub mod storage;
pub mod tables;
pub mod traits;

use std::sync::Arc;

use fleetup_core::config::{StoreBackend, StoreConfig};

pub use election::{Election, Leadership};
pub use embedded::EmbeddedStore;
pub use error::{StoreError, StoreResult};
pub use etcd::{EtcdOptions, EtcdStore};
pub use storage::{LeaderGuard, Snapshot, Storage};
pub use traits::*;

/// Open the backend selected by the configuration.
pub async fn connect(config: &StoreConfig) -> StoreResult<Arc<dyn SharedStore>> {
    match config.backend {
        StoreBackend::Etcd => {
            let store = EtcdStore::connect(EtcdOptions {
                endpoints: config.endpoints.clone(),
                username: config.username.clone(),
                password: config.password.clone(),
                timeout: Some(config.timeout),
            })
            .await?;
            Ok(Arc::new(store))
        }
        StoreBackend::Embedded => {
            if let Some(parent) = config.path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| StoreError::Open(e.to_string()))?;
            }
            Ok(Arc::new(EmbeddedStore::open(&config.path)?))
        }
    }
}
