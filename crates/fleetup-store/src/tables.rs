//! redb table definitions for the embedded store.
//!
//! `kv` maps user keys to JSON-serialized [`StoredValue`]s. `meta` holds
//! the store-wide revision counter.

use redb::TableDefinition;
use serde::{Deserialize, Serialize};

use crate::traits::{KeyValue, LeaseId, Revision};

/// User keys → JSON `StoredValue`.
pub const KV: TableDefinition<&str, &[u8]> = TableDefinition::new("kv");

/// Store metadata (currently only the revision counter).
pub const META: TableDefinition<&str, i64> = TableDefinition::new("meta");

pub const REVISION_KEY: &str = "revision";

/// A value plus the revision bookkeeping needed for CAS.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredValue {
    pub value: Vec<u8>,
    pub create_revision: Revision,
    pub mod_revision: Revision,
    #[serde(default)]
    pub lease: Option<LeaseId>,
}

impl StoredValue {
    pub fn into_key_value(self, key: &str) -> KeyValue {
        KeyValue {
            key: key.to_string(),
            value: self.value,
            create_revision: self.create_revision,
            mod_revision: self.mod_revision,
            lease: self.lease,
        }
    }
}
