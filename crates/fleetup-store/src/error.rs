//! Error types for the shared state store.

use thiserror::Error;

use crate::traits::LeaseId;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached. Retry with backoff.
    #[error("store unavailable: {0}")]
    Transient(String),

    /// A compare in a transaction did not hold.
    #[error("revision conflict on {key}")]
    Conflict { key: String },

    #[error("lease {0} not found or expired")]
    LeaseExpired(LeaseId),

    /// The requested watch start revision is no longer available.
    #[error("watch history compacted at revision {0}")]
    Compacted(i64),

    #[error("failed to open database: {0}")]
    Open(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    /// True if this is a conflict on exactly `key`.
    pub fn is_conflict_on(&self, key: &str) -> bool {
        matches!(self, StoreError::Conflict { key: k } if k == key)
    }
}
