//! Error types for the update coordinator.

use std::time::Duration;

use fleetup_core::{NodeId, NodeStep};
use fleetup_store::StoreError;
use thiserror::Error;

pub type UpdaterResult<T> = Result<T, UpdaterError>;

#[derive(Debug, Error)]
pub enum UpdaterError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Node statuses contradict sequential rollout. Never retried.
    #[error(transparent)]
    OrderViolation(#[from] OrderViolation),

    /// The store stayed unreachable for longer than the configured deadline.
    #[error("store unavailable for more than {0:?}")]
    Unavailable(Duration),
}

/// A node moved while an earlier node had not succeeded yet.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("node {node} is {step} while {blocking} has not succeeded")]
pub struct OrderViolation {
    pub node: NodeId,
    pub step: NodeStep,
    /// First node in rollout order that has not succeeded.
    pub blocking: NodeId,
}
