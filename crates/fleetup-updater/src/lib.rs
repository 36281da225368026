//! fleetup-updater: the rollout coordinator.
//!
//! Any number of updater instances may run; one holds the leader lease and
//! drives the rollout state machine:
//!
//! ```text
//! Idle → Proposed → InProgress → {Succeeded, Failed} → Idle
//! ```
//!
//! Success retires the request and records the new current version.
//! Failure leaves the request in place until an operator clears it.

pub mod controller;
pub mod coordinator;
pub mod error;

pub use controller::{evaluate, phase, Phase, Progress};
pub use coordinator::{Updater, UpdaterOptions};
pub use error::{OrderViolation, UpdaterError, UpdaterResult};
