//! fleetup-core: shared types for the fleetup rollout system.
//!
//! Everything that more than one fleetup crate needs lives here: the
//! persisted data model, the key layout inside the shared store, the
//! daemon configuration file, and the retry policy used for transient
//! failures.

pub mod backoff;
pub mod config;
pub mod keys;
pub mod types;

use std::future::Future;
use std::pin::Pin;

pub use backoff::{sleep_or_shutdown, RetryError, RetryPolicy};
pub use config::{Config, ConfigError};
pub use keys::KeySpace;
pub use types::*;

/// Boxed future alias used by the object-safe traits at crate seams.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
