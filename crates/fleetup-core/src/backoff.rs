//! Bounded exponential backoff for transient failures.
//!
//! The delay doubles after every failed attempt, starting at `initial`
//! and capped at `max_interval`. Sleeps are cancellable through the
//! process-wide shutdown signal.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub max_interval: Duration,
    /// Attempts including the first one.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            max_attempts: 5,
        }
    }
}

/// Why [`RetryPolicy::retry`] gave up.
#[derive(Debug)]
pub enum RetryError<E> {
    /// Every attempt failed with a transient error; carries the last one.
    Exhausted(E),
    /// The operation failed with an error that must not be retried.
    Fatal(E),
    /// Shutdown was requested while waiting between attempts.
    Cancelled,
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> Option<E> {
        match self {
            RetryError::Exhausted(e) | RetryError::Fatal(e) => Some(e),
            RetryError::Cancelled => None,
        }
    }
}

impl RetryPolicy {
    pub fn new(initial: Duration, max_interval: Duration, max_attempts: u32) -> Self {
        Self {
            initial,
            max_interval,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Delay before attempt `attempt + 1`, where `attempt` starts at 1.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.initial
            .saturating_mul(1u32 << exp)
            .min(self.max_interval)
    }

    /// Run `op` until it succeeds, fails fatally, or attempts run out.
    pub async fn retry<T, E, F, Fut>(
        &self,
        what: &str,
        shutdown: &mut watch::Receiver<bool>,
        is_transient: impl Fn(&E) -> bool,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        E: std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(what, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if !is_transient(&e) => return Err(RetryError::Fatal(e)),
                Err(e) if attempt >= self.max_attempts => {
                    warn!(what, attempt, error = %e, "giving up after retries");
                    return Err(RetryError::Exhausted(e));
                }
                Err(e) => {
                    let delay = self.delay(attempt);
                    warn!(what, attempt, ?delay, error = %e, "transient failure, retrying");
                    if !sleep_or_shutdown(delay, shutdown).await {
                        return Err(RetryError::Cancelled);
                    }
                }
            }
        }
    }
}

/// Sleep for `delay`. Returns `false` if shutdown was requested first.
pub async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        res = shutdown.changed() => {
            if res.is_err() {
                // Sender gone: nobody can request shutdown any more.
                tokio::time::sleep(delay).await;
                return true;
            }
            !*shutdown.borrow()
        }
    }
}
