//! Error types for the node agent.

use fleetup_release::FetchError;
use fleetup_store::StoreError;
use thiserror::Error;

pub type AgentResult<T> = Result<T, AgentError>;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Shutdown was requested in the middle of an update.
    #[error("cancelled by shutdown")]
    Cancelled,
}

pub type StepResult<T> = Result<T, StepError>;

/// Failure of one step of the local update procedure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    /// Worth another attempt after a backoff.
    #[error("{0}")]
    Transient(String),

    /// Retrying cannot help; the node update fails.
    #[error("{0}")]
    Fatal(String),
}

impl StepError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StepError::Transient(_))
    }
}

impl From<FetchError> for StepError {
    fn from(e: FetchError) -> Self {
        if e.is_transient() {
            StepError::Transient(e.to_string())
        } else {
            StepError::Fatal(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_errors_keep_their_retry_class() {
        let network: StepError = FetchError::Network("reset".into()).into();
        assert!(network.is_transient());
        let integrity: StepError = FetchError::Integrity("sha256 mismatch".into()).into();
        assert_eq!(
            integrity,
            StepError::Fatal("integrity check failed: sha256 mismatch".into())
        );
    }
}
