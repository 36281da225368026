//! Error types for registry lookups and artifact downloads.

use thiserror::Error;

pub type ReleaseResult<T> = Result<T, ReleaseError>;

/// Errors talking to the release registry.
#[derive(Debug, Error)]
pub enum ReleaseError {
    #[error("registry request failed: {0}")]
    Network(String),

    #[error("registry returned HTTP {status} for {url}")]
    Status { status: u16, url: String },

    #[error("invalid registry response: {0}")]
    Decode(String),

    #[error("failed to build http client: {0}")]
    Client(String),
}

impl ReleaseError {
    /// Worth retrying: connection problems, throttling, and server errors.
    pub fn is_transient(&self) -> bool {
        match self {
            ReleaseError::Network(_) => true,
            ReleaseError::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

pub type FetchResult<T> = Result<T, FetchError>;

/// Errors resolving or downloading a package.
#[derive(Debug, Error)]
pub enum FetchError {
    /// No eligible release or asset for the requested version.
    #[error("not found: {0}")]
    NotFound(String),

    /// Connection failure or server error. Retry with backoff.
    #[error("download failed: {0}")]
    Network(String),

    /// Size or digest mismatch. Never retried.
    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error("{message}: {err}")]
    Io {
        message: String,
        #[source]
        err: std::io::Error,
    },
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Network(_))
    }
}

impl From<ReleaseError> for FetchError {
    fn from(e: ReleaseError) -> Self {
        if e.is_transient() {
            FetchError::Network(e.to_string())
        } else {
            FetchError::NotFound(e.to_string())
        }
    }
}
