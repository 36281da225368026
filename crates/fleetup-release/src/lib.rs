//! fleetup-release: the release registry side of fleetup.
//!
//! [`ReleaseWatcher`] tells the updater which version a channel should
//! run. [`PackageFetcher`] turns a version into a verified package file on
//! a worker.

pub mod error;
pub mod fetcher;
pub mod github;
pub mod watcher;

use std::time::Duration;

pub use error::{FetchError, FetchResult, ReleaseError, ReleaseResult};
pub use fetcher::{Artifact, Downloaded, PackageFetcher};
pub use github::{select_release, Asset, GitHubClient, Release, ReleaseSource};
pub use watcher::{ReleaseInfo, ReleaseWatcher};

/// HTTP client shared by registry lookups and downloads.
///
/// `timeout` applies to every request unless the request sets its own.
pub fn http_client(proxy: Option<&str>, timeout: Duration) -> ReleaseResult<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .user_agent(concat!("fleetup/", env!("CARGO_PKG_VERSION")))
        .timeout(timeout)
        .connect_timeout(timeout);
    if let Some(url) = proxy {
        let proxy = reqwest::Proxy::all(url).map_err(|e| ReleaseError::Client(e.to_string()))?;
        builder = builder.proxy(proxy);
    }
    builder
        .build()
        .map_err(|e| ReleaseError::Client(e.to_string()))
}
