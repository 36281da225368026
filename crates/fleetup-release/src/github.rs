//! GitHub-compatible release registry client.
//!
//! Lists `GET {api}/repos/{owner}/{repo}/releases` and applies the
//! channel policy: staging follows the newest published release including
//! pre-releases, production only fully released ones. Drafts never count.

use fleetup_core::config::ReleaseConfig;
use fleetup_core::{BoxFuture, ReleaseChannel};
use reqwest::header::ACCEPT;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ReleaseError, ReleaseResult};

/// One entry of the registry's release list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
    pub tag_name: String,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub prerelease: bool,
    /// RFC 3339 UTC timestamp; unset while the release is a draft.
    #[serde(default)]
    pub published_at: Option<String>,
    #[serde(default)]
    pub assets: Vec<Asset>,
}

/// A downloadable file attached to a release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub name: String,
    pub browser_download_url: String,
    /// Declared size in bytes.
    #[serde(default)]
    pub size: u64,
}

impl Release {
    /// Whether this release may be rolled out on `channel`.
    pub fn eligible(&self, channel: ReleaseChannel) -> bool {
        if self.draft || self.published_at.is_none() {
            return false;
        }
        match channel {
            ReleaseChannel::Staging => true,
            ReleaseChannel::Production => !self.prerelease,
        }
    }

    /// Package version carried by the tag.
    pub fn version(&self, tag_prefix: &str) -> &str {
        self.tag_name
            .strip_prefix(tag_prefix)
            .unwrap_or(&self.tag_name)
    }

    pub fn asset(&self, name: &str) -> Option<&Asset> {
        self.assets.iter().find(|a| a.name == name)
    }
}

/// Newest eligible release by publish time.
pub fn select_release(releases: &[Release], channel: ReleaseChannel) -> Option<&Release> {
    // RFC 3339 UTC timestamps order lexicographically.
    releases
        .iter()
        .filter(|r| r.eligible(channel))
        .max_by(|a, b| a.published_at.cmp(&b.published_at))
}

/// Anything that can list releases.
pub trait ReleaseSource: Send + Sync {
    fn list_releases(&self) -> BoxFuture<'_, ReleaseResult<Vec<Release>>>;
}

/// Registry client for the GitHub REST API.
pub struct GitHubClient {
    http: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl GitHubClient {
    pub fn new(config: &ReleaseConfig, proxy: Option<&str>) -> ReleaseResult<Self> {
        let http = crate::http_client(proxy, config.timeout)?;
        Ok(Self::with_client(
            http,
            &config.api_url,
            &config.owner,
            &config.repo,
            config.token.clone(),
        ))
    }

    pub fn with_client(
        http: reqwest::Client,
        api_url: &str,
        owner: &str,
        repo: &str,
        token: Option<String>,
    ) -> Self {
        let url = format!(
            "{}/repos/{owner}/{repo}/releases",
            api_url.trim_end_matches('/')
        );
        Self { http, url, token }
    }

    async fn fetch(&self) -> ReleaseResult<Vec<Release>> {
        let mut request = self
            .http
            .get(&self.url)
            .query(&[("per_page", "100")])
            .header(ACCEPT, "application/vnd.github+json");
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| ReleaseError::Network(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ReleaseError::Status {
                status: status.as_u16(),
                url: self.url.clone(),
            });
        }
        let releases: Vec<Release> = response
            .json()
            .await
            .map_err(|e| ReleaseError::Decode(e.to_string()))?;
        debug!(url = %self.url, count = releases.len(), "listed releases");
        Ok(releases)
    }
}

impl ReleaseSource for GitHubClient {
    fn list_releases(&self) -> BoxFuture<'_, ReleaseResult<Vec<Release>>> {
        Box::pin(self.fetch())
    }
}
