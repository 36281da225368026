//! fleetup.toml configuration parser.
//!
//! Both daemons read the same file. Every section except `[store]` may be
//! omitted; durations are written as strings like `"30s"`, `"500ms"` or
//! `"10m"`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::keys::DEFAULT_PREFIX;
use crate::types::{NodeId, ReleaseChannel};

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/fleetup/config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    /// Outbound proxy for registry, download, and webhook traffic.
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default)]
    pub release: ReleaseConfig,
    #[serde(default)]
    pub updater: UpdaterConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Etcd,
    /// Single-host redb database. Development and tests only.
    Embedded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_store_timeout", with = "duration_str")]
    pub timeout: Duration,
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Database file for the embedded backend.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub channel: ReleaseChannel,
    /// Package name, used for asset matching and `dpkg-query`.
    #[serde(default)]
    pub package: String,
    /// Stripped from release tags to obtain the package version.
    #[serde(default = "default_tag_prefix")]
    pub tag_prefix: String,
    /// Asset file name; `{package}` and `{version}` are substituted.
    #[serde(default = "default_asset_pattern")]
    pub asset_pattern: String,
    /// How long a looked-up release stays valid.
    #[serde(default = "default_freshness", with = "duration_str")]
    pub freshness: Duration,
    #[serde(default = "default_http_timeout", with = "duration_str")]
    pub timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdaterConfig {
    /// Explicit rollout order. Empty means "registered nodes, sorted".
    #[serde(default)]
    pub nodes: Vec<NodeId>,
    /// Leader identity; defaults to `{hostname}-{pid}`.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default = "default_lease_ttl", with = "duration_str")]
    pub lease_ttl: Duration,
    #[serde(default = "default_check_interval", with = "duration_str")]
    pub check_interval: Duration,
    /// Wait budget for a single node.
    #[serde(default = "default_node_timeout", with = "duration_str")]
    pub node_timeout: Duration,
    /// How long store errors may persist before the updater gives up.
    #[serde(default = "default_transient_deadline", with = "duration_str")]
    pub transient_deadline: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Defaults to the host name.
    #[serde(default)]
    pub node_id: Option<NodeId>,
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// systemd units stopped before and started after the install.
    #[serde(default)]
    pub services: Vec<String>,
    /// Local URL that must answer 2xx after the restart.
    #[serde(default)]
    pub health_url: Option<String>,
    #[serde(default = "default_probe_timeout", with = "duration_str")]
    pub probe_timeout: Duration,
    #[serde(default = "default_download_timeout", with = "duration_str")]
    pub download_timeout: Duration,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_initial", with = "duration_str")]
    pub retry_initial: Duration,
    #[serde(default = "default_retry_max", with = "duration_str")]
    pub retry_max: Duration,
    #[serde(default = "default_check_interval", with = "duration_str")]
    pub check_interval: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Chat webhook. No notifications are sent when unset.
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default = "default_http_timeout", with = "duration_str")]
    pub timeout: Duration,
}

fn default_endpoints() -> Vec<String> {
    vec!["http://127.0.0.1:2379".to_string()]
}
fn default_store_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}
fn default_store_path() -> PathBuf {
    PathBuf::from("/var/lib/fleetup/state.redb")
}
fn default_api_url() -> String {
    "https://api.github.com".to_string()
}
fn default_tag_prefix() -> String {
    "v".to_string()
}
fn default_asset_pattern() -> String {
    "{package}_{version}_amd64.deb".to_string()
}
fn default_freshness() -> Duration {
    Duration::from_secs(5 * 60)
}
fn default_http_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_lease_ttl() -> Duration {
    Duration::from_secs(30)
}
fn default_check_interval() -> Duration {
    Duration::from_secs(30)
}
fn default_node_timeout() -> Duration {
    Duration::from_secs(60 * 60)
}
fn default_transient_deadline() -> Duration {
    Duration::from_secs(10 * 60)
}
fn default_download_dir() -> PathBuf {
    PathBuf::from("/var/lib/fleetup/downloads")
}
fn default_probe_timeout() -> Duration {
    Duration::from_secs(60)
}
fn default_download_timeout() -> Duration {
    Duration::from_secs(10 * 60)
}
fn default_max_retries() -> u32 {
    5
}
fn default_retry_initial() -> Duration {
    Duration::from_secs(1)
}
fn default_retry_max() -> Duration {
    Duration::from_secs(60)
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            endpoints: default_endpoints(),
            username: None,
            password: None,
            timeout: default_store_timeout(),
            prefix: default_prefix(),
            path: default_store_path(),
        }
    }
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            owner: String::new(),
            repo: String::new(),
            token: None,
            channel: ReleaseChannel::default(),
            package: String::new(),
            tag_prefix: default_tag_prefix(),
            asset_pattern: default_asset_pattern(),
            freshness: default_freshness(),
            timeout: default_http_timeout(),
        }
    }
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            id: None,
            lease_ttl: default_lease_ttl(),
            check_interval: default_check_interval(),
            node_timeout: default_node_timeout(),
            transient_deadline: default_transient_deadline(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            download_dir: default_download_dir(),
            services: Vec::new(),
            health_url: None,
            probe_timeout: default_probe_timeout(),
            download_timeout: default_download_timeout(),
            max_retries: default_max_retries(),
            retry_initial: default_retry_initial(),
            retry_max: default_retry_max(),
            check_interval: default_check_interval(),
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout: default_http_timeout(),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Parse and validate a configuration document.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.store.backend == StoreBackend::Etcd && self.store.endpoints.is_empty() {
            return Err(ConfigError::Invalid(
                "store.endpoints must not be empty".to_string(),
            ));
        }
        if self.updater.lease_ttl < Duration::from_secs(1) {
            return Err(ConfigError::Invalid(
                "updater.lease_ttl must be at least 1s".to_string(),
            ));
        }
        if let Some(url) = &self.worker.health_url {
            let plain_http = url
                .get(..7)
                .is_some_and(|scheme| scheme.eq_ignore_ascii_case("http://"));
            if !plain_http || url.len() == 7 {
                return Err(ConfigError::Invalid(format!(
                    "worker.health_url must be a plain http:// URL, got {url:?}"
                )));
            }
        }
        Ok(())
    }
}

impl ReleaseConfig {
    /// Check the fields needed to talk to the release registry.
    pub fn require_registry(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("release.owner", &self.owner),
            ("release.repo", &self.repo),
            ("release.package", &self.package),
        ] {
            if value.is_empty() {
                return Err(ConfigError::Invalid(format!("{name} is required")));
            }
        }
        Ok(())
    }

    /// Asset file name for a package version.
    pub fn asset_name(&self, version: &str) -> String {
        self.asset_pattern
            .replace("{package}", &self.package)
            .replace("{version}", version)
    }
}

/// Parse a duration string like "5s", "500ms", "1m". A bare number is seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
    } else if let Some(hours) = s.strip_suffix('h') {
        hours
            .parse::<u64>()
            .ok()
            .and_then(|h| h.checked_mul(3600))
            .map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        if d.subsec_millis() != 0 {
            serializer.serialize_str(&format!("{}ms", d.as_millis()))
        } else {
            serializer.serialize_str(&format!("{}s", d.as_secs()))
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(deserializer)?;
        super::parse_duration(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid duration: {s:?}")))
    }
}
