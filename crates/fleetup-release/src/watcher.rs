//! ReleaseWatcher: latest version per release channel, cached for a
//! freshness window so the updater loop can poll it cheaply.

use std::sync::Arc;
use std::time::Duration;

use fleetup_core::config::ReleaseConfig;
use fleetup_core::{unix_now, ReleaseChannel};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::ReleaseResult;
use crate::github::{select_release, ReleaseSource};

/// The newest release eligible for a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReleaseInfo {
    pub channel: ReleaseChannel,
    pub tag: String,
    pub version: String,
    /// Unix timestamp of the registry lookup.
    pub fetched_at: u64,
}

struct Cached {
    at: Instant,
    info: Option<ReleaseInfo>,
}

pub struct ReleaseWatcher {
    source: Arc<dyn ReleaseSource>,
    channel: ReleaseChannel,
    tag_prefix: String,
    freshness: Duration,
    cache: Mutex<Option<Cached>>,
}

impl ReleaseWatcher {
    pub fn new(
        source: Arc<dyn ReleaseSource>,
        channel: ReleaseChannel,
        tag_prefix: &str,
        freshness: Duration,
    ) -> Self {
        Self {
            source,
            channel,
            tag_prefix: tag_prefix.to_string(),
            freshness,
            cache: Mutex::new(None),
        }
    }

    pub fn from_config(source: Arc<dyn ReleaseSource>, config: &ReleaseConfig) -> Self {
        Self::new(source, config.channel, &config.tag_prefix, config.freshness)
    }

    pub fn channel(&self) -> ReleaseChannel {
        self.channel
    }

    /// Latest eligible release, or `None` if the channel has none yet.
    ///
    /// Served from cache while the last lookup is younger than the
    /// freshness window. Failed lookups are not cached.
    pub async fn latest(&self) -> ReleaseResult<Option<ReleaseInfo>> {
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref() {
            if cached.at.elapsed() < self.freshness {
                return Ok(cached.info.clone());
            }
        }

        let releases = self.source.list_releases().await?;
        let info = select_release(&releases, self.channel).map(|release| ReleaseInfo {
            channel: self.channel,
            tag: release.tag_name.clone(),
            version: release.version(&self.tag_prefix).to_string(),
            fetched_at: unix_now(),
        });

        let previous = cache.as_ref().and_then(|c| c.info.as_ref()).map(|i| i.version.clone());
        match &info {
            Some(found) if previous.as_deref() != Some(found.version.as_str()) => {
                info!(
                    channel = %self.channel,
                    version = %found.version,
                    tag = %found.tag,
                    "new release observed"
                );
            }
            Some(_) => debug!(channel = %self.channel, "release unchanged"),
            None => debug!(channel = %self.channel, "no eligible release"),
        }

        *cache = Some(Cached {
            at: Instant::now(),
            info: info.clone(),
        });
        Ok(info)
    }

    /// Force the next [`latest`](Self::latest) to hit the registry.
    pub async fn invalidate(&self) {
        *self.cache.lock().await = None;
    }
}
