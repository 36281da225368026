//! PackageFetcher: resolve a version to a release asset and download it.
//!
//! Downloads stream into a temporary file in the download directory while
//! hashing. The file is renamed into place only after the size and (when
//! published) the SHA-256 digest match.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use fleetup_core::config::ReleaseConfig;
use fleetup_core::ReleaseChannel;
use futures::TryStreamExt;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{FetchError, FetchResult};
use crate::github::{Asset, ReleaseSource};

/// A resolved, downloadable package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub version: String,
    pub tag: String,
    pub asset: Asset,
    /// `<asset>.sha256` companion, when the release publishes one.
    pub checksum: Option<Asset>,
}

/// A verified file in the download directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Downloaded {
    pub path: PathBuf,
    pub size: u64,
    pub sha256: String,
}

pub struct PackageFetcher {
    source: Arc<dyn ReleaseSource>,
    http: reqwest::Client,
    config: ReleaseConfig,
    download_dir: PathBuf,
    timeout: Duration,
}

fn network(e: reqwest::Error) -> FetchError {
    FetchError::Network(e.to_string())
}

fn io(message: impl Into<String>) -> impl FnOnce(std::io::Error) -> FetchError {
    let message = message.into();
    move |err| FetchError::Io { message, err }
}

/// Map a non-2xx download response.
fn status_error(status: StatusCode, url: &str) -> FetchError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        FetchError::Network(format!("HTTP {status} for {url}"))
    } else {
        FetchError::NotFound(format!("HTTP {status} for {url}"))
    }
}

/// First token of a `sha256sum`-style line.
fn parse_checksum(body: &str) -> FetchResult<String> {
    let digest = body.split_whitespace().next().unwrap_or_default();
    if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(FetchError::Integrity(format!(
            "malformed checksum file: {:?}",
            body.trim()
        )));
    }
    Ok(digest.to_ascii_lowercase())
}

impl PackageFetcher {
    pub fn new(
        source: Arc<dyn ReleaseSource>,
        http: reqwest::Client,
        config: ReleaseConfig,
        download_dir: &Path,
        timeout: Duration,
    ) -> Self {
        Self {
            source,
            http,
            config,
            download_dir: download_dir.to_path_buf(),
            timeout,
        }
    }

    pub fn channel(&self) -> ReleaseChannel {
        self.config.channel
    }

    /// Find the release for `version` and its package asset.
    ///
    /// The release must satisfy the channel policy; a draft or (on
    /// production) a pre-release resolves to `NotFound`.
    pub async fn resolve(&self, version: &str) -> FetchResult<Artifact> {
        let releases = self.source.list_releases().await?;
        let channel = self.config.channel;
        let release = releases
            .iter()
            .filter(|r| r.version(&self.config.tag_prefix) == version)
            .find(|r| r.eligible(channel))
            .ok_or_else(|| {
                FetchError::NotFound(format!("no {channel} release for version {version}"))
            })?;

        let name = self.config.asset_name(version);
        if name.contains('/') || name.contains("..") {
            return Err(FetchError::NotFound(format!("invalid asset name {name:?}")));
        }
        let asset = release.asset(&name).cloned().ok_or_else(|| {
            FetchError::NotFound(format!("release {} has no asset {name}", release.tag_name))
        })?;
        let checksum = release.asset(&format!("{name}.sha256")).cloned();
        debug!(
            version,
            tag = %release.tag_name,
            asset = %asset.name,
            checksum = checksum.is_some(),
            "resolved artifact"
        );
        Ok(Artifact {
            version: version.to_string(),
            tag: release.tag_name.clone(),
            asset,
            checksum,
        })
    }

    /// Download and verify `artifact` into the download directory.
    pub async fn download(&self, artifact: &Artifact) -> FetchResult<Downloaded> {
        let directory = self.download_dir.as_path();
        tokio::fs::create_dir_all(directory)
            .await
            .map_err(io(format!("creating directory {directory:?}")))?;

        let expected_digest = match &artifact.checksum {
            Some(asset) => Some(self.fetch_checksum(asset).await?),
            None => None,
        };

        // Written under a temporary name; renamed once verified.
        let (file, temp_path) = NamedTempFile::new_in(directory)
            .map_err(io("create temp file"))?
            .into_parts();
        let mut file = tokio::fs::File::from_std(file);

        let url = artifact.asset.browser_download_url.as_str();
        let response = self
            .http
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(network)?;
        if !response.status().is_success() {
            return Err(status_error(response.status(), url));
        }

        let mut hasher = Sha256::new();
        let mut size = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.try_next().await.map_err(network)? {
            hasher.update(&chunk);
            size += chunk.len() as u64;
            file.write_all(&chunk).await.map_err(io("write_all"))?;
        }
        file.flush().await.map_err(io("flush temp file"))?;
        drop(file);

        if artifact.asset.size > 0 && size != artifact.asset.size {
            return Err(FetchError::Integrity(format!(
                "{}: expected {} bytes, got {size}",
                artifact.asset.name, artifact.asset.size
            )));
        }
        let sha256 = hex::encode(hasher.finalize());
        if let Some(expected) = expected_digest {
            if expected != sha256 {
                return Err(FetchError::Integrity(format!(
                    "{}: sha256 {sha256} does not match published {expected}",
                    artifact.asset.name
                )));
            }
        }

        let destination = directory.join(&artifact.asset.name);
        temp_path.persist(&destination).map_err(|err| FetchError::Io {
            message: format!("renaming {:?} to {destination:?}", err.path),
            err: err.error,
        })?;
        info!(
            version = %artifact.version,
            path = ?destination,
            size,
            %sha256,
            "package downloaded"
        );
        Ok(Downloaded {
            path: destination,
            size,
            sha256,
        })
    }

    /// Resolve then download.
    pub async fn fetch(&self, version: &str) -> FetchResult<Downloaded> {
        let artifact = self.resolve(version).await?;
        self.download(&artifact).await
    }

    async fn fetch_checksum(&self, asset: &Asset) -> FetchResult<String> {
        let url = asset.browser_download_url.as_str();
        let response = self
            .http
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(network)?;
        if !response.status().is_success() {
            return Err(status_error(response.status(), url));
        }
        let body = response.text().await.map_err(network)?;
        parse_checksum(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReleaseResult;
    use crate::github::Release;
    use axum::routing::get;
    use axum::Router;
    use fleetup_core::BoxFuture;

    const PAYLOAD: &[u8] = b"not really a debian package";

    struct StaticRegistry(Vec<Release>);

    impl ReleaseSource for StaticRegistry {
        fn list_releases(&self) -> BoxFuture<'_, ReleaseResult<Vec<Release>>> {
            let releases = self.0.clone();
            Box::pin(async move { Ok(releases) })
        }
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
        format!("http://{addr}")
    }

    fn digest(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    fn asset(base: &str, name: &str, size: u64) -> Asset {
        Asset {
            name: name.to_string(),
            browser_download_url: format!("{base}/{name}"),
            size,
        }
    }

    fn release(tag: &str, prerelease: bool, assets: Vec<Asset>) -> Release {
        Release {
            tag_name: tag.to_string(),
            draft: false,
            prerelease,
            published_at: Some("2024-05-01T00:00:00Z".into()),
            assets,
        }
    }

    fn config(channel: ReleaseChannel) -> ReleaseConfig {
        ReleaseConfig {
            owner: "acme".into(),
            repo: "boot".into(),
            package: "boot".into(),
            channel,
            ..ReleaseConfig::default()
        }
    }

    fn fetcher(releases: Vec<Release>, channel: ReleaseChannel, dir: &Path) -> PackageFetcher {
        let http = crate::http_client(None, Duration::from_secs(5)).unwrap();
        PackageFetcher::new(
            Arc::new(StaticRegistry(releases)),
            http,
            config(channel),
            dir,
            Duration::from_secs(5),
        )
    }

    #[test]
    fn checksum_file_formats() {
        let hex = "A".repeat(64);
        assert_eq!(parse_checksum(&format!("{hex}  boot.deb\n")).unwrap(), "a".repeat(64));
        assert!(parse_checksum("deadbeef").is_err());
        assert!(parse_checksum("").is_err());
    }

    #[tokio::test]
    async fn downloads_and_verifies() {
        let sum = format!("{}  boot_2.0.0_amd64.deb\n", digest(PAYLOAD));
        let router = Router::new()
            .route("/boot_2.0.0_amd64.deb", get(|| async { PAYLOAD }))
            .route("/boot_2.0.0_amd64.deb.sha256", get(move || async move { sum }));
        let base = serve(router).await;
        let dir = tempfile::tempdir().unwrap();
        let releases = vec![release(
            "v2.0.0",
            false,
            vec![
                asset(&base, "boot_2.0.0_amd64.deb", PAYLOAD.len() as u64),
                asset(&base, "boot_2.0.0_amd64.deb.sha256", 0),
            ],
        )];

        let downloaded = fetcher(releases, ReleaseChannel::Production, dir.path())
            .fetch("2.0.0")
            .await
            .unwrap();
        assert_eq!(downloaded.path, dir.path().join("boot_2.0.0_amd64.deb"));
        assert_eq!(downloaded.sha256, digest(PAYLOAD));
        assert_eq!(std::fs::read(&downloaded.path).unwrap(), PAYLOAD);
    }

    #[tokio::test]
    async fn digest_mismatch_is_integrity_error() {
        let wrong = format!("{}  boot_2.0.0_amd64.deb\n", digest(b"something else"));
        let router = Router::new()
            .route("/boot_2.0.0_amd64.deb", get(|| async { PAYLOAD }))
            .route("/boot_2.0.0_amd64.deb.sha256", get(move || async move { wrong }));
        let base = serve(router).await;
        let dir = tempfile::tempdir().unwrap();
        let releases = vec![release(
            "v2.0.0",
            false,
            vec![
                asset(&base, "boot_2.0.0_amd64.deb", 0),
                asset(&base, "boot_2.0.0_amd64.deb.sha256", 0),
            ],
        )];

        let err = fetcher(releases, ReleaseChannel::Production, dir.path())
            .fetch("2.0.0")
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Integrity(_)));
        assert!(!err.is_transient());
        // Nothing is left behind, not even the temporary file.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn size_mismatch_is_integrity_error() {
        let router = Router::new().route("/boot_2.0.0_amd64.deb", get(|| async { PAYLOAD }));
        let base = serve(router).await;
        let dir = tempfile::tempdir().unwrap();
        let releases = vec![release(
            "v2.0.0",
            false,
            vec![asset(&base, "boot_2.0.0_amd64.deb", 9999)],
        )];

        let err = fetcher(releases, ReleaseChannel::Production, dir.path())
            .fetch("2.0.0")
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Integrity(_)));
    }

    #[tokio::test]
    async fn missing_download_is_not_found() {
        let base = serve(Router::new()).await;
        let dir = tempfile::tempdir().unwrap();
        let releases = vec![release(
            "v2.0.0",
            false,
            vec![asset(&base, "boot_2.0.0_amd64.deb", 0)],
        )];

        let err = fetcher(releases, ReleaseChannel::Production, dir.path())
            .fetch("2.0.0")
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::NotFound(_)));
    }

    #[tokio::test]
    async fn production_does_not_resolve_prereleases() {
        let dir = tempfile::tempdir().unwrap();
        let releases = vec![release(
            "v2.1.0-rc.1",
            true,
            vec![asset("http://unused", "boot_2.1.0-rc.1_amd64.deb", 0)],
        )];

        let production = fetcher(releases.clone(), ReleaseChannel::Production, dir.path());
        assert!(matches!(
            production.resolve("2.1.0-rc.1").await,
            Err(FetchError::NotFound(_))
        ));
        let staging = fetcher(releases, ReleaseChannel::Staging, dir.path());
        let artifact = staging.resolve("2.1.0-rc.1").await.unwrap();
        assert_eq!(artifact.tag, "v2.1.0-rc.1");
        assert!(artifact.checksum.is_none());
    }

    #[tokio::test]
    async fn release_without_matching_asset() {
        let dir = tempfile::tempdir().unwrap();
        let releases = vec![release(
            "v2.0.0",
            false,
            vec![asset("http://unused", "other.tar.gz", 0)],
        )];
        let err = fetcher(releases, ReleaseChannel::Production, dir.path())
            .resolve("2.0.0")
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::NotFound(_)));
    }

    #[tokio::test]
    async fn unreachable_server_is_transient() {
        let dir = tempfile::tempdir().unwrap();
        // Bind then drop to get a port nobody listens on.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let releases = vec![release(
            "v2.0.0",
            false,
            vec![asset(&format!("http://127.0.0.1:{port}"), "boot_2.0.0_amd64.deb", 0)],
        )];
        let err = fetcher(releases, ReleaseChannel::Production, dir.path())
            .fetch("2.0.0")
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
