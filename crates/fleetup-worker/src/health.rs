//! Local HTTP health probe run after services restart.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

/// Result of a single health probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResult {
    /// The health endpoint returned 2xx.
    Healthy,
    /// The health endpoint answered with this non-2xx status.
    Unhealthy(u16),
    /// The probe could not be executed (bad URL, connection error, timeout).
    Failed(String),
}

impl ProbeResult {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ProbeResult::Healthy)
    }
}

/// Perform one HTTP GET against `url`. Only plain `http://` is supported.
pub async fn http_probe(url: &str, timeout: Duration) -> ProbeResult {
    let uri: http::Uri = match url.parse() {
        Ok(uri) => uri,
        Err(e) => return ProbeResult::Failed(format!("invalid health url {url}: {e}")),
    };
    if !uri.scheme_str().is_some_and(|s| s.eq_ignore_ascii_case("http")) {
        return ProbeResult::Failed(format!("health url {url} is not plain http://"));
    }
    let Some(authority) = uri.authority().cloned() else {
        return ProbeResult::Failed(format!("health url {url} has no host"));
    };
    let address = match authority.port_u16() {
        Some(_) => authority.to_string(),
        None => format!("{}:80", authority.host()),
    };

    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(&address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %url, "health probe connection failed");
                return ProbeResult::Failed(format!("connect {address}: {e}"));
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %url, "health probe handshake failed");
                return ProbeResult::Failed(format!("handshake: {e}"));
            }
        };

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
        let req = match http::Request::builder()
            .method("GET")
            .uri(path)
            .header("host", authority.as_str())
            .header("user-agent", concat!("fleetup/", env!("CARGO_PKG_VERSION")))
            .body(http_body_util::Empty::<bytes::Bytes>::new())
        {
            Ok(req) => req,
            Err(e) => return ProbeResult::Failed(format!("build request: {e}")),
        };

        match sender.send_request(req).await {
            Ok(resp) if resp.status().is_success() => ProbeResult::Healthy,
            Ok(resp) => {
                debug!(status = %resp.status(), %url, "health probe non-2xx");
                ProbeResult::Unhealthy(resp.status().as_u16())
            }
            Err(e) => {
                debug!(error = %e, %url, "health probe request failed");
                ProbeResult::Failed(format!("request: {e}"))
            }
        }
    })
    .await;

    match result {
        Ok(probe) => probe,
        Err(_) => {
            debug!(%url, "health probe timed out");
            ProbeResult::Failed(format!("timed out after {timeout:?}"))
        }
    }
}

/// Probe until healthy or `budget` runs out. Returns the last result.
pub async fn wait_healthy(url: &str, budget: Duration, interval: Duration) -> ProbeResult {
    let deadline = Instant::now() + budget;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let result = http_probe(url, remaining.min(interval.max(Duration::from_secs(1)))).await;
        if result.is_healthy() || Instant::now() + interval >= deadline {
            return result;
        }
        tokio::time::sleep(interval).await;
    }
}
