//! Notification sinks.

use std::sync::Arc;
use std::time::Duration;

use fleetup_core::config::NotifyConfig;
use fleetup_core::{BoxFuture, RequestState, UpdateRequest};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::notification::{Category, Notification};

pub type NotifyResult<T> = Result<T, NotifyError>;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("failed to build http client: {0}")]
    Client(String),

    #[error("webhook request failed: {0}")]
    Network(String),

    #[error("webhook returned HTTP {0}")]
    Status(u16),
}

/// Receives rollout transitions. Implementations never fail the caller.
pub trait NotificationSink: Send + Sync {
    /// A rollout was proposed.
    fn notify_info<'a>(
        &'a self,
        request: &'a UpdateRequest,
        message: &'a str,
    ) -> BoxFuture<'a, ()>;

    /// Every node of the rollout succeeded.
    fn notify_succeeded<'a>(&'a self, request: &'a UpdateRequest) -> BoxFuture<'a, ()>;

    /// The rollout halted.
    fn notify_failure<'a>(
        &'a self,
        request: &'a UpdateRequest,
        message: &'a str,
    ) -> BoxFuture<'a, ()>;
}

/// Drops every notification. Used when no webhook is configured.
#[derive(Debug, Default, Clone)]
pub struct NoopNotifier;

impl NotificationSink for NoopNotifier {
    fn notify_info<'a>(
        &'a self,
        request: &'a UpdateRequest,
        message: &'a str,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            debug!(version = %request.version, message, "notify (noop): info")
        })
    }

    fn notify_succeeded<'a>(&'a self, request: &'a UpdateRequest) -> BoxFuture<'a, ()> {
        Box::pin(async move { debug!(version = %request.version, "notify (noop): succeeded") })
    }

    fn notify_failure<'a>(
        &'a self,
        request: &'a UpdateRequest,
        message: &'a str,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            debug!(version = %request.version, message, "notify (noop): failure")
        })
    }
}

/// Posts notifications to a Slack-compatible incoming webhook.
pub struct WebhookNotifier {
    http: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: &str, proxy: Option<&str>, timeout: Duration) -> NotifyResult<Self> {
        let mut builder = reqwest::Client::builder().timeout(timeout);
        if let Some(proxy) = proxy {
            let proxy = reqwest::Proxy::all(proxy).map_err(|e| NotifyError::Client(e.to_string()))?;
            builder = builder.proxy(proxy);
        }
        let http = builder
            .build()
            .map_err(|e| NotifyError::Client(e.to_string()))?;
        Ok(Self {
            http,
            url: url.to_string(),
        })
    }

    pub async fn send(&self, notification: &Notification) -> NotifyResult<()> {
        let response = self
            .http
            .post(&self.url)
            .json(&notification.to_payload())
            .send()
            .await
            .map_err(|e| NotifyError::Network(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Status(status.as_u16()));
        }
        Ok(())
    }

    async fn deliver(&self, notification: Notification) {
        match self.send(&notification).await {
            Ok(()) => debug!(title = %notification.title, "notification sent"),
            Err(e) => warn!(title = %notification.title, error = %e, "notification failed"),
        }
    }
}

impl NotificationSink for WebhookNotifier {
    fn notify_info<'a>(
        &'a self,
        request: &'a UpdateRequest,
        message: &'a str,
    ) -> BoxFuture<'a, ()> {
        let title = format!("Update to {} started", request.version);
        let notification = Notification::for_request(Category::Info, &title, message, request);
        Box::pin(self.deliver(notification))
    }

    fn notify_succeeded<'a>(&'a self, request: &'a UpdateRequest) -> BoxFuture<'a, ()> {
        let title = format!("Update to {} succeeded", request.version);
        let text = format!("All {} nodes updated.", request.nodes.len());
        let notification = Notification::for_request(Category::Success, &title, &text, request);
        Box::pin(self.deliver(notification))
    }

    fn notify_failure<'a>(
        &'a self,
        request: &'a UpdateRequest,
        message: &'a str,
    ) -> BoxFuture<'a, ()> {
        let title = match &request.state {
            RequestState::Failed { node: Some(node), .. } => {
                format!("Update to {} failed on {node}", request.version)
            }
            _ => format!("Update to {} failed", request.version),
        };
        let notification = Notification::for_request(Category::Failure, &title, message, request);
        Box::pin(self.deliver(notification))
    }
}

/// The sink selected by the configuration.
pub fn from_config(
    config: &NotifyConfig,
    proxy: Option<&str>,
) -> NotifyResult<Arc<dyn NotificationSink>> {
    match &config.webhook_url {
        Some(url) => {
            info!("webhook notifications enabled");
            Ok(Arc::new(WebhookNotifier::new(url, proxy, config.timeout)?))
        }
        None => Ok(Arc::new(NoopNotifier)),
    }
}
