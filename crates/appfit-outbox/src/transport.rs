//! Collector transport.

use crate::{OutboxError, OutboxResult, WireEvent};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Delivers wire events to the collector.
///
/// `Ok(())` means the collector fully acknowledged the call. Any error is a
/// transport failure and sends the event(s) down the retry path.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one event.
    async fn send(&self, event: &WireEvent) -> OutboxResult<()>;

    /// Send a batch. Acknowledgment covers the whole batch or nothing.
    async fn send_batch(&self, events: &[WireEvent]) -> OutboxResult<()>;
}

/// Run a transport call under a caller-imposed deadline.
pub(crate) async fn send_with_timeout<F>(limit: Duration, send: F) -> OutboxResult<()>
where
    F: Future<Output = OutboxResult<()>>,
{
    match tokio::time::timeout(limit, send).await {
        Ok(result) => result,
        Err(_) => Err(OutboxError::Timeout(limit)),
    }
}

/// HTTP transport configuration.
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    /// Collector base URL.
    pub api_base_url: String,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            api_base_url: appfit_config_and_utils::DEFAULT_API_BASE_URL.to_string(),
            timeout_secs: appfit_config_and_utils::DEFAULT_SEND_TIMEOUT_SECS,
        }
    }
}

impl From<&appfit_config_and_utils::OutboxConfig> for HttpTransportConfig {
    fn from(config: &appfit_config_and_utils::OutboxConfig) -> Self {
        Self {
            api_base_url: config.api_base_url.clone(),
            timeout_secs: config.send_timeout_secs,
        }
    }
}

/// JSON-over-HTTPS transport to the AppFit collector.
pub struct HttpTransport {
    config: HttpTransportConfig,
    client: Client,
    api_key: String,
}

impl HttpTransport {
    /// Create a new HTTP transport.
    pub fn new(config: HttpTransportConfig, api_key: &str) -> OutboxResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            config,
            client,
            api_key: api_key.to_string(),
        })
    }

    fn single_url(&self) -> String {
        format!("{}/metric-events", self.config.api_base_url.trim_end_matches('/'))
    }

    fn batch_url(&self) -> String {
        format!("{}/batch", self.single_url())
    }

    async fn post<T: Serialize + ?Sized>(&self, url: &str, body: &T) -> OutboxResult<()> {
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OutboxError::Transport(format!("HTTP {}: {}", status, body)));
        }

        Ok(())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, event: &WireEvent) -> OutboxResult<()> {
        let url = self.single_url();
        debug!(url = %url, event_id = %event.payload.event_id, "Sending event");
        self.post(&url, event).await
    }

    async fn send_batch(&self, events: &[WireEvent]) -> OutboxResult<()> {
        let url = self.batch_url();
        debug!(url = %url, events = events.len(), "Sending batch");
        self.post(&url, events).await
    }
}
