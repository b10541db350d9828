//! Generic webhook channel: POSTs the message as JSON to a configured URL.

use super::endpoint::parse_endpoint;
use super::{Message, Sender};
use crate::config::ChannelConfig;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use std::time::Duration;
use tracing::{debug, error, instrument};
use url::Url;

/// Upper bound on how much of an error response body is kept.
const MAX_ERROR_BODY: usize = 2048;

/// Builds the HTTP client shared by a channel's requests.
pub(crate) fn build_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .context("building HTTP client")
}

/// Turns a non-2xx response into an error carrying the status and body.
pub(crate) async fn check_status(name: &str, response: reqwest::Response) -> Result<()> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    let body: String = body.trim().chars().take(MAX_ERROR_BODY).collect();
    error!(channel = name, status = %status, body = %body, "Notification request rejected");
    bail!("{} response status {}: {}", name, status, body)
}

/// Posts every message to a single webhook URL.
#[derive(Debug)]
pub struct Http {
    client: reqwest::Client,
    endpoint: Url,
    headers: HeaderMap,
}

impl Http {
    pub fn new(config: &ChannelConfig) -> Result<Self> {
        let endpoint = parse_endpoint("http", &config.endpoint, "")?;
        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.trim().as_bytes())
                .with_context(|| format!("invalid http header name {:?}", name))?;
            let value = HeaderValue::from_str(value.trim())
                .with_context(|| format!("invalid value for http header {}", name))?;
            headers.insert(name, value);
        }
        headers
            .entry(CONTENT_TYPE)
            .or_insert(HeaderValue::from_static("application/json"));
        Ok(Self {
            client: build_client(config.timeout())?,
            endpoint,
            headers,
        })
    }
}

#[async_trait]
impl Sender for Http {
    #[instrument(skip_all, fields(endpoint = %self.endpoint))]
    async fn send(&self, message: &dyn Message) -> Result<()> {
        let body = serde_json::to_vec(&message.to_json()).context("encoding http message")?;
        let response = self
            .client
            .post(self.endpoint.clone())
            .headers(self.headers.clone())
            .body(body)
            .send()
            .await
            .context("sending http message")?;
        check_status("http", response).await?;
        debug!("Webhook notification sent");
        Ok(())
    }
}
