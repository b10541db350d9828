//! Bark push notifications (iOS).

use super::endpoint::{ensure_endpoint_path, parse_endpoint};
use super::{Message, Sender};
use crate::config::ChannelConfig;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, instrument};
use url::Url;

const DEFAULT_BARK_ENDPOINT: &str = "https://api.day.app";
pub(crate) const DEFAULT_TITLE: &str = "Modem Relay";

/// Pushes the plain-text message to every configured Bark device key.
#[derive(Debug)]
pub struct Bark {
    client: reqwest::Client,
    endpoint: Url,
    device_keys: Vec<String>,
    title: String,
}

impl Bark {
    pub fn new(config: &ChannelConfig) -> Result<Self> {
        let mut endpoint = parse_endpoint("bark", &config.endpoint, DEFAULT_BARK_ENDPOINT)?;
        ensure_endpoint_path(&mut endpoint, "push");
        let device_keys = config.recipient_strings();
        if device_keys.is_empty() {
            bail!("bark recipients are required");
        }
        Ok(Self {
            client: super::http::build_client(config.timeout())?,
            endpoint,
            device_keys,
            title: config.title_or(DEFAULT_TITLE),
        })
    }

    async fn send_one(&self, device_key: &str, body: &str) -> Result<()> {
        let payload = json!({
            "title": self.title,
            "body": body,
            "device_key": device_key,
        });
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&payload)
            .send()
            .await
            .context("sending bark message")?;
        super::http::check_status("bark", response).await
    }
}

#[async_trait]
impl Sender for Bark {
    #[instrument(skip_all, fields(devices = self.device_keys.len()))]
    async fn send(&self, message: &dyn Message) -> Result<()> {
        let body = message.to_string().trim().to_string();
        if body.is_empty() {
            bail!("bark body is required");
        }
        let mut errors = Vec::new();
        for device_key in &self.device_keys {
            if let Err(e) = self.send_one(device_key, &body).await {
                errors.push(format!("{:#}", e));
            }
        }
        if !errors.is_empty() {
            bail!(errors.join("; "));
        }
        debug!("Bark notification sent");
        Ok(())
    }
}
