//! A client for sending notifications through the Telegram Bot API.

use super::endpoint::parse_endpoint;
use super::{Message, Sender};
use crate::config::ChannelConfig;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, error, instrument};
use url::Url;

const DEFAULT_TELEGRAM_ENDPOINT: &str = "https://api.telegram.org";
const PARSE_MODE_MARKDOWN_V2: &str = "MarkdownV2";

/// Sends MarkdownV2 messages to one or more Telegram chats.
#[derive(Debug)]
pub struct Telegram {
    client: reqwest::Client,
    send_message_url: Url,
    recipients: Vec<i64>,
}

impl Telegram {
    pub fn new(config: &ChannelConfig) -> Result<Self> {
        let bot_token = config.bot_token.trim();
        if bot_token.is_empty() {
            bail!("telegram bot token is required");
        }
        let mut send_message_url =
            parse_endpoint("telegram", &config.endpoint, DEFAULT_TELEGRAM_ENDPOINT)?;
        let base = send_message_url.path().trim_end_matches('/').to_string();
        send_message_url.set_path(&format!("{}/bot{}/sendMessage", base, bot_token));

        let recipients = config
            .recipients
            .iter()
            .map(|r| r.as_i64())
            .collect::<Result<Vec<_>>>()
            .context("parsing telegram recipients")?;
        if recipients.is_empty() {
            bail!("telegram recipients is required");
        }

        Ok(Self {
            client: super::http::build_client(config.timeout())?,
            send_message_url,
            recipients,
        })
    }

    async fn send_one(&self, chat_id: i64, text: &str) -> Result<()> {
        let payload = json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": PARSE_MODE_MARKDOWN_V2,
        });
        let response = self
            .client
            .post(self.send_message_url.clone())
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                // The request URL embeds the bot token, keep it out of the error.
                error!(recipient = chat_id, error = %e.without_url(), "Telegram API request failed");
                anyhow::anyhow!("telegram API request failed")
            })?;
        super::http::check_status("telegram", response).await
    }
}

#[async_trait]
impl Sender for Telegram {
    #[instrument(skip_all, fields(recipients = self.recipients.len()))]
    async fn send(&self, message: &dyn Message) -> Result<()> {
        let text = message.markdown();
        let mut errors = Vec::new();
        for chat_id in &self.recipients {
            if let Err(e) = self.send_one(*chat_id, &text).await {
                errors.push(format!("{:#}", e));
            }
        }
        if !errors.is_empty() {
            bail!(errors.join("; "));
        }
        debug!("Telegram notification sent");
        Ok(())
    }
}
