//! Fan-out of relayed messages to the configured notification channels.
//!
//! Each delivery technology implements [`Sender`]. The [`Notifier`] owns an
//! immutable table of senders keyed by lower-cased channel name and delivers
//! one message to many channels concurrently, collecting every failure into a
//! single [`DeliveryError`].

pub mod bark;
pub mod email;
pub mod endpoint;
pub mod gotify;
pub mod http;
pub mod telegram;

use crate::config::ChannelConfig;
use anyhow::Context;
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// A channel-agnostic notification payload.
///
/// `Display` yields the plain-text form; `markdown` yields the escaped
/// Telegram MarkdownV2 form.
pub trait Message: fmt::Display + Send + Sync {
    fn markdown(&self) -> String;

    /// Structured form posted by webhook channels.
    fn to_json(&self) -> serde_json::Value {
        serde_json::json!({ "text": self.to_string() })
    }
}

/// A delivery channel capable of sending a message.
#[async_trait]
pub trait Sender: Send + Sync {
    /// Delivers `message`. Transports enforce their own timeouts.
    async fn send(&self, message: &dyn Message) -> anyhow::Result<()>;
}

/// One failed channel in a fan-out.
#[derive(Debug)]
pub struct ChannelFailure {
    pub channel: String,
    pub error: anyhow::Error,
}

impl fmt::Display for ChannelFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} send failed: {:#}", self.channel, self.error)
    }
}

/// Aggregate of every channel that failed during one `Notifier::send`.
#[derive(Error, Debug)]
#[error("{}", render_failures(.failures))]
pub struct DeliveryError {
    pub failures: Vec<ChannelFailure>,
}

impl DeliveryError {
    /// Names of the channels that failed, in failure order.
    pub fn failed_channels(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.channel.as_str()).collect()
    }
}

fn render_failures(failures: &[ChannelFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("notify sender is required")]
    MissingSender,

    #[error(transparent)]
    Send(#[from] anyhow::Error),
}

/// Dispatches messages to every configured channel.
#[derive(Clone, Default)]
pub struct Notifier {
    channels: HashMap<String, Arc<dyn Sender>>,
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier")
            .field("channels", &self.channel_names())
            .finish()
    }
}

impl Notifier {
    /// Builds the channel table from configuration.
    ///
    /// Fails if any channel has an unsupported type or invalid parameters.
    pub fn from_config(channels: &BTreeMap<String, ChannelConfig>) -> anyhow::Result<Self> {
        let mut table = HashMap::with_capacity(channels.len());
        for (name, channel) in channels {
            let sender = create_sender(name, channel)
                .with_context(|| format!("creating {} channel", name))?;
            table.insert(name.to_lowercase(), sender);
        }
        Ok(Self { channels: table })
    }

    /// Builds a notifier from already constructed senders.
    pub fn with_senders<I, S>(senders: I) -> Self
    where
        I: IntoIterator<Item = (S, Arc<dyn Sender>)>,
        S: AsRef<str>,
    {
        let channels = senders
            .into_iter()
            .map(|(name, sender)| (name.as_ref().to_lowercase(), sender))
            .collect();
        Self { channels }
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Configured channel names, sorted.
    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.keys().cloned().collect();
        names.sort();
        names
    }

    /// Sends `message` to `targets`, or to every channel when `targets` is empty.
    ///
    /// Unknown target names are logged and skipped. Every resolved channel is
    /// attempted exactly once, concurrently, and all are awaited before
    /// returning.
    pub async fn send(
        &self,
        message: Arc<dyn Message>,
        targets: &[&str],
    ) -> Result<(), DeliveryError> {
        let resolved = self.resolve_targets(targets);
        if resolved.is_empty() {
            debug!("No notification targets resolved; nothing to send");
            return Ok(());
        }

        let deliveries = resolved.into_iter().map(|(name, sender)| {
            let message = message.clone();
            let handle = tokio::spawn(async move { sender.send(message.as_ref()).await });
            async move { (name, handle.await) }
        });

        let mut failures = Vec::new();
        for (channel, outcome) in join_all(deliveries).await {
            let result = match outcome {
                Ok(result) => result,
                Err(join_error) => Err(anyhow::anyhow!("delivery task failed: {}", join_error)),
            };
            match result {
                Ok(()) => {
                    metrics::counter!("channel_deliveries_total", "channel" => channel.clone(), "outcome" => "success").increment(1);
                    debug!(channel = %channel, "Notification delivered");
                }
                Err(error) => {
                    metrics::counter!("channel_deliveries_total", "channel" => channel.clone(), "outcome" => "failure").increment(1);
                    failures.push(ChannelFailure { channel, error });
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(DeliveryError { failures })
        }
    }

    fn resolve_targets(&self, targets: &[&str]) -> Vec<(String, Arc<dyn Sender>)> {
        if targets.is_empty() {
            return self
                .channels
                .iter()
                .map(|(name, sender)| (name.clone(), sender.clone()))
                .collect();
        }

        let mut resolved: Vec<(String, Arc<dyn Sender>)> = Vec::with_capacity(targets.len());
        for target in targets {
            let name = target.to_lowercase();
            if resolved.iter().any(|(existing, _)| *existing == name) {
                continue;
            }
            match self.channels.get(&name) {
                Some(sender) => resolved.push((name, sender.clone())),
                None => warn!(channel = %name, "Notification channel not found"),
            }
        }
        resolved
    }
}

/// Sends `message` through a single, explicitly supplied sender.
pub async fn send_to(
    sender: Option<&dyn Sender>,
    message: &dyn Message,
) -> Result<(), NotifyError> {
    let sender = sender.ok_or(NotifyError::MissingSender)?;
    sender.send(message).await?;
    Ok(())
}

/// Creates the sender for one configured channel.
///
/// The channel type is taken from the `type` field, falling back to the
/// channel name.
pub fn create_sender(name: &str, channel: &ChannelConfig) -> anyhow::Result<Arc<dyn Sender>> {
    let kind = channel
        .kind
        .as_deref()
        .unwrap_or(name)
        .trim()
        .to_lowercase();
    let sender: Arc<dyn Sender> = match kind.as_str() {
        "telegram" => Arc::new(telegram::Telegram::new(channel)?),
        "http" | "webhook" => Arc::new(http::Http::new(channel)?),
        "bark" => Arc::new(bark::Bark::new(channel)?),
        "gotify" => Arc::new(gotify::Gotify::new(channel)?),
        "email" => Arc::new(email::Email::new(channel)?),
        other => anyhow::bail!("unsupported channel type: {}", other),
    };
    Ok(sender)
}
