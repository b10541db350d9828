//! Configuration management for modem-relay
//!
//! This module defines the main `Config` struct and its sub-structs. It uses
//! the `figment` crate to layer defaults, a `modem-relay.toml` file,
//! `MODEM_RELAY_` environment variables and command-line flags.

use crate::cli::Cli;
use anyhow::{bail, Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

/// Default configuration file, used when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "modem-relay.toml";

const DEFAULT_CHANNEL_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_MSS: u32 = 240;

/// The main configuration struct for the application.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// The logging level for the application.
    pub log_level: String,
    /// Log metrics to the console periodically.
    #[serde(default)]
    pub log_metrics: bool,
    /// Interval between metrics snapshots when `log_metrics` is set.
    pub metrics_interval_seconds: u64,
    /// Connection settings for the modem gateway feed.
    pub source: SourceConfig,
    /// Notification channels keyed by name.
    #[serde(default)]
    pub channels: BTreeMap<String, ChannelConfig>,
    /// Per-modem settings keyed by equipment identifier.
    #[serde(default)]
    pub modems: HashMap<String, ModemConfig>,
}

/// Configuration for the modem gateway WebSocket feed.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SourceConfig {
    /// The URL of the gateway's WebSocket feed.
    pub feed_url: String,
    pub reconnect_initial_backoff_ms: u64,
    pub reconnect_max_backoff_ms: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            feed_url: "ws://127.0.0.1:7575/modems".to_string(),
            reconnect_initial_backoff_ms: 1000,
            reconnect_max_backoff_ms: 60_000,
        }
    }
}

/// One notification channel.
///
/// Which fields are required depends on the channel type; the senders
/// validate them when they are constructed.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct ChannelConfig {
    /// Channel type. Falls back to the channel name when absent.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub recipients: Vec<Recipient>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Notification title, for channels that have one.
    #[serde(default)]
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,
    /// Request timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    // SMTP settings, used by email channels.
    #[serde(default)]
    pub smtp_host: String,
    #[serde(default)]
    pub smtp_port: u16,
    #[serde(default)]
    pub smtp_username: String,
    #[serde(default)]
    pub smtp_password: String,
    #[serde(default)]
    pub from: String,
    /// `mandatory` (default), `opportunistic` or `none`.
    #[serde(default)]
    pub tls_policy: String,
    /// Use implicit TLS (SMTPS) instead of STARTTLS.
    #[serde(default)]
    pub ssl: bool,
}

impl ChannelConfig {
    pub fn timeout(&self) -> Duration {
        self.timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_CHANNEL_TIMEOUT)
    }

    /// Recipients as trimmed strings, blanks dropped.
    pub fn recipient_strings(&self) -> Vec<String> {
        self.recipients
            .iter()
            .map(|r| r.to_string().trim().to_string())
            .filter(|r| !r.is_empty())
            .collect()
    }

    /// The trimmed subject, or `default` when it is blank.
    pub fn title_or(&self, default: &str) -> String {
        let subject = self.subject.trim();
        if subject.is_empty() {
            default.to_string()
        } else {
            subject.to_string()
        }
    }
}

/// A recipient written either as a number or as a string.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum Recipient {
    Id(i64),
    Name(String),
}

impl Recipient {
    /// Returns the recipient as a numeric ID.
    pub fn as_i64(&self) -> Result<i64> {
        match self {
            Recipient::Id(id) => Ok(*id),
            Recipient::Name(name) => {
                let trimmed = name.trim();
                if trimmed.is_empty() {
                    bail!("empty recipient");
                }
                trimmed
                    .parse()
                    .with_context(|| format!("recipient {:?} is not a numeric id", trimmed))
            }
        }
    }
}

impl std::fmt::Display for Recipient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Recipient::Id(id) => write!(f, "{}", id),
            Recipient::Name(name) => write!(f, "{}", name),
        }
    }
}

/// Per-modem settings.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct ModemConfig {
    /// Display label used in notifications instead of the model.
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub compatible: bool,
    #[serde(default = "default_mss")]
    pub mss: u32,
}

fn default_mss() -> u32 {
    DEFAULT_MSS
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            alias: String::new(),
            compatible: false,
            mss: DEFAULT_MSS,
        }
    }
}

impl Config {
    /// Loads the configuration, layering defaults, the TOML file, the
    /// environment and the command line.
    pub fn load(cli: &Cli) -> Result<Self> {
        let path = cli
            .config
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&path))
            // e.g. MODEM_RELAY_SOURCE__FEED_URL=ws://gateway/modems
            .merge(Env::prefixed("MODEM_RELAY_").split("__"))
            .merge(cli.clone())
            .extract()
            .with_context(|| format!("loading configuration from {}", path.display()))?;
        Ok(config)
    }

    /// Returns the settings for `equipment_id`, or the defaults.
    pub fn find_modem(&self, equipment_id: &str) -> ModemConfig {
        self.modems
            .get(equipment_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_metrics: false,
            metrics_interval_seconds: 60,
            source: SourceConfig::default(),
            channels: BTreeMap::new(),
            modems: HashMap::new(),
        }
    }
}
