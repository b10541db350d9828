//! Command-Line Interface (CLI) argument parsing.
//!
//! The arguments are parsed at startup and merged on top of the
//! configuration file and environment variables.

use clap::Parser;
use figment::{
    value::{Dict, Map, Tag, Value},
    Error, Metadata, Profile, Provider,
};
use std::path::PathBuf;

/// Relays SMS events from cellular modems to notification channels.
#[derive(Parser, Debug, Default, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Default log level (overridden by RUST_LOG).
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// WebSocket URL of the modem gateway feed.
    #[arg(long, value_name = "URL")]
    pub feed_url: Option<String>,

    /// Periodically log a snapshot of the internal metrics.
    #[arg(long)]
    pub log_metrics: bool,
}

impl Provider for Cli {
    fn metadata(&self) -> Metadata {
        Metadata::named("Command-Line Arguments")
    }

    fn data(&self) -> Result<Map<Profile, Dict>, Error> {
        let mut dict = Dict::new();

        if let Some(level) = &self.log_level {
            dict.insert("log_level".into(), Value::from(level.clone()));
        }

        if let Some(url) = &self.feed_url {
            let mut source = Dict::new();
            source.insert("feed_url".into(), Value::from(url.clone()));
            dict.insert("source".into(), Value::Dict(Tag::Default, source));
        }

        // Only a present flag overrides; absence leaves the file's setting.
        if self.log_metrics {
            dict.insert("log_metrics".into(), Value::from(true));
        }

        let mut map = Map::new();
        map.insert(Profile::Default, dict);
        Ok(map)
    }
}
