//! modem-relay - SMS relay for cellular modems
//!
//! Forwards SMS events reported by a modem gateway to the configured
//! notification channels.

use anyhow::{anyhow, Result};
use clap::Parser;
use modem_relay::{
    app::App, cli::Cli, config::Config, metrics::logging_recorder::LoggingRecorder,
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration by layering sources: defaults, file, environment, and CLI args.
    let config = match Config::load(&cli) {
        Ok(config) => config,
        Err(err) => {
            tracing_subscriber::fmt().init();
            error!("Failed to load configuration: {:#}", err);
            std::process::exit(1);
        }
    };

    // RUST_LOG wins over the configured level.
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("modem-relay starting up...");
    info!("-------------------- Configuration --------------------");
    info!("Log Level: {}", config.log_level);
    info!("Log Metrics: {}", config.log_metrics);
    info!("Gateway Feed: {}", config.source.feed_url);
    info!(
        "Reconnect Backoff: {}ms..{}ms",
        config.source.reconnect_initial_backoff_ms, config.source.reconnect_max_backoff_ms
    );
    let channels: Vec<&str> = config.channels.keys().map(String::as_str).collect();
    info!("Channels: {}", if channels.is_empty() { "none".to_string() } else { channels.join(", ") });
    info!("Configured Modems: {}", config.modems.len());
    info!("-------------------------------------------------------");

    let cancel = CancellationToken::new();

    let metrics_task = if config.log_metrics {
        info!(
            "Logging recorder enabled. Metrics will be printed every {} seconds.",
            config.metrics_interval_seconds
        );
        let recorder = LoggingRecorder::new();
        metrics::set_global_recorder(recorder.clone())
            .map_err(|_| anyhow!("a metrics recorder is already installed"))?;
        let interval = Duration::from_secs(config.metrics_interval_seconds.max(1));
        Some(tokio::spawn(recorder.run(interval, cancel.clone())))
    } else {
        None
    };

    let app = App::builder(config).build(cancel.clone()).await?;

    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
        info!("Shutdown signal received, initiating graceful shutdown...");
        signal_token.cancel();
    });

    let result = app.run().await;
    cancel.cancel();

    if let Some(handle) = metrics_task {
        if let Err(e) = handle.await {
            error!("Metrics task panicked: {:?}", e);
        }
    }

    info!("Exiting.");
    result
}
