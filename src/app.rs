//! The main application logic, decoupled from the entry point.

use crate::{
    config::Config,
    core::DeviceSource,
    network::FeedSource,
    notification::{Notifier, Sender},
    relay::{Relay, RelayError},
    task_manager::TaskManager,
};
use anyhow::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

/// A handle to the running application.
pub struct App {
    task_manager: TaskManager,
    relay: Arc<Relay>,
    relay_error: Arc<Mutex<Option<RelayError>>>,
}

impl App {
    /// Creates a new `AppBuilder` to construct an `App`.
    pub fn builder(config: Config) -> AppBuilder {
        AppBuilder::new(config)
    }

    pub fn relay(&self) -> Arc<Relay> {
        self.relay.clone()
    }

    /// Waits for cancellation and then shuts down all tasks.
    ///
    /// Returns the relay's setup error if it failed to start.
    pub async fn run(self) -> Result<()> {
        self.task_manager.cancel_token().cancelled().await;
        info!("Shutdown signal received. Waiting for tasks to complete...");

        self.task_manager.shutdown().await;

        if let Some(e) = self.relay_error.lock().take() {
            return Err(anyhow::Error::new(e));
        }
        info!("All tasks shut down.");
        Ok(())
    }
}

/// Builder for the main application.
///
/// Separates constructing the components from running them and lets tests
/// swap the device source and the channel senders.
pub struct AppBuilder {
    config: Config,
    device_source_override: Option<Arc<dyn DeviceSource>>,
    senders_override: Option<Vec<(String, Arc<dyn Sender>)>>,
}

impl AppBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            device_source_override: None,
            senders_override: None,
        }
    }

    /// Overrides the modem gateway feed for testing.
    pub fn device_source_override(mut self, source: Arc<dyn DeviceSource>) -> Self {
        self.device_source_override = Some(source);
        self
    }

    /// Overrides the configured notification channels for testing.
    pub fn senders_override(mut self, senders: Vec<(String, Arc<dyn Sender>)>) -> Self {
        self.senders_override = Some(senders);
        self
    }

    /// Builds all components and spawns them, returning a runnable `App`.
    #[instrument(skip_all)]
    pub async fn build(self, cancel: CancellationToken) -> Result<App> {
        let config = self.config;
        let task_manager = TaskManager::new(cancel.clone());

        let notifier = match self.senders_override {
            Some(senders) => Notifier::with_senders(senders),
            None => Notifier::from_config(&config.channels)?,
        };
        debug!(channels = ?notifier.channel_names(), "Notifier ready");

        let source: Arc<dyn DeviceSource> = match self.device_source_override {
            Some(source) => source,
            None => {
                let feed = Arc::new(FeedSource::new(&config.source));
                if !notifier.is_empty() {
                    let feed_task = feed.clone();
                    let token = cancel.clone();
                    task_manager.spawn("GatewayFeed", async move { feed_task.run(token).await });
                }
                feed
            }
        };

        let relay = Relay::new(&config, source, notifier);
        let relay_error = Arc::new(Mutex::new(None));
        {
            let relay = relay.clone();
            let relay_error = relay_error.clone();
            let token = cancel.clone();
            task_manager.spawn("Relay", async move {
                if let Err(e) = relay.run(token.clone()).await {
                    error!(error = %e, "Message relay failed to start");
                    *relay_error.lock() = Some(e);
                    token.cancel();
                }
            });
        }

        info!("modem-relay initialized");
        Ok(App {
            task_manager,
            relay,
            relay_error,
        })
    }
}
