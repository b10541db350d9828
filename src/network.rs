//! Network client for the modem gateway WebSocket feed
//!
//! The gateway publishes the modem table and every SMS event as JSON text
//! frames. `FeedSource` keeps a local mirror of the table, implements
//! `DeviceSource` on top of it and reconnects with exponential backoff when
//! the connection drops.

use crate::config::SourceConfig;
use crate::core::{Device, DeviceEvent, DeviceInfo, DeviceSource, Sms, SourceError};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures_util::stream::StreamExt;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

const EVENT_BUFFER: usize = 64;
const MESSAGE_BUFFER: usize = 64;

/// A device entry as published by the gateway.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct FeedDeviceEntry {
    pub path: String,
    #[serde(flatten)]
    pub info: DeviceInfo,
}

/// One text frame of the gateway feed.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FeedFrame {
    Snapshot {
        #[serde(default)]
        devices: Vec<FeedDeviceEntry>,
    },
    Added {
        device: FeedDeviceEntry,
    },
    Removed {
        path: String,
    },
    Message {
        path: String,
        message: Sms,
    },
}

/// Parses a raw feed frame.
pub fn parse_frame(text: &str) -> Result<FeedFrame> {
    serde_json::from_str(text).context("parsing feed frame")
}

/// Trait for WebSocket connections to enable testing with fake implementations
#[async_trait]
pub trait WebSocketConnection: Send + Sync {
    /// Reads the next message from the WebSocket connection
    ///
    /// # Returns
    /// * `Some(Ok(Message))` if a message was successfully received
    /// * `Some(Err(error))` if there was an error reading the message
    /// * `None` if the connection has been closed
    async fn read_message(
        &mut self,
    ) -> Option<Result<Message, tokio_tungstenite::tungstenite::Error>>;
}

/// Opens connections to the gateway.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn WebSocketConnection>>;
}

struct TungsteniteConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl WebSocketConnection for TungsteniteConnection {
    async fn read_message(
        &mut self,
    ) -> Option<Result<Message, tokio_tungstenite::tungstenite::Error>> {
        self.stream.next().await
    }
}

/// Connects to a `ws://` or `wss://` URL with tokio-tungstenite.
#[derive(Debug, Clone)]
pub struct TungsteniteConnector {
    url: String,
}

impl TungsteniteConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self) -> Result<Box<dyn WebSocketConnection>> {
        let (stream, _) = connect_async(self.url.as_str())
            .await
            .with_context(|| format!("connecting to {}", self.url))?;
        Ok(Box::new(TungsteniteConnection { stream }))
    }
}

/// A modem mirrored from the gateway feed.
pub struct FeedDevice {
    path: String,
    info: DeviceInfo,
    messages: broadcast::Sender<Sms>,
    /// Receiver created with the device and handed to the first listener, so
    /// messages that arrive before anyone subscribes are buffered.
    parked: Mutex<Option<broadcast::Receiver<Sms>>>,
    removed: CancellationToken,
}

impl FeedDevice {
    fn new(entry: FeedDeviceEntry) -> Self {
        let (messages, parked) = broadcast::channel(MESSAGE_BUFFER);
        Self {
            path: entry.path,
            info: entry.info,
            messages,
            parked: Mutex::new(Some(parked)),
            removed: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl Device for FeedDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    async fn subscribe_messages(
        &self,
        cancel: CancellationToken,
        sink: mpsc::Sender<Sms>,
    ) -> Result<(), SourceError> {
        let parked = self.parked.lock().take();
        let mut messages = parked.unwrap_or_else(|| self.messages.subscribe());
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SourceError::Cancelled),
                _ = self.removed.cancelled() => {
                    return Err(SourceError::DeviceRemoved(self.path.clone()));
                }
                received = messages.recv() => match received {
                    Ok(sms) => {
                        if sink.send(sms).await.is_err() {
                            return Err(SourceError::StreamClosed(
                                "message sink dropped".to_string(),
                            ));
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(path = %self.path, skipped, "Listener lagged; messages dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(SourceError::StreamClosed(self.path.clone()));
                    }
                },
            }
        }
    }
}

#[derive(Default)]
struct FeedState {
    devices: HashMap<String, Arc<FeedDevice>>,
    subscribers: Vec<mpsc::Sender<DeviceEvent>>,
    stopped: bool,
}

impl FeedState {
    fn remove(&mut self, path: &str, events: &mut Vec<DeviceEvent>) {
        if let Some(device) = self.devices.remove(path) {
            device.removed.cancel();
            events.push(DeviceEvent::Removed {
                path: path.to_string(),
            });
        }
    }

    /// Adds `entry`, replacing a different device already at its path.
    fn upsert(&mut self, entry: FeedDeviceEntry, events: &mut Vec<DeviceEvent>) {
        if let Some(existing) = self.devices.get(&entry.path) {
            if existing.info == entry.info {
                return;
            }
            let path = entry.path.clone();
            self.remove(&path, events);
        }
        let device = Arc::new(FeedDevice::new(entry));
        self.devices.insert(device.path.clone(), device.clone());
        events.push(DeviceEvent::Added {
            path: device.path.clone(),
            device,
        });
    }
}

/// A `DeviceSource` mirroring the modem gateway feed.
pub struct FeedSource {
    config: SourceConfig,
    connector: Arc<dyn Connector>,
    state: Mutex<FeedState>,
}

impl FeedSource {
    pub fn new(config: &SourceConfig) -> Self {
        let connector = Arc::new(TungsteniteConnector::new(config.feed_url.clone()));
        Self::with_connector(config, connector)
    }

    pub fn with_connector(config: &SourceConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config: config.clone(),
            connector,
            state: Mutex::new(FeedState::default()),
        }
    }

    /// Runs the client with automatic reconnection until `cancel` fires.
    #[instrument(skip_all, fields(url = %self.config.feed_url))]
    pub async fn run(&self, cancel: CancellationToken) {
        let initial = Duration::from_millis(self.config.reconnect_initial_backoff_ms.max(1));
        let max = Duration::from_millis(self.config.reconnect_max_backoff_ms).max(initial);
        let mut backoff = initial;

        loop {
            info!("Connecting to modem gateway");
            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                outcome = self.connect_and_run() => outcome,
            };
            self.drop_all_devices().await;

            match outcome {
                Ok(()) => {
                    info!("Gateway connection closed normally");
                    backoff = initial;
                }
                Err(e) => error!(error = %format!("{:#}", e), "Gateway connection failed"),
            }

            info!(delay_ms = backoff.as_millis() as u64, "Reconnecting to modem gateway");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = next_backoff(backoff, max);
        }

        self.drop_all_devices().await;
        {
            let mut state = self.state.lock();
            state.stopped = true;
            state.subscribers.clear();
        }
        info!("Gateway feed client stopped");
    }

    async fn connect_and_run(&self) -> Result<()> {
        let connection = self.connector.connect().await?;
        info!("Connected to modem gateway");
        self.run_with_connection(connection).await
    }

    /// Processes frames from `connection` until it closes.
    ///
    /// Does not reconnect and leaves the mirrored devices in place.
    pub async fn run_with_connection(
        &self,
        mut connection: Box<dyn WebSocketConnection>,
    ) -> Result<()> {
        loop {
            match connection.read_message().await {
                Some(Ok(Message::Text(text))) => self.handle_text(text.as_str()).await,
                Some(Ok(Message::Close(_))) => {
                    info!("Received close message from gateway");
                    break;
                }
                Some(Ok(other)) => debug!(kind = ?other, "Ignoring non-text frame"),
                Some(Err(e)) => bail!("WebSocket error: {}", e),
                None => {
                    info!("WebSocket connection closed");
                    break;
                }
            }
        }
        Ok(())
    }

    async fn handle_text(&self, text: &str) {
        match parse_frame(text) {
            Ok(frame) => self.apply(frame).await,
            Err(e) => warn!(error = %format!("{:#}", e), "Skipping malformed feed frame"),
        }
    }

    async fn apply(&self, frame: FeedFrame) {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            match frame {
                FeedFrame::Snapshot { devices } => {
                    let stale: Vec<String> = state
                        .devices
                        .keys()
                        .filter(|path| !devices.iter().any(|d| &d.path == *path))
                        .cloned()
                        .collect();
                    for path in stale {
                        state.remove(&path, &mut events);
                    }
                    for entry in devices {
                        state.upsert(entry, &mut events);
                    }
                }
                FeedFrame::Added { device } => state.upsert(device, &mut events),
                FeedFrame::Removed { path } => state.remove(&path, &mut events),
                FeedFrame::Message { path, message } => match state.devices.get(&path) {
                    Some(device) => {
                        if device.messages.send(message).is_err() {
                            debug!(path = %path, "No listener for modem message");
                        }
                    }
                    None => debug!(path = %path, "Message for unknown modem"),
                },
            }
        }
        self.publish(events).await;
    }

    async fn drop_all_devices(&self) {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            let paths: Vec<String> = state.devices.keys().cloned().collect();
            for path in paths {
                state.remove(&path, &mut events);
            }
        }
        self.publish(events).await;
    }

    async fn publish(&self, events: Vec<DeviceEvent>) {
        if events.is_empty() {
            return;
        }
        let subscribers = {
            let mut state = self.state.lock();
            state.subscribers.retain(|s| !s.is_closed());
            state.subscribers.clone()
        };
        for event in events {
            debug!(event = ?event, "Device change");
            for subscriber in &subscribers {
                // A subscriber that went away is pruned on the next publish.
                let _ = subscriber.send(event.clone()).await;
            }
        }
    }
}

#[async_trait]
impl DeviceSource for FeedSource {
    async fn list(&self) -> Result<HashMap<String, Arc<dyn Device>>, SourceError> {
        let state = self.state.lock();
        if state.stopped {
            return Err(SourceError::Discovery("gateway feed client stopped".to_string()));
        }
        Ok(state
            .devices
            .iter()
            .map(|(path, device)| (path.clone(), device.clone() as Arc<dyn Device>))
            .collect())
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<DeviceEvent>, SourceError> {
        let mut state = self.state.lock();
        if state.stopped {
            return Err(SourceError::Attach("gateway feed client stopped".to_string()));
        }
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        state.subscribers.push(tx);
        Ok(rx)
    }
}

/// Doubles `current`, capped at `max`.
pub fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}
