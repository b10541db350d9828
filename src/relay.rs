//! The message relay: tracks modems, keeps one listener per device and
//! forwards their SMS events to the notifier.
//!
//! The registry keeps three views under one mutex:
//!
//! - path -> subscription (drives listener lifecycle)
//! - equipment identifier -> path (dedups a modem that reappears under a new path)
//! - path -> equipment identifier (reverse cleanup)
//!
//! For every subscribed path with a non-empty equipment identifier, both
//! identifier maps point at each other. An identifier never maps to more than
//! one live path. Token cancellation always happens after the lock is
//! released.

use crate::config::Config;
use crate::core::{Device, DeviceEvent, DeviceInfo, DeviceSource, Sms, SourceError};
use crate::formatting::SmsMessage;
use crate::notification::{DeliveryError, Notifier};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

/// Incoming messages older than this are not relayed.
pub const STALE_AFTER_MINUTES: i64 = 30;

const MESSAGE_BUFFER: usize = 32;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("initial device discovery failed")]
    Discovery(#[source] SourceError),

    #[error("failed to subscribe to device changes")]
    Subscribe(#[source] SourceError),
}

/// What `Relay::forward` did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutcome {
    Delivered,
    SuppressedStale,
}

#[derive(Debug)]
struct Subscription {
    cancel: CancellationToken,
    generation: u64,
}

#[derive(Debug, Default)]
struct Registry {
    subscriptions: HashMap<String, Subscription>,
    equipment_to_path: HashMap<String, String>,
    path_to_equipment: HashMap<String, String>,
}

impl Registry {
    /// Removes `path` from all three views, returning its cancel handle.
    fn purge(&mut self, path: &str) -> Option<CancellationToken> {
        let subscription = self.subscriptions.remove(path);
        if let Some(equipment_id) = self.path_to_equipment.remove(path) {
            if self.equipment_to_path.get(&equipment_id).map(String::as_str) == Some(path) {
                self.equipment_to_path.remove(&equipment_id);
            }
        }
        subscription.map(|s| s.cancel)
    }

    fn publish_gauge(&self) {
        metrics::gauge!("active_device_subscriptions").set(self.subscriptions.len() as f64);
    }
}

/// Coordinates device discovery, per-device listeners and forwarding.
pub struct Relay {
    config: Config,
    source: Arc<dyn DeviceSource>,
    notifier: Notifier,
    registry: Mutex<Registry>,
    next_generation: AtomicU64,
    listeners: TaskTracker,
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("notifier", &self.notifier)
            .field("subscriptions", &self.subscription_count())
            .finish()
    }
}

impl Relay {
    pub fn new(config: &Config, source: Arc<dyn DeviceSource>, notifier: Notifier) -> Arc<Self> {
        Arc::new(Self {
            config: config.clone(),
            source,
            notifier,
            registry: Mutex::new(Registry::default()),
            next_generation: AtomicU64::new(1),
            listeners: TaskTracker::new(),
        })
    }

    /// True when at least one notification channel is configured.
    pub fn is_enabled(&self) -> bool {
        !self.notifier.is_empty()
    }

    /// Runs the relay until `cancel` fires.
    ///
    /// Setup failures (discovery, attaching to device changes) are returned.
    /// Failures of individual listeners are logged and never surface here.
    #[instrument(skip_all)]
    pub async fn run(self: &Arc<Self>, cancel: CancellationToken) -> Result<(), RelayError> {
        if !self.is_enabled() {
            info!("Message relay disabled; no channels configured");
            cancel.cancelled().await;
            return Ok(());
        }

        // Attach before listing so nothing plugged in between the two is missed.
        let mut events = self.source.subscribe().await.map_err(RelayError::Subscribe)?;
        let devices = self.source.list().await.map_err(RelayError::Discovery)?;
        info!(
            devices = devices.len(),
            channels = ?self.notifier.channel_names(),
            "Message relay started"
        );
        for (path, device) in devices {
            self.add_device(&cancel, &path, device);
        }

        let mut events_open = true;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv(), if events_open => match event {
                    Some(DeviceEvent::Added { path, device }) => {
                        self.add_device(&cancel, &path, device);
                    }
                    Some(DeviceEvent::Removed { path }) => {
                        self.remove_device(&path);
                    }
                    None => {
                        warn!("Device change stream ended; serving existing listeners until shutdown");
                        events_open = false;
                    }
                },
            }
        }

        let stopped = self.stop_all();
        self.wait_listeners().await;
        info!(stopped, "Message relay stopped");
        Ok(())
    }

    /// Starts listening to `device` at `path` unless it is already tracked.
    ///
    /// If the device's equipment identifier is already tracked under another
    /// path, that older subscription is torn down first. Returns whether a new
    /// listener was started.
    pub fn add_device(
        self: &Arc<Self>,
        cancel_root: &CancellationToken,
        path: &str,
        device: Arc<dyn Device>,
    ) -> bool {
        if cancel_root.is_cancelled() {
            return false;
        }
        let equipment_id = device.info().equipment_identifier.clone();

        let mut superseded = None;
        let started = {
            let mut registry = self.registry.lock();
            if !equipment_id.is_empty() {
                let previous = registry.equipment_to_path.get(&equipment_id).cloned();
                if let Some(previous) = previous.filter(|p| p != path) {
                    superseded = registry.purge(&previous).map(|token| (previous, token));
                }
            }

            if registry.subscriptions.contains_key(path) {
                None
            } else {
                let cancel = cancel_root.child_token();
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                registry.subscriptions.insert(
                    path.to_string(),
                    Subscription {
                        cancel: cancel.clone(),
                        generation,
                    },
                );
                if !equipment_id.is_empty() {
                    registry
                        .equipment_to_path
                        .insert(equipment_id.clone(), path.to_string());
                    registry
                        .path_to_equipment
                        .insert(path.to_string(), equipment_id.clone());
                }
                registry.publish_gauge();
                Some((cancel, generation))
            }
        };

        if let Some((previous, token)) = superseded {
            token.cancel();
            info!(
                equipment_id = %equipment_id,
                old_path = %previous,
                new_path = %path,
                "Modem reappeared under a new path; old listener stopped"
            );
        }

        match started {
            Some((cancel, generation)) => {
                debug!(path = %path, equipment_id = %equipment_id, generation, "Listening for messages");
                let relay = Arc::clone(self);
                let path = path.to_string();
                self.listeners.spawn(async move {
                    relay.listen(path, device, cancel, generation).await;
                });
                true
            }
            None => {
                debug!(path = %path, "Device already tracked");
                false
            }
        }
    }

    /// Stops the listener at `path` and forgets it. Returns whether one existed.
    pub fn remove_device(&self, path: &str) -> bool {
        let token = {
            let mut registry = self.registry.lock();
            let token = registry.purge(path);
            registry.publish_gauge();
            token
        };
        match token {
            Some(token) => {
                token.cancel();
                debug!(path = %path, "Stopped listening for messages");
                true
            }
            None => false,
        }
    }

    /// Cancels every listener and clears the registry.
    ///
    /// Returns how many listeners were cancelled.
    pub fn stop_all(&self) -> usize {
        let subscriptions: Vec<Subscription> = {
            let mut registry = self.registry.lock();
            registry.equipment_to_path.clear();
            registry.path_to_equipment.clear();
            let drained = registry.subscriptions.drain().map(|(_, s)| s).collect();
            registry.publish_gauge();
            drained
        };
        let count = subscriptions.len();
        for subscription in subscriptions {
            subscription.cancel.cancel();
        }
        count
    }

    /// Waits until every listener task has exited, including a delivery it
    /// had in flight when it was cancelled.
    pub async fn wait_listeners(&self) {
        self.listeners.close();
        self.listeners.wait().await;
        self.listeners.reopen();
    }

    /// Number of listener tasks still running, cancelled ones included.
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Paths with an active listener, sorted.
    pub fn active_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.registry.lock().subscriptions.keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn path_for_equipment(&self, equipment_id: &str) -> Option<String> {
        self.registry
            .lock()
            .equipment_to_path
            .get(equipment_id)
            .cloned()
    }

    pub fn equipment_for_path(&self, path: &str) -> Option<String> {
        self.registry.lock().path_to_equipment.get(path).cloned()
    }

    pub fn subscription_count(&self) -> usize {
        self.registry.lock().subscriptions.len()
    }

    /// Applies the forwarding policy to one SMS and hands it to the notifier.
    pub async fn forward(
        &self,
        info: &DeviceInfo,
        sms: Sms,
    ) -> Result<ForwardOutcome, DeliveryError> {
        metrics::counter!("sms_received_total").increment(1);
        if is_stale(&sms, Utc::now()) {
            metrics::counter!("sms_stale_suppressed_total").increment(1);
            info!(
                equipment_id = %info.equipment_identifier,
                number = %sms.number,
                timestamp = ?sms.timestamp,
                "Skipping stale incoming SMS"
            );
            return Ok(ForwardOutcome::SuppressedStale);
        }

        let message = self.shape_message(info, &sms);
        self.notifier.send(Arc::new(message), &[]).await?;
        metrics::counter!("sms_forwarded_total").increment(1);
        Ok(ForwardOutcome::Delivered)
    }

    /// Builds the outbound message for `sms` received on the device `info`.
    pub fn shape_message(&self, info: &DeviceInfo, sms: &Sms) -> SmsMessage {
        let incoming = sms.state.is_incoming();
        let (from, to) = if incoming {
            (sms.number.clone(), info.number.clone())
        } else {
            (info.number.clone(), sms.number.clone())
        };
        let alias = self.config.find_modem(&info.equipment_identifier).alias;
        let modem = match alias.trim() {
            "" => info.model.trim().to_string(),
            alias => alias.to_string(),
        };
        SmsMessage {
            modem,
            from,
            to,
            time: sms.timestamp,
            text: sms.text.trim().to_string(),
            incoming,
        }
    }

    async fn listen(
        self: Arc<Self>,
        path: String,
        device: Arc<dyn Device>,
        cancel: CancellationToken,
        generation: u64,
    ) {
        let _guard = ListenerGuard {
            relay: Arc::clone(&self),
            path: path.clone(),
            generation,
        };

        let (tx, mut rx) = mpsc::channel(MESSAGE_BUFFER);
        let info = device.info().clone();
        let forwarding = async {
            while let Some(sms) = rx.recv().await {
                // Whatever is still buffered belongs to a device we stopped tracking.
                if cancel.is_cancelled() {
                    break;
                }
                if let Err(e) = self.forward(&info, sms).await {
                    error!(path = %path, error = %e, "Failed to relay SMS");
                }
            }
        };
        let (result, ()) =
            tokio::join!(device.subscribe_messages(cancel.clone(), tx), forwarding);

        match result {
            _ if cancel.is_cancelled() => debug!(path = %path, "Listener cancelled"),
            Err(e) if e.is_cancelled() => debug!(path = %path, "Listener cancelled"),
            Err(e) => error!(path = %path, error = %e, "Message subscription ended with error"),
            Ok(()) => info!(path = %path, "Message stream ended"),
        }
    }

    /// Removes the record for `path` only if it still belongs to `generation`.
    fn release(&self, path: &str, generation: u64) {
        let token = {
            let mut registry = self.registry.lock();
            let owned = registry
                .subscriptions
                .get(path)
                .is_some_and(|s| s.generation == generation);
            if !owned {
                return;
            }
            let token = registry.purge(path);
            registry.publish_gauge();
            token
        };
        if let Some(token) = token {
            token.cancel();
        }
        debug!(path = %path, generation, "Listener removed itself");
    }
}

/// Drops a listener's registry record on every exit path, panics included.
struct ListenerGuard {
    relay: Arc<Relay>,
    path: String,
    generation: u64,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.relay.release(&self.path, self.generation);
    }
}

/// Whether `sms` is an incoming message too old to relay at `now`.
///
/// Messages without a timestamp are never stale.
pub fn is_stale(sms: &Sms, now: DateTime<Utc>) -> bool {
    if !sms.state.is_incoming() {
        return false;
    }
    match sms.timestamp {
        Some(timestamp) => now - timestamp > chrono::Duration::minutes(STALE_AFTER_MINUTES),
        None => false,
    }
}
