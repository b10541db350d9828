#![allow(dead_code)]
//! In-memory stand-ins for the modem layer.

use async_trait::async_trait;
use modem_relay::core::{Device, DeviceEvent, DeviceInfo, DeviceSource, Sms, SourceError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

/// A modem whose message stream is driven by the test.
pub struct FakeDevice {
    info: DeviceInfo,
    messages: broadcast::Sender<Sms>,
    ended: CancellationToken,
    subscribe_calls: AtomicUsize,
    active: AtomicUsize,
    cancellations: AtomicUsize,
}

impl FakeDevice {
    pub fn new(equipment_id: &str, model: &str) -> Arc<Self> {
        Self::with_number(equipment_id, model, "+15550002")
    }

    pub fn with_number(equipment_id: &str, model: &str, number: &str) -> Arc<Self> {
        let (messages, _) = broadcast::channel(16);
        Arc::new(Self {
            info: DeviceInfo {
                equipment_identifier: equipment_id.to_string(),
                model: model.to_string(),
                number: number.to_string(),
            },
            messages,
            ended: CancellationToken::new(),
            subscribe_calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            cancellations: AtomicUsize::new(0),
        })
    }

    /// Delivers `sms` to the current listener, if any.
    pub fn push(&self, sms: Sms) {
        let _ = self.messages.send(sms);
    }

    /// Ends the message stream as if the modem went away.
    pub fn end_stream(&self) {
        self.ended.cancel();
    }

    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// How many subscriptions ended because they were cancelled.
    pub fn cancellations(&self) -> usize {
        self.cancellations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Device for FakeDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    async fn subscribe_messages(
        &self,
        cancel: CancellationToken,
        sink: mpsc::Sender<Sms>,
    ) -> Result<(), SourceError> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let mut messages = self.messages.subscribe();
        self.active.fetch_add(1, Ordering::SeqCst);

        let result = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Err(SourceError::Cancelled),
                _ = self.ended.cancelled() => {
                    break Err(SourceError::StreamClosed("fake stream ended".to_string()));
                }
                received = messages.recv() => {
                    if let Ok(sms) = received {
                        if sink.send(sms).await.is_err() {
                            break Err(SourceError::StreamClosed("sink dropped".to_string()));
                        }
                    }
                }
            }
        };

        if result == Err(SourceError::Cancelled) {
            self.cancellations.fetch_add(1, Ordering::SeqCst);
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// A device source whose inventory and change stream are driven by the test.
#[derive(Default)]
pub struct FakeSource {
    devices: Mutex<HashMap<String, Arc<dyn Device>>>,
    events: Mutex<Option<mpsc::Sender<DeviceEvent>>>,
    fail_list: bool,
    fail_subscribe: bool,
    list_calls: AtomicUsize,
}

impl FakeSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_list() -> Arc<Self> {
        Arc::new(Self {
            fail_list: true,
            ..Default::default()
        })
    }

    pub fn failing_subscribe() -> Arc<Self> {
        Arc::new(Self {
            fail_subscribe: true,
            ..Default::default()
        })
    }

    /// Makes `device` part of the initial inventory.
    pub fn insert(&self, path: &str, device: Arc<dyn Device>) {
        self.devices.lock().insert(path.to_string(), device);
    }

    pub fn is_subscribed(&self) -> bool {
        self.events.lock().is_some()
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub async fn emit(&self, event: DeviceEvent) {
        let sender = self.events.lock().clone();
        if let Some(sender) = sender {
            sender.send(event).await.expect("relay dropped the event stream");
        }
    }

    pub async fn add(&self, path: &str, device: Arc<dyn Device>) {
        self.insert(path, device.clone());
        self.emit(DeviceEvent::Added {
            path: path.to_string(),
            device,
        })
        .await;
    }

    pub async fn remove(&self, path: &str) {
        self.devices.lock().remove(path);
        self.emit(DeviceEvent::Removed {
            path: path.to_string(),
        })
        .await;
    }

    /// Ends the change stream.
    pub fn close_events(&self) {
        self.events.lock().take();
    }
}

#[async_trait]
impl DeviceSource for FakeSource {
    async fn list(&self) -> Result<HashMap<String, Arc<dyn Device>>, SourceError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_list {
            return Err(SourceError::Discovery("bus unavailable".to_string()));
        }
        Ok(self.devices.lock().clone())
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<DeviceEvent>, SourceError> {
        if self.fail_subscribe {
            return Err(SourceError::Attach("signal match refused".to_string()));
        }
        let (tx, rx) = mpsc::channel(16);
        *self.events.lock() = Some(tx);
        Ok(rx)
    }
}
