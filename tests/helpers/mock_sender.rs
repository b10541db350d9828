#![allow(dead_code)]
use async_trait::async_trait;
use modem_relay::notification::{Message, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A sender that records what it was asked to deliver.
#[derive(Debug, Default)]
pub struct RecordingSender {
    calls: AtomicUsize,
    messages: Mutex<Vec<serde_json::Value>>,
    fail: bool,
    delay: Option<Duration>,
}

impl RecordingSender {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A sender whose every delivery fails.
    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Default::default()
        })
    }

    /// A sender that takes `delay` to deliver.
    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Default::default()
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Structured form of every message received so far.
    pub fn messages(&self) -> Vec<serde_json::Value> {
        self.messages.lock().clone()
    }

    pub fn as_sender(self: &Arc<Self>) -> Arc<dyn Sender> {
        self.clone()
    }
}

#[async_trait]
impl Sender for RecordingSender {
    async fn send(&self, message: &dyn Message) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            anyhow::bail!("channel unavailable");
        }
        self.messages.lock().push(message.to_json());
        Ok(())
    }
}
