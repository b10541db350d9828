#![allow(dead_code)]
pub mod fake_source;
pub mod mock_sender;

use modem_relay::config::Config;
use modem_relay::notification::{Notifier, Sender};
use modem_relay::relay::Relay;
use std::sync::Arc;
use std::time::Duration;

/// Polls `condition` until it holds, panicking after `timeout`.
pub async fn wait_for<F>(description: &str, timeout: Duration, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("Timed out waiting for {}", description);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// A relay over `source` that delivers to the given senders.
pub fn relay_with(
    config: &Config,
    source: Arc<fake_source::FakeSource>,
    senders: Vec<(&str, Arc<dyn Sender>)>,
) -> Arc<Relay> {
    Relay::new(config, source, Notifier::with_senders(senders))
}
