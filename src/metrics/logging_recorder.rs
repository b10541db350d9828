//! A metrics recorder that periodically logs all captured metrics.

use metrics::{Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit};
use metrics_util::registry::{AtomicStorage, Registry};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// A metrics recorder that keeps counters and gauges in memory and logs them
/// on an interval.
#[derive(Clone)]
pub struct LoggingRecorder {
    registry: Arc<Registry<Key, AtomicStorage>>,
}

impl Default for LoggingRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl LoggingRecorder {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry::new(AtomicStorage)),
        }
    }

    /// Logs a snapshot every `interval` until `cancel` fires.
    pub async fn run(self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.log_snapshot(),
            }
        }
        self.log_snapshot();
    }

    /// Counter and gauge values, sorted by key.
    pub fn snapshot(&self) -> Vec<(String, f64)> {
        let mut values: Vec<(String, f64)> = Vec::new();
        for (key, counter) in self.registry.get_counter_handles() {
            values.push((render_key(&key), counter.load(Ordering::Relaxed) as f64));
        }
        for (key, gauge) in self.registry.get_gauge_handles() {
            values.push((render_key(&key), f64::from_bits(gauge.load(Ordering::Relaxed))));
        }
        values.sort_by(|a, b| a.0.cmp(&b.0));
        values
    }

    fn log_snapshot(&self) {
        info!("--- Metrics Snapshot ---");
        for (key, value) in self.snapshot() {
            info!("{}: {}", key, value);
        }
    }
}

fn render_key(key: &Key) -> String {
    let labels: Vec<String> = key
        .labels()
        .map(|l| format!("{}={}", l.key(), l.value()))
        .collect();
    if labels.is_empty() {
        key.name().to_string()
    } else {
        format!("{}{{{}}}", key.name(), labels.join(","))
    }
}

impl Recorder for LoggingRecorder {
    fn describe_counter(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn describe_gauge(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn describe_histogram(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn register_counter(&self, key: &Key, _metadata: &Metadata<'_>) -> Counter {
        self.registry.get_or_create_counter(key, |c| c.clone()).into()
    }

    fn register_gauge(&self, key: &Key, _metadata: &Metadata<'_>) -> Gauge {
        self.registry.get_or_create_gauge(key, |g| g.clone()).into()
    }

    fn register_histogram(&self, key: &Key, _metadata: &Metadata<'_>) -> Histogram {
        self.registry.get_or_create_histogram(key, |h| h.clone()).into()
    }
}
