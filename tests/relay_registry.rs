//! Registry behaviour of the relay: listener uniqueness, dedup by equipment
//! identifier and self-cleanup.

mod helpers;

use helpers::fake_source::{FakeDevice, FakeSource};
use helpers::mock_sender::RecordingSender;
use helpers::{relay_with, wait_for};
use modem_relay::config::Config;
use modem_relay::relay::Relay;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const TIMEOUT: Duration = Duration::from_secs(2);

fn test_relay() -> Arc<Relay> {
    let sender = RecordingSender::new();
    relay_with(
        &Config::default(),
        FakeSource::new(),
        vec![("recorder", sender.as_sender())],
    )
}

#[tokio::test]
async fn test_at_most_one_listener_per_path() {
    let relay = test_relay();
    let root = CancellationToken::new();
    let device = FakeDevice::new("860000000000000", "EC25");

    assert!(relay.add_device(&root, "/m/0", device.clone()));
    assert!(!relay.add_device(&root, "/m/0", device.clone()));
    wait_for("listener to start", TIMEOUT, || device.active() == 1).await;
    assert!(!relay.add_device(&root, "/m/0", device.clone()));

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(device.subscribe_calls(), 1);
    assert_eq!(relay.subscription_count(), 1);
    assert_eq!(
        relay.path_for_equipment("860000000000000").as_deref(),
        Some("/m/0")
    );
    assert_eq!(
        relay.equipment_for_path("/m/0").as_deref(),
        Some("860000000000000")
    );
}

#[tokio::test]
async fn test_equipment_identifier_moves_to_new_path() {
    let relay = test_relay();
    let root = CancellationToken::new();
    let before = FakeDevice::new("860000000000000", "EC25");
    let after = FakeDevice::new("860000000000000", "EC25");

    relay.add_device(&root, "/m/1", before.clone());
    wait_for("first listener", TIMEOUT, || before.active() == 1).await;

    relay.add_device(&root, "/m/2", after.clone());
    wait_for("old listener cancelled", TIMEOUT, || before.cancellations() == 1).await;
    wait_for("new listener", TIMEOUT, || after.active() == 1).await;

    // The superseded listener's exit must not touch the new record.
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(before.cancellations(), 1);
    assert_eq!(before.active(), 0);
    assert_eq!(relay.active_paths(), vec!["/m/2".to_string()]);
    assert_eq!(
        relay.path_for_equipment("860000000000000").as_deref(),
        Some("/m/2")
    );
    assert_eq!(relay.equipment_for_path("/m/1"), None);
}

#[tokio::test]
async fn test_devices_without_identifier_are_tracked_by_path_only() {
    let relay = test_relay();
    let root = CancellationToken::new();

    relay.add_device(&root, "/m/0", FakeDevice::new("", "EC25"));
    relay.add_device(&root, "/m/1", FakeDevice::new("", "EC25"));

    assert_eq!(relay.subscription_count(), 2);
    assert_eq!(relay.equipment_for_path("/m/0"), None);
    assert_eq!(relay.path_for_equipment(""), None);
}

#[tokio::test]
async fn test_listener_removes_itself_when_stream_ends() {
    let relay = test_relay();
    let root = CancellationToken::new();
    let device = FakeDevice::new("860000000000000", "EC25");

    relay.add_device(&root, "/m/0", device.clone());
    wait_for("listener to start", TIMEOUT, || device.active() == 1).await;

    device.end_stream();
    wait_for("self-cleanup", TIMEOUT, || relay.subscription_count() == 0).await;

    assert_eq!(relay.path_for_equipment("860000000000000"), None);
    assert_eq!(relay.equipment_for_path("/m/0"), None);
    assert_eq!(device.cancellations(), 0);

    // A later re-add starts a fresh listener.
    let replugged = FakeDevice::new("860000000000000", "EC25");
    assert!(relay.add_device(&root, "/m/0", replugged.clone()));
    wait_for("new listener", TIMEOUT, || replugged.active() == 1).await;
}

#[tokio::test]
async fn test_remove_device_is_idempotent() {
    let relay = test_relay();
    let root = CancellationToken::new();
    let device = FakeDevice::new("860000000000000", "EC25");

    relay.add_device(&root, "/m/0", device.clone());
    wait_for("listener to start", TIMEOUT, || device.active() == 1).await;

    assert!(relay.remove_device("/m/0"));
    assert!(!relay.remove_device("/m/0"));
    wait_for("listener cancelled", TIMEOUT, || device.cancellations() == 1).await;
    assert_eq!(relay.subscription_count(), 0);
    assert_eq!(relay.path_for_equipment("860000000000000"), None);
}

#[tokio::test]
async fn test_stop_all_twice() {
    let relay = test_relay();
    let root = CancellationToken::new();
    let devices: Vec<_> = (0..3)
        .map(|i| FakeDevice::new(&format!("86000000000000{}", i), "EC25"))
        .collect();
    for (i, device) in devices.iter().enumerate() {
        relay.add_device(&root, &format!("/m/{}", i), device.clone());
    }
    wait_for("all listeners", TIMEOUT, || devices.iter().all(|d| d.active() == 1)).await;

    assert_eq!(relay.stop_all(), 3);
    assert_eq!(relay.stop_all(), 0);

    wait_for("all cancelled", TIMEOUT, || {
        devices.iter().all(|d| d.cancellations() == 1)
    })
    .await;
    assert!(relay.active_paths().is_empty());
}

#[tokio::test]
async fn test_root_cancellation_reaches_every_listener() {
    let relay = test_relay();
    let root = CancellationToken::new();
    let first = FakeDevice::new("860000000000000", "EC25");
    let second = FakeDevice::new("860000000000001", "EC25");

    relay.add_device(&root, "/m/0", first.clone());
    relay.add_device(&root, "/m/1", second.clone());
    wait_for("listeners", TIMEOUT, || first.active() == 1 && second.active() == 1).await;

    root.cancel();
    wait_for("cancelled", TIMEOUT, || {
        first.cancellations() == 1 && second.cancellations() == 1
    })
    .await;

    // Cancelled listeners clean up after themselves.
    wait_for("registry drained", TIMEOUT, || relay.subscription_count() == 0).await;
    assert!(!relay.add_device(&root, "/m/2", FakeDevice::new("", "EC25")));
}

fn assert_registry_consistent(relay: &Relay, equipment_ids: &[&str]) {
    let paths = relay.active_paths();
    for path in &paths {
        if let Some(equipment_id) = relay.equipment_for_path(path) {
            assert_eq!(
                relay.path_for_equipment(&equipment_id).as_deref(),
                Some(path.as_str()),
                "{} -> {} has no reverse entry",
                path,
                equipment_id
            );
        }
    }
    for equipment_id in equipment_ids {
        if let Some(path) = relay.path_for_equipment(equipment_id) {
            assert!(paths.contains(&path), "{} maps to dead path {}", equipment_id, path);
            assert_eq!(relay.equipment_for_path(&path).as_deref(), Some(*equipment_id));
        }
        let owners = paths
            .iter()
            .filter(|p| relay.equipment_for_path(p).as_deref() == Some(*equipment_id))
            .count();
        assert!(owners <= 1, "{} is owned by {} paths", equipment_id, owners);
    }
}

#[tokio::test]
async fn test_registry_stays_consistent_under_random_churn() {
    let relay = test_relay();
    let root = CancellationToken::new();
    let paths = ["/m/0", "/m/1", "/m/2", "/m/3", "/m/4"];
    let equipment_ids = ["860000000000000", "860000000000001", "860000000000002", ""];
    let mut rng = StdRng::seed_from_u64(0x5eed);

    for _ in 0..400 {
        let path = paths[rng.random_range(0..paths.len())];
        if rng.random_bool(0.6) {
            let equipment_id = equipment_ids[rng.random_range(0..equipment_ids.len())];
            relay.add_device(&root, path, FakeDevice::new(equipment_id, "EC25"));
        } else {
            relay.remove_device(path);
        }
        assert_registry_consistent(&relay, &equipment_ids[..3]);
        if rng.random_bool(0.1) {
            tokio::task::yield_now().await;
        }
    }

    let remaining = relay.subscription_count();
    assert_eq!(relay.stop_all(), remaining);
    assert_registry_consistent(&relay, &equipment_ids[..3]);
}
