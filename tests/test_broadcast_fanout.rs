//! Fan-out through the broadcast registry, driven by real ingestion


use seano_ingest::broadcast::BroadcastRegistry;
use seano_ingest::observability::PipelineMetrics;
use seano_ingest::protocol::{ObserverFilter, ObserverMessage, TelemetryPayload};
use seano_ingest::transport::InboundMessage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use test_helpers::{fleet_store, Harness};

fn telemetry(vehicle_id: i64) -> ObserverMessage {
    ObserverMessage::VehicleLog {
        vehicle_id,
        vehicle_code: format!("USV-{vehicle_id:02}"),
        data: TelemetryPayload::default(),
        timestamp: chrono::Utc::now(),
    }
}

#[tokio::test]
async fn test_k_observers_each_get_one_delivery() {
    let harness = Harness::new();
    let processor = harness.processor(fleet_store());
    let mut observers: Vec<_> = (0..5)
        .map(|_| harness.registry.connect(ObserverFilter::default()))
        .collect();

    let report = processor
        .process(&InboundMessage::new(
            "seano/USV-01/vehicle_log",
            r#"{"battery_voltage": 12.4}"#,
        ))
        .await
        .unwrap();
    assert_eq!(report.observers_reached, 5);

    for observer in observers.iter_mut() {
        let frame: serde_json::Value =
            serde_json::from_str(&observer.receiver.try_recv().unwrap()).unwrap();
        assert_eq!(frame["type"], "vehicle_log");
        assert_eq!(frame["data"]["battery_voltage"], 12.4);
        assert!(observer.receiver.try_recv().is_err());
    }
}

#[tokio::test]
async fn test_broken_observer_is_removed_and_others_still_receive() {
    let harness = Harness::new();
    let processor = harness.processor(fleet_store());

    let mut healthy_a = harness.registry.connect(ObserverFilter::default());
    let broken = harness.registry.connect(ObserverFilter::default());
    let mut healthy_b = harness.registry.connect(ObserverFilter::default());
    let broken_id = broken.id;
    drop(broken.receiver);

    processor
        .process(&InboundMessage::new("seano/USV-01/raw_log", "hello"))
        .await
        .unwrap();

    assert!(healthy_a.receiver.try_recv().is_ok());
    assert!(healthy_b.receiver.try_recv().is_ok());
    assert_eq!(harness.registry.connection_count(), 2);
    assert!(harness.registry.filter_of(broken_id).is_none());

    let observers = harness.metrics.snapshot().observers;
    assert_eq!(observers.delivery_failures, 1);
    assert_eq!(observers.observers_removed, 1);
}

#[test]
fn test_slow_observer_is_removed_when_queue_fills() {
    let registry = BroadcastRegistry::new(2, Arc::new(PipelineMetrics::new()));
    let mut fast = registry.connect(ObserverFilter::default());
    let _slow = registry.connect(ObserverFilter::default());

    for i in 0..3 {
        registry.broadcast_all(&telemetry(1));
        // fast keeps draining, slow never does
        assert!(fast.receiver.try_recv().is_ok(), "fast missed frame {i}");
    }

    assert_eq!(registry.connection_count(), 1);
    assert_eq!(registry.stats().connections_info[0].connection_id, fast.id);
}

#[test]
fn test_per_observer_order_is_preserved() {
    let registry = BroadcastRegistry::new(64, Arc::new(PipelineMetrics::new()));
    let mut observer = registry.connect(ObserverFilter::default());

    for vehicle_id in 1..=20 {
        registry.broadcast_all(&telemetry(vehicle_id));
    }

    let received: Vec<i64> = (0..20)
        .map(|_| {
            let frame: serde_json::Value =
                serde_json::from_str(&observer.receiver.try_recv().unwrap()).unwrap();
            frame["vehicle_id"].as_i64().unwrap()
        })
        .collect();
    assert_eq!(received, (1..=20).collect::<Vec<_>>());
}

#[test]
fn test_membership_changes_during_broadcast_are_consistent() {
    let registry = Arc::new(BroadcastRegistry::new(1024, Arc::new(PipelineMetrics::new())));
    let stable = registry.connect(ObserverFilter::default());

    let churn = {
        let registry = registry.clone();
        thread::spawn(move || {
            for _ in 0..500 {
                let connection = registry.connect(ObserverFilter::default());
                registry.stats();
                registry.disconnect(connection.id);
            }
        })
    };
    let broadcaster = {
        let registry = registry.clone();
        thread::spawn(move || {
            let mut delivered = 0;
            for _ in 0..500 {
                let report = registry.broadcast_all(&telemetry(1));
                assert!(report.attempted >= 1);
                assert_eq!(report.removed, 0);
                delivered += report.delivered;
            }
            delivered
        })
    };

    churn.join().unwrap();
    let delivered = broadcaster.join().unwrap();

    assert!(delivered >= 500);
    assert_eq!(registry.connection_count(), 1);
    let mut receiver = stable.receiver;
    let mut stable_frames = 0;
    while receiver.try_recv().is_ok() {
        stable_frames += 1;
    }
    assert_eq!(stable_frames, 500);
}

#[test]
fn test_filtered_observer_only_sees_its_vehicle() {
    let registry = BroadcastRegistry::new(16, Arc::new(PipelineMetrics::new()));
    let mut scoped = registry.connect(ObserverFilter::for_vehicle(2));
    let mut everything = registry.connect(ObserverFilter::default());

    registry.broadcast_all(&telemetry(1));
    registry.broadcast_all(&telemetry(2));
    registry.broadcast_all(&ObserverMessage::error("control frames are unfiltered"));

    let scoped_types: Vec<String> = std::iter::from_fn(|| scoped.receiver.try_recv().ok())
        .map(|f| serde_json::from_str::<serde_json::Value>(&f).unwrap()["type"].to_string())
        .collect();
    assert_eq!(scoped_types, vec!["\"vehicle_log\"", "\"error\""]);

    let everything_count = std::iter::from_fn(|| everything.receiver.try_recv().ok()).count();
    assert_eq!(everything_count, 3);
}

#[test]
fn test_welcome_is_always_first_frame_under_concurrent_broadcast() {
    let registry = Arc::new(BroadcastRegistry::new(4096, Arc::new(PipelineMetrics::new())));
    let _existing = registry.connect(ObserverFilter::default());

    let stop = Arc::new(AtomicBool::new(false));
    let broadcaster = {
        let registry = registry.clone();
        let stop = stop.clone();
        thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                registry.broadcast_all(&telemetry(1));
            }
        })
    };

    for _ in 0..200 {
        let mut connection = registry.connect_with_welcome(ObserverFilter::default());
        let first: serde_json::Value =
            serde_json::from_str(&connection.receiver.try_recv().unwrap()).unwrap();
        assert_eq!(first["type"], "connection");
        assert!(first["connection_count"].as_u64().unwrap() >= 1);
        registry.disconnect(connection.id);
    }

    stop.store(true, Ordering::Relaxed);
    broadcaster.join().unwrap();
}
