//! Ingestion loop behaviour against a scripted transport and in-memory store


use seano_ingest::ingestion::IngestionState;
use seano_ingest::protocol::{DataValue, ObserverFilter};
use seano_ingest::testing::{GatedStore, ScriptedEvent, ScriptedTransport};
use std::sync::Arc;
use std::time::Duration;
use test_helpers::{fleet_store, message, within, Harness};

fn drain_frames(receiver: &mut tokio::sync::mpsc::Receiver<String>) -> Vec<serde_json::Value> {
    let mut frames = Vec::new();
    while let Ok(frame) = receiver.try_recv() {
        frames.push(serde_json::from_str(&frame).unwrap());
    }
    frames
}

#[tokio::test]
async fn test_each_class_writes_once_and_broadcasts_once() {
    let store = fleet_store();
    let harness = Harness::new();
    let mut observer = harness.registry.connect(ObserverFilter::default());

    let transport = ScriptedTransport::new().with_session(vec![
        message("USV-01", "raw_log", "boot ok").into(),
        message("USV-01", "sensor_log", r#"{"sensor_id": 10, "data": {"fix": 3}}"#).into(),
        message("USV-02", "vehicle_log", r#"{"speed": "4.5", "armed": true}"#).into(),
    ]);
    let probe = transport.probe();
    let handle = harness.ingestion_loop(transport, store.clone()).spawn();

    within(probe.wait_until_drained()).await;
    handle.stop().await;

    assert_eq!(store.raw_logs().len(), 1);
    assert_eq!(store.raw_logs()[0].vehicle_id, 1);
    assert_eq!(store.sensor_logs().len(), 1);
    assert_eq!(store.sensor_logs()[0].vehicle_id, 1);
    assert_eq!(store.sensor_logs()[0].sensor_id, 10);
    assert_eq!(store.telemetry().len(), 1);
    assert_eq!(store.telemetry()[0].vehicle_id, 2);
    assert_eq!(store.telemetry()[0].telemetry.speed, Some(4.5));

    let frames = drain_frames(&mut observer.receiver);
    let kinds: Vec<_> = frames.iter().map(|f| f["type"].as_str().unwrap()).collect();
    assert_eq!(kinds, vec!["raw_log", "sensor_log", "vehicle_log"]);
    assert_eq!(frames[0]["vehicle_id"], 1);
    assert_eq!(frames[2]["vehicle_id"], 2);
    assert!(frames.iter().all(|f| f["connection_count"] == 1));
}

#[tokio::test]
async fn test_unknown_vehicle_is_dropped_and_loop_continues() {
    let store = fleet_store();
    let harness = Harness::new();

    let transport = ScriptedTransport::new().with_session(vec![
        message("GHOST", "vehicle_log", r#"{"speed": 1}"#).into(),
        message("USV-01", "vehicle_log", r#"{"speed": 2}"#).into(),
    ]);
    let probe = transport.probe();
    let handle = harness.ingestion_loop(transport, store.clone()).spawn();

    within(probe.wait_until_drained()).await;
    assert_eq!(handle.state(), IngestionState::Consuming);
    handle.stop().await;

    let telemetry = store.telemetry();
    assert_eq!(telemetry.len(), 1);
    assert_eq!(telemetry[0].telemetry.speed, Some(2.0));

    let snapshot = harness.metrics.snapshot();
    assert_eq!(snapshot.ingestion.drops_by_kind["resolution_not_found"], 1);
}

#[tokio::test]
async fn test_malformed_payload_does_not_block_next_message() {
    let store = fleet_store();
    let harness = Harness::new();

    let transport = ScriptedTransport::new().with_session(vec![
        message("USV-01", "sensor_log", "{not json").into(),
        message("USV-01", "sensor_log", r#"[1, 2, 3]"#).into(),
        message("USV-01", "bogus_log", r#"{}"#).into(),
        message("USV-01", "sensor_log", r#"{"sensor_id": 11, "data": {"ok": true}}"#).into(),
    ]);
    let probe = transport.probe();
    let handle = harness.ingestion_loop(transport, store.clone()).spawn();

    within(probe.wait_until_drained()).await;
    handle.stop().await;

    let logs = store.sensor_logs();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].sensor_id, 11);
    assert_eq!(store.record_count(), 1);
}

#[tokio::test]
async fn test_records_keep_send_order() {
    let store = fleet_store();
    let harness = Harness::new();

    let session = (0..25)
        .map(|seq| {
            message(
                "USV-01",
                "sensor_log",
                &format!(r#"{{"sensor_id": 10, "data": {{"seq": {seq}}}}}"#),
            )
            .into()
        })
        .collect();
    let transport = ScriptedTransport::new().with_session(session);
    let probe = transport.probe();
    let handle = harness.ingestion_loop(transport, store.clone()).spawn();

    within(probe.wait_until_drained()).await;
    handle.stop().await;

    let seqs: Vec<_> = store
        .sensor_logs()
        .iter()
        .map(|record| record.data.get("seq").cloned())
        .collect();
    let expected: Vec<_> = (0..25).map(|seq| Some(DataValue::Integer(seq))).collect();
    assert_eq!(seqs, expected);
}

#[tokio::test]
async fn test_transport_drop_reconnects_and_resumes() {
    let store = fleet_store();
    let harness = Harness::new();

    let transport = ScriptedTransport::new()
        .with_session(vec![
            message("USV-01", "vehicle_log", r#"{"speed": 1}"#).into(),
            message("USV-01", "vehicle_log", "garbage").into(),
            message("NOPE", "vehicle_log", r#"{"speed": 9}"#).into(),
            ScriptedEvent::Drop("network unreachable".to_string()),
        ])
        .with_session(vec![message("USV-01", "vehicle_log", r#"{"speed": 2}"#).into()]);
    let probe = transport.probe();
    let ingestion = harness.ingestion_loop(transport, store.clone());
    let mut transitions = ingestion.subscribe_transitions();
    let handle = ingestion.spawn();

    within(probe.wait_until_drained()).await;
    handle.stop().await;

    let mut seen = Vec::new();
    while let Ok(state) = transitions.try_recv() {
        seen.push(state);
    }
    use IngestionState::*;
    assert_eq!(
        seen,
        vec![
            Connecting,
            Subscribed,
            Consuming,
            Disconnected,
            Connecting,
            Subscribed,
            Consuming,
            Stopped
        ]
    );
    assert_eq!(probe.connect_attempts(), 2);
    assert_eq!(probe.subscriptions().len(), 2);
    assert_eq!(store.telemetry().len(), 2);

    let mqtt = harness.metrics.snapshot().mqtt;
    assert_eq!(mqtt.connection_losses, 1);
    assert_eq!(mqtt.connections_established, 2);
}

#[tokio::test]
async fn test_storage_failure_is_message_level() {
    let store = fleet_store();
    store.fail_next_writes(1);
    let harness = Harness::new();
    let mut observer = harness.registry.connect(ObserverFilter::default());

    let transport = ScriptedTransport::new().with_session(vec![
        message("USV-01", "raw_log", "lost").into(),
        message("USV-01", "raw_log", "kept").into(),
    ]);
    let probe = transport.probe();
    let handle = harness.ingestion_loop(transport, store.clone()).spawn();

    within(probe.wait_until_drained()).await;
    assert_eq!(handle.state(), IngestionState::Consuming);
    handle.stop().await;

    let raw = store.raw_logs();
    assert_eq!(raw.len(), 1);
    assert!(raw[0].logs.contains("kept"));
    assert_eq!(probe.connect_attempts(), 1);

    // Nothing is broadcast for a message that failed to persist
    let frames = drain_frames(&mut observer.receiver);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["data"], "kept");
}

#[tokio::test]
async fn test_stop_waits_for_in_flight_message() {
    let inner = fleet_store();
    let gated = GatedStore::new(inner.clone());
    let harness = Harness::new();
    let mut observer = harness.registry.connect(ObserverFilter::default());

    let transport = ScriptedTransport::new().with_session(vec![
        message("USV-01", "vehicle_log", r#"{"speed": 1}"#).into(),
        message("USV-01", "vehicle_log", r#"{"speed": 2}"#).into(),
    ]);
    let probe = transport.probe();
    let handle = Arc::new(harness.ingestion_loop(transport, gated.clone()).spawn());

    within(gated.wait_for_waiter()).await;

    let stopper = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.stop().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!stopper.is_finished(), "stop returned while a message was mid-processing");
    assert_eq!(inner.telemetry().len(), 0);

    gated.release(10);
    within(stopper).await.unwrap();

    assert_eq!(handle.state(), IngestionState::Stopped);
    assert_eq!(inner.telemetry().len(), 1);
    assert_eq!(probe.delivered(), 1);

    // No further broadcast happens after stop has returned
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(drain_frames(&mut observer.receiver).len(), 1);
}

#[tokio::test]
async fn test_stop_is_idempotent_across_tasks() {
    let harness = Harness::new();
    let transport = ScriptedTransport::new();
    let handle = Arc::new(harness.ingestion_loop(transport, fleet_store()).spawn());
    within(handle.wait_for_state(IngestionState::Consuming)).await;

    let a = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.stop().await })
    };
    let b = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.stop().await })
    };
    within(a).await.unwrap();
    within(b).await.unwrap();
    handle.stop().await;

    assert!(!handle.is_running());
    assert_eq!(handle.state(), IngestionState::Stopped);
}

#[tokio::test]
async fn test_injected_messages_after_start() {
    let store = fleet_store();
    let harness = Harness::new();
    let transport = ScriptedTransport::new();
    let probe = transport.probe();
    let handle = harness.ingestion_loop(transport, store.clone()).spawn();

    within(handle.wait_for_state(IngestionState::Consuming)).await;
    probe.inject(message("USV-02", "raw_log", "late"));
    within(probe.wait_until_drained()).await;
    handle.stop().await;

    assert_eq!(store.raw_logs().len(), 1);
    assert_eq!(store.raw_logs()[0].vehicle_id, 2);
}
