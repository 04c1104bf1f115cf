//! Thread-safe pipeline metrics
//!
//! Atomic counters for the hot paths, mutex-protected collections for timing
//! samples and per-kind drop counts. One collector is created per pipeline and
//! shared by `Arc`, so independent pipelines in one process never mix counts.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const MAX_TIMING_SAMPLES: usize = 1000;

/// Metrics collector shared by the ingestion loop, registry and liveness monitor
pub struct PipelineMetrics {
    // Ingestion
    messages_received: AtomicU64,
    messages_stored: AtomicU64,
    messages_dropped: AtomicU64,
    drops_by_kind: Mutex<BTreeMap<&'static str, u64>>,
    processing_times: Mutex<Vec<u64>>, // microseconds

    // Transport
    mqtt_connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    connection_losses: AtomicU64,
    connection_start_time: AtomicU64,

    // Observers
    observers_connected: AtomicU64,
    observers_removed: AtomicU64,
    broadcasts: AtomicU64,
    deliveries: AtomicU64,
    delivery_failures: AtomicU64,

    // Liveness
    liveness_running: AtomicBool,
    liveness_ticks: AtomicU64,
    liveness_tick_failures: AtomicU64,
    status_updates: AtomicU64,

    uptime_start: AtomicU64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            messages_received: AtomicU64::new(0),
            messages_stored: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            drops_by_kind: Mutex::new(BTreeMap::new()),
            processing_times: Mutex::new(Vec::new()),
            mqtt_connected: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            connection_losses: AtomicU64::new(0),
            connection_start_time: AtomicU64::new(0),
            observers_connected: AtomicU64::new(0),
            observers_removed: AtomicU64::new(0),
            broadcasts: AtomicU64::new(0),
            deliveries: AtomicU64::new(0),
            delivery_failures: AtomicU64::new(0),
            liveness_running: AtomicBool::new(false),
            liveness_ticks: AtomicU64::new(0),
            liveness_tick_failures: AtomicU64::new(0),
            status_updates: AtomicU64::new(0),
            uptime_start: AtomicU64::new(current_timestamp()),
        }
    }

    // Ingestion
    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_stored(&self, duration: Duration) {
        self.messages_stored.fetch_add(1, Ordering::Relaxed);
        self.record_processing_time(duration);
    }

    pub fn message_dropped(&self, kind: &'static str) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut drops) = self.drops_by_kind.lock() {
            *drops.entry(kind).or_insert(0) += 1;
        }
    }

    fn record_processing_time(&self, duration: Duration) {
        if let Ok(mut times) = self.processing_times.lock() {
            times.push(duration.as_micros() as u64);
            if times.len() > MAX_TIMING_SAMPLES {
                times.remove(0);
            }
        }
    }

    // Transport
    pub fn mqtt_connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(true, Ordering::Relaxed);
        self.connection_start_time
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn mqtt_connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn mqtt_connection_lost(&self) {
        self.connection_losses.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn mqtt_disconnected(&self) {
        self.mqtt_connected.store(false, Ordering::Relaxed);
    }

    pub fn is_mqtt_connected(&self) -> bool {
        self.mqtt_connected.load(Ordering::Relaxed)
    }

    // Observers
    pub fn observer_connected(&self) {
        self.observers_connected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observer_removed(&self) {
        self.observers_removed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn broadcast_sent(&self, delivered: usize, failed: usize) {
        self.broadcasts.fetch_add(1, Ordering::Relaxed);
        self.deliveries.fetch_add(delivered as u64, Ordering::Relaxed);
        self.delivery_failures
            .fetch_add(failed as u64, Ordering::Relaxed);
    }

    // Liveness
    pub fn set_liveness_running(&self, running: bool) {
        self.liveness_running.store(running, Ordering::Relaxed);
    }

    pub fn is_liveness_running(&self) -> bool {
        self.liveness_running.load(Ordering::Relaxed)
    }

    pub fn liveness_tick(&self, updates: usize) {
        self.liveness_ticks.fetch_add(1, Ordering::Relaxed);
        self.status_updates
            .fetch_add(updates as u64, Ordering::Relaxed);
    }

    pub fn liveness_tick_failed(&self) {
        self.liveness_tick_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn processing_time_statistics(&self) -> (f64, f64, f64) {
        let Ok(times) = self.processing_times.lock() else {
            return (0.0, 0.0, 0.0);
        };
        if times.is_empty() {
            return (0.0, 0.0, 0.0);
        }

        let mut sorted = times.clone();
        sorted.sort_unstable();
        let avg = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;
        let percentile = |p: f64| {
            let index = ((sorted.len() as f64 - 1.0) * p).round() as usize;
            sorted[index.min(sorted.len() - 1)] as f64 / 1000.0
        };
        (avg / 1000.0, percentile(0.50), percentile(0.95))
    }

    /// Get complete metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let (avg, p50, p95) = self.processing_time_statistics();
        let drops_by_kind = self
            .drops_by_kind
            .lock()
            .map(|drops| {
                drops
                    .iter()
                    .map(|(k, v)| (k.to_string(), *v))
                    .collect()
            })
            .unwrap_or_default();

        let start = self.connection_start_time.load(Ordering::Relaxed);
        let connection_duration_seconds = if start > 0 { now.saturating_sub(start) } else { 0 };

        MetricsSnapshot {
            ingestion: IngestionMetrics {
                messages_received: self.messages_received.load(Ordering::Relaxed),
                messages_stored: self.messages_stored.load(Ordering::Relaxed),
                messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
                drops_by_kind,
                avg_processing_time_ms: avg,
                processing_time_p50_ms: p50,
                processing_time_p95_ms: p95,
            },
            mqtt: MqttMetrics {
                connected: self.mqtt_connected.load(Ordering::Relaxed),
                connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                connection_failures: self.connection_failures.load(Ordering::Relaxed),
                connection_losses: self.connection_losses.load(Ordering::Relaxed),
                connection_duration_seconds,
            },
            observers: ObserverMetrics {
                observers_connected: self.observers_connected.load(Ordering::Relaxed),
                observers_removed: self.observers_removed.load(Ordering::Relaxed),
                broadcasts: self.broadcasts.load(Ordering::Relaxed),
                deliveries: self.deliveries.load(Ordering::Relaxed),
                delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
            },
            liveness: LivenessMetrics {
                running: self.liveness_running.load(Ordering::Relaxed),
                ticks: self.liveness_ticks.load(Ordering::Relaxed),
                tick_failures: self.liveness_tick_failures.load(Ordering::Relaxed),
                status_updates: self.status_updates.load(Ordering::Relaxed),
            },
            uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
            timestamp: now,
        }
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub ingestion: IngestionMetrics,
    pub mqtt: MqttMetrics,
    pub observers: ObserverMetrics,
    pub liveness: LivenessMetrics,
    pub uptime_seconds: u64,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct IngestionMetrics {
    pub messages_received: u64,
    pub messages_stored: u64,
    pub messages_dropped: u64,
    pub drops_by_kind: BTreeMap<String, u64>,
    pub avg_processing_time_ms: f64,
    pub processing_time_p50_ms: f64,
    pub processing_time_p95_ms: f64,
}

#[derive(Debug, Serialize)]
pub struct MqttMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub connection_losses: u64,
    pub connection_duration_seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct ObserverMetrics {
    pub observers_connected: u64,
    pub observers_removed: u64,
    pub broadcasts: u64,
    pub deliveries: u64,
    pub delivery_failures: u64,
}

#[derive(Debug, Serialize)]
pub struct LivenessMetrics {
    pub running: bool,
    pub ticks: u64,
    pub tick_failures: u64,
    pub status_updates: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
