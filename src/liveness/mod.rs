//! Periodic sensor liveness reporting
//!
//! Every tick reads all installed vehicle-sensor links and broadcasts one
//! `sensor_status` message per link, whether or not its status changed.

use crate::broadcast::BroadcastRegistry;
use crate::observability::metrics::PipelineMetrics;
use crate::protocol::{LinkStatus, ObserverMessage, SensorStatusUpdate};
use crate::store::{InstalledLink, StorageError, TelemetryStore};
use crate::task::{wait_for_shutdown, TaskControl};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, info_span, warn, Instrument};

pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Classify a link. A link seen exactly `threshold` ago is still connected;
/// one never seen is disconnected with no age.
pub fn evaluate_link(
    last_seen_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    threshold: Duration,
) -> (LinkStatus, Option<i64>) {
    let Some(last_seen_at) = last_seen_at else {
        return (LinkStatus::Disconnected, None);
    };

    let age = now.signed_duration_since(last_seen_at);
    let seconds_ago = age.num_seconds().max(0);
    let within = match chrono::Duration::from_std(threshold) {
        Ok(limit) => age <= limit,
        Err(_) => true,
    };

    let status = if within {
        LinkStatus::Connected
    } else {
        LinkStatus::Disconnected
    };
    (status, Some(seconds_ago))
}

fn status_update(link: InstalledLink, now: DateTime<Utc>, threshold: Duration) -> SensorStatusUpdate {
    let (status, last_seen_seconds_ago) = evaluate_link(link.last_seen_at, now, threshold);
    SensorStatusUpdate {
        vehicle_id: link.vehicle_id,
        vehicle_code: link.vehicle_code,
        sensor_id: link.sensor_id,
        sensor_code: link.sensor_code,
        sensor_name: link.sensor_name,
        status,
        last_seen_at: link.last_seen_at,
        last_seen_seconds_ago,
        timestamp: now,
    }
}

pub struct LivenessMonitor {
    store: Arc<dyn TelemetryStore>,
    registry: Arc<BroadcastRegistry>,
    metrics: Arc<PipelineMetrics>,
    interval: Duration,
    threshold: Duration,
}

impl LivenessMonitor {
    pub fn new(
        store: Arc<dyn TelemetryStore>,
        registry: Arc<BroadcastRegistry>,
        metrics: Arc<PipelineMetrics>,
        interval: Duration,
        threshold: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            metrics,
            interval,
            threshold,
        }
    }

    /// Evaluate every installed link once and broadcast its status.
    /// Returns the number of status messages issued.
    pub async fn run_tick(&self) -> Result<usize, StorageError> {
        let links = self.store.list_installed_links().await?;
        let now = Utc::now();
        let count = links.len();

        for link in links {
            let update = status_update(link, now, self.threshold);
            debug!(
                vehicle_id = update.vehicle_id,
                sensor_id = update.sensor_id,
                status = ?update.status,
                "Sensor status"
            );
            self.registry
                .broadcast_all(&ObserverMessage::SensorStatus(update));
        }

        Ok(count)
    }

    pub fn spawn(self) -> LivenessHandle {
        let metrics = self.metrics.clone();
        metrics.set_liveness_running(true);
        let control = TaskControl::spawn("liveness", move |shutdown| {
            self.run(shutdown).instrument(info_span!("liveness_monitor"))
        });
        LivenessHandle { control, metrics }
    }

    async fn run(self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs_f64(),
            timeout_secs = self.threshold.as_secs_f64(),
            "Liveness monitor started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => break,
                _ = ticker.tick() => {}
            }

            // Runs outside the select so a stop request never cuts a tick short
            match self.run_tick().await {
                Ok(updates) => self.metrics.liveness_tick(updates),
                Err(e) => {
                    self.metrics.liveness_tick_failed();
                    warn!(error = %e, "Liveness tick failed, retrying next interval");
                }
            }
        }

        self.metrics.set_liveness_running(false);
        info!("Liveness monitor stopped");
    }
}

pub struct LivenessHandle {
    control: TaskControl,
    metrics: Arc<PipelineMetrics>,
}

impl LivenessHandle {
    pub fn is_running(&self) -> bool {
        !self.control.is_stop_requested() && self.metrics.is_liveness_running()
    }

    /// Cancel the pending wait and return once any in-flight tick has finished
    pub async fn stop(&self) {
        self.control.stop().await;
    }
}
