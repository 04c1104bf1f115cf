//! Registry of live observer connections
//!
//! Every observer owns a bounded queue drained by its websocket writer task.
//! Sends never block: a full or closed queue is a delivery failure and the
//! observer is removed. All membership reads and writes go through one
//! `RwLock`, and fan-out holds the read side for the whole pass, so a connect
//! or disconnect is ordered entirely before or after any broadcast.

use crate::error::PipelineError;
use crate::observability::metrics::PipelineMetrics;
use crate::protocol::{BroadcastEnvelope, ObserverFilter, ObserverMessage};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, TryLockError};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default per-observer queue depth
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Opaque identifier of one observer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    fn new() -> Self {
        ConnectionId(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Receiving half handed to the connection's writer task
#[derive(Debug)]
pub struct ObserverConnection {
    pub id: ConnectionId,
    pub receiver: mpsc::Receiver<String>,
}

/// Outcome of a single send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    Dropped,
}

/// Result of one fan-out pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub attempted: usize,
    pub delivered: usize,
    pub removed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub connection_id: ConnectionId,
    pub connected_at: DateTime<Utc>,
    pub client_info: ObserverFilter,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub active_connections: usize,
    pub connections_info: Vec<ConnectionInfo>,
}

struct ObserverEntry {
    sender: mpsc::Sender<String>,
    connected_at: DateTime<Utc>,
    filter: ObserverFilter,
}

pub struct BroadcastRegistry {
    observers: RwLock<HashMap<ConnectionId, ObserverEntry>>,
    count: AtomicUsize,
    channel_capacity: usize,
    metrics: Arc<PipelineMetrics>,
}

fn delivery_error(connection_id: ConnectionId, err: TrySendError<String>) -> PipelineError {
    let reason = match err {
        TrySendError::Full(_) => "outbound queue full",
        TrySendError::Closed(_) => "observer closed",
    };
    PipelineError::BroadcastDelivery {
        connection_id,
        reason: reason.to_string(),
    }
}

impl BroadcastRegistry {
    pub fn new(channel_capacity: usize, metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            observers: RwLock::new(HashMap::new()),
            count: AtomicUsize::new(0),
            channel_capacity: channel_capacity.max(1),
            metrics,
        }
    }

    /// Register a new observer. It receives every broadcast issued after this returns.
    pub fn connect(&self, filter: ObserverFilter) -> ObserverConnection {
        self.register(filter, false)
    }

    /// Register a new observer whose first frame is the `connection` welcome,
    /// queued ahead of any broadcast.
    pub fn connect_with_welcome(&self, filter: ObserverFilter) -> ObserverConnection {
        self.register(filter, true)
    }

    fn register(&self, filter: ObserverFilter, welcome: bool) -> ObserverConnection {
        let id = ConnectionId::new();
        let (sender, receiver) = mpsc::channel(self.channel_capacity);

        let mut observers = self.observers.write().unwrap_or_else(PoisonError::into_inner);
        if welcome {
            // Queued under the write lock, so no broadcast can slip in first
            match serde_json::to_string(&ObserverMessage::welcome(observers.len() + 1)) {
                Ok(text) => {
                    let _ = sender.try_send(text);
                }
                Err(e) => warn!(connection_id = %id, error = %e, "Failed to serialize welcome"),
            }
        }
        observers.insert(
            id,
            ObserverEntry {
                sender,
                connected_at: Utc::now(),
                filter,
            },
        );
        self.count.store(observers.len(), Ordering::Release);
        drop(observers);

        self.metrics.observer_connected();
        info!(connection_id = %id, "Observer connected");
        ObserverConnection { id, receiver }
    }

    /// Remove an observer. Returns false if it was already gone.
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        let mut observers = self.observers.write().unwrap_or_else(PoisonError::into_inner);
        let removed = observers.remove(&id).is_some();
        self.count.store(observers.len(), Ordering::Release);
        drop(observers);

        if removed {
            self.metrics.observer_removed();
            info!(connection_id = %id, "Observer disconnected");
        }
        removed
    }

    /// Drop every observer. Their writer tasks see a closed queue and end.
    pub fn close_all(&self) -> usize {
        let mut observers = self.observers.write().unwrap_or_else(PoisonError::into_inner);
        let closed = observers.len();
        observers.clear();
        self.count.store(0, Ordering::Release);
        drop(observers);

        for _ in 0..closed {
            self.metrics.observer_removed();
        }
        if closed > 0 {
            info!(closed, "Closed all observers");
        }
        closed
    }

    /// Replace an observer's filter
    pub fn update_filter(&self, id: ConnectionId, filter: ObserverFilter) -> bool {
        let mut observers = self.observers.write().unwrap_or_else(PoisonError::into_inner);
        match observers.get_mut(&id) {
            Some(entry) => {
                entry.filter = filter;
                true
            }
            None => false,
        }
    }

    pub fn filter_of(&self, id: ConnectionId) -> Option<ObserverFilter> {
        self.observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .map(|entry| entry.filter.clone())
    }

    /// Send a message to one observer, bypassing filters
    pub fn send_to(&self, id: ConnectionId, message: &ObserverMessage) -> Delivery {
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                warn!(connection_id = %id, error = %e, "Failed to serialize observer message");
                return Delivery::Dropped;
            }
        };

        let result = {
            let observers = self.observers.read().unwrap_or_else(PoisonError::into_inner);
            match observers.get(&id) {
                Some(entry) => entry.sender.try_send(text).map_err(|e| delivery_error(id, e)),
                None => return Delivery::Dropped,
            }
        };

        match result {
            Ok(()) => Delivery::Delivered,
            Err(e) => {
                warn!(connection_id = %id, error = %e, kind = e.kind(), "Observer delivery failed, removing");
                self.disconnect(id);
                Delivery::Dropped
            }
        }
    }

    /// Deliver a message to every observer whose filter matches it.
    ///
    /// Failed observers are removed after the pass; delivery to the others is
    /// unaffected.
    pub fn broadcast_all(&self, message: &ObserverMessage) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let mut failed = Vec::new();

        {
            let observers = self.observers.read().unwrap_or_else(PoisonError::into_inner);
            if observers.is_empty() {
                return report;
            }

            let envelope = BroadcastEnvelope {
                message,
                broadcast_time: Utc::now(),
                connection_count: observers.len(),
            };
            let text = match serde_json::to_string(&envelope) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, kind = message.kind(), "Failed to serialize broadcast");
                    return report;
                }
            };

            for (id, entry) in observers.iter() {
                if !entry.filter.matches(message) {
                    continue;
                }
                report.attempted += 1;
                match entry.sender.try_send(text.clone()) {
                    Ok(()) => report.delivered += 1,
                    Err(e) => failed.push((*id, delivery_error(*id, e))),
                }
            }
        }

        for (id, e) in failed {
            warn!(
                connection_id = %id,
                error = %e,
                kind = e.kind(),
                message_type = message.kind(),
                "Broadcast delivery failed, removing observer"
            );
            if self.disconnect(id) {
                report.removed += 1;
            }
        }

        self.metrics
            .broadcast_sent(report.delivered, report.attempted - report.delivered);
        debug!(
            kind = message.kind(),
            attempted = report.attempted,
            delivered = report.delivered,
            "Broadcast complete"
        );
        report
    }

    /// Current number of observers, without taking the lock
    pub fn connection_count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Best-effort snapshot. Never blocks: under write contention only the count is filled in.
    pub fn stats(&self) -> RegistryStats {
        let guard = match self.observers.try_read() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                return RegistryStats {
                    active_connections: self.connection_count(),
                    connections_info: Vec::new(),
                }
            }
        };

        let mut connections_info: Vec<ConnectionInfo> = guard
            .iter()
            .map(|(id, entry)| ConnectionInfo {
                connection_id: *id,
                connected_at: entry.connected_at,
                client_info: entry.filter.clone(),
            })
            .collect();
        connections_info.sort_by_key(|info| info.connected_at);

        RegistryStats {
            active_connections: guard.len(),
            connections_info,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TelemetryPayload;

    fn registry(capacity: usize) -> BroadcastRegistry {
        BroadcastRegistry::new(capacity, Arc::new(PipelineMetrics::new()))
    }

    #[test]
    fn test_send_failures_map_to_delivery_errors() {
        let id = ConnectionId::new();
        for (err, reason) in [
            (TrySendError::Full(String::new()), "outbound queue full"),
            (TrySendError::Closed(String::new()), "observer closed"),
        ] {
            let e = delivery_error(id, err);
            assert_eq!(e.kind(), "broadcast_delivery");
            assert!(e.is_message_level());
            assert!(e.to_string().contains(reason), "{e}");
            assert!(e.to_string().contains(&id.to_string()));
        }
    }

    fn telemetry(vehicle_id: i64) -> ObserverMessage {
        ObserverMessage::VehicleLog {
            vehicle_id,
            vehicle_code: format!("USV-{vehicle_id:02}"),
            data: TelemetryPayload::default(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_connect_and_disconnect() {
        let registry = registry(8);
        let a = registry.connect(ObserverFilter::default());
        let _b = registry.connect(ObserverFilter::default());
        assert_eq!(registry.connection_count(), 2);

        assert!(registry.disconnect(a.id));
        assert!(!registry.disconnect(a.id));
        assert_eq!(registry.stats().active_connections, 1);
    }

    #[tokio::test]
    async fn test_close_all_ends_receivers() {
        let registry = registry(8);
        let mut a = registry.connect(ObserverFilter::default());
        let _b = registry.connect(ObserverFilter::default());

        assert_eq!(registry.close_all(), 2);
        assert_eq!(registry.connection_count(), 0);
        assert!(a.receiver.recv().await.is_none());
    }

    #[test]
    fn test_broadcast_reaches_every_observer() {
        let registry = registry(8);
        let mut a = registry.connect(ObserverFilter::default());
        let mut b = registry.connect(ObserverFilter::default());

        let report = registry.broadcast_all(&telemetry(1));
        assert_eq!(
            report,
            BroadcastReport {
                attempted: 2,
                delivered: 2,
                removed: 0
            }
        );

        for conn in [&mut a, &mut b] {
            let text = conn.receiver.try_recv().unwrap();
            let value: serde_json::Value = serde_json::from_str(&text).unwrap();
            assert_eq!(value["type"], "vehicle_log");
            assert_eq!(value["connection_count"], 2);
            assert!(value["broadcast_time"].is_string());
        }
    }

    #[test]
    fn test_closed_observer_is_removed() {
        let registry = registry(8);
        let mut live = registry.connect(ObserverFilter::default());
        let broken = registry.connect(ObserverFilter::default());
        drop(broken.receiver);

        let report = registry.broadcast_all(&telemetry(1));
        assert_eq!(report.attempted, 2);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.removed, 1);
        assert!(live.receiver.try_recv().is_ok());
        assert_eq!(registry.connection_count(), 1);
    }

    #[test]
    fn test_full_queue_counts_as_failure() {
        let registry = registry(1);
        let slow = registry.connect(ObserverFilter::default());

        assert_eq!(registry.broadcast_all(&telemetry(1)).delivered, 1);
        let report = registry.broadcast_all(&telemetry(1));
        assert_eq!(report.removed, 1);
        assert_eq!(registry.connection_count(), 0);
        drop(slow);
    }

    #[test]
    fn test_filters_limit_fanout() {
        let registry = registry(8);
        let mut scoped = registry.connect(ObserverFilter::for_vehicle(2));
        let mut open = registry.connect(ObserverFilter::default());

        let report = registry.broadcast_all(&telemetry(1));
        assert_eq!(report.attempted, 1);
        assert!(scoped.receiver.try_recv().is_err());
        assert!(open.receiver.try_recv().is_ok());

        registry.broadcast_all(&telemetry(2));
        assert!(scoped.receiver.try_recv().is_ok());
    }

    #[test]
    fn test_send_to_preserves_order() {
        let registry = registry(8);
        let mut conn = registry.connect(ObserverFilter::default());
        for i in 0..3 {
            assert_eq!(
                registry.send_to(conn.id, &ObserverMessage::error(format!("m{i}"))),
                Delivery::Delivered
            );
        }
        for i in 0..3 {
            let value: serde_json::Value =
                serde_json::from_str(&conn.receiver.try_recv().unwrap()).unwrap();
            assert_eq!(value["message"], format!("m{i}"));
        }
    }

    #[test]
    fn test_send_to_unknown_observer_is_dropped() {
        let registry = registry(8);
        let conn = registry.connect(ObserverFilter::default());
        registry.disconnect(conn.id);
        assert_eq!(
            registry.send_to(conn.id, &ObserverMessage::welcome(0)),
            Delivery::Dropped
        );
    }

    #[test]
    fn test_stats_shape() {
        let registry = registry(8);
        let conn = registry.connect(ObserverFilter::for_vehicle(4));
        let value = serde_json::to_value(registry.stats()).unwrap();
        assert_eq!(value["active_connections"], 1);
        assert_eq!(
            value["connections_info"][0]["connection_id"],
            conn.id.to_string()
        );
        assert_eq!(value["connections_info"][0]["client_info"]["vehicle_id"], 4);
    }
}
