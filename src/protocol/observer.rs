//! Messages exchanged with live observers over websockets
//!
//! Outbound messages are tagged by `type`. Fan-out messages are wrapped in a
//! [`BroadcastEnvelope`] that adds `broadcast_time` and `connection_count`.

use super::messages::{DataValue, SensorId, TelemetryPayload, VehicleId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Connected/disconnected classification of a sensor link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkStatus {
    Connected,
    Disconnected,
}

/// Liveness report for one installed vehicle-sensor link
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorStatusUpdate {
    pub vehicle_id: VehicleId,
    pub vehicle_code: String,
    pub sensor_id: SensorId,
    pub sensor_code: String,
    pub sensor_name: Option<String>,
    pub status: LinkStatus,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub last_seen_seconds_ago: Option<i64>,
    pub timestamp: DateTime<Utc>,
}

/// Outbound observer message
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObserverMessage {
    Connection {
        message: String,
        connection_count: usize,
        timestamp: DateTime<Utc>,
    },
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        vehicle_id: Option<VehicleId>,
        timestamp: Value,
    },
    SubscriptionAck {
        message: String,
        timestamp: DateTime<Utc>,
    },
    Error {
        message: String,
        timestamp: DateTime<Utc>,
    },
    RawLog {
        vehicle_id: VehicleId,
        vehicle_code: String,
        data: String,
        timestamp: DateTime<Utc>,
    },
    SensorLog {
        vehicle_id: VehicleId,
        vehicle_code: String,
        sensor_id: SensorId,
        data: DataValue,
        timestamp: DateTime<Utc>,
    },
    VehicleLog {
        vehicle_id: VehicleId,
        vehicle_code: String,
        data: TelemetryPayload,
        timestamp: DateTime<Utc>,
    },
    SensorStatus(SensorStatusUpdate),
}

impl ObserverMessage {
    pub fn welcome(connection_count: usize) -> Self {
        ObserverMessage::Connection {
            message: "Connected to telemetry stream".to_string(),
            connection_count,
            timestamp: Utc::now(),
        }
    }

    pub fn error<S: Into<String>>(message: S) -> Self {
        ObserverMessage::Error {
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// The `type` tag as it appears on the wire
    pub fn kind(&self) -> &'static str {
        match self {
            ObserverMessage::Connection { .. } => "connection",
            ObserverMessage::Pong { .. } => "pong",
            ObserverMessage::SubscriptionAck { .. } => "subscription_ack",
            ObserverMessage::Error { .. } => "error",
            ObserverMessage::RawLog { .. } => "raw_log",
            ObserverMessage::SensorLog { .. } => "sensor_log",
            ObserverMessage::VehicleLog { .. } => "vehicle_log",
            ObserverMessage::SensorStatus(_) => "sensor_status",
        }
    }

    fn vehicle(&self) -> Option<(VehicleId, &str)> {
        match self {
            ObserverMessage::RawLog {
                vehicle_id,
                vehicle_code,
                ..
            }
            | ObserverMessage::SensorLog {
                vehicle_id,
                vehicle_code,
                ..
            }
            | ObserverMessage::VehicleLog {
                vehicle_id,
                vehicle_code,
                ..
            } => Some((*vehicle_id, vehicle_code.as_str())),
            ObserverMessage::SensorStatus(update) => {
                Some((update.vehicle_id, update.vehicle_code.as_str()))
            }
            _ => None,
        }
    }

    fn sensor(&self) -> Option<SensorId> {
        match self {
            ObserverMessage::SensorLog { sensor_id, .. } => Some(*sensor_id),
            ObserverMessage::SensorStatus(update) => Some(update.sensor_id),
            _ => None,
        }
    }
}

/// Fan-out wrapper adding registry-level fields to a message
#[derive(Debug, Serialize)]
pub struct BroadcastEnvelope<'a> {
    #[serde(flatten)]
    pub message: &'a ObserverMessage,
    pub broadcast_time: DateTime<Utc>,
    pub connection_count: usize,
}

/// Per-observer interest filter. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObserverFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vehicle_id: Option<VehicleId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vehicle_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor_id: Option<SensorId>,
}

impl ObserverFilter {
    pub fn for_vehicle(vehicle_id: VehicleId) -> Self {
        Self {
            vehicle_id: Some(vehicle_id),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.vehicle_id.is_none() && self.vehicle_code.is_none() && self.sensor_id.is_none()
    }

    /// Control messages always match; data messages must satisfy every set field.
    pub fn matches(&self, message: &ObserverMessage) -> bool {
        if self.is_empty() {
            return true;
        }
        let Some((vehicle_id, vehicle_code)) = message.vehicle() else {
            return true;
        };

        if self.vehicle_id.is_some_and(|id| id != vehicle_id) {
            return false;
        }
        if self
            .vehicle_code
            .as_deref()
            .is_some_and(|code| code != vehicle_code)
        {
            return false;
        }
        match self.sensor_id {
            Some(wanted) => message.sensor() == Some(wanted),
            None => true,
        }
    }

    /// Merge a subscribe request into this filter. A vehicle scope fixed at
    /// connect time cannot be widened.
    pub fn merge(&mut self, update: ObserverFilter, scoped_vehicle: Option<VehicleId>) {
        self.vehicle_id = scoped_vehicle.or(update.vehicle_id);
        self.vehicle_code = update.vehicle_code;
        self.sensor_id = update.sensor_id;
    }
}

/// What an observer's inbound text frame asks for
#[derive(Debug, Clone, PartialEq)]
pub enum ControlRequest {
    Ping { timestamp: Value },
    Subscribe(ObserverFilter),
    InvalidJson,
    Ignored,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ControlMessage {
    Ping {
        #[serde(default)]
        timestamp: Value,
    },
    Subscribe(ObserverFilter),
}

/// Interpret an inbound observer frame. Valid JSON with an unrecognised
/// `type` is ignored rather than answered with an error.
pub fn interpret_control(text: &str) -> ControlRequest {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(_) => return ControlRequest::InvalidJson,
    };

    match serde_json::from_value::<ControlMessage>(value) {
        Ok(ControlMessage::Ping { timestamp }) => ControlRequest::Ping {
            timestamp: if timestamp.is_null() {
                Value::String(Utc::now().to_rfc3339())
            } else {
                timestamp
            },
        },
        Ok(ControlMessage::Subscribe(filter)) => ControlRequest::Subscribe(filter),
        Err(_) => ControlRequest::Ignored,
    }
}
