//! Inbound payload types for the three telemetry message classes
//!
//! `sensor_log` carries a free-form `data` object that is stored verbatim, so it
//! is modelled as [`DataValue`] rather than a typed struct. `vehicle_log` is a
//! flat bag of optional telemetry fields whose numbers may arrive as JSON
//! numbers or numeric strings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Internal identifier of a vehicle
pub type VehicleId = i64;

/// Internal identifier of a sensor
pub type SensorId = i64;

/// Semi-structured value passed through storage without schema enforcement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DataValue {
    Null,
    Bool(bool),
    Integer(i64),
    /// Integers above `i64::MAX`
    Unsigned(u64),
    Float(f64),
    Text(String),
    List(Vec<DataValue>),
    Object(BTreeMap<String, DataValue>),
}

impl Default for DataValue {
    fn default() -> Self {
        DataValue::Object(BTreeMap::new())
    }
}

impl DataValue {
    pub fn is_object(&self) -> bool {
        matches!(self, DataValue::Object(_))
    }

    pub fn get(&self, key: &str) -> Option<&DataValue> {
        match self {
            DataValue::Object(map) => map.get(key),
            _ => None,
        }
    }

    /// Convert into a JSON value for storage backends that speak JSON natively
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            DataValue::Null => serde_json::Value::Null,
            DataValue::Bool(b) => serde_json::Value::Bool(*b),
            DataValue::Integer(i) => serde_json::Value::from(*i),
            DataValue::Unsigned(u) => serde_json::Value::from(*u),
            DataValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            DataValue::Text(s) => serde_json::Value::String(s.clone()),
            DataValue::List(items) => {
                serde_json::Value::Array(items.iter().map(DataValue::to_json).collect())
            }
            DataValue::Object(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

/// Body of a `sensor_log` message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorLogPayload {
    pub sensor_id: SensorId,
    #[serde(default)]
    pub data: DataValue,
}

/// Body of a `vehicle_log` message. Absent or `null` fields stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPayload {
    #[serde(default, deserialize_with = "lenient::f64", skip_serializing_if = "Option::is_none")]
    pub battery_voltage: Option<f64>,
    #[serde(default, deserialize_with = "lenient::f64", skip_serializing_if = "Option::is_none")]
    pub battery_current: Option<f64>,
    #[serde(default, deserialize_with = "lenient::i32", skip_serializing_if = "Option::is_none")]
    pub rssi: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, deserialize_with = "lenient::f64", skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, deserialize_with = "lenient::f64", skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(default, deserialize_with = "lenient::f64", skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    #[serde(default, deserialize_with = "lenient::i32", skip_serializing_if = "Option::is_none")]
    pub gps_fix: Option<i32>,
    #[serde(default, deserialize_with = "lenient::f64", skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    #[serde(default, deserialize_with = "lenient::f64", skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(default, deserialize_with = "lenient::f64", skip_serializing_if = "Option::is_none")]
    pub roll: Option<f64>,
    #[serde(default, deserialize_with = "lenient::f64", skip_serializing_if = "Option::is_none")]
    pub pitch: Option<f64>,
    #[serde(default, deserialize_with = "lenient::f64", skip_serializing_if = "Option::is_none")]
    pub yaw: Option<f64>,
    #[serde(default, deserialize_with = "lenient::f64", skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub armed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guided: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_status: Option<String>,
}

/// Self-describing wrapper stored for every `raw_log` message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawLogEnvelope {
    pub entity_id: VehicleId,
    pub entity_code: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl RawLogEnvelope {
    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Deserializers that accept numbers either as JSON numbers or numeric strings
mod lenient {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrText {
        Number(serde_json::Number),
        Text(String),
    }

    pub fn f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<NumberOrText>::deserialize(deserializer)? {
            None => Ok(None),
            Some(NumberOrText::Number(n)) => n
                .as_f64()
                .map(Some)
                .ok_or_else(|| D::Error::custom(format!("number {n} is out of range"))),
            Some(NumberOrText::Text(s)) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    return Ok(None);
                }
                trimmed
                    .parse::<f64>()
                    .ok()
                    .filter(|v| v.is_finite())
                    .map(Some)
                    .ok_or_else(|| D::Error::custom(format!("expected a number, got {s:?}")))
            }
        }
    }

    pub fn i32<'de, D>(deserializer: D) -> Result<Option<i32>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let whole = |value: f64| -> Option<i32> {
            if value.fract() == 0.0 && value >= i32::MIN as f64 && value <= i32::MAX as f64 {
                Some(value as i32)
            } else {
                None
            }
        };

        match Option::<NumberOrText>::deserialize(deserializer)? {
            None => Ok(None),
            Some(NumberOrText::Number(n)) => n
                .as_i64()
                .and_then(|v| i32::try_from(v).ok())
                .or_else(|| n.as_f64().and_then(whole))
                .map(Some)
                .ok_or_else(|| D::Error::custom(format!("expected an integer, got {n}"))),
            Some(NumberOrText::Text(s)) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    return Ok(None);
                }
                trimmed
                    .parse::<i32>()
                    .ok()
                    .or_else(|| trimmed.parse::<f64>().ok().and_then(whole))
                    .map(Some)
                    .ok_or_else(|| D::Error::custom(format!("expected an integer, got {s:?}")))
            }
        }
    }
}
