//! Topic classification and payload decoding

use crate::error::PipelineResult;
use crate::protocol::{
    parse_topic, MessageClass, SensorLogPayload, TelemetryPayload,
};
use thiserror::Error;

/// Payload decoding failures for structured message classes
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("{class} payload is not valid JSON: {source}")]
    InvalidJson {
        class: MessageClass,
        #[source]
        source: serde_json::Error,
    },

    #[error("{class} payload must be a JSON object, got {found}")]
    NotAnObject {
        class: MessageClass,
        found: &'static str,
    },

    #[error("{class} payload has invalid fields: {source}")]
    InvalidFields {
        class: MessageClass,
        #[source]
        source: serde_json::Error,
    },
}

/// Decoded body of an inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedBody {
    RawLog(String),
    SensorLog(SensorLogPayload),
    VehicleLog(TelemetryPayload),
}

/// A classified and decoded inbound message, not yet resolved to a vehicle
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedMessage {
    pub vehicle_code: String,
    pub class: MessageClass,
    pub body: DecodedBody,
}

/// Classify the topic and decode the payload according to its class
pub fn decode(topic: &str, payload: &[u8], namespace: &str) -> PipelineResult<DecodedMessage> {
    let parsed = parse_topic(topic, namespace)?;

    let body = match parsed.class {
        MessageClass::RawLog => DecodedBody::RawLog(String::from_utf8_lossy(payload).into_owned()),
        MessageClass::SensorLog => DecodedBody::SensorLog(decode_object(payload, parsed.class)?),
        MessageClass::VehicleLog => DecodedBody::VehicleLog(decode_object(payload, parsed.class)?),
    };

    Ok(DecodedMessage {
        vehicle_code: parsed.vehicle_code,
        class: parsed.class,
        body,
    })
}

fn decode_object<T: serde::de::DeserializeOwned>(
    payload: &[u8],
    class: MessageClass,
) -> Result<T, DecodeError> {
    let value: serde_json::Value = serde_json::from_slice(payload)
        .map_err(|source| DecodeError::InvalidJson { class, source })?;

    if !value.is_object() {
        return Err(DecodeError::NotAnObject {
            class,
            found: json_type_name(&value),
        });
    }

    serde_json::from_value(value).map_err(|source| DecodeError::InvalidFields { class, source })
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use crate::protocol::DataValue;

    #[test]
    fn test_decode_raw_log_is_opaque_text() {
        let decoded = decode("seano/USV-01/raw_log", b"not { json", "seano").unwrap();
        assert_eq!(decoded.vehicle_code, "USV-01");
        assert_eq!(decoded.body, DecodedBody::RawLog("not { json".to_string()));
    }

    #[test]
    fn test_decode_sensor_log() {
        let decoded = decode(
            "seano/USV-01/sensor_log",
            br#"{"sensor_id": 3, "data": {"temp": 21.5}}"#,
            "seano",
        )
        .unwrap();

        match decoded.body {
            DecodedBody::SensorLog(payload) => {
                assert_eq!(payload.sensor_id, 3);
                assert_eq!(payload.data.get("temp"), Some(&DataValue::Float(21.5)));
            }
            other => panic!("expected sensor log, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_vehicle_log() {
        let decoded = decode(
            "seano/USV-01/vehicle_log",
            br#"{"speed": "2.5", "armed": false}"#,
            "seano",
        )
        .unwrap();

        match decoded.body {
            DecodedBody::VehicleLog(payload) => {
                assert_eq!(payload.speed, Some(2.5));
                assert_eq!(payload.armed, Some(false));
                assert_eq!(payload.latitude, None);
            }
            other => panic!("expected vehicle log, got {other:?}"),
        }
    }

    #[test]
    fn test_malformed_json_is_decode_error() {
        let err = decode("seano/USV-01/vehicle_log", b"{speed:", "seano").unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Decode(DecodeError::InvalidJson { .. })
        ));
    }

    #[test]
    fn test_non_object_payload_is_decode_error() {
        let err = decode("seano/USV-01/sensor_log", b"[1, 2]", "seano").unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Decode(DecodeError::NotAnObject { found: "array", .. })
        ));
    }

    #[test]
    fn test_missing_sensor_id_is_decode_error() {
        let err = decode("seano/USV-01/sensor_log", br#"{"data": {}}"#, "seano").unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Decode(DecodeError::InvalidFields { .. })
        ));
    }

    #[test]
    fn test_topic_errors_surface_before_payload() {
        let err = decode("seano/USV-01/battery", b"{", "seano").unwrap_err();
        assert_eq!(err.kind(), "unknown_class");

        let err = decode("seano/USV-01", b"{}", "seano").unwrap_err();
        assert_eq!(err.kind(), "malformed_topic");
    }
}
