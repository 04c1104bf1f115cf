//! Topic grammar for inbound telemetry
//!
//! Every message arrives on a topic shaped `<namespace>/<vehicle_code>/<class>`.
//! Subscriptions use the single-level wildcard in the vehicle position, e.g.
//! `seano/+/vehicle_log`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Default topic namespace
pub const DEFAULT_NAMESPACE: &str = "seano";

/// Errors raised while interpreting a topic string
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TopicError {
    #[error("topic '{topic}' has {segments} segments, expected 3")]
    WrongShape { topic: String, segments: usize },

    #[error("topic '{topic}' is outside namespace '{expected}'")]
    NamespaceMismatch { topic: String, expected: String },

    #[error("topic '{topic}' has an invalid vehicle code segment")]
    InvalidVehicleCode { topic: String },

    #[error("unknown message class '{class}' on topic '{topic}'")]
    UnknownClass { topic: String, class: String },

    #[error("subscription template '{template}' is invalid: {reason}")]
    InvalidTemplate { template: String, reason: String },
}

/// The three message classes the pipeline ingests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageClass {
    RawLog,
    SensorLog,
    VehicleLog,
}

impl MessageClass {
    pub const ALL: [MessageClass; 3] = [
        MessageClass::RawLog,
        MessageClass::SensorLog,
        MessageClass::VehicleLog,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageClass::RawLog => "raw_log",
            MessageClass::SensorLog => "sensor_log",
            MessageClass::VehicleLog => "vehicle_log",
        }
    }
}

impl fmt::Display for MessageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageClass {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "raw_log" => Ok(MessageClass::RawLog),
            "sensor_log" => Ok(MessageClass::SensorLog),
            "vehicle_log" => Ok(MessageClass::VehicleLog),
            _ => Err(()),
        }
    }
}

/// A topic split into its three meaningful parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTopic {
    pub namespace: String,
    pub vehicle_code: String,
    pub class: MessageClass,
}

/// Parse an inbound topic against the expected namespace.
///
/// Checks run in order: segment count, namespace, vehicle code, class. The
/// first failing check determines the error.
pub fn parse_topic(topic: &str, namespace: &str) -> Result<ParsedTopic, TopicError> {
    let segments: Vec<&str> = topic.split('/').collect();
    if segments.len() != 3 {
        return Err(TopicError::WrongShape {
            topic: topic.to_string(),
            segments: segments.len(),
        });
    }

    if segments[0] != namespace {
        return Err(TopicError::NamespaceMismatch {
            topic: topic.to_string(),
            expected: namespace.to_string(),
        });
    }

    let vehicle_code = segments[1];
    if !is_valid_code_segment(vehicle_code) {
        return Err(TopicError::InvalidVehicleCode {
            topic: topic.to_string(),
        });
    }

    let class = segments[2]
        .parse::<MessageClass>()
        .map_err(|_| TopicError::UnknownClass {
            topic: topic.to_string(),
            class: segments[2].to_string(),
        })?;

    Ok(ParsedTopic {
        namespace: namespace.to_string(),
        vehicle_code: vehicle_code.to_string(),
        class,
    })
}

fn is_valid_code_segment(segment: &str) -> bool {
    !segment.is_empty() && !segment.contains(['+', '#'])
}

/// Validated subscription filters, one per message class, sharing one namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicFilters {
    namespace: String,
    raw_log: String,
    sensor_log: String,
    vehicle_log: String,
}

impl TopicFilters {
    /// Build the default `<namespace>/+/<class>` filters
    pub fn for_namespace(namespace: &str) -> Result<Self, TopicError> {
        let template = |class: MessageClass| format!("{namespace}/+/{class}");
        Self::from_templates(
            &template(MessageClass::RawLog),
            &template(MessageClass::SensorLog),
            &template(MessageClass::VehicleLog),
        )
    }

    /// Validate explicit templates. Each must read `<namespace>/+/<class>` with
    /// the class matching its slot, and all three must share the namespace.
    pub fn from_templates(
        raw_log: &str,
        sensor_log: &str,
        vehicle_log: &str,
    ) -> Result<Self, TopicError> {
        let raw_ns = template_namespace(raw_log, MessageClass::RawLog)?;
        let sensor_ns = template_namespace(sensor_log, MessageClass::SensorLog)?;
        let vehicle_ns = template_namespace(vehicle_log, MessageClass::VehicleLog)?;

        for (template, ns) in [(sensor_log, sensor_ns), (vehicle_log, vehicle_ns)] {
            if ns != raw_ns {
                return Err(TopicError::InvalidTemplate {
                    template: template.to_string(),
                    reason: format!("namespace '{ns}' differs from '{raw_ns}'"),
                });
            }
        }

        Ok(Self {
            namespace: raw_ns.to_string(),
            raw_log: raw_log.to_string(),
            sensor_log: sensor_log.to_string(),
            vehicle_log: vehicle_log.to_string(),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn filter_for(&self, class: MessageClass) -> &str {
        match class {
            MessageClass::RawLog => &self.raw_log,
            MessageClass::SensorLog => &self.sensor_log,
            MessageClass::VehicleLog => &self.vehicle_log,
        }
    }

    /// All filters in subscription order
    pub fn all(&self) -> Vec<String> {
        MessageClass::ALL
            .iter()
            .map(|class| self.filter_for(*class).to_string())
            .collect()
    }
}

fn template_namespace(template: &str, class: MessageClass) -> Result<&str, TopicError> {
    let invalid = |reason: String| TopicError::InvalidTemplate {
        template: template.to_string(),
        reason,
    };

    let segments: Vec<&str> = template.split('/').collect();
    if segments.len() != 3 {
        return Err(invalid(format!("expected 3 segments, found {}", segments.len())));
    }
    if !is_valid_code_segment(segments[0]) {
        return Err(invalid("namespace segment must be a literal".to_string()));
    }
    if segments[1] != "+" {
        return Err(invalid("vehicle segment must be the '+' wildcard".to_string()));
    }
    if segments[2] != class.as_str() {
        return Err(invalid(format!("class segment must be '{class}'")));
    }

    Ok(segments[0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_valid_topics() {
        let parsed = parse_topic("seano/USV-01/vehicle_log", "seano").unwrap();
        assert_eq!(parsed.vehicle_code, "USV-01");
        assert_eq!(parsed.class, MessageClass::VehicleLog);

        let parsed = parse_topic("seano/USV-01/raw_log", "seano").unwrap();
        assert_eq!(parsed.class, MessageClass::RawLog);

        let parsed = parse_topic("seano/USV-01/sensor_log", "seano").unwrap();
        assert_eq!(parsed.class, MessageClass::SensorLog);
    }

    #[test]
    fn test_wrong_segment_count() {
        assert!(matches!(
            parse_topic("seano/USV-01", "seano"),
            Err(TopicError::WrongShape { segments: 2, .. })
        ));
        assert!(matches!(
            parse_topic("seano/USV-01/vehicle_log/extra", "seano"),
            Err(TopicError::WrongShape { segments: 4, .. })
        ));
    }

    #[test]
    fn test_namespace_mismatch_is_checked_before_class() {
        assert!(matches!(
            parse_topic("other/USV-01/unknown", "seano"),
            Err(TopicError::NamespaceMismatch { .. })
        ));
    }

    #[test]
    fn test_unknown_class() {
        let err = parse_topic("seano/USV-01/battery", "seano").unwrap_err();
        assert_eq!(
            err,
            TopicError::UnknownClass {
                topic: "seano/USV-01/battery".to_string(),
                class: "battery".to_string(),
            }
        );
    }

    #[test]
    fn test_empty_or_wildcard_vehicle_code() {
        assert!(matches!(
            parse_topic("seano//vehicle_log", "seano"),
            Err(TopicError::InvalidVehicleCode { .. })
        ));
        assert!(matches!(
            parse_topic("seano/+/vehicle_log", "seano"),
            Err(TopicError::InvalidVehicleCode { .. })
        ));
    }

    #[test]
    fn test_default_filters() {
        let filters = TopicFilters::for_namespace("seano").unwrap();
        assert_eq!(
            filters.all(),
            vec![
                "seano/+/raw_log".to_string(),
                "seano/+/sensor_log".to_string(),
                "seano/+/vehicle_log".to_string(),
            ]
        );
        assert_eq!(filters.namespace(), "seano");
    }

    #[test]
    fn test_templates_must_share_namespace() {
        let err = TopicFilters::from_templates(
            "seano/+/raw_log",
            "fleet/+/sensor_log",
            "seano/+/vehicle_log",
        )
        .unwrap_err();
        assert!(matches!(err, TopicError::InvalidTemplate { .. }));
    }

    #[test]
    fn test_template_class_must_match_slot() {
        let err = TopicFilters::from_templates(
            "seano/+/vehicle_log",
            "seano/+/sensor_log",
            "seano/+/vehicle_log",
        )
        .unwrap_err();
        assert!(err.to_string().contains("raw_log"));
    }

    #[test]
    fn test_template_requires_wildcard() {
        assert!(TopicFilters::from_templates(
            "seano/USV-01/raw_log",
            "seano/+/sensor_log",
            "seano/+/vehicle_log",
        )
        .is_err());
    }

    proptest! {
        #[test]
        fn prop_well_formed_topics_parse(code in "[A-Za-z0-9_-]{1,24}", idx in 0usize..3) {
            let class = MessageClass::ALL[idx];
            let topic = format!("seano/{code}/{class}");
            let parsed = parse_topic(&topic, "seano").unwrap();
            prop_assert_eq!(parsed.vehicle_code, code);
            prop_assert_eq!(parsed.class, class);
        }

        #[test]
        fn prop_parse_never_panics(topic in ".{0,64}") {
            let _ = parse_topic(&topic, "seano");
        }
    }
}
