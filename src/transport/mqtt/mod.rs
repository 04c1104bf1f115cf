//! MQTT subscriber for the telemetry topics
//!
//! - [`connection`] - pure option building from config
//! - [`events`] - pure routing of rumqttc events
//! - [`subscriber`] - the I/O side implementing `MessageTransport`

pub mod connection;
pub mod events;
pub mod subscriber;

pub use connection::{configure_mqtt_options, parse_broker_url, BrokerEndpoint};
pub use events::{route_event, EventRoute};
pub use subscriber::MqttSubscriber;
