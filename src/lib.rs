//! Seano telemetry ingestion pipeline
//!
//! Devices publish on `<namespace>/<vehicle_code>/<class>` where class is one
//! of `raw_log`, `sensor_log` or `vehicle_log`. Each message is decoded,
//! resolved to a vehicle id, written in its own unit of work and then fanned
//! out to websocket observers. A liveness monitor periodically broadcasts the
//! connected/disconnected status of every installed sensor.
//!
//! ```text
//! MqttSubscriber -> IngestionLoop -> IngestProcessor -> TelemetryStore
//!                                          |
//!                                          v
//!            LivenessMonitor -----> BroadcastRegistry -> /ws observers
//! ```
//!
//! # Quick Start
//!
//! ```rust
//! use seano_ingest::processing::{decode, DecodedBody};
//!
//! let message = decode("seano/USV-01/sensor_log", br#"{"sensor_id": 4, "data": {"t": 21.5}}"#, "seano")
//!     .unwrap();
//! assert_eq!(message.vehicle_code, "USV-01");
//! assert!(matches!(message.body, DecodedBody::SensorLog(_)));
//! ```

pub mod broadcast;
pub mod config;
pub mod error;
pub mod ingestion;
pub mod liveness;
pub mod observability;
pub mod pipeline;
pub mod processing;
pub mod protocol;
pub mod server;
pub mod store;
pub mod task;
pub mod testing;
pub mod transport;

pub use config::{ConfigError, PipelineConfig};
pub use error::{PipelineError, PipelineResult};
pub use pipeline::{Pipeline, StartupError};
pub use protocol::*;
pub use transport::mqtt::MqttSubscriber;
