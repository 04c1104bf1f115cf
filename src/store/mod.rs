//! Persistence boundary
//!
//! The pipeline only sees the narrow traits defined here. Each inbound message
//! acquires one [`UnitOfWork`], performs its writes and commits. A unit dropped
//! without commit discards its writes and its underlying session.

pub mod memory;
pub mod postgres;

use crate::protocol::{DataValue, SensorId, TelemetryPayload, VehicleId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub use memory::InMemoryStore;
pub use postgres::PostgresStore;

/// Storage failures
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database query failed: {0}")]
    Query(#[from] tokio_postgres::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("storage configuration error: {0}")]
    Config(String),

    #[error("unit of work already finished")]
    Finished,

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    pub fn backend<S: Into<String>>(message: S) -> Self {
        StorageError::Backend(message.into())
    }
}

/// Stored form of a `raw_log` message: the serialized envelope text
#[derive(Debug, Clone, PartialEq)]
pub struct RawLogRecord {
    pub vehicle_id: VehicleId,
    pub logs: String,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SensorLogRecord {
    pub vehicle_id: VehicleId,
    pub sensor_id: SensorId,
    pub data: DataValue,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryRecord {
    pub vehicle_id: VehicleId,
    pub telemetry: TelemetryPayload,
    pub received_at: DateTime<Utc>,
}

/// An installed vehicle-sensor link with its freshness timestamp
#[derive(Debug, Clone, PartialEq)]
pub struct InstalledLink {
    pub vehicle_id: VehicleId,
    pub vehicle_code: String,
    pub sensor_id: SensorId,
    pub sensor_code: String,
    pub sensor_name: Option<String>,
    pub last_seen_at: Option<DateTime<Utc>>,
}

/// Read-only lookup of vehicles by external code
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn find_vehicle_id(&self, vehicle_code: &str) -> Result<Option<VehicleId>, StorageError>;
}

/// Telemetry writes and link reads
#[async_trait]
pub trait TelemetryStore: Send + Sync {
    /// Acquire a fresh unit of work. Sessions are never shared between units.
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StorageError>;

    async fn list_installed_links(&self) -> Result<Vec<InstalledLink>, StorageError>;
}

/// Writes for a single inbound message, applied atomically on commit
#[async_trait]
pub trait UnitOfWork: Send {
    async fn append_raw_log(&mut self, record: RawLogRecord) -> Result<(), StorageError>;

    async fn append_sensor_log(&mut self, record: SensorLogRecord) -> Result<(), StorageError>;

    async fn append_telemetry(&mut self, record: TelemetryRecord) -> Result<(), StorageError>;

    /// Bump `last_seen_at` on installed links of a vehicle. With `sensor_id`
    /// only that link is touched, otherwise every installed link of the
    /// vehicle. Returns the number of links updated.
    async fn touch_last_seen(
        &mut self,
        vehicle_id: VehicleId,
        sensor_id: Option<SensorId>,
        at: DateTime<Utc>,
    ) -> Result<u64, StorageError>;

    async fn commit(self: Box<Self>) -> Result<(), StorageError>;
}
