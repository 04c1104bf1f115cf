//! PostgreSQL store over the fleet schema
//!
//! Tables used: `vehicles(id, code)`, `sensors(id, code, name)`,
//! `vehicle_sensors(vehicle_id, sensor_id, is_installed, last_seen_at)`,
//! `raw_logs(logs, created_at)`, `sensor_logs(vehicle_id, sensor_id, data,
//! created_at)` and `vehicle_logs`.

use super::{
    EntityStore, InstalledLink, RawLogRecord, SensorLogRecord, StorageError, TelemetryRecord,
    TelemetryStore, UnitOfWork,
};
use crate::protocol::{SensorId, VehicleId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config, ManagerConfig, Object, Pool, PoolConfig, RecyclingMethod, Runtime};
use tokio_postgres::NoTls;
use tracing::{debug, warn};

const INSERT_VEHICLE_LOG: &str = "INSERT INTO vehicle_logs (
        vehicle_id, battery_voltage, battery_current, rssi, mode, latitude, longitude,
        altitude, gps_fix, heading, speed, roll, pitch, yaw, temperature, armed, guided,
        system_status, created_at
    ) VALUES (
        $1::int8, $2::float8, $3::float8, $4::int4, $5::text, $6::float8, $7::float8,
        $8::float8, $9::int4, $10::float8, $11::float8, $12::float8, $13::float8, $14::float8,
        $15::float8, COALESCE($16::bool, FALSE), COALESCE($17::bool, FALSE), $18::text,
        $19::timestamptz
    )";

/// Connection-pooled PostgreSQL implementation of the store traits
#[derive(Clone)]
pub struct PostgresStore {
    pool: Pool,
}

impl PostgresStore {
    /// Build a pool from a `postgres://` URL. No connection is opened until first use.
    pub fn connect(url: &str, max_pool_size: usize) -> Result<Self, StorageError> {
        let mut cfg = Config::new();
        cfg.url = Some(url.to_string());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        cfg.pool = Some(PoolConfig::new(max_pool_size.max(1)));

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| StorageError::Config(e.to_string()))?;

        Ok(Self { pool })
    }

    /// Verify the database is reachable
    pub async fn ping(&self) -> Result<(), StorageError> {
        let client = self.pool.get().await?;
        client.execute("SELECT 1", &[]).await?;
        debug!("PostgreSQL connection successful");
        Ok(())
    }
}

#[async_trait]
impl EntityStore for PostgresStore {
    async fn find_vehicle_id(&self, vehicle_code: &str) -> Result<Option<VehicleId>, StorageError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT id::int8 FROM vehicles WHERE code = $1",
                &[&vehicle_code],
            )
            .await?;
        Ok(row.map(|row| row.get(0)))
    }
}

#[async_trait]
impl TelemetryStore for PostgresStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StorageError> {
        let client = self.pool.get().await?;
        if let Err(e) = client.batch_execute("BEGIN").await {
            // The session state is unknown; never hand it back to the pool.
            let _ = Object::take(client);
            return Err(e.into());
        }
        Ok(Box::new(PostgresUnitOfWork {
            client: Some(client),
        }))
    }

    async fn list_installed_links(&self) -> Result<Vec<InstalledLink>, StorageError> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT vs.vehicle_id::int8, v.code, vs.sensor_id::int8, s.code, s.name,
                        vs.last_seen_at
                 FROM vehicle_sensors vs
                 JOIN vehicles v ON v.id = vs.vehicle_id
                 JOIN sensors s ON s.id = vs.sensor_id
                 WHERE vs.is_installed = TRUE
                 ORDER BY vs.vehicle_id, vs.sensor_id",
                &[],
            )
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| InstalledLink {
                vehicle_id: row.get(0),
                vehicle_code: row.get(1),
                sensor_id: row.get(2),
                sensor_code: row.get(3),
                sensor_name: row.get(4),
                last_seen_at: row.get(5),
            })
            .collect())
    }
}

/// One transaction on a dedicated pooled connection
struct PostgresUnitOfWork {
    client: Option<Object>,
}

impl PostgresUnitOfWork {
    fn client(&self) -> Result<&Object, StorageError> {
        self.client.as_ref().ok_or(StorageError::Finished)
    }
}

#[async_trait]
impl UnitOfWork for PostgresUnitOfWork {
    async fn append_raw_log(&mut self, record: RawLogRecord) -> Result<(), StorageError> {
        self.client()?
            .execute(
                "INSERT INTO raw_logs (logs, created_at) VALUES ($1, $2)",
                &[&record.logs, &record.received_at],
            )
            .await?;
        Ok(())
    }

    async fn append_sensor_log(&mut self, record: SensorLogRecord) -> Result<(), StorageError> {
        let data = record.data.to_json();
        self.client()?
            .execute(
                "INSERT INTO sensor_logs (vehicle_id, sensor_id, data, created_at)
                 VALUES ($1::int8, $2::int8, $3::jsonb, $4)",
                &[
                    &record.vehicle_id,
                    &record.sensor_id,
                    &data,
                    &record.received_at,
                ],
            )
            .await?;
        Ok(())
    }

    async fn append_telemetry(&mut self, record: TelemetryRecord) -> Result<(), StorageError> {
        let t = &record.telemetry;
        self.client()?
            .execute(
                INSERT_VEHICLE_LOG,
                &[
                    &record.vehicle_id,
                    &t.battery_voltage,
                    &t.battery_current,
                    &t.rssi,
                    &t.mode,
                    &t.latitude,
                    &t.longitude,
                    &t.altitude,
                    &t.gps_fix,
                    &t.heading,
                    &t.speed,
                    &t.roll,
                    &t.pitch,
                    &t.yaw,
                    &t.temperature,
                    &t.armed,
                    &t.guided,
                    &t.system_status,
                    &record.received_at,
                ],
            )
            .await?;
        Ok(())
    }

    async fn touch_last_seen(
        &mut self,
        vehicle_id: VehicleId,
        sensor_id: Option<SensorId>,
        at: DateTime<Utc>,
    ) -> Result<u64, StorageError> {
        let updated = self
            .client()?
            .execute(
                "UPDATE vehicle_sensors SET last_seen_at = $3
                 WHERE vehicle_id = $1::int8
                   AND is_installed = TRUE
                   AND ($2::int8 IS NULL OR sensor_id = $2::int8)",
                &[&vehicle_id, &sensor_id, &at],
            )
            .await?;
        Ok(updated)
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        let client = self.client.take().ok_or(StorageError::Finished)?;
        match client.batch_execute("COMMIT").await {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = Object::take(client);
                Err(e.into())
            }
        }
    }
}

impl Drop for PostgresUnitOfWork {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            // Detach instead of returning an open transaction to the pool.
            warn!("Discarding uncommitted database session");
            let _ = Object::take(client);
        }
    }
}
