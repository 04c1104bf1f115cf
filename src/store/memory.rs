//! In-memory store used by `--in-memory` runs and tests
//!
//! Writes are staged inside the unit of work and applied under one lock on
//! commit, so a dropped unit leaves no trace.

use super::{
    EntityStore, InstalledLink, RawLogRecord, SensorLogRecord, StorageError, TelemetryRecord,
    TelemetryStore, UnitOfWork,
};
use crate::protocol::{SensorId, VehicleId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone)]
struct SensorRow {
    code: String,
    name: Option<String>,
}

#[derive(Debug, Clone)]
struct LinkRow {
    vehicle_id: VehicleId,
    sensor_id: SensorId,
    is_installed: bool,
    last_seen_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct State {
    vehicles: HashMap<String, VehicleId>,
    sensors: HashMap<SensorId, SensorRow>,
    links: Vec<LinkRow>,
    raw_logs: Vec<RawLogRecord>,
    sensor_logs: Vec<SensorLogRecord>,
    telemetry: Vec<TelemetryRecord>,
    vehicle_lookups: u64,
    failing_writes: u32,
    failing_link_reads: u32,
    discarded_units: u64,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_vehicle(&self, vehicle_id: VehicleId, code: &str) {
        self.lock().vehicles.insert(code.to_string(), vehicle_id);
    }

    pub fn add_sensor(&self, sensor_id: SensorId, code: &str, name: Option<&str>) {
        self.lock().sensors.insert(
            sensor_id,
            SensorRow {
                code: code.to_string(),
                name: name.map(str::to_string),
            },
        );
    }

    pub fn install_sensor(
        &self,
        vehicle_id: VehicleId,
        sensor_id: SensorId,
        last_seen_at: Option<DateTime<Utc>>,
    ) {
        let mut state = self.lock();
        state
            .links
            .retain(|l| !(l.vehicle_id == vehicle_id && l.sensor_id == sensor_id));
        state.links.push(LinkRow {
            vehicle_id,
            sensor_id,
            is_installed: true,
            last_seen_at,
        });
    }

    pub fn remove_sensor(&self, vehicle_id: VehicleId, sensor_id: SensorId) {
        for link in self.lock().links.iter_mut() {
            if link.vehicle_id == vehicle_id && link.sensor_id == sensor_id {
                link.is_installed = false;
            }
        }
    }

    /// Make the next `count` write operations fail
    pub fn fail_next_writes(&self, count: u32) {
        self.lock().failing_writes = count;
    }

    /// Make the next `count` link listings fail
    pub fn fail_next_link_reads(&self, count: u32) {
        self.lock().failing_link_reads = count;
    }

    pub fn raw_logs(&self) -> Vec<RawLogRecord> {
        self.lock().raw_logs.clone()
    }

    pub fn sensor_logs(&self) -> Vec<SensorLogRecord> {
        self.lock().sensor_logs.clone()
    }

    pub fn telemetry(&self) -> Vec<TelemetryRecord> {
        self.lock().telemetry.clone()
    }

    /// Total committed records across all three classes
    pub fn record_count(&self) -> usize {
        let state = self.lock();
        state.raw_logs.len() + state.sensor_logs.len() + state.telemetry.len()
    }

    pub fn vehicle_lookups(&self) -> u64 {
        self.lock().vehicle_lookups
    }

    /// Units of work dropped without commit
    pub fn discarded_units(&self) -> u64 {
        self.lock().discarded_units
    }

    pub fn last_seen(&self, vehicle_id: VehicleId, sensor_id: SensorId) -> Option<DateTime<Utc>> {
        self.lock()
            .links
            .iter()
            .find(|l| l.vehicle_id == vehicle_id && l.sensor_id == sensor_id)
            .and_then(|l| l.last_seen_at)
    }

    fn vehicle_code(state: &State, vehicle_id: VehicleId) -> Option<String> {
        state
            .vehicles
            .iter()
            .find(|(_, id)| **id == vehicle_id)
            .map(|(code, _)| code.clone())
    }
}

#[async_trait]
impl EntityStore for InMemoryStore {
    async fn find_vehicle_id(&self, vehicle_code: &str) -> Result<Option<VehicleId>, StorageError> {
        let mut state = self.lock();
        state.vehicle_lookups += 1;
        Ok(state.vehicles.get(vehicle_code).copied())
    }
}

#[async_trait]
impl TelemetryStore for InMemoryStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StorageError> {
        Ok(Box::new(MemoryUnitOfWork {
            store: self.clone(),
            staged: Vec::new(),
            committed: false,
        }))
    }

    async fn list_installed_links(&self) -> Result<Vec<InstalledLink>, StorageError> {
        let mut state = self.lock();
        if state.failing_link_reads > 0 {
            state.failing_link_reads -= 1;
            return Err(StorageError::backend("injected link read failure"));
        }

        let mut links: Vec<InstalledLink> = state
            .links
            .iter()
            .filter(|l| l.is_installed)
            .filter_map(|l| {
                let vehicle_code = Self::vehicle_code(&state, l.vehicle_id)?;
                let sensor = state.sensors.get(&l.sensor_id)?;
                Some(InstalledLink {
                    vehicle_id: l.vehicle_id,
                    vehicle_code,
                    sensor_id: l.sensor_id,
                    sensor_code: sensor.code.clone(),
                    sensor_name: sensor.name.clone(),
                    last_seen_at: l.last_seen_at,
                })
            })
            .collect();
        links.sort_by_key(|l| (l.vehicle_id, l.sensor_id));
        Ok(links)
    }
}

enum StagedWrite {
    Raw(RawLogRecord),
    Sensor(SensorLogRecord),
    Telemetry(TelemetryRecord),
    Touch {
        vehicle_id: VehicleId,
        sensor_id: Option<SensorId>,
        at: DateTime<Utc>,
    },
}

struct MemoryUnitOfWork {
    store: InMemoryStore,
    staged: Vec<StagedWrite>,
    committed: bool,
}

impl MemoryUnitOfWork {
    fn check_injected_failure(&self) -> Result<(), StorageError> {
        let mut state = self.store.lock();
        if state.failing_writes > 0 {
            state.failing_writes -= 1;
            return Err(StorageError::backend("injected write failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn append_raw_log(&mut self, record: RawLogRecord) -> Result<(), StorageError> {
        self.check_injected_failure()?;
        self.staged.push(StagedWrite::Raw(record));
        Ok(())
    }

    async fn append_sensor_log(&mut self, record: SensorLogRecord) -> Result<(), StorageError> {
        self.check_injected_failure()?;
        self.staged.push(StagedWrite::Sensor(record));
        Ok(())
    }

    async fn append_telemetry(&mut self, record: TelemetryRecord) -> Result<(), StorageError> {
        self.check_injected_failure()?;
        self.staged.push(StagedWrite::Telemetry(record));
        Ok(())
    }

    async fn touch_last_seen(
        &mut self,
        vehicle_id: VehicleId,
        sensor_id: Option<SensorId>,
        at: DateTime<Utc>,
    ) -> Result<u64, StorageError> {
        let matching = self
            .store
            .lock()
            .links
            .iter()
            .filter(|l| {
                l.is_installed
                    && l.vehicle_id == vehicle_id
                    && sensor_id.map_or(true, |s| l.sensor_id == s)
            })
            .count() as u64;
        self.staged.push(StagedWrite::Touch {
            vehicle_id,
            sensor_id,
            at,
        });
        Ok(matching)
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        let staged = std::mem::take(&mut self.staged);
        let mut state = self.store.lock();
        for write in staged {
            match write {
                StagedWrite::Raw(record) => state.raw_logs.push(record),
                StagedWrite::Sensor(record) => state.sensor_logs.push(record),
                StagedWrite::Telemetry(record) => state.telemetry.push(record),
                StagedWrite::Touch {
                    vehicle_id,
                    sensor_id,
                    at,
                } => {
                    for link in state.links.iter_mut().filter(|l| {
                        l.is_installed
                            && l.vehicle_id == vehicle_id
                            && sensor_id.map_or(true, |s| l.sensor_id == s)
                    }) {
                        link.last_seen_at = Some(at);
                    }
                }
            }
        }
        drop(state);
        self.committed = true;
        Ok(())
    }
}

impl Drop for MemoryUnitOfWork {
    fn drop(&mut self) {
        if !self.committed {
            self.store.lock().discarded_units += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TelemetryPayload;

    fn telemetry(vehicle_id: VehicleId) -> TelemetryRecord {
        TelemetryRecord {
            vehicle_id,
            telemetry: TelemetryPayload::default(),
            received_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_commit_applies_staged_writes() {
        let store = InMemoryStore::new();
        let mut uow = store.begin().await.unwrap();
        uow.append_telemetry(telemetry(1)).await.unwrap();
        assert!(store.telemetry().is_empty());

        uow.commit().await.unwrap();
        assert_eq!(store.telemetry().len(), 1);
        assert_eq!(store.discarded_units(), 0);
    }

    #[tokio::test]
    async fn test_dropped_unit_discards_writes() {
        let store = InMemoryStore::new();
        {
            let mut uow = store.begin().await.unwrap();
            uow.append_telemetry(telemetry(1)).await.unwrap();
        }
        assert!(store.telemetry().is_empty());
        assert_eq!(store.discarded_units(), 1);
    }

    #[tokio::test]
    async fn test_injected_write_failure() {
        let store = InMemoryStore::new();
        store.fail_next_writes(1);

        let mut uow = store.begin().await.unwrap();
        assert!(uow.append_telemetry(telemetry(1)).await.is_err());

        let mut uow = store.begin().await.unwrap();
        assert!(uow.append_telemetry(telemetry(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_touch_last_seen_scopes() {
        let store = InMemoryStore::new();
        store.add_vehicle(1, "USV-01");
        store.add_sensor(10, "CTD", None);
        store.add_sensor(11, "GPS", Some("Primary GPS"));
        store.install_sensor(1, 10, None);
        store.install_sensor(1, 11, None);
        let at = Utc::now();

        let mut uow = store.begin().await.unwrap();
        assert_eq!(uow.touch_last_seen(1, Some(10), at).await.unwrap(), 1);
        uow.commit().await.unwrap();
        assert_eq!(store.last_seen(1, 10), Some(at));
        assert_eq!(store.last_seen(1, 11), None);

        let mut uow = store.begin().await.unwrap();
        assert_eq!(uow.touch_last_seen(1, None, at).await.unwrap(), 2);
        uow.commit().await.unwrap();
        assert_eq!(store.last_seen(1, 11), Some(at));
    }

    #[tokio::test]
    async fn test_list_installed_links_skips_removed() {
        let store = InMemoryStore::new();
        store.add_vehicle(1, "USV-01");
        store.add_sensor(10, "CTD", Some("Conductivity"));
        store.add_sensor(11, "GPS", None);
        store.install_sensor(1, 10, None);
        store.install_sensor(1, 11, None);
        store.remove_sensor(1, 11);

        let links = store.list_installed_links().await.unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].sensor_code, "CTD");
        assert_eq!(links[0].vehicle_code, "USV-01");
        assert_eq!(links[0].sensor_name.as_deref(), Some("Conductivity"));
    }

    #[tokio::test]
    async fn test_vehicle_lookup_counts() {
        let store = InMemoryStore::new();
        store.add_vehicle(3, "USV-03");
        assert_eq!(store.find_vehicle_id("USV-03").await.unwrap(), Some(3));
        assert_eq!(store.find_vehicle_id("nope").await.unwrap(), None);
        assert_eq!(store.vehicle_lookups(), 2);
    }
}
