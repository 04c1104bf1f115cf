//! Vehicle code to internal id resolution
//!
//! Codes are immutable once assigned, so positive lookups may be cached.
//! Misses are never cached: a vehicle provisioned later must resolve on its
//! next message.

use crate::error::{PipelineError, PipelineResult};
use crate::protocol::VehicleId;
use crate::store::EntityStore;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

pub struct EntityResolver {
    store: Arc<dyn EntityStore>,
    cache: Option<Mutex<PositiveCache>>,
}

struct PositiveCache {
    capacity: usize,
    entries: HashMap<String, VehicleId>,
    order: VecDeque<String>,
}

impl PositiveCache {
    fn get(&self, code: &str) -> Option<VehicleId> {
        self.entries.get(code).copied()
    }

    fn insert(&mut self, code: &str, id: VehicleId) {
        if self.entries.insert(code.to_string(), id).is_some() {
            return;
        }
        self.order.push_back(code.to_string());
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.entries.remove(&evicted);
            }
        }
    }
}

impl EntityResolver {
    /// Resolver that queries the store for every message
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store, cache: None }
    }

    /// Resolver with a bounded FIFO cache of successful lookups. Zero disables caching.
    pub fn with_cache(store: Arc<dyn EntityStore>, capacity: usize) -> Self {
        let cache = (capacity > 0).then(|| {
            Mutex::new(PositiveCache {
                capacity,
                entries: HashMap::new(),
                order: VecDeque::new(),
            })
        });
        Self { store, cache }
    }

    pub async fn resolve(&self, vehicle_code: &str) -> PipelineResult<VehicleId> {
        if let Some(cache) = &self.cache {
            let cached = cache
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(vehicle_code);
            if let Some(id) = cached {
                return Ok(id);
            }
        }

        let id = self
            .store
            .find_vehicle_id(vehicle_code)
            .await?
            .ok_or_else(|| PipelineError::resolution_not_found(vehicle_code))?;

        debug!(vehicle_code, vehicle_id = id, "Resolved vehicle");
        if let Some(cache) = &self.cache {
            cache
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(vehicle_code, id);
        }
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    #[tokio::test]
    async fn test_resolve_found_and_missing() {
        let store = InMemoryStore::new();
        store.add_vehicle(7, "USV-07");
        let resolver = EntityResolver::new(Arc::new(store.clone()));

        assert_eq!(resolver.resolve("USV-07").await.unwrap(), 7);
        let err = resolver.resolve("USV-99").await.unwrap_err();
        assert!(matches!(err, PipelineError::ResolutionNotFound { .. }));
    }

    #[tokio::test]
    async fn test_uncached_resolver_queries_every_time() {
        let store = InMemoryStore::new();
        store.add_vehicle(7, "USV-07");
        let resolver = EntityResolver::new(Arc::new(store.clone()));

        resolver.resolve("USV-07").await.unwrap();
        resolver.resolve("USV-07").await.unwrap();
        assert_eq!(store.vehicle_lookups(), 2);
    }

    #[tokio::test]
    async fn test_cache_hits_skip_store() {
        let store = InMemoryStore::new();
        store.add_vehicle(7, "USV-07");
        let resolver = EntityResolver::with_cache(Arc::new(store.clone()), 4);

        resolver.resolve("USV-07").await.unwrap();
        resolver.resolve("USV-07").await.unwrap();
        assert_eq!(store.vehicle_lookups(), 1);
    }

    #[tokio::test]
    async fn test_misses_are_not_cached() {
        let store = InMemoryStore::new();
        let resolver = EntityResolver::with_cache(Arc::new(store.clone()), 4);

        assert!(resolver.resolve("USV-08").await.is_err());
        store.add_vehicle(8, "USV-08");
        assert_eq!(resolver.resolve("USV-08").await.unwrap(), 8);
    }

    #[tokio::test]
    async fn test_cache_evicts_oldest() {
        let store = InMemoryStore::new();
        store.add_vehicle(1, "A");
        store.add_vehicle(2, "B");
        let resolver = EntityResolver::with_cache(Arc::new(store.clone()), 1);

        resolver.resolve("A").await.unwrap();
        resolver.resolve("B").await.unwrap();
        resolver.resolve("A").await.unwrap();
        assert_eq!(store.vehicle_lookups(), 3);
    }
}
