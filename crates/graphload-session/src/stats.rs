//! Load statistics collected by a session factory.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::Serialize;

/// Per-region shared cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegionStatistics {
    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
}

/// Point-in-time copy of [`Statistics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatisticsSnapshot {
    pub entity_loads: u64,
    pub entity_fetches: u64,
    pub collection_loads: u64,
    pub collection_fetches: u64,
    pub statements: u64,
    pub natural_id_queries: u64,
    pub optimistic_failures: u64,
    pub regions: HashMap<String, RegionStatistics>,
}

impl StatisticsSnapshot {
    pub fn region(&self, name: &str) -> RegionStatistics {
        self.regions.get(name).copied().unwrap_or_default()
    }
}

/// Thread-safe counters; recording is a no-op while disabled.
#[derive(Debug, Default)]
pub struct Statistics {
    enabled: AtomicBool,
    entity_loads: AtomicU64,
    entity_fetches: AtomicU64,
    collection_loads: AtomicU64,
    collection_fetches: AtomicU64,
    statements: AtomicU64,
    natural_id_queries: AtomicU64,
    optimistic_failures: AtomicU64,
    regions: Mutex<HashMap<String, RegionStatistics>>,
}

impl Statistics {
    pub fn new(enabled: bool) -> Self {
        let stats = Self::default();
        stats.enabled.store(enabled, Ordering::Relaxed);
        stats
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    fn bump(&self, counter: &AtomicU64) {
        if self.is_enabled() {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// An entity was materialized from a row or the shared cache.
    pub fn entity_loaded(&self, entity: &str) {
        tracing::trace!(entity, "entity loaded");
        self.bump(&self.entity_loads);
    }

    /// An entity was fetched by a dedicated statement.
    pub fn entity_fetched(&self, entity: &str) {
        tracing::trace!(entity, "entity fetched");
        self.bump(&self.entity_fetches);
    }

    pub fn collection_loaded(&self, role: &str) {
        tracing::trace!(role, "collection loaded");
        self.bump(&self.collection_loads);
    }

    pub fn collection_fetched(&self, role: &str) {
        tracing::trace!(role, "collection fetched");
        self.bump(&self.collection_fetches);
    }

    pub fn statement_executed(&self) {
        self.bump(&self.statements);
    }

    pub fn natural_id_query(&self) {
        self.bump(&self.natural_id_queries);
    }

    pub fn optimistic_failure(&self, entity: &str) {
        tracing::debug!(entity, "optimistic lock failure");
        self.bump(&self.optimistic_failures);
    }

    fn with_region(&self, region: &str, f: impl FnOnce(&mut RegionStatistics)) {
        if !self.is_enabled() {
            return;
        }
        let mut regions = self.regions.lock().unwrap_or_else(PoisonError::into_inner);
        f(regions.entry(region.to_string()).or_default());
    }

    pub fn cache_hit(&self, region: &str) {
        self.with_region(region, |r| r.hits += 1);
    }

    pub fn cache_miss(&self, region: &str) {
        self.with_region(region, |r| r.misses += 1);
    }

    pub fn cache_put(&self, region: &str) {
        self.with_region(region, |r| r.puts += 1);
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            entity_loads: self.entity_loads.load(Ordering::Relaxed),
            entity_fetches: self.entity_fetches.load(Ordering::Relaxed),
            collection_loads: self.collection_loads.load(Ordering::Relaxed),
            collection_fetches: self.collection_fetches.load(Ordering::Relaxed),
            statements: self.statements.load(Ordering::Relaxed),
            natural_id_queries: self.natural_id_queries.load(Ordering::Relaxed),
            optimistic_failures: self.optimistic_failures.load(Ordering::Relaxed),
            regions: self
                .regions
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }

    pub fn clear(&self) {
        for counter in [
            &self.entity_loads,
            &self.entity_fetches,
            &self.collection_loads,
            &self.collection_fetches,
            &self.statements,
            &self.natural_id_queries,
            &self.optimistic_failures,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.regions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_statistics_record_nothing() {
        let stats = Statistics::new(false);
        stats.entity_loaded("Customer");
        stats.cache_hit("customers");
        assert_eq!(stats.snapshot(), StatisticsSnapshot::default());
    }

    #[test]
    fn counters_and_regions() {
        let stats = Statistics::new(true);
        stats.entity_loaded("Customer");
        stats.entity_loaded("Customer");
        stats.statement_executed();
        stats.cache_miss("customers");
        stats.cache_put("customers");
        stats.cache_hit("customers");
        let snap = stats.snapshot();
        assert_eq!(snap.entity_loads, 2);
        assert_eq!(snap.statements, 1);
        assert_eq!(
            snap.region("customers"),
            RegionStatistics {
                hits: 1,
                misses: 1,
                puts: 1
            }
        );
        stats.clear();
        assert_eq!(stats.snapshot().entity_loads, 0);
    }

    #[test]
    fn snapshot_serializes() {
        let stats = Statistics::new(true);
        stats.collection_loaded("Customer.orders");
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["collection_loads"], 1);
    }
}
