//! Per-entity cache of compiled by-id statements.
//!
//! Statements are shared between sessions, so they are only cached when
//! nothing session-specific shaped them: no enabled filter touching the
//! entity, no entity graph, no fetch profile overriding one of its
//! associations and no lock timeout. Within those bounds a statement is
//! keyed by lock mode (or internal cascade profile) and batch size.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use graphload_core::{
    CascadeProfile, LoadQueryInfluencers, LockMode, LockOptions, MappingMetamodel, Result,
};
use graphload_query::CompiledLoadQuery;

#[derive(Debug)]
pub struct EntityLoader {
    entity: String,
    by_lock: RwLock<HashMap<(LockMode, usize), Arc<CompiledLoadQuery>>>,
    by_profile: RwLock<HashMap<(CascadeProfile, usize), Arc<CompiledLoadQuery>>>,
}

impl EntityLoader {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            by_lock: RwLock::new(HashMap::new()),
            by_profile: RwLock::new(HashMap::new()),
        }
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// Number of cached statements.
    pub fn len(&self) -> usize {
        self.by_lock.read().unwrap_or_else(PoisonError::into_inner).len()
            + self
                .by_profile
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Why a load must compile a statement of its own, if it must.
    fn bypass_reason(
        &self,
        metamodel: &MappingMetamodel,
        influencers: &LoadQueryInfluencers,
        lock: &LockOptions,
    ) -> Option<&'static str> {
        if influencers.filters_affect_entity(metamodel, &self.entity) {
            Some("enabled filters")
        } else if influencers.entity_graph().is_some() {
            Some("entity graph")
        } else if influencers.fetch_profiles_affect_entity(metamodel, &self.entity) {
            Some("fetch profiles")
        } else if !lock.is_wait_forever() || !lock.alias_modes.is_empty() {
            Some("lock options")
        } else {
            None
        }
    }

    /// The statement for a by-id load of `batch_size` keys, compiling it
    /// with `compile` when no reusable statement exists.
    pub fn query(
        &self,
        metamodel: &MappingMetamodel,
        influencers: &LoadQueryInfluencers,
        lock: &LockOptions,
        batch_size: usize,
        compile: impl FnOnce() -> Result<CompiledLoadQuery>,
    ) -> Result<Arc<CompiledLoadQuery>> {
        if let Some(reason) = self.bypass_reason(metamodel, influencers, lock) {
            tracing::debug!(entity = %self.entity, reason, "Compiling uncached entity statement");
            return compile().map(Arc::new);
        }

        if let Some(profile) = influencers.internal_fetch_profile() {
            let key = (profile, batch_size);
            if let Some(query) = self
                .by_profile
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&key)
            {
                tracing::debug!(entity = %self.entity, ?profile, batch_size, "Reusing cascade statement");
                return Ok(Arc::clone(query));
            }
            let query = Arc::new(compile()?);
            self.by_profile
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(key, Arc::clone(&query));
            return Ok(query);
        }

        let key = (lock.mode, batch_size);
        if let Some(query) = self
            .by_lock
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            tracing::debug!(entity = %self.entity, lock = ?lock.mode, batch_size, "Reusing entity statement");
            return Ok(Arc::clone(query));
        }
        let query = Arc::new(compile()?);
        tracing::debug!(entity = %self.entity, lock = ?lock.mode, batch_size, "Caching entity statement");
        self.by_lock
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, Arc::clone(&query));
        Ok(query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphload_core::{EntityPersister, LoadPlan, LockTimeout};
    use graphload_query::{CompileOptions, Dialect, LoadQueryCompiler};
    use std::cell::Cell;

    fn metamodel() -> MappingMetamodel {
        MappingMetamodel::builder()
            .entity(
                EntityPersister::builder("Customer", "customers")
                    .id("id", "id")
                    .basic("name", "name")
                    .filter("active", None)
                    .build(),
            )
            .filter("active", "{alias}.active = :flag", &["flag"])
            .build()
            .unwrap()
    }

    fn compile(mm: &MappingMetamodel, count: &Cell<usize>) -> Result<CompiledLoadQuery> {
        count.set(count.get() + 1);
        let influencers = LoadQueryInfluencers::new();
        let (plan, _) = LoadPlan::for_entity("Customer");
        LoadQueryCompiler::new(mm, &influencers, Dialect::Ansi).compile(plan, &CompileOptions::default())
    }

    #[test]
    fn reuses_statements_per_lock_and_batch() {
        let mm = metamodel();
        let loader = EntityLoader::new("Customer");
        let influencers = LoadQueryInfluencers::new();
        let count = Cell::new(0);
        let lock = LockOptions::default();
        let a = loader
            .query(&mm, &influencers, &lock, 1, || compile(&mm, &count))
            .unwrap();
        let b = loader
            .query(&mm, &influencers, &lock, 1, || compile(&mm, &count))
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(count.get(), 1);

        loader
            .query(&mm, &influencers, &lock, 10, || compile(&mm, &count))
            .unwrap();
        loader
            .query(&mm, &influencers, &LockOptions::new(LockMode::Read), 1, || {
                compile(&mm, &count)
            })
            .unwrap();
        assert_eq!(count.get(), 3);
        assert_eq!(loader.len(), 3);
    }

    #[test]
    fn filters_and_lock_timeouts_bypass_the_cache() {
        let mm = metamodel();
        let loader = EntityLoader::new("Customer");
        let mut influencers = LoadQueryInfluencers::new();
        influencers
            .enable_filter(&mm, "active")
            .unwrap()
            .set_parameter("flag", true);
        let count = Cell::new(0);
        for _ in 0..2 {
            loader
                .query(&mm, &influencers, &LockOptions::default(), 1, || {
                    compile(&mm, &count)
                })
                .unwrap();
        }
        assert_eq!(count.get(), 2);

        let plain = LoadQueryInfluencers::new();
        let nowait = LockOptions::new(LockMode::PessimisticWrite).timeout(LockTimeout::NoWait);
        loader
            .query(&mm, &plain, &nowait, 1, || compile(&mm, &count))
            .unwrap();
        assert_eq!(count.get(), 3);
        assert!(loader.is_empty());
    }
}
