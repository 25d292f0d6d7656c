//! Two-phase initialization of the entities a statement hydrated.
//!
//! Rows only register instances and read raw state. Once every row has been
//! read, each registered entity gets its associations resolved against the
//! persistence context, its entry, natural-id resolution and shared-cache
//! entry, and collections are published. Arrays are finished before the
//! entities so owners can copy their elements; other collections after.

use std::sync::Arc;

use graphload_core::{
    CollectionKind, EntityPersister, Identifier, PropertyKind, Result, ToOneDescriptor, ToOneKind,
};
use graphload_session::{
    AfterLoadAction, CacheEntry, CollectionKey, CollectionRef, EntityEntry, EntityKey, EntityRef,
    EntityStatus, PostLoadEvent, PreLoadEvent, PropertyValue, SecondLevelCache, SessionView,
    StandardCacheEntry, SubselectFetch, disassemble,
};

use crate::processing::{HydratedEntity, HydratedValue, PendingLoad, ResultSetProcessingContext};

/// Result of finishing a statement.
#[derive(Debug, Default)]
pub struct Finished {
    /// Entities initialized by the statement, in hydration order.
    pub entities: Vec<EntityRef>,
    /// Follow-up loads discovered while resolving associations.
    pub pending: Vec<PendingLoad>,
    pub collections: Vec<(CollectionKey, CollectionRef)>,
}

impl ResultSetProcessingContext<'_> {
    /// Initialize everything the processed rows registered.
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn finish(
        mut self,
        view: &mut SessionView<'_>,
        after_load: &mut [AfterLoadAction],
    ) -> Result<Finished> {
        let mut finished = Finished::default();
        let arrays = self.collections.end_loading(true);
        self.collections_finished(view, &arrays);
        finished.collections.extend(arrays);

        let hydrated = std::mem::take(&mut self.hydrated);
        let mut pre_load = PreLoadEvent::default();
        for entity in &hydrated {
            self.initialize_entity(entity, view, &mut pre_load)?;
        }

        let collections = self.collections.end_loading(false);
        self.collections_finished(view, &collections);
        finished.collections.extend(collections);

        let mut post_load = PostLoadEvent::default();
        for entity in &hydrated {
            post_load.reset(&entity.instance);
            view.listeners.fire_post_load(&post_load)?;
            for action in after_load.iter_mut() {
                action(&entity.instance)?;
            }
        }

        self.register_subselects(view);
        tracing::debug!(
            entities = hydrated.len(),
            collections = finished.collections.len(),
            pending = self.pending.len(),
            "Finished load batch"
        );
        finished.entities = hydrated.into_iter().map(|h| h.instance).collect();
        finished.pending = std::mem::take(&mut self.pending);
        Ok(finished)
    }

    fn collections_finished(&self, view: &mut SessionView<'_>, done: &[(CollectionKey, CollectionRef)]) {
        for (key, _) in done {
            view.factory.statistics().collection_loaded(&key.role);
            view.context
                .batch_queue_mut()
                .remove_batch_loadable_collection(key);
        }
    }

    fn initialize_entity(
        &mut self,
        hydrated: &HydratedEntity,
        view: &mut SessionView<'_>,
        pre_load: &mut PreLoadEvent,
    ) -> Result<()> {
        let persister = &hydrated.persister;
        let key = &hydrated.key;
        let mut state = Vec::with_capacity(hydrated.state.len());
        for (property, value) in persister.properties.iter().zip(&hydrated.state) {
            let resolved = match (value, &property.kind) {
                (HydratedValue::Unfetched, _) => PropertyValue::Unfetched,
                (HydratedValue::Basic(v), _) => PropertyValue::Basic(v.clone()),
                (
                    HydratedValue::ToOne {
                        id,
                        joined,
                        strategy,
                    },
                    PropertyKind::ToOne(to_one),
                ) => {
                    let immediate = !joined && strategy.is_immediate();
                    self.resolve_to_one(view, key, &property.name, to_one, id.clone(), immediate)?
                }
                (HydratedValue::Collection { joined, strategy }, PropertyKind::Collection { role }) => {
                    let immediate = !joined && strategy.is_immediate();
                    self.resolve_collection(view, key, role, immediate)?
                }
                _ => PropertyValue::Unfetched,
            };
            state.push(resolved);
        }

        pre_load.reset(&persister.entity_name, &key.id, state.clone());
        view.listeners.fire_pre_load(pre_load)?;

        let loaded_state = disassemble(&state);
        let read_only = self.read_only || !persister.mutable;
        let natural_id = natural_id_values(persister, &state);
        {
            let mut instance = hydrated.instance.write();
            instance.state = state;
            instance.initialized = true;
            instance.read_only = read_only;
        }
        view.context.add_entry(
            key.clone(),
            EntityEntry {
                status: if read_only {
                    EntityStatus::ReadOnly
                } else {
                    EntityStatus::Managed
                },
                entity_name: persister.entity_name.clone(),
                loaded_state: loaded_state.clone(),
                version: hydrated.version.clone(),
                lock_mode: self.lock_mode,
                exists_in_database: true,
            },
        );
        if let Some(values) = natural_id {
            view.context
                .cache_natural_id(persister.root_entity_name.clone(), values, key.id.clone());
        }
        put_from_load(view, persister, key, hydrated, loaded_state);
        view.factory
            .statistics()
            .entity_loaded(&persister.entity_name);
        tracing::trace!(entity = %persister.entity_name, key = %key, "Entity initialized");
        Ok(())
    }

    fn resolve_to_one(
        &mut self,
        view: &mut SessionView<'_>,
        owner: &EntityKey,
        property: &str,
        to_one: &ToOneDescriptor,
        id: Option<Identifier>,
        immediate: bool,
    ) -> Result<PropertyValue> {
        let Some(id) = id else {
            if to_one.is_shared_key() {
                view.context.add_null_property(owner.clone(), property);
            }
            return Ok(PropertyValue::Entity(None));
        };
        if view.context.is_property_null(owner, property) {
            return Ok(PropertyValue::Entity(None));
        }
        let root = view
            .metamodel()
            .entity(&to_one.target)?
            .root_entity_name
            .clone();
        let target_key = view.key(&root, id.clone());
        if let Some(existing) = view.context.get_entity(&target_key) {
            return Ok(PropertyValue::Entity(Some(existing)));
        }
        let unconstrained = matches!(to_one.kind, ToOneKind::OneToOne { constrained: false });
        let marker = unconstrained.then(|| (owner.clone(), property.to_string()));
        let target =
            self.entity_reference(view, &to_one.target, id, immediate || unconstrained, marker)?;
        Ok(PropertyValue::Entity(Some(target)))
    }

    fn resolve_collection(
        &mut self,
        view: &mut SessionView<'_>,
        owner: &EntityKey,
        role: &str,
        immediate: bool,
    ) -> Result<PropertyValue> {
        let persister = Arc::clone(view.metamodel().collection(role)?);
        let key = view.collection_key(role, owner.id.clone());
        let collection = view.context.collection_for(&key, persister.kind);
        if !collection.is_initialized() && !self.collections.is_loading(&key) {
            let batch_size = view
                .factory
                .settings()
                .effective_batch_size(persister.batch_size);
            if batch_size > 1 {
                view.context
                    .batch_queue_mut()
                    .add_batch_loadable_collection(key.clone());
            }
            if immediate {
                self.pending.push(PendingLoad::Collection { key });
            }
        }
        if persister.kind == CollectionKind::Array && collection.is_initialized() {
            return Ok(PropertyValue::Array(collection.elements()));
        }
        Ok(PropertyValue::Collection(collection))
    }

    /// One descriptor per entity type with several owners, shared by every
    /// owner it covers.
    fn register_subselects(&mut self, view: &mut SessionView<'_>) {
        let (Some(source), Some(parameters)) = (
            self.query.subselect_source.as_ref(),
            self.subselect_parameters.as_ref(),
        ) else {
            return;
        };
        for (entity, owners) in std::mem::take(&mut self.subselect_owners) {
            if owners.len() < 2 {
                continue;
            }
            let eligible = view
                .metamodel()
                .entity(&entity)
                .is_ok_and(|p| p.has_subselect_collections(view.metamodel()));
            if !eligible {
                continue;
            }
            tracing::debug!(entity = %entity, owners = owners.len(), "Registering subselect fetch");
            let fetch = Arc::new(SubselectFetch {
                entity,
                owner_id_select: source.sql.clone(),
                parameters: parameters.clone(),
                owner_keys: owners.clone(),
            });
            for owner in owners {
                view.context
                    .batch_queue_mut()
                    .add_subselect(owner, Arc::clone(&fetch));
            }
        }
    }
}

fn natural_id_values(
    persister: &EntityPersister,
    state: &[PropertyValue],
) -> Option<Vec<graphload_core::Value>> {
    if !persister.has_natural_id() {
        return None;
    }
    persister
        .natural_id
        .iter()
        .map(|i| state.get(*i).and_then(PropertyValue::as_basic).cloned())
        .collect()
}

/// Store a freshly loaded entity in the shared cache when the session's
/// cache mode allows puts.
fn put_from_load(
    view: &SessionView<'_>,
    persister: &EntityPersister,
    key: &EntityKey,
    hydrated: &HydratedEntity,
    loaded_state: Vec<graphload_session::DisassembledValue>,
) {
    let settings = view.factory.settings();
    let Some(region) = persister.cache_region.as_deref() else {
        return;
    };
    if !settings.second_level_cache || !view.cache_mode.is_put_enabled() {
        return;
    }
    let entry = if settings.direct_reference_entries && !persister.mutable {
        CacheEntry::Reference(hydrated.instance.clone())
    } else {
        CacheEntry::Standard(StandardCacheEntry {
            subclass: persister.entity_name.clone(),
            version: hydrated.version.clone(),
            state: loaded_state,
        })
    };
    let cache_key = SecondLevelCache::generate_cache_key(persister, &key.id, key.tenant.as_deref());
    let minimal = settings.minimal_puts && view.cache_mode != graphload_session::CacheMode::Refresh;
    if view.factory.cache_mut().put(region, cache_key, entry, minimal) {
        view.factory.statistics().cache_put(region);
        tracing::trace!(region = %region, key = %key, "Cached loaded entity");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::tests::{NoRows, metamodel, row};
    use graphload_core::{LoadQueryInfluencers, LockMode, Value};
    use graphload_query::{CompileOptions, Dialect, LoadPlanBuilder, LoadQueryCompiler};
    use graphload_session::{LoaderSettings, SessionFactory};

    #[test]
    fn back_reference_resolves_to_the_owner() {
        let mm = metamodel();
        let influencers = LoadQueryInfluencers::new();
        let plan = LoadPlanBuilder::new(&mm, &influencers)
            .build_entity_plan("Customer")
            .unwrap();
        let query = LoadQueryCompiler::new(&mm, &influencers, Dialect::Ansi)
            .compile(plan, &CompileOptions::default())
            .unwrap();
        let factory = SessionFactory::new(metamodel(), LoaderSettings::default()).unwrap();
        let mut session = factory.open_session(NoRows);
        let (_, mut view) = session.split();
        let mut ctx = ResultSetProcessingContext::new(&query, LockMode::None, false);
        for order_id in [10, 11] {
            let r = row(&query, &|owner, column| match (owner, column) {
                ("Customer", "id") => Value::from(1),
                ("Customer", "name") => Value::from("Ada"),
                ("Customer", "version") => Value::from(1),
                ("Order", "id") | ("Customer.orders", "id") => Value::from(order_id),
                ("Order", "customer_id") | ("Customer.orders", "customer_id") => Value::from(1),
                _ => Value::Null,
            });
            ctx.process_row(&r, &mut view).unwrap();
        }
        let finished = ctx.finish(&mut view, &mut []).unwrap();
        assert_eq!(finished.entities.len(), 3);
        assert!(finished.pending.is_empty());

        let customer = finished.entities[0].clone();
        assert!(customer.is_initialized());
        let orders = customer.collection("orders").unwrap();
        assert!(orders.is_initialized());
        assert_eq!(orders.len(), 2);
        for order in orders.entities() {
            assert!(order.association("customer").unwrap().ptr_eq(&customer));
        }
        assert!(customer.association("referrer").is_none());
        let key = view.key("Customer", Identifier::from(1));
        let entry = view.context.get_entry(&key).unwrap();
        assert_eq!(entry.status, EntityStatus::Managed);
        assert_eq!(entry.version, Some(Value::from(1)));
        // release the cycle
        view.context.clear();
    }
}
