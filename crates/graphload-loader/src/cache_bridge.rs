//! Lookups that can satisfy a load without touching the database.

use std::sync::Arc;

use graphload_core::{
    EntityPersister, Error, LockMode, MappingMetamodel, PropertyKind, Result, WrongClassError,
    WrongClassErrorKind,
};
use graphload_session::{
    CacheEntry, DisassembledValue, EntityEntry, EntityInstance, EntityKey, EntityRef, EntityStatus,
    PersistenceContext, PostLoadEvent, PreLoadEvent, PropertyValue, SecondLevelCache, SessionView,
    StandardCacheEntry, disassemble,
};

use crate::processing::{PendingLoad, entity_proxy};

/// Outcome of a persistence-context lookup.
#[derive(Debug, Clone)]
pub enum SessionCacheResult {
    Found(EntityRef),
    /// The entity is managed but scheduled for deletion.
    Removed,
    Miss,
}

/// Look up an initialized instance in the persistence context.
///
/// An instance of a type outside `persister`'s hierarchy under the same key
/// is evicted (entity, entry and proxy) and reported as an error;
/// uninitialized registrations and proxies are misses.
pub fn load_from_session_cache(
    context: &mut PersistenceContext,
    metamodel: &MappingMetamodel,
    persister: &EntityPersister,
    key: &EntityKey,
    check_deleted: bool,
) -> Result<SessionCacheResult> {
    let Some(instance) = context.get_entity(key) else {
        return Ok(SessionCacheResult::Miss);
    };
    if !instance.is_initialized() {
        return Ok(SessionCacheResult::Miss);
    }
    if check_deleted
        && context
            .get_entry(key)
            .is_some_and(|entry| entry.status.is_removed())
    {
        return Ok(SessionCacheResult::Removed);
    }
    let actual = instance.entity_name();
    if !metamodel.is_subtype(&actual, &persister.entity_name) {
        context.remove_entity(key);
        context.remove_proxy(key);
        tracing::debug!(key = %key, actual = %actual, "Evicted instance of inconsistent class");
        return Err(Error::WrongClass(WrongClassError {
            kind: WrongClassErrorKind::InconsistentReturnClass,
            entity: persister.entity_name.clone(),
            id: key.id.clone(),
            message: format!("managed instance is a {actual}"),
        }));
    }
    tracing::trace!(key = %key, "Resolved from persistence context");
    Ok(SessionCacheResult::Found(instance))
}

/// Whether a load of `persister` may read the shared cache.
pub(crate) fn cache_readable(view: &SessionView<'_>, persister: &EntityPersister, lock_mode: LockMode) -> bool {
    persister.is_cacheable()
        && view.factory.settings().second_level_cache
        && view.cache_mode.is_get_enabled()
        && lock_mode.permits_cache_read()
}

/// Assemble an entity from the shared cache.
///
/// The instance is `into` when given, else the session's proxy for the key,
/// else a new instance. Reference entries hand out the shared instance
/// itself unless one of those two exists. Associations resolve to managed
/// instances or proxies; collections come back uninitialized. Returns the
/// instance plus any immediate loads its mapping requires.
pub fn load_from_second_level_cache(
    view: &mut SessionView<'_>,
    persister: &EntityPersister,
    key: &EntityKey,
    lock_mode: LockMode,
    read_only: bool,
    into: Option<EntityRef>,
) -> Result<Option<(EntityRef, Vec<PendingLoad>)>> {
    if !cache_readable(view, persister, lock_mode) {
        return Ok(None);
    }
    let Some(region) = persister.cache_region.clone() else {
        return Ok(None);
    };
    let cache_key = SecondLevelCache::generate_cache_key(persister, &key.id, key.tenant.as_deref());
    let entry = view.factory.cache().get(&region, &cache_key);
    let result = match entry {
        None => None,
        Some(CacheEntry::Reference(instance)) => {
            if !view
                .metamodel()
                .is_subtype(&instance.entity_name(), &persister.entity_name)
            {
                None
            } else if let Some(target) = into
                .or_else(|| view.context.get_proxy(key))
                .filter(|target| !target.ptr_eq(&instance))
            {
                // A caller-supplied instance or handed-out proxy keeps its
                // identity and is hydrated from the shared instance's state.
                let (subclass, entry) = {
                    let guard = instance.read();
                    let entry = StandardCacheEntry {
                        subclass: guard.persister.entity_name.clone(),
                        version: guard.version().cloned(),
                        state: disassemble(&guard.state),
                    };
                    (Arc::clone(&guard.persister), entry)
                };
                Some(assemble(view, &subclass, key, entry, lock_mode, read_only, Some(target))?)
            } else {
                Some((register_reference(view, key, instance, lock_mode)?, Vec::new()))
            }
        }
        Some(CacheEntry::Standard(entry)) => {
            match view.metamodel().entity(&entry.subclass).map(Arc::clone) {
                Ok(subclass)
                    if view
                        .metamodel()
                        .is_subtype(&subclass.entity_name, &persister.entity_name) =>
                {
                    Some(assemble(view, &subclass, key, entry, lock_mode, read_only, into)?)
                }
                _ => None,
            }
        }
    };
    let statistics = view.factory.statistics();
    match &result {
        Some(_) => {
            statistics.cache_hit(&region);
            tracing::debug!(region = %region, key = %key, "Shared cache hit");
        }
        None => {
            statistics.cache_miss(&region);
            tracing::trace!(region = %region, key = %key, "Shared cache miss");
        }
    }
    Ok(result)
}

fn register_reference(
    view: &mut SessionView<'_>,
    key: &EntityKey,
    instance: EntityRef,
    lock_mode: LockMode,
) -> Result<EntityRef> {
    let (state, entity_name, version) = {
        let guard = instance.read();
        (
            guard.state.clone(),
            guard.persister.entity_name.clone(),
            guard.version().cloned(),
        )
    };
    view.context.remove_proxy(key);
    view.context.add_entity_holder(key.clone(), instance.clone());
    view.context.add_entry(
        key.clone(),
        EntityEntry {
            status: EntityStatus::ReadOnly,
            entity_name,
            loaded_state: disassemble(&state),
            version,
            lock_mode,
            exists_in_database: true,
        },
    );
    let mut event = PostLoadEvent::default();
    event.reset(&instance);
    view.listeners.fire_post_load(&event)?;
    Ok(instance)
}

fn assemble(
    view: &mut SessionView<'_>,
    subclass: &Arc<EntityPersister>,
    key: &EntityKey,
    entry: StandardCacheEntry,
    lock_mode: LockMode,
    read_only: bool,
    into: Option<EntityRef>,
) -> Result<(EntityRef, Vec<PendingLoad>)> {
    let instance = into
        .or_else(|| view.context.get_proxy(key))
        .unwrap_or_else(|| {
            EntityRef::new(EntityInstance::uninitialized(
                Arc::clone(subclass),
                key.id.clone(),
            ))
        });
    instance.write().narrow(Arc::clone(subclass));
    view.context
        .add_uninitialized_entity(key.clone(), instance.clone(), lock_mode);

    let mut pending = Vec::new();
    let mut state = Vec::with_capacity(subclass.properties.len());
    for (property, cached) in subclass.properties.iter().zip(&entry.state) {
        let value = match (cached, &property.kind) {
            (DisassembledValue::Basic(v), _) => PropertyValue::Basic(v.clone()),
            (DisassembledValue::Entity(None), _) => PropertyValue::Entity(None),
            (DisassembledValue::Entity(Some((_, id))), PropertyKind::ToOne(to_one)) => {
                let (target, _) = entity_proxy(view, &to_one.target, id.clone())?;
                if to_one.fetch.is_immediate() && !target.is_initialized() {
                    let root = view.metamodel().entity(&to_one.target)?.root_entity_name.clone();
                    pending.push(PendingLoad::Entity {
                        key: view.key(&root, id.clone()),
                        entity: to_one.target.clone(),
                        owner: None,
                    });
                }
                PropertyValue::Entity(Some(target))
            }
            (DisassembledValue::Collection, PropertyKind::Collection { role }) => {
                let collection_persister = Arc::clone(view.metamodel().collection(role)?);
                let collection_key = view.collection_key(role, key.id.clone());
                let collection = view
                    .context
                    .collection_for(&collection_key, collection_persister.kind);
                if !collection.is_initialized() {
                    let batch_size = view
                        .factory
                        .settings()
                        .effective_batch_size(collection_persister.batch_size);
                    if batch_size > 1 {
                        view.context
                            .batch_queue_mut()
                            .add_batch_loadable_collection(collection_key.clone());
                    }
                    if collection_persister.fetch.is_immediate() {
                        pending.push(PendingLoad::Collection {
                            key: collection_key,
                        });
                    }
                }
                PropertyValue::Collection(collection)
            }
            _ => PropertyValue::Unfetched,
        };
        state.push(value);
    }

    let mut pre_load = PreLoadEvent::default();
    pre_load.reset(&subclass.entity_name, &key.id, state.clone());
    view.listeners.fire_pre_load(&pre_load)?;

    let read_only = read_only || !subclass.mutable;
    let natural_id: Option<Vec<_>> = subclass.has_natural_id().then(|| {
        subclass
            .natural_id
            .iter()
            .filter_map(|i| state.get(*i).and_then(PropertyValue::as_basic).cloned())
            .collect()
    });
    {
        let mut guard = instance.write();
        guard.state = state;
        guard.initialized = true;
        guard.read_only = read_only;
    }
    view.context.add_entry(
        key.clone(),
        EntityEntry {
            status: if read_only {
                EntityStatus::ReadOnly
            } else {
                EntityStatus::Managed
            },
            entity_name: subclass.entity_name.clone(),
            loaded_state: entry.state,
            version: entry.version,
            lock_mode,
            exists_in_database: true,
        },
    );
    if let Some(values) = natural_id.filter(|v| v.len() == subclass.natural_id.len()) {
        view.context
            .cache_natural_id(subclass.root_entity_name.clone(), values, key.id.clone());
    }
    let mut post_load = PostLoadEvent::default();
    post_load.reset(&instance);
    view.listeners.fire_post_load(&post_load)?;
    Ok((instance, pending))
}
