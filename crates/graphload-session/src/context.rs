//! The persistence context: one instance per row within a session.

use std::collections::{HashMap, HashSet};

use graphload_core::{CollectionKind, Identifier, LockMode, Value};

use crate::batch::BatchFetchQueue;
use crate::collection::{CollectionRef, PersistentCollection};
use crate::entity::{EntityEntry, EntityRef, EntityStatus, PropertyValue};
use crate::key::{CollectionKey, EntityKey};

/// Session-scoped registry of managed entities, proxies and collections.
///
/// Every entity key maps to at most one instance. Instances are registered
/// before their associations are resolved, so cyclic graphs converge on the
/// already-registered instance instead of recursing.
#[derive(Debug, Default)]
pub struct PersistenceContext {
    entities: HashMap<EntityKey, EntityRef>,
    entries: HashMap<EntityKey, EntityEntry>,
    proxies: HashMap<EntityKey, EntityRef>,
    collections: HashMap<CollectionKey, CollectionRef>,
    null_properties: HashSet<(EntityKey, String)>,
    natural_ids: HashMap<(String, Identifier), Identifier>,
    batch: BatchFetchQueue,
}

impl PersistenceContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_entity(&self, key: &EntityKey) -> Option<EntityRef> {
        self.entities.get(key).cloned()
    }

    pub fn contains_entity(&self, key: &EntityKey) -> bool {
        self.entities.contains_key(key)
    }

    /// Register an instance under `key` without an entry.
    pub fn add_entity_holder(&mut self, key: EntityKey, instance: EntityRef) {
        self.entities.insert(key, instance);
    }

    /// Register an instance whose row is being read; it is reachable by key
    /// immediately and carries a `Loading` entry until initialized.
    pub fn add_uninitialized_entity(
        &mut self,
        key: EntityKey,
        instance: EntityRef,
        lock_mode: LockMode,
    ) {
        let entity_name = instance.entity_name();
        self.proxies.remove(&key);
        self.batch.remove_batch_loadable_entity_key(&key);
        self.entries
            .insert(key.clone(), EntityEntry::loading(entity_name, lock_mode));
        self.entities.insert(key, instance);
    }

    pub fn add_entry(&mut self, key: EntityKey, entry: EntityEntry) {
        self.entries.insert(key, entry);
    }

    pub fn get_entry(&self, key: &EntityKey) -> Option<&EntityEntry> {
        self.entries.get(key)
    }

    pub fn get_entry_mut(&mut self, key: &EntityKey) -> Option<&mut EntityEntry> {
        self.entries.get_mut(key)
    }

    /// Remove an entity and its entry from the context.
    pub fn remove_entity(&mut self, key: &EntityKey) -> Option<EntityRef> {
        self.entries.remove(key);
        self.entities.remove(key)
    }

    pub fn remove_entry(&mut self, key: &EntityKey) -> Option<EntityEntry> {
        self.entries.remove(key)
    }

    /// Mark a managed entity as scheduled for deletion.
    pub fn mark_removed(&mut self, key: &EntityKey) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.status = EntityStatus::Removed;
                true
            }
            None => false,
        }
    }

    pub fn get_proxy(&self, key: &EntityKey) -> Option<EntityRef> {
        self.proxies.get(key).cloned()
    }

    pub fn add_proxy(&mut self, key: EntityKey, proxy: EntityRef) {
        self.proxies.insert(key, proxy);
    }

    pub fn remove_proxy(&mut self, key: &EntityKey) -> Option<EntityRef> {
        self.proxies.remove(key)
    }

    /// The managed instance for `key`, falling back to its proxy.
    pub fn get_entity_or_proxy(&self, key: &EntityKey) -> Option<EntityRef> {
        self.get_entity(key).or_else(|| self.get_proxy(key))
    }

    pub fn get_collection(&self, key: &CollectionKey) -> Option<CollectionRef> {
        self.collections.get(key).cloned()
    }

    pub fn add_collection(&mut self, key: CollectionKey, collection: CollectionRef) {
        self.collections.insert(key, collection);
    }

    /// The collection registered under `key`, creating an uninitialized one.
    pub fn collection_for(&mut self, key: &CollectionKey, kind: CollectionKind) -> CollectionRef {
        self.collections
            .entry(key.clone())
            .or_insert_with(|| {
                CollectionRef::new(PersistentCollection::uninitialized(
                    key.role.clone(),
                    key.key.clone(),
                    kind,
                ))
            })
            .clone()
    }

    /// Record that a to-one property of `owner` has no target row.
    pub fn add_null_property(&mut self, owner: EntityKey, property: impl Into<String>) {
        self.null_properties.insert((owner, property.into()));
    }

    pub fn is_property_null(&self, owner: &EntityKey, property: &str) -> bool {
        self.null_properties
            .contains(&(owner.clone(), property.to_string()))
    }

    pub fn cache_natural_id(&mut self, entity: impl Into<String>, natural_id: Vec<Value>, id: Identifier) {
        self.natural_ids
            .insert((entity.into(), Identifier::new(natural_id)), id);
    }

    pub fn resolve_natural_id(&self, entity: &str, natural_id: &[Value]) -> Option<Identifier> {
        self.natural_ids
            .get(&(entity.to_string(), Identifier::new(natural_id.to_vec())))
            .cloned()
    }

    pub fn batch_queue(&self) -> &BatchFetchQueue {
        &self.batch
    }

    pub fn batch_queue_mut(&mut self) -> &mut BatchFetchQueue {
        &mut self.batch
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn collection_count(&self) -> usize {
        self.collections.len()
    }

    pub fn managed_entities(&self) -> impl Iterator<Item = (&EntityKey, &EntityRef)> {
        self.entities.iter()
    }

    /// Evict everything, first dropping association state so cyclic graphs
    /// held only by this context are freed.
    pub fn clear(&mut self) {
        for instance in self.entities.values().chain(self.proxies.values()) {
            let mut instance = instance.write();
            for slot in &mut instance.state {
                *slot = PropertyValue::Unfetched;
            }
            instance.initialized = false;
        }
        for collection in self.collections.values() {
            let mut collection = collection.write();
            collection.elements.clear();
            collection.initialized = false;
        }
        self.entities.clear();
        self.entries.clear();
        self.proxies.clear();
        self.collections.clear();
        self.null_properties.clear();
        self.natural_ids.clear();
        self.batch.clear();
        tracing::debug!("Persistence context cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityInstance;
    use graphload_core::{EntityPersister, FetchStrategy};
    use std::sync::Arc;

    fn persister() -> Arc<EntityPersister> {
        Arc::new(
            EntityPersister::builder("Node", "nodes")
                .id("id", "id")
                .many_to_one("parent", "Node", "parent_id", FetchStrategy::JOIN)
                .build(),
        )
    }

    fn key(id: i64) -> EntityKey {
        EntityKey::new("Node", Identifier::from(id))
    }

    #[test]
    fn registration_replaces_proxy() {
        let mut ctx = PersistenceContext::new();
        let proxy = EntityRef::new(EntityInstance::uninitialized(persister(), Identifier::from(1)));
        ctx.add_proxy(key(1), proxy.clone());
        ctx.batch_queue_mut().add_batch_loadable_entity_key(key(1));
        assert!(ctx.get_entity(&key(1)).is_none());
        assert!(ctx.get_entity_or_proxy(&key(1)).unwrap().ptr_eq(&proxy));

        ctx.add_uninitialized_entity(key(1), proxy.clone(), LockMode::None);
        assert!(ctx.get_proxy(&key(1)).is_none());
        assert!(ctx.get_entry(&key(1)).unwrap().is_loading());
        assert!(!ctx.batch_queue().contains_entity_key(&key(1)));
    }

    #[test]
    fn clear_breaks_cycles() {
        let mut ctx = PersistenceContext::new();
        let node = EntityRef::new(EntityInstance::uninitialized(persister(), Identifier::from(1)));
        node.write().state[0] = PropertyValue::Entity(Some(node.clone()));
        ctx.add_uninitialized_entity(key(1), node.clone(), LockMode::None);
        ctx.clear();
        assert_eq!(ctx.entity_count(), 0);
        assert!(node.read().state[0].is_unfetched());
    }

    #[test]
    fn natural_ids_and_null_properties() {
        let mut ctx = PersistenceContext::new();
        ctx.cache_natural_id("Node", vec![Value::from("root")], Identifier::from(1));
        assert_eq!(
            ctx.resolve_natural_id("Node", &[Value::from("root")]),
            Some(Identifier::from(1))
        );
        assert!(ctx.resolve_natural_id("Node", &[Value::from("leaf")]).is_none());

        ctx.add_null_property(key(1), "parent");
        assert!(ctx.is_property_null(&key(1), "parent"));
        assert!(!ctx.is_property_null(&key(2), "parent"));
    }

    #[test]
    fn collections_are_created_once() {
        let mut ctx = PersistenceContext::new();
        let k = CollectionKey::new("Node.children", Identifier::from(1));
        let a = ctx.collection_for(&k, CollectionKind::Set);
        let b = ctx.collection_for(&k, CollectionKind::Set);
        assert!(a.ptr_eq(&b));
        assert!(!a.is_initialized());
    }
}
