//! Queue of keys eligible for batch fetching, plus subselect descriptors.
//!
//! Uninitialized proxies of batch-loadable entities and uninitialized
//! collections of batch-loadable roles are queued here as they are created.
//! When one of them is finally loaded, the loader pulls further keys of the
//! same entity or role from the queue so a single statement covers several.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use graphload_core::{Identifier, Value};

use crate::key::{CollectionKey, EntityKey};

/// Owner-id query and parameters that produced a set of owners, used to
/// load their subselect-fetched collections in one statement.
#[derive(Debug, Clone)]
pub struct SubselectFetch {
    /// Entity whose collections are fetched.
    pub entity: String,
    /// `select <id> from ... where ...` with `?` placeholders.
    pub owner_id_select: String,
    pub parameters: Vec<Value>,
    pub owner_keys: HashSet<EntityKey>,
}

impl SubselectFetch {
    pub fn covers(&self, key: &EntityKey) -> bool {
        self.owner_keys.contains(key)
    }
}

#[derive(Debug, Default)]
pub struct BatchFetchQueue {
    entity_keys: HashMap<String, Vec<EntityKey>>,
    collection_keys: HashMap<String, Vec<CollectionKey>>,
    subselects: HashMap<EntityKey, Arc<SubselectFetch>>,
}

impl BatchFetchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_batch_loadable_entity_key(&mut self, key: EntityKey) {
        let keys = self.entity_keys.entry(key.entity.clone()).or_default();
        if !keys.contains(&key) {
            keys.push(key);
        }
    }

    pub fn remove_batch_loadable_entity_key(&mut self, key: &EntityKey) {
        if let Some(keys) = self.entity_keys.get_mut(&key.entity) {
            keys.retain(|k| k != key);
        }
    }

    pub fn contains_entity_key(&self, key: &EntityKey) -> bool {
        self.entity_keys
            .get(&key.entity)
            .is_some_and(|keys| keys.contains(key))
    }

    /// Identifiers to load together with `requested`: the requested id
    /// first, then queued keys of the same entity in queue order.
    pub fn entity_batch(&self, requested: &EntityKey, batch_size: usize) -> Vec<Identifier> {
        let mut ids = vec![requested.id.clone()];
        if let Some(keys) = self.entity_keys.get(&requested.entity) {
            for key in keys {
                if ids.len() >= batch_size {
                    break;
                }
                if key != requested && key.tenant == requested.tenant && !ids.contains(&key.id) {
                    ids.push(key.id.clone());
                }
            }
        }
        ids
    }

    pub fn add_batch_loadable_collection(&mut self, key: CollectionKey) {
        let keys = self.collection_keys.entry(key.role.clone()).or_default();
        if !keys.contains(&key) {
            keys.push(key);
        }
    }

    pub fn remove_batch_loadable_collection(&mut self, key: &CollectionKey) {
        if let Some(keys) = self.collection_keys.get_mut(&key.role) {
            keys.retain(|k| k != key);
        }
    }

    /// Collection keys to initialize together with `requested`.
    pub fn collection_batch(&self, requested: &CollectionKey, batch_size: usize) -> Vec<Identifier> {
        let mut ids = vec![requested.key.clone()];
        if let Some(keys) = self.collection_keys.get(&requested.role) {
            for key in keys {
                if ids.len() >= batch_size {
                    break;
                }
                if key != requested && key.tenant == requested.tenant && !ids.contains(&key.key) {
                    ids.push(key.key.clone());
                }
            }
        }
        ids
    }

    pub fn add_subselect(&mut self, owner: EntityKey, fetch: Arc<SubselectFetch>) {
        self.subselects.insert(owner, fetch);
    }

    pub fn subselect(&self, owner: &EntityKey) -> Option<Arc<SubselectFetch>> {
        self.subselects.get(owner).cloned()
    }

    pub fn remove_subselect(&mut self, owner: &EntityKey) {
        self.subselects.remove(owner);
    }

    pub fn clear_subselects(&mut self) {
        self.subselects.clear();
    }

    pub fn clear(&mut self) {
        self.entity_keys.clear();
        self.collection_keys.clear();
        self.subselects.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: i64) -> EntityKey {
        EntityKey::new("Customer", Identifier::from(id))
    }

    #[test]
    fn requested_id_comes_first() {
        let mut queue = BatchFetchQueue::new();
        for id in 1..=5 {
            queue.add_batch_loadable_entity_key(key(id));
        }
        let ids = queue.entity_batch(&key(3), 3);
        assert_eq!(ids, vec![Identifier::from(3), Identifier::from(1), Identifier::from(2)]);
    }

    #[test]
    fn removed_keys_are_not_batched() {
        let mut queue = BatchFetchQueue::new();
        queue.add_batch_loadable_entity_key(key(1));
        queue.add_batch_loadable_entity_key(key(2));
        queue.add_batch_loadable_entity_key(key(2));
        queue.remove_batch_loadable_entity_key(&key(1));
        assert!(!queue.contains_entity_key(&key(1)));
        assert_eq!(queue.entity_batch(&key(9), 10).len(), 2);
    }

    #[test]
    fn collection_batches_stay_within_role() {
        let mut queue = BatchFetchQueue::new();
        queue.add_batch_loadable_collection(CollectionKey::new("Customer.orders", Identifier::from(1)));
        queue.add_batch_loadable_collection(CollectionKey::new("Customer.orders", Identifier::from(2)));
        queue.add_batch_loadable_collection(CollectionKey::new("Customer.tags", Identifier::from(3)));
        let ids = queue.collection_batch(&CollectionKey::new("Customer.orders", Identifier::from(2)), 8);
        assert_eq!(ids, vec![Identifier::from(2), Identifier::from(1)]);
    }

    #[test]
    fn subselects_are_shared_by_owner() {
        let mut queue = BatchFetchQueue::new();
        let fetch = Arc::new(SubselectFetch {
            entity: "Customer".into(),
            owner_id_select: "select c.id from customers c where c.region = ?".into(),
            parameters: vec![Value::from("north")],
            owner_keys: [key(1), key(2)].into_iter().collect(),
        });
        queue.add_subselect(key(1), Arc::clone(&fetch));
        queue.add_subselect(key(2), fetch);
        let a = queue.subselect(&key(1)).unwrap();
        let b = queue.subselect(&key(2)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(a.covers(&key(2)));
        queue.remove_subselect(&key(1));
        assert!(queue.subselect(&key(1)).is_none());
    }
}
