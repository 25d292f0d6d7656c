//! Persistent collections and the per-load collection load context.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use graphload_core::{CollectionKind, Identifier, Value};

use crate::entity::{ElementValue, EntityRef};
use crate::key::CollectionKey;

/// A collection owned by a managed entity.
#[derive(Debug)]
pub struct PersistentCollection {
    pub role: String,
    pub key: Identifier,
    pub kind: CollectionKind,
    pub elements: Vec<ElementValue>,
    pub initialized: bool,
}

impl PersistentCollection {
    pub fn uninitialized(role: impl Into<String>, key: Identifier, kind: CollectionKind) -> Self {
        Self {
            role: role.into(),
            key,
            kind,
            elements: Vec::new(),
            initialized: false,
        }
    }
}

/// Shared handle to a persistent collection.
#[derive(Clone)]
pub struct CollectionRef(Arc<RwLock<PersistentCollection>>);

impl CollectionRef {
    pub fn new(collection: PersistentCollection) -> Self {
        Self(Arc::new(RwLock::new(collection)))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, PersistentCollection> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, PersistentCollection> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ptr_eq(&self, other: &CollectionRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn is_initialized(&self) -> bool {
        self.read().initialized
    }

    pub fn len(&self) -> usize {
        self.read().elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().elements.is_empty()
    }

    /// Snapshot of the current elements.
    pub fn elements(&self) -> Vec<ElementValue> {
        self.read().elements.clone()
    }

    /// Entity elements in collection order.
    pub fn entities(&self) -> Vec<EntityRef> {
        self.read()
            .elements
            .iter()
            .filter_map(|e| e.as_entity().cloned())
            .collect()
    }

    /// Mark a collection that matched no rows as loaded and empty.
    pub fn initialize_empty(&self) {
        let mut collection = self.write();
        if !collection.initialized {
            collection.elements.clear();
            collection.initialized = true;
        }
    }
}

impl fmt::Debug for CollectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.try_read() {
            Ok(c) if c.initialized => write!(f, "CollectionRef({}#{}, {} elements)", c.role, c.key, c.elements.len()),
            Ok(c) => write!(f, "CollectionRef({}#{}, uninitialized)", c.role, c.key),
            Err(_) => f.write_str("CollectionRef(<locked>)"),
        }
    }
}

struct LoadingCollection {
    collection: CollectionRef,
    kind: CollectionKind,
    entries: Vec<(Option<Value>, ElementValue)>,
}

/// Collections being read by one load.
///
/// Rows accumulate here rather than in the collection itself; only
/// [`end_loading`](Self::end_loading) publishes them. A context dropped
/// before that (a failed or cancelled load) discards its partial rows and
/// leaves the collections uninitialized.
#[derive(Default)]
pub struct CollectionLoadContext {
    loading: HashMap<CollectionKey, LoadingCollection>,
    order: Vec<CollectionKey>,
}

impl CollectionLoadContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or continue) loading `collection` under `key`.
    ///
    /// Returns `false` when the collection is already initialized and not
    /// part of this load; its rows must then be ignored.
    pub fn get_loading_collection(
        &mut self,
        key: &CollectionKey,
        collection: &CollectionRef,
        kind: CollectionKind,
    ) -> bool {
        if self.loading.contains_key(key) {
            return true;
        }
        if collection.is_initialized() {
            tracing::debug!(collection = %key, "Ignoring rows for an already initialized collection");
            return false;
        }
        self.loading.insert(
            key.clone(),
            LoadingCollection {
                collection: collection.clone(),
                kind,
                entries: Vec::new(),
            },
        );
        self.order.push(key.clone());
        true
    }

    pub fn is_loading(&self, key: &CollectionKey) -> bool {
        self.loading.contains_key(key)
    }

    pub fn add_element(&mut self, key: &CollectionKey, index: Option<Value>, element: ElementValue) {
        if let Some(loading) = self.loading.get_mut(key) {
            loading.entries.push((index, element));
        }
    }

    pub fn len(&self) -> usize {
        self.loading.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loading.is_empty()
    }

    /// Publish every loading collection whose array-ness matches `arrays`.
    ///
    /// Returns the finished collections in the order loading began.
    pub fn end_loading(&mut self, arrays: bool) -> Vec<(CollectionKey, CollectionRef)> {
        let mut finished = Vec::new();
        let mut remaining = Vec::with_capacity(self.order.len());
        for key in std::mem::take(&mut self.order) {
            let matches = self
                .loading
                .get(&key)
                .is_some_and(|l| (l.kind == CollectionKind::Array) == arrays);
            if !matches {
                remaining.push(key);
                continue;
            }
            if let Some(loading) = self.loading.remove(&key) {
                let elements = finish_elements(loading.kind, loading.entries);
                {
                    let mut collection = loading.collection.write();
                    collection.elements = elements;
                    collection.initialized = true;
                }
                tracing::trace!(collection = %key, "Collection fully initialized");
                finished.push((key, loading.collection));
            }
        }
        self.order = remaining;
        finished
    }
}

impl Drop for CollectionLoadContext {
    fn drop(&mut self) {
        if !self.loading.is_empty() {
            tracing::debug!(
                pending = self.loading.len(),
                "Discarding partially loaded collections"
            );
        }
    }
}

impl fmt::Debug for CollectionLoadContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionLoadContext")
            .field("loading", &self.order)
            .finish()
    }
}

fn finish_elements(
    kind: CollectionKind,
    mut entries: Vec<(Option<Value>, ElementValue)>,
) -> Vec<ElementValue> {
    match kind {
        CollectionKind::List | CollectionKind::Array => {
            // Repeated rows for one position keep the last element read.
            entries.sort_by_key(|(index, _)| index.as_ref().and_then(Value::as_i64).unwrap_or(i64::MAX));
            let mut out: Vec<(Option<i64>, ElementValue)> = Vec::with_capacity(entries.len());
            for (index, element) in entries {
                let position = index.as_ref().and_then(Value::as_i64);
                match out.last_mut() {
                    Some((last, slot)) if position.is_some() && *last == position => *slot = element,
                    _ => out.push((position, element)),
                }
            }
            out.into_iter().map(|(_, e)| e).collect()
        }
        CollectionKind::Set => {
            let mut out: Vec<ElementValue> = Vec::with_capacity(entries.len());
            for (_, element) in entries {
                if !out.iter().any(|e| e.same_element(&element)) {
                    out.push(element);
                }
            }
            out
        }
        CollectionKind::Bag => entries.into_iter().map(|(_, e)| e).collect(),
    }
}
