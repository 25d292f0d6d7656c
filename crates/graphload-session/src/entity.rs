//! Managed entity instances and their bookkeeping entries.
//!
//! Instances are shared through [`EntityRef`], an `Arc<RwLock<_>>` handle, so
//! every association that points at the same row points at the same object.
//! Object graphs may be cyclic; handles print shallowly to keep `Debug`
//! finite, and [`PersistenceContext::clear`](crate::PersistenceContext::clear)
//! breaks the cycles when a session is discarded.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use graphload_core::{EntityPersister, Identifier, LockMode, Value};

use crate::collection::CollectionRef;

/// Read guard for an entity instance.
pub type EntityReadGuard<'a> = RwLockReadGuard<'a, EntityInstance>;

/// Write guard for an entity instance.
pub type EntityWriteGuard<'a> = RwLockWriteGuard<'a, EntityInstance>;

/// Resolved value of one property.
#[derive(Debug, Clone, Default)]
pub enum PropertyValue {
    /// Not loaded yet (instance still hydrating or uninitialized proxy).
    #[default]
    Unfetched,
    Basic(Value),
    /// A to-one association; `None` when the association is null.
    Entity(Option<EntityRef>),
    Collection(CollectionRef),
    /// Array-valued collections are copied into the owner on load.
    Array(Vec<ElementValue>),
}

impl PropertyValue {
    pub fn as_basic(&self) -> Option<&Value> {
        match self {
            PropertyValue::Basic(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_unfetched(&self) -> bool {
        matches!(self, PropertyValue::Unfetched)
    }
}

/// One element of a collection.
#[derive(Debug, Clone)]
pub enum ElementValue {
    Basic(Value),
    Entity(EntityRef),
}

impl ElementValue {
    /// Identity comparison: entities by instance, values by identity equality.
    pub fn same_element(&self, other: &ElementValue) -> bool {
        match (self, other) {
            (ElementValue::Basic(a), ElementValue::Basic(b)) => a.same_identity(b),
            (ElementValue::Entity(a), ElementValue::Entity(b)) => a.ptr_eq(b),
            _ => false,
        }
    }

    pub fn as_entity(&self) -> Option<&EntityRef> {
        match self {
            ElementValue::Entity(e) => Some(e),
            ElementValue::Basic(_) => None,
        }
    }
}

/// A materialized (or still hydrating) entity.
#[derive(Debug)]
pub struct EntityInstance {
    pub persister: Arc<EntityPersister>,
    pub id: Identifier,
    /// One slot per `persister.properties` entry.
    pub state: Vec<PropertyValue>,
    pub initialized: bool,
    pub read_only: bool,
}

impl EntityInstance {
    /// An instance with every property unfetched.
    pub fn uninitialized(persister: Arc<EntityPersister>, id: Identifier) -> Self {
        let state = vec![PropertyValue::Unfetched; persister.properties.len()];
        Self {
            persister,
            id,
            state,
            initialized: false,
            read_only: false,
        }
    }

    pub fn entity_name(&self) -> &str {
        &self.persister.entity_name
    }

    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.persister
            .property_index(name)
            .and_then(|i| self.state.get(i))
    }

    /// Value of a basic property.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.property(name).and_then(PropertyValue::as_basic)
    }

    /// Target of a to-one association; `None` when null or unfetched.
    pub fn association(&self, name: &str) -> Option<EntityRef> {
        match self.property(name)? {
            PropertyValue::Entity(target) => target.clone(),
            _ => None,
        }
    }

    pub fn collection(&self, name: &str) -> Option<CollectionRef> {
        match self.property(name)? {
            PropertyValue::Collection(c) => Some(c.clone()),
            _ => None,
        }
    }

    pub fn array(&self, name: &str) -> Option<&[ElementValue]> {
        match self.property(name)? {
            PropertyValue::Array(elements) => Some(elements),
            _ => None,
        }
    }

    pub fn version(&self) -> Option<&Value> {
        self.persister
            .version
            .and_then(|i| self.state.get(i))
            .and_then(PropertyValue::as_basic)
    }

    /// Re-type an instance hydrated in place as a more specific subclass.
    pub fn narrow(&mut self, persister: Arc<EntityPersister>) {
        if persister.entity_name != self.persister.entity_name {
            self.state
                .resize(persister.properties.len(), PropertyValue::Unfetched);
            self.persister = persister;
        }
    }
}

/// Shared handle to a managed entity instance.
#[derive(Clone)]
pub struct EntityRef(Arc<RwLock<EntityInstance>>);

impl EntityRef {
    pub fn new(instance: EntityInstance) -> Self {
        Self(Arc::new(RwLock::new(instance)))
    }

    /// Acquire a read guard; a poisoned lock still yields the instance.
    pub fn read(&self) -> EntityReadGuard<'_> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> EntityWriteGuard<'_> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// True when both handles refer to the same instance.
    pub fn ptr_eq(&self, other: &EntityRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn id(&self) -> Identifier {
        self.read().id.clone()
    }

    pub fn entity_name(&self) -> String {
        self.read().persister.entity_name.clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.read().initialized
    }

    pub fn is_read_only(&self) -> bool {
        self.read().read_only
    }

    /// Shorthand for reading a basic property.
    pub fn get(&self, name: &str) -> Option<Value> {
        self.read().get(name).cloned()
    }

    pub fn association(&self, name: &str) -> Option<EntityRef> {
        self.read().association(name)
    }

    pub fn collection(&self, name: &str) -> Option<CollectionRef> {
        self.read().collection(name)
    }
}

impl fmt::Debug for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.try_read() {
            Ok(instance) => write!(
                f,
                "EntityRef({}#{}{})",
                instance.persister.entity_name,
                instance.id,
                if instance.initialized { "" } else { ", uninitialized" }
            ),
            Err(_) => f.write_str("EntityRef(<locked>)"),
        }
    }
}

/// Lifecycle status of a managed entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityStatus {
    Managed,
    ReadOnly,
    /// Registered while its row is being materialized.
    Loading,
    /// Scheduled for deletion in this session.
    Removed,
}

impl EntityStatus {
    pub fn is_removed(self) -> bool {
        matches!(self, EntityStatus::Removed)
    }
}

/// Bookkeeping the persistence context keeps for each managed entity.
#[derive(Debug, Clone)]
pub struct EntityEntry {
    pub status: EntityStatus,
    /// Concrete entity name of the managed instance.
    pub entity_name: String,
    pub loaded_state: Vec<crate::cache::DisassembledValue>,
    pub version: Option<Value>,
    pub lock_mode: LockMode,
    pub exists_in_database: bool,
}

impl EntityEntry {
    /// Entry for an instance whose row is still being read.
    pub fn loading(entity_name: impl Into<String>, lock_mode: LockMode) -> Self {
        Self {
            status: EntityStatus::Loading,
            entity_name: entity_name.into(),
            loaded_state: Vec::new(),
            version: None,
            lock_mode,
            exists_in_database: true,
        }
    }

    pub fn is_loading(&self) -> bool {
        self.status == EntityStatus::Loading
    }
}
