//! Row materialization: the hydrate pass of a load.
//!
//! Each row is walked along the joined part of the plan. Entity references
//! read their identifier, compute their key and are registered in the
//! persistence context as uninitialized before any child is visited, so a
//! fetch that leads back to an entity already seen in this load resolves to
//! that same instance. Property values are only read here; associations are
//! resolved to instances at the end of the batch (see `two_phase`).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use graphload_core::{
    ElementDescriptor, EntityPersister, Error, FetchStrategy, Identifier, LockMode,
    MappingMetamodel, NodeId, NodeKind, PlanErrorKind, PropertyKind, Result, Row,
    StaleStateError, Value, WrongClassError, WrongClassErrorKind,
};
use graphload_query::{CompiledLoadQuery, EntityAliases};
use graphload_session::{
    CollectionKey, CollectionLoadContext, ElementValue, EntityInstance, EntityKey, EntityRef,
    SessionView,
};

/// A load that must run after the current statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingLoad {
    /// Initialize the entity (proxy) under `key`. `owner` names the
    /// one-to-one property to null out when the row does not exist.
    Entity {
        key: EntityKey,
        entity: String,
        owner: Option<(EntityKey, String)>,
    },
    Collection { key: CollectionKey },
}

/// A property value read from a row, before association resolution.
#[derive(Debug, Clone)]
pub(crate) enum HydratedValue {
    Unfetched,
    Basic(Value),
    ToOne {
        id: Option<Identifier>,
        joined: bool,
        strategy: FetchStrategy,
    },
    Collection {
        joined: bool,
        strategy: FetchStrategy,
    },
}

/// An entity registered by this load, awaiting two-phase initialization.
#[derive(Debug)]
pub(crate) struct HydratedEntity {
    pub key: EntityKey,
    pub instance: EntityRef,
    pub persister: Arc<EntityPersister>,
    pub state: Vec<HydratedValue>,
    pub version: Option<Value>,
}

/// Per-execution state of one load statement.
///
/// Single-threaded and dropped at the end of the load; dropping it before
/// [`finish`](Self::finish) discards partially read collections.
pub struct ResultSetProcessingContext<'q> {
    pub(crate) query: &'q CompiledLoadQuery,
    pub(crate) lock_mode: LockMode,
    pub(crate) read_only: bool,
    /// Dictated root key and the instance to hydrate for it.
    pub(crate) optional: Option<(EntityKey, EntityRef)>,
    pub(crate) hydrated: Vec<HydratedEntity>,
    hydrated_keys: HashMap<EntityKey, EntityRef>,
    current_row: Vec<(String, EntityKey)>,
    pub(crate) collections: CollectionLoadContext,
    pub(crate) subselect_owners: HashMap<String, HashSet<EntityKey>>,
    pub(crate) subselect_parameters: Option<Vec<Value>>,
    pub(crate) pending: Vec<PendingLoad>,
    track_subselects: bool,
}

impl std::fmt::Debug for ResultSetProcessingContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultSetProcessingContext")
            .field("lock_mode", &self.lock_mode)
            .field("read_only", &self.read_only)
            .field("hydrated", &self.hydrated.len())
            .field("collections", &self.collections)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

fn plan_error(message: impl Into<String>) -> Error {
    Error::plan(PlanErrorKind::MalformedTree, message)
}

/// Identifier from aliased columns; `None` when every column is null.
pub(crate) fn read_identifier(row: &Row, aliases: &[String]) -> Result<Option<Identifier>> {
    let values = aliases
        .iter()
        .map(|alias| row.require(alias).cloned())
        .collect::<Result<Vec<_>>>()?;
    if values.is_empty() || values.iter().all(Value::is_null) {
        return Ok(None);
    }
    Ok(Some(Identifier::new(values)))
}

/// The managed instance or proxy for `id`, creating and registering a proxy
/// when the session holds neither. Returns whether a proxy was created.
pub(crate) fn entity_proxy(
    view: &mut SessionView<'_>,
    entity: &str,
    id: Identifier,
) -> Result<(EntityRef, bool)> {
    let persister = Arc::clone(view.metamodel().entity(entity)?);
    let key = view.key(&persister.root_entity_name, id.clone());
    if let Some(existing) = view.context.get_entity_or_proxy(&key) {
        return Ok((existing, false));
    }
    let batch_size = view
        .factory
        .settings()
        .effective_batch_size(persister.batch_size);
    let proxy = EntityRef::new(EntityInstance::uninitialized(persister, id));
    view.context.add_proxy(key.clone(), proxy.clone());
    if batch_size > 1 {
        view.context.batch_queue_mut().add_batch_loadable_entity_key(key);
    }
    Ok((proxy, true))
}

impl<'q> ResultSetProcessingContext<'q> {
    pub fn new(query: &'q CompiledLoadQuery, lock_mode: LockMode, read_only: bool) -> Self {
        Self {
            query,
            lock_mode,
            read_only,
            optional: None,
            hydrated: Vec::new(),
            hydrated_keys: HashMap::new(),
            current_row: Vec::new(),
            collections: CollectionLoadContext::new(),
            subselect_owners: HashMap::new(),
            subselect_parameters: None,
            pending: Vec::new(),
            track_subselects: query.plan.has_subselect_fetches(),
        }
    }

    /// Hydrate `instance` in place for the row of `key`.
    #[must_use]
    pub fn with_optional(mut self, key: EntityKey, instance: EntityRef) -> Self {
        self.optional = Some((key, instance));
        self
    }

    /// Parameters of the owner-id select, kept for subselect descriptors.
    #[must_use]
    pub fn with_subselect_parameters(mut self, parameters: Vec<Value>) -> Self {
        self.subselect_parameters = Some(parameters);
        self
    }

    /// Number of entities registered so far.
    pub fn hydrated_count(&self) -> usize {
        self.hydrated.len()
    }

    /// Read one row; returns the root entity of the row for entity plans.
    pub fn process_row(&mut self, row: &Row, view: &mut SessionView<'_>) -> Result<Option<EntityRef>> {
        let query = self.query;
        let root = query.root;
        let result = match &query.plan.node(root).kind {
            NodeKind::EntityReturn { .. } => self.process_entity(root, row, view)?,
            NodeKind::CollectionReturn { .. } => {
                self.process_collection(root, row, view, None)?;
                None
            }
            other => return Err(plan_error(format!("{other:?} cannot be a return"))),
        };
        for (entity, key) in self.current_row.drain(..) {
            if self.track_subselects {
                self.subselect_owners.entry(entity).or_default().insert(key);
            }
        }
        Ok(result)
    }

    fn process_entity(
        &mut self,
        node: NodeId,
        row: &Row,
        view: &mut SessionView<'_>,
    ) -> Result<Option<EntityRef>> {
        let query = self.query;
        let plan = &query.plan;
        let entity = plan
            .node(node)
            .kind
            .entity()
            .ok_or_else(|| plan_error(format!("node {} is not an entity reference", node.0)))?;
        let aliases = query
            .aliases
            .entity(node)
            .ok_or_else(|| plan_error(format!("no aliases for node {}", node.0)))?;
        let persister = Arc::clone(view.metamodel().entity(entity)?);
        let Some(id) = read_identifier(row, &aliases.columns.identifier)? else {
            return Ok(None);
        };
        let key = view.key(&persister.root_entity_name, id.clone());

        if let Some(instance) = self.hydrated_keys.get(&key).cloned() {
            let concrete = Arc::clone(&instance.read().persister);
            self.descend(node, &concrete, &key, row, view)?;
            return Ok(Some(instance));
        }

        if let Some(existing) = view.context.get_entity(&key) {
            let (initialized, existing_persister) = {
                let guard = existing.read();
                (guard.initialized, Arc::clone(&guard.persister))
            };
            if initialized {
                if !view
                    .metamodel()
                    .is_subtype(&existing_persister.entity_name, &persister.entity_name)
                {
                    return Err(wrong_class(
                        WrongClassErrorKind::NotASubtype,
                        &persister.entity_name,
                        &id,
                        format!("row is already loaded as {}", existing_persister.entity_name),
                    ));
                }
                self.check_version(&key, &existing_persister, &aliases.columns, row, view)?;
                if let Some(entry) = view.context.get_entry_mut(&key) {
                    if entry.lock_mode.less_than(self.lock_mode) {
                        entry.lock_mode = self.lock_mode;
                    }
                }
                if node == query.root {
                    self.current_row
                        .push((existing_persister.entity_name.clone(), key.clone()));
                }
                self.descend(node, &existing_persister, &key, row, view)?;
                return Ok(Some(existing));
            }
        }

        let concrete = resolve_subclass(view.metamodel(), &persister, &aliases.columns, row, &id)?;
        let instance = self.instance_for(&key, &concrete, &id, view);
        {
            let mut guard = instance.write();
            guard.narrow(Arc::clone(&concrete));
            guard.id = id.clone();
        }
        view.context
            .add_uninitialized_entity(key.clone(), instance.clone(), self.lock_mode);
        self.hydrated_keys.insert(key.clone(), instance.clone());
        tracing::trace!(entity = %concrete.entity_name, key = %key, "Hydrating entity");

        let state = self.hydrate_state(node, &concrete, &aliases.columns, &id, row)?;
        let version = concrete.version.and_then(|i| match &state[i] {
            HydratedValue::Basic(v) => Some(v.clone()),
            _ => None,
        });
        self.hydrated.push(HydratedEntity {
            key: key.clone(),
            instance: instance.clone(),
            persister: Arc::clone(&concrete),
            state,
            version,
        });
        if node == query.root {
            self.current_row
                .push((concrete.entity_name.clone(), key.clone()));
        }
        self.descend(node, &concrete, &key, row, view)?;
        Ok(Some(instance))
    }

    /// The instance to hydrate for `key`: an uninitialized managed instance,
    /// the dictated optional instance, a proxy, or a new instance.
    fn instance_for(
        &self,
        key: &EntityKey,
        concrete: &Arc<EntityPersister>,
        id: &Identifier,
        view: &SessionView<'_>,
    ) -> EntityRef {
        if let Some(existing) = view.context.get_entity(key) {
            return existing;
        }
        if let Some((optional_key, instance)) = &self.optional {
            if optional_key == key {
                return instance.clone();
            }
        }
        if let Some(proxy) = view.context.get_proxy(key) {
            return proxy;
        }
        EntityRef::new(EntityInstance::uninitialized(
            Arc::clone(concrete),
            id.clone(),
        ))
    }

    fn check_version(
        &self,
        key: &EntityKey,
        persister: &EntityPersister,
        aliases: &EntityAliases,
        row: &Row,
        view: &SessionView<'_>,
    ) -> Result<()> {
        let Some(version_index) = persister.version else {
            return Ok(());
        };
        let Some(expected) = view.context.get_entry(key).and_then(|e| e.version.clone()) else {
            return Ok(());
        };
        let property = &persister.properties[version_index];
        let Some(alias) = aliases
            .property_aliases(persister, &property.name)
            .and_then(|a| a.into_iter().next())
        else {
            return Ok(());
        };
        let actual = row.require(&alias)?;
        if persister.is_same_version(&expected, actual) {
            return Ok(());
        }
        view.factory
            .statistics()
            .optimistic_failure(&persister.entity_name);
        Err(Error::StaleState(StaleStateError {
            entity: persister.entity_name.clone(),
            id: key.id.clone(),
            expected_version: Some(expected.to_string()),
            actual_version: Some(actual.to_string()),
        }))
    }

    fn hydrate_state(
        &self,
        node: NodeId,
        persister: &EntityPersister,
        aliases: &EntityAliases,
        id: &Identifier,
        row: &Row,
    ) -> Result<Vec<HydratedValue>> {
        let query = self.query;
        let plan = &query.plan;
        let mut state = Vec::with_capacity(persister.properties.len());
        for property in &persister.properties {
            let fetch = plan.fetch_for(node, &property.name);
            let joined = fetch.is_some_and(|f| plan.is_joined(f));
            let value = match &property.kind {
                PropertyKind::Basic { .. } => {
                    match aliases
                        .property_aliases(persister, &property.name)
                        .and_then(|a| a.into_iter().next())
                    {
                        Some(alias) => HydratedValue::Basic(row.require(&alias)?.clone()),
                        None => HydratedValue::Unfetched,
                    }
                }
                PropertyKind::ToOne(to_one) => {
                    let strategy = fetch.map_or(to_one.fetch, |f| plan.node(f).kind.strategy());
                    let target_id = if to_one.is_shared_key() {
                        match fetch.filter(|_| joined).and_then(|f| query.aliases.entity(f)) {
                            Some(child) => read_identifier(row, &child.columns.identifier)?,
                            None => Some(id.clone()),
                        }
                    } else {
                        match aliases.property_aliases(persister, &property.name) {
                            Some(columns) => read_identifier(row, &columns)?,
                            None => None,
                        }
                    };
                    HydratedValue::ToOne {
                        id: target_id,
                        joined,
                        strategy,
                    }
                }
                PropertyKind::Collection { .. } => HydratedValue::Collection {
                    joined,
                    strategy: fetch.map_or(FetchStrategy::LAZY_SELECT, |f| {
                        plan.node(f).kind.strategy()
                    }),
                },
            };
            state.push(value);
        }
        Ok(state)
    }

    /// Visit the joined children of an entity reference.
    fn descend(
        &mut self,
        node: NodeId,
        persister: &EntityPersister,
        key: &EntityKey,
        row: &Row,
        view: &mut SessionView<'_>,
    ) -> Result<()> {
        let query = self.query;
        let plan = &query.plan;
        for &child in &plan.node(node).children {
            if !plan.is_joined(child) {
                continue;
            }
            let kind = &plan.node(child).kind;
            if kind
                .property()
                .is_some_and(|p| persister.property(p).is_none())
            {
                continue;
            }
            match kind {
                NodeKind::EntityFetch { .. } => {
                    self.process_entity(child, row, view)?;
                }
                NodeKind::CollectionFetch { .. } => {
                    self.process_collection(child, row, view, Some(key))?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn process_collection(
        &mut self,
        node: NodeId,
        row: &Row,
        view: &mut SessionView<'_>,
        owner: Option<&EntityKey>,
    ) -> Result<()> {
        let query = self.query;
        let plan = &query.plan;
        let role = plan
            .node(node)
            .kind
            .role()
            .ok_or_else(|| plan_error(format!("node {} is not a collection reference", node.0)))?;
        let persister = Arc::clone(view.metamodel().collection(role)?);
        let aliases = query
            .aliases
            .collection(node)
            .ok_or_else(|| plan_error(format!("no aliases for node {}", node.0)))?;
        let owner_id = match owner {
            Some(owner) => owner.id.clone(),
            None => match read_identifier(row, &aliases.columns.key)? {
                Some(id) => id,
                None => return Ok(()),
            },
        };
        let key = view.collection_key(role, owner_id);
        let collection = view.context.collection_for(&key, persister.kind);
        if !self
            .collections
            .get_loading_collection(&key, &collection, persister.kind)
        {
            return Ok(());
        }

        let element = match &persister.element {
            ElementDescriptor::Basic { .. } => {
                let Some(alias) = aliases.columns.element.first() else {
                    return Ok(());
                };
                let value = row.require(alias)?;
                if value.is_null() {
                    return Ok(());
                }
                ElementValue::Basic(value.clone())
            }
            ElementDescriptor::OneToMany { entity } | ElementDescriptor::ManyToMany { entity, .. } => {
                match plan.element_of(node).filter(|e| plan.is_joined(*e)) {
                    Some(element_node) => match self.process_entity(element_node, row, view)? {
                        Some(instance) => ElementValue::Entity(instance),
                        None => return Ok(()),
                    },
                    None => {
                        let Some(id) = read_identifier(row, &aliases.columns.element)? else {
                            return Ok(());
                        };
                        ElementValue::Entity(entity_proxy(view, entity, id)?.0)
                    }
                }
            }
        };
        let index = match &aliases.columns.index {
            Some(alias) => Some(row.require(alias)?.clone()),
            None => None,
        };
        self.collections.add_element(&key, index, element);
        Ok(())
    }

    /// Reference to the target of a non-joined association, queued for an
    /// immediate load when requested.
    pub(crate) fn entity_reference(
        &mut self,
        view: &mut SessionView<'_>,
        entity: &str,
        id: Identifier,
        immediate: bool,
        owner: Option<(EntityKey, String)>,
    ) -> Result<EntityRef> {
        let (instance, _) = entity_proxy(view, entity, id)?;
        if immediate && !instance.is_initialized() {
            let root = view.metamodel().entity(entity)?.root_entity_name.clone();
            let key = view.key(&root, instance.id());
            self.pending.push(PendingLoad::Entity {
                key,
                entity: entity.to_string(),
                owner,
            });
        }
        Ok(instance)
    }
}

fn wrong_class(kind: WrongClassErrorKind, entity: &str, id: &Identifier, message: String) -> Error {
    Error::WrongClass(WrongClassError {
        kind,
        entity: entity.to_string(),
        id: id.clone(),
        message,
    })
}

/// Concrete persister for a row, from its discriminator value.
fn resolve_subclass(
    metamodel: &MappingMetamodel,
    persister: &Arc<EntityPersister>,
    aliases: &EntityAliases,
    row: &Row,
    id: &Identifier,
) -> Result<Arc<EntityPersister>> {
    let Some(alias) = &aliases.discriminator else {
        return Ok(Arc::clone(persister));
    };
    let value = row.require(alias)?;
    let concrete = match metamodel.subclass_for_discriminator(&persister.entity_name, value) {
        Some(concrete) => Arc::clone(concrete),
        None if value.is_null() && persister.discriminator_value.is_none() => Arc::clone(persister),
        None => {
            return Err(wrong_class(
                WrongClassErrorKind::UnmappedDiscriminator,
                &persister.entity_name,
                id,
                format!("discriminator value {value} is not mapped"),
            ));
        }
    };
    if !metamodel.is_subtype(&concrete.entity_name, &persister.entity_name) {
        return Err(wrong_class(
            WrongClassErrorKind::NotASubtype,
            &persister.entity_name,
            id,
            format!("row is a {}", concrete.entity_name),
        ));
    }
    Ok(concrete)
}
