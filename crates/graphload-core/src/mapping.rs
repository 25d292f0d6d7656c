//! Mapping metadata consumed by the loading engine.
//!
//! The metamodel describes entities (tables, identifier and version columns,
//! discriminators, properties, natural ids, cache regions) and collections
//! (roles, key/index/element columns, orderings, filters). It is assembled
//! with [`MetamodelBuilder`], which validates cross references and resolves
//! single-table inheritance, and is immutable afterwards.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::error::{Error, PlanErrorKind, Result};
use crate::plan::{FetchStrategy, FetchStyle};
use crate::value::Value;

/// Cascade styles relevant to internal fetch profiles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cascade {
    pub merge: bool,
    pub refresh: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToOneKind {
    ManyToOne,
    /// `constrained` one-to-ones always have a target row and may be proxied
    OneToOne { constrained: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToOneDescriptor {
    pub target: String,
    pub kind: ToOneKind,
    /// Foreign-key columns on the owner table; empty for shared-key one-to-ones
    pub columns: Vec<String>,
    pub nullable: bool,
    pub fetch: FetchStrategy,
}

impl ToOneDescriptor {
    /// One-to-one keyed by the owner's own identifier.
    pub fn is_shared_key(&self) -> bool {
        self.columns.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyKind {
    Basic { column: String },
    ToOne(ToOneDescriptor),
    Collection { role: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyDescriptor {
    pub name: String,
    pub kind: PropertyKind,
    /// 0 for the primary table, `n` for `secondary_tables[n - 1]`
    pub table: usize,
    pub cascade: Cascade,
}

impl PropertyDescriptor {
    /// Columns this property occupies on the owner's tables.
    pub fn columns(&self) -> &[String] {
        match &self.kind {
            PropertyKind::Basic { column } => std::slice::from_ref(column),
            PropertyKind::ToOne(to_one) => &to_one.columns,
            PropertyKind::Collection { .. } => &[],
        }
    }

    pub fn is_association(&self) -> bool {
        !matches!(self.kind, PropertyKind::Basic { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecondaryTable {
    pub table: String,
    /// Columns referencing the primary table's identifier
    pub key_columns: Vec<String>,
    pub optional: bool,
}

/// A named filter mapped onto an entity or collection; `condition`
/// overrides the definition's default condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterMapping {
    pub name: String,
    pub condition: Option<String>,
}

/// Filter definition: a condition template with `{alias}` and `:param`
/// placeholders plus the declared parameter names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterDefinition {
    pub name: String,
    pub default_condition: String,
    pub parameters: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileFetch {
    pub entity: String,
    pub association: String,
    pub style: FetchStyle,
}

/// Named set of fetch overrides that can be enabled per session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchProfile {
    pub name: String,
    pub fetches: Vec<ProfileFetch>,
}

impl FetchProfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fetches: Vec::new(),
        }
    }

    pub fn fetch(
        mut self,
        entity: impl Into<String>,
        association: impl Into<String>,
        style: FetchStyle,
    ) -> Self {
        self.fetches.push(ProfileFetch {
            entity: entity.into(),
            association: association.into(),
            style,
        });
        self
    }
}

/// Entity mapping.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityPersister {
    pub entity_name: String,
    pub root_entity_name: String,
    pub super_entity: Option<String>,
    pub table: String,
    pub identifier_property: String,
    pub id_columns: Vec<String>,
    /// Index into `properties` of the version property
    pub version: Option<usize>,
    pub discriminator_column: Option<String>,
    pub discriminator_value: Option<Value>,
    pub properties: Vec<PropertyDescriptor>,
    /// Indices into `properties`, in natural-id order
    pub natural_id: Vec<usize>,
    pub batch_size: usize,
    pub cache_region: Option<String>,
    pub mutable: bool,
    pub where_clause: Option<String>,
    pub filters: Vec<FilterMapping>,
    pub secondary_tables: Vec<SecondaryTable>,
}

impl EntityPersister {
    pub fn builder(entity_name: impl Into<String>, table: impl Into<String>) -> EntityBuilder {
        EntityBuilder::new(entity_name.into(), Some(table.into()), None)
    }

    /// Builder for a single-table subclass; table, identifier, version and
    /// inherited properties are copied from the superclass at build time.
    pub fn subclass(
        entity_name: impl Into<String>,
        super_entity: impl Into<String>,
    ) -> EntityBuilder {
        EntityBuilder::new(entity_name.into(), None, Some(super_entity.into()))
    }

    pub fn property_index(&self, name: &str) -> Option<usize> {
        self.properties.iter().position(|p| p.name == name)
    }

    pub fn property(&self, name: &str) -> Option<&PropertyDescriptor> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn require_property(&self, name: &str) -> Result<&PropertyDescriptor> {
        self.property(name).ok_or_else(|| {
            Error::plan(
                PlanErrorKind::UnknownProperty,
                format!("{} has no property '{}'", self.entity_name, name),
            )
        })
    }

    pub fn is_versioned(&self) -> bool {
        self.version.is_some()
    }

    pub fn version_column(&self) -> Option<&str> {
        self.version
            .and_then(|i| self.properties[i].columns().first())
            .map(String::as_str)
    }

    pub fn is_batch_loadable(&self) -> bool {
        self.batch_size > 1
    }

    pub fn is_cacheable(&self) -> bool {
        self.cache_region.is_some()
    }

    pub fn has_natural_id(&self) -> bool {
        !self.natural_id.is_empty()
    }

    /// Table name for a property's `table` index.
    pub fn table_for(&self, table: usize) -> &str {
        if table == 0 {
            &self.table
        } else {
            &self.secondary_tables[table - 1].table
        }
    }

    /// Versions compare by value; integer widths are interchangeable.
    pub fn is_same_version(&self, a: &Value, b: &Value) -> bool {
        a.same_identity(b)
    }

    /// Properties that hold subselect-loadable collections.
    pub fn has_subselect_collections(&self, metamodel: &MappingMetamodel) -> bool {
        self.properties.iter().any(|p| match &p.kind {
            PropertyKind::Collection { role } => metamodel
                .collection(role)
                .is_ok_and(|c| c.fetch.style == FetchStyle::Subselect),
            _ => false,
        })
    }
}

pub struct EntityBuilder {
    persister: EntityPersister,
    pending_version: Option<String>,
    pending_natural_id: Vec<String>,
    current_table: usize,
}

impl EntityBuilder {
    fn new(entity_name: String, table: Option<String>, super_entity: Option<String>) -> Self {
        Self {
            persister: EntityPersister {
                root_entity_name: entity_name.clone(),
                entity_name,
                super_entity,
                table: table.unwrap_or_default(),
                identifier_property: String::new(),
                id_columns: Vec::new(),
                version: None,
                discriminator_column: None,
                discriminator_value: None,
                properties: Vec::new(),
                natural_id: Vec::new(),
                batch_size: 1,
                cache_region: None,
                mutable: true,
                where_clause: None,
                filters: Vec::new(),
                secondary_tables: Vec::new(),
            },
            pending_version: None,
            pending_natural_id: Vec::new(),
            current_table: 0,
        }
    }

    /// Single-column identifier.
    pub fn id(self, property: impl Into<String>, column: impl Into<String>) -> Self {
        self.composite_id(property, vec![column.into()])
    }

    pub fn composite_id(mut self, property: impl Into<String>, columns: Vec<String>) -> Self {
        self.persister.identifier_property = property.into();
        self.persister.id_columns = columns;
        self
    }

    pub fn basic(mut self, name: impl Into<String>, column: impl Into<String>) -> Self {
        self.persister.properties.push(PropertyDescriptor {
            name: name.into(),
            kind: PropertyKind::Basic {
                column: column.into(),
            },
            table: self.current_table,
            cascade: Cascade::default(),
        });
        self
    }

    /// Basic property that is also the optimistic-lock version.
    pub fn version(mut self, name: impl Into<String>, column: impl Into<String>) -> Self {
        let name = name.into();
        self.pending_version = Some(name.clone());
        self.basic(name, column)
    }

    pub fn many_to_one(
        self,
        name: impl Into<String>,
        target: impl Into<String>,
        column: impl Into<String>,
        fetch: FetchStrategy,
    ) -> Self {
        self.to_one(ToOneDescriptor {
            target: target.into(),
            kind: ToOneKind::ManyToOne,
            columns: vec![column.into()],
            nullable: true,
            fetch,
        })
        .named(name)
    }

    /// One-to-one sharing the owner's identifier.
    pub fn one_to_one(
        self,
        name: impl Into<String>,
        target: impl Into<String>,
        constrained: bool,
        fetch: FetchStrategy,
    ) -> Self {
        self.to_one(ToOneDescriptor {
            target: target.into(),
            kind: ToOneKind::OneToOne { constrained },
            columns: Vec::new(),
            nullable: !constrained,
            fetch,
        })
        .named(name)
    }

    fn to_one(mut self, descriptor: ToOneDescriptor) -> Self {
        self.persister.properties.push(PropertyDescriptor {
            name: String::new(),
            kind: PropertyKind::ToOne(descriptor),
            table: self.current_table,
            cascade: Cascade::default(),
        });
        self
    }

    fn named(mut self, name: impl Into<String>) -> Self {
        if let Some(last) = self.persister.properties.last_mut() {
            last.name = name.into();
        }
        self
    }

    /// Marks the last added to-one as NOT NULL.
    pub fn required(mut self) -> Self {
        if let Some(PropertyKind::ToOne(to_one)) =
            self.persister.properties.last_mut().map(|p| &mut p.kind)
        {
            to_one.nullable = false;
        }
        self
    }

    /// Cascade styles for the last added property.
    pub fn cascade(mut self, cascade: Cascade) -> Self {
        if let Some(last) = self.persister.properties.last_mut() {
            last.cascade = cascade;
        }
        self
    }

    pub fn collection(mut self, name: impl Into<String>, role: impl Into<String>) -> Self {
        self.persister.properties.push(PropertyDescriptor {
            name: name.into(),
            kind: PropertyKind::Collection { role: role.into() },
            table: 0,
            cascade: Cascade::default(),
        });
        self
    }

    pub fn discriminator(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.persister.discriminator_column = Some(column.into());
        self.persister.discriminator_value = Some(value.into());
        self
    }

    pub fn discriminator_value(mut self, value: impl Into<Value>) -> Self {
        self.persister.discriminator_value = Some(value.into());
        self
    }

    pub fn natural_id(mut self, properties: &[&str]) -> Self {
        self.pending_natural_id = properties.iter().map(|p| (*p).to_string()).collect();
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.persister.batch_size = size.max(1);
        self
    }

    pub fn cacheable(mut self, region: impl Into<String>) -> Self {
        self.persister.cache_region = Some(region.into());
        self
    }

    pub fn immutable(mut self) -> Self {
        self.persister.mutable = false;
        self
    }

    pub fn where_clause(mut self, condition: impl Into<String>) -> Self {
        self.persister.where_clause = Some(condition.into());
        self
    }

    pub fn filter(mut self, name: impl Into<String>, condition: Option<&str>) -> Self {
        self.persister.filters.push(FilterMapping {
            name: name.into(),
            condition: condition.map(str::to_string),
        });
        self
    }

    /// Starts a secondary table; subsequent basic and to-one properties map to it.
    pub fn secondary_table(
        mut self,
        table: impl Into<String>,
        key_columns: Vec<String>,
        optional: bool,
    ) -> Self {
        self.persister.secondary_tables.push(SecondaryTable {
            table: table.into(),
            key_columns,
            optional,
        });
        self.current_table = self.persister.secondary_tables.len();
        self
    }

    pub fn build(self) -> EntityPersister {
        let mut persister = self.persister;
        if let Some(version) = self.pending_version {
            persister.version = persister.property_index(&version);
        }
        persister.natural_id = self
            .pending_natural_id
            .iter()
            .filter_map(|name| persister.property_index(name))
            .collect();
        persister
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectionKind {
    Set,
    List,
    Bag,
    Array,
}

impl CollectionKind {
    pub fn is_indexed(self) -> bool {
        matches!(self, CollectionKind::List | CollectionKind::Array)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementDescriptor {
    Basic { column: String },
    OneToMany { entity: String },
    ManyToMany { entity: String, columns: Vec<String> },
}

impl ElementDescriptor {
    pub fn entity(&self) -> Option<&str> {
        match self {
            ElementDescriptor::OneToMany { entity }
            | ElementDescriptor::ManyToMany { entity, .. } => Some(entity),
            ElementDescriptor::Basic { .. } => None,
        }
    }
}

/// Collection mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionPersister {
    pub role: String,
    pub owner_entity: String,
    pub kind: CollectionKind,
    /// Collection table; the element table for one-to-many
    pub table: String,
    pub key_columns: Vec<String>,
    pub index_column: Option<String>,
    pub element: ElementDescriptor,
    /// Ordering template with `{alias}` placeholders
    pub order_by: Option<String>,
    pub many_to_many_order_by: Option<String>,
    pub where_clause: Option<String>,
    pub filters: Vec<FilterMapping>,
    pub many_to_many_filters: Vec<FilterMapping>,
    pub fetch: FetchStrategy,
    pub batch_size: usize,
}

impl CollectionPersister {
    /// One-to-many collection: the element table carries the key columns.
    pub fn one_to_many(
        role: impl Into<String>,
        owner_entity: impl Into<String>,
        element_entity: impl Into<String>,
        element_table: impl Into<String>,
        key_columns: Vec<String>,
    ) -> CollectionBuilder {
        CollectionBuilder::new(
            role.into(),
            owner_entity.into(),
            element_table.into(),
            key_columns,
            ElementDescriptor::OneToMany {
                entity: element_entity.into(),
            },
        )
    }

    pub fn many_to_many(
        role: impl Into<String>,
        owner_entity: impl Into<String>,
        element_entity: impl Into<String>,
        table: impl Into<String>,
        key_columns: Vec<String>,
        element_columns: Vec<String>,
    ) -> CollectionBuilder {
        CollectionBuilder::new(
            role.into(),
            owner_entity.into(),
            table.into(),
            key_columns,
            ElementDescriptor::ManyToMany {
                entity: element_entity.into(),
                columns: element_columns,
            },
        )
    }

    pub fn basic(
        role: impl Into<String>,
        owner_entity: impl Into<String>,
        table: impl Into<String>,
        key_columns: Vec<String>,
        element_column: impl Into<String>,
    ) -> CollectionBuilder {
        CollectionBuilder::new(
            role.into(),
            owner_entity.into(),
            table.into(),
            key_columns,
            ElementDescriptor::Basic {
                column: element_column.into(),
            },
        )
    }

    pub fn is_one_to_many(&self) -> bool {
        matches!(self.element, ElementDescriptor::OneToMany { .. })
    }

    pub fn is_many_to_many(&self) -> bool {
        matches!(self.element, ElementDescriptor::ManyToMany { .. })
    }

    pub fn is_batch_loadable(&self) -> bool {
        self.batch_size > 1
    }

    pub fn is_array(&self) -> bool {
        self.kind == CollectionKind::Array
    }

    pub fn has_ordering(&self) -> bool {
        self.order_by.is_some()
    }

    pub fn has_many_to_many_ordering(&self) -> bool {
        self.is_many_to_many() && self.many_to_many_order_by.is_some()
    }

    /// Property name on the owner (last segment of the role).
    pub fn property_name(&self) -> &str {
        self.role.rsplit('.').next().unwrap_or(&self.role)
    }
}

pub struct CollectionBuilder {
    persister: CollectionPersister,
}

impl CollectionBuilder {
    fn new(
        role: String,
        owner_entity: String,
        table: String,
        key_columns: Vec<String>,
        element: ElementDescriptor,
    ) -> Self {
        Self {
            persister: CollectionPersister {
                role,
                owner_entity,
                kind: CollectionKind::Set,
                table,
                key_columns,
                index_column: None,
                element,
                order_by: None,
                many_to_many_order_by: None,
                where_clause: None,
                filters: Vec::new(),
                many_to_many_filters: Vec::new(),
                fetch: FetchStrategy::LAZY_SELECT,
                batch_size: 1,
            },
        }
    }

    pub fn kind(mut self, kind: CollectionKind) -> Self {
        self.persister.kind = kind;
        self
    }

    pub fn index(mut self, column: impl Into<String>) -> Self {
        self.persister.index_column = Some(column.into());
        self
    }

    pub fn order_by(mut self, template: impl Into<String>) -> Self {
        self.persister.order_by = Some(template.into());
        self
    }

    pub fn many_to_many_order_by(mut self, template: impl Into<String>) -> Self {
        self.persister.many_to_many_order_by = Some(template.into());
        self
    }

    pub fn where_clause(mut self, condition: impl Into<String>) -> Self {
        self.persister.where_clause = Some(condition.into());
        self
    }

    pub fn filter(mut self, name: impl Into<String>, condition: Option<&str>) -> Self {
        self.persister.filters.push(FilterMapping {
            name: name.into(),
            condition: condition.map(str::to_string),
        });
        self
    }

    pub fn many_to_many_filter(mut self, name: impl Into<String>, condition: Option<&str>) -> Self {
        self.persister.many_to_many_filters.push(FilterMapping {
            name: name.into(),
            condition: condition.map(str::to_string),
        });
        self
    }

    pub fn fetch(mut self, fetch: FetchStrategy) -> Self {
        self.persister.fetch = fetch;
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.persister.batch_size = size.max(1);
        self
    }

    pub fn build(self) -> CollectionPersister {
        self.persister
    }
}

/// The validated, immutable set of mappings.
#[derive(Debug, Default)]
pub struct MappingMetamodel {
    entities: HashMap<String, Arc<EntityPersister>>,
    collections: HashMap<String, Arc<CollectionPersister>>,
    filters: HashMap<String, Arc<FilterDefinition>>,
    fetch_profiles: HashMap<String, FetchProfile>,
    subclasses: HashMap<String, Vec<String>>,
}

impl MappingMetamodel {
    pub fn builder() -> MetamodelBuilder {
        MetamodelBuilder::default()
    }

    pub fn entity(&self, name: &str) -> Result<&Arc<EntityPersister>> {
        self.entities.get(name).ok_or_else(|| {
            Error::plan(
                PlanErrorKind::UnknownEntity,
                format!("unknown entity '{}'", name),
            )
        })
    }

    pub fn collection(&self, role: &str) -> Result<&Arc<CollectionPersister>> {
        self.collections.get(role).ok_or_else(|| {
            Error::plan(
                PlanErrorKind::UnknownRole,
                format!("unknown collection role '{}'", role),
            )
        })
    }

    pub fn filter_definition(&self, name: &str) -> Option<&Arc<FilterDefinition>> {
        self.filters.get(name)
    }

    pub fn fetch_profile(&self, name: &str) -> Option<&FetchProfile> {
        self.fetch_profiles.get(name)
    }

    /// Direct subclasses of an entity.
    pub fn subclasses_of(&self, entity: &str) -> &[String] {
        self.subclasses.get(entity).map_or(&[], Vec::as_slice)
    }

    /// True when `entity` is `ancestor` or inherits from it.
    pub fn is_subtype(&self, entity: &str, ancestor: &str) -> bool {
        let mut current = Some(entity);
        while let Some(name) = current {
            if name == ancestor {
                return true;
            }
            current = self
                .entities
                .get(name)
                .and_then(|p| p.super_entity.as_deref());
        }
        false
    }

    /// The entity and all of its descendants, pre-order.
    pub fn hierarchy(&self, entity: &str) -> Vec<Arc<EntityPersister>> {
        let mut out = Vec::new();
        let mut stack = vec![entity.to_string()];
        while let Some(name) = stack.pop() {
            if let Some(p) = self.entities.get(&name) {
                out.push(Arc::clone(p));
            }
            for sub in self.subclasses_of(&name).iter().rev() {
                stack.push(sub.clone());
            }
        }
        out
    }

    /// Properties of the entity and its subclasses, deduplicated by name.
    pub fn hierarchy_properties(&self, entity: &str) -> Vec<PropertyDescriptor> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for persister in self.hierarchy(entity) {
            for property in &persister.properties {
                if seen.insert(property.name.clone()) {
                    out.push(property.clone());
                }
            }
        }
        out
    }

    /// Resolve the concrete persister for a discriminator value read from a
    /// row of `entity`'s hierarchy.
    pub fn subclass_for_discriminator(
        &self,
        entity: &str,
        value: &Value,
    ) -> Option<&Arc<EntityPersister>> {
        let root = self.entities.get(entity)?.root_entity_name.clone();
        self.hierarchy(&root).into_iter().find_map(|p| {
            p.discriminator_value
                .as_ref()
                .filter(|v| v.same_identity(value))
                .and_then(|_| self.entities.get(&p.entity_name))
        })
    }

    /// Whether any enabled filter applies to the entity or its collections.
    pub fn entity_affected_by_filters(&self, entity: &str, enabled: &dyn Fn(&str) -> bool) -> bool {
        self.hierarchy(entity).iter().any(|p| {
            p.filters.iter().any(|f| enabled(&f.name))
                || p.properties.iter().any(|prop| match &prop.kind {
                    PropertyKind::Collection { role } => self
                        .collections
                        .get(role)
                        .is_some_and(|c| self.collection_affected_by_filters(c, enabled)),
                    _ => false,
                })
        })
    }

    pub fn collection_affected_by_filters(
        &self,
        collection: &CollectionPersister,
        enabled: &dyn Fn(&str) -> bool,
    ) -> bool {
        collection.filters.iter().any(|f| enabled(&f.name))
            || collection.many_to_many_filters.iter().any(|f| enabled(&f.name))
            || collection.element.entity().is_some_and(|e| {
                collection.is_one_to_many()
                    && self
                        .entities
                        .get(e)
                        .is_some_and(|p| p.filters.iter().any(|f| enabled(&f.name)))
            })
    }

    /// Whether a fetch profile overrides any association of the entity.
    pub fn profile_affects(&self, profile: &str, entity: &str) -> bool {
        self.fetch_profiles.get(profile).is_some_and(|p| {
            p.fetches
                .iter()
                .any(|f| self.is_subtype(entity, &f.entity) || self.is_subtype(&f.entity, entity))
        })
    }

    pub fn entities(&self) -> impl Iterator<Item = &Arc<EntityPersister>> {
        self.entities.values()
    }
}

#[derive(Default)]
pub struct MetamodelBuilder {
    entities: Vec<EntityPersister>,
    collections: Vec<CollectionPersister>,
    filters: Vec<FilterDefinition>,
    fetch_profiles: Vec<FetchProfile>,
}

impl MetamodelBuilder {
    pub fn entity(mut self, persister: EntityPersister) -> Self {
        self.entities.push(persister);
        self
    }

    pub fn collection(mut self, persister: CollectionPersister) -> Self {
        self.collections.push(persister);
        self
    }

    pub fn filter(
        mut self,
        name: impl Into<String>,
        default_condition: impl Into<String>,
        parameters: &[&str],
    ) -> Self {
        self.filters.push(FilterDefinition {
            name: name.into(),
            default_condition: default_condition.into(),
            parameters: parameters.iter().map(|p| (*p).to_string()).collect(),
        });
        self
    }

    pub fn fetch_profile(mut self, profile: FetchProfile) -> Self {
        self.fetch_profiles.push(profile);
        self
    }

    /// Validate cross references and resolve single-table inheritance.
    pub fn build(self) -> Result<MappingMetamodel> {
        let mut raw: HashMap<String, EntityPersister> = HashMap::new();
        let mut order = Vec::new();
        for entity in self.entities {
            order.push(entity.entity_name.clone());
            raw.insert(entity.entity_name.clone(), entity);
        }

        let mut subclasses: HashMap<String, Vec<String>> = HashMap::new();
        let mut resolved: HashMap<String, EntityPersister> = HashMap::new();
        let mut remaining = order.clone();
        while !remaining.is_empty() {
            let before = remaining.len();
            remaining.retain(|name| {
                let Some(entity) = raw.get(name) else {
                    return false;
                };
                match &entity.super_entity {
                    None => {
                        resolved.insert(name.clone(), entity.clone());
                        false
                    }
                    Some(parent) => match resolved.get(parent) {
                        Some(parent) => {
                            let merged = inherit(parent, entity);
                            subclasses
                                .entry(parent.entity_name.clone())
                                .or_default()
                                .push(name.clone());
                            resolved.insert(name.clone(), merged);
                            false
                        }
                        None => true,
                    },
                }
            });
            if remaining.len() == before {
                return Err(Error::plan(
                    PlanErrorKind::UnknownEntity,
                    format!(
                        "unresolvable superclass for entities: {}",
                        remaining.join(", ")
                    ),
                ));
            }
        }

        let collections: HashMap<String, Arc<CollectionPersister>> = self
            .collections
            .into_iter()
            .map(|c| (c.role.clone(), Arc::new(c)))
            .collect();

        for entity in resolved.values() {
            if entity.id_columns.is_empty() {
                return Err(Error::plan(
                    PlanErrorKind::InvalidArgument,
                    format!("entity '{}' has no identifier columns", entity.entity_name),
                ));
            }
            for property in &entity.properties {
                match &property.kind {
                    PropertyKind::ToOne(to_one) if !resolved.contains_key(&to_one.target) => {
                        return Err(Error::plan(
                            PlanErrorKind::UnknownEntity,
                            format!(
                                "{}.{} targets unknown entity '{}'",
                                entity.entity_name, property.name, to_one.target
                            ),
                        ));
                    }
                    PropertyKind::Collection { role } if !collections.contains_key(role) => {
                        return Err(Error::plan(
                            PlanErrorKind::UnknownRole,
                            format!(
                                "{}.{} references unknown role '{}'",
                                entity.entity_name, property.name, role
                            ),
                        ));
                    }
                    _ => {}
                }
            }
        }
        for collection in collections.values() {
            if let Some(element) = collection.element.entity() {
                if !resolved.contains_key(element) {
                    return Err(Error::plan(
                        PlanErrorKind::UnknownEntity,
                        format!(
                            "collection '{}' has unknown element entity '{}'",
                            collection.role, element
                        ),
                    ));
                }
            }
        }

        tracing::debug!(
            entities = resolved.len(),
            collections = collections.len(),
            "Built mapping metamodel"
        );

        Ok(MappingMetamodel {
            entities: resolved
                .into_iter()
                .map(|(k, v)| (k, Arc::new(v)))
                .collect(),
            collections,
            filters: self
                .filters
                .into_iter()
                .map(|f| (f.name.clone(), Arc::new(f)))
                .collect(),
            fetch_profiles: self
                .fetch_profiles
                .into_iter()
                .map(|p| (p.name.clone(), p))
                .collect(),
            subclasses,
        })
    }
}

fn inherit(parent: &EntityPersister, child: &EntityPersister) -> EntityPersister {
    let mut properties = parent.properties.clone();
    for p in &child.properties {
        if !properties.iter().any(|existing| existing.name == p.name) {
            properties.push(p.clone());
        }
    }
    let natural_id = if child.natural_id.is_empty() {
        parent.natural_id.clone()
    } else {
        child
            .natural_id
            .iter()
            .filter_map(|i| child.properties.get(*i))
            .filter_map(|p| properties.iter().position(|q| q.name == p.name))
            .collect()
    };
    EntityPersister {
        entity_name: child.entity_name.clone(),
        root_entity_name: parent.root_entity_name.clone(),
        super_entity: Some(parent.entity_name.clone()),
        table: parent.table.clone(),
        identifier_property: parent.identifier_property.clone(),
        id_columns: parent.id_columns.clone(),
        version: parent.version,
        discriminator_column: parent.discriminator_column.clone(),
        discriminator_value: child.discriminator_value.clone(),
        properties,
        natural_id,
        batch_size: parent.batch_size,
        cache_region: parent.cache_region.clone(),
        mutable: parent.mutable && child.mutable,
        where_clause: parent.where_clause.clone(),
        filters: parent.filters.clone(),
        secondary_tables: parent.secondary_tables.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metamodel() -> MappingMetamodel {
        MappingMetamodel::builder()
            .entity(
                EntityPersister::builder("Customer", "customers")
                    .id("id", "id")
                    .version("version", "version")
                    .basic("name", "name")
                    .discriminator("kind", "C")
                    .collection("orders", "Customer.orders")
                    .build(),
            )
            .entity(
                EntityPersister::subclass("Premium", "Customer")
                    .discriminator_value("P")
                    .basic("tier", "tier")
                    .build(),
            )
            .entity(
                EntityPersister::builder("Order", "orders")
                    .id("id", "id")
                    .many_to_one("customer", "Customer", "customer_id", FetchStrategy::LAZY_SELECT)
                    .filter("open", None)
                    .build(),
            )
            .collection(
                CollectionPersister::one_to_many(
                    "Customer.orders",
                    "Customer",
                    "Order",
                    "orders",
                    vec!["customer_id".to_string()],
                )
                .build(),
            )
            .filter("open", "{alias}.status = :status", &["status"])
            .build()
            .expect("valid metamodel")
    }

    #[test]
    fn subclass_inherits_root_mapping() {
        let mm = metamodel();
        let premium = mm.entity("Premium").unwrap();
        assert_eq!(premium.table, "customers");
        assert_eq!(premium.root_entity_name, "Customer");
        assert_eq!(premium.id_columns, vec!["id".to_string()]);
        assert!(premium.property("tier").is_some());
        assert!(premium.property("name").is_some());
        assert_eq!(premium.version_column(), Some("version"));
        assert!(mm.is_subtype("Premium", "Customer"));
        assert!(!mm.is_subtype("Customer", "Premium"));
    }

    #[test]
    fn discriminator_resolution() {
        let mm = metamodel();
        let p = mm
            .subclass_for_discriminator("Customer", &Value::Text("P".into()))
            .unwrap();
        assert_eq!(p.entity_name, "Premium");
        assert!(
            mm.subclass_for_discriminator("Customer", &Value::Text("X".into()))
                .is_none()
        );
    }

    #[test]
    fn hierarchy_properties_are_deduplicated() {
        let mm = metamodel();
        let names: Vec<_> = mm
            .hierarchy_properties("Customer")
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec!["version", "name", "orders", "tier"]);
    }

    #[test]
    fn filters_reach_through_one_to_many_elements() {
        let mm = metamodel();
        assert!(mm.entity_affected_by_filters("Customer", &|name| name == "open"));
        assert!(!mm.entity_affected_by_filters("Customer", &|_| false));
    }

    #[test]
    fn unknown_targets_fail_validation() {
        let err = MappingMetamodel::builder()
            .entity(
                EntityPersister::builder("A", "a")
                    .id("id", "id")
                    .many_to_one("b", "B", "b_id", FetchStrategy::JOIN)
                    .build(),
            )
            .build()
            .unwrap_err();
        assert!(err.is_plan_error());
    }
}
