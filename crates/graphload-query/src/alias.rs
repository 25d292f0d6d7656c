//! Deterministic, collision-free SQL aliases for the nodes of a load plan.
//!
//! Every entity reference, collection reference and association edge is
//! resolved at most once per context; repeated lookups return the memoized
//! value. One counter feeds both table aliases (`customer0_`) and column
//! suffixes (`0_`), and a consumed number is never handed out again.

use std::borrow::Cow;
use std::collections::HashMap;

use graphload_core::{
    CollectionPersister, ElementDescriptor, EntityPersister, Error, LoadPlan, MappingMetamodel,
    NodeId, NodeKind, PlanErrorKind, PropertyKind, Result,
};

const ALIAS_TRUNCATE_LENGTH: usize = 10;

/// Precomputed suffix tokens for the common case.
const SUFFIX_POOL: [&str; 40] = [
    "0_", "1_", "2_", "3_", "4_", "5_", "6_", "7_", "8_", "9_", "10_", "11_", "12_", "13_",
    "14_", "15_", "16_", "17_", "18_", "19_", "20_", "21_", "22_", "23_", "24_", "25_", "26_",
    "27_", "28_", "29_", "30_", "31_", "32_", "33_", "34_", "35_", "36_", "37_", "38_", "39_",
];

/// Column-alias suffix for a counter value.
pub fn suffix(n: usize) -> Cow<'static, str> {
    match SUFFIX_POOL.get(n) {
        Some(s) => Cow::Borrowed(s),
        None => Cow::Owned(format!("{n}_")),
    }
}

/// Table alias for a description (entity name, role or table) and a counter.
pub fn generate_alias(description: &str, n: usize) -> String {
    let unqualified = description.rsplit('.').next().unwrap_or(description);
    let truncated: String = unqualified.chars().take(ALIAS_TRUNCATE_LENGTH).collect();
    let lowered = truncated.to_lowercase().replace(['/', '$'], "_");
    let mut root: String = lowered
        .trim_start_matches(|c: char| !c.is_ascii_alphabetic())
        .to_string();
    if root.is_empty() {
        root.push('x');
    } else if root.ends_with(|c: char| c.is_ascii_digit()) {
        root.push('x');
    }
    format!("{root}{n}_")
}

/// Alias of a secondary table joined to a primary table alias.
pub fn secondary_table_alias(base: &str, table: usize) -> String {
    if table == 0 {
        base.to_string()
    } else {
        format!("{base}{table}_")
    }
}

/// `{column}_{suffix}`, or `{column}{n}_{suffix}` with the first `n` from
/// the column's table index that no issued alias uses.
fn unique_column_alias(issued: &[String], column: &str, table: usize, suffix: &str) -> String {
    let taken = |alias: &str| issued.iter().any(|a| a.eq_ignore_ascii_case(alias));
    let plain = format!("{column}_{suffix}");
    if !taken(&plain) {
        return plain;
    }
    (table..)
        .map(|n| format!("{column}{n}_{suffix}"))
        .find(|alias| !taken(alias))
        .unwrap_or(plain)
}

/// Column aliases of one entity reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityAliases {
    pub suffix: String,
    pub identifier: Vec<String>,
    pub discriminator: Option<String>,
    /// (table index, column, alias) for every property column of the hierarchy
    columns: Vec<(usize, String, String)>,
}

impl EntityAliases {
    fn new(metamodel: &MappingMetamodel, persister: &EntityPersister, suffix: &str) -> Self {
        let identifier: Vec<String> = persister
            .id_columns
            .iter()
            .map(|c| format!("{c}_{suffix}"))
            .collect();
        let properties = metamodel.hierarchy_properties(&persister.entity_name);
        let on_primary = |column: &str| {
            properties
                .iter()
                .any(|p| p.table == 0 && p.columns().iter().any(|c| c.eq_ignore_ascii_case(column)))
        };
        // Every alias handed out so far, so no two select items share one.
        let mut issued = identifier.clone();
        if let Some(d) = persister.discriminator_column.as_deref().filter(|d| !on_primary(d)) {
            issued.push(format!("{d}_{suffix}"));
        }
        let mut columns: Vec<(usize, String, String)> = Vec::new();
        for property in &properties {
            for column in property.columns() {
                if columns
                    .iter()
                    .any(|(t, c, _)| *t == property.table && c.eq_ignore_ascii_case(column))
                    || (property.table == 0
                        && persister.id_columns.iter().any(|id| id.eq_ignore_ascii_case(column)))
                {
                    continue;
                }
                let alias = unique_column_alias(&issued, column, property.table, suffix);
                issued.push(alias.clone());
                columns.push((property.table, column.clone(), alias));
            }
        }
        let discriminator = persister.discriminator_column.as_ref().map(|d| {
            columns
                .iter()
                .find(|(t, c, _)| *t == 0 && c.eq_ignore_ascii_case(d))
                .map_or_else(|| format!("{d}_{suffix}"), |(_, _, a)| a.clone())
        });
        Self {
            suffix: suffix.to_string(),
            identifier,
            discriminator,
            columns,
        }
    }

    /// Alias of a property column; identifier columns resolve to their id alias.
    pub fn column(&self, table: usize, column: &str) -> Option<&str> {
        self.columns
            .iter()
            .find(|(t, c, _)| *t == table && c.eq_ignore_ascii_case(column))
            .map(|(_, _, a)| a.as_str())
    }

    /// Aliases of a property's columns.
    pub fn property_aliases(
        &self,
        persister: &EntityPersister,
        property: &str,
    ) -> Option<Vec<String>> {
        let descriptor = persister.property(property)?;
        if let PropertyKind::ToOne(to_one) = &descriptor.kind {
            if to_one.is_shared_key() {
                return Some(self.identifier.clone());
            }
        }
        descriptor
            .columns()
            .iter()
            .map(|c| {
                if descriptor.table == 0 {
                    if let Some(pos) = persister
                        .id_columns
                        .iter()
                        .position(|id| id.eq_ignore_ascii_case(c))
                    {
                        return Some(self.identifier[pos].clone());
                    }
                }
                self.column(descriptor.table, c).map(str::to_string)
            })
            .collect()
    }

    /// (table index, column, alias) triples in select order.
    pub fn columns(&self) -> impl Iterator<Item = (usize, &str, &str)> {
        self.columns
            .iter()
            .map(|(t, c, a)| (*t, c.as_str(), a.as_str()))
    }
}

/// Column aliases of one collection reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionAliases {
    pub suffix: String,
    pub key: Vec<String>,
    pub index: Option<String>,
    pub element: Vec<String>,
}

impl CollectionAliases {
    fn new(
        metamodel: &MappingMetamodel,
        persister: &CollectionPersister,
        suffix: &str,
    ) -> Result<Self> {
        let key = persister
            .key_columns
            .iter()
            .map(|c| format!("{c}_{suffix}"))
            .collect();
        let index = persister
            .index_column
            .as_ref()
            .map(|c| format!("{c}_{suffix}"));
        let element_columns: Vec<String> = match &persister.element {
            ElementDescriptor::Basic { column } => vec![column.clone()],
            ElementDescriptor::ManyToMany { columns, .. } => columns.clone(),
            ElementDescriptor::OneToMany { entity } => metamodel.entity(entity)?.id_columns.clone(),
        };
        let element = element_columns
            .iter()
            .map(|c| format!("{c}_{suffix}"))
            .map(|a| {
                if persister.key_columns.iter().any(|k| format!("{k}_{suffix}") == a) {
                    format!("elt_{a}")
                } else {
                    a
                }
            })
            .collect();
        Ok(Self {
            suffix: suffix.to_string(),
            key,
            index,
            element,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityReferenceAliases {
    pub table_alias: String,
    pub columns: EntityAliases,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionReferenceAliases {
    pub table_alias: String,
    pub columns: CollectionAliases,
}

/// Aliases of one join edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationAliases {
    pub lhs_alias: String,
    /// Qualified lhs columns (`customer0_.address_id`)
    pub lhs_columns: Vec<String>,
    pub rhs_alias: String,
    pub rhs_columns: Vec<String>,
}

/// Memoizing alias resolver for one compilation.
#[derive(Debug, Clone, Default)]
pub struct AliasResolutionContext {
    counter: usize,
    entities: HashMap<NodeId, EntityReferenceAliases>,
    collections: HashMap<NodeId, CollectionReferenceAliases>,
    associations: HashMap<NodeId, AssociationAliases>,
}

impl AliasResolutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    fn next(&mut self) -> usize {
        let n = self.counter;
        self.counter += 1;
        n
    }

    /// Number of suffixes consumed so far.
    pub fn consumed(&self) -> usize {
        self.counter
    }

    pub fn entity(&self, node: NodeId) -> Option<&EntityReferenceAliases> {
        self.entities.get(&node)
    }

    pub fn collection(&self, node: NodeId) -> Option<&CollectionReferenceAliases> {
        self.collections.get(&node)
    }

    pub fn association(&self, node: NodeId) -> Option<&AssociationAliases> {
        self.associations.get(&node)
    }

    /// Resolve the aliases of an entity reference.
    pub fn resolve_entity_reference(
        &mut self,
        metamodel: &MappingMetamodel,
        plan: &LoadPlan,
        node: NodeId,
    ) -> Result<EntityReferenceAliases> {
        if let Some(existing) = self.entities.get(&node) {
            return Ok(existing.clone());
        }
        let plan_node = plan.get(node).ok_or_else(|| {
            Error::plan(
                PlanErrorKind::MalformedTree,
                format!("node {} is not part of the plan", node.0),
            )
        })?;
        let entity = match &plan_node.kind {
            NodeKind::EntityReturn { entity } => entity,
            NodeKind::EntityFetch { entity, .. } => {
                require_entity_owner(plan, node)?;
                entity
            }
            NodeKind::CollectionElement { entity } => {
                require_collection_owner(plan, node)?;
                entity
            }
            other => {
                return Err(Error::plan(
                    PlanErrorKind::MalformedTree,
                    format!("{:?} is not an entity reference", other),
                ));
            }
        };
        let persister = metamodel.entity(entity)?;
        let n = self.next();
        let aliases = EntityReferenceAliases {
            table_alias: generate_alias(&persister.entity_name, n),
            columns: EntityAliases::new(metamodel, persister, &suffix(n)),
        };
        tracing::trace!(node = node.0, alias = %aliases.table_alias, "Resolved entity reference aliases");
        self.entities.insert(node, aliases.clone());
        Ok(aliases)
    }

    /// Resolve the aliases of a collection reference. One-to-many collections
    /// share their element's table alias but get their own column suffix.
    pub fn resolve_collection_reference(
        &mut self,
        metamodel: &MappingMetamodel,
        plan: &LoadPlan,
        node: NodeId,
    ) -> Result<CollectionReferenceAliases> {
        if let Some(existing) = self.collections.get(&node) {
            return Ok(existing.clone());
        }
        let plan_node = plan.get(node).ok_or_else(|| {
            Error::plan(
                PlanErrorKind::MalformedTree,
                format!("node {} is not part of the plan", node.0),
            )
        })?;
        let role = match &plan_node.kind {
            NodeKind::CollectionReturn { role } => role,
            NodeKind::CollectionFetch { role, .. } => {
                require_entity_owner(plan, node)?;
                role
            }
            other => {
                return Err(Error::plan(
                    PlanErrorKind::MalformedTree,
                    format!("{:?} is not a collection reference", other),
                ));
            }
        };
        let persister = metamodel.collection(role)?;
        let aliases = if let ElementDescriptor::OneToMany { entity } = &persister.element {
            let table_alias = match plan.element_of(node) {
                Some(element) => {
                    self.resolve_entity_reference(metamodel, plan, element)?
                        .table_alias
                }
                None => {
                    let n = self.next();
                    generate_alias(entity, n)
                }
            };
            let n = self.next();
            CollectionReferenceAliases {
                table_alias,
                columns: CollectionAliases::new(metamodel, persister, &suffix(n))?,
            }
        } else {
            let n = self.next();
            CollectionReferenceAliases {
                table_alias: generate_alias(&persister.role, n),
                columns: CollectionAliases::new(metamodel, persister, &suffix(n))?,
            }
        };
        tracing::trace!(node = node.0, alias = %aliases.table_alias, "Resolved collection reference aliases");
        self.collections.insert(node, aliases.clone());
        Ok(aliases)
    }

    /// Resolve the join edge leading to `node`. One-to-many elements have no
    /// edge of their own and resolve to `None`.
    pub fn resolve_association(
        &mut self,
        metamodel: &MappingMetamodel,
        plan: &LoadPlan,
        node: NodeId,
    ) -> Result<Option<AssociationAliases>> {
        if let Some(existing) = self.associations.get(&node) {
            return Ok(Some(existing.clone()));
        }
        let plan_node = plan.node(node);
        let Some(owner) = plan_node.parent else {
            return Ok(None);
        };
        let aliases = match &plan_node.kind {
            NodeKind::EntityFetch { property, .. } => {
                let owner_aliases = self.resolve_entity_reference(metamodel, plan, owner)?;
                let owner_persister = owner_persister(metamodel, plan, owner)?;
                let descriptor = owner_persister.require_property(property)?;
                let PropertyKind::ToOne(to_one) = &descriptor.kind else {
                    return Err(Error::plan(
                        PlanErrorKind::MalformedTree,
                        format!("{} is not a to-one association", property),
                    ));
                };
                let target = self.resolve_entity_reference(metamodel, plan, node)?;
                let target_persister = metamodel.entity(&to_one.target)?;
                let (lhs_alias, lhs_cols) = if to_one.is_shared_key() {
                    (owner_aliases.table_alias.clone(), owner_persister.id_columns.clone())
                } else {
                    (
                        secondary_table_alias(&owner_aliases.table_alias, descriptor.table),
                        to_one.columns.clone(),
                    )
                };
                AssociationAliases {
                    lhs_columns: qualify(&lhs_alias, &lhs_cols),
                    lhs_alias,
                    rhs_alias: target.table_alias,
                    rhs_columns: target_persister.id_columns.clone(),
                }
            }
            NodeKind::CollectionFetch { role, .. } => {
                let owner_aliases = self.resolve_entity_reference(metamodel, plan, owner)?;
                let owner_persister = owner_persister(metamodel, plan, owner)?;
                let collection = metamodel.collection(role)?;
                let target = self.resolve_collection_reference(metamodel, plan, node)?;
                AssociationAliases {
                    lhs_columns: qualify(&owner_aliases.table_alias, &owner_persister.id_columns),
                    lhs_alias: owner_aliases.table_alias,
                    rhs_alias: target.table_alias,
                    rhs_columns: collection.key_columns.clone(),
                }
            }
            NodeKind::CollectionElement { entity } => {
                require_collection_owner(plan, node)?;
                let role = plan.node(owner).kind.role().unwrap_or_default().to_string();
                let collection = metamodel.collection(&role)?;
                let ElementDescriptor::ManyToMany { columns, .. } = &collection.element else {
                    return Ok(None);
                };
                let bridge = self.resolve_collection_reference(metamodel, plan, owner)?;
                let target = self.resolve_entity_reference(metamodel, plan, node)?;
                AssociationAliases {
                    lhs_columns: qualify(&bridge.table_alias, columns),
                    lhs_alias: bridge.table_alias,
                    rhs_alias: target.table_alias,
                    rhs_columns: metamodel.entity(entity)?.id_columns.clone(),
                }
            }
            _ => return Ok(None),
        };
        self.associations.insert(node, aliases.clone());
        Ok(Some(aliases))
    }
}

fn qualify(alias: &str, columns: &[String]) -> Vec<String> {
    columns.iter().map(|c| format!("{alias}.{c}")).collect()
}

fn require_entity_owner(plan: &LoadPlan, node: NodeId) -> Result<()> {
    let owner = plan.node(node).parent;
    match owner.map(|o| &plan.node(o).kind) {
        Some(kind) if kind.is_entity_reference() => Ok(()),
        _ => Err(Error::plan(
            PlanErrorKind::MalformedTree,
            format!(
                "fetch '{}' must be owned by an entity reference",
                plan.path(node)
            ),
        )),
    }
}

fn require_collection_owner(plan: &LoadPlan, node: NodeId) -> Result<()> {
    let owner = plan.node(node).parent;
    match owner.map(|o| &plan.node(o).kind) {
        Some(kind) if kind.is_collection_reference() => Ok(()),
        _ => Err(Error::plan(
            PlanErrorKind::MalformedTree,
            "collection element must be owned by a collection reference",
        )),
    }
}

fn owner_persister<'m>(
    metamodel: &'m MappingMetamodel,
    plan: &LoadPlan,
    owner: NodeId,
) -> Result<&'m std::sync::Arc<EntityPersister>> {
    let entity = plan.node(owner).kind.entity().ok_or_else(|| {
        Error::plan(
            PlanErrorKind::MalformedTree,
            "association owner is not an entity reference",
        )
    })?;
    metamodel.entity(entity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphload_core::{CollectionPersister, FetchStrategy};
    use std::collections::HashSet;

    fn metamodel() -> MappingMetamodel {
        MappingMetamodel::builder()
            .entity(
                EntityPersister::builder("Customer", "customers")
                    .id("id", "id")
                    .basic("name", "name")
                    .many_to_one("address", "Address", "address_id", FetchStrategy::JOIN)
                    .collection("orders", "Customer.orders")
                    .collection("tags", "Customer.tags")
                    .build(),
            )
            .entity(
                EntityPersister::builder("Address", "addresses")
                    .id("id", "id")
                    .basic("city", "city")
                    .build(),
            )
            .entity(
                EntityPersister::builder("Order", "orders")
                    .id("id", "id")
                    .basic("total", "total")
                    .build(),
            )
            .entity(
                EntityPersister::builder("Tag", "tags")
                    .id("id", "id")
                    .basic("label", "label")
                    .build(),
            )
            .collection(
                CollectionPersister::one_to_many(
                    "Customer.orders",
                    "Customer",
                    "Order",
                    "orders",
                    vec!["customer_id".into()],
                )
                .build(),
            )
            .collection(
                CollectionPersister::many_to_many(
                    "Customer.tags",
                    "Customer",
                    "Tag",
                    "customer_tags",
                    vec!["customer_id".into()],
                    vec!["tag_id".into()],
                )
                .build(),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn alias_generation() {
        assert_eq!(generate_alias("Customer", 0), "customer0_");
        assert_eq!(generate_alias("Customer.orders", 3), "orders3_");
        assert_eq!(generate_alias("VeryLongEntityName", 1), "verylongen1_");
        assert_eq!(generate_alias("Table2", 4), "table2x4_");
        assert_eq!(generate_alias("_9lives", 2), "lives2_");
        assert_eq!(suffix(7), "7_");
        assert_eq!(suffix(41), "41_");
    }

    #[test]
    fn resolution_is_memoized() {
        let mm = metamodel();
        let (plan, root) = LoadPlan::for_entity("Customer");
        let mut ctx = AliasResolutionContext::new();
        let a = ctx.resolve_entity_reference(&mm, &plan, root).unwrap();
        let b = ctx.resolve_entity_reference(&mm, &plan, root).unwrap();
        assert_eq!(a, b);
        assert_eq!(ctx.consumed(), 1);
        assert_eq!(a.table_alias, "customer0_");
        assert_eq!(a.columns.identifier, vec!["id_0_".to_string()]);
        assert_eq!(a.columns.column(0, "name"), Some("name_0_"));
    }

    #[test]
    fn one_to_many_shares_table_alias_with_distinct_suffix() {
        let mm = metamodel();
        let (mut plan, root) = LoadPlan::for_entity("Customer");
        let orders = plan.add_collection_fetch(root, "orders", "Customer.orders", FetchStrategy::JOIN);
        let order = plan.add_collection_element(orders, "Order");
        let mut ctx = AliasResolutionContext::new();
        ctx.resolve_entity_reference(&mm, &plan, root).unwrap();
        let coll = ctx.resolve_collection_reference(&mm, &plan, orders).unwrap();
        let elem = ctx.resolve_entity_reference(&mm, &plan, order).unwrap();
        assert_eq!(coll.table_alias, elem.table_alias);
        assert_ne!(coll.columns.suffix, elem.columns.suffix);
        assert_eq!(coll.columns.key, vec!["customer_id_2_".to_string()]);
        assert!(ctx.resolve_association(&mm, &plan, order).unwrap().is_none());
    }

    #[test]
    fn all_aliases_unique() {
        let mm = metamodel();
        let (mut plan, root) = LoadPlan::for_entity("Customer");
        let address = plan.add_entity_fetch(root, "address", "Address", FetchStrategy::JOIN);
        let tags = plan.add_collection_fetch(root, "tags", "Customer.tags", FetchStrategy::JOIN);
        let tag = plan.add_collection_element(tags, "Tag");
        let mut ctx = AliasResolutionContext::new();
        let mut tables = HashSet::new();
        let mut columns = HashSet::new();
        for node in [root, address, tag] {
            let a = ctx.resolve_entity_reference(&mm, &plan, node).unwrap();
            assert!(tables.insert(a.table_alias.clone()));
            for alias in a.columns.identifier.iter().cloned() {
                assert!(columns.insert(alias));
            }
            for (_, _, alias) in a.columns.columns() {
                assert!(columns.insert(alias.to_string()));
            }
        }
        let c = ctx.resolve_collection_reference(&mm, &plan, tags).unwrap();
        assert!(tables.insert(c.table_alias.clone()));
        for alias in c.columns.key.iter().chain(&c.columns.element) {
            assert!(columns.insert(alias.clone()));
        }

        let edge = ctx.resolve_association(&mm, &plan, tag).unwrap().unwrap();
        assert_eq!(edge.lhs_alias, c.table_alias);
        assert_eq!(edge.lhs_columns, vec![format!("{}.tag_id", c.table_alias)]);
    }

    #[test]
    fn clashing_column_aliases_are_disambiguated() {
        let mm = MappingMetamodel::builder()
            .entity(
                EntityPersister::builder("Person", "people")
                    .id("id", "id")
                    .basic("name", "name")
                    .basic("nickname", "name1")
                    .secondary_table("person_details", vec!["person_id".into()], true)
                    .basic("legacy_id", "id")
                    .basic("display_name", "name")
                    .build(),
            )
            .build()
            .unwrap();
        let (plan, root) = LoadPlan::for_entity("Person");
        let mut ctx = AliasResolutionContext::new();
        let person = ctx.resolve_entity_reference(&mm, &plan, root).unwrap();

        let mut seen = HashSet::new();
        let issued = person
            .columns
            .identifier
            .iter()
            .map(String::as_str)
            .chain(person.columns.columns().map(|(_, _, alias)| alias));
        for alias in issued {
            assert!(seen.insert(alias.to_string()), "{alias} issued twice");
        }
        assert_eq!(person.columns.column(0, "name1"), Some("name1_0_"));
        assert_eq!(person.columns.column(1, "id"), Some("id1_0_"));
        assert_eq!(person.columns.column(1, "name"), Some("name2_0_"));
    }

    #[test]
    fn fetch_owned_by_collection_fails_fast() {
        let mm = metamodel();
        let (mut plan, root) = LoadPlan::for_collection("Customer.tags");
        let bad = plan.add_entity_fetch(root, "address", "Address", FetchStrategy::JOIN);
        let mut ctx = AliasResolutionContext::new();
        let err = ctx.resolve_entity_reference(&mm, &plan, bad).unwrap_err();
        assert!(err.is_plan_error());
    }
}
