//! Runtime modifiers that shape a load: enabled filters, fetch profiles,
//! entity graphs and internal cascade profiles.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Error, PlanErrorKind, Result};
use crate::mapping::MappingMetamodel;
use crate::value::Value;

/// A filter enabled on the session with its parameter bindings.
#[derive(Debug, Clone, PartialEq)]
pub struct EnabledFilter {
    pub name: String,
    pub parameters: BTreeMap<String, Value>,
}

impl EnabledFilter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn set_parameter(&mut self, name: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn parameter(&self, name: &str) -> Option<&Value> {
        self.parameters.get(name)
    }
}

/// Node of an entity graph: an attribute plus an optional subgraph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeNode {
    pub name: String,
    pub subgraph: Option<EntityGraph>,
}

/// Declarative set of attributes to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityGraph {
    pub entity: String,
    pub attributes: Vec<AttributeNode>,
}

impl EntityGraph {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            attributes: Vec::new(),
        }
    }

    pub fn attribute(mut self, name: impl Into<String>) -> Self {
        self.attributes.push(AttributeNode {
            name: name.into(),
            subgraph: None,
        });
        self
    }

    pub fn subgraph(mut self, name: impl Into<String>, graph: EntityGraph) -> Self {
        self.attributes.push(AttributeNode {
            name: name.into(),
            subgraph: Some(graph),
        });
        self
    }

    pub fn node(&self, name: &str) -> Option<&AttributeNode> {
        self.attributes.iter().find(|a| a.name == name)
    }
}

/// How attributes missing from an applied graph are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GraphSemantic {
    /// Attributes not in the graph are lazy
    Fetch,
    /// Attributes not in the graph keep their mapped strategy
    Load,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedGraph {
    pub graph: EntityGraph,
    pub semantic: GraphSemantic,
}

/// Internal fetch profiles used by merge/refresh cascades.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CascadeProfile {
    Merge,
    Refresh,
}

/// Per-session modifiers applied when compiling loads.
#[derive(Debug, Clone, Default)]
pub struct LoadQueryInfluencers {
    enabled_filters: BTreeMap<String, EnabledFilter>,
    enabled_fetch_profiles: BTreeSet<String>,
    entity_graph: Option<AppliedGraph>,
    internal_fetch_profile: Option<CascadeProfile>,
}

impl LoadQueryInfluencers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable a filter; the definition must exist in the metamodel.
    pub fn enable_filter(
        &mut self,
        metamodel: &MappingMetamodel,
        name: &str,
    ) -> Result<&mut EnabledFilter> {
        if metamodel.filter_definition(name).is_none() {
            return Err(Error::plan(
                PlanErrorKind::InvalidArgument,
                format!("no filter named '{}'", name),
            ));
        }
        Ok(self
            .enabled_filters
            .entry(name.to_string())
            .or_insert_with(|| EnabledFilter::new(name)))
    }

    pub fn disable_filter(&mut self, name: &str) {
        self.enabled_filters.remove(name);
    }

    pub fn enabled_filter(&self, name: &str) -> Option<&EnabledFilter> {
        self.enabled_filters.get(name)
    }

    pub fn is_filter_enabled(&self, name: &str) -> bool {
        self.enabled_filters.contains_key(name)
    }

    pub fn has_enabled_filters(&self) -> bool {
        !self.enabled_filters.is_empty()
    }

    pub fn enabled_filters(&self) -> impl Iterator<Item = &EnabledFilter> {
        self.enabled_filters.values()
    }

    pub fn enable_fetch_profile(&mut self, metamodel: &MappingMetamodel, name: &str) -> Result<()> {
        if metamodel.fetch_profile(name).is_none() {
            return Err(Error::plan(
                PlanErrorKind::InvalidArgument,
                format!("no fetch profile named '{}'", name),
            ));
        }
        self.enabled_fetch_profiles.insert(name.to_string());
        Ok(())
    }

    pub fn disable_fetch_profile(&mut self, name: &str) {
        self.enabled_fetch_profiles.remove(name);
    }

    pub fn enabled_fetch_profiles(&self) -> impl Iterator<Item = &str> {
        self.enabled_fetch_profiles.iter().map(String::as_str)
    }

    pub fn has_enabled_fetch_profiles(&self) -> bool {
        !self.enabled_fetch_profiles.is_empty()
    }

    pub fn apply_entity_graph(&mut self, graph: EntityGraph, semantic: GraphSemantic) {
        self.entity_graph = Some(AppliedGraph { graph, semantic });
    }

    pub fn clear_entity_graph(&mut self) {
        self.entity_graph = None;
    }

    pub fn entity_graph(&self) -> Option<&AppliedGraph> {
        self.entity_graph.as_ref()
    }

    pub fn set_internal_fetch_profile(&mut self, profile: Option<CascadeProfile>) {
        self.internal_fetch_profile = profile;
    }

    pub fn internal_fetch_profile(&self) -> Option<CascadeProfile> {
        self.internal_fetch_profile
    }

    /// Filters affect the entity or one of its collections.
    pub fn filters_affect_entity(&self, metamodel: &MappingMetamodel, entity: &str) -> bool {
        self.has_enabled_filters()
            && metamodel.entity_affected_by_filters(entity, &|name| self.is_filter_enabled(name))
    }

    /// Some enabled fetch profile overrides an association of the entity.
    pub fn fetch_profiles_affect_entity(&self, metamodel: &MappingMetamodel, entity: &str) -> bool {
        self.enabled_fetch_profiles
            .iter()
            .any(|p| metamodel.profile_affects(p, entity))
    }

    /// Style override from enabled fetch profiles for an association.
    pub fn profile_fetch_style(
        &self,
        metamodel: &MappingMetamodel,
        entity: &str,
        association: &str,
    ) -> Option<crate::plan::FetchStyle> {
        self.enabled_fetch_profiles
            .iter()
            .filter_map(|name| metamodel.fetch_profile(name))
            .flat_map(|profile| profile.fetches.iter())
            .find(|f| f.association == association && metamodel.is_subtype(entity, &f.entity))
            .map(|f| f.style)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{EntityPersister, FetchProfile};
    use crate::plan::{FetchStrategy, FetchStyle};

    fn metamodel() -> MappingMetamodel {
        MappingMetamodel::builder()
            .entity(
                EntityPersister::builder("Order", "orders")
                    .id("id", "id")
                    .many_to_one("customer", "Order", "customer_id", FetchStrategy::LAZY_SELECT)
                    .build(),
            )
            .filter("recent", "{alias}.placed > :since", &["since"])
            .fetch_profile(FetchProfile::new("with-customer").fetch(
                "Order",
                "customer",
                FetchStyle::Join,
            ))
            .build()
            .unwrap()
    }

    #[test]
    fn unknown_filter_is_rejected() {
        let mm = metamodel();
        let mut inf = LoadQueryInfluencers::new();
        assert!(inf.enable_filter(&mm, "missing").is_err());
        inf.enable_filter(&mm, "recent")
            .unwrap()
            .set_parameter("since", 10_i64);
        assert_eq!(
            inf.enabled_filter("recent").unwrap().parameter("since"),
            Some(&Value::BigInt(10))
        );
    }

    #[test]
    fn profile_style_lookup() {
        let mm = metamodel();
        let mut inf = LoadQueryInfluencers::new();
        assert_eq!(inf.profile_fetch_style(&mm, "Order", "customer"), None);
        inf.enable_fetch_profile(&mm, "with-customer").unwrap();
        assert_eq!(
            inf.profile_fetch_style(&mm, "Order", "customer"),
            Some(FetchStyle::Join)
        );
        assert!(inf.fetch_profiles_affect_entity(&mm, "Order"));
    }
}
