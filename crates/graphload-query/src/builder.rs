//! Builds load plans from mappings and session influencers.
//!
//! Fetch decisions, from strongest to weakest: an applied entity graph,
//! enabled fetch profiles, the internal cascade profile, then the mapping.
//! Join fetches stop at the maximum fetch depth, and an association key
//! (table plus columns) is joined at most once per plan.

use std::collections::{BTreeMap, HashSet};

use graphload_core::{
    CascadeProfile, CollectionKind, EntityGraph, FetchStrategy, FetchStyle, FetchTiming,
    GraphSemantic, LoadPlan, LoadQueryInfluencers, MappingMetamodel, NodeId, PropertyDescriptor,
    PropertyKind, Result,
};

/// Entity-graph context for one level of the walk.
#[derive(Clone, Copy)]
enum GraphScope<'g> {
    None,
    Inside(&'g EntityGraph, GraphSemantic),
    Outside(GraphSemantic),
}

#[derive(Default)]
struct WalkState {
    joined_keys: HashSet<(String, Vec<String>)>,
    bag_joined: bool,
}

pub struct LoadPlanBuilder<'a> {
    metamodel: &'a MappingMetamodel,
    influencers: &'a LoadQueryInfluencers,
    max_fetch_depth: usize,
    with_clauses: BTreeMap<String, String>,
}

impl<'a> LoadPlanBuilder<'a> {
    pub fn new(metamodel: &'a MappingMetamodel, influencers: &'a LoadQueryInfluencers) -> Self {
        Self {
            metamodel,
            influencers,
            max_fetch_depth: 3,
            with_clauses: BTreeMap::new(),
        }
    }

    pub fn max_fetch_depth(mut self, depth: usize) -> Self {
        self.max_fetch_depth = depth;
        self
    }

    /// Extra join restriction for the association at `path` (`orders.lines`).
    pub fn with_restriction(mut self, path: impl Into<String>, condition: impl Into<String>) -> Self {
        self.with_clauses.insert(path.into(), condition.into());
        self
    }

    /// Plan for loading `entity` by identifier (or natural id).
    pub fn build_entity_plan(&self, entity: &str) -> Result<LoadPlan> {
        let persister = self.metamodel.entity(entity)?;
        let (mut plan, root) = LoadPlan::for_entity(persister.entity_name.clone());
        let scope = match self.influencers.entity_graph() {
            Some(applied) if self.metamodel.is_subtype(entity, &applied.graph.entity) => {
                GraphScope::Inside(&applied.graph, applied.semantic)
            }
            _ => GraphScope::None,
        };
        let mut state = WalkState::default();
        self.walk_entity(&mut plan, root, entity, scope, &mut state)?;
        tracing::debug!(entity = %entity, nodes = plan.len(), "Built entity load plan");
        Ok(plan)
    }

    /// Plan for initializing collections of `role` by owner key.
    pub fn build_collection_plan(&self, role: &str) -> Result<LoadPlan> {
        let collection = self.metamodel.collection(role)?;
        let (mut plan, root) = LoadPlan::for_collection(role);
        let mut state = WalkState::default();
        if collection.kind == CollectionKind::Bag {
            state.bag_joined = true;
        }
        if let Some(entity) = collection.element.entity() {
            let element = plan.add_collection_element(root, entity);
            self.walk_entity(&mut plan, element, entity, GraphScope::None, &mut state)?;
        }
        tracing::debug!(role = %role, nodes = plan.len(), "Built collection load plan");
        Ok(plan)
    }

    fn walk_entity(
        &self,
        plan: &mut LoadPlan,
        node: NodeId,
        entity: &str,
        scope: GraphScope<'_>,
        state: &mut WalkState,
    ) -> Result<()> {
        let persister = self.metamodel.entity(entity)?;
        for property in self.metamodel.hierarchy_properties(entity) {
            match &property.kind {
                PropertyKind::Basic { .. } => {}
                PropertyKind::ToOne(to_one) => {
                    let mut strategy = self.decide(entity, &property, to_one.fetch, scope);
                    let key_columns = if to_one.is_shared_key() {
                        persister.id_columns.clone()
                    } else {
                        to_one.columns.clone()
                    };
                    let key = (persister.table_for(property.table).to_string(), key_columns);
                    if strategy.is_join()
                        && (plan.depth(node) + 1 > self.max_fetch_depth
                            || !plan.is_joined(node)
                            || state.joined_keys.contains(&key))
                    {
                        strategy = downgrade(strategy);
                    }
                    let child =
                        plan.add_entity_fetch(node, property.name.clone(), to_one.target.clone(), strategy);
                    self.apply_with_clause(plan, child);
                    if strategy.is_join() {
                        state.joined_keys.insert(key);
                        let child_scope = nested_scope(scope, &property.name);
                        self.walk_entity(plan, child, &to_one.target, child_scope, state)?;
                    }
                }
                PropertyKind::Collection { role } => {
                    let collection = self.metamodel.collection(role)?;
                    let mut strategy = self.decide(entity, &property, collection.fetch, scope);
                    let key = (collection.table.clone(), collection.key_columns.clone());
                    let is_bag = collection.kind == CollectionKind::Bag;
                    if strategy.is_join()
                        && (plan.depth(node) + 1 > self.max_fetch_depth
                            || !plan.is_joined(node)
                            || state.joined_keys.contains(&key)
                            || (is_bag && state.bag_joined))
                    {
                        strategy = downgrade(strategy);
                    }
                    let child =
                        plan.add_collection_fetch(node, property.name.clone(), role.clone(), strategy);
                    self.apply_with_clause(plan, child);
                    if strategy.is_join() {
                        state.joined_keys.insert(key);
                        state.bag_joined |= is_bag;
                        if let Some(element_entity) = collection.element.entity() {
                            let element = plan.add_collection_element(child, element_entity);
                            let child_scope = nested_scope(scope, &property.name);
                            self.walk_entity(plan, element, element_entity, child_scope, state)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn decide(
        &self,
        entity: &str,
        property: &PropertyDescriptor,
        mapped: FetchStrategy,
        scope: GraphScope<'_>,
    ) -> FetchStrategy {
        match scope {
            GraphScope::Inside(graph, semantic) => {
                if graph.node(&property.name).is_some() {
                    return FetchStrategy::JOIN;
                }
                return match semantic {
                    GraphSemantic::Fetch => FetchStrategy::LAZY_SELECT,
                    GraphSemantic::Load => mapped,
                };
            }
            GraphScope::Outside(GraphSemantic::Fetch) => return FetchStrategy::LAZY_SELECT,
            GraphScope::Outside(GraphSemantic::Load) => return mapped,
            GraphScope::None => {}
        }
        if let Some(style) = self
            .influencers
            .profile_fetch_style(self.metamodel, entity, &property.name)
        {
            return FetchStrategy::new(FetchTiming::Immediate, style);
        }
        let cascades = match self.influencers.internal_fetch_profile() {
            Some(CascadeProfile::Merge) => property.cascade.merge,
            Some(CascadeProfile::Refresh) => property.cascade.refresh,
            None => false,
        };
        if cascades {
            return FetchStrategy::JOIN;
        }
        mapped
    }

    fn apply_with_clause(&self, plan: &mut LoadPlan, node: NodeId) {
        if let Some(condition) = self.with_clauses.get(&plan.path(node)) {
            plan.set_with_clause(node, condition.clone());
        }
    }
}

fn downgrade(strategy: FetchStrategy) -> FetchStrategy {
    FetchStrategy::new(strategy.timing, FetchStyle::Select)
}

fn nested_scope<'g>(scope: GraphScope<'g>, property: &str) -> GraphScope<'g> {
    match scope {
        GraphScope::None => GraphScope::None,
        GraphScope::Inside(graph, semantic) => match graph.node(property) {
            Some(node) => match &node.subgraph {
                Some(subgraph) => GraphScope::Inside(subgraph, semantic),
                None => GraphScope::Outside(semantic),
            },
            None => GraphScope::Outside(semantic),
        },
        GraphScope::Outside(semantic) => GraphScope::Outside(semantic),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphload_core::{
        Cascade, CollectionPersister, EntityPersister, FetchProfile, NodeKind,
    };

    fn metamodel() -> MappingMetamodel {
        MappingMetamodel::builder()
            .entity(
                EntityPersister::builder("Customer", "customers")
                    .id("id", "id")
                    .many_to_one("referrer", "Customer", "referrer_id", FetchStrategy::JOIN)
                    .many_to_one("address", "Address", "address_id", FetchStrategy::LAZY_SELECT)
                    .cascade(Cascade {
                        merge: true,
                        refresh: false,
                    })
                    .collection("orders", "Customer.orders")
                    .collection("notes", "Customer.notes")
                    .build(),
            )
            .entity(EntityPersister::builder("Address", "addresses").id("id", "id").build())
            .entity(
                EntityPersister::builder("Order", "orders")
                    .id("id", "id")
                    .many_to_one("customer", "Customer", "customer_id", FetchStrategy::JOIN)
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
                .kind(CollectionKind::Bag)
                .fetch(FetchStrategy::JOIN)
                .build(),
            )
            .collection(
                CollectionPersister::basic(
                    "Customer.notes",
                    "Customer",
                    "customer_notes",
                    vec!["customer_id".into()],
                    "note",
                )
                .kind(CollectionKind::Bag)
                .fetch(FetchStrategy::JOIN)
                .build(),
            )
            .fetch_profile(FetchProfile::new("addresses").fetch(
                "Customer",
                "address",
                FetchStyle::Join,
            ))
            .build()
            .unwrap()
    }

    fn strategy_at(plan: &LoadPlan, owner: NodeId, property: &str) -> FetchStrategy {
        plan.node(plan.fetch_for(owner, property).unwrap()).kind.strategy()
    }

    #[test]
    fn self_reference_is_joined_once() {
        let mm = metamodel();
        let influencers = LoadQueryInfluencers::new();
        let plan = LoadPlanBuilder::new(&mm, &influencers)
            .build_entity_plan("Customer")
            .unwrap();
        let root = plan.returns()[0];
        let referrer = plan.fetch_for(root, "referrer").unwrap();
        assert!(plan.node(referrer).kind.strategy().is_join());
        assert!(!strategy_at(&plan, referrer, "referrer").is_join());
        assert!(!strategy_at(&plan, root, "address").is_join());
    }

    #[test]
    fn only_one_bag_is_joined() {
        let mm = metamodel();
        let influencers = LoadQueryInfluencers::new();
        let plan = LoadPlanBuilder::new(&mm, &influencers)
            .max_fetch_depth(1)
            .build_entity_plan("Customer")
            .unwrap();
        let root = plan.returns()[0];
        assert!(strategy_at(&plan, root, "orders").is_join());
        assert!(!strategy_at(&plan, root, "notes").is_join());
        let bags = plan
            .walk()
            .into_iter()
            .filter(|n| {
                matches!(plan.node(*n).kind, NodeKind::CollectionFetch { .. })
                    && plan.is_joined(*n)
            })
            .count();
        assert_eq!(bags, 1);
    }

    #[test]
    fn depth_limit_downgrades_joins() {
        let mm = metamodel();
        let influencers = LoadQueryInfluencers::new();
        let plan = LoadPlanBuilder::new(&mm, &influencers)
            .max_fetch_depth(1)
            .build_entity_plan("Customer")
            .unwrap();
        for node in plan.walk() {
            if plan.is_joined(node) && plan.node(node).parent.is_some() {
                assert!(
                    plan.depth(node) <= 1
                        || matches!(plan.node(node).kind, NodeKind::CollectionElement { .. })
                );
            }
        }
        let root = plan.returns()[0];
        let orders = plan.fetch_for(root, "orders").unwrap();
        let order = plan.element_of(orders).unwrap();
        assert!(!strategy_at(&plan, order, "customer").is_join());
    }

    #[test]
    fn profile_and_cascade_override_mapping() {
        let mm = metamodel();
        let mut influencers = LoadQueryInfluencers::new();
        influencers.enable_fetch_profile(&mm, "addresses").unwrap();
        let plan = LoadPlanBuilder::new(&mm, &influencers)
            .build_entity_plan("Customer")
            .unwrap();
        assert!(strategy_at(&plan, plan.returns()[0], "address").is_join());

        let mut influencers = LoadQueryInfluencers::new();
        influencers.set_internal_fetch_profile(Some(CascadeProfile::Merge));
        let plan = LoadPlanBuilder::new(&mm, &influencers)
            .build_entity_plan("Customer")
            .unwrap();
        assert!(strategy_at(&plan, plan.returns()[0], "address").is_join());
    }

    #[test]
    fn fetch_graph_makes_everything_else_lazy() {
        let mm = metamodel();
        let mut influencers = LoadQueryInfluencers::new();
        influencers.apply_entity_graph(
            EntityGraph::new("Customer").attribute("address"),
            GraphSemantic::Fetch,
        );
        let plan = LoadPlanBuilder::new(&mm, &influencers)
            .build_entity_plan("Customer")
            .unwrap();
        let root = plan.returns()[0];
        assert!(strategy_at(&plan, root, "address").is_join());
        assert_eq!(strategy_at(&plan, root, "referrer"), FetchStrategy::LAZY_SELECT);
        assert_eq!(strategy_at(&plan, root, "orders"), FetchStrategy::LAZY_SELECT);
    }

    #[test]
    fn with_restriction_is_attached_by_path() {
        let mm = metamodel();
        let influencers = LoadQueryInfluencers::new();
        let plan = LoadPlanBuilder::new(&mm, &influencers)
            .with_restriction("orders", "{alias}.total > 100")
            .build_entity_plan("Customer")
            .unwrap();
        let orders = plan.fetch_for(plan.returns()[0], "orders").unwrap();
        assert_eq!(
            plan.node(orders).with_clause.as_deref(),
            Some("{alias}.total > 100")
        );
    }
}
