//! The join graph of a load: one [`JoinableAssociation`] per joined fetch,
//! in plan pre-order.

use std::sync::Arc;

use graphload_core::{
    CollectionPersister, EntityPersister, Error, LoadPlan, LoadQueryInfluencers,
    MappingMetamodel, NodeId, NodeKind, PlanErrorKind, PropertyKind, Result,
};

use crate::alias::{AliasResolutionContext, AssociationAliases};
use crate::dialect::Dialect;
use crate::fragment::{SqlFragment, filter_fragment, render_template, secondary_table_joins};

/// Join type of an association edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinType {
    Inner,
    LeftOuter,
    /// Not part of the statement
    None,
}

/// Persister on the right-hand side of a join.
#[derive(Debug, Clone)]
pub enum Joinable {
    Entity(Arc<EntityPersister>),
    Collection(Arc<CollectionPersister>),
}

impl Joinable {
    pub fn table(&self) -> &str {
        match self {
            Joinable::Entity(p) => &p.table,
            Joinable::Collection(c) => &c.table,
        }
    }

    pub fn is_collection(&self) -> bool {
        matches!(self, Joinable::Collection(_))
    }

    pub fn as_collection(&self) -> Option<&Arc<CollectionPersister>> {
        match self {
            Joinable::Collection(c) => Some(c),
            Joinable::Entity(_) => None,
        }
    }
}

/// One join edge of the statement.
#[derive(Debug, Clone)]
pub struct JoinableAssociation {
    /// Node the edge leads to
    pub node: NodeId,
    pub owner: NodeId,
    pub path: String,
    pub joinable: Joinable,
    pub join_type: JoinType,
    pub aliases: AssociationAliases,
    /// Restriction from filters and mapped where clauses on the joined table
    pub on: SqlFragment,
    /// Rendered `with` restriction
    pub with_clause: Option<String>,
}

impl JoinableAssociation {
    pub fn is_many_to_many(&self) -> bool {
        self.joinable
            .as_collection()
            .is_some_and(|c| c.is_many_to_many())
    }

    /// Whether this edge joins the element entity of `previous`, a
    /// many-to-many bridge.
    pub fn is_many_to_many_element_of(&self, previous: &JoinableAssociation) -> bool {
        previous.is_many_to_many()
            && !self.joinable.is_collection()
            && self.aliases.lhs_alias == previous.aliases.rhs_alias
    }

    /// `<kw> table alias on lhs=rhs [and on] [and (with)]`, with a leading space.
    pub fn join_fragment(&self, dialect: Dialect, extra_on: SqlFragment) -> SqlFragment {
        let mut condition = SqlFragment::text(
            self.aliases
                .lhs_columns
                .iter()
                .zip(&self.aliases.rhs_columns)
                .map(|(l, r)| format!("{l}={}.{r}", self.aliases.rhs_alias))
                .collect::<Vec<_>>()
                .join(" and "),
        );
        condition.and(self.on.clone());
        condition.and(extra_on);
        if let Some(with) = &self.with_clause {
            condition.and(SqlFragment::text(format!("({with})")));
        }
        let mut out = SqlFragment::text(format!(
            " {} {} {} on ",
            dialect.join_keyword(self.join_type),
            self.joinable.table(),
            self.aliases.rhs_alias
        ));
        out.append(condition);
        out
    }
}

/// Join type of a node: `None` when the node is not part of the statement.
pub fn join_type(metamodel: &MappingMetamodel, plan: &LoadPlan, node: NodeId) -> Result<JoinType> {
    if plan.node(node).parent.is_none() || !plan.is_joined(node) {
        return Ok(JoinType::None);
    }
    match &plan.node(node).kind {
        NodeKind::EntityFetch { property, .. } => {
            let owner = plan.node(node).parent.map(|o| &plan.node(o).kind);
            let Some(owner_entity) = owner.and_then(NodeKind::entity) else {
                return Ok(JoinType::LeftOuter);
            };
            let nullable = match &metamodel.entity(owner_entity)?.require_property(property)?.kind {
                PropertyKind::ToOne(to_one) => to_one.nullable,
                _ => true,
            };
            if !nullable && plan.depth(node) <= 1 {
                Ok(JoinType::Inner)
            } else {
                Ok(JoinType::LeftOuter)
            }
        }
        _ => Ok(JoinType::LeftOuter),
    }
}

/// Build the association edges of the joined part of a plan, in pre-order.
pub fn build_associations(
    metamodel: &MappingMetamodel,
    plan: &LoadPlan,
    aliases: &mut AliasResolutionContext,
    influencers: &LoadQueryInfluencers,
) -> Result<Vec<JoinableAssociation>> {
    let mut out = Vec::new();
    for node in plan.walk() {
        let join_type = join_type(metamodel, plan, node)?;
        if join_type == JoinType::None {
            continue;
        }
        let Some(edge) = aliases.resolve_association(metamodel, plan, node)? else {
            continue;
        };
        let plan_node = plan.node(node);
        let owner = plan_node.parent.ok_or_else(|| {
            Error::plan(PlanErrorKind::MalformedTree, "association without an owner")
        })?;
        let (joinable, on) = match &plan_node.kind {
            NodeKind::CollectionFetch { role, .. } => {
                let collection = Arc::clone(metamodel.collection(role)?);
                let on = collection_on_condition(metamodel, &collection, &edge.rhs_alias, influencers)?;
                (Joinable::Collection(collection), on)
            }
            NodeKind::EntityFetch { entity, .. } | NodeKind::CollectionElement { entity } => {
                (Joinable::Entity(Arc::clone(metamodel.entity(entity)?)), SqlFragment::new())
            }
            other => {
                return Err(Error::plan(
                    PlanErrorKind::MalformedTree,
                    format!("{:?} cannot be joined", other),
                ));
            }
        };
        let with_clause = plan_node
            .with_clause
            .as_ref()
            .map(|w| render_template(w, &edge.rhs_alias));
        tracing::trace!(
            path = %plan.path(node),
            alias = %edge.rhs_alias,
            join = ?join_type,
            "Built joinable association"
        );
        out.push(JoinableAssociation {
            node,
            owner,
            path: plan.path(node),
            joinable,
            join_type,
            aliases: edge,
            on,
            with_clause,
        });
    }
    Ok(out)
}

/// Filters of the collection (and of a one-to-many element entity) plus
/// the mapped where clause.
pub fn collection_on_condition(
    metamodel: &MappingMetamodel,
    collection: &CollectionPersister,
    alias: &str,
    influencers: &LoadQueryInfluencers,
) -> Result<SqlFragment> {
    let mut on = filter_fragment(metamodel, &collection.filters, alias, influencers);
    if collection.is_one_to_many() {
        if let Some(entity) = collection.element.entity() {
            let element = metamodel.entity(entity)?;
            on.and(filter_fragment(metamodel, &element.filters, alias, influencers));
        }
    }
    if let Some(where_clause) = &collection.where_clause {
        on.and(SqlFragment::text(render_template(where_clause, alias)));
    }
    Ok(on)
}

/// Render every join in order. The element join that directly follows its
/// many-to-many bridge also carries the bridge's many-to-many filters.
pub fn render_joins(
    metamodel: &MappingMetamodel,
    associations: &[JoinableAssociation],
    influencers: &LoadQueryInfluencers,
    dialect: Dialect,
) -> Result<SqlFragment> {
    let mut out = SqlFragment::new();
    let mut previous: Option<&JoinableAssociation> = None;
    for association in associations {
        let extra = match previous {
            Some(prev) if association.is_many_to_many_element_of(prev) => {
                let bridge = prev.joinable.as_collection().ok_or_else(|| {
                    Error::plan(PlanErrorKind::MalformedTree, "bridge is not a collection")
                })?;
                filter_fragment(
                    metamodel,
                    &bridge.many_to_many_filters,
                    &association.aliases.rhs_alias,
                    influencers,
                )
            }
            _ => SqlFragment::new(),
        };
        out.append(association.join_fragment(dialect, extra));
        match &association.joinable {
            Joinable::Entity(persister) => {
                out.push_str(&secondary_table_joins(persister, &association.aliases.rhs_alias));
            }
            Joinable::Collection(collection) if collection.is_one_to_many() => {
                if let Some(entity) = collection.element.entity() {
                    let element = metamodel.entity(entity)?;
                    out.push_str(&secondary_table_joins(element, &association.aliases.rhs_alias));
                }
            }
            Joinable::Collection(_) => {}
        }
        previous = Some(association);
    }
    Ok(out)
}
