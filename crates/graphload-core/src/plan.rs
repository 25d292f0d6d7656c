//! Load plans: the immutable fetch tree a load is compiled from.
//!
//! A plan is an arena of nodes addressed by [`NodeId`]. Returns are the roots;
//! every other node is a fetch hanging off an entity reference, or the element
//! graph of a collection reference.

use serde::{Deserialize, Serialize};

/// When an association is initialized relative to its owner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FetchTiming {
    /// Loaded as part of the same load call
    #[default]
    Immediate,
    /// Left uninitialized (proxy / lazy collection)
    Delayed,
}

/// How an association is fetched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FetchStyle {
    /// Outer-joined into the owner's statement
    Join,
    /// Separate select per owner
    #[default]
    Select,
    /// One select for the collections of every owner of the originating query
    Subselect,
    /// Separate select covering several queued owners
    Batch,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FetchStrategy {
    pub timing: FetchTiming,
    pub style: FetchStyle,
}

impl FetchStrategy {
    pub const JOIN: FetchStrategy = FetchStrategy {
        timing: FetchTiming::Immediate,
        style: FetchStyle::Join,
    };

    pub const LAZY_SELECT: FetchStrategy = FetchStrategy {
        timing: FetchTiming::Delayed,
        style: FetchStyle::Select,
    };

    pub const EAGER_SELECT: FetchStrategy = FetchStrategy {
        timing: FetchTiming::Immediate,
        style: FetchStyle::Select,
    };

    pub const fn new(timing: FetchTiming, style: FetchStyle) -> Self {
        Self { timing, style }
    }

    pub const fn is_join(self) -> bool {
        matches!(self.style, FetchStyle::Join)
    }

    pub const fn is_immediate(self) -> bool {
        matches!(self.timing, FetchTiming::Immediate)
    }
}

/// Index of a node in its [`LoadPlan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    EntityReturn {
        entity: String,
    },
    CollectionReturn {
        role: String,
    },
    EntityFetch {
        entity: String,
        property: String,
        strategy: FetchStrategy,
    },
    CollectionFetch {
        role: String,
        property: String,
        strategy: FetchStrategy,
    },
    /// Entity graph of a collection's elements
    CollectionElement {
        entity: String,
    },
}

impl NodeKind {
    pub fn is_entity_reference(&self) -> bool {
        matches!(
            self,
            NodeKind::EntityReturn { .. }
                | NodeKind::EntityFetch { .. }
                | NodeKind::CollectionElement { .. }
        )
    }

    pub fn is_collection_reference(&self) -> bool {
        matches!(
            self,
            NodeKind::CollectionReturn { .. } | NodeKind::CollectionFetch { .. }
        )
    }

    /// Entity name for entity references.
    pub fn entity(&self) -> Option<&str> {
        match self {
            NodeKind::EntityReturn { entity }
            | NodeKind::EntityFetch { entity, .. }
            | NodeKind::CollectionElement { entity } => Some(entity),
            _ => None,
        }
    }

    /// Role for collection references.
    pub fn role(&self) -> Option<&str> {
        match self {
            NodeKind::CollectionReturn { role } | NodeKind::CollectionFetch { role, .. } => {
                Some(role)
            }
            _ => None,
        }
    }

    /// Fetch strategy; returns and elements are always part of the statement.
    pub fn strategy(&self) -> FetchStrategy {
        match self {
            NodeKind::EntityFetch { strategy, .. } | NodeKind::CollectionFetch { strategy, .. } => {
                *strategy
            }
            _ => FetchStrategy::JOIN,
        }
    }

    /// Owner property name for fetches.
    pub fn property(&self) -> Option<&str> {
        match self {
            NodeKind::EntityFetch { property, .. } | NodeKind::CollectionFetch { property, .. } => {
                Some(property)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanNode {
    pub kind: NodeKind,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    /// Extra join restriction; `{alias}` is replaced by the node's table alias
    pub with_clause: Option<String>,
}

/// An immutable fetch tree.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LoadPlan {
    nodes: Vec<PlanNode>,
    returns: Vec<NodeId>,
}

impl LoadPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plan with a single entity return.
    pub fn for_entity(entity: impl Into<String>) -> (Self, NodeId) {
        let mut plan = Self::new();
        let root = plan.add_entity_return(entity);
        (plan, root)
    }

    /// Plan with a single collection return.
    pub fn for_collection(role: impl Into<String>) -> (Self, NodeId) {
        let mut plan = Self::new();
        let root = plan.add_collection_return(role);
        (plan, root)
    }

    fn push(&mut self, kind: NodeKind, parent: Option<NodeId>) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(PlanNode {
            kind,
            parent,
            children: Vec::new(),
            with_clause: None,
        });
        if let Some(parent) = parent {
            self.nodes[parent.0].children.push(id);
        } else {
            self.returns.push(id);
        }
        id
    }

    pub fn add_entity_return(&mut self, entity: impl Into<String>) -> NodeId {
        self.push(
            NodeKind::EntityReturn {
                entity: entity.into(),
            },
            None,
        )
    }

    pub fn add_collection_return(&mut self, role: impl Into<String>) -> NodeId {
        self.push(NodeKind::CollectionReturn { role: role.into() }, None)
    }

    /// Attach a to-one fetch. Owner shape is checked when aliases are resolved.
    pub fn add_entity_fetch(
        &mut self,
        owner: NodeId,
        property: impl Into<String>,
        entity: impl Into<String>,
        strategy: FetchStrategy,
    ) -> NodeId {
        self.push(
            NodeKind::EntityFetch {
                entity: entity.into(),
                property: property.into(),
                strategy,
            },
            Some(owner),
        )
    }

    pub fn add_collection_fetch(
        &mut self,
        owner: NodeId,
        property: impl Into<String>,
        role: impl Into<String>,
        strategy: FetchStrategy,
    ) -> NodeId {
        self.push(
            NodeKind::CollectionFetch {
                role: role.into(),
                property: property.into(),
                strategy,
            },
            Some(owner),
        )
    }

    /// Attach the element entity graph of a collection reference.
    pub fn add_collection_element(
        &mut self,
        collection: NodeId,
        entity: impl Into<String>,
    ) -> NodeId {
        self.push(
            NodeKind::CollectionElement {
                entity: entity.into(),
            },
            Some(collection),
        )
    }

    pub fn set_with_clause(&mut self, node: NodeId, condition: impl Into<String>) {
        if let Some(n) = self.nodes.get_mut(node.0) {
            n.with_clause = Some(condition.into());
        }
    }

    pub fn node(&self, id: NodeId) -> &PlanNode {
        &self.nodes[id.0]
    }

    pub fn get(&self, id: NodeId) -> Option<&PlanNode> {
        self.nodes.get(id.0)
    }

    pub fn returns(&self) -> &[NodeId] {
        &self.returns
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Element node of a collection reference, if its elements are entities.
    pub fn element_of(&self, collection: NodeId) -> Option<NodeId> {
        self.node(collection)
            .children
            .iter()
            .copied()
            .find(|c| matches!(self.node(*c).kind, NodeKind::CollectionElement { .. }))
    }

    /// Fetch child of `owner` for the given property.
    pub fn fetch_for(&self, owner: NodeId, property: &str) -> Option<NodeId> {
        self.node(owner)
            .children
            .iter()
            .copied()
            .find(|c| self.node(*c).kind.property() == Some(property))
    }

    /// Nodes in depth-first pre-order, returns first.
    pub fn walk(&self) -> Vec<NodeId> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<NodeId> = self.returns.iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            out.push(id);
            for child in self.node(id).children.iter().rev() {
                stack.push(*child);
            }
        }
        out
    }

    /// Number of fetch edges between the node and its return.
    pub fn depth(&self, id: NodeId) -> usize {
        let mut depth = 0;
        let mut current = self.node(id).parent;
        while let Some(p) = current {
            depth += 1;
            current = self.node(p).parent;
        }
        depth
    }

    /// True when the node and all of its ancestors are part of the statement.
    pub fn is_joined(&self, id: NodeId) -> bool {
        let mut current = Some(id);
        while let Some(n) = current {
            let node = self.node(n);
            if !node.kind.strategy().is_join() {
                return false;
            }
            current = node.parent;
        }
        true
    }

    /// Whether any fetch uses the SUBSELECT style.
    pub fn has_subselect_fetches(&self) -> bool {
        self.nodes
            .iter()
            .any(|n| matches!(n.kind.strategy().style, FetchStyle::Subselect))
    }

    /// Dotted property path from the return to the node (`orders.lines`).
    pub fn path(&self, id: NodeId) -> String {
        let mut parts = Vec::new();
        let mut current = Some(id);
        while let Some(n) = current {
            let node = self.node(n);
            if let Some(p) = node.kind.property() {
                parts.push(p.to_string());
            }
            current = node.parent;
        }
        parts.reverse();
        parts.join(".")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (LoadPlan, NodeId, NodeId, NodeId, NodeId) {
        let (mut plan, root) = LoadPlan::for_entity("Customer");
        let orders =
            plan.add_collection_fetch(root, "orders", "Customer.orders", FetchStrategy::JOIN);
        let order = plan.add_collection_element(orders, "Order");
        let address =
            plan.add_entity_fetch(root, "address", "Address", FetchStrategy::LAZY_SELECT);
        (plan, root, orders, order, address)
    }

    #[test]
    fn walk_is_preorder() {
        let (plan, root, orders, order, address) = sample();
        assert_eq!(plan.walk(), vec![root, orders, order, address]);
        assert_eq!(plan.element_of(orders), Some(order));
        assert_eq!(plan.fetch_for(root, "address"), Some(address));
    }

    #[test]
    fn join_reachability() {
        let (mut plan, _root, _orders, order, address) = sample();
        assert!(plan.is_joined(order));
        assert!(!plan.is_joined(address));
        let lines = plan.add_collection_fetch(
            order,
            "lines",
            "Order.lines",
            FetchStrategy::new(FetchTiming::Immediate, FetchStyle::Subselect),
        );
        assert!(!plan.is_joined(lines));
        assert!(plan.has_subselect_fetches());
        assert_eq!(plan.path(lines), "orders.lines");
    }

    #[test]
    fn depth_counts_edges() {
        let (plan, root, orders, order, _) = sample();
        assert_eq!(plan.depth(root), 0);
        assert_eq!(plan.depth(orders), 1);
        assert_eq!(plan.depth(order), 2);
    }
}
