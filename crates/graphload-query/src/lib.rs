//! Load-query compilation for graphload.
//!
//! `graphload-query` turns a [`LoadPlan`](graphload_core::LoadPlan) into a
//! single SQL statement:
//!
//! - [`LoadPlanBuilder`] decides which associations are joined, honoring
//!   entity graphs, fetch profiles, cascade profiles and the fetch depth.
//! - [`AliasResolutionContext`] hands out table aliases and column suffixes.
//! - [`build_associations`] derives the join graph in plan order.
//! - [`LoadQueryCompiler`] renders select list, joins, restriction, ordering
//!   and locking for a [`Dialect`].
//! - [`QueryCache`] keeps compiled statements for reuse.

pub mod alias;
pub mod association;
pub mod builder;
pub mod cache;
pub mod compiler;
pub mod dialect;
pub mod fragment;

pub use alias::{
    AliasResolutionContext, AssociationAliases, CollectionAliases, CollectionReferenceAliases,
    EntityAliases, EntityReferenceAliases, generate_alias,
};
pub use association::{JoinType, Joinable, JoinableAssociation, build_associations};
pub use builder::LoadPlanBuilder;
pub use cache::{QueryCache, cache_key};
pub use compiler::{
    CompileOptions, CompiledLoadQuery, LoadQueryCompiler, RootRestriction, SubselectSource,
    key_restriction,
};
pub use dialect::Dialect;
pub use fragment::{ParameterSlot, SqlFragment};
