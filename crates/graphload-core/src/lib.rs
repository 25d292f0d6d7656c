//! Core types for the graphload engine.
//!
//! - `Value`, `Identifier` and `Row` for tabular data
//! - `Error` and `Result` shared by every crate
//! - `Connection`, the async statement-execution boundary
//! - mapping metadata (`MappingMetamodel`) and load plans (`LoadPlan`)
//! - `Outcome` and `Cx` re-exported from asupersync

pub use asupersync::{Cx, Outcome};

pub mod connection;
pub mod error;
pub mod influencers;
pub mod lock;
pub mod mapping;
pub mod plan;
pub mod row;
pub mod value;

pub use connection::Connection;
pub use error::{
    ConfigError, Error, LockError, NotFoundError, PlanError, PlanErrorKind, QueryError,
    QueryErrorKind, Result, StaleStateError, TypeError, UnsupportedError, WrongClassError,
    WrongClassErrorKind,
};
pub use influencers::{
    AppliedGraph, AttributeNode, CascadeProfile, EnabledFilter, EntityGraph, GraphSemantic,
    LoadQueryInfluencers,
};
pub use lock::{LockMode, LockOptions, LockTimeout};
pub use mapping::{
    Cascade, CollectionKind, CollectionPersister, ElementDescriptor, EntityPersister,
    FetchProfile, FilterDefinition, FilterMapping, MappingMetamodel, PropertyDescriptor,
    PropertyKind, ToOneDescriptor, ToOneKind,
};
pub use plan::{FetchStrategy, FetchStyle, FetchTiming, LoadPlan, NodeId, NodeKind, PlanNode};
pub use row::Row;
pub use value::{Identifier, Value};
