//! graphload - load object graphs from a relational database.
//!
//! Given mapping metadata for entities and collections, graphload compiles
//! a single outer-join statement per load plan, executes it through a
//! [`Connection`], and materializes the rows into a session-scoped identity
//! map where cyclic associations converge on one instance per row.
//!
//! - Load by id, by several ids, by natural id, or a raw snapshot
//! - Batch and subselect fetching of proxies and collections
//! - Filters, fetch profiles and entity graphs shape the plan
//! - Shared cache for entity state across sessions
//! - Lock upgrades with optimistic version checks
//!
//! # Quick Start
//!
//! ```ignore
//! use graphload::prelude::*;
//!
//! let metamodel = MappingMetamodel::builder()
//!     .entity(
//!         EntityPersister::builder("Customer", "customers")
//!             .id("id", "id")
//!             .basic("name", "name")
//!             .collection("orders", "Customer.orders")
//!             .build(),
//!     )
//!     .entity(
//!         EntityPersister::builder("Order", "orders")
//!             .id("id", "id")
//!             .basic("total", "total")
//!             .many_to_one("customer", "Customer", "customer_id", FetchStrategy::JOIN)
//!             .build(),
//!     )
//!     .collection(
//!         CollectionPersister::one_to_many(
//!             "Customer.orders",
//!             "Customer",
//!             "Order",
//!             "orders",
//!             vec!["customer_id".into()],
//!         )
//!         .fetch(FetchStrategy::JOIN)
//!         .build(),
//!     )
//!     .build()?;
//!
//! let factory = SessionFactory::new(metamodel, LoaderSettings::default())?;
//! let engine = LoadEngine::new(Arc::clone(&factory));
//!
//! async fn example(cx: &Cx, engine: &LoadEngine, conn: impl Connection) {
//!     let mut session = engine.factory().open_session(conn);
//!     let customer = engine
//!         .load(cx, &mut session, "Customer", 1, LoadOptions::new())
//!         .await;
//!     // customer.collection("orders") holds the orders; every order's
//!     // "customer" is the same instance as `customer`.
//! }
//! ```
//!
//! # Crates
//!
//! - `graphload-core`: values, rows, errors, mappings and load plans
//! - `graphload-query`: plan building, aliasing and SQL compilation
//! - `graphload-session`: persistence context, shared cache, settings
//! - `graphload-loader`: the loaders and row materialization

pub mod testing;

// Core types
pub use graphload_core::{
    // asupersync re-exports
    Cx,
    Outcome,
    // Data
    Connection,
    Identifier,
    Row,
    Value,
    // Errors
    ConfigError,
    Error,
    LockError,
    NotFoundError,
    PlanError,
    PlanErrorKind,
    QueryError,
    QueryErrorKind,
    Result,
    StaleStateError,
    TypeError,
    UnsupportedError,
    WrongClassError,
    WrongClassErrorKind,
    // Mapping
    Cascade,
    CollectionKind,
    CollectionPersister,
    ElementDescriptor,
    EntityPersister,
    FetchProfile,
    FetchStrategy,
    FetchStyle,
    FetchTiming,
    MappingMetamodel,
    PropertyKind,
    // Influencers
    CascadeProfile,
    EnabledFilter,
    EntityGraph,
    GraphSemantic,
    LoadQueryInfluencers,
    // Locking
    LockMode,
    LockOptions,
    LockTimeout,
    // Plans
    LoadPlan,
    NodeId,
    NodeKind,
};

// Query compilation
pub use graphload_query::{
    AliasResolutionContext, CompileOptions, CompiledLoadQuery, Dialect, LoadPlanBuilder,
    LoadQueryCompiler, ParameterSlot, RootRestriction, SubselectSource,
};

// Session
pub use graphload_session::{
    AfterLoadAction, BatchFetchStyle, CacheMode, CollectionKey, CollectionRef, ElementValue,
    EntityInstance, EntityKey, EntityRef, EntityStatus, LoadOptions, LoaderSettings,
    PersistenceContext,
    PostLoadEvent, PreLoadEvent, PropertyValue, Session, SessionFactory, Statistics,
    StatisticsSnapshot,
};

// Loading
pub use graphload_loader::{LoadEngine, PendingLoad};

/// Everything needed to map entities and run loads.
pub mod prelude {
    pub use crate::{
        // asupersync
        Cx,
        Outcome,
        // Core
        Connection,
        Error,
        Identifier,
        Result,
        Row,
        Value,
        // Mapping
        CollectionKind,
        CollectionPersister,
        EntityPersister,
        FetchStrategy,
        MappingMetamodel,
        // Locking
        LockMode,
        LockOptions,
        // Session
        CacheMode,
        EntityRef,
        LoadOptions,
        LoaderSettings,
        Session,
        SessionFactory,
        // Loading
        LoadEngine,
    };
}
