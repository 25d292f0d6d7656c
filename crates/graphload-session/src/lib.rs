//! Session state for graphload.
//!
//! `graphload-session` holds everything a load reads and mutates besides
//! the database:
//!
//! - **Persistence context**: one instance per row, entity entries, proxies,
//!   collections, natural-id resolutions and null to-one markers.
//! - **Batch fetch queue**: keys of uninitialized proxies and collections
//!   that can be loaded together, and subselect descriptors.
//! - **Shared cache**: region-partitioned disassembled entity state.
//! - **Listeners and statistics**.
//! - **Settings**: [`LoaderSettings`] for the factory, [`LoadOptions`] per call.

pub mod batch;
pub mod cache;
pub mod collection;
pub mod config;
pub mod context;
pub mod entity;
pub mod events;
pub mod key;
pub mod session;
pub mod stats;

pub use batch::{BatchFetchQueue, SubselectFetch};
pub use cache::{
    CacheEntry, CacheKey, DisassembledValue, SecondLevelCache, StandardCacheEntry, disassemble,
};
pub use collection::{CollectionLoadContext, CollectionRef, PersistentCollection};
pub use config::{AfterLoadAction, BatchFetchStyle, CacheMode, LoadOptions, LoaderSettings};
pub use context::PersistenceContext;
pub use entity::{
    ElementValue, EntityEntry, EntityInstance, EntityReadGuard, EntityRef, EntityStatus,
    EntityWriteGuard, PropertyValue,
};
pub use events::{LoadEventListeners, PostLoadEvent, PreLoadEvent};
pub use key::{CollectionKey, EntityKey};
pub use session::{Session, SessionFactory, SessionView};
pub use stats::{RegionStatistics, Statistics, StatisticsSnapshot};
