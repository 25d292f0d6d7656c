//! Loaders for graphload.
//!
//! [`LoadEngine`] is the entry point. For each load it:
//!
//! - consults the session's persistence context, then the shared cache
//! - compiles (or reuses) a statement for the plan built from the mappings
//! - binds keys, filter parameters and natural-id values positionally
//! - materializes rows in two phases: every row's entities are registered
//!   before any association is resolved, so cyclic graphs converge on one
//!   instance per row
//! - drains follow-up loads (immediate select fetches, batched proxies and
//!   collections, subselect fetches) without recursion

macro_rules! try_outcome {
    ($e:expr) => {
        match $e {
            ::asupersync::Outcome::Ok(v) => v,
            ::asupersync::Outcome::Err(e) => return ::asupersync::Outcome::Err(e),
            ::asupersync::Outcome::Cancelled(r) => return ::asupersync::Outcome::Cancelled(r),
            ::asupersync::Outcome::Panicked(p) => return ::asupersync::Outcome::Panicked(p),
        }
    };
}

macro_rules! try_result {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(e) => return ::asupersync::Outcome::Err(e),
        }
    };
}

pub mod batch;
pub mod binder;
pub mod cache_bridge;
pub mod collection;
pub mod engine;
pub mod multi_id;
pub mod natural_id;
pub mod plan_cache;
pub mod processing;
pub mod single_id;
pub mod snapshot;
pub mod two_phase;

pub use batch::{KeyBatch, batch_sizes, first_batch, legacy_batch_sizes, split_batches};
pub use binder::{bind_parameters, execute};
pub use cache_bridge::{SessionCacheResult, load_from_second_level_cache, load_from_session_cache};
pub use engine::LoadEngine;
pub use plan_cache::EntityLoader;
pub use processing::{PendingLoad, ResultSetProcessingContext};
