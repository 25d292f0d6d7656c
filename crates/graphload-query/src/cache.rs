//! Caching of compiled load queries.
//!
//! Compiled queries are keyed by a hash of whatever shaped them (entity or
//! role, batch size, lock mode, restriction) so repeated loads skip plan
//! building and compilation.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;

use crate::compiler::CompiledLoadQuery;

/// A cached compiled query.
#[derive(Debug, Clone)]
pub struct CachedQuery {
    pub query: Arc<CompiledLoadQuery>,
    /// When this entry was last accessed.
    pub last_used: Instant,
    /// Number of times this query has been served.
    pub hit_count: u64,
    tick: u64,
}

/// LRU-style cache for compiled load queries.
///
/// When the cache exceeds `max_size`, the least-recently-used entry is evicted.
#[derive(Debug)]
pub struct QueryCache {
    cache: HashMap<u64, CachedQuery>,
    max_size: usize,
    clock: u64,
}

impl QueryCache {
    /// Create a new cache with the given maximum number of entries.
    pub fn new(max_size: usize) -> Self {
        Self {
            cache: HashMap::with_capacity(max_size.min(256)),
            max_size: max_size.max(1),
            clock: 0,
        }
    }

    pub fn get(&mut self, key: u64) -> Option<Arc<CompiledLoadQuery>> {
        self.clock += 1;
        let entry = self.cache.get_mut(&key)?;
        entry.tick = self.clock;
        entry.last_used = Instant::now();
        entry.hit_count += 1;
        Some(Arc::clone(&entry.query))
    }

    pub fn insert(&mut self, key: u64, query: Arc<CompiledLoadQuery>) {
        if !self.cache.contains_key(&key) && self.cache.len() >= self.max_size {
            self.evict_lru();
        }
        self.clock += 1;
        self.cache.insert(
            key,
            CachedQuery {
                query,
                last_used: Instant::now(),
                hit_count: 0,
                tick: self.clock,
            },
        );
    }

    /// Get a cached query or compile and insert it.
    ///
    /// The `builder` closure is only called on cache miss; its error is
    /// returned without caching anything.
    pub fn get_or_try_insert<E>(
        &mut self,
        key: u64,
        builder: impl FnOnce() -> Result<CompiledLoadQuery, E>,
    ) -> Result<Arc<CompiledLoadQuery>, E> {
        if let Some(query) = self.get(key) {
            return Ok(query);
        }
        let query = Arc::new(builder()?);
        self.insert(key, Arc::clone(&query));
        Ok(query)
    }

    pub fn contains(&self, key: u64) -> bool {
        self.cache.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }

    fn evict_lru(&mut self) {
        if let Some((&lru_key, _)) = self.cache.iter().min_by_key(|(_, entry)| entry.tick) {
            self.cache.remove(&lru_key);
        }
    }
}

/// Compute a hash key for caching from any hashable value.
pub fn cache_key(value: &impl Hash) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new(256)
    }
}
