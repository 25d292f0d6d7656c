//! Loader settings and per-call load options.

use graphload_core::{
    CascadeProfile, ConfigError, EntityGraph, Error, GraphSemantic, LockMode, LockOptions, Result,
};
use graphload_query::Dialect;
use serde::{Deserialize, Serialize};

use crate::entity::EntityRef;

/// How batch sizes are chosen when several keys are loaded together.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchFetchStyle {
    /// Pre-built statements for a descending ladder of sizes
    /// (16, 10, 9, ..., 1 for a batch size of 16); keys are split across them.
    #[default]
    Legacy,
    /// Pick the smallest ladder size that fits and pad with the last key.
    Padded,
    /// Statements generated per key count (not supported).
    Dynamic,
}

/// How a session interacts with the shared cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    /// Read from and write to the cache.
    #[default]
    Normal,
    /// Read only.
    Get,
    /// Write only.
    Put,
    /// Neither read nor write.
    Ignore,
    /// Write, overwriting entries regardless of minimal puts.
    Refresh,
}

impl CacheMode {
    pub const fn is_get_enabled(self) -> bool {
        matches!(self, CacheMode::Normal | CacheMode::Get)
    }

    pub const fn is_put_enabled(self) -> bool {
        matches!(self, CacheMode::Normal | CacheMode::Put | CacheMode::Refresh)
    }
}

/// Factory-wide loader configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderSettings {
    /// SQL dialect for generated statements
    pub dialect: Dialect,
    /// Maximum depth of joined fetches below a root
    pub max_fetch_depth: usize,
    /// Batch size for entities and roles that do not declare one
    pub default_batch_fetch_size: usize,
    pub batch_fetch_style: BatchFetchStyle,
    /// Whether the shared cache is consulted and populated at all
    pub second_level_cache: bool,
    /// Never overwrite existing shared cache entries on load
    pub minimal_puts: bool,
    /// Cache immutable entities by reference instead of disassembled
    pub direct_reference_entries: bool,
    pub statistics: bool,
    /// Prefix statements with a comment naming the load
    pub use_sql_comments: bool,
    /// Number of compiled collection/natural-id/snapshot statements kept
    pub statement_cache_size: usize,
    /// Hydrate the caller's instance when loading into an optional object
    pub use_optional_entity_key: bool,
    /// Whether loaded entities are read-only by default
    pub default_read_only: bool,
}

impl Default for LoaderSettings {
    fn default() -> Self {
        Self {
            dialect: Dialect::default(),
            max_fetch_depth: 3,
            default_batch_fetch_size: 1,
            batch_fetch_style: BatchFetchStyle::default(),
            second_level_cache: true,
            minimal_puts: false,
            direct_reference_entries: false,
            statistics: false,
            use_sql_comments: false,
            statement_cache_size: 256,
            use_optional_entity_key: true,
            default_read_only: false,
        }
    }
}

impl LoaderSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse settings from JSON; absent fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(json).map_err(|e| {
            Error::Config(ConfigError {
                message: format!("invalid loader settings: {e}"),
                source: Some(Box::new(e)),
            })
        })?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_fetch_style == BatchFetchStyle::Dynamic {
            return Err(Error::unsupported(
                "dynamic batch fetching",
                "batch fetch style 'dynamic' is not supported; use 'legacy' or 'padded'",
            ));
        }
        if self.max_fetch_depth == 0 {
            return Err(Error::Config(ConfigError {
                message: "max_fetch_depth must be at least 1".to_string(),
                source: None,
            }));
        }
        Ok(())
    }

    #[must_use]
    pub fn dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    #[must_use]
    pub fn max_fetch_depth(mut self, depth: usize) -> Self {
        self.max_fetch_depth = depth;
        self
    }

    #[must_use]
    pub fn default_batch_fetch_size(mut self, size: usize) -> Self {
        self.default_batch_fetch_size = size.max(1);
        self
    }

    #[must_use]
    pub fn batch_fetch_style(mut self, style: BatchFetchStyle) -> Self {
        self.batch_fetch_style = style;
        self
    }

    #[must_use]
    pub fn second_level_cache(mut self, enabled: bool) -> Self {
        self.second_level_cache = enabled;
        self
    }

    #[must_use]
    pub fn minimal_puts(mut self, enabled: bool) -> Self {
        self.minimal_puts = enabled;
        self
    }

    #[must_use]
    pub fn direct_reference_entries(mut self, enabled: bool) -> Self {
        self.direct_reference_entries = enabled;
        self
    }

    #[must_use]
    pub fn statistics(mut self, enabled: bool) -> Self {
        self.statistics = enabled;
        self
    }

    #[must_use]
    pub fn use_sql_comments(mut self, enabled: bool) -> Self {
        self.use_sql_comments = enabled;
        self
    }

    #[must_use]
    pub fn statement_cache_size(mut self, size: usize) -> Self {
        self.statement_cache_size = size;
        self
    }

    #[must_use]
    pub fn use_optional_entity_key(mut self, enabled: bool) -> Self {
        self.use_optional_entity_key = enabled;
        self
    }

    #[must_use]
    pub fn default_read_only(mut self, read_only: bool) -> Self {
        self.default_read_only = read_only;
        self
    }

    /// Effective batch size for a mapping that declares `declared`.
    pub fn effective_batch_size(&self, declared: usize) -> usize {
        if declared > 1 {
            declared
        } else {
            self.default_batch_fetch_size.max(1)
        }
    }
}

/// Action run against every entity a load materializes, after post-load.
pub type AfterLoadAction = Box<dyn FnMut(&EntityRef) -> Result<()> + Send>;

/// Options for a single load call.
#[derive(Default)]
pub struct LoadOptions {
    pub lock: LockOptions,
    pub cache_mode: Option<CacheMode>,
    pub read_only: Option<bool>,
    pub enabled_profiles: Vec<String>,
    pub entity_graph: Option<(EntityGraph, GraphSemantic)>,
    pub cascade_profile: Option<CascadeProfile>,
    /// Maximum ids per statement for multi-id loads
    pub batch_size: Option<usize>,
    /// Multi-id loads: return results in request order (with `None` gaps)
    pub ordered_return: bool,
    /// Multi-id loads: consult the persistence context first
    pub session_check: bool,
    /// Multi-id loads: return entities scheduled for deletion
    pub include_removed: bool,
    pub after_load: Vec<AfterLoadAction>,
}

impl std::fmt::Debug for LoadOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadOptions")
            .field("lock", &self.lock)
            .field("cache_mode", &self.cache_mode)
            .field("read_only", &self.read_only)
            .field("enabled_profiles", &self.enabled_profiles)
            .field("entity_graph", &self.entity_graph)
            .field("cascade_profile", &self.cascade_profile)
            .field("batch_size", &self.batch_size)
            .field("ordered_return", &self.ordered_return)
            .field("session_check", &self.session_check)
            .field("include_removed", &self.include_removed)
            .field("after_load", &self.after_load.len())
            .finish()
    }
}

impl LoadOptions {
    #[must_use]
    pub fn new() -> Self {
        Self {
            ordered_return: true,
            session_check: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn lock(mut self, lock: LockOptions) -> Self {
        self.lock = lock;
        self
    }

    #[must_use]
    pub fn lock_mode(mut self, mode: LockMode) -> Self {
        self.lock.mode = mode;
        self
    }

    #[must_use]
    pub fn cache_mode(mut self, mode: CacheMode) -> Self {
        self.cache_mode = Some(mode);
        self
    }

    #[must_use]
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = Some(read_only);
        self
    }

    #[must_use]
    pub fn enable_profile(mut self, name: impl Into<String>) -> Self {
        self.enabled_profiles.push(name.into());
        self
    }

    #[must_use]
    pub fn entity_graph(mut self, graph: EntityGraph, semantic: GraphSemantic) -> Self {
        self.entity_graph = Some((graph, semantic));
        self
    }

    #[must_use]
    pub fn cascade_profile(mut self, profile: CascadeProfile) -> Self {
        self.cascade_profile = Some(profile);
        self
    }

    #[must_use]
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size.max(1));
        self
    }

    #[must_use]
    pub fn ordered_return(mut self, ordered: bool) -> Self {
        self.ordered_return = ordered;
        self
    }

    #[must_use]
    pub fn session_check(mut self, enabled: bool) -> Self {
        self.session_check = enabled;
        self
    }

    #[must_use]
    pub fn include_removed(mut self, enabled: bool) -> Self {
        self.include_removed = enabled;
        self
    }

    #[must_use]
    pub fn after_load(mut self, action: impl FnMut(&EntityRef) -> Result<()> + Send + 'static) -> Self {
        self.after_load.push(Box::new(action));
        self
    }
}
