//! Session factory and session.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use graphload_core::{
    Connection, EnabledFilter, Identifier, LoadQueryInfluencers, MappingMetamodel, Result,
};

use crate::cache::SecondLevelCache;
use crate::config::{CacheMode, LoaderSettings};
use crate::context::PersistenceContext;
use crate::entity::EntityRef;
use crate::events::LoadEventListeners;
use crate::key::{CollectionKey, EntityKey};
use crate::stats::Statistics;

/// Shared, immutable-after-build state: mappings, settings, the shared
/// cache and statistics.
#[derive(Debug)]
pub struct SessionFactory {
    metamodel: Arc<MappingMetamodel>,
    settings: LoaderSettings,
    cache: RwLock<SecondLevelCache>,
    statistics: Statistics,
}

impl SessionFactory {
    pub fn new(metamodel: MappingMetamodel, settings: LoaderSettings) -> Result<Arc<Self>> {
        settings.validate()?;
        tracing::info!(
            dialect = ?settings.dialect,
            batch_fetch_style = ?settings.batch_fetch_style,
            second_level_cache = settings.second_level_cache,
            "Session factory built"
        );
        Ok(Arc::new(Self {
            metamodel: Arc::new(metamodel),
            statistics: Statistics::new(settings.statistics),
            settings,
            cache: RwLock::new(SecondLevelCache::new()),
        }))
    }

    pub fn metamodel(&self) -> &Arc<MappingMetamodel> {
        &self.metamodel
    }

    pub fn settings(&self) -> &LoaderSettings {
        &self.settings
    }

    pub fn cache(&self) -> RwLockReadGuard<'_, SecondLevelCache> {
        self.cache.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn cache_mut(&self) -> RwLockWriteGuard<'_, SecondLevelCache> {
        self.cache.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn statistics(&self) -> &Statistics {
        &self.statistics
    }

    pub fn open_session<C: Connection>(self: &Arc<Self>, connection: C) -> Session<C> {
        Session::new(Arc::clone(self), connection)
    }
}

/// A unit of work over one connection.
///
/// The session owns the persistence context, so within a session every row
/// is represented by exactly one instance. Sessions are not shared between
/// tasks.
pub struct Session<C: Connection> {
    connection: C,
    factory: Arc<SessionFactory>,
    context: PersistenceContext,
    influencers: LoadQueryInfluencers,
    cache_mode: CacheMode,
    default_read_only: bool,
    listeners: LoadEventListeners,
    tenant: Option<String>,
}

impl<C: Connection> std::fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("entities", &self.context.entity_count())
            .field("collections", &self.context.collection_count())
            .field("cache_mode", &self.cache_mode)
            .field("default_read_only", &self.default_read_only)
            .field("tenant", &self.tenant)
            .field("listeners", &self.listeners)
            .finish_non_exhaustive()
    }
}

/// Disjoint borrows of a session's parts, used while materializing rows.
pub struct SessionView<'s> {
    pub factory: &'s Arc<SessionFactory>,
    pub context: &'s mut PersistenceContext,
    pub influencers: &'s LoadQueryInfluencers,
    pub listeners: &'s mut LoadEventListeners,
    pub cache_mode: CacheMode,
    pub default_read_only: bool,
    pub tenant: Option<&'s str>,
}

impl SessionView<'_> {
    pub fn metamodel(&self) -> &MappingMetamodel {
        &self.factory.metamodel
    }

    /// Key for a row of `root_entity` in this session's tenant.
    pub fn key(&self, root_entity: &str, id: Identifier) -> EntityKey {
        EntityKey::new(root_entity, id).with_tenant(self.tenant.map(str::to_string))
    }

    pub fn collection_key(&self, role: &str, key: Identifier) -> CollectionKey {
        CollectionKey::new(role, key).with_tenant(self.tenant.map(str::to_string))
    }
}

impl<C: Connection> Session<C> {
    pub fn new(factory: Arc<SessionFactory>, connection: C) -> Self {
        let default_read_only = factory.settings.default_read_only;
        Self {
            connection,
            factory,
            context: PersistenceContext::new(),
            influencers: LoadQueryInfluencers::new(),
            cache_mode: CacheMode::default(),
            default_read_only,
            listeners: LoadEventListeners::new(),
            tenant: None,
        }
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }

    pub fn factory(&self) -> &Arc<SessionFactory> {
        &self.factory
    }

    pub fn metamodel(&self) -> &MappingMetamodel {
        &self.factory.metamodel
    }

    pub fn persistence_context(&self) -> &PersistenceContext {
        &self.context
    }

    pub fn persistence_context_mut(&mut self) -> &mut PersistenceContext {
        &mut self.context
    }

    pub fn influencers(&self) -> &LoadQueryInfluencers {
        &self.influencers
    }

    pub fn influencers_mut(&mut self) -> &mut LoadQueryInfluencers {
        &mut self.influencers
    }

    /// Enable a filter defined in the metamodel; set its parameters on the
    /// returned handle.
    pub fn enable_filter(&mut self, name: &str) -> Result<&mut EnabledFilter> {
        self.influencers.enable_filter(&self.factory.metamodel, name)
    }

    pub fn disable_filter(&mut self, name: &str) {
        self.influencers.disable_filter(name);
    }

    pub fn enable_fetch_profile(&mut self, name: &str) -> Result<()> {
        self.influencers
            .enable_fetch_profile(&self.factory.metamodel, name)
    }

    pub fn disable_fetch_profile(&mut self, name: &str) {
        self.influencers.disable_fetch_profile(name);
    }

    pub fn cache_mode(&self) -> CacheMode {
        self.cache_mode
    }

    pub fn set_cache_mode(&mut self, mode: CacheMode) {
        self.cache_mode = mode;
    }

    pub fn is_default_read_only(&self) -> bool {
        self.default_read_only
    }

    pub fn set_default_read_only(&mut self, read_only: bool) {
        self.default_read_only = read_only;
    }

    pub fn listeners_mut(&mut self) -> &mut LoadEventListeners {
        &mut self.listeners
    }

    pub fn tenant(&self) -> Option<&str> {
        self.tenant.as_deref()
    }

    pub fn set_tenant(&mut self, tenant: Option<String>) {
        self.tenant = tenant;
    }

    pub fn entity_key(&self, entity: &str, id: impl Into<Identifier>) -> Result<EntityKey> {
        Ok(EntityKey::for_entity(&self.factory.metamodel, entity, id.into())?
            .with_tenant(self.tenant.clone()))
    }

    pub fn collection_key(&self, role: &str, key: impl Into<Identifier>) -> CollectionKey {
        CollectionKey::new(role, key.into()).with_tenant(self.tenant.clone())
    }

    /// The managed instance for an entity id, if this session holds one.
    pub fn get_managed(&self, entity: &str, id: impl Into<Identifier>) -> Option<EntityRef> {
        let key = self.entity_key(entity, id).ok()?;
        self.context.get_entity(&key)
    }

    pub fn contains(&self, entity: &str, id: impl Into<Identifier>) -> bool {
        self.get_managed(entity, id).is_some()
    }

    /// Schedule a managed entity for deletion.
    #[tracing::instrument(level = "debug", skip(self, id))]
    pub fn remove(&mut self, entity: &str, id: impl Into<Identifier>) -> Result<bool> {
        let key = self.entity_key(entity, id)?;
        Ok(self.context.mark_removed(&key))
    }

    /// Detach an entity from this session.
    pub fn evict(&mut self, entity: &str, id: impl Into<Identifier>) -> Result<Option<EntityRef>> {
        let key = self.entity_key(entity, id)?;
        Ok(self.context.remove_entity(&key))
    }

    /// Detach everything.
    pub fn clear(&mut self) {
        self.context.clear();
    }

    /// Close the session, releasing any cyclic graphs it loaded.
    pub fn close(mut self) -> C {
        self.context.clear();
        self.connection
    }

    /// Split the session into its connection and the parts a load mutates.
    pub fn split(&mut self) -> (&C, SessionView<'_>) {
        (
            &self.connection,
            SessionView {
                factory: &self.factory,
                context: &mut self.context,
                influencers: &self.influencers,
                listeners: &mut self.listeners,
                cache_mode: self.cache_mode,
                default_read_only: self.default_read_only,
                tenant: self.tenant.as_deref(),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BatchFetchStyle;
    use crate::entity::EntityInstance;
    use graphload_core::{Cx, EntityPersister, LockMode, Outcome, Row, Value};

    struct NoRows;

    impl Connection for NoRows {
        fn query(
            &self,
            _cx: &Cx,
            _sql: &str,
            _params: &[Value],
        ) -> impl Future<Output = Outcome<Vec<Row>, graphload_core::Error>> + Send {
            async { Outcome::Ok(Vec::new()) }
        }
    }

    fn factory() -> Arc<SessionFactory> {
        let mm = MappingMetamodel::builder()
            .entity(
                EntityPersister::builder("Customer", "customers")
                    .id("id", "id")
                    .basic("name", "name")
                    .build(),
            )
            .build()
            .unwrap();
        SessionFactory::new(mm, LoaderSettings::default()).unwrap()
    }

    #[test]
    fn dynamic_batch_style_fails_factory_build() {
        let mm = MappingMetamodel::builder().build().unwrap();
        let err = SessionFactory::new(
            mm,
            LoaderSettings::default().batch_fetch_style(BatchFetchStyle::Dynamic),
        )
        .unwrap_err();
        assert!(err.is_unsupported());
    }

    #[test]
    fn remove_and_evict() {
        let factory = factory();
        let mut session = factory.open_session(NoRows);
        let key = session.entity_key("Customer", 1).unwrap();
        let persister = Arc::clone(session.metamodel().entity("Customer").unwrap());
        let instance = EntityRef::new(EntityInstance::uninitialized(persister, Identifier::from(1)));
        session
            .persistence_context_mut()
            .add_uninitialized_entity(key.clone(), instance, LockMode::None);
        assert!(session.contains("Customer", 1));
        assert!(session.remove("Customer", 1).unwrap());
        assert!(
            session
                .persistence_context()
                .get_entry(&key)
                .unwrap()
                .status
                .is_removed()
        );
        assert!(session.evict("Customer", 1).unwrap().is_some());
        assert!(!session.contains("Customer", 1));
    }

    #[test]
    fn tenant_flows_into_keys() {
        let factory = factory();
        let mut session = factory.open_session(NoRows);
        session.set_tenant(Some("acme".into()));
        let key = session.entity_key("Customer", 1).unwrap();
        assert_eq!(key.tenant.as_deref(), Some("acme"));
        let (_, view) = session.split();
        assert_eq!(view.key("Customer", Identifier::from(1)), key);
    }

    #[test]
    fn unknown_filter_is_rejected() {
        let factory = factory();
        let mut session = factory.open_session(NoRows);
        assert!(session.enable_filter("missing").is_err());
    }
}
