//! The load engine: compiled-statement caches shared by every session of a
//! factory, plus the execute-and-drain loop all loaders run on.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use asupersync::{Cx, Outcome};
use graphload_core::{
    CascadeProfile, ConfigError, Connection, Error, Identifier, LoadPlan, LoadQueryInfluencers,
    LockMode, LockOptions, NotFoundError, Result, Value,
};
use graphload_query::{
    CompileOptions, CompiledLoadQuery, LoadPlanBuilder, LoadQueryCompiler, ParameterSlot,
    QueryCache, RootRestriction, cache_key,
};
use graphload_session::{
    AfterLoadAction, CacheMode, EntityKey, EntityRef, LoadOptions, PropertyValue, Session,
    SessionFactory,
};

use crate::binder::{bind_parameters, execute};
use crate::plan_cache::EntityLoader;
use crate::processing::{PendingLoad, ResultSetProcessingContext};
use crate::single_id::EntityRequest;
use crate::two_phase::Finished;

/// Loads entities, collections, natural ids and snapshots for the sessions
/// of one [`SessionFactory`].
///
/// The engine owns no per-session state; everything it caches is a
/// compiled statement keyed by what shaped it.
pub struct LoadEngine {
    factory: Arc<SessionFactory>,
    entity_loaders: RwLock<HashMap<String, Arc<EntityLoader>>>,
    statements: Mutex<QueryCache>,
    compile_count: AtomicUsize,
}

impl std::fmt::Debug for LoadEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadEngine")
            .field("compile_count", &self.compile_count())
            .finish_non_exhaustive()
    }
}

/// Inputs of one statement execution.
pub(crate) struct Execution<'a> {
    pub keys: &'a [Identifier],
    pub natural_id: &'a [Value],
    pub inherited: &'a [Value],
    pub lock_mode: LockMode,
    pub read_only: bool,
    pub optional: Option<(EntityKey, EntityRef)>,
}

impl<'a> Execution<'a> {
    pub fn keys(keys: &'a [Identifier], lock_mode: LockMode, read_only: bool) -> Self {
        Self {
            keys,
            natural_id: &[],
            inherited: &[],
            lock_mode,
            read_only,
            optional: None,
        }
    }
}

/// Roots (deduplicated, in row order) and the finished batch of one statement.
pub(crate) struct Executed {
    pub roots: Vec<EntityRef>,
    pub finished: Finished,
}

/// Session state a [`LoadOptions`] overrides for the duration of one call.
pub(crate) struct SavedSessionState {
    influencers: LoadQueryInfluencers,
    cache_mode: CacheMode,
}

impl SavedSessionState {
    pub fn restore<C: Connection>(self, session: &mut Session<C>) {
        *session.influencers_mut() = self.influencers;
        session.set_cache_mode(self.cache_mode);
    }
}

/// Enabled filter and profile names, sorted, plus the cascade profile.
type InfluencerKey = (Vec<String>, Vec<String>, Option<CascadeProfile>);

fn influencer_key(influencers: &LoadQueryInfluencers) -> InfluencerKey {
    let mut filters: Vec<String> = influencers
        .enabled_filters()
        .map(|f| f.name.clone())
        .collect();
    filters.sort();
    let mut profiles: Vec<String> = influencers
        .enabled_fetch_profiles()
        .map(str::to_string)
        .collect();
    profiles.sort();
    (filters, profiles, influencers.internal_fetch_profile())
}

impl LoadEngine {
    pub fn new(factory: Arc<SessionFactory>) -> Self {
        let capacity = factory.settings().statement_cache_size;
        Self {
            factory,
            entity_loaders: RwLock::new(HashMap::new()),
            statements: Mutex::new(QueryCache::new(capacity)),
            compile_count: AtomicUsize::new(0),
        }
    }

    pub fn factory(&self) -> &Arc<SessionFactory> {
        &self.factory
    }

    /// Number of statements compiled so far.
    pub fn compile_count(&self) -> usize {
        self.compile_count.load(Ordering::Relaxed)
    }

    /// Drop every cached statement.
    pub fn clear_statements(&self) {
        self.entity_loaders
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.statements
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub(crate) fn check_session<C: Connection>(&self, session: &Session<C>) -> Result<()> {
        if Arc::ptr_eq(&self.factory, session.factory()) {
            Ok(())
        } else {
            Err(Error::Config(ConfigError {
                message: "session belongs to a different session factory".to_string(),
                source: None,
            }))
        }
    }

    /// Apply per-call overrides; undone by [`SavedSessionState::restore`].
    pub(crate) fn apply_options<C: Connection>(
        &self,
        session: &mut Session<C>,
        options: &LoadOptions,
    ) -> Result<SavedSessionState> {
        let saved = SavedSessionState {
            influencers: session.influencers().clone(),
            cache_mode: session.cache_mode(),
        };
        if let Some(mode) = options.cache_mode {
            session.set_cache_mode(mode);
        }
        for profile in &options.enabled_profiles {
            if let Err(e) = session.enable_fetch_profile(profile) {
                saved.restore(session);
                return Err(e);
            }
        }
        if let Some((graph, semantic)) = &options.entity_graph {
            session
                .influencers_mut()
                .apply_entity_graph(graph.clone(), *semantic);
        }
        if let Some(profile) = options.cascade_profile {
            session
                .influencers_mut()
                .set_internal_fetch_profile(Some(profile));
        }
        Ok(saved)
    }

    fn compiler<'a>(&'a self, influencers: &'a LoadQueryInfluencers) -> LoadQueryCompiler<'a> {
        let settings = self.factory.settings();
        LoadQueryCompiler::new(self.factory.metamodel(), influencers, settings.dialect)
            .use_sql_comments(settings.use_sql_comments)
    }

    fn plan_builder<'a>(&'a self, influencers: &'a LoadQueryInfluencers) -> LoadPlanBuilder<'a> {
        LoadPlanBuilder::new(self.factory.metamodel(), influencers)
            .max_fetch_depth(self.factory.settings().max_fetch_depth)
    }

    fn entity_loader(&self, entity: &str) -> Arc<EntityLoader> {
        if let Some(loader) = self
            .entity_loaders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(entity)
        {
            return Arc::clone(loader);
        }
        let mut loaders = self
            .entity_loaders
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            loaders
                .entry(entity.to_string())
                .or_insert_with(|| Arc::new(EntityLoader::new(entity))),
        )
    }

    pub(crate) fn cached_statement(
        &self,
        key: u64,
        compile: impl FnOnce() -> Result<CompiledLoadQuery>,
    ) -> Result<Arc<CompiledLoadQuery>> {
        let mut statements = self
            .statements
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if statements.contains(key) {
            tracing::debug!(key, "Reusing cached load statement");
        }
        statements.get_or_try_insert(key, compile)
    }

    /// Compile an entity plan built from the mappings and influencers.
    pub(crate) fn compile_entity(
        &self,
        influencers: &LoadQueryInfluencers,
        entity: &str,
        options: &CompileOptions,
    ) -> Result<CompiledLoadQuery> {
        self.compile_count.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(entity, batch_size = options.batch_size, "Compiling entity load statement");
        let plan = self.plan_builder(influencers).build_entity_plan(entity)?;
        self.compiler(influencers).compile(plan, options)
    }

    /// The by-id statement for `batch_size` keys of `entity`.
    pub(crate) fn entity_query(
        &self,
        influencers: &LoadQueryInfluencers,
        entity: &str,
        lock: &LockOptions,
        batch_size: usize,
    ) -> Result<Arc<CompiledLoadQuery>> {
        self.entity_loader(entity).query(
            self.factory.metamodel(),
            influencers,
            lock,
            batch_size,
            || {
                self.compile_entity(
                    influencers,
                    entity,
                    &CompileOptions::default()
                        .batch_size(batch_size)
                        .lock(lock.clone()),
                )
            },
        )
    }

    /// The statement initializing `batch_size` collections of `role`.
    pub(crate) fn collection_query(
        &self,
        influencers: &LoadQueryInfluencers,
        role: &str,
        batch_size: usize,
        restriction: RootRestriction,
    ) -> Result<Arc<CompiledLoadQuery>> {
        let key = cache_key(&("collection", role, batch_size, &restriction, influencer_key(influencers)));
        let compile = || {
            self.compile_count.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(role, batch_size, "Compiling collection load statement");
            let plan = self.plan_builder(influencers).build_collection_plan(role)?;
            self.compiler(influencers).compile(
                plan,
                &CompileOptions::default()
                    .batch_size(batch_size)
                    .restriction(restriction),
            )
        };
        if influencers.entity_graph().is_some() {
            return compile().map(Arc::new);
        }
        self.cached_statement(key, compile)
    }

    /// Single-table select of one entity's own columns, joining nothing.
    pub(crate) fn flat_query(&self, entity: &str, lock: &LockOptions) -> Result<Arc<CompiledLoadQuery>> {
        let compile = || {
            self.compile_count.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(entity, lock = ?lock.mode, "Compiling flat entity statement");
            let influencers = LoadQueryInfluencers::new();
            let (plan, _) = LoadPlan::for_entity(entity);
            self.compiler(&influencers)
                .compile(plan, &CompileOptions::default().lock(lock.clone()))
        };
        if !lock.is_wait_forever() || !lock.alias_modes.is_empty() {
            return compile().map(Arc::new);
        }
        self.cached_statement(cache_key(&("flat", entity, lock.mode)), compile)
    }

    /// Bind, run and materialize one statement.
    pub(crate) async fn execute_plan<C: Connection>(
        &self,
        cx: &Cx,
        session: &mut Session<C>,
        query: &CompiledLoadQuery,
        execution: Execution<'_>,
        after_load: &mut [AfterLoadAction],
    ) -> Outcome<Executed, Error> {
        let bind = |slots: &[ParameterSlot]| {
            bind_parameters(
                slots,
                execution.keys,
                session.influencers(),
                execution.natural_id,
                execution.inherited,
            )
        };
        let params = try_result!(bind(&query.slots));
        let subselect_parameters = match &query.subselect_source {
            Some(source) => Some(try_result!(bind(&source.slots))),
            None => None,
        };

        let rows = try_outcome!(
            execute(cx, session.connection(), query, &params, self.factory.statistics()).await
        );

        let (_, mut view) = session.split();
        let mut context =
            ResultSetProcessingContext::new(query, execution.lock_mode, execution.read_only);
        if let Some((key, instance)) = execution.optional {
            context = context.with_optional(key, instance);
        }
        if let Some(parameters) = subselect_parameters {
            context = context.with_subselect_parameters(parameters);
        }
        let mut roots: Vec<EntityRef> = Vec::new();
        for (index, row) in rows.iter().enumerate() {
            tracing::trace!(row = index, "Processing row");
            if let Some(root) = try_result!(context.process_row(row, &mut view)) {
                if !roots.iter().any(|r| r.ptr_eq(&root)) {
                    roots.push(root);
                }
            }
        }
        let finished = try_result!(context.finish(&mut view, after_load));
        Outcome::Ok(Executed { roots, finished })
    }

    /// Run follow-up loads until none remain.
    ///
    /// Loads enqueue further loads rather than recursing, so arbitrarily
    /// deep or cyclic graphs terminate once every key is initialized.
    pub(crate) async fn drain<C: Connection>(
        &self,
        cx: &Cx,
        session: &mut Session<C>,
        pending: Vec<PendingLoad>,
        read_only: bool,
        after_load: &mut [AfterLoadAction],
    ) -> Outcome<(), Error> {
        let mut queue: VecDeque<PendingLoad> = pending.into();
        while let Some(load) = queue.pop_front() {
            match load {
                PendingLoad::Entity { key, entity, owner } => {
                    if session
                        .persistence_context()
                        .get_entity_or_proxy(&key)
                        .is_some_and(|e| e.is_initialized())
                    {
                        continue;
                    }
                    let persister = Arc::clone(try_result!(self.factory.metamodel().entity(&entity)));
                    let lock = LockOptions::NONE;
                    let request = EntityRequest {
                        persister: &persister,
                        key: &key,
                        lock: &lock,
                        read_only,
                        optional: None,
                    };
                    let (found, more) =
                        try_outcome!(self.load_one(cx, session, request, after_load).await);
                    queue.extend(more);
                    if found.is_some() {
                        self.factory.statistics().entity_fetched(&entity);
                        continue;
                    }
                    match owner {
                        Some((owner_key, property)) => {
                            null_missing_one_to_one(session, &key, &owner_key, &property);
                        }
                        None => {
                            return Outcome::Err(Error::ObjectNotFound(NotFoundError {
                                entity,
                                id: key.id,
                            }));
                        }
                    }
                }
                PendingLoad::Collection { key } => {
                    if session
                        .persistence_context()
                        .get_collection(&key)
                        .is_some_and(|c| c.is_initialized())
                    {
                        continue;
                    }
                    let more = try_outcome!(
                        self.load_collection_batch(cx, session, &key, after_load).await
                    );
                    queue.extend(more);
                }
            }
        }
        Outcome::Ok(())
    }
}

/// An unconstrained one-to-one whose row does not exist is null, and stays
/// null for the rest of the session.
fn null_missing_one_to_one<C: Connection>(
    session: &mut Session<C>,
    key: &EntityKey,
    owner_key: &EntityKey,
    property: &str,
) {
    let context = session.persistence_context_mut();
    context.remove_proxy(key);
    context.batch_queue_mut().remove_batch_loadable_entity_key(key);
    if let Some(owner) = context.get_entity(owner_key) {
        let mut instance = owner.write();
        if let Some(index) = instance.persister.property_index(property) {
            instance.state[index] = PropertyValue::Entity(None);
        }
    }
    context.add_null_property(owner_key.clone(), property);
    tracing::debug!(owner = %owner_key, property, "One-to-one target does not exist");
}
