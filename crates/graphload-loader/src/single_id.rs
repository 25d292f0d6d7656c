//! Loading one entity by identifier.
//!
//! Every by-id load resolves in the same order: the persistence context,
//! then the shared cache (unless the lock mode forbids it), then a batched
//! statement that also initializes queued proxies of the same entity.

use std::sync::Arc;

use asupersync::{Cx, Outcome};
use graphload_core::{
    Connection, EntityPersister, Error, Identifier, LockOptions, NotFoundError, Result,
    StaleStateError, WrongClassError, WrongClassErrorKind,
};
use graphload_session::{AfterLoadAction, EntityKey, EntityRef, LoadOptions, Session};

use crate::batch::first_batch;
use crate::binder::{bind_parameters, execute};
use crate::cache_bridge::{SessionCacheResult, load_from_second_level_cache, load_from_session_cache};
use crate::engine::{Execution, LoadEngine};
use crate::processing::{PendingLoad, entity_proxy};

/// What to load and how.
pub(crate) struct EntityRequest<'a> {
    pub persister: &'a Arc<EntityPersister>,
    pub key: &'a EntityKey,
    pub lock: &'a LockOptions,
    pub read_only: bool,
    /// Instance to hydrate instead of creating one.
    pub optional: Option<EntityRef>,
}

fn not_found(entity: &str, id: Identifier) -> Error {
    Error::ObjectNotFound(NotFoundError {
        entity: entity.to_string(),
        id,
    })
}

fn stale(persister: &EntityPersister, key: &EntityKey, expected: Option<String>, actual: Option<String>) -> Error {
    Error::StaleState(StaleStateError {
        entity: persister.entity_name.clone(),
        id: key.id.clone(),
        expected_version: expected,
        actual_version: actual,
    })
}

impl LoadEngine {
    /// Load an entity, returning `None` when no row exists.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = %entity))]
    pub async fn get<C: Connection>(
        &self,
        cx: &Cx,
        session: &mut Session<C>,
        entity: &str,
        id: impl Into<Identifier>,
        mut options: LoadOptions,
    ) -> Outcome<Option<EntityRef>, Error> {
        try_result!(self.check_session(session));
        let saved = try_result!(self.apply_options(session, &options));
        let outcome = self
            .load_entity(cx, session, entity, id.into(), &mut options, None)
            .await;
        saved.restore(session);
        outcome
    }

    /// Load an entity that must exist.
    pub async fn load<C: Connection>(
        &self,
        cx: &Cx,
        session: &mut Session<C>,
        entity: &str,
        id: impl Into<Identifier>,
        options: LoadOptions,
    ) -> Outcome<EntityRef, Error> {
        let id = id.into();
        match self.get(cx, session, entity, id.clone(), options).await {
            Outcome::Ok(Some(instance)) => Outcome::Ok(instance),
            Outcome::Ok(None) => Outcome::Err(not_found(entity, id)),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Load the row of `id` into a caller-supplied instance.
    ///
    /// When the session already manages an initialized instance under the
    /// key, that instance is returned and `instance` is left untouched.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = %entity))]
    pub async fn load_into<C: Connection>(
        &self,
        cx: &Cx,
        session: &mut Session<C>,
        entity: &str,
        id: impl Into<Identifier>,
        instance: EntityRef,
        mut options: LoadOptions,
    ) -> Outcome<EntityRef, Error> {
        try_result!(self.check_session(session));
        let id = id.into();
        let key = try_result!(session.entity_key(entity, id.clone()));
        if let Some(existing) = session.persistence_context().get_entity(&key) {
            if !existing.ptr_eq(&instance) && existing.is_initialized() {
                let actual = existing.entity_name();
                if !session.metamodel().is_subtype(&actual, entity) {
                    let context = session.persistence_context_mut();
                    context.remove_entity(&key);
                    context.remove_proxy(&key);
                    return Outcome::Err(Error::WrongClass(WrongClassError {
                        kind: WrongClassErrorKind::InconsistentReturnClass,
                        entity: entity.to_string(),
                        id,
                        message: format!("managed instance is a {actual}"),
                    }));
                }
                return Outcome::Ok(existing);
            }
        }

        let by_key = self.factory().settings().use_optional_entity_key;
        if !by_key {
            session
                .persistence_context_mut()
                .add_proxy(key.clone(), instance.clone());
        }
        let saved = try_result!(self.apply_options(session, &options));
        let outcome = self
            .load_entity(cx, session, entity, id.clone(), &mut options, by_key.then_some(instance))
            .await;
        saved.restore(session);
        match outcome {
            Outcome::Ok(Some(loaded)) => Outcome::Ok(loaded),
            Outcome::Ok(None) => {
                if !by_key {
                    session.persistence_context_mut().remove_proxy(&key);
                }
                Outcome::Err(not_found(entity, id))
            }
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// A managed instance or proxy for `id`, without touching the database.
    pub fn get_reference<C: Connection>(
        &self,
        session: &mut Session<C>,
        entity: &str,
        id: impl Into<Identifier>,
    ) -> Result<EntityRef> {
        self.check_session(session)?;
        let (_, mut view) = session.split();
        entity_proxy(&mut view, entity, id.into()).map(|(instance, _)| instance)
    }

    /// Initialize a proxy handed out by this session.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn initialize_proxy<C: Connection>(
        &self,
        cx: &Cx,
        session: &mut Session<C>,
        proxy: &EntityRef,
    ) -> Outcome<(), Error> {
        try_result!(self.check_session(session));
        if proxy.is_initialized() {
            return Outcome::Ok(());
        }
        let (entity, id) = {
            let instance = proxy.read();
            (instance.persister.entity_name.clone(), instance.id.clone())
        };
        let key = try_result!(session.entity_key(&entity, id.clone()));
        match session.persistence_context().get_entity_or_proxy(&key) {
            Some(registered) if !registered.ptr_eq(proxy) => {
                return Outcome::Err(Error::Custom(format!(
                    "could not initialize proxy {key}: the session manages another instance"
                )));
            }
            Some(_) => {}
            None => session
                .persistence_context_mut()
                .add_proxy(key.clone(), proxy.clone()),
        }

        let persister = Arc::clone(try_result!(self.factory().metamodel().entity(&entity)));
        let read_only = proxy.is_read_only() || session.is_default_read_only();
        let lock = LockOptions::NONE;
        let request = EntityRequest {
            persister: &persister,
            key: &key,
            lock: &lock,
            read_only,
            optional: None,
        };
        let (found, pending) = try_outcome!(self.load_one(cx, session, request, &mut []).await);
        if found.is_none() {
            session.persistence_context_mut().remove_proxy(&key);
            return Outcome::Err(not_found(&entity, id));
        }
        self.drain(cx, session, pending, read_only, &mut []).await
    }

    async fn load_entity<C: Connection>(
        &self,
        cx: &Cx,
        session: &mut Session<C>,
        entity: &str,
        id: Identifier,
        options: &mut LoadOptions,
        optional: Option<EntityRef>,
    ) -> Outcome<Option<EntityRef>, Error> {
        let persister = Arc::clone(try_result!(self.factory().metamodel().entity(entity)));
        let key = try_result!(session.entity_key(entity, id));
        let read_only = options.read_only.unwrap_or(session.is_default_read_only());
        let request = EntityRequest {
            persister: &persister,
            key: &key,
            lock: &options.lock,
            read_only,
            optional,
        };
        let (found, pending) =
            try_outcome!(self.load_one(cx, session, request, &mut options.after_load).await);
        try_outcome!(
            self.drain(cx, session, pending, read_only, &mut options.after_load)
                .await
        );
        Outcome::Ok(found)
    }

    /// Resolve one key without draining follow-up loads.
    pub(crate) async fn load_one<C: Connection>(
        &self,
        cx: &Cx,
        session: &mut Session<C>,
        request: EntityRequest<'_>,
        after_load: &mut [AfterLoadAction],
    ) -> Outcome<(Option<EntityRef>, Vec<PendingLoad>), Error> {
        let EntityRequest {
            persister,
            key,
            lock,
            read_only,
            optional,
        } = request;

        let cached = try_result!(load_from_session_cache(
            session.persistence_context_mut(),
            self.factory().metamodel(),
            persister,
            key,
            true,
        ));
        match cached {
            SessionCacheResult::Found(instance) => {
                try_outcome!(self.upgrade_lock(cx, session, persister, key, lock).await);
                return Outcome::Ok((Some(instance), Vec::new()));
            }
            SessionCacheResult::Removed => {
                tracing::debug!(key = %key, "Entity is scheduled for removal");
                return Outcome::Ok((None, Vec::new()));
            }
            SessionCacheResult::Miss => {}
        }

        {
            let (_, mut view) = session.split();
            if let Some((instance, pending)) = try_result!(load_from_second_level_cache(
                &mut view,
                persister,
                key,
                lock.mode,
                read_only,
                optional.clone(),
            )) {
                return Outcome::Ok((Some(instance), pending));
            }
        }

        let settings = self.factory().settings();
        let max = settings.effective_batch_size(persister.batch_size);
        let ids = if max > 1 && optional.is_none() {
            session
                .persistence_context()
                .batch_queue()
                .entity_batch(key, max)
        } else {
            vec![key.id.clone()]
        };
        let batch = try_result!(first_batch(ids, max, settings.batch_fetch_style));
        let query = try_result!(self.entity_query(
            session.influencers(),
            &persister.entity_name,
            lock,
            batch.size,
        ));
        tracing::debug!(key = %key, batch_size = batch.size, "Loading entity from database");

        let mut execution = Execution::keys(&batch.keys, lock.mode, read_only);
        execution.optional = optional.map(|instance| (key.clone(), instance));
        let executed =
            try_outcome!(self.execute_plan(cx, session, &query, execution, after_load).await);

        let context = session.persistence_context_mut();
        for id in &batch.keys {
            let batched = EntityKey {
                entity: key.entity.clone(),
                id: id.clone(),
                tenant: key.tenant.clone(),
            };
            if !context
                .get_entity(&batched)
                .is_some_and(|e| e.is_initialized())
            {
                context
                    .batch_queue_mut()
                    .remove_batch_loadable_entity_key(&batched);
            }
        }
        let found = context.get_entity(key).filter(EntityRef::is_initialized);
        Outcome::Ok((found, executed.finished.pending))
    }

    /// Raise the lock held on a managed entity.
    ///
    /// Pessimistic modes re-read the row with the lock; a missing row or a
    /// changed version is stale state.
    pub(crate) async fn upgrade_lock<C: Connection>(
        &self,
        cx: &Cx,
        session: &mut Session<C>,
        persister: &EntityPersister,
        key: &EntityKey,
        lock: &LockOptions,
    ) -> Outcome<(), Error> {
        let Some(entry) = session.persistence_context().get_entry(key) else {
            return Outcome::Ok(());
        };
        if !lock.mode.greater_than(entry.lock_mode) {
            return Outcome::Ok(());
        }
        let expected = entry.version.clone();

        if lock.mode.is_pessimistic() {
            let query = try_result!(self.flat_query(&persister.entity_name, lock));
            let params = try_result!(bind_parameters(
                &query.slots,
                std::slice::from_ref(&key.id),
                session.influencers(),
                &[],
                &[],
            ));
            let statistics = self.factory().statistics();
            let rows = try_outcome!(execute(cx, session.connection(), &query, &params, statistics).await);
            let Some(row) = rows.first() else {
                return Outcome::Err(stale(persister, key, expected.map(|v| v.to_string()), None));
            };
            if let (Some(index), Some(expected)) = (persister.version, expected) {
                let name = &persister.properties[index].name;
                let alias = try_result!(
                    query
                        .aliases
                        .entity(query.root)
                        .and_then(|a| a.columns.property_aliases(persister, name))
                        .and_then(|a| a.into_iter().next())
                        .ok_or_else(|| Error::Custom(format!("no alias for version of {key}")))
                );
                let actual = try_result!(row.require(&alias)).clone();
                if !persister.is_same_version(&expected, &actual) {
                    statistics.optimistic_failure(&persister.entity_name);
                    return Outcome::Err(stale(
                        persister,
                        key,
                        Some(expected.to_string()),
                        Some(actual.to_string()),
                    ));
                }
            }
        }

        if let Some(entry) = session.persistence_context_mut().get_entry_mut(key) {
            entry.lock_mode = lock.mode;
        }
        tracing::debug!(key = %key, lock = ?lock.mode, "Upgraded entity lock");
        Outcome::Ok(())
    }
}
