//! Loading an entity by its natural id.

use std::sync::Arc;

use asupersync::{Cx, Outcome};
use graphload_core::{
    Connection, EntityPersister, Error, LoadQueryInfluencers, LockOptions, PlanErrorKind, Result,
    Value,
};
use graphload_query::{CompileOptions, CompiledLoadQuery, RootRestriction, cache_key};
use graphload_session::{EntityRef, LoadOptions, Session};

use crate::engine::{Execution, LoadEngine};
use crate::single_id::EntityRequest;

impl LoadEngine {
    /// Load the entity whose natural-id properties equal `values`, given in
    /// mapping order.
    ///
    /// A natural id resolved earlier in the session loads by identifier
    /// instead of querying the natural-id columns again.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = %entity))]
    pub async fn load_by_natural_id<C: Connection>(
        &self,
        cx: &Cx,
        session: &mut Session<C>,
        entity: &str,
        values: Vec<Value>,
        mut options: LoadOptions,
    ) -> Outcome<Option<EntityRef>, Error> {
        try_result!(self.check_session(session));
        let persister = Arc::clone(try_result!(self.factory().metamodel().entity(entity)));
        if !persister.has_natural_id() {
            return Outcome::Err(Error::plan(
                PlanErrorKind::InvalidArgument,
                format!("{entity} has no natural id"),
            ));
        }
        if values.len() != persister.natural_id.len() {
            return Outcome::Err(Error::plan(
                PlanErrorKind::InvalidArgument,
                format!(
                    "{entity} natural id has {} values, got {}",
                    persister.natural_id.len(),
                    values.len()
                ),
            ));
        }
        let saved = try_result!(self.apply_options(session, &options));
        let outcome = self
            .natural_id_in_scope(cx, session, &persister, &values, &mut options)
            .await;
        saved.restore(session);
        outcome
    }

    async fn natural_id_in_scope<C: Connection>(
        &self,
        cx: &Cx,
        session: &mut Session<C>,
        persister: &Arc<EntityPersister>,
        values: &[Value],
        options: &mut LoadOptions,
    ) -> Outcome<Option<EntityRef>, Error> {
        let read_only = options.read_only.unwrap_or(session.is_default_read_only());
        let resolved = session
            .persistence_context()
            .resolve_natural_id(&persister.root_entity_name, values);
        if let Some(id) = resolved {
            tracing::debug!(id = %id, "Natural id resolved in session");
            let key = try_result!(session.entity_key(&persister.entity_name, id));
            let request = EntityRequest {
                persister,
                key: &key,
                lock: &options.lock,
                read_only,
                optional: None,
            };
            let (found, pending) =
                try_outcome!(self.load_one(cx, session, request, &mut options.after_load).await);
            try_outcome!(
                self.drain(cx, session, pending, read_only, &mut options.after_load)
                    .await
            );
            if found.is_some() {
                return Outcome::Ok(found);
            }
        }

        self.factory().statistics().natural_id_query();
        let query = try_result!(self.natural_id_query(
            session.influencers(),
            &persister.entity_name,
            &options.lock,
        ));
        let mut execution = Execution::keys(&[], options.lock.mode, read_only);
        execution.natural_id = values;
        let executed = try_outcome!(
            self.execute_plan(cx, session, &query, execution, &mut options.after_load)
                .await
        );
        try_outcome!(
            self.drain(
                cx,
                session,
                executed.finished.pending,
                read_only,
                &mut options.after_load,
            )
            .await
        );
        Outcome::Ok(executed.roots.into_iter().next())
    }

    /// The natural-id statement, shared unless session state shaped it.
    fn natural_id_query(
        &self,
        influencers: &LoadQueryInfluencers,
        entity: &str,
        lock: &LockOptions,
    ) -> Result<Arc<CompiledLoadQuery>> {
        let compile = || {
            self.compile_entity(
                influencers,
                entity,
                &CompileOptions::default()
                    .lock(lock.clone())
                    .restriction(RootRestriction::NaturalId),
            )
        };
        let metamodel = self.factory().metamodel();
        let shaped = influencers.filters_affect_entity(metamodel, entity)
            || influencers.fetch_profiles_affect_entity(metamodel, entity)
            || influencers.entity_graph().is_some()
            || !lock.is_wait_forever()
            || !lock.alias_modes.is_empty();
        if shaped {
            return compile().map(Arc::new);
        }
        let key = cache_key(&(
            "natural-id",
            entity,
            lock.mode,
            influencers.internal_fetch_profile(),
        ));
        self.cached_statement(key, compile)
    }
}
