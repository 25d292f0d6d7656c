//! Loading several entities of one type by identifier.

use std::sync::Arc;

use asupersync::{Cx, Outcome};
use graphload_core::{Connection, Error, Identifier};
use graphload_session::{EntityRef, LoadOptions, Session};

use crate::batch::split_batches;
use crate::cache_bridge::{SessionCacheResult, load_from_second_level_cache, load_from_session_cache};
use crate::engine::{Execution, LoadEngine};

impl LoadEngine {
    /// Load every id in `ids`.
    ///
    /// With `ordered_return` the result has one slot per requested id, in
    /// request order, `None` where nothing was found. Otherwise only the
    /// found entities are returned. Ids the session or shared cache can
    /// answer are skipped by the statements when `session_check` is set;
    /// the rest are loaded in batches of `batch_size`.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = %entity, ids = ids.len()))]
    pub async fn multi_load<C: Connection>(
        &self,
        cx: &Cx,
        session: &mut Session<C>,
        entity: &str,
        ids: &[Identifier],
        mut options: LoadOptions,
    ) -> Outcome<Vec<Option<EntityRef>>, Error> {
        try_result!(self.check_session(session));
        let saved = try_result!(self.apply_options(session, &options));
        let outcome = self.multi_load_in_scope(cx, session, entity, ids, &mut options).await;
        saved.restore(session);
        outcome
    }

    async fn multi_load_in_scope<C: Connection>(
        &self,
        cx: &Cx,
        session: &mut Session<C>,
        entity: &str,
        ids: &[Identifier],
        options: &mut LoadOptions,
    ) -> Outcome<Vec<Option<EntityRef>>, Error> {
        let persister = Arc::clone(try_result!(self.factory().metamodel().entity(entity)));
        let read_only = options.read_only.unwrap_or(session.is_default_read_only());
        let mut results: Vec<Option<EntityRef>> = vec![None; ids.len()];
        let mut resolved = vec![false; ids.len()];
        let mut pending = Vec::new();
        let mut unresolved: Vec<Identifier> = Vec::new();

        for (index, id) in ids.iter().enumerate() {
            let key = try_result!(session.entity_key(entity, id.clone()));
            if options.session_check {
                let cached = try_result!(load_from_session_cache(
                    session.persistence_context_mut(),
                    self.factory().metamodel(),
                    &persister,
                    &key,
                    true,
                ));
                match cached {
                    SessionCacheResult::Found(instance) => {
                        try_outcome!(
                            self.upgrade_lock(cx, session, &persister, &key, &options.lock)
                                .await
                        );
                        results[index] = Some(instance);
                        resolved[index] = true;
                        continue;
                    }
                    SessionCacheResult::Removed => {
                        if options.include_removed {
                            results[index] = session.persistence_context().get_entity(&key);
                        }
                        resolved[index] = true;
                        continue;
                    }
                    SessionCacheResult::Miss => {}
                }
                let (_, mut view) = session.split();
                if let Some((instance, more)) = try_result!(load_from_second_level_cache(
                    &mut view,
                    &persister,
                    &key,
                    options.lock.mode,
                    read_only,
                    None,
                )) {
                    results[index] = Some(instance);
                    resolved[index] = true;
                    pending.extend(more);
                    continue;
                }
            }
            if !unresolved.contains(id) {
                unresolved.push(id.clone());
            }
        }

        if !unresolved.is_empty() {
            let settings = self.factory().settings();
            let max = options
                .batch_size
                .unwrap_or_else(|| settings.effective_batch_size(persister.batch_size))
                .max(1);
            let batches = try_result!(split_batches(unresolved, max, settings.batch_fetch_style));
            tracing::debug!(statements = batches.len(), "Loading unresolved ids");
            for batch in batches {
                let query = try_result!(self.entity_query(
                    session.influencers(),
                    entity,
                    &options.lock,
                    batch.size,
                ));
                let executed = try_outcome!(
                    self.execute_plan(
                        cx,
                        session,
                        &query,
                        Execution::keys(&batch.keys, options.lock.mode, read_only),
                        &mut options.after_load,
                    )
                    .await
                );
                pending.extend(executed.finished.pending);
            }
        }

        try_outcome!(
            self.drain(cx, session, pending, read_only, &mut options.after_load)
                .await
        );

        for (index, id) in ids.iter().enumerate() {
            if resolved[index] {
                continue;
            }
            let key = try_result!(session.entity_key(entity, id.clone()));
            results[index] = session
                .persistence_context()
                .get_entity(&key)
                .filter(EntityRef::is_initialized);
        }
        if options.ordered_return {
            Outcome::Ok(results)
        } else {
            Outcome::Ok(results.into_iter().filter(Option::is_some).collect())
        }
    }
}
