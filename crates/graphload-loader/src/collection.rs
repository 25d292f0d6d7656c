//! Initializing collections: batched by owner key, or all at once through
//! the owner-id select of the statement that loaded their owners.

use std::collections::HashSet;
use std::sync::Arc;

use asupersync::{Cx, Outcome};
use graphload_core::{CollectionKind, CollectionPersister, Connection, Error, FetchStyle, Identifier, LockMode};
use graphload_query::RootRestriction;
use graphload_session::{
    AfterLoadAction, CollectionKey, CollectionRef, EntityKey, PropertyValue, Session,
    SubselectFetch,
};

use crate::batch::first_batch;
use crate::engine::{Execution, LoadEngine};
use crate::processing::PendingLoad;

impl LoadEngine {
    /// Initialize the collection of `role` owned by `owner_id`.
    ///
    /// Uninitialized collections of the same role queued in the session are
    /// loaded along with it, up to the role's batch size.
    #[tracing::instrument(level = "debug", skip_all, fields(role = %role))]
    pub async fn initialize_collection<C: Connection>(
        &self,
        cx: &Cx,
        session: &mut Session<C>,
        role: &str,
        owner_id: impl Into<Identifier>,
    ) -> Outcome<CollectionRef, Error> {
        try_result!(self.check_session(session));
        let persister = Arc::clone(try_result!(self.factory().metamodel().collection(role)));
        let key = session.collection_key(role, owner_id);
        let collection = session
            .persistence_context_mut()
            .collection_for(&key, persister.kind);
        if collection.is_initialized() {
            return Outcome::Ok(collection);
        }
        let read_only = session.is_default_read_only();
        let pending = try_outcome!(self.load_collection_batch(cx, session, &key, &mut []).await);
        try_outcome!(self.drain(cx, session, pending, read_only, &mut []).await);
        Outcome::Ok(collection)
    }

    /// Load `key` and whatever batch or subselect it belongs to.
    pub(crate) async fn load_collection_batch<C: Connection>(
        &self,
        cx: &Cx,
        session: &mut Session<C>,
        key: &CollectionKey,
        after_load: &mut [AfterLoadAction],
    ) -> Outcome<Vec<PendingLoad>, Error> {
        let persister = Arc::clone(try_result!(self.factory().metamodel().collection(&key.role)));
        if persister.fetch.style == FetchStyle::Subselect {
            let owner = try_result!(session.entity_key(&persister.owner_entity, key.key.clone()));
            let fetch = session
                .persistence_context()
                .batch_queue()
                .subselect(&owner);
            if let Some(fetch) = fetch {
                return self
                    .load_subselect(cx, session, &persister, &fetch, after_load)
                    .await;
            }
        }

        let settings = self.factory().settings();
        let max = settings.effective_batch_size(persister.batch_size);
        let ids = if max > 1 {
            session
                .persistence_context()
                .batch_queue()
                .collection_batch(key, max)
        } else {
            vec![key.key.clone()]
        };
        let batch = try_result!(first_batch(ids, max, settings.batch_fetch_style));
        let query = try_result!(self.collection_query(
            session.influencers(),
            &key.role,
            batch.size,
            RootRestriction::Key,
        ));
        tracing::debug!(key = %key, batch_size = batch.size, "Loading collection from database");
        let read_only = session.is_default_read_only();
        let executed = try_outcome!(
            self.execute_plan(
                cx,
                session,
                &query,
                Execution::keys(&batch.keys, LockMode::None, read_only),
                after_load,
            )
            .await
        );
        self.factory().statistics().collection_fetched(&key.role);

        let mut seen = HashSet::new();
        let keys: Vec<CollectionKey> = batch
            .keys
            .into_iter()
            .filter(|id| seen.insert(id.clone()))
            .map(|id| session.collection_key(&key.role, id))
            .collect();
        finish_requested(session, &persister, &keys);
        Outcome::Ok(executed.finished.pending)
    }

    /// Initialize every collection of the role whose owner the originating
    /// statement loaded.
    async fn load_subselect<C: Connection>(
        &self,
        cx: &Cx,
        session: &mut Session<C>,
        persister: &CollectionPersister,
        fetch: &SubselectFetch,
        after_load: &mut [AfterLoadAction],
    ) -> Outcome<Vec<PendingLoad>, Error> {
        let restriction = RootRestriction::Subselect {
            id_select: fetch.owner_id_select.clone(),
            parameter_count: fetch.parameters.len(),
        };
        let query = try_result!(self.collection_query(
            session.influencers(),
            &persister.role,
            1,
            restriction,
        ));
        tracing::debug!(
            role = %persister.role,
            owners = fetch.owner_keys.len(),
            "Loading collections by subselect"
        );
        let read_only = session.is_default_read_only();
        let mut execution = Execution::keys(&[], LockMode::None, read_only);
        execution.inherited = &fetch.parameters;
        let executed =
            try_outcome!(self.execute_plan(cx, session, &query, execution, after_load).await);
        self.factory().statistics().collection_fetched(&persister.role);

        let keys: Vec<CollectionKey> = fetch
            .owner_keys
            .iter()
            .map(|owner| session.collection_key(&persister.role, owner.id.clone()))
            .collect();
        finish_requested(session, persister, &keys);
        Outcome::Ok(executed.finished.pending)
    }
}

/// Requested collections the statement returned no rows for are empty.
/// Array owners get the loaded elements copied in.
fn finish_requested<C: Connection>(
    session: &mut Session<C>,
    persister: &CollectionPersister,
    keys: &[CollectionKey],
) {
    let owners: Vec<Option<EntityKey>> = keys
        .iter()
        .map(|key| session.entity_key(&persister.owner_entity, key.key.clone()).ok())
        .collect();
    let context = session.persistence_context_mut();
    for (key, owner) in keys.iter().zip(owners) {
        let collection = context.collection_for(key, persister.kind);
        if !collection.is_initialized() {
            tracing::trace!(key = %key, "No rows for collection");
            collection.initialize_empty();
        }
        context.batch_queue_mut().remove_batch_loadable_collection(key);

        if persister.kind != CollectionKind::Array {
            continue;
        }
        let Some(owner) = owner.and_then(|owner| context.get_entity(&owner)) else {
            continue;
        };
        let mut instance = owner.write();
        if let Some(index) = instance.persister.property_index(persister.property_name()) {
            instance.state[index] = PropertyValue::Array(collection.elements());
        }
    }
}
