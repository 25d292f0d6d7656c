//! Current database state of one entity row, read without materializing.

use asupersync::{Cx, Outcome};
use graphload_core::{Connection, Error, Identifier, LockOptions, PropertyKind, Value};
use graphload_session::Session;

use crate::binder::{bind_parameters, execute};
use crate::engine::LoadEngine;

impl LoadEngine {
    /// Column values of every property of `entity`, in property order.
    ///
    /// Multi-column associations come back as [`Value::Array`] and
    /// collections as null. Returns `None` when no row exists. The
    /// persistence context is neither consulted nor modified.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = %entity))]
    pub async fn load_snapshot<C: Connection>(
        &self,
        cx: &Cx,
        session: &mut Session<C>,
        entity: &str,
        id: impl Into<Identifier>,
    ) -> Outcome<Option<Vec<Value>>, Error> {
        try_result!(self.check_session(session));
        let persister = try_result!(self.factory().metamodel().entity(entity));
        let query = try_result!(self.flat_query(entity, &LockOptions::NONE));
        let id = id.into();
        let params = try_result!(bind_parameters(
            &query.slots,
            std::slice::from_ref(&id),
            session.influencers(),
            &[],
            &[],
        ));
        let rows = try_outcome!(
            execute(cx, session.connection(), &query, &params, self.factory().statistics()).await
        );
        let Some(row) = rows.first() else {
            tracing::debug!(id = %id, "No row for snapshot");
            return Outcome::Ok(None);
        };
        let Some(aliases) = query.aliases.entity(query.root) else {
            return Outcome::Err(Error::Custom(format!("snapshot of {entity} has no root aliases")));
        };

        let mut snapshot = Vec::with_capacity(persister.properties.len());
        for property in &persister.properties {
            if matches!(property.kind, PropertyKind::Collection { .. }) {
                snapshot.push(Value::Null);
                continue;
            }
            let Some(columns) = aliases.columns.property_aliases(persister, &property.name) else {
                return Outcome::Err(Error::Custom(format!(
                    "no aliases for {entity}.{}",
                    property.name
                )));
            };
            let mut values = Vec::with_capacity(columns.len());
            for alias in &columns {
                values.push(try_result!(row.require(alias)).clone());
            }
            snapshot.push(match values.len() {
                1 => values.remove(0),
                _ => Value::Array(values),
            });
        }
        tracing::trace!(id = %id, properties = snapshot.len(), "Read database snapshot");
        Outcome::Ok(Some(snapshot))
    }
}
