//! Positional parameter binding and statement execution.

use asupersync::{Cx, Outcome};
use graphload_core::{
    Connection, Error, Identifier, LoadQueryInfluencers, QueryError, QueryErrorKind, Result, Row,
    Value,
};
use graphload_query::{CompiledLoadQuery, ParameterSlot};
use graphload_session::Statistics;

fn missing(what: String) -> Error {
    Error::Query(QueryError {
        kind: QueryErrorKind::Parameter,
        sql: None,
        message: format!("no value bound for {what}"),
        source: None,
    })
}

/// Resolve every slot of a compiled statement to a value, in slot order.
///
/// `keys` supplies key slots by batch position, `natural_id` the natural-id
/// slots and `inherited` the parameters of an originating query.
pub fn bind_parameters(
    slots: &[ParameterSlot],
    keys: &[Identifier],
    influencers: &LoadQueryInfluencers,
    natural_id: &[Value],
    inherited: &[Value],
) -> Result<Vec<Value>> {
    slots
        .iter()
        .map(|slot| match slot {
            ParameterSlot::Key {
                batch_index,
                column_index,
            } => keys
                .get(*batch_index)
                .and_then(|key| key.values().get(*column_index))
                .cloned()
                .ok_or_else(|| missing(format!("key {batch_index} column {column_index}"))),
            ParameterSlot::Filter { filter, parameter } => influencers
                .enabled_filter(filter)
                .and_then(|f| f.parameter(parameter))
                .cloned()
                .ok_or_else(|| missing(format!("filter parameter {filter}.{parameter}"))),
            ParameterSlot::NaturalId { index } => natural_id
                .get(*index)
                .cloned()
                .ok_or_else(|| missing(format!("natural id value {index}"))),
            ParameterSlot::Inherited(index) => inherited
                .get(*index)
                .cloned()
                .ok_or_else(|| missing(format!("inherited parameter {index}"))),
        })
        .collect()
}

/// Run a compiled statement.
pub async fn execute<C: Connection>(
    cx: &Cx,
    conn: &C,
    query: &CompiledLoadQuery,
    params: &[Value],
    statistics: &Statistics,
) -> Outcome<Vec<Row>, Error> {
    tracing::trace!(sql = %query.sql, params = params.len(), "Executing load statement");
    statistics.statement_executed();
    let rows = try_outcome!(conn.query(cx, &query.sql, params).await);
    tracing::trace!(rows = rows.len(), "Load statement returned");
    Outcome::Ok(rows)
}
