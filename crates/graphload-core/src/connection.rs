//! Statement execution boundary.
//!
//! The engine compiles one read statement per call and hands it to a
//! [`Connection`] together with positionally bound parameters. Execution
//! integrates with asupersync's structured concurrency via `Cx` for
//! cancellation; a cancelled context surfaces as `Outcome::Cancelled`.

use asupersync::{Cx, Outcome};

use crate::row::Row;
use crate::value::Value;

/// A connection able to run read statements.
pub trait Connection: Send + Sync {
    /// Execute a query and return all rows.
    fn query(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, crate::Error>> + Send;

    /// Execute a query and return the first row, if any.
    fn query_one(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Option<Row>, crate::Error>> + Send {
        let rows = self.query(cx, sql, params);
        async move {
            match rows.await {
                Outcome::Ok(rows) => Outcome::Ok(rows.into_iter().next()),
                Outcome::Err(e) => Outcome::Err(e),
                Outcome::Cancelled(r) => Outcome::Cancelled(r),
                Outcome::Panicked(p) => Outcome::Panicked(p),
            }
        }
    }
}
