//! A scripted [`Connection`] for exercising loads without a database.
//!
//! Responses are keyed by a substring of the generated SQL. A response is a
//! list of [`Record`]s holding `table.column` (or `alias.column`) cells;
//! each record becomes one row projected onto the statement's select list,
//! so tests do not need to know the generated column aliases.
//!
//! ```ignore
//! let conn = ScriptedConnection::new();
//! conn.respond(
//!     "from customers",
//!     vec![record([("customers.id", Value::from(1)), ("customers.name", Value::from("Ada"))])],
//! );
//! let mut session = factory.open_session(conn.clone());
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use graphload_core::{Connection, Cx, Error, Outcome, QueryError, QueryErrorKind, Row, Value};
use regex::Regex;

/// Cells of one scripted result row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    cells: HashMap<String, Value>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a `table.column` or `alias.column` cell.
    pub fn set(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.cells.insert(column.to_lowercase(), value.into());
        self
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.cells.get(&column.to_lowercase())
    }
}

/// Build a record from `(column, value)` pairs.
pub fn record<'a>(cells: impl IntoIterator<Item = (&'a str, Value)>) -> Record {
    cells
        .into_iter()
        .fold(Record::new(), |record, (column, value)| record.set(column, value))
}

/// A statement the connection was asked to run.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedStatement {
    pub sql: String,
    pub params: Vec<Value>,
}

#[derive(Debug, Clone)]
enum Response {
    Records(Vec<Record>),
    Error(String),
}

#[derive(Debug, Clone)]
struct Rule {
    needle: String,
    response: Response,
    repeat: bool,
}

#[derive(Debug, Default)]
struct Script {
    rules: Vec<Rule>,
    log: Vec<ExecutedStatement>,
}

/// Answers statements from scripted rules and records what it ran.
///
/// Rules are tried in the order they were added; the first whose needle
/// occurs in the SQL answers. One-shot rules are consumed when they answer.
/// Statements no rule matches return no rows. Clones share the script.
#[derive(Debug, Clone, Default)]
pub struct ScriptedConnection {
    script: Arc<Mutex<Script>>,
}

impl ScriptedConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer the next statement containing `needle` with `records`.
    pub fn respond(&self, needle: &str, records: Vec<Record>) -> &Self {
        self.push(needle, Response::Records(records), false)
    }

    /// Answer every statement containing `needle` with `records`.
    pub fn respond_always(&self, needle: &str, records: Vec<Record>) -> &Self {
        self.push(needle, Response::Records(records), true)
    }

    /// Fail the next statement containing `needle`.
    pub fn fail(&self, needle: &str, message: &str) -> &Self {
        self.push(needle, Response::Error(message.to_string()), false)
    }

    fn push(&self, needle: &str, response: Response, repeat: bool) -> &Self {
        self.lock().rules.push(Rule {
            needle: needle.to_string(),
            response,
            repeat,
        });
        self
    }

    /// Every statement run so far, oldest first.
    pub fn executed(&self) -> Vec<ExecutedStatement> {
        self.lock().log.clone()
    }

    pub fn statement_count(&self) -> usize {
        self.lock().log.len()
    }

    /// Statements whose SQL contains `needle`.
    pub fn statements_matching(&self, needle: &str) -> Vec<ExecutedStatement> {
        self.lock()
            .log
            .iter()
            .filter(|s| s.sql.contains(needle))
            .cloned()
            .collect()
    }

    pub fn clear_log(&self) {
        self.lock().log.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn answer(&self, sql: &str, params: &[Value]) -> Outcome<Vec<Row>, Error> {
        let mut script = self.lock();
        script.log.push(ExecutedStatement {
            sql: sql.to_string(),
            params: params.to_vec(),
        });
        let Some(index) = script.rules.iter().position(|r| sql.contains(&r.needle)) else {
            tracing::trace!(sql, "No scripted response; returning no rows");
            return Outcome::Ok(Vec::new());
        };
        let response = if script.rules[index].repeat {
            script.rules[index].response.clone()
        } else {
            script.rules.remove(index).response
        };
        match response {
            Response::Records(records) => {
                let rows = project(sql, &records);
                tracing::trace!(sql, params = params.len(), rows = rows.len(), "Scripted statement");
                Outcome::Ok(rows)
            }
            Response::Error(message) => Outcome::Err(Error::Query(QueryError {
                kind: QueryErrorKind::Database,
                sql: Some(sql.to_string()),
                message,
                source: None,
            })),
        }
    }
}

impl Connection for ScriptedConnection {
    fn query(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let result = self.answer(sql, params);
        async move { result }
    }
}

fn table_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?i)\b(?:from|join)\s+([\w.]+)\s+(\w+)").ok())
        .as_ref()
}

fn select_item_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(\w+)\.(\w+) as (\w+)").ok())
        .as_ref()
}

/// Project records onto the select list of `sql`.
fn project(sql: &str, records: &[Record]) -> Vec<Row> {
    let tables: HashMap<String, String> = table_pattern()
        .map(|pattern| {
            pattern
                .captures_iter(sql)
                .map(|c| (c[2].to_lowercase(), c[1].to_lowercase()))
                .collect()
        })
        .unwrap_or_default();
    let items: Vec<(String, String, String)> = select_item_pattern()
        .map(|pattern| {
            pattern
                .captures_iter(sql)
                .map(|c| (c[1].to_lowercase(), c[2].to_lowercase(), c[3].to_string()))
                .collect()
        })
        .unwrap_or_default();

    records
        .iter()
        .map(|record| {
            let mut names = Vec::with_capacity(items.len());
            let mut values = Vec::with_capacity(items.len());
            for (qualifier, column, alias) in &items {
                let value = record
                    .get(&format!("{qualifier}.{column}"))
                    .or_else(|| {
                        tables
                            .get(qualifier)
                            .and_then(|table| record.get(&format!("{table}.{column}")))
                    })
                    .cloned()
                    .unwrap_or(Value::Null);
                names.push(alias.clone());
                values.push(value);
            }
            Row::new(names, values)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn projects_records_onto_aliases() {
        let sql = "select customer0_.id as id_0_, order1_.total as total_1_ \
                   from customers customer0_ left outer join orders order1_ \
                   on customer0_.id=order1_.customer_id where customer0_.id = ?";
        let rows = project(
            sql,
            &[record([
                ("customers.id", Value::from(1)),
                ("orders.total", Value::from(7)),
            ])],
        );
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].require("id_0_").unwrap(), &Value::from(1));
        assert_eq!(rows[0].require("total_1_").unwrap(), &Value::from(7));
    }

    #[test]
    fn missing_cells_are_null() {
        let rows = project(
            "select c0_.name as name_0_ from customers c0_",
            &[Record::new()],
        );
        assert!(rows[0].require("name_0_").unwrap().is_null());
    }

    #[test]
    fn one_shot_rules_are_consumed_in_order() {
        let conn = ScriptedConnection::new();
        conn.respond("from t", vec![Record::new()])
            .respond("from t", vec![Record::new(), Record::new()]);
        let Outcome::Ok(first) = conn.answer("select x.a as a_0_ from t x", &[]) else {
            panic!("first answer failed");
        };
        let Outcome::Ok(second) = conn.answer("select x.a as a_0_ from t x", &[]) else {
            panic!("second answer failed");
        };
        let Outcome::Ok(third) = conn.answer("select x.a as a_0_ from t x", &[]) else {
            panic!("third answer failed");
        };
        assert_eq!((first.len(), second.len(), third.len()), (1, 2, 0));
        assert_eq!(conn.statement_count(), 3);
    }

    #[test]
    fn failures_surface_as_query_errors() {
        let conn = ScriptedConnection::new();
        conn.fail("from t", "boom");
        match conn.answer("select 1 from t x", &[Value::from(1)]) {
            Outcome::Err(Error::Query(e)) => assert_eq!(e.message, "boom"),
            other => panic!("expected query error, got {other:?}"),
        }
        assert_eq!(conn.executed()[0].params, vec![Value::from(1)]);
    }
}
