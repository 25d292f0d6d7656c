//! SQL dialects: placeholders, join keywords, lock clauses and comments.

use graphload_core::{LockMode, LockOptions, LockTimeout};
use serde::{Deserialize, Serialize};

use crate::association::JoinType;

/// SQL dialect for generating dialect-specific SQL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// Plain SQL (uses ? placeholders)
    #[default]
    Ansi,
    /// PostgreSQL dialect (uses $1, $2 placeholders)
    Postgres,
    /// SQLite dialect (uses ?1, ?2 placeholders)
    Sqlite,
    /// MySQL dialect (uses ? placeholders)
    Mysql,
}

impl Dialect {
    /// Generate a placeholder for the given parameter index (1-based).
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${index}"),
            Dialect::Sqlite => format!("?{index}"),
            Dialect::Ansi | Dialect::Mysql => "?".to_string(),
        }
    }

    /// Rewrite the compiler's `?` markers into this dialect's placeholders.
    ///
    /// Markers inside single-quoted literals are left alone.
    pub fn render_placeholders(self, sql: &str) -> String {
        if matches!(self, Dialect::Ansi | Dialect::Mysql) {
            return sql.to_string();
        }
        let mut out = String::with_capacity(sql.len() + 8);
        let mut in_literal = false;
        let mut index = 0;
        for ch in sql.chars() {
            match ch {
                '\'' => {
                    in_literal = !in_literal;
                    out.push(ch);
                }
                '?' if !in_literal => {
                    index += 1;
                    out.push_str(&self.placeholder(index));
                }
                _ => out.push(ch),
            }
        }
        out
    }

    /// Quote an identifier for this dialect.
    pub fn quote_identifier(self, name: &str) -> String {
        match self {
            Dialect::Ansi | Dialect::Postgres | Dialect::Sqlite => {
                format!("\"{}\"", name.replace('"', "\"\""))
            }
            Dialect::Mysql => format!("`{}`", name.replace('`', "``")),
        }
    }

    pub const fn join_keyword(self, join: JoinType) -> &'static str {
        match join {
            JoinType::Inner => "inner join",
            JoinType::LeftOuter | JoinType::None => "left outer join",
        }
    }

    pub const fn supports_row_locks(self) -> bool {
        !matches!(self, Dialect::Sqlite)
    }

    /// Locking clause appended to a select, with a leading space.
    ///
    /// `root_alias` scopes the lock to the root table where the dialect
    /// rejects locking the nullable side of outer joins.
    pub fn lock_clause(self, lock: &LockOptions, root_alias: &str) -> String {
        if !self.supports_row_locks() || !lock.mode.is_pessimistic() {
            return String::new();
        }
        let mut clause = match (self, lock.mode) {
            (Dialect::Postgres, LockMode::PessimisticRead) => " for share".to_string(),
            (Dialect::Mysql, LockMode::PessimisticRead) => {
                return " lock in share mode".to_string();
            }
            _ => " for update".to_string(),
        };
        if self == Dialect::Postgres && !lock.scope {
            clause.push_str(" of ");
            clause.push_str(root_alias);
        }
        match lock.effective_timeout() {
            LockTimeout::NoWait => clause.push_str(" nowait"),
            LockTimeout::SkipLocked => clause.push_str(" skip locked"),
            LockTimeout::WaitForever | LockTimeout::Millis(_) => {}
        }
        clause
    }

    /// Prefix a statement with a SQL comment.
    pub fn apply_comment(self, sql: &str, comment: &str) -> String {
        format!("/* {} */ {}", comment.replace("*/", "* /"), sql)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_per_dialect() {
        let sql = "select a from t where a = ? and b in (?, ?)";
        assert_eq!(Dialect::Ansi.render_placeholders(sql), sql);
        assert_eq!(
            Dialect::Postgres.render_placeholders(sql),
            "select a from t where a = $1 and b in ($2, $3)"
        );
        assert_eq!(
            Dialect::Sqlite.render_placeholders(sql),
            "select a from t where a = ?1 and b in (?2, ?3)"
        );
    }

    #[test]
    fn literals_keep_question_marks() {
        assert_eq!(
            Dialect::Postgres.render_placeholders("select 'why?' from t where a = ?"),
            "select 'why?' from t where a = $1"
        );
    }

    #[test]
    fn lock_clauses() {
        let upgrade = LockOptions::new(LockMode::PessimisticWrite);
        assert_eq!(Dialect::Ansi.lock_clause(&upgrade, "c0_"), " for update");
        assert_eq!(
            Dialect::Postgres.lock_clause(&upgrade, "c0_"),
            " for update of c0_"
        );
        assert_eq!(Dialect::Sqlite.lock_clause(&upgrade, "c0_"), "");
        assert_eq!(
            Dialect::Mysql.lock_clause(&LockOptions::new(LockMode::UpgradeNowait), "c0_"),
            " for update nowait"
        );
        assert_eq!(
            Dialect::Mysql.lock_clause(&LockOptions::new(LockMode::PessimisticRead), "c0_"),
            " lock in share mode"
        );
        assert_eq!(
            Dialect::Ansi.lock_clause(&LockOptions::new(LockMode::Read), "c0_"),
            ""
        );
    }

    #[test]
    fn quoting_escapes() {
        assert_eq!(Dialect::Postgres.quote_identifier("a\"b"), "\"a\"\"b\"");
        assert_eq!(Dialect::Mysql.quote_identifier("a`b"), "`a``b`");
    }
}
