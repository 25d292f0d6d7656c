//! Error types for graph loading operations.

use std::fmt;

use crate::value::Identifier;

/// The primary error type for all loading operations.
#[derive(Debug)]
pub enum Error {
    /// Statement execution errors reported by the connection
    Query(QueryError),
    /// Type conversion errors while reading rows
    Type(TypeError),
    /// Malformed fetch tree or mapping misuse
    Plan(PlanError),
    /// A managed instance is older than the row just read
    StaleState(StaleStateError),
    /// A row or cached instance does not match the requested entity type
    WrongClass(WrongClassError),
    /// `load` found no row for the requested identifier
    ObjectNotFound(NotFoundError),
    /// A mapping or option combination the engine does not implement
    Unsupported(UnsupportedError),
    /// Lock acquisition or upgrade failure
    Lock(LockError),
    /// Configuration errors
    Config(ConfigError),
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Serialization/deserialization errors
    Serde(String),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// A bound parameter could not be produced
    Parameter,
    /// Table or column not found
    NotFound,
    /// Statement timeout
    Timeout,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct PlanError {
    pub kind: PlanErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanErrorKind {
    /// A node is attached to an owner of the wrong shape
    MalformedTree,
    /// Entity name not present in the metamodel
    UnknownEntity,
    /// Collection role not present in the metamodel
    UnknownRole,
    /// Property not present on the entity
    UnknownProperty,
    /// Caller supplied arguments that do not fit the mapping
    InvalidArgument,
}

#[derive(Debug)]
pub struct StaleStateError {
    pub entity: String,
    pub id: Identifier,
    pub expected_version: Option<String>,
    pub actual_version: Option<String>,
}

#[derive(Debug)]
pub struct WrongClassError {
    pub kind: WrongClassErrorKind,
    pub entity: String,
    pub id: Identifier,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrongClassErrorKind {
    /// Discriminator value maps to no subclass
    UnmappedDiscriminator,
    /// Resolved subclass is not a subtype of the requested entity
    NotASubtype,
    /// A managed object of another type is registered under the key
    InconsistentReturnClass,
}

#[derive(Debug)]
pub struct NotFoundError {
    pub entity: String,
    pub id: Identifier,
}

#[derive(Debug)]
pub struct UnsupportedError {
    pub feature: &'static str,
    pub message: String,
}

#[derive(Debug)]
pub struct LockError {
    pub entity: String,
    pub id: Identifier,
    pub message: String,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Build a plan error.
    pub fn plan(kind: PlanErrorKind, message: impl Into<String>) -> Self {
        Error::Plan(PlanError {
            kind,
            message: message.into(),
        })
    }

    /// Build an unsupported-feature error.
    pub fn unsupported(feature: &'static str, message: impl Into<String>) -> Self {
        Error::Unsupported(UnsupportedError {
            feature,
            message: message.into(),
        })
    }

    pub fn is_stale_state(&self) -> bool {
        matches!(self, Error::StaleState(_))
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, Error::Unsupported(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::ObjectNotFound(_))
    }

    pub fn is_wrong_class(&self) -> bool {
        matches!(self, Error::WrongClass(_))
    }

    pub fn is_plan_error(&self) -> bool {
        matches!(self, Error::Plan(_))
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Query(e) => write!(f, "Query error: {}", e.message),
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Plan(e) => write!(f, "Load plan error: {}", e.message),
            Error::StaleState(e) => write!(f, "Stale state: {}", e),
            Error::WrongClass(e) => write!(f, "Wrong class: {}", e),
            Error::ObjectNotFound(e) => {
                write!(f, "No row with the given identifier exists: {}", e)
            }
            Error::Unsupported(e) => write!(f, "Unsupported ({}): {}", e.feature, e.message),
            Error::Lock(e) => write!(f, "Lock error: {}", e),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for PlanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for StaleStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "row was updated or deleted by another transaction [{}#{}]",
            self.entity, self.id
        )?;
        if let (Some(expected), Some(actual)) = (&self.expected_version, &self.actual_version) {
            write!(f, " (version {} in session, {} in database)", expected, actual)?;
        }
        Ok(())
    }
}

impl fmt::Display for WrongClassError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}#{}]", self.message, self.entity, self.id)
    }
}

impl fmt::Display for NotFoundError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}#{}]", self.entity, self.id)
    }
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}#{}]", self.message, self.entity, self.id)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<PlanError> for Error {
    fn from(err: PlanError) -> Self {
        Error::Plan(err)
    }
}

impl From<StaleStateError> for Error {
    fn from(err: StaleStateError) -> Self {
        Error::StaleState(err)
    }
}

impl From<WrongClassError> for Error {
    fn from(err: WrongClassError) -> Self {
        Error::WrongClass(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for loading operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn predicates_match_variants() {
        let stale = Error::StaleState(StaleStateError {
            entity: "Customer".to_string(),
            id: Identifier::from(Value::BigInt(1)),
            expected_version: Some("1".to_string()),
            actual_version: Some("2".to_string()),
        });
        assert!(stale.is_stale_state());
        assert!(!stale.is_not_found());

        let unsupported = Error::unsupported("batch-fetch-style", "dynamic batching");
        assert!(unsupported.is_unsupported());
        assert_eq!(
            unsupported.to_string(),
            "Unsupported (batch-fetch-style): dynamic batching"
        );
    }

    #[test]
    fn stale_state_display_includes_versions() {
        let err = Error::StaleState(StaleStateError {
            entity: "Order".to_string(),
            id: Identifier::from(Value::BigInt(7)),
            expected_version: Some("3".to_string()),
            actual_version: Some("4".to_string()),
        });
        let text = err.to_string();
        assert!(text.contains("Order#7"));
        assert!(text.contains("version 3 in session, 4 in database"));
    }

    #[test]
    fn query_error_exposes_sql() {
        let err = Error::Query(QueryError {
            kind: QueryErrorKind::Syntax,
            sql: Some("select 1".to_string()),
            message: "boom".to_string(),
            source: None,
        });
        assert_eq!(err.sql(), Some("select 1"));
        assert!(std::error::Error::source(&err).is_none());
    }
}
