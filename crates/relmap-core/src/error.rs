//! Error types for relmap operations.

use crate::lock::OptimisticLockFailure;
use std::fmt;

/// The primary error type for all relmap operations.
#[derive(Debug)]
pub enum Error {
    /// In-memory expression evaluation failed
    Expression(ExpressionError),
    /// An update or delete matched no row under its lock qualifier
    OptimisticLock(Box<OptimisticLockFailure>),
    /// A read-only flattened relationship was mutated
    ReadOnly(ReadOnlyError),
    /// Statement execution errors
    Query(QueryError),
    /// Transaction errors
    Transaction(TransactionError),
    /// Unknown entity, attribute or relationship
    Mapping(MappingError),
    /// Illegal object lifecycle operation
    State(StateError),
    /// Custom error with message
    Custom(String),
}

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug)]
pub struct ExpressionError {
    /// Rendered text of the expression being evaluated.
    pub expression: String,
    pub message: String,
    pub source: Option<BoxError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadOnlyError {
    pub entity: String,
    pub relationship: String,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub message: String,
    pub source: Option<BoxError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Statement produced an unexpected row count
    RowCount,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    /// Name of the connection that raised the failure, if any.
    pub connection: Option<String>,
    /// Decoded transaction status at the time of the failure.
    pub status: Option<String>,
    pub message: String,
    pub source: Option<BoxError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// A connection failed to commit
    CommitFailed,
    /// A connection failed to roll back
    RollbackFailed,
    /// Operation not allowed in the current transaction status
    IllegalState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingError {
    pub kind: MappingErrorKind,
    pub entity: String,
    /// Attribute, relationship or column name, when relevant.
    pub name: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingErrorKind {
    UnknownEntity,
    UnknownAttribute,
    UnknownRelationship,
    MissingPrimaryKey,
    /// An entity inherits from itself through its super entities.
    InheritanceCycle,
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateError {
    /// Display form of the object id involved.
    pub object: Option<String>,
    pub message: String,
}

impl Error {
    /// Build an expression-evaluation error wrapping `cause`.
    pub fn expression(
        expression: impl Into<String>,
        message: impl Into<String>,
        cause: Option<BoxError>,
    ) -> Self {
        Error::Expression(ExpressionError {
            expression: expression.into(),
            message: message.into(),
            source: cause,
        })
    }

    /// Build a generic database error for `sql`.
    pub fn query(sql: Option<&str>, message: impl Into<String>) -> Self {
        Error::Query(QueryError {
            kind: QueryErrorKind::Database,
            sql: sql.map(str::to_string),
            message: message.into(),
            source: None,
        })
    }

    pub fn unknown_entity(entity: impl Into<String>) -> Self {
        let entity = entity.into();
        Error::Mapping(MappingError {
            kind: MappingErrorKind::UnknownEntity,
            message: format!("no entity named '{entity}'"),
            entity,
            name: None,
        })
    }

    pub fn unknown_relationship(entity: impl Into<String>, relationship: impl Into<String>) -> Self {
        let entity = entity.into();
        let relationship = relationship.into();
        Error::Mapping(MappingError {
            kind: MappingErrorKind::UnknownRelationship,
            message: format!("entity '{entity}' has no relationship '{relationship}'"),
            entity,
            name: Some(relationship),
        })
    }

    pub fn unknown_attribute(entity: impl Into<String>, attribute: impl Into<String>) -> Self {
        let entity = entity.into();
        let attribute = attribute.into();
        Error::Mapping(MappingError {
            kind: MappingErrorKind::UnknownAttribute,
            message: format!("entity '{entity}' has no attribute '{attribute}'"),
            entity,
            name: Some(attribute),
        })
    }

    pub fn state(object: Option<String>, message: impl Into<String>) -> Self {
        Error::State(StateError {
            object,
            message: message.into(),
        })
    }

    /// Is this an optimistic locking conflict?
    pub fn is_optimistic_lock(&self) -> bool {
        matches!(self, Error::OptimisticLock(_))
    }

    /// Get the optimistic lock failure, if this is one.
    pub fn as_optimistic_lock(&self) -> Option<&OptimisticLockFailure> {
        match self {
            Error::OptimisticLock(failure) => Some(failure),
            _ => None,
        }
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            Error::OptimisticLock(f) => Some(f.sql()),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Expression(e) => write!(f, "Expression error: {}", e),
            Error::OptimisticLock(e) => write!(f, "Optimistic lock failure: {}", e),
            Error::ReadOnly(e) => write!(f, "Read-only relationship: {}", e),
            Error::Query(e) => write!(f, "Query error: {}", e),
            Error::Transaction(e) => write!(f, "Transaction error: {}", e),
            Error::Mapping(e) => write!(f, "Mapping error: {}", e.message),
            Error::State(e) => write!(f, "State error: {}", e),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Expression(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Transaction(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for ExpressionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.message, self.expression)?;
        if let Some(cause) = &self.source {
            write!(f, ": {}", cause)?;
        }
        Ok(())
    }
}

impl fmt::Display for ReadOnlyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cannot modify read-only flattened relationship '{}.{}'",
            self.entity, self.relationship
        )
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sql) = &self.sql {
            write!(f, "{} (SQL: {})", self.message, sql)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.connection {
            Some(name) => write!(f, "{} (connection '{}')", self.message, name),
            None => write!(f, "{}", self.message),
        }
    }
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.object {
            Some(id) => write!(f, "{}: {}", id, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for ExpressionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|err| err as &(dyn std::error::Error + 'static))
    }
}

impl From<ExpressionError> for Error {
    fn from(err: ExpressionError) -> Self {
        Error::Expression(err)
    }
}

impl From<OptimisticLockFailure> for Error {
    fn from(err: OptimisticLockFailure) -> Self {
        Error::OptimisticLock(Box::new(err))
    }
}

impl From<ReadOnlyError> for Error {
    fn from(err: ReadOnlyError) -> Self {
        Error::ReadOnly(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<MappingError> for Error {
    fn from(err: MappingError) -> Self {
        Error::Mapping(err)
    }
}

impl From<StateError> for Error {
    fn from(err: StateError) -> Self {
        Error::State(err)
    }
}

/// Result type alias for relmap operations.
pub type Result<T> = std::result::Result<T, Error>;
