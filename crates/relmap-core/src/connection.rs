//! Boundary traits implemented by the statement execution layer.
//!
//! relmap renders SQL and parameter lists but never talks to a database
//! directly. A data node implements these traits on top of a driver.

use crate::error::{Error, Result};
use crate::schema::EntityDescriptor;
use crate::{DataRow, Value};
use std::fmt;

/// The kind of a generated statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatementKind::Select => "SELECT",
            StatementKind::Insert => "INSERT",
            StatementKind::Update => "UPDATE",
            StatementKind::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

/// A rendered statement together with the row data it was rendered from.
///
/// Drivers bind `sql` and `params`. The structured `values` (columns written)
/// and `qualifier` (columns matched in WHERE) let simpler executors work
/// without parsing SQL.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub kind: StatementKind,
    pub table: String,
    pub sql: String,
    pub params: Vec<Value>,
    pub values: DataRow,
    pub qualifier: DataRow,
}

impl Statement {
    pub fn new(kind: StatementKind, table: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            kind,
            table: table.into(),
            sql: sql.into(),
            params: Vec::new(),
            values: DataRow::new(),
            qualifier: DataRow::new(),
        }
    }
}

/// Produces fetched rows as column-keyed snapshots.
pub trait RowSource {
    fn select(&mut self, statement: &Statement) -> Result<Vec<DataRow>>;
}

/// Executes data modification statements.
pub trait StatementExecutor {
    /// Execute `statement`, returning the number of affected rows.
    fn execute(&mut self, statement: &Statement) -> Result<u64>;

    /// Produce a primary key value for a new row of `entity`.
    fn generate_primary_key(&mut self, entity: &EntityDescriptor) -> Result<Value> {
        Err(Error::Custom(format!(
            "no primary key generator for entity '{}'",
            entity.name
        )))
    }
}

/// A physical connection taking part in a transaction.
pub trait TransactionalConnection {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    fn set_auto_commit(&mut self, auto_commit: bool) -> Result<()>;

    fn commit(&mut self) -> Result<()>;

    fn rollback(&mut self) -> Result<()>;

    /// Release the connection once the transaction is finished.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A connection able to fetch rows, run statements and join a transaction.
pub trait DataNode: RowSource + StatementExecutor + TransactionalConnection {
    fn as_connection(&mut self) -> &mut dyn TransactionalConnection;
}

impl<T: RowSource + StatementExecutor + TransactionalConnection> DataNode for T {
    fn as_connection(&mut self) -> &mut dyn TransactionalConnection {
        self
    }
}

/// Fetches the current database snapshot of a single row.
pub trait SnapshotFetcher {
    /// Select the row of `entity` matching `primary_key`, if it still exists.
    fn fetch_snapshot(&mut self, entity: &str, primary_key: &DataRow) -> Result<Option<DataRow>>;
}
