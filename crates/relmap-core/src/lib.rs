//! Core types and traits for relmap.
//!
//! This crate provides the foundations shared by the query and session layers:
//!
//! - `Value` for dynamically typed column values
//! - `ObjectId` identities and `DataRow` snapshots
//! - `Schema` metadata for entities, attributes and relationships
//! - `PersistentObject` with its lifecycle `PersistenceState`
//! - boundary traits (`RowSource`, `StatementExecutor`, `TransactionalConnection`)
//!   implemented by the statement execution layer

pub mod connection;
pub mod dialect;
pub mod error;
pub mod identity;
pub mod lock;
pub mod object;
pub mod row;
pub mod schema;
pub mod value;

pub use connection::{
    DataNode, RowSource, SnapshotFetcher, Statement, StatementExecutor, StatementKind,
    TransactionalConnection,
};
pub use dialect::Dialect;
pub use error::{Error, Result};
pub use identity::ObjectId;
pub use lock::OptimisticLockFailure;
pub use object::{PersistenceState, PersistentObject, RelationshipValue};
pub use row::DataRow;
pub use schema::{
    AttributeInfo, EntityDescriptor, JoinColumn, LinkColumn, LinkTableInfo, LockType,
    PathComponent, RelationshipInfo, RelationshipKind, Schema,
};
pub use value::Value;
