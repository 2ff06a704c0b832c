//! relmap - object graph persistence over relational rows.
//!
//! relmap keeps an in-memory graph of persistent objects in step with the
//! database rows they were fetched from:
//!
//! - Identity map with cached snapshots and per-object diffs
//! - Snapshot merging that preserves uncommitted edits
//! - Join table bookkeeping for flattened (many-to-many) relationships
//! - Qualifier expressions evaluated in memory or rendered to SQL
//! - Optimistic locking and multi-connection transactions
//!
//! Statement execution is left to the caller: implement [`RowSource`],
//! [`StatementExecutor`] and [`TransactionalConnection`] for a driver and add
//! it to a [`DataDomain`].
//!
//! # Quick Start
//!
//! ```ignore
//! use relmap::prelude::*;
//! use std::sync::Arc;
//!
//! let schema = Arc::new(
//!     Schema::new().with_entity(
//!         EntityDescriptor::new("Artist", "ARTIST")
//!             .with_attribute(AttributeInfo::new("id", "ID").primary_key())
//!             .with_attribute(AttributeInfo::new("name", "NAME")),
//!     ),
//! );
//! let domain = DataDomain::new(schema).with_node(Box::new(my_driver));
//! let mut context = ObjectContext::new(domain)?;
//!
//! let artists = context.fetch(&SelectQuery::new("Artist").filter(Expression::path("name").like("M%")?))?;
//! context.set_value(&artists[0], "name", "Claude Monet")?;
//! context.commit_changes()?;
//! ```

pub use relmap_core::{
    AttributeInfo, DataNode, DataRow, Dialect, EntityDescriptor, Error, JoinColumn, LinkColumn,
    LinkTableInfo, LockType, ObjectId, OptimisticLockFailure, PathComponent, PersistenceState,
    PersistentObject, RelationshipInfo, RelationshipKind, RelationshipValue, Result, RowSource,
    Schema, SnapshotFetcher, Statement, StatementExecutor, StatementKind, TransactionalConnection,
    Value,
};
pub use relmap_core::error;
pub use relmap_query::{
    ColumnPathResolver, CompareOp, CompiledExpression, EntityColumnResolver, EvalSubject,
    Expression, LikePattern, PropertyAccess, SelectQuery, SqlEncoder, SqlFragment,
};
pub use relmap_session::{
    ChangeLog, CommitResult, ContextConfig, DataDomain, DiffStore, FlattenedArcKey, FlushOrderer,
    FlushPlan, FlushResult, GraphChange, IndirectChanges, IndirectDiffBuilder, LinkTableOp,
    ObjectContext, ObjectDiff, ObjectStore, ObjectView, PendingOp, StatementRouter,
    TransactionCoordinator, TransactionMode, TransactionStatus, classify,
};

/// Everything needed to declare a schema, plug in a driver and work with a
/// context.
///
/// ```ignore
/// use relmap::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        AttributeInfo, CommitResult, ContextConfig, DataDomain, DataNode, DataRow, Dialect,
        EntityDescriptor, Error, Expression, LinkTableInfo, ObjectContext, ObjectId,
        OptimisticLockFailure, PersistenceState, RelationshipInfo, Result, RowSource, Schema,
        SelectQuery, Statement, StatementExecutor, StatementKind, TransactionMode,
        TransactionalConnection, Value,
    };
}
