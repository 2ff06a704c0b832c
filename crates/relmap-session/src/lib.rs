//! Unit of work for relmap.
//!
//! `relmap-session` tracks object identity and edits in memory and writes them
//! back in one transaction.
//!
//! # Role In The Architecture
//!
//! - **Object store**: one object per identity, with cached row snapshots and
//!   per-object diffs of the last confirmed state.
//! - **Snapshot merge**: folds rows changed elsewhere into registered objects
//!   without losing uncommitted edits.
//! - **Change classification**: turns the stream of graph edits into join table
//!   rows and indirect modifications.
//! - **Flush**: orders INSERT/UPDATE/DELETE and join row operations by foreign
//!   key dependency, with optimistic lock qualifiers.
//! - **Transactions**: commits or rolls back every participating connection.
//!
//! # Example
//!
//! ```ignore
//! let mut context = ObjectContext::new(domain)?;
//!
//! let artist = context.fetch(&SelectQuery::new("Artist"))?.remove(0);
//! context.set_value(&artist, "name", "Claude Monet")?;
//!
//! let group = context.create("ArtGroup")?;
//! context.add_to_many(&artist, "groups", &group)?;
//!
//! context.commit_changes()?;
//! ```

pub mod config;
pub mod context;
pub mod diff;
pub mod domain;
pub mod flush;
pub mod graph;
pub mod indirect;
pub mod merge;
pub mod store;
pub mod transaction;

pub use config::ContextConfig;
pub use context::{CommitResult, ObjectContext};
pub use diff::{DiffStore, ObjectDiff};
pub use domain::DataDomain;
pub use flush::{
    FlushOrderer, FlushPlan, FlushResult, LinkTableOp, PendingOp, StatementRouter, build_plan,
};
pub use graph::{ChangeLog, GraphChange};
pub use indirect::{FlattenedArcKey, IndirectChanges, IndirectDiffBuilder, JoinTableChanges, classify};
pub use merge::{force_merge_with_snapshot, is_to_one_target_modified, refresh_object_with_snapshot, to_one_target};
pub use store::{ObjectStore, ObjectView};
pub use transaction::{TransactionCoordinator, TransactionMode, TransactionStatus};
