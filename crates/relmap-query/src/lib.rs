//! Qualifier expressions for relmap.
//!
//! An [`Expression`] is a tree of comparisons, range and membership tests,
//! LIKE matches and boolean connectives over object or column paths. It can be
//!
//! - compiled into a [`CompiledExpression`] and evaluated in memory against
//!   rows, entity metadata or arbitrary objects, or
//! - rendered to a parameterized SQL fragment with [`SqlEncoder`].
//!
//! [`SelectQuery`] combines both halves with schema metadata to produce
//! complete SELECT statements.

pub mod compile;
pub mod encode;
pub mod eval;
pub mod expr;
pub mod like;
pub mod select;

pub use compile::CompiledExpression;
pub use encode::{ColumnPathResolver, EntityColumnResolver, SqlEncoder, SqlFragment, join_alias};
pub use eval::{EvalSubject, PropertyAccess};
pub use expr::{CompareOp, DB_PATH_PREFIX, Expression};
pub use like::LikePattern;
pub use select::SelectQuery;

pub use relmap_core::Dialect;
