//! Qualifier expression trees.
//!
//! An [`Expression`] is built once and then either compiled for in-memory
//! evaluation ([`CompiledExpression`](crate::CompiledExpression)) or encoded
//! to SQL ([`SqlEncoder`](crate::SqlEncoder)). Subtrees are owned by their
//! parent; cloning an expression deep-copies it.

use crate::like::LikePattern;
use relmap_core::{Result, Value};
use std::fmt;

/// Prefix selecting a database column path in [`Expression::path`].
pub const DB_PATH_PREFIX: &str = "db:";

/// Binary comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    /// Get the SQL representation of this operator.
    pub const fn as_str(self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }
}

/// A node of a qualifier expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    /// Constant value
    Literal(Value),
    /// Constant list, used as the right side of IN
    List(Vec<Value>),
    /// Dot-separated object path, resolved against the evaluated object
    ObjPath(String),
    /// Database column path, resolved at SQL generation time
    DbPath(String),
    /// Binary comparison
    Compare {
        op: CompareOp,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    /// Inclusive range test
    Between {
        value: Box<Expression>,
        low: Box<Expression>,
        high: Box<Expression>,
        negated: bool,
    },
    /// Membership test against a list
    In {
        value: Box<Expression>,
        list: Box<Expression>,
        negated: bool,
    },
    /// SQL wildcard match
    Like {
        value: Box<Expression>,
        pattern: LikePattern,
        negated: bool,
    },
    And(Box<Expression>, Box<Expression>),
    Or(Box<Expression>, Box<Expression>),
    Not(Box<Expression>),
}

impl Expression {
    /// Path expression; a `db:` prefix selects a database column path.
    pub fn path(path: impl Into<String>) -> Self {
        let path = path.into();
        match path.strip_prefix(DB_PATH_PREFIX) {
            Some(column) => Expression::DbPath(column.to_string()),
            None => Expression::ObjPath(path),
        }
    }

    pub fn db_path(column: impl Into<String>) -> Self {
        Expression::DbPath(column.into())
    }

    pub fn literal(value: impl Into<Value>) -> Self {
        Expression::Literal(value.into())
    }

    /// List literal. Scalars become a single-element list.
    pub fn list<V: Into<Value>>(values: impl IntoIterator<Item = V>) -> Self {
        Expression::List(values.into_iter().map(Into::into).collect())
    }

    fn compare(self, op: CompareOp, other: impl Into<Expression>) -> Self {
        Expression::Compare {
            op,
            left: Box::new(self),
            right: Box::new(other.into()),
        }
    }

    pub fn eq(self, other: impl Into<Expression>) -> Self {
        self.compare(CompareOp::Eq, other)
    }

    pub fn ne(self, other: impl Into<Expression>) -> Self {
        self.compare(CompareOp::Ne, other)
    }

    pub fn lt(self, other: impl Into<Expression>) -> Self {
        self.compare(CompareOp::Lt, other)
    }

    pub fn le(self, other: impl Into<Expression>) -> Self {
        self.compare(CompareOp::Le, other)
    }

    pub fn gt(self, other: impl Into<Expression>) -> Self {
        self.compare(CompareOp::Gt, other)
    }

    pub fn ge(self, other: impl Into<Expression>) -> Self {
        self.compare(CompareOp::Ge, other)
    }

    pub fn between(self, low: impl Into<Expression>, high: impl Into<Expression>) -> Self {
        Expression::Between {
            value: Box::new(self),
            low: Box::new(low.into()),
            high: Box::new(high.into()),
            negated: false,
        }
    }

    pub fn not_between(self, low: impl Into<Expression>, high: impl Into<Expression>) -> Self {
        match self.between(low, high) {
            Expression::Between {
                value, low, high, ..
            } => Expression::Between {
                value,
                low,
                high,
                negated: true,
            },
            other => other,
        }
    }

    pub fn in_list<V: Into<Value>>(self, values: impl IntoIterator<Item = V>) -> Self {
        Expression::In {
            value: Box::new(self),
            list: Box::new(Expression::list(values)),
            negated: false,
        }
    }

    pub fn not_in_list<V: Into<Value>>(self, values: impl IntoIterator<Item = V>) -> Self {
        Expression::In {
            value: Box::new(self),
            list: Box::new(Expression::list(values)),
            negated: true,
        }
    }

    fn like_with(self, pattern: &str, ignore_case: bool, negated: bool) -> Result<Self> {
        Ok(Expression::Like {
            value: Box::new(self),
            pattern: LikePattern::new(pattern, ignore_case)?,
            negated,
        })
    }

    pub fn like(self, pattern: &str) -> Result<Self> {
        self.like_with(pattern, false, false)
    }

    pub fn not_like(self, pattern: &str) -> Result<Self> {
        self.like_with(pattern, false, true)
    }

    pub fn like_ignore_case(self, pattern: &str) -> Result<Self> {
        self.like_with(pattern, true, false)
    }

    pub fn not_like_ignore_case(self, pattern: &str) -> Result<Self> {
        self.like_with(pattern, true, true)
    }

    pub fn and(self, other: Expression) -> Self {
        Expression::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Expression) -> Self {
        Expression::Or(Box::new(self), Box::new(other))
    }

    pub fn not(self) -> Self {
        Expression::Not(Box::new(self))
    }

    /// Binding strength used to decide where parentheses are needed.
    pub(crate) fn precedence(&self) -> u8 {
        match self {
            Expression::Or(..) => 1,
            Expression::And(..) => 2,
            Expression::Not(_) => 3,
            Expression::Compare { .. }
            | Expression::Between { .. }
            | Expression::In { .. }
            | Expression::Like { .. } => 4,
            Expression::Literal(_)
            | Expression::List(_)
            | Expression::ObjPath(_)
            | Expression::DbPath(_) => 5,
        }
    }

    /// Comparison, BETWEEN, IN or LIKE.
    pub(crate) fn is_predicate(&self) -> bool {
        matches!(
            self,
            Expression::Compare { .. }
                | Expression::Between { .. }
                | Expression::In { .. }
                | Expression::Like { .. }
        )
    }

    /// Object paths referenced anywhere in this expression.
    pub fn obj_paths(&self) -> Vec<&str> {
        let mut paths = Vec::new();
        self.collect_obj_paths(&mut paths);
        paths
    }

    fn collect_obj_paths<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expression::ObjPath(path) => out.push(path),
            Expression::Literal(_) | Expression::List(_) | Expression::DbPath(_) => {}
            Expression::Compare { left, right, .. }
            | Expression::And(left, right)
            | Expression::Or(left, right) => {
                left.collect_obj_paths(out);
                right.collect_obj_paths(out);
            }
            Expression::Between {
                value, low, high, ..
            } => {
                value.collect_obj_paths(out);
                low.collect_obj_paths(out);
                high.collect_obj_paths(out);
            }
            Expression::In { value, list, .. } => {
                value.collect_obj_paths(out);
                list.collect_obj_paths(out);
            }
            Expression::Like { value, .. } | Expression::Not(value) => {
                value.collect_obj_paths(out);
            }
        }
    }

    fn fmt_child(&self, child: &Expression, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if child.precedence() < self.precedence() {
            write!(f, "({child})")
        } else {
            write!(f, "{child}")
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Literal(value) => write!(f, "{value}"),
            Expression::List(values) => write!(f, "{}", Value::Array(values.clone())),
            Expression::ObjPath(path) => write!(f, "{path}"),
            Expression::DbPath(path) => write!(f, "{DB_PATH_PREFIX}{path}"),
            Expression::Compare { op, left, right } => {
                self.fmt_child(left, f)?;
                write!(f, " {} ", op.as_str())?;
                self.fmt_child(right, f)
            }
            Expression::Between {
                value,
                low,
                high,
                negated,
            } => {
                self.fmt_child(value, f)?;
                write!(f, " {}between ", if *negated { "not " } else { "" })?;
                self.fmt_child(low, f)?;
                write!(f, " and ")?;
                self.fmt_child(high, f)
            }
            Expression::In {
                value,
                list,
                negated,
            } => {
                self.fmt_child(value, f)?;
                write!(f, " {}in ", if *negated { "not " } else { "" })?;
                self.fmt_child(list, f)
            }
            Expression::Like {
                value,
                pattern,
                negated,
            } => {
                self.fmt_child(value, f)?;
                let op = if pattern.ignore_case() {
                    "likeIgnoreCase"
                } else {
                    "like"
                };
                let not = if *negated { "not " } else { "" };
                write!(f, " {not}{op} {}", Value::Text(pattern.pattern().to_string()))
            }
            Expression::And(left, right) => {
                self.fmt_child(left, f)?;
                write!(f, " and ")?;
                self.fmt_child(right, f)
            }
            Expression::Or(left, right) => {
                self.fmt_child(left, f)?;
                write!(f, " or ")?;
                self.fmt_child(right, f)
            }
            Expression::Not(inner) => {
                write!(f, "not ")?;
                self.fmt_child(inner, f)
            }
        }
    }
}

impl From<Value> for Expression {
    fn from(value: Value) -> Self {
        Expression::Literal(value)
    }
}

impl From<bool> for Expression {
    fn from(value: bool) -> Self {
        Expression::Literal(Value::Bool(value))
    }
}

impl From<i32> for Expression {
    fn from(value: i32) -> Self {
        Expression::Literal(Value::Int(value))
    }
}

impl From<i64> for Expression {
    fn from(value: i64) -> Self {
        Expression::Literal(Value::BigInt(value))
    }
}

impl From<f64> for Expression {
    fn from(value: f64) -> Self {
        Expression::Literal(Value::Double(value))
    }
}

impl From<&str> for Expression {
    fn from(value: &str) -> Self {
        Expression::Literal(Value::Text(value.to_string()))
    }
}

impl From<String> for Expression {
    fn from(value: String) -> Self {
        Expression::Literal(Value::Text(value))
    }
}
