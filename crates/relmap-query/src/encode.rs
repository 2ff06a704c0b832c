//! SQL rendering of qualifier expressions.
//!
//! Literal operands are always bound as parameters. LIKE renders the original
//! wildcard pattern, never the regex used for in-memory matching.

use crate::expr::{CompareOp, Expression};
use relmap_core::schema::PathComponent;
use relmap_core::{Dialect, Error, Result, Schema, Value};
use relmap_core::error::{MappingError, MappingErrorKind};

/// Maps object attribute paths to (possibly qualified) column references.
pub trait ColumnPathResolver {
    /// Resolve an object path such as `artist.name` to a column path such as `artist.NAME`.
    fn resolve_column(&self, path: &str) -> Result<String>;

    /// Qualify a database column path.
    fn qualify_db_path(&self, column: &str) -> String {
        column.to_string()
    }
}

/// Resolves paths of one entity using schema metadata.
///
/// Attributes of the root entity are qualified by `alias`. Attributes reached
/// through to-one relationships are qualified by the relationship path with
/// dots replaced by underscores, matching the join aliases of
/// [`SelectQuery`](crate::SelectQuery).
pub struct EntityColumnResolver<'a> {
    schema: &'a Schema,
    entity: &'a str,
    alias: String,
}

impl<'a> EntityColumnResolver<'a> {
    pub fn new(schema: &'a Schema, entity: &'a str, alias: impl Into<String>) -> Self {
        Self {
            schema,
            entity,
            alias: alias.into(),
        }
    }
}

/// Join alias for a relationship path prefix.
pub fn join_alias(prefix: &[&str]) -> String {
    prefix.join("_")
}

impl ColumnPathResolver for EntityColumnResolver<'_> {
    fn resolve_column(&self, path: &str) -> Result<String> {
        let components = self.schema.resolve_path(self.entity, path)?;
        let Some((PathComponent::Attribute(attribute), relationships)) = components.split_last()
        else {
            return Err(Error::Mapping(MappingError {
                kind: MappingErrorKind::Unsupported,
                entity: self.entity.to_string(),
                name: Some(path.to_string()),
                message: format!("path '{path}' does not end in an attribute"),
            }));
        };
        if relationships.is_empty() {
            return Ok(format!("{}.{}", self.alias, attribute.column));
        }
        let mut prefix = Vec::with_capacity(relationships.len());
        for component in relationships {
            let PathComponent::Relationship(rel) = component else {
                return Err(Error::unknown_relationship(self.entity, path));
            };
            if rel.is_to_many() || rel.is_flattened() {
                return Err(Error::Mapping(MappingError {
                    kind: MappingErrorKind::Unsupported,
                    entity: self.entity.to_string(),
                    name: Some(rel.name.clone()),
                    message: format!("path '{path}' crosses to-many relationship '{}'", rel.name),
                }));
            }
            prefix.push(rel.name.as_str());
        }
        Ok(format!("{}.{}", join_alias(&prefix), attribute.column))
    }

    fn qualify_db_path(&self, column: &str) -> String {
        if column.contains('.') {
            column.to_string()
        } else {
            format!("{}.{}", self.alias, column)
        }
    }
}

/// Rendered SQL with its bound parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlFragment {
    pub sql: String,
    pub params: Vec<Value>,
}

/// Renders [`Expression`] trees as SQL WHERE fragments.
pub struct SqlEncoder<'a> {
    dialect: Dialect,
    resolver: &'a dyn ColumnPathResolver,
}

impl<'a> SqlEncoder<'a> {
    pub fn new(dialect: Dialect, resolver: &'a dyn ColumnPathResolver) -> Self {
        Self { dialect, resolver }
    }

    /// Encode `expression` with placeholders numbered from 1.
    pub fn encode(&self, expression: &Expression) -> Result<SqlFragment> {
        let mut params = Vec::new();
        let sql = self.encode_with_params(expression, &mut params)?;
        Ok(SqlFragment { sql, params })
    }

    /// Encode `expression`, appending to an existing parameter list.
    pub fn encode_with_params(
        &self,
        expression: &Expression,
        params: &mut Vec<Value>,
    ) -> Result<String> {
        self.node(expression, params)
    }

    fn bind(&self, value: Value, params: &mut Vec<Value>) -> String {
        params.push(value);
        self.dialect.placeholder(params.len())
    }

    fn child(&self, parent: &Expression, child: &Expression, params: &mut Vec<Value>) -> Result<String> {
        let sql = self.node(child, params)?;
        // Predicates do not associate, so nested ones are always grouped.
        if child.precedence() < parent.precedence()
            || (matches!(parent, Expression::Not(_)) && child.precedence() < 5)
            || (parent.is_predicate() && child.is_predicate())
        {
            Ok(format!("({sql})"))
        } else {
            Ok(sql)
        }
    }

    fn node(&self, expr: &Expression, params: &mut Vec<Value>) -> Result<String> {
        match expr {
            Expression::Literal(value) => Ok(self.bind(value.clone(), params)),
            Expression::List(values) => {
                let placeholders: Vec<String> =
                    values.iter().map(|v| self.bind(v.clone(), params)).collect();
                Ok(format!("({})", placeholders.join(", ")))
            }
            Expression::ObjPath(path) => {
                let column = self.resolver.resolve_column(path)?;
                Ok(self.dialect.quote_column_path(&column))
            }
            Expression::DbPath(column) => Ok(self
                .dialect
                .quote_column_path(&self.resolver.qualify_db_path(column))),
            Expression::Compare { op, left, right } => {
                let left: &Expression = left;
                let right: &Expression = right;
                let is_null = |side: &Expression| matches!(side, Expression::Literal(Value::Null));
                if matches!(op, CompareOp::Eq | CompareOp::Ne) && (is_null(left) || is_null(right)) {
                    let operand = if is_null(right) { left } else { right };
                    let sql = self.child(expr, operand, params)?;
                    let test = if *op == CompareOp::Eq { "IS NULL" } else { "IS NOT NULL" };
                    return Ok(format!("{sql} {test}"));
                }
                let l = self.child(expr, left, params)?;
                let r = self.child(expr, right, params)?;
                Ok(format!("{l} {} {r}", op.as_str()))
            }
            Expression::Between {
                value,
                low,
                high,
                negated,
            } => {
                let v = self.child(expr, value, params)?;
                let lo = self.child(expr, low, params)?;
                let hi = self.child(expr, high, params)?;
                let not = if *negated { "NOT " } else { "" };
                Ok(format!("{v} {not}BETWEEN {lo} AND {hi}"))
            }
            Expression::In {
                value,
                list,
                negated,
            } => {
                if matches!(&**list, Expression::List(values) if values.is_empty()) {
                    return Ok(if *negated { "1 = 1" } else { "1 = 0" }.to_string());
                }
                let v = self.child(expr, value, params)?;
                let items = match &**list {
                    Expression::List(_) => self.node(list, params)?,
                    other => format!("({})", self.node(other, params)?),
                };
                let not = if *negated { "NOT " } else { "" };
                Ok(format!("{v} {not}IN {items}"))
            }
            Expression::Like {
                value,
                pattern,
                negated,
            } => {
                let v = self.child(expr, value, params)?;
                let p = self.bind(Value::Text(pattern.pattern().to_string()), params);
                let not = if *negated { "NOT " } else { "" };
                if !pattern.ignore_case() {
                    Ok(format!("{v} {not}LIKE {p}"))
                } else if self.dialect.supports_ilike() {
                    Ok(format!("{v} {not}ILIKE {p}"))
                } else {
                    Ok(format!("UPPER({v}) {not}LIKE UPPER({p})"))
                }
            }
            Expression::And(left, right) => {
                let l = self.child(expr, left, params)?;
                let r = self.child(expr, right, params)?;
                Ok(format!("{l} AND {r}"))
            }
            Expression::Or(left, right) => {
                let l = self.child(expr, left, params)?;
                let r = self.child(expr, right, params)?;
                Ok(format!("{l} OR {r}"))
            }
            Expression::Not(inner) => Ok(format!("NOT {}", self.child(expr, inner, params)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relmap_core::{AttributeInfo, EntityDescriptor, RelationshipInfo};

    /// Maps every path to `t0.<PATH>` uppercased.
    struct Upper;

    impl ColumnPathResolver for Upper {
        fn resolve_column(&self, path: &str) -> Result<String> {
            Ok(format!("t0.{}", path.to_uppercase()))
        }
    }

    fn encode(expr: &Expression, dialect: Dialect) -> SqlFragment {
        SqlEncoder::new(dialect, &Upper).encode(expr).unwrap()
    }

    #[test]
    fn literals_are_parameterized() {
        let frag = encode(&Expression::path("name").eq("x' OR 1=1 --"), Dialect::Postgres);
        assert_eq!(frag.sql, "\"t0\".\"NAME\" = $1");
        assert_eq!(frag.params, vec![Value::Text("x' OR 1=1 --".into())]);
    }

    #[test]
    fn precedence_is_preserved_by_nesting() {
        let expr = Expression::path("a")
            .eq(1)
            .or(Expression::path("b").eq(2))
            .and(Expression::path("c").eq(3).not());
        let frag = encode(&expr, Dialect::Sqlite);
        assert_eq!(
            frag.sql,
            "(\"t0\".\"A\" = ?1 OR \"t0\".\"B\" = ?2) AND NOT (\"t0\".\"C\" = ?3)"
        );
        assert_eq!(frag.params.len(), 3);
    }

    #[test]
    fn nested_predicates_are_grouped() {
        let expr = Expression::path("x").lt(1).eq(Value::Bool(true));
        let frag = encode(&expr, Dialect::Postgres);
        assert_eq!(frag.sql, "(\"t0\".\"X\" < $1) = $2");
        assert_eq!(frag.params, vec![Value::Int(1), Value::Bool(true)]);

        let expr = Expression::path("x").between(1, 5).ne(Value::Bool(false));
        let frag = encode(&expr, Dialect::Sqlite);
        assert_eq!(frag.sql, "(\"t0\".\"X\" BETWEEN ?1 AND ?2) <> ?3");
    }

    #[test]
    fn list_renders_parenthesized() {
        let frag = encode(&Expression::path("id").not_in_list([1, 2, 3]), Dialect::Mysql);
        assert_eq!(frag.sql, "`t0`.`ID` NOT IN (?, ?, ?)");
        assert_eq!(frag.params, vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
    }

    #[test]
    fn empty_in_list_is_constant() {
        let frag = encode(&Expression::path("id").in_list(Vec::<i32>::new()), Dialect::Postgres);
        assert_eq!(frag.sql, "1 = 0");
        assert!(frag.params.is_empty());
    }

    #[test]
    fn null_equality_uses_is_null() {
        let frag = encode(&Expression::path("a").eq(Value::Null), Dialect::Postgres);
        assert_eq!(frag.sql, "\"t0\".\"A\" IS NULL");
        let frag = encode(&Expression::path("a").ne(Value::Null), Dialect::Postgres);
        assert_eq!(frag.sql, "\"t0\".\"A\" IS NOT NULL");
        assert!(frag.params.is_empty());
    }

    #[test]
    fn like_renders_original_pattern() {
        let frag = encode(&Expression::path("name").like("S%").unwrap(), Dialect::Postgres);
        assert_eq!(frag.sql, "\"t0\".\"NAME\" LIKE $1");
        assert_eq!(frag.params, vec![Value::Text("S%".into())]);

        let frag = encode(
            &Expression::path("name").not_like_ignore_case("s%").unwrap(),
            Dialect::Postgres,
        );
        assert_eq!(frag.sql, "\"t0\".\"NAME\" NOT ILIKE $1");

        let frag = encode(
            &Expression::path("name").like_ignore_case("s%").unwrap(),
            Dialect::Sqlite,
        );
        assert_eq!(frag.sql, "UPPER(\"t0\".\"NAME\") LIKE UPPER(?1)");
    }

    #[test]
    fn between_renders_bounds() {
        let frag = encode(&Expression::path("price").between(1, 10), Dialect::Postgres);
        assert_eq!(frag.sql, "\"t0\".\"PRICE\" BETWEEN $1 AND $2");
    }

    #[test]
    fn entity_resolver_qualifies_joins() {
        let schema = Schema::new()
            .with_entity(
                EntityDescriptor::new("Artist", "ARTIST")
                    .with_attribute(AttributeInfo::new("id", "ID").primary_key())
                    .with_attribute(AttributeInfo::new("name", "ARTIST_NAME"))
                    .with_relationship(
                        RelationshipInfo::one_to_many("paintings", "Painting").join("ID", "ARTIST_ID"),
                    ),
            )
            .with_entity(
                EntityDescriptor::new("Painting", "PAINTING")
                    .with_attribute(AttributeInfo::new("id", "ID").primary_key())
                    .with_attribute(AttributeInfo::new("title", "TITLE"))
                    .with_relationship(
                        RelationshipInfo::many_to_one("artist", "Artist").join("ARTIST_ID", "ID"),
                    ),
            );
        let resolver = EntityColumnResolver::new(&schema, "Painting", "PAINTING");
        assert_eq!(resolver.resolve_column("title").unwrap(), "PAINTING.TITLE");
        assert_eq!(resolver.resolve_column("artist.name").unwrap(), "artist.ARTIST_NAME");
        assert_eq!(resolver.qualify_db_path("ARTIST_ID"), "PAINTING.ARTIST_ID");

        let artists = EntityColumnResolver::new(&schema, "Artist", "ARTIST");
        assert!(artists.resolve_column("paintings.title").is_err());
        assert!(resolver.resolve_column("artist").is_err());
    }
}
