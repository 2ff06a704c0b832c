//! SELECT statements over one entity.

use crate::encode::{EntityColumnResolver, SqlEncoder, join_alias};
use crate::expr::Expression;
use relmap_core::schema::PathComponent;
use relmap_core::{DataRow, Dialect, Result, Schema, Statement, StatementKind};

/// A SELECT of one entity's rows, optionally qualified.
///
/// Object paths that cross to-one relationships add a LEFT JOIN per distinct
/// relationship prefix.
#[derive(Debug, Clone)]
pub struct SelectQuery {
    entity: String,
    qualifier: Option<Expression>,
    /// Primary key the query was built from, passed on to the statement.
    key: Option<DataRow>,
    limit: Option<u64>,
}

impl SelectQuery {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            qualifier: None,
            key: None,
            limit: None,
        }
    }

    /// Select the single row whose primary key columns match `pk`.
    pub fn by_primary_key(entity: impl Into<String>, pk: &DataRow) -> Self {
        let qualifier = pk
            .iter()
            .map(|(column, value)| Expression::db_path(column).eq(value.clone()))
            .reduce(Expression::and);
        Self {
            entity: entity.into(),
            qualifier,
            key: Some(pk.clone()),
            limit: None,
        }
    }

    /// Add a condition, AND-ed with any existing qualifier.
    pub fn filter(mut self, condition: Expression) -> Self {
        self.qualifier = Some(match self.qualifier.take() {
            Some(existing) => existing.and(condition),
            None => condition,
        });
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn qualifier(&self) -> Option<&Expression> {
        self.qualifier.as_ref()
    }

    /// Render the statement.
    #[tracing::instrument(level = "trace", skip(self, schema), fields(entity = %self.entity))]
    pub fn build(&self, schema: &Schema, dialect: Dialect) -> Result<Statement> {
        let descriptor = schema.entity(&self.entity)?;
        let table = dialect.quote_identifier(&descriptor.table);

        let mut sql = format!("SELECT {table}.* FROM {table}");
        if let Some(qualifier) = &self.qualifier {
            sql.push_str(&self.joins(schema, dialect, qualifier)?);
        }

        let mut params = Vec::new();
        if let Some(qualifier) = &self.qualifier {
            let resolver = EntityColumnResolver::new(schema, &self.entity, descriptor.table.clone());
            let encoder = SqlEncoder::new(dialect, &resolver);
            let condition = encoder.encode_with_params(qualifier, &mut params)?;
            sql.push_str(" WHERE ");
            sql.push_str(&condition);
        }
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        tracing::trace!(sql = %sql, params = params.len(), "Built select");
        let mut statement = Statement::new(StatementKind::Select, descriptor.table.clone(), sql);
        statement.params = params;
        if let Some(key) = &self.key {
            statement.qualifier = key.clone();
        }
        Ok(statement)
    }

    fn joins(&self, schema: &Schema, dialect: Dialect, qualifier: &Expression) -> Result<String> {
        let root = schema.entity(&self.entity)?;
        let mut added: Vec<String> = Vec::new();
        let mut sql = String::new();

        for path in qualifier.obj_paths() {
            let components = schema.resolve_path(&self.entity, path)?;
            let mut prefix: Vec<&str> = Vec::new();
            let mut source_alias = root.table.clone();
            for component in &components {
                let PathComponent::Relationship(rel) = component else {
                    break;
                };
                if rel.is_to_many() || rel.is_flattened() {
                    // Reported by the column resolver.
                    break;
                }
                prefix.push(&rel.name);
                let alias = join_alias(&prefix);
                if !added.contains(&alias) {
                    let target = schema.entity(&rel.target_entity)?;
                    let on: Vec<String> = rel
                        .joins
                        .iter()
                        .map(|j| {
                            format!(
                                "{}.{} = {}.{}",
                                dialect.quote_identifier(&source_alias),
                                dialect.quote_identifier(&j.source),
                                dialect.quote_identifier(&alias),
                                dialect.quote_identifier(&j.target)
                            )
                        })
                        .collect();
                    sql.push_str(&format!(
                        " LEFT JOIN {} {} ON {}",
                        dialect.quote_identifier(&target.table),
                        dialect.quote_identifier(&alias),
                        on.join(" AND ")
                    ));
                    added.push(alias.clone());
                }
                source_alias = alias;
            }
        }
        Ok(sql)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relmap_core::{AttributeInfo, EntityDescriptor, RelationshipInfo, Value};

    fn schema() -> Schema {
        Schema::new()
            .with_entity(
                EntityDescriptor::new("Artist", "ARTIST")
                    .with_attribute(AttributeInfo::new("id", "ID").primary_key())
                    .with_attribute(AttributeInfo::new("name", "ARTIST_NAME")),
            )
            .with_entity(
                EntityDescriptor::new("Painting", "PAINTING")
                    .with_attribute(AttributeInfo::new("id", "ID").primary_key())
                    .with_attribute(AttributeInfo::new("title", "TITLE"))
                    .with_relationship(
                        RelationshipInfo::many_to_one("artist", "Artist").join("ARTIST_ID", "ID"),
                    ),
            )
    }

    #[test]
    fn by_primary_key() {
        let pk = DataRow::new().with("ID", 7);
        let statement = SelectQuery::by_primary_key("Painting", &pk)
            .build(&schema(), Dialect::Postgres)
            .unwrap();
        assert_eq!(
            statement.sql,
            "SELECT \"PAINTING\".* FROM \"PAINTING\" WHERE \"PAINTING\".\"ID\" = $1"
        );
        assert_eq!(statement.params, vec![Value::Int(7)]);
        assert_eq!(statement.qualifier.get("ID"), Some(&Value::Int(7)));
        assert_eq!(statement.kind, StatementKind::Select);
    }

    #[test]
    fn relationship_paths_join_once() {
        let query = SelectQuery::new("Painting")
            .filter(Expression::path("artist.name").like("P%").unwrap())
            .filter(Expression::path("artist.id").ne(3))
            .limit(10);
        let statement = query.build(&schema(), Dialect::Sqlite).unwrap();
        assert_eq!(
            statement.sql,
            "SELECT \"PAINTING\".* FROM \"PAINTING\" \
             LEFT JOIN \"ARTIST\" \"artist\" ON \"PAINTING\".\"ARTIST_ID\" = \"artist\".\"ID\" \
             WHERE \"artist\".\"ARTIST_NAME\" LIKE ?1 AND \"artist\".\"ID\" <> ?2 LIMIT 10"
        );
    }

    #[test]
    fn unqualified_select() {
        let statement = SelectQuery::new("Artist")
            .build(&schema(), Dialect::Mysql)
            .unwrap();
        assert_eq!(statement.sql, "SELECT `ARTIST`.* FROM `ARTIST`");
        assert!(statement.params.is_empty());
    }

    #[test]
    fn unknown_entity_fails() {
        assert!(SelectQuery::new("Gallery").build(&schema(), Dialect::Postgres).is_err());
    }
}
