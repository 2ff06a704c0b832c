//! Flush operation planning, ordering and execution.
//!
//! Pending changes are written in an order that respects foreign keys:
//! - INSERT parent-first
//! - UPDATE any order
//! - join table DELETE, then join table INSERT
//! - DELETE child-first
//!
//! UPDATE and DELETE of entities with optimistic locking are qualified by the
//! last confirmed values of the locking attributes. Such a statement that
//! matches no row fails the flush with an [`OptimisticLockFailure`].

use crate::indirect::{FlattenedArcKey, IndirectChanges};
use crate::store::ObjectStore;
use relmap_core::{
    DataRow, Dialect, EntityDescriptor, Error, LockType, ObjectId, OptimisticLockFailure,
    PersistenceState, Result, Schema, Statement, StatementKind, Value,
};
use std::collections::{HashMap, HashSet};

/// A pending row operation.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingOp {
    /// Insert a new row.
    Insert {
        id: ObjectId,
        entity: String,
        table: String,
        /// Columns and values to insert.
        values: DataRow,
    },
    /// Update an existing row.
    Update {
        id: ObjectId,
        entity: String,
        table: String,
        /// Changed columns only.
        values: DataRow,
        /// Primary key plus expected locking values.
        qualifier: DataRow,
        pk_columns: Vec<String>,
        optimistic: bool,
    },
    /// Delete an existing row.
    Delete {
        id: ObjectId,
        entity: String,
        table: String,
        qualifier: DataRow,
        pk_columns: Vec<String>,
        optimistic: bool,
    },
}

/// Render `"A" = $1 AND "B" IS NULL`, appending bound values to `params`.
fn where_clause(qualifier: &DataRow, dialect: Dialect, params: &mut Vec<Value>) -> String {
    qualifier
        .iter()
        .map(|(column, value)| {
            if value.is_null() {
                format!("{} IS NULL", dialect.quote_identifier(column))
            } else {
                params.push(value.clone());
                format!(
                    "{} = {}",
                    dialect.quote_identifier(column),
                    dialect.placeholder(params.len())
                )
            }
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

fn insert_statement(table: &str, values: &DataRow, dialect: Dialect) -> Statement {
    let columns: Vec<String> = values
        .columns()
        .iter()
        .map(|c| dialect.quote_identifier(c))
        .collect();
    let placeholders: Vec<String> = (1..=values.len()).map(|i| dialect.placeholder(i)).collect();
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        dialect.quote_identifier(table),
        columns.join(", "),
        placeholders.join(", ")
    );
    let mut statement = Statement::new(StatementKind::Insert, table, sql);
    statement.params = values.iter().map(|(_, v)| v.clone()).collect();
    statement.values = values.clone();
    statement
}

fn delete_statement(table: &str, qualifier: &DataRow, dialect: Dialect) -> Statement {
    let mut params = Vec::new();
    let sql = format!(
        "DELETE FROM {} WHERE {}",
        dialect.quote_identifier(table),
        where_clause(qualifier, dialect, &mut params)
    );
    let mut statement = Statement::new(StatementKind::Delete, table, sql);
    statement.params = params;
    statement.qualifier = qualifier.clone();
    statement
}

impl PendingOp {
    pub fn table(&self) -> &str {
        match self {
            PendingOp::Insert { table, .. }
            | PendingOp::Update { table, .. }
            | PendingOp::Delete { table, .. } => table,
        }
    }

    pub fn entity(&self) -> &str {
        match self {
            PendingOp::Insert { entity, .. }
            | PendingOp::Update { entity, .. }
            | PendingOp::Delete { entity, .. } => entity,
        }
    }

    pub fn id(&self) -> &ObjectId {
        match self {
            PendingOp::Insert { id, .. } | PendingOp::Update { id, .. } | PendingOp::Delete { id, .. } => id,
        }
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, PendingOp::Insert { .. })
    }

    pub fn is_update(&self) -> bool {
        matches!(self, PendingOp::Update { .. })
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, PendingOp::Delete { .. })
    }

    /// Render the SQL statement for this operation.
    pub fn to_statement(&self, dialect: Dialect) -> Statement {
        match self {
            PendingOp::Insert { table, values, .. } => insert_statement(table, values, dialect),
            PendingOp::Update {
                table,
                values,
                qualifier,
                ..
            } => {
                let mut params: Vec<Value> = Vec::with_capacity(values.len() + qualifier.len());
                let set_clause = values
                    .iter()
                    .map(|(column, value)| {
                        params.push(value.clone());
                        format!(
                            "{} = {}",
                            dialect.quote_identifier(column),
                            dialect.placeholder(params.len())
                        )
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                let where_sql = where_clause(qualifier, dialect, &mut params);
                let sql = format!(
                    "UPDATE {} SET {} WHERE {}",
                    dialect.quote_identifier(table),
                    set_clause,
                    where_sql
                );
                let mut statement = Statement::new(StatementKind::Update, table.as_str(), sql);
                statement.params = params;
                statement.values = values.clone();
                statement.qualifier = qualifier.clone();
                statement
            }
            PendingOp::Delete {
                table, qualifier, ..
            } => delete_statement(table, qualifier, dialect),
        }
    }
}

/// A pending join table operation of a flattened relationship.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkTableOp {
    /// Insert a join row.
    Link {
        table: String,
        /// Source entity of the relationship, used to pick the data node.
        entity: String,
        values: DataRow,
    },
    /// Delete join rows matching all given columns.
    Unlink {
        table: String,
        entity: String,
        values: DataRow,
    },
}

impl LinkTableOp {
    /// Join row linking the two ends of `key`.
    pub fn link(key: &FlattenedArcKey, source: &ObjectId, target: &ObjectId, schema: &Schema) -> Result<Self> {
        let (table, values) = Self::row(key, source, target, schema)?;
        Ok(Self::Link {
            table,
            entity: source.entity_name().to_string(),
            values,
        })
    }

    /// Join row removal for the two ends of `key`.
    pub fn unlink(key: &FlattenedArcKey, source: &ObjectId, target: &ObjectId, schema: &Schema) -> Result<Self> {
        let (table, values) = Self::row(key, source, target, schema)?;
        Ok(Self::Unlink {
            table,
            entity: source.entity_name().to_string(),
            values,
        })
    }

    fn row(
        key: &FlattenedArcKey,
        source: &ObjectId,
        target: &ObjectId,
        schema: &Schema,
    ) -> Result<(String, DataRow)> {
        let relationship = key.relationship_info(schema)?;
        let link = relationship.link_table.as_ref().ok_or_else(|| {
            Error::unknown_relationship(source.entity_name(), key.relationship())
        })?;
        let values: DataRow = link
            .local_values(source)?
            .into_iter()
            .chain(link.remote_values(target)?)
            .collect();
        Ok((link.table_name.clone(), values))
    }

    pub fn table(&self) -> &str {
        match self {
            LinkTableOp::Link { table, .. } | LinkTableOp::Unlink { table, .. } => table,
        }
    }

    pub fn entity(&self) -> &str {
        match self {
            LinkTableOp::Link { entity, .. } | LinkTableOp::Unlink { entity, .. } => entity,
        }
    }

    pub fn is_link(&self) -> bool {
        matches!(self, LinkTableOp::Link { .. })
    }

    pub fn is_unlink(&self) -> bool {
        matches!(self, LinkTableOp::Unlink { .. })
    }

    pub fn to_statement(&self, dialect: Dialect) -> Statement {
        match self {
            LinkTableOp::Link { table, values, .. } => insert_statement(table, values, dialect),
            LinkTableOp::Unlink { table, values, .. } => delete_statement(table, values, dialect),
        }
    }
}

/// Executes rendered statements on the data node serving an entity.
pub trait StatementRouter {
    /// Execute `statement` for `entity`, returning the affected row count.
    fn execute(&mut self, entity: &str, statement: &Statement) -> Result<u64>;
}

/// Orders operations by foreign key dependency depth.
#[derive(Debug, Default)]
pub struct FlushOrderer {
    /// Entity -> entities it has foreign keys to.
    dependencies: HashMap<String, Vec<String>>,
}

impl FlushOrderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the foreign key dependencies of every entity in `schema`.
    pub fn from_schema(schema: &Schema) -> Result<Self> {
        let mut orderer = Self::new();
        for entity in schema.entities() {
            schema.root_entity(&entity.name)?;
            let deps = schema
                .dependencies(&entity.name)?
                .into_iter()
                .map(str::to_string)
                .collect();
            orderer.register_entity(entity.name.clone(), deps);
        }
        Ok(orderer)
    }

    pub fn register_entity(&mut self, entity: impl Into<String>, depends_on: Vec<String>) {
        self.dependencies.insert(entity.into(), depends_on);
    }

    /// Length of the longest dependency chain below `entity`. Cycles are cut.
    pub fn dependency_depth(&self, entity: &str) -> usize {
        fn depth<'a>(
            deps: &'a HashMap<String, Vec<String>>,
            entity: &'a str,
            visiting: &mut HashSet<&'a str>,
        ) -> usize {
            if !visiting.insert(entity) {
                return 0;
            }
            let result = deps.get(entity).map_or(0, |parents| {
                parents
                    .iter()
                    .map(|p| 1 + depth(deps, p, visiting))
                    .max()
                    .unwrap_or(0)
            });
            visiting.remove(entity);
            result
        }
        depth(&self.dependencies, entity, &mut HashSet::new())
    }

    /// Split operations into a flush plan.
    ///
    /// Inserts are sorted parent-first and deletes child-first. The sort is
    /// stable, so operations on unrelated entities keep their order.
    pub fn order(&self, ops: Vec<PendingOp>, link_ops: Vec<LinkTableOp>) -> FlushPlan {
        let mut plan = FlushPlan::new();
        for op in ops {
            match op {
                PendingOp::Insert { .. } => plan.inserts.push(op),
                PendingOp::Update { .. } => plan.updates.push(op),
                PendingOp::Delete { .. } => plan.deletes.push(op),
            }
        }
        for op in link_ops {
            if op.is_link() {
                plan.links.push(op);
            } else {
                plan.unlinks.push(op);
            }
        }

        // Batch join rows per table.
        plan.unlinks.sort_by(|a, b| a.table().cmp(b.table()));
        plan.links.sort_by(|a, b| a.table().cmp(b.table()));
        plan.inserts
            .sort_by_key(|op| self.dependency_depth(op.entity()));
        plan.deletes
            .sort_by_key(|op| std::cmp::Reverse(self.dependency_depth(op.entity())));
        plan
    }
}

/// Ordered operations of one flush.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FlushPlan {
    /// Inserts, parents first.
    pub inserts: Vec<PendingOp>,
    pub updates: Vec<PendingOp>,
    /// Join rows to remove.
    pub unlinks: Vec<LinkTableOp>,
    /// Join rows to add.
    pub links: Vec<LinkTableOp>,
    /// Deletes, children first.
    pub deletes: Vec<PendingOp>,
}

impl FlushPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of operations in the plan.
    pub fn len(&self) -> usize {
        self.inserts.len()
            + self.updates.len()
            + self.unlinks.len()
            + self.links.len()
            + self.deletes.len()
    }

    /// Link ops touching `table`.
    pub fn link_ops_for(&self, table: &str) -> impl Iterator<Item = &LinkTableOp> {
        self.unlinks
            .iter()
            .chain(self.links.iter())
            .filter(move |op| op.table() == table)
    }

    /// Execute the plan through `router`.
    ///
    /// Stops at the first failing statement. A locked UPDATE or DELETE that
    /// matches no row fails with [`Error::OptimisticLock`].
    #[tracing::instrument(level = "info", skip_all)]
    pub fn execute(
        &self,
        schema: &Schema,
        dialect: Dialect,
        router: &mut dyn StatementRouter,
    ) -> Result<FlushResult> {
        tracing::info!(
            inserts = self.inserts.len(),
            updates = self.updates.len(),
            unlinks = self.unlinks.len(),
            links = self.links.len(),
            deletes = self.deletes.len(),
            "Executing flush plan"
        );
        let start = std::time::Instant::now();
        let mut result = FlushResult::default();

        for op in &self.inserts {
            Self::execute_op(schema, dialect, router, op)?;
            result.inserted += 1;
        }
        for op in &self.updates {
            Self::execute_op(schema, dialect, router, op)?;
            result.updated += 1;
        }
        for op in &self.unlinks {
            let statement = op.to_statement(dialect);
            tracing::trace!(sql = %statement.sql, "Executing join row DELETE");
            router.execute(op.entity(), &statement)?;
            result.unlinked += 1;
        }
        for op in &self.links {
            let statement = op.to_statement(dialect);
            tracing::trace!(sql = %statement.sql, "Executing join row INSERT");
            router.execute(op.entity(), &statement)?;
            result.linked += 1;
        }
        for op in &self.deletes {
            Self::execute_op(schema, dialect, router, op)?;
            result.deleted += 1;
        }

        tracing::info!(
            elapsed_ms = start.elapsed().as_millis(),
            inserted = result.inserted,
            updated = result.updated,
            deleted = result.deleted,
            linked = result.linked,
            unlinked = result.unlinked,
            "Flush complete"
        );
        Ok(result)
    }

    fn execute_op(
        schema: &Schema,
        dialect: Dialect,
        router: &mut dyn StatementRouter,
        op: &PendingOp,
    ) -> Result<()> {
        let statement = op.to_statement(dialect);
        tracing::debug!(table = op.table(), kind = %statement.kind, sql = %statement.sql, "Executing statement");
        let count = router.execute(op.entity(), &statement)?;

        match op {
            PendingOp::Update {
                id,
                entity,
                qualifier,
                pk_columns,
                optimistic,
                ..
            }
            | PendingOp::Delete {
                id,
                entity,
                qualifier,
                pk_columns,
                optimistic,
                ..
            } if count == 0 => {
                if *optimistic {
                    let root = schema.root_entity(entity)?;
                    return Err(OptimisticLockFailure::new(
                        id.clone(),
                        root.name.clone(),
                        statement.sql,
                        qualifier.clone(),
                        pk_columns.clone(),
                    )
                    .into());
                }
                tracing::warn!(id = %id, sql = %statement.sql, "Statement matched no row");
            }
            _ => {}
        }
        Ok(())
    }
}

/// Counts of executed operations.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushResult {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub linked: usize,
    pub unlinked: usize,
}

impl FlushResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted + self.linked + self.unlinked
    }
}

fn pk_qualifier(id: &ObjectId) -> DataRow {
    id.pk_values()
        .iter()
        .map(|(column, value)| (column.clone(), value.clone()))
        .collect()
}

/// Primary key plus the confirmed values of the locking attributes.
fn lock_qualifier(store: &ObjectStore, descriptor: &EntityDescriptor, id: &ObjectId) -> Result<DataRow> {
    let mut qualifier = pk_qualifier(id);
    if descriptor.lock_type != LockType::Optimistic {
        return Ok(qualifier);
    }
    let object = store
        .get(id)
        .ok_or_else(|| Error::state(Some(id.to_string()), "object is not registered"))?;
    let diff = store.diff(id);
    let snapshot = store.snapshot(id);
    for attribute in descriptor.locking_attributes() {
        let expected = diff
            .and_then(|d| d.attribute_snapshot(&attribute.name))
            .or_else(|| snapshot.and_then(|s| s.get(&attribute.column)))
            .or_else(|| object.value(&attribute.name))
            .cloned()
            .unwrap_or(Value::Null);
        qualifier.insert(attribute.column.clone(), expected);
    }
    Ok(qualifier)
}

/// Build the operations for every NEW, MODIFIED and DELETED object in
/// `store`, plus the join table rows of `indirect`.
///
/// Ids must already be permanent; `id_map` translates the temporary ids
/// recorded in `indirect`.
#[tracing::instrument(level = "debug", skip_all)]
pub fn build_plan(
    store: &ObjectStore,
    indirect: &IndirectChanges,
    id_map: &HashMap<ObjectId, ObjectId>,
    orderer: &FlushOrderer,
) -> Result<FlushPlan> {
    let schema = store.schema();
    let mut ops = Vec::new();

    for id in store.ids_in_state(PersistenceState::New) {
        let descriptor = schema.entity(id.entity_name())?;
        ops.push(PendingOp::Insert {
            values: store.current_row(&id)?,
            entity: descriptor.name.clone(),
            table: descriptor.table.clone(),
            id,
        });
    }

    for id in store.ids_in_state(PersistenceState::Modified) {
        let descriptor = schema.entity(id.entity_name())?;
        let current = store.current_row(&id)?;
        let mut values = DataRow::new();
        if let Some(diff) = store.diff(&id) {
            for (name, _) in diff.changed_attributes() {
                if let Some(attribute) = descriptor.attribute(name) {
                    if let Some(value) = current.get(&attribute.column) {
                        values.insert(attribute.column.clone(), value.clone());
                    }
                }
            }
            for (name, _) in diff.changed_arcs() {
                let Some(relationship) = descriptor.relationship(name) else {
                    continue;
                };
                if relationship.is_flattened() || relationship.to_dependent_pk {
                    continue;
                }
                for join in &relationship.joins {
                    if let Some(value) = current.get(&join.source) {
                        values.insert(join.source.clone(), value.clone());
                    }
                }
            }
        }
        if values.is_empty() {
            tracing::trace!(id = %id, "No column changes, skipping UPDATE");
            continue;
        }
        ops.push(PendingOp::Update {
            qualifier: lock_qualifier(store, descriptor, &id)?,
            values,
            entity: descriptor.name.clone(),
            table: descriptor.table.clone(),
            pk_columns: descriptor.pk_columns().into_iter().map(str::to_string).collect(),
            optimistic: descriptor.lock_type == LockType::Optimistic,
            id,
        });
    }

    let mut link_ops = Vec::new();
    let deleted = store.ids_in_state(PersistenceState::Deleted);
    for id in &deleted {
        let descriptor = schema.entity(id.entity_name())?;
        for relationship in descriptor
            .relationships
            .iter()
            .filter(|r| r.is_flattened() && !r.read_only)
        {
            if let Some(link) = &relationship.link_table {
                link_ops.push(LinkTableOp::Unlink {
                    table: link.table_name.clone(),
                    entity: descriptor.name.clone(),
                    values: link.local_values(id)?.into_iter().collect(),
                });
            }
        }
        ops.push(PendingOp::Delete {
            qualifier: lock_qualifier(store, descriptor, id)?,
            entity: descriptor.name.clone(),
            table: descriptor.table.clone(),
            pk_columns: descriptor.pk_columns().into_iter().map(str::to_string).collect(),
            optimistic: descriptor.lock_type == LockType::Optimistic,
            id: id.clone(),
        });
    }

    let resolve = |id: &ObjectId| id_map.get(id).cloned().unwrap_or_else(|| id.clone());
    // An end still temporary after id assignment never reached the database.
    let unsaved =
        |source: &ObjectId, target: &ObjectId| source.is_temporary() || target.is_temporary();
    for key in &indirect.flattened_deletes {
        let source = resolve(key.source());
        let target = resolve(key.target());
        if unsaved(&source, &target) {
            tracing::debug!(source = %source, target = %target, "Dropping join row delete of unsaved object");
            continue;
        }
        if deleted.contains(&source) {
            // Covered by the blanket unlink above.
            continue;
        }
        link_ops.push(LinkTableOp::unlink(key, &source, &target, schema)?);
    }
    for key in &indirect.flattened_inserts {
        let source = resolve(key.source());
        let target = resolve(key.target());
        let gone = |id: &ObjectId| {
            matches!(
                store.state(id),
                PersistenceState::Deleted | PersistenceState::Transient
            )
        };
        // A target fetched elsewhere may legitimately be unregistered here.
        if unsaved(&source, &target)
            || gone(&source)
            || store.state(&target) == PersistenceState::Deleted
        {
            tracing::debug!(source = %source, target = %target, "Dropping join row of deleted object");
            continue;
        }
        link_ops.push(LinkTableOp::link(key, &source, &target, schema)?);
    }

    let plan = orderer.order(ops, link_ops);
    tracing::debug!(operations = plan.len(), "Built flush plan");
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indirect::classify;
    use relmap_core::{AttributeInfo, LinkTableInfo, RelationshipInfo};
    use std::sync::Arc;

    fn schema() -> Arc<Schema> {
        Arc::new(
            Schema::new()
                .with_entity(
                    EntityDescriptor::new("Artist", "ARTIST")
                        .with_attribute(AttributeInfo::new("id", "ID").primary_key())
                        .with_attribute(AttributeInfo::new("name", "NAME"))
                        .with_relationship(
                            RelationshipInfo::one_to_many("paintings", "Painting")
                                .join("ID", "ARTIST_ID"),
                        )
                        .with_relationship(RelationshipInfo::many_to_many(
                            "groups",
                            "ArtGroup",
                            LinkTableInfo::new("ARTIST_GROUP", "ARTIST_ID", "GROUP_ID"),
                        )),
                )
                .with_entity(
                    EntityDescriptor::new("Painting", "PAINTING")
                        .with_attribute(AttributeInfo::new("id", "ID").primary_key())
                        .with_attribute(AttributeInfo::new("title", "TITLE"))
                        .with_attribute(AttributeInfo::new("version", "VERSION").used_for_locking())
                        .with_relationship(
                            RelationshipInfo::many_to_one("artist", "Artist").join("ARTIST_ID", "ID"),
                        )
                        .optimistic_locking(),
                )
                .with_entity(
                    EntityDescriptor::new("ArtGroup", "ARTGROUP")
                        .with_attribute(AttributeInfo::new("id", "GROUP_ID").primary_key()),
                ),
        )
    }

    fn make_insert(entity: &str, pk: i32) -> PendingOp {
        PendingOp::Insert {
            id: ObjectId::single(entity, "ID", pk),
            entity: entity.to_string(),
            table: entity.to_uppercase(),
            values: DataRow::new().with("ID", pk).with("NAME", "Test"),
        }
    }

    fn make_delete(entity: &str, pk: i32) -> PendingOp {
        PendingOp::Delete {
            id: ObjectId::single(entity, "ID", pk),
            entity: entity.to_string(),
            table: entity.to_uppercase(),
            qualifier: DataRow::new().with("ID", pk),
            pk_columns: vec!["ID".to_string()],
            optimistic: false,
        }
    }

    #[derive(Default)]
    struct Recorder {
        statements: Vec<(String, Statement)>,
        /// Row count returned for UPDATE and DELETE statements.
        matched: u64,
    }

    impl StatementRouter for Recorder {
        fn execute(&mut self, entity: &str, statement: &Statement) -> Result<u64> {
            self.statements.push((entity.to_string(), statement.clone()));
            Ok(match statement.kind {
                StatementKind::Insert => 1,
                _ => self.matched,
            })
        }
    }

    #[test]
    fn pending_op_accessors() {
        let insert = make_insert("Artist", 1);
        assert_eq!(insert.table(), "ARTIST");
        assert_eq!(insert.entity(), "Artist");
        assert!(insert.is_insert());
        assert!(!insert.is_delete());
        assert!(make_delete("Artist", 1).is_delete());
    }

    #[test]
    fn insert_statement_binds_all_columns() {
        let statement = make_insert("Artist", 1).to_statement(Dialect::Postgres);
        assert_eq!(
            statement.sql,
            "INSERT INTO \"ARTIST\" (\"ID\", \"NAME\") VALUES ($1, $2)"
        );
        assert_eq!(statement.params, vec![Value::Int(1), Value::from("Test")]);
        assert_eq!(statement.kind, StatementKind::Insert);
    }

    #[test]
    fn update_renders_null_expectation_as_is_null() {
        let op = PendingOp::Update {
            id: ObjectId::single("Painting", "ID", 1),
            entity: "Painting".to_string(),
            table: "PAINTING".to_string(),
            values: DataRow::new().with("TITLE", "Lilies"),
            qualifier: DataRow::new().with("ID", 1).with("VERSION", Value::Null),
            pk_columns: vec!["ID".to_string()],
            optimistic: true,
        };
        let statement = op.to_statement(Dialect::Sqlite);
        assert_eq!(
            statement.sql,
            "UPDATE \"PAINTING\" SET \"TITLE\" = ?1 WHERE \"ID\" = ?2 AND \"VERSION\" IS NULL"
        );
        assert_eq!(statement.params.len(), 2);
        assert_eq!(statement.qualifier.get("VERSION"), Some(&Value::Null));
    }

    #[test]
    fn orderer_sorts_by_dependency_depth() {
        let orderer = FlushOrderer::from_schema(&schema()).unwrap();
        assert_eq!(orderer.dependency_depth("Painting"), 1);
        assert_eq!(orderer.dependency_depth("Artist"), 0);

        let plan = orderer.order(
            vec![
                make_insert("Painting", 1),
                make_insert("Artist", 1),
                make_delete("Artist", 2),
                make_delete("Painting", 2),
            ],
            Vec::new(),
        );
        assert_eq!(plan.inserts[0].entity(), "Artist");
        assert_eq!(plan.inserts[1].entity(), "Painting");
        assert_eq!(plan.deletes[0].entity(), "Painting");
        assert_eq!(plan.deletes[1].entity(), "Artist");
    }

    #[test]
    fn dependency_cycles_terminate() {
        let mut orderer = FlushOrderer::new();
        orderer.register_entity("A", vec!["B".to_string()]);
        orderer.register_entity("B", vec!["A".to_string()]);
        assert!(orderer.dependency_depth("A") <= 2);
    }

    #[test]
    fn orderer_rejects_inheritance_cycles() {
        let schema = Schema::new()
            .with_entity(EntityDescriptor::new("A", "A").inherits("B"))
            .with_entity(EntityDescriptor::new("B", "B").inherits("A"));
        assert!(matches!(
            FlushOrderer::from_schema(&schema),
            Err(Error::Mapping(ref e)) if e.kind == relmap_core::error::MappingErrorKind::InheritanceCycle
        ));
    }

    #[test]
    fn flush_plan_len() {
        let plan = FlushPlan {
            inserts: vec![make_insert("Artist", 1), make_insert("Artist", 2)],
            deletes: vec![make_delete("Artist", 3)],
            ..FlushPlan::default()
        };
        assert!(!plan.is_empty());
        assert_eq!(plan.len(), 3);
        assert!(FlushPlan::new().is_empty());
    }

    #[test]
    fn flush_result_total() {
        let result = FlushResult {
            inserted: 5,
            updated: 3,
            deleted: 2,
            linked: 1,
            unlinked: 1,
        };
        assert_eq!(result.total(), 12);
        assert_eq!(FlushResult::new().total(), 0);
    }

    #[test]
    fn zero_rows_on_locked_update_is_lock_failure() {
        let schema = schema();
        let op = PendingOp::Update {
            id: ObjectId::single("Painting", "ID", 1),
            entity: "Painting".to_string(),
            table: "PAINTING".to_string(),
            values: DataRow::new().with("TITLE", "Lilies"),
            qualifier: DataRow::new().with("ID", 1).with("VERSION", 1),
            pk_columns: vec!["ID".to_string()],
            optimistic: true,
        };
        let plan = FlushPlan {
            updates: vec![op],
            ..FlushPlan::default()
        };

        let mut router = Recorder::default();
        let err = plan.execute(&schema, Dialect::Postgres, &mut router).unwrap_err();
        let failure = err.as_optimistic_lock().expect("lock failure");
        assert_eq!(failure.root_entity(), "Painting");
        assert_eq!(failure.qualifier().get("VERSION"), Some(&Value::Int(1)));
        assert_eq!(failure.primary_key().columns(), &["ID".to_string()]);

        router.matched = 1;
        let result = plan.execute(&schema, Dialect::Postgres, &mut router).unwrap();
        assert_eq!(result.updated, 1);
    }

    #[test]
    fn execution_order_and_routing() {
        let schema = schema();
        let plan = FlushPlan {
            inserts: vec![make_insert("Artist", 1)],
            unlinks: vec![LinkTableOp::Unlink {
                table: "ARTIST_GROUP".to_string(),
                entity: "Artist".to_string(),
                values: DataRow::new().with("ARTIST_ID", 2),
            }],
            links: vec![LinkTableOp::Link {
                table: "ARTIST_GROUP".to_string(),
                entity: "Artist".to_string(),
                values: DataRow::new().with("ARTIST_ID", 1).with("GROUP_ID", 7),
            }],
            deletes: vec![make_delete("Artist", 2)],
            ..FlushPlan::default()
        };
        let mut router = Recorder {
            matched: 1,
            ..Recorder::default()
        };
        let result = plan.execute(&schema, Dialect::Postgres, &mut router).unwrap();
        assert_eq!(result.total(), 4);

        let tables: Vec<(&str, StatementKind)> = router
            .statements
            .iter()
            .map(|(_, s)| (s.table.as_str(), s.kind))
            .collect();
        assert_eq!(
            tables,
            vec![
                ("ARTIST", StatementKind::Insert),
                ("ARTIST_GROUP", StatementKind::Delete),
                ("ARTIST_GROUP", StatementKind::Insert),
                ("ARTIST", StatementKind::Delete),
            ]
        );
        assert!(router.statements.iter().all(|(entity, _)| entity == "Artist"));
    }

    #[test]
    fn plan_from_store_uses_confirmed_lock_values() {
        let schema = schema();
        let mut store = ObjectStore::new(Arc::clone(&schema));
        let painting = store
            .register_snapshot(
                "Painting",
                &DataRow::new()
                    .with("ID", 1)
                    .with("TITLE", "Lilies")
                    .with("VERSION", 1)
                    .with("ARTIST_ID", 3),
            )
            .unwrap();
        store.set_value(&painting, "title", "Water Lilies").unwrap();
        store.set_value(&painting, "version", 2).unwrap();

        let orderer = FlushOrderer::from_schema(&schema).unwrap();
        let plan = build_plan(&store, &IndirectChanges::default(), &HashMap::new(), &orderer).unwrap();
        assert_eq!(plan.updates.len(), 1);
        let PendingOp::Update {
            values, qualifier, ..
        } = &plan.updates[0]
        else {
            panic!("expected update");
        };
        assert_eq!(values.get("TITLE"), Some(&Value::from("Water Lilies")));
        assert_eq!(values.get("VERSION"), Some(&Value::Int(2)));
        assert_eq!(values.get("ARTIST_ID"), None);
        assert_eq!(qualifier.get("ID"), Some(&Value::Int(1)));
        assert_eq!(qualifier.get("VERSION"), Some(&Value::Int(1)));
    }

    #[test]
    fn plan_links_new_objects_through_id_map() {
        let schema = schema();
        let mut store = ObjectStore::new(Arc::clone(&schema));
        let artist = store.register_new("Artist").unwrap();
        let group = ObjectId::single("ArtGroup", "GROUP_ID", 7);
        store.add_to_many(&artist, "groups", &group).unwrap();

        let indirect = classify(store.changes().events(), &schema).unwrap();
        let permanent = ObjectId::single("Artist", "ID", 5);
        store.set_value(&artist, "id", 5).unwrap();
        store.process_id_change(&artist, &permanent).unwrap();
        let id_map: HashMap<ObjectId, ObjectId> = [(artist, permanent)].into_iter().collect();

        let orderer = FlushOrderer::from_schema(&schema).unwrap();
        let plan = build_plan(&store, &indirect, &id_map, &orderer).unwrap();
        assert_eq!(plan.inserts.len(), 1);
        assert_eq!(plan.links.len(), 1);
        let LinkTableOp::Link { values, table, .. } = &plan.links[0] else {
            panic!("expected link");
        };
        assert_eq!(table, "ARTIST_GROUP");
        assert_eq!(values.get("ARTIST_ID"), Some(&Value::Int(5)));
        assert_eq!(values.get("GROUP_ID"), Some(&Value::Int(7)));
    }

    #[test]
    fn join_rows_of_unsaved_objects_are_dropped() {
        let schema = schema();
        let store = ObjectStore::new(Arc::clone(&schema));
        let artist = ObjectId::single("Artist", "ID", 1);
        let unsaved = ObjectId::temporary("ArtGroup");
        let indirect = IndirectChanges {
            indirect: vec![artist.clone()],
            flattened_inserts: vec![FlattenedArcKey::new(artist.clone(), unsaved.clone(), "groups")],
            flattened_deletes: vec![FlattenedArcKey::new(artist, unsaved, "groups")],
        };

        let orderer = FlushOrderer::from_schema(&schema).unwrap();
        let plan = build_plan(&store, &indirect, &HashMap::new(), &orderer).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn deleted_object_unlinks_its_join_rows() {
        let schema = schema();
        let mut store = ObjectStore::new(Arc::clone(&schema));
        let artist = store
            .register_snapshot("Artist", &DataRow::new().with("ID", 4).with("NAME", "Monet"))
            .unwrap();
        store.delete_object(&artist).unwrap();

        let orderer = FlushOrderer::from_schema(&schema).unwrap();
        let plan = build_plan(&store, &IndirectChanges::default(), &HashMap::new(), &orderer).unwrap();
        assert_eq!(plan.deletes.len(), 1);
        let ops: Vec<&LinkTableOp> = plan.link_ops_for("ARTIST_GROUP").collect();
        assert_eq!(ops.len(), 1);
        assert!(ops[0].is_unlink());
        let statement = ops[0].to_statement(Dialect::Postgres);
        assert_eq!(statement.sql, "DELETE FROM \"ARTIST_GROUP\" WHERE \"ARTIST_ID\" = $1");
    }
}
