//! Object context: the unit of work over a data domain.
//!
//! An [`ObjectContext`] registers fetched rows as objects, tracks edits in its
//! [`ObjectStore`] and writes them back in one transaction on
//! [`commit_changes`](ObjectContext::commit_changes).

use crate::config::ContextConfig;
use crate::domain::DataDomain;
use crate::flush::{FlushOrderer, FlushResult, StatementRouter, build_plan};
use crate::indirect::{IndirectChanges, classify};
use crate::store::ObjectStore;
use crate::transaction::TransactionCoordinator;
use relmap_core::error::{MappingError, MappingErrorKind};
use relmap_core::{
    DataNode, DataRow, EntityDescriptor, Error, ObjectId, OptimisticLockFailure,
    PersistenceState, Result, Schema, SnapshotFetcher, Statement, Value,
};
use relmap_query::{CompiledExpression, EvalSubject, Expression, PropertyAccess, SelectQuery};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Outcome of a successful commit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitResult {
    pub flush: FlushResult,
    /// Temporary ids replaced by permanent ones.
    pub id_map: HashMap<ObjectId, ObjectId>,
    /// Objects whose relationships changed without a row update of their own.
    pub indirectly_modified: Vec<ObjectId>,
}

/// Routes flush statements to the enlisted connection of each entity's node.
struct NodeRouter<'t, 'a> {
    transaction: &'t mut TransactionCoordinator<'a, dyn DataNode>,
    entity_nodes: &'t HashMap<String, usize>,
    slots: &'t HashMap<usize, usize>,
}

impl StatementRouter for NodeRouter<'_, '_> {
    fn execute(&mut self, entity: &str, statement: &Statement) -> Result<u64> {
        let slot = self
            .entity_nodes
            .get(entity)
            .and_then(|node| self.slots.get(node))
            .copied()
            .ok_or_else(|| Error::state(None, format!("no connection enlisted for '{entity}'")))?;
        let node = self
            .transaction
            .connection_mut(slot)
            .ok_or_else(|| Error::state(None, format!("no connection at slot {slot}")))?;
        node.execute(statement)
    }
}

/// A unit of work over the objects of one data domain.
#[derive(Debug)]
pub struct ObjectContext {
    domain: DataDomain,
    store: ObjectStore,
    config: ContextConfig,
    orderer: FlushOrderer,
}

impl ObjectContext {
    pub fn new(domain: DataDomain) -> Result<Self> {
        Self::with_config(domain, ContextConfig::default())
    }

    pub fn with_config(domain: DataDomain, config: ContextConfig) -> Result<Self> {
        let schema = Arc::clone(domain.schema());
        let orderer = FlushOrderer::from_schema(&schema)?;
        Ok(Self {
            store: ObjectStore::with_config(schema, &config),
            domain,
            config,
            orderer,
        })
    }

    pub fn schema(&self) -> &Schema {
        self.domain.schema()
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    /// Direct access to the store, e.g. to feed it external snapshot events.
    pub fn store_mut(&mut self) -> &mut ObjectStore {
        &mut self.store
    }

    pub fn domain_mut(&mut self) -> &mut DataDomain {
        &mut self.domain
    }

    pub fn state(&self, id: &ObjectId) -> PersistenceState {
        self.store.state(id)
    }

    pub fn has_changes(&self) -> bool {
        self.store.has_changes()
    }

    // ---- fetching -----------------------------------------------------

    /// Run `query` and register every returned row.
    #[tracing::instrument(level = "debug", skip(self, query), fields(entity = %query.entity()))]
    pub fn fetch(&mut self, query: &SelectQuery) -> Result<Vec<ObjectId>> {
        let statement = query.build(self.domain.schema(), self.config.dialect)?;
        let rows = self.domain.node_mut(query.entity())?.select(&statement)?;
        tracing::debug!(rows = rows.len(), "Fetched rows");
        rows.iter()
            .map(|row| self.store.register_snapshot(query.entity(), row))
            .collect()
    }

    /// Fetch one object by id, registering it.
    ///
    /// Returns `None` if the row does not exist.
    pub fn fetch_by_id(&mut self, id: &ObjectId) -> Result<Option<ObjectId>> {
        let key: DataRow = id
            .pk_values()
            .iter()
            .map(|(column, value)| (column.clone(), value.clone()))
            .collect();
        match self.fetch_snapshot(id.entity_name(), &key)? {
            Some(row) => Ok(Some(self.store.register_snapshot(id.entity_name(), &row)?)),
            None => Ok(None),
        }
    }

    /// Resolve a HOLLOW object by fetching its row.
    ///
    /// An object whose row is gone is dropped from the store.
    pub fn resolve(&mut self, id: &ObjectId) -> Result<()> {
        if self.store.state(id) != PersistenceState::Hollow {
            return Ok(());
        }
        tracing::trace!(id = %id, "Resolving hollow object");
        if self.fetch_by_id(id)?.is_none() {
            self.store.process_deleted_id(id)?;
            return Err(Error::Query(relmap_core::error::QueryError {
                kind: relmap_core::error::QueryErrorKind::NotFound,
                sql: None,
                message: format!("no row found for {id}"),
                source: None,
            }));
        }
        Ok(())
    }

    /// Pass the current database row of a lock failure's object.
    pub fn fetch_current_snapshot(&mut self, failure: &OptimisticLockFailure) -> Result<Option<DataRow>> {
        failure.fetch_current_snapshot(self)
    }

    // ---- editing ------------------------------------------------------

    /// Create a NEW object of `entity`.
    pub fn create(&mut self, entity: &str) -> Result<ObjectId> {
        self.store.register_new(entity)
    }

    /// Current value of an attribute, resolving a HOLLOW object first.
    pub fn value(&mut self, id: &ObjectId, attribute: &str) -> Result<Value> {
        self.resolve(id)?;
        let descriptor = self.schema().entity(id.entity_name())?;
        if descriptor.attribute(attribute).is_none() {
            return Err(Error::unknown_attribute(id.entity_name(), attribute));
        }
        let object = self
            .store
            .get(id)
            .ok_or_else(|| Error::state(Some(id.to_string()), "object is not registered"))?;
        Ok(object.value(attribute).cloned().unwrap_or(Value::Null))
    }

    pub fn set_value(&mut self, id: &ObjectId, attribute: &str, value: impl Into<Value>) -> Result<()> {
        self.resolve(id)?;
        self.store.set_value(id, attribute, value)
    }

    pub fn to_one(&mut self, id: &ObjectId, relationship: &str) -> Result<Option<ObjectId>> {
        self.resolve(id)?;
        self.store.to_one_target(id, relationship)
    }

    pub fn set_to_one(
        &mut self,
        id: &ObjectId,
        relationship: &str,
        target: Option<&ObjectId>,
    ) -> Result<()> {
        self.resolve(id)?;
        if let Some(target) = target {
            self.resolve_if_registered(target)?;
        }
        self.store.set_to_one(id, relationship, target)
    }

    pub fn add_to_many(&mut self, id: &ObjectId, relationship: &str, target: &ObjectId) -> Result<()> {
        self.resolve(id)?;
        self.resolve_if_registered(target)?;
        self.store.add_to_many(id, relationship, target)
    }

    pub fn remove_to_many(&mut self, id: &ObjectId, relationship: &str, target: &ObjectId) -> Result<()> {
        self.resolve(id)?;
        self.resolve_if_registered(target)?;
        self.store.remove_to_many(id, relationship, target)
    }

    pub fn delete(&mut self, id: &ObjectId) -> Result<()> {
        self.store.delete_object(id)
    }

    fn resolve_if_registered(&mut self, id: &ObjectId) -> Result<()> {
        if self.store.contains(id) {
            self.resolve(id)?;
        }
        Ok(())
    }

    // ---- in-memory queries --------------------------------------------

    /// Whether the object at `id` matches `qualifier`.
    pub fn matches(&self, id: &ObjectId, qualifier: &Expression) -> Result<bool> {
        let view = self.store.view(id);
        CompiledExpression::compile(qualifier).matches(&view as &dyn PropertyAccess)
    }

    /// Registered objects among `ids` that match `qualifier`.
    pub fn filter(&self, ids: &[ObjectId], qualifier: &Expression) -> Vec<ObjectId> {
        let compiled = CompiledExpression::compile(qualifier);
        let views: Vec<_> = ids.iter().map(|id| self.store.view(id)).collect();
        compiled
            .filter(&views, |view| EvalSubject::Object(view))
            .into_iter()
            .map(|view| view.id().clone())
            .collect()
    }

    // ---- commit and rollback ------------------------------------------

    /// Write all changes in one transaction.
    ///
    /// On success NEW and MODIFIED objects become COMMITTED and DELETED ones
    /// are dropped. On failure the transaction is rolled back and the objects
    /// keep their uncommitted state, so the commit can be retried.
    #[tracing::instrument(level = "info", skip(self))]
    pub fn commit_changes(&mut self) -> Result<CommitResult> {
        let reverted = self.store.revert_noop_changes();
        if reverted > 0 {
            tracing::debug!(reverted, "Reverted objects whose edits cancelled out");
        }
        if !self.store.has_changes() {
            tracing::debug!("Nothing to commit");
            return Ok(CommitResult::default());
        }

        let schema = Arc::clone(self.domain.schema());
        let indirect = classify(self.store.changes().events(), &schema)?;

        let mut id_map = HashMap::new();
        let flushed = self
            .assign_permanent_ids(&schema, &mut id_map)
            .and_then(|()| self.flush(&schema, &indirect, &id_map));
        let flush = match flushed {
            Ok(flush) => flush,
            Err(e) => {
                self.restore_temporary_ids(&id_map);
                tracing::warn!(error = %e, "Commit failed, keeping uncommitted changes");
                return Err(e);
            }
        };

        self.store.post_commit()?;
        tracing::info!(
            statements = flush.total(),
            new_ids = id_map.len(),
            indirect = indirect.indirect.len(),
            "Commit complete"
        );
        Ok(CommitResult {
            flush,
            id_map,
            indirectly_modified: indirect.indirect,
        })
    }

    /// Discard all uncommitted changes.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn rollback_changes(&mut self) {
        self.store.rollback_changes();
    }

    /// Give every NEW object with a temporary id its permanent id.
    ///
    /// Key values come from the primary key attributes when set, then from a
    /// master object the key depends on, and finally from the data node's
    /// key generator. Masters are processed before their dependents.
    fn assign_permanent_ids(
        &mut self,
        schema: &Schema,
        id_map: &mut HashMap<ObjectId, ObjectId>,
    ) -> Result<()> {
        let mut pending: Vec<ObjectId> = self
            .store
            .ids_in_state(PersistenceState::New)
            .into_iter()
            .filter(ObjectId::is_temporary)
            .collect();
        pending.sort_by_key(|id| self.orderer.dependency_depth(id.entity_name()));

        for temporary in pending {
            let descriptor = schema.entity(temporary.entity_name())?;
            let mut pk: Vec<(String, Value)> = Vec::new();
            for attribute in descriptor.attributes.iter().filter(|a| a.primary_key) {
                let assigned = self
                    .store
                    .get(&temporary)
                    .and_then(|o| o.value(&attribute.name))
                    .filter(|v| !v.is_null())
                    .cloned();
                let value = match assigned {
                    Some(value) => value,
                    None => match self.propagated_key(descriptor, &temporary, &attribute.column)? {
                        Some(value) => value,
                        None => self
                            .domain
                            .node_mut(&descriptor.name)?
                            .generate_primary_key(descriptor)?,
                    },
                };
                pk.push((attribute.column.clone(), value));
            }
            if pk.is_empty() {
                return Err(Error::Mapping(MappingError {
                    kind: MappingErrorKind::MissingPrimaryKey,
                    entity: descriptor.name.clone(),
                    name: None,
                    message: format!("entity '{}' has no primary key attribute", descriptor.name),
                }));
            }

            let permanent = temporary.to_permanent(pk);
            tracing::trace!(old = %temporary, new = %permanent, "Assigning permanent id");
            self.store.assign_permanent_id(&temporary, &permanent)?;
            id_map.insert(temporary, permanent);
        }
        Ok(())
    }

    /// Key value of `column` taken from a to-one master whose key it copies.
    fn propagated_key(
        &self,
        descriptor: &EntityDescriptor,
        id: &ObjectId,
        column: &str,
    ) -> Result<Option<Value>> {
        for relationship in descriptor
            .relationships
            .iter()
            .filter(|r| !r.is_to_many() && !r.is_flattened())
        {
            let Some(join) = relationship.joins.iter().find(|j| j.source == column) else {
                continue;
            };
            if let Some(master) = self.store.to_one_target(id, &relationship.name)? {
                if let Some(value) = master.pk_value(&join.target) {
                    return Ok(Some(value.clone()));
                }
            }
        }
        Ok(None)
    }

    fn restore_temporary_ids(&mut self, id_map: &HashMap<ObjectId, ObjectId>) {
        for (temporary, permanent) in id_map {
            if let Err(e) = self.store.process_id_change(permanent, temporary) {
                tracing::warn!(id = %permanent, error = %e, "Failed to restore temporary id");
            }
        }
    }

    /// Plan the flush and run it in a transaction over the participating nodes.
    fn flush(
        &mut self,
        schema: &Schema,
        indirect: &IndirectChanges,
        id_map: &HashMap<ObjectId, ObjectId>,
    ) -> Result<FlushResult> {
        let plan = build_plan(&self.store, indirect, id_map, &self.orderer)?;
        if plan.is_empty() {
            tracing::debug!("Flush plan is empty");
            return Ok(FlushResult::default());
        }

        let entities: BTreeSet<&str> = plan
            .inserts
            .iter()
            .chain(&plan.updates)
            .chain(&plan.deletes)
            .map(|op| op.entity())
            .chain(plan.links.iter().chain(&plan.unlinks).map(|op| op.entity()))
            .collect();
        let mut entity_nodes = HashMap::new();
        for entity in entities {
            entity_nodes.insert(entity.to_string(), self.domain.node_index(entity)?);
        }
        let participating: BTreeSet<usize> = entity_nodes.values().copied().collect();

        let dialect = self.config.dialect;
        let mut coordinator: TransactionCoordinator<'_, dyn DataNode> =
            TransactionCoordinator::new(self.config.transaction_mode);
        let mut slots = HashMap::new();
        for (index, node) in self.domain.nodes_mut() {
            if participating.contains(&index) {
                slots.insert(index, coordinator.enlist(node)?);
            }
        }

        coordinator.perform(|transaction| {
            let mut router = NodeRouter {
                transaction,
                entity_nodes: &entity_nodes,
                slots: &slots,
            };
            plan.execute(schema, dialect, &mut router)
        })
    }
}

impl SnapshotFetcher for ObjectContext {
    fn fetch_snapshot(&mut self, entity: &str, primary_key: &DataRow) -> Result<Option<DataRow>> {
        let statement =
            SelectQuery::by_primary_key(entity, primary_key).build(self.domain.schema(), self.config.dialect)?;
        let mut rows = self.domain.node_mut(entity)?.select(&statement)?;
        if rows.len() > 1 {
            return Err(Error::Query(relmap_core::error::QueryError {
                kind: relmap_core::error::QueryErrorKind::RowCount,
                sql: Some(statement.sql),
                message: format!("expected at most one row of '{entity}', got {}", rows.len()),
                source: None,
            }));
        }
        Ok(rows.pop())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::TransactionMode;
    use relmap_core::{
        AttributeInfo, LinkTableInfo, RelationshipInfo, RowSource, StatementExecutor,
        StatementKind, TransactionalConnection,
    };
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Records statements and serves canned rows.
    #[derive(Default)]
    struct Shared {
        rows: Vec<DataRow>,
        executed: Vec<Statement>,
        log: Vec<String>,
        /// Row count returned for UPDATE and DELETE.
        matched: u64,
        next_key: i32,
    }

    struct ScriptedNode(Rc<RefCell<Shared>>);

    impl RowSource for ScriptedNode {
        fn select(&mut self, statement: &Statement) -> Result<Vec<DataRow>> {
            let shared = self.0.borrow();
            Ok(shared
                .rows
                .iter()
                .filter(|row| statement.qualifier.iter().all(|(c, v)| row.get(c) == Some(v)))
                .cloned()
                .collect())
        }
    }

    impl StatementExecutor for ScriptedNode {
        fn execute(&mut self, statement: &Statement) -> Result<u64> {
            let mut shared = self.0.borrow_mut();
            shared.executed.push(statement.clone());
            Ok(match statement.kind {
                StatementKind::Insert => 1,
                _ => shared.matched,
            })
        }

        fn generate_primary_key(&mut self, _entity: &EntityDescriptor) -> Result<Value> {
            let mut shared = self.0.borrow_mut();
            shared.next_key += 1;
            Ok(Value::Int(shared.next_key))
        }
    }

    impl TransactionalConnection for ScriptedNode {
        fn name(&self) -> &str {
            "scripted"
        }

        fn set_auto_commit(&mut self, _auto_commit: bool) -> Result<()> {
            Ok(())
        }

        fn commit(&mut self) -> Result<()> {
            self.0.borrow_mut().log.push("commit".to_string());
            Ok(())
        }

        fn rollback(&mut self) -> Result<()> {
            self.0.borrow_mut().log.push("rollback".to_string());
            Ok(())
        }
    }

    fn schema() -> Arc<Schema> {
        Arc::new(
            Schema::new()
                .with_entity(
                    EntityDescriptor::new("Artist", "ARTIST")
                        .with_attribute(AttributeInfo::new("id", "ID").primary_key())
                        .with_attribute(AttributeInfo::new("name", "NAME"))
                        .with_attribute(AttributeInfo::new("version", "VERSION").used_for_locking())
                        .with_relationship(
                            RelationshipInfo::one_to_many("paintings", "Painting")
                                .join("ID", "ARTIST_ID"),
                        )
                        .with_relationship(RelationshipInfo::many_to_many(
                            "groups",
                            "ArtGroup",
                            LinkTableInfo::new("ARTIST_GROUP", "ARTIST_ID", "GROUP_ID"),
                        ))
                        .optimistic_locking(),
                )
                .with_entity(
                    EntityDescriptor::new("Painting", "PAINTING")
                        .with_attribute(AttributeInfo::new("id", "ID").primary_key())
                        .with_attribute(AttributeInfo::new("title", "TITLE"))
                        .with_relationship(
                            RelationshipInfo::many_to_one("artist", "Artist").join("ARTIST_ID", "ID"),
                        ),
                )
                .with_entity(
                    EntityDescriptor::new("ArtGroup", "ARTGROUP")
                        .with_attribute(AttributeInfo::new("id", "GROUP_ID").primary_key())
                        .with_attribute(AttributeInfo::new("name", "NAME")),
                ),
        )
    }

    fn context(shared: &Rc<RefCell<Shared>>) -> ObjectContext {
        let domain =
            DataDomain::new(schema()).with_node(Box::new(ScriptedNode(Rc::clone(shared))));
        ObjectContext::new(domain).unwrap()
    }

    fn artist_row(id: i32, name: &str, version: i32) -> DataRow {
        DataRow::new()
            .with("ID", id)
            .with("NAME", name)
            .with("VERSION", version)
    }

    #[test]
    fn fetch_registers_committed_objects() {
        let shared = Rc::new(RefCell::new(Shared {
            rows: vec![artist_row(1, "Monet", 1), artist_row(2, "Manet", 1)],
            ..Shared::default()
        }));
        let mut ctx = context(&shared);
        let ids = ctx.fetch(&SelectQuery::new("Artist")).unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids.iter().all(|id| ctx.state(id) == PersistenceState::Committed));
        assert_eq!(ctx.value(&ids[0], "name").unwrap(), Value::from("Monet"));
    }

    #[test]
    fn hollow_objects_are_resolved_before_edits() {
        let shared = Rc::new(RefCell::new(Shared {
            rows: vec![artist_row(1, "Monet", 1)],
            ..Shared::default()
        }));
        let mut ctx = context(&shared);
        let artist = ctx
            .store_mut()
            .register_snapshot("Artist", &DataRow::new().with("ID", 1))
            .unwrap();
        assert_eq!(ctx.state(&artist), PersistenceState::Hollow);

        ctx.set_value(&artist, "name", "Claude Monet").unwrap();
        assert_eq!(ctx.state(&artist), PersistenceState::Modified);
        assert_eq!(ctx.value(&artist, "version").unwrap(), Value::Int(1));
    }

    #[test]
    fn resolving_a_vanished_row_drops_the_object() {
        let shared = Rc::new(RefCell::new(Shared::default()));
        let mut ctx = context(&shared);
        let artist = ctx
            .store_mut()
            .register_snapshot("Artist", &DataRow::new().with("ID", 9))
            .unwrap();
        let err = ctx.set_value(&artist, "name", "Nobody").unwrap_err();
        assert!(matches!(err, Error::Query(_)));
        assert_eq!(ctx.state(&artist), PersistenceState::Transient);
    }

    #[test]
    fn commit_inserts_with_generated_keys() {
        let shared = Rc::new(RefCell::new(Shared::default()));
        let mut ctx = context(&shared);
        let artist = ctx.create("Artist").unwrap();
        ctx.set_value(&artist, "name", "Monet").unwrap();
        let painting = ctx.create("Painting").unwrap();
        ctx.set_value(&painting, "title", "Lilies").unwrap();
        ctx.set_to_one(&painting, "artist", Some(&artist)).unwrap();

        let result = ctx.commit_changes().unwrap();
        assert_eq!(result.flush.inserted, 2);
        assert_eq!(result.id_map.len(), 2);

        let shared = shared.borrow();
        assert_eq!(shared.log, vec!["commit".to_string()]);
        assert_eq!(shared.executed[0].table, "ARTIST");
        assert_eq!(shared.executed[1].table, "PAINTING");
        let artist_id = shared.executed[0].values.get("ID").cloned();
        assert_eq!(shared.executed[1].values.get("ARTIST_ID").cloned(), artist_id);

        let permanent = &result.id_map[&artist];
        assert_eq!(ctx.state(permanent), PersistenceState::Committed);
        assert_eq!(ctx.state(&artist), PersistenceState::Transient);
        assert!(!ctx.has_changes());
    }

    #[test]
    fn lock_failure_rolls_back_and_keeps_changes() {
        let shared = Rc::new(RefCell::new(Shared {
            rows: vec![artist_row(1, "Monet", 1)],
            matched: 0,
            ..Shared::default()
        }));
        let mut ctx = context(&shared);
        let artist = ctx.fetch(&SelectQuery::new("Artist")).unwrap().remove(0);
        ctx.set_value(&artist, "name", "Claude Monet").unwrap();

        let err = ctx.commit_changes().unwrap_err();
        let failure = err.as_optimistic_lock().expect("lock failure");
        assert_eq!(failure.qualifier().get("VERSION"), Some(&Value::Int(1)));
        assert_eq!(shared.borrow().log, vec!["rollback".to_string()]);
        assert_eq!(ctx.state(&artist), PersistenceState::Modified);

        let current = ctx.fetch_current_snapshot(failure).unwrap().unwrap();
        assert_eq!(current.get("NAME"), Some(&Value::from("Monet")));
    }

    #[test]
    fn failed_commit_restores_temporary_ids() {
        let shared = Rc::new(RefCell::new(Shared {
            rows: vec![artist_row(1, "Monet", 1)],
            matched: 0,
            ..Shared::default()
        }));
        let mut ctx = context(&shared);
        let artist = ctx.fetch(&SelectQuery::new("Artist")).unwrap().remove(0);
        ctx.set_value(&artist, "name", "Claude Monet").unwrap();
        let painting = ctx.create("Painting").unwrap();
        ctx.set_value(&painting, "title", "Lilies").unwrap();

        assert!(ctx.commit_changes().is_err());
        assert_eq!(ctx.state(&painting), PersistenceState::New);
    }

    #[test]
    fn cancelled_edits_commit_nothing() {
        let shared = Rc::new(RefCell::new(Shared {
            rows: vec![artist_row(1, "Monet", 1)],
            ..Shared::default()
        }));
        let mut ctx = context(&shared);
        let artist = ctx.fetch(&SelectQuery::new("Artist")).unwrap().remove(0);
        ctx.set_value(&artist, "name", "Manet").unwrap();
        ctx.set_value(&artist, "name", "Monet").unwrap();

        let result = ctx.commit_changes().unwrap();
        assert_eq!(result.flush.total(), 0);
        assert!(shared.borrow().executed.is_empty());
        assert_eq!(ctx.state(&artist), PersistenceState::Committed);
    }

    #[test]
    fn rollback_discards_new_objects() {
        let shared = Rc::new(RefCell::new(Shared::default()));
        let mut ctx = context(&shared);
        let artist = ctx.create("Artist").unwrap();
        ctx.rollback_changes();
        assert_eq!(ctx.state(&artist), PersistenceState::Transient);
        assert!(!ctx.has_changes());
    }

    #[test]
    fn filter_reads_registered_objects() {
        let shared = Rc::new(RefCell::new(Shared {
            rows: vec![artist_row(1, "Monet", 1), artist_row(2, "Rembrandt", 1)],
            ..Shared::default()
        }));
        let mut ctx = context(&shared);
        let ids = ctx.fetch(&SelectQuery::new("Artist")).unwrap();
        let matched = ctx.filter(&ids, &Expression::path("name").like("M%").unwrap());
        assert_eq!(matched, vec![ObjectId::single("Artist", "ID", 1)]);
        assert!(ctx.matches(&ids[1], &Expression::path("name").eq("Rembrandt")).unwrap());
    }

    #[test]
    fn external_mode_leaves_transaction_to_the_caller() {
        let shared = Rc::new(RefCell::new(Shared::default()));
        let domain =
            DataDomain::new(schema()).with_node(Box::new(ScriptedNode(Rc::clone(&shared))));
        let mut ctx = ObjectContext::with_config(
            domain,
            ContextConfig::new().transaction_mode(TransactionMode::External),
        )
        .unwrap();
        let group = ctx.create("ArtGroup").unwrap();
        ctx.set_value(&group, "id", 3).unwrap();
        ctx.commit_changes().unwrap();

        let shared = shared.borrow();
        assert!(shared.log.is_empty());
        assert_eq!(shared.executed.len(), 1);
        assert_eq!(shared.executed[0].values.get("GROUP_ID"), Some(&Value::Int(3)));
    }
}
