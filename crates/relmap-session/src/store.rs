//! Identity map, snapshot cache and change recording for one context.
//!
//! The [`ObjectStore`] owns every registered [`PersistentObject`], the last
//! confirmed [`DataRow`] of each, the [`DiffStore`] and the [`ChangeLog`] of
//! graph edits since the last commit or rollback. All edits go through the
//! store so that diffs and graph events stay consistent with object values.

use crate::config::ContextConfig;
use crate::diff::{DiffStore, ObjectDiff};
use crate::graph::{ChangeLog, GraphChange};
use crate::merge::{force_merge_with_snapshot, refresh_object_with_snapshot, to_one_target};
use relmap_core::error::{MappingError, MappingErrorKind, ReadOnlyError};
use relmap_core::{
    DataRow, Error, ObjectId, PersistenceState, PersistentObject, RelationshipInfo,
    RelationshipValue, Result, Schema, Value,
};
use relmap_query::PropertyAccess;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

fn not_registered(id: &ObjectId) -> Error {
    Error::state(Some(id.to_string()), "object is not registered in this context")
}

fn unsupported(entity: &str, name: &str, message: String) -> Error {
    Error::Mapping(MappingError {
        kind: MappingErrorKind::Unsupported,
        entity: entity.to_string(),
        name: Some(name.to_string()),
        message,
    })
}

/// The relationship on the target entity that walks `relationship` backwards.
fn reverse_relationship<'s>(
    schema: &'s Schema,
    source_entity: &str,
    relationship: &RelationshipInfo,
) -> Result<Option<&'s RelationshipInfo>> {
    let target = schema.entity(&relationship.target_entity)?;
    let reverse = target.relationships.iter().find(|candidate| {
        if candidate.target_entity != source_entity {
            return false;
        }
        match (&relationship.link_table, &candidate.link_table) {
            (Some(link), Some(other)) => {
                link.table_name == other.table_name
                    && link.local_columns == other.remote_columns
                    && link.remote_columns == other.local_columns
            }
            (None, None) => {
                !relationship.joins.is_empty()
                    && candidate.joins.len() == relationship.joins.len()
                    && relationship.joins.iter().all(|join| {
                        candidate
                            .joins
                            .iter()
                            .any(|c| c.source == join.target && c.target == join.source)
                    })
            }
            _ => false,
        }
    });
    Ok(reverse)
}

/// Registered objects of one context and everything recorded about them.
#[derive(Debug)]
pub struct ObjectStore {
    schema: Arc<Schema>,
    objects: HashMap<ObjectId, PersistentObject>,
    snapshots: HashMap<ObjectId, DataRow>,
    diffs: DiffStore,
    changes: ChangeLog,
    merge_external_changes: bool,
    invalidate_to_many_on_refresh: bool,
}

impl ObjectStore {
    pub fn new(schema: Arc<Schema>) -> Self {
        Self::with_config(schema, &ContextConfig::default())
    }

    pub fn with_config(schema: Arc<Schema>, config: &ContextConfig) -> Self {
        Self {
            schema,
            objects: HashMap::new(),
            snapshots: HashMap::new(),
            diffs: DiffStore::new(),
            changes: ChangeLog::new(),
            merge_external_changes: config.merge_external_changes,
            invalidate_to_many_on_refresh: config.invalidate_to_many_on_refresh,
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn get(&self, id: &ObjectId) -> Option<&PersistentObject> {
        self.objects.get(id)
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.objects.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Lifecycle state of a registered object; TRANSIENT if unknown.
    pub fn state(&self, id: &ObjectId) -> PersistenceState {
        self.objects
            .get(id)
            .map_or(PersistenceState::Transient, PersistentObject::state)
    }

    /// Last confirmed snapshot of `id`.
    pub fn snapshot(&self, id: &ObjectId) -> Option<&DataRow> {
        self.snapshots.get(id)
    }

    pub fn diff(&self, id: &ObjectId) -> Option<&ObjectDiff> {
        self.diffs.get(id)
    }

    pub fn diffs(&self) -> &DiffStore {
        &self.diffs
    }

    pub fn changes(&self) -> &ChangeLog {
        &self.changes
    }

    /// Ids of objects in `state`, in a stable order.
    pub fn ids_in_state(&self, state: PersistenceState) -> Vec<ObjectId> {
        let mut ids: Vec<ObjectId> = self
            .objects
            .values()
            .filter(|o| o.state() == state)
            .map(|o| o.id().clone())
            .collect();
        ids.sort_by_cached_key(ToString::to_string);
        ids
    }

    /// Whether any object is NEW, MODIFIED or DELETED.
    pub fn has_changes(&self) -> bool {
        self.objects.values().any(|o| {
            matches!(
                o.state(),
                PersistenceState::New | PersistenceState::Modified | PersistenceState::Deleted
            )
        })
    }

    /// Read access to an object's properties by path.
    pub fn view<'a>(&'a self, id: &'a ObjectId) -> ObjectView<'a> {
        ObjectView { store: self, id }
    }

    // ---- registration -------------------------------------------------

    /// Register a new object of `entity` under a temporary id.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn register_new(&mut self, entity: &str) -> Result<ObjectId> {
        let schema = Arc::clone(&self.schema);
        let descriptor = schema.entity(entity)?;
        let id = ObjectId::temporary(entity);

        let mut object = PersistentObject::new(id.clone());
        object.set_state(PersistenceState::New);
        for relationship in &descriptor.relationships {
            let empty = if relationship.is_to_many() {
                RelationshipValue::ToMany(Vec::new())
            } else {
                RelationshipValue::ToOne(None)
            };
            object.set_relationship(relationship.name.clone(), empty);
        }

        self.objects.insert(id.clone(), object);
        self.changes.push(GraphChange::NodeCreated(id.clone()));
        Ok(id)
    }

    /// Register a fetched row of `entity` and return the object's id.
    ///
    /// Unknown rows become new objects. HOLLOW and COMMITTED objects are
    /// refreshed. Objects with uncommitted changes keep their in-memory state.
    /// The row always becomes the cached snapshot.
    #[tracing::instrument(level = "trace", skip(self, row))]
    pub fn register_snapshot(&mut self, entity: &str, row: &DataRow) -> Result<ObjectId> {
        let schema = Arc::clone(&self.schema);
        let descriptor = schema.entity(entity)?;
        let id = row.object_id(entity, &descriptor.pk_columns())?;

        match self.objects.get_mut(&id) {
            None => {
                let mut object = PersistentObject::hollow(id.clone());
                refresh_object_with_snapshot(&schema, &mut object, row, true)?;
                self.objects.insert(id.clone(), object);
            }
            Some(object) => match object.state() {
                PersistenceState::Hollow | PersistenceState::Committed => {
                    refresh_object_with_snapshot(
                        &schema,
                        object,
                        row,
                        self.invalidate_to_many_on_refresh,
                    )?;
                }
                _ => {
                    tracing::trace!(id = %id, state = %object.state(), "Keeping uncommitted object on fetch");
                }
            },
        }

        self.snapshots.insert(id.clone(), row.clone());
        Ok(id)
    }

    /// Remove an object from the store, returning it as TRANSIENT.
    pub fn unregister(&mut self, id: &ObjectId) -> Option<PersistentObject> {
        self.snapshots.remove(id);
        self.diffs.remove(id);
        let mut object = self.objects.remove(id)?;
        object.set_state(PersistenceState::Transient);
        tracing::trace!(id = %id, "Unregistered object");
        Some(object)
    }

    /// Replace a temporary id with its permanent one everywhere.
    #[tracing::instrument(level = "debug", skip(self), fields(old = %old, new = %new))]
    pub fn process_id_change(&mut self, old: &ObjectId, new: &ObjectId) -> Result<()> {
        let mut object = self.objects.remove(old).ok_or_else(|| not_registered(old))?;
        object.set_id(new.clone());
        self.objects.insert(new.clone(), object);
        if let Some(snapshot) = self.snapshots.remove(old) {
            self.snapshots.insert(new.clone(), snapshot);
        }
        self.diffs.rekey(old, new);
        for object in self.objects.values_mut() {
            object.replace_reference(old, new);
        }
        self.changes.push(GraphChange::NodeIdChanged {
            old: old.clone(),
            new: new.clone(),
        });
        Ok(())
    }

    /// Give a NEW object its permanent id, copying the key values into the
    /// matching primary key attributes.
    pub fn assign_permanent_id(&mut self, old: &ObjectId, new: &ObjectId) -> Result<()> {
        let schema = Arc::clone(&self.schema);
        let descriptor = schema.entity(old.entity_name())?;
        let object = self.objects.get_mut(old).ok_or_else(|| not_registered(old))?;
        for (column, value) in new.pk_values() {
            if let Some(attribute) = descriptor.attribute_for_column(column) {
                object.set_value(attribute.name.clone(), value.clone());
            }
        }
        self.process_id_change(old, new)
    }

    // ---- edits --------------------------------------------------------

    fn editable(&self, id: &ObjectId) -> Result<&PersistentObject> {
        let object = self.objects.get(id).ok_or_else(|| not_registered(id))?;
        match object.state() {
            PersistenceState::New | PersistenceState::Committed | PersistenceState::Modified => {
                Ok(object)
            }
            PersistenceState::Hollow => Err(Error::state(
                Some(id.to_string()),
                "hollow object must be resolved before it is edited",
            )),
            state => Err(Error::state(
                Some(id.to_string()),
                format!("cannot edit a {state} object"),
            )),
        }
    }

    /// Move a COMMITTED object to MODIFIED.
    ///
    /// If the cached snapshot changed since the object was synchronized, it is
    /// merged in first.
    fn prepare_for_change(&mut self, id: &ObjectId) -> Result<()> {
        let schema = Arc::clone(&self.schema);
        let object = self.objects.get_mut(id).ok_or_else(|| not_registered(id))?;
        if object.state() != PersistenceState::Committed {
            return Ok(());
        }
        if self.merge_external_changes {
            if let Some(snapshot) = self.snapshots.get(id) {
                if snapshot.version() != object.snapshot_version() {
                    tracing::debug!(
                        id = %id,
                        object_version = object.snapshot_version(),
                        snapshot_version = snapshot.version(),
                        "Snapshot changed before first edit, merging"
                    );
                    force_merge_with_snapshot(&schema, object, snapshot, None)?;
                    object.set_snapshot_version(snapshot.version());
                }
            }
        }
        object.set_state(PersistenceState::Modified);
        Ok(())
    }

    /// Set an attribute, recording its confirmed value.
    #[tracing::instrument(level = "trace", skip(self, value), fields(id = %id))]
    pub fn set_value(&mut self, id: &ObjectId, attribute: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let entity = self.editable(id)?.entity_name().to_string();
        if self.schema.entity(&entity)?.attribute(attribute).is_none() {
            return Err(Error::unknown_attribute(entity, attribute));
        }
        self.prepare_for_change(id)?;

        let object = self.objects.get_mut(id).ok_or_else(|| not_registered(id))?;
        let old = object.value(attribute).cloned().unwrap_or(Value::Null);
        self.diffs.record_attribute_change(id, attribute, old.clone(), &value);
        if !old.null_safe_eq(&value) {
            self.changes.push(GraphChange::PropertyChanged {
                id: id.clone(),
                property: attribute.to_string(),
                old,
                new: value.clone(),
            });
        }
        object.set_value(attribute, value);
        Ok(())
    }

    /// Current target of a to-one relationship, reading the cached snapshot
    /// when the relationship is a fault.
    pub fn to_one_target(&self, id: &ObjectId, relationship: &str) -> Result<Option<ObjectId>> {
        let object = self.objects.get(id).ok_or_else(|| not_registered(id))?;
        let rel = self.schema.relationship(object.entity_name(), relationship)?;
        if rel.is_to_many() {
            return Err(unsupported(
                object.entity_name(),
                relationship,
                format!("'{relationship}' is a to-many relationship"),
            ));
        }
        Ok(match object.relationship(relationship) {
            RelationshipValue::ToOne(target) => target.clone(),
            _ => self
                .snapshots
                .get(id)
                .and_then(|snapshot| to_one_target(rel, snapshot))
                .flatten(),
        })
    }

    /// Point a to-one relationship at `target`.
    ///
    /// The reverse to-many list, when mapped and resolved, follows along.
    #[tracing::instrument(level = "trace", skip(self, target), fields(id = %id))]
    pub fn set_to_one(
        &mut self,
        id: &ObjectId,
        relationship: &str,
        target: Option<&ObjectId>,
    ) -> Result<()> {
        let schema = Arc::clone(&self.schema);
        let entity = self.editable(id)?.entity_name().to_string();
        let rel = schema.relationship(&entity, relationship)?;
        if rel.is_to_many() {
            return Err(unsupported(
                &entity,
                relationship,
                format!("'{relationship}' is a to-many relationship"),
            ));
        }
        if rel.is_flattened() && rel.read_only {
            return Err(ReadOnlyError {
                entity,
                relationship: relationship.to_string(),
            }
            .into());
        }
        if let Some(target) = target {
            if target.entity_name() != rel.target_entity
                && schema.root_entity(target.entity_name())?.name
                    != schema.root_entity(&rel.target_entity)?.name
            {
                return Err(Error::state(
                    Some(target.to_string()),
                    format!("cannot assign to '{entity}.{relationship}'"),
                ));
            }
        }

        let old = self.to_one_target(id, relationship)?;
        self.prepare_for_change(id)?;
        let object = self.objects.get_mut(id).ok_or_else(|| not_registered(id))?;
        object.set_relationship(relationship, RelationshipValue::ToOne(target.cloned()));
        if old.as_ref() == target {
            return Ok(());
        }
        self.diffs.record_arc_change(id, relationship, old.clone(), target);

        let reverse = reverse_relationship(&schema, &entity, rel)?;
        if let Some(old) = &old {
            self.changes.push(GraphChange::arc_deleted(id, old, relationship));
            if let Some(reverse) = reverse {
                self.unlink_reverse(old, reverse, id);
            }
        }
        if let Some(new) = target {
            self.changes.push(GraphChange::arc_created(id, new, relationship));
            if let Some(reverse) = reverse {
                self.link_reverse(new, reverse, id);
            }
        }
        Ok(())
    }

    /// Mirror an added arc on the other side of a relationship.
    fn link_reverse(&mut self, owner: &ObjectId, reverse: &RelationshipInfo, member: &ObjectId) {
        let Some(object) = self.objects.get_mut(owner) else {
            return;
        };
        let present = match object.relationship(&reverse.name) {
            RelationshipValue::ToMany(members) => Some(members.contains(member)),
            RelationshipValue::ToOne(_) => Some(false),
            RelationshipValue::Fault => None,
        };
        match present {
            Some(true) => return,
            Some(false) if reverse.is_to_many() => {
                object.to_many_mut(&reverse.name).push(member.clone());
            }
            Some(false) => object
                .set_relationship(&reverse.name, RelationshipValue::ToOne(Some(member.clone()))),
            None => {}
        }
        if !reverse.is_flattened() {
            self.changes
                .push(GraphChange::arc_created(owner, member, &reverse.name));
        }
    }

    /// Mirror a removed arc on the other side of a relationship.
    fn unlink_reverse(&mut self, owner: &ObjectId, reverse: &RelationshipInfo, member: &ObjectId) {
        let Some(object) = self.objects.get_mut(owner) else {
            return;
        };
        let points_here = match object.relationship(&reverse.name) {
            RelationshipValue::ToMany(members) => members.contains(member),
            RelationshipValue::ToOne(current) => current.as_ref() == Some(member),
            RelationshipValue::Fault => false,
        };
        if points_here {
            if reverse.is_to_many() {
                object.to_many_mut(&reverse.name).retain(|m| m != member);
            } else {
                object.set_relationship(&reverse.name, RelationshipValue::ToOne(None));
            }
        }
        if !reverse.is_flattened() {
            self.changes
                .push(GraphChange::arc_deleted(owner, member, &reverse.name));
        }
    }

    fn to_many_relationship(&self, id: &ObjectId, relationship: &str) -> Result<(String, RelationshipInfo)> {
        let entity = self.editable(id)?.entity_name().to_string();
        let rel = self.schema.relationship(&entity, relationship)?;
        if !rel.is_to_many() {
            return Err(unsupported(
                &entity,
                relationship,
                format!("'{relationship}' is a to-one relationship"),
            ));
        }
        if rel.is_flattened() && rel.read_only {
            return Err(ReadOnlyError {
                entity,
                relationship: relationship.to_string(),
            }
            .into());
        }
        Ok((entity, rel.clone()))
    }

    /// Add `target` to a to-many relationship of `id`.
    ///
    /// For a plain to-many relationship this assigns the target's reverse
    /// to-one. For a flattened one it schedules a join table row.
    #[tracing::instrument(level = "trace", skip(self, target), fields(id = %id, target = %target))]
    pub fn add_to_many(&mut self, id: &ObjectId, relationship: &str, target: &ObjectId) -> Result<()> {
        let (entity, rel) = self.to_many_relationship(id, relationship)?;
        let schema = Arc::clone(&self.schema);
        let reverse = reverse_relationship(&schema, &entity, &rel)?;

        if !rel.is_flattened() {
            if let Some(reverse) = reverse.filter(|r| !r.is_to_many()) {
                return self.set_to_one(target, &reverse.name, Some(id));
            }
        }

        let object = self.objects.get_mut(id).ok_or_else(|| not_registered(id))?;
        let member = match object.relationship(relationship) {
            RelationshipValue::ToMany(members) => Some(members.contains(target)),
            _ => None,
        };
        match member {
            Some(true) => return Ok(()),
            Some(false) => object.to_many_mut(relationship).push(target.clone()),
            // A fault of a NEW object is known to be empty.
            None if object.state() == PersistenceState::New => {
                object.to_many_mut(relationship).push(target.clone());
            }
            None => {}
        }
        self.prepare_for_change(id)?;
        self.diffs.entry(id).record_to_many_change(relationship);
        self.changes
            .push(GraphChange::arc_created(id, target, relationship));
        if let Some(reverse) = reverse.filter(|r| r.is_flattened()) {
            self.link_reverse(target, reverse, id);
        }
        Ok(())
    }

    /// Remove `target` from a to-many relationship of `id`.
    #[tracing::instrument(level = "trace", skip(self, target), fields(id = %id, target = %target))]
    pub fn remove_to_many(&mut self, id: &ObjectId, relationship: &str, target: &ObjectId) -> Result<()> {
        let (entity, rel) = self.to_many_relationship(id, relationship)?;
        let schema = Arc::clone(&self.schema);
        let reverse = reverse_relationship(&schema, &entity, &rel)?;

        if !rel.is_flattened() {
            if let Some(reverse) = reverse.filter(|r| !r.is_to_many()) {
                if self.to_one_target(target, &reverse.name)?.as_ref() == Some(id) {
                    return self.set_to_one(target, &reverse.name, None);
                }
                return Ok(());
            }
        }

        let object = self.objects.get_mut(id).ok_or_else(|| not_registered(id))?;
        let member = match object.relationship(relationship) {
            RelationshipValue::ToMany(members) => Some(members.contains(target)),
            _ => None,
        };
        match member {
            Some(false) => return Ok(()),
            Some(true) => object.to_many_mut(relationship).retain(|m| m != target),
            None => {}
        }
        self.prepare_for_change(id)?;
        self.diffs.entry(id).record_to_many_change(relationship);
        self.changes
            .push(GraphChange::arc_deleted(id, target, relationship));
        if let Some(reverse) = reverse.filter(|r| r.is_flattened()) {
            self.unlink_reverse(target, reverse, id);
        }
        Ok(())
    }

    /// Schedule an object for deletion. NEW objects are simply forgotten.
    #[tracing::instrument(level = "trace", skip(self), fields(id = %id))]
    pub fn delete_object(&mut self, id: &ObjectId) -> Result<()> {
        let object = self.objects.get_mut(id).ok_or_else(|| not_registered(id))?;
        match object.state() {
            PersistenceState::Deleted => return Ok(()),
            PersistenceState::New => {
                self.unregister(id);
                let removed: HashSet<ObjectId> = std::iter::once(id.clone()).collect();
                self.forget_references(&removed);
                let dropped = self.changes.forget_arcs_of(id);
                tracing::trace!(id = %id, dropped, "Forgot arcs of deleted NEW object");
            }
            _ => object.set_state(PersistenceState::Deleted),
        }
        self.changes.push(GraphChange::NodeRemoved(id.clone()));
        Ok(())
    }

    /// Drop references to objects that left the store.
    fn forget_references(&mut self, removed: &HashSet<ObjectId>) {
        if removed.is_empty() {
            return;
        }
        for object in self.objects.values_mut() {
            let Ok(descriptor) = self.schema.entity(object.entity_name()) else {
                continue;
            };
            for relationship in &descriptor.relationships {
                let name = relationship.name.as_str();
                let stale = match object.relationship(name) {
                    RelationshipValue::ToMany(members) => members.iter().any(|m| removed.contains(m)),
                    RelationshipValue::ToOne(Some(target)) => removed.contains(target),
                    _ => false,
                };
                if !stale {
                    continue;
                }
                if relationship.is_to_many() {
                    object.to_many_mut(name).retain(|m| !removed.contains(m));
                } else {
                    object.set_relationship(name, RelationshipValue::ToOne(None));
                }
            }
        }
    }

    /// Revert MODIFIED objects whose edits cancelled out.
    ///
    /// Returns the number of objects put back to COMMITTED.
    pub fn revert_noop_changes(&mut self) -> usize {
        let mut reverted = 0;
        for object in self.objects.values_mut() {
            if object.state() != PersistenceState::Modified {
                continue;
            }
            let noop = self
                .diffs
                .get(object.id())
                .is_none_or(|diff| diff.is_noop(object));
            if noop {
                self.diffs.remove(object.id());
                object.set_state(PersistenceState::Committed);
                reverted += 1;
            }
        }
        if reverted > 0 {
            tracing::debug!(reverted, "Reverted objects with no net changes");
        }
        reverted
    }

    // ---- rows ---------------------------------------------------------

    /// Row image of an object: attribute columns plus the foreign keys of
    /// to-one relationships it owns.
    ///
    /// Unset attributes and unresolved relationships fall back to the cached
    /// snapshot and are left out if that has no value either.
    pub fn current_row(&self, id: &ObjectId) -> Result<DataRow> {
        let object = self.objects.get(id).ok_or_else(|| not_registered(id))?;
        let descriptor = self.schema.entity(object.entity_name())?;
        let snapshot = self.snapshots.get(id);

        let mut row = DataRow::new();
        for attribute in &descriptor.attributes {
            let value = object
                .value(&attribute.name)
                .or_else(|| snapshot.and_then(|s| s.get(&attribute.column)));
            if let Some(value) = value {
                row.insert(attribute.column.clone(), value.clone());
            }
        }

        for relationship in descriptor.foreign_key_relationships() {
            if relationship.to_dependent_pk || !self.schema.is_to_pk(relationship)? {
                continue;
            }
            match object.relationship(&relationship.name) {
                RelationshipValue::ToOne(Some(target)) => {
                    for join in &relationship.joins {
                        let value = target.pk_value(&join.target).ok_or_else(|| {
                            Error::state(
                                Some(target.to_string()),
                                format!(
                                    "no value for '{}' to fill foreign key '{}'",
                                    join.target, join.source
                                ),
                            )
                        })?;
                        row.insert(join.source.clone(), value.clone());
                    }
                }
                RelationshipValue::ToOne(None) => {
                    for join in &relationship.joins {
                        row.insert(join.source.clone(), Value::Null);
                    }
                }
                _ => {
                    if let Some(snapshot) = snapshot {
                        for join in &relationship.joins {
                            if let Some(value) = snapshot.get(&join.source) {
                                row.insert(join.source.clone(), value.clone());
                            }
                        }
                    }
                }
            }
        }
        Ok(row)
    }

    // ---- commit / rollback --------------------------------------------

    /// Record a successful commit: changed objects become COMMITTED with fresh
    /// snapshots, deleted ones are unregistered.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn post_commit(&mut self) -> Result<()> {
        let mut committed = 0usize;
        for id in self.ids_in_state(PersistenceState::New)
            .into_iter()
            .chain(self.ids_in_state(PersistenceState::Modified))
        {
            let row = self.current_row(&id)?;
            let object = self.objects.get_mut(&id).ok_or_else(|| not_registered(&id))?;
            object.set_snapshot_version(row.version());
            object.set_state(PersistenceState::Committed);
            self.snapshots.insert(id, row);
            committed += 1;
        }

        let deleted = self.ids_in_state(PersistenceState::Deleted);
        let removed: HashSet<ObjectId> = deleted.iter().cloned().collect();
        for id in &deleted {
            self.unregister(id);
        }
        self.forget_references(&removed);

        self.diffs.clear();
        self.changes.clear();
        tracing::debug!(committed, deleted = deleted.len(), "Post-commit processing done");
        Ok(())
    }

    /// Undo all uncommitted edits.
    ///
    /// NEW objects are unregistered. MODIFIED and DELETED objects get their
    /// confirmed values back and become COMMITTED.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn rollback_changes(&mut self) {
        let new_ids = self.ids_in_state(PersistenceState::New);
        let removed: HashSet<ObjectId> = new_ids.iter().cloned().collect();
        for id in &new_ids {
            self.unregister(id);
        }

        let touched: Vec<(ObjectId, String)> = self
            .changes
            .events()
            .iter()
            .filter_map(|event| match event {
                GraphChange::ArcCreated {
                    source,
                    relationship,
                    ..
                }
                | GraphChange::ArcDeleted {
                    source,
                    relationship,
                    ..
                } => Some((source.clone(), relationship.clone())),
                _ => None,
            })
            .collect();

        for object in self.objects.values_mut() {
            if !matches!(
                object.state(),
                PersistenceState::Modified | PersistenceState::Deleted
            ) {
                continue;
            }
            if let Some(diff) = self.diffs.get(object.id()) {
                for (attribute, confirmed) in diff.changed_attributes() {
                    object.set_value(attribute, confirmed.clone());
                }
                for (relationship, confirmed) in diff.changed_arcs() {
                    object.set_relationship(
                        relationship,
                        RelationshipValue::ToOne(confirmed.cloned()),
                    );
                }
                for relationship in diff.changed_to_many() {
                    object.invalidate(relationship);
                }
            }
            object.set_state(PersistenceState::Committed);
        }

        // Lists changed from the other side of a relationship are stale.
        for (source, relationship) in touched {
            if let Some(object) = self.objects.get_mut(&source) {
                if matches!(object.relationship(&relationship), RelationshipValue::ToMany(_)) {
                    object.invalidate(&relationship);
                }
            }
        }
        self.forget_references(&removed);

        tracing::debug!(forgotten = new_ids.len(), "Rolled back uncommitted changes");
        self.diffs.clear();
        self.changes.clear();
    }

    // ---- external snapshot events --------------------------------------

    /// Apply a row changed by another context.
    ///
    /// COMMITTED objects are refreshed, MODIFIED and DELETED ones are
    /// force-merged, others are left alone.
    #[tracing::instrument(level = "debug", skip(self, row), fields(id = %id))]
    pub fn process_updated_snapshot(&mut self, id: &ObjectId, row: &DataRow) -> Result<()> {
        if !self.merge_external_changes {
            return Ok(());
        }
        let schema = Arc::clone(&self.schema);
        self.snapshots.insert(id.clone(), row.clone());
        let Some(object) = self.objects.get_mut(id) else {
            return Ok(());
        };
        match object.state() {
            PersistenceState::Committed => {
                refresh_object_with_snapshot(
                    &schema,
                    object,
                    row,
                    self.invalidate_to_many_on_refresh,
                )?;
            }
            PersistenceState::Modified | PersistenceState::Deleted => {
                force_merge_with_snapshot(&schema, object, row, self.diffs.get_mut(id))?;
                object.set_snapshot_version(row.version());
            }
            _ => {}
        }
        Ok(())
    }

    /// Apply a row deleted by another context.
    ///
    /// MODIFIED objects become NEW so their edits are inserted again on commit.
    #[tracing::instrument(level = "debug", skip(self), fields(id = %id))]
    pub fn process_deleted_id(&mut self, id: &ObjectId) -> Result<()> {
        if !self.merge_external_changes {
            return Ok(());
        }
        let Some(object) = self.objects.get_mut(id) else {
            self.snapshots.remove(id);
            return Ok(());
        };
        match object.state() {
            PersistenceState::Committed | PersistenceState::Hollow | PersistenceState::Deleted => {
                self.unregister(id);
                let removed: HashSet<ObjectId> = std::iter::once(id.clone()).collect();
                self.forget_references(&removed);
            }
            PersistenceState::Modified => {
                object.set_state(PersistenceState::New);
                self.snapshots.remove(id);
                self.diffs.remove(id);
            }
            _ => {}
        }
        Ok(())
    }

    /// Drop cached state of invalidated objects.
    ///
    /// COMMITTED objects become HOLLOW. MODIFIED objects are force-merged with
    /// the cached snapshot, if there is one.
    #[tracing::instrument(level = "debug", skip(self, ids), fields(count = ids.len()))]
    pub fn process_invalidated_ids(&mut self, ids: &[ObjectId]) -> Result<()> {
        if !self.merge_external_changes {
            return Ok(());
        }
        let schema = Arc::clone(&self.schema);
        for id in ids {
            let Some(object) = self.objects.get_mut(id) else {
                continue;
            };
            match object.state() {
                PersistenceState::Committed => {
                    object.set_state(PersistenceState::Hollow);
                    self.snapshots.remove(id);
                }
                PersistenceState::Modified => {
                    if let Some(snapshot) = self.snapshots.get(id) {
                        force_merge_with_snapshot(&schema, object, snapshot, self.diffs.get_mut(id))?;
                        object.set_snapshot_version(snapshot.version());
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Fault relationships of objects whose related rows changed elsewhere.
    ///
    /// Only COMMITTED objects are touched; their to-many and source-independent
    /// to-one relationships become faults.
    #[tracing::instrument(level = "debug", skip(self, ids), fields(count = ids.len()))]
    pub fn process_indirectly_modified_ids(&mut self, ids: &[ObjectId]) -> Result<()> {
        if !self.merge_external_changes {
            return Ok(());
        }
        let schema = Arc::clone(&self.schema);
        for id in ids {
            let Some(object) = self.objects.get_mut(id) else {
                continue;
            };
            if object.state() != PersistenceState::Committed {
                continue;
            }
            let descriptor = schema.entity(object.entity_name())?;
            for relationship in &descriptor.relationships {
                if relationship.is_to_many()
                    || schema.is_source_independent_from_target_change(relationship)?
                {
                    object.invalidate(&relationship.name);
                }
            }
        }
        Ok(())
    }
}

/// Path reads over a registered object and the objects it references.
pub struct ObjectView<'a> {
    store: &'a ObjectStore,
    id: &'a ObjectId,
}

impl ObjectView<'_> {
    pub fn id(&self) -> &ObjectId {
        self.id
    }
}

impl PropertyAccess for ObjectView<'_> {
    /// Walks to-one relationships segment by segment. A NULL relationship
    /// anywhere on the path reads as NULL; a path ending at a to-one
    /// relationship reads the target's single key value.
    fn read_property(&self, path: &str) -> Result<Value> {
        let schema = self.store.schema();
        let mut current = self.store.get(self.id).ok_or_else(|| not_registered(self.id))?;
        let mut segments = path.split('.').peekable();

        while let Some(segment) = segments.next() {
            let descriptor = schema.entity(current.entity_name())?;
            if descriptor.attribute(segment).is_some() {
                if segments.peek().is_some() {
                    return Err(unsupported(
                        &descriptor.name,
                        segment,
                        format!("'{segment}' in path '{path}' is an attribute and cannot be traversed"),
                    ));
                }
                return Ok(current.value(segment).cloned().unwrap_or(Value::Null));
            }

            let relationship = descriptor
                .relationship(segment)
                .ok_or_else(|| Error::unknown_attribute(descriptor.name.clone(), segment))?;
            if relationship.is_to_many() {
                return Err(unsupported(
                    &descriptor.name,
                    segment,
                    format!("to-many relationship '{segment}' cannot be read as a value"),
                ));
            }
            let Some(target) = self.store.to_one_target(current.id(), segment)? else {
                return Ok(Value::Null);
            };
            if segments.peek().is_none() {
                return Ok(target.single_pk_value().cloned().unwrap_or(Value::Null));
            }
            current = self.store.get(&target).ok_or_else(|| {
                Error::state(
                    Some(target.to_string()),
                    format!("target of '{segment}' is not registered in this context"),
                )
            })?;
        }
        Ok(Value::Null)
    }
}
