//! Per-object change records.
//!
//! An [`ObjectDiff`] remembers the last confirmed value of every attribute and
//! to-one relationship changed since the object was last in sync with the
//! database. Repeated edits keep the first recorded value, so a diff always
//! describes the change since the last commit, not since the last write.

use relmap_core::{ObjectId, PersistentObject, RelationshipValue, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Confirmed values of one changed object.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectDiff {
    id: ObjectId,
    attributes: BTreeMap<String, Value>,
    arcs: BTreeMap<String, Option<ObjectId>>,
    to_many: BTreeSet<String>,
}

impl ObjectDiff {
    pub fn new(id: ObjectId) -> Self {
        Self {
            id,
            attributes: BTreeMap::new(),
            arcs: BTreeMap::new(),
            to_many: BTreeSet::new(),
        }
    }

    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    /// Remember `old` as the confirmed value of `attribute` unless one is already recorded.
    pub fn record_attribute_change(&mut self, attribute: &str, old: Value) {
        self.attributes.entry(attribute.to_string()).or_insert(old);
    }

    /// Remember `old` as the confirmed target of `relationship` unless one is already recorded.
    pub fn record_arc_change(&mut self, relationship: &str, old: Option<ObjectId>) {
        self.arcs.entry(relationship.to_string()).or_insert(old);
    }

    /// Note that the content of a to-many relationship changed.
    pub fn record_to_many_change(&mut self, relationship: &str) {
        self.to_many.insert(relationship.to_string());
    }

    /// Confirmed value of a changed attribute.
    pub fn attribute_snapshot(&self, attribute: &str) -> Option<&Value> {
        self.attributes.get(attribute)
    }

    /// Confirmed target of a changed to-one relationship.
    ///
    /// The outer `None` means the relationship was not changed.
    pub fn arc_snapshot(&self, relationship: &str) -> Option<Option<&ObjectId>> {
        self.arcs.get(relationship).map(Option::as_ref)
    }

    /// Replace the confirmed value of an attribute after an external merge.
    pub fn rebase_attribute(&mut self, attribute: &str, confirmed: Value) {
        if let Some(value) = self.attributes.get_mut(attribute) {
            *value = confirmed;
        }
    }

    pub fn changed_attributes(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.attributes.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn changed_arcs(&self) -> impl Iterator<Item = (&str, Option<&ObjectId>)> {
        self.arcs.iter().map(|(k, v)| (k.as_str(), v.as_ref()))
    }

    pub fn changed_to_many(&self) -> impl Iterator<Item = &str> {
        self.to_many.iter().map(String::as_str)
    }

    /// Whether `object` is back to its confirmed state.
    ///
    /// A diff with to-many changes is never a no-op.
    pub fn is_noop(&self, object: &PersistentObject) -> bool {
        if !self.to_many.is_empty() {
            return false;
        }
        let attributes_unchanged = self.attributes.iter().all(|(name, confirmed)| {
            let current = object.value(name).unwrap_or(&Value::Null);
            current.null_safe_eq(confirmed)
        });
        attributes_unchanged
            && self.arcs.iter().all(|(name, confirmed)| {
                match object.relationship(name) {
                    RelationshipValue::ToOne(current) => current == confirmed,
                    // Not resolved since the change; nothing to compare against.
                    RelationshipValue::Fault => false,
                    RelationshipValue::ToMany(_) => false,
                }
            })
    }
}

/// Diffs of all changed objects in one context.
#[derive(Debug, Default)]
pub struct DiffStore {
    diffs: HashMap<ObjectId, ObjectDiff>,
}

impl DiffStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &ObjectId) -> Option<&ObjectDiff> {
        self.diffs.get(id)
    }

    pub fn get_mut(&mut self, id: &ObjectId) -> Option<&mut ObjectDiff> {
        self.diffs.get_mut(id)
    }

    /// Diff for `id`, created empty if missing.
    pub fn entry(&mut self, id: &ObjectId) -> &mut ObjectDiff {
        self.diffs
            .entry(id.clone())
            .or_insert_with(|| ObjectDiff::new(id.clone()))
    }

    /// Record an attribute edit. Writes that do not change the value are ignored.
    #[tracing::instrument(level = "trace", skip(self, old, new), fields(id = %id))]
    pub fn record_attribute_change(
        &mut self,
        id: &ObjectId,
        attribute: &str,
        old: Value,
        new: &Value,
    ) {
        if old.null_safe_eq(new) && !self.diffs.contains_key(id) {
            return;
        }
        self.entry(id).record_attribute_change(attribute, old);
    }

    /// Record a to-one relationship edit. Writes that do not change the target are ignored.
    #[tracing::instrument(level = "trace", skip(self, old, new), fields(id = %id))]
    pub fn record_arc_change(
        &mut self,
        id: &ObjectId,
        relationship: &str,
        old: Option<ObjectId>,
        new: Option<&ObjectId>,
    ) {
        if old.as_ref() == new && !self.diffs.contains_key(id) {
            return;
        }
        self.entry(id).record_arc_change(relationship, old);
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.diffs.contains_key(id)
    }

    pub fn remove(&mut self, id: &ObjectId) -> Option<ObjectDiff> {
        self.diffs.remove(id)
    }

    /// Move the diff of `old` to `new`.
    pub fn rekey(&mut self, old: &ObjectId, new: &ObjectId) {
        if let Some(mut diff) = self.diffs.remove(old) {
            diff.id = new.clone();
            self.diffs.insert(new.clone(), diff);
        }
    }

    pub fn ids(&self) -> impl Iterator<Item = &ObjectId> {
        self.diffs.keys()
    }

    pub fn clear(&mut self) {
        self.diffs.clear();
    }

    pub fn len(&self) -> usize {
        self.diffs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.diffs.is_empty()
    }
}
