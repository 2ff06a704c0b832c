//! In-memory persistent objects.

use crate::{ObjectId, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Lifecycle state of a persistent object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PersistenceState {
    /// Constructed but not registered with any context.
    Transient,
    /// Registered, waiting to be inserted.
    New,
    /// Id known, attribute values not fetched.
    Hollow,
    /// In sync with the last confirmed snapshot.
    Committed,
    /// Edited since the last confirmed snapshot.
    Modified,
    /// Scheduled for deletion.
    Deleted,
}

impl fmt::Display for PersistenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PersistenceState::Transient => "transient",
            PersistenceState::New => "new",
            PersistenceState::Hollow => "hollow",
            PersistenceState::Committed => "committed",
            PersistenceState::Modified => "modified",
            PersistenceState::Deleted => "deleted",
        };
        f.write_str(name)
    }
}

/// Cached value of a relationship.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RelationshipValue {
    /// Unresolved; must be fetched before use.
    Fault,
    ToOne(Option<ObjectId>),
    ToMany(Vec<ObjectId>),
}

impl RelationshipValue {
    pub fn is_fault(&self) -> bool {
        matches!(self, RelationshipValue::Fault)
    }
}

static FAULT: RelationshipValue = RelationshipValue::Fault;

/// A persistent object: identity, lifecycle state, attribute values and
/// relationship values.
///
/// Related objects are referenced by [`ObjectId`] and looked up through the
/// owning object store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistentObject {
    id: ObjectId,
    state: PersistenceState,
    values: BTreeMap<String, Value>,
    relationships: BTreeMap<String, RelationshipValue>,
    snapshot_version: u64,
}

impl PersistentObject {
    /// Create a transient object with the given id.
    pub fn new(id: ObjectId) -> Self {
        Self {
            id,
            state: PersistenceState::Transient,
            values: BTreeMap::new(),
            relationships: BTreeMap::new(),
            snapshot_version: 0,
        }
    }

    /// Create a hollow object that only knows its id.
    pub fn hollow(id: ObjectId) -> Self {
        let mut object = Self::new(id);
        object.state = PersistenceState::Hollow;
        object
    }

    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    pub fn set_id(&mut self, id: ObjectId) {
        self.id = id;
    }

    pub fn entity_name(&self) -> &str {
        self.id.entity_name()
    }

    pub fn state(&self) -> PersistenceState {
        self.state
    }

    pub fn set_state(&mut self, state: PersistenceState) {
        self.state = state;
    }

    /// Version of the snapshot this object was last synchronized with.
    pub fn snapshot_version(&self) -> u64 {
        self.snapshot_version
    }

    pub fn set_snapshot_version(&mut self, version: u64) {
        self.snapshot_version = version;
    }

    pub fn value(&self, attribute: &str) -> Option<&Value> {
        self.values.get(attribute)
    }

    /// Write an attribute without change tracking.
    pub fn set_value(&mut self, attribute: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.values.insert(attribute.into(), value.into())
    }

    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    /// Relationship value; missing entries read as a fault.
    pub fn relationship(&self, name: &str) -> &RelationshipValue {
        self.relationships.get(name).unwrap_or(&FAULT)
    }

    /// Write a relationship without change tracking.
    pub fn set_relationship(&mut self, name: impl Into<String>, value: RelationshipValue) {
        self.relationships.insert(name.into(), value);
    }

    pub fn is_fault(&self, relationship: &str) -> bool {
        self.relationship(relationship).is_fault()
    }

    /// Resolved to-one target, `None` if the relationship is a fault.
    pub fn to_one(&self, relationship: &str) -> Option<Option<&ObjectId>> {
        match self.relationship(relationship) {
            RelationshipValue::ToOne(target) => Some(target.as_ref()),
            _ => None,
        }
    }

    /// Resolved to-many targets, `None` if the relationship is a fault.
    pub fn to_many(&self, relationship: &str) -> Option<&[ObjectId]> {
        match self.relationship(relationship) {
            RelationshipValue::ToMany(targets) => Some(targets),
            _ => None,
        }
    }

    /// Mutable to-many list, materializing an empty list over a fault.
    pub fn to_many_mut(&mut self, relationship: &str) -> &mut Vec<ObjectId> {
        let entry = self
            .relationships
            .entry(relationship.to_string())
            .or_insert(RelationshipValue::Fault);
        if !matches!(entry, RelationshipValue::ToMany(_)) {
            *entry = RelationshipValue::ToMany(Vec::new());
        }
        match entry {
            RelationshipValue::ToMany(targets) => targets,
            _ => unreachable!("entry was just set to a to-many list"),
        }
    }

    /// Replace a relationship with a fault.
    pub fn invalidate(&mut self, relationship: &str) {
        self.relationships
            .insert(relationship.to_string(), RelationshipValue::Fault);
    }

    /// Rewrite references to `old` so they point to `new`.
    pub fn replace_reference(&mut self, old: &ObjectId, new: &ObjectId) {
        for value in self.relationships.values_mut() {
            match value {
                RelationshipValue::ToOne(Some(target)) if target == old => *target = new.clone(),
                RelationshipValue::ToMany(targets) => {
                    for target in targets.iter_mut().filter(|t| *t == old) {
                        *target = new.clone();
                    }
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_relationship_is_fault() {
        let object = PersistentObject::new(ObjectId::single("Artist", "ID", 1));
        assert!(object.is_fault("paintings"));
        assert_eq!(object.to_one("gallery"), None);
        assert_eq!(object.state(), PersistenceState::Transient);
    }

    #[test]
    fn to_many_mut_materializes_list() {
        let mut object = PersistentObject::new(ObjectId::single("Artist", "ID", 1));
        object
            .to_many_mut("paintings")
            .push(ObjectId::single("Painting", "ID", 2));
        assert_eq!(object.to_many("paintings").map(<[ObjectId]>::len), Some(1));

        object.invalidate("paintings");
        assert!(object.is_fault("paintings"));
    }

    #[test]
    fn replace_reference_rewrites_targets() {
        let temp = ObjectId::temporary("Artist");
        let permanent = ObjectId::single("Artist", "ID", 9);
        let mut painting = PersistentObject::new(ObjectId::single("Painting", "ID", 1));
        painting.set_relationship("artist", RelationshipValue::ToOne(Some(temp.clone())));

        painting.replace_reference(&temp, &permanent);
        assert_eq!(painting.to_one("artist"), Some(Some(&permanent)));
    }
}
