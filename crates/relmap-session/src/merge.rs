//! Merging fetched row snapshots into live objects.

use crate::diff::ObjectDiff;
use relmap_core::{
    DataRow, ObjectId, PersistenceState, PersistentObject, RelationshipInfo, RelationshipValue,
    Result, Schema, Value,
};

/// Target id of a to-one relationship as described by `snapshot`.
///
/// Returns `None` when a join column is missing from a partial snapshot, so
/// the caller can skip the relationship instead of assuming NULL.
pub fn to_one_target(
    relationship: &RelationshipInfo,
    snapshot: &DataRow,
) -> Option<Option<ObjectId>> {
    let mut pk = Vec::with_capacity(relationship.joins.len());
    for join in &relationship.joins {
        let value = snapshot.get(&join.source)?;
        if value.is_null() {
            return Some(None);
        }
        pk.push((join.target.clone(), value.clone()));
    }
    if pk.is_empty() {
        return None;
    }
    Some(Some(ObjectId::new(relationship.target_entity.clone(), pk)))
}

/// Overwrite `object` with `snapshot`.
///
/// Attributes missing from the snapshot keep their value and leave the object
/// HOLLOW. To-one relationships become faults. To-many relationships are
/// invalidated only when `invalidate_to_many` is set.
#[tracing::instrument(level = "debug", skip(schema, object, snapshot), fields(id = %object.id()))]
pub fn refresh_object_with_snapshot(
    schema: &Schema,
    object: &mut PersistentObject,
    snapshot: &DataRow,
    invalidate_to_many: bool,
) -> Result<()> {
    let descriptor = schema.entity(object.entity_name())?;

    let mut partial = false;
    for attribute in &descriptor.attributes {
        match snapshot.get(&attribute.column) {
            Some(value) => {
                object.set_value(attribute.name.clone(), value.clone());
            }
            None => partial = true,
        }
    }

    for relationship in &descriptor.relationships {
        if relationship.is_to_many() {
            if invalidate_to_many && !object.is_fault(&relationship.name) {
                object.invalidate(&relationship.name);
            }
        } else {
            object.invalidate(&relationship.name);
        }
    }

    object.set_snapshot_version(snapshot.version());
    object.set_state(if partial {
        PersistenceState::Hollow
    } else {
        PersistenceState::Committed
    });
    tracing::debug!(partial, "Refreshed object from snapshot");
    Ok(())
}

/// Whether the to-one target of `relationship` was changed in memory since the
/// last confirmed state.
pub fn is_to_one_target_modified(
    object: &PersistentObject,
    relationship: &RelationshipInfo,
    diff: Option<&ObjectDiff>,
) -> bool {
    let Some(diff) = diff else {
        return false;
    };
    if object.state() != PersistenceState::Modified {
        return false;
    }
    let Some(current) = object.to_one(&relationship.name) else {
        return false;
    };
    if current.is_some_and(ObjectId::is_temporary) {
        return true;
    }
    match diff.arc_snapshot(&relationship.name) {
        Some(confirmed) => confirmed != current,
        None => false,
    }
}

/// Merge an external snapshot into an object with uncommitted changes.
///
/// An attribute is overwritten only if it still has its confirmed value and the
/// snapshot brings a different one, so in-memory edits survive. To-one
/// relationships are updated only when they join onto the target's primary key
/// and were not changed in memory. Flattened to-one relationships are left
/// alone.
#[tracing::instrument(level = "debug", skip(schema, object, snapshot, diff), fields(id = %object.id()))]
pub fn force_merge_with_snapshot(
    schema: &Schema,
    object: &mut PersistentObject,
    snapshot: &DataRow,
    mut diff: Option<&mut ObjectDiff>,
) -> Result<()> {
    let descriptor = schema.entity(object.entity_name())?;

    let mut merged = 0usize;
    for attribute in &descriptor.attributes {
        let Some(incoming) = snapshot.get(&attribute.column) else {
            continue;
        };
        let current = object.value(&attribute.name).cloned().unwrap_or(Value::Null);
        let confirmed = diff
            .as_deref()
            .and_then(|d| d.attribute_snapshot(&attribute.name))
            .cloned()
            .unwrap_or_else(|| current.clone());

        if current.null_safe_eq(&confirmed) && !incoming.null_safe_eq(&current) {
            object.set_value(attribute.name.clone(), incoming.clone());
            if let Some(diff) = diff.as_deref_mut() {
                diff.rebase_attribute(&attribute.name, incoming.clone());
            }
            merged += 1;
        }
    }

    for relationship in descriptor.relationships.iter().filter(|r| !r.is_to_many()) {
        if relationship.is_flattened() {
            tracing::debug!(
                relationship = %relationship.name,
                "Skipping flattened to-one relationship during merge"
            );
            continue;
        }
        if !schema.is_to_pk(relationship)? {
            continue;
        }
        if is_to_one_target_modified(object, relationship, diff.as_deref()) {
            continue;
        }
        let Some(target) = to_one_target(relationship, snapshot) else {
            tracing::warn!(
                relationship = %relationship.name,
                "Foreign key missing from partial snapshot, relationship not merged"
            );
            continue;
        };

        let confirmed = diff
            .as_deref()
            .and_then(|d| d.arc_snapshot(&relationship.name));
        if confirmed.is_some_and(|c| c == target.as_ref()) {
            continue;
        }

        match target {
            None => object.set_relationship(&relationship.name, RelationshipValue::ToOne(None)),
            Some(_) if schema.has_sub_entities(&relationship.target_entity) => {
                // Exact target entity unknown.
                object.invalidate(&relationship.name);
            }
            Some(id) => {
                object.set_relationship(&relationship.name, RelationshipValue::ToOne(Some(id)));
            }
        }
        merged += 1;
    }

    tracing::debug!(merged, "Force-merged snapshot");
    Ok(())
}
