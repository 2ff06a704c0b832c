//! Classification of relationship changes into indirect modifications and
//! join table rows.
//!
//! Changing a to-many or a flattened relationship does not touch the source
//! object's row, but the source's cached state is stale afterwards, and a
//! flattened relationship needs rows inserted into or deleted from its join
//! table. [`IndirectDiffBuilder`] consumes the arc events of one flush cycle
//! and reports both, cancelling inserts and deletes of the same join row.

use crate::graph::GraphChange;
use relmap_core::error::ReadOnlyError;
use relmap_core::{Error, ObjectId, RelationshipInfo, Result, Schema};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Identifies one row of the join table behind a flattened relationship.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlattenedArcKey {
    source: ObjectId,
    target: ObjectId,
    relationship: String,
}

impl FlattenedArcKey {
    pub fn new(source: ObjectId, target: ObjectId, relationship: impl Into<String>) -> Self {
        Self {
            source,
            target,
            relationship: relationship.into(),
        }
    }

    pub fn source(&self) -> &ObjectId {
        &self.source
    }

    pub fn target(&self) -> &ObjectId {
        &self.target
    }

    pub fn relationship(&self) -> &str {
        &self.relationship
    }

    /// Relationship definition on the source entity.
    pub fn relationship_info<'s>(&self, schema: &'s Schema) -> Result<&'s RelationshipInfo> {
        schema.relationship(self.source.entity_name(), &self.relationship)
    }

    /// Name of the join table holding this row.
    pub fn join_table(&self, schema: &Schema) -> Result<String> {
        let rel = self.relationship_info(schema)?;
        rel.link_table
            .as_ref()
            .map(|link| link.table_name.clone())
            .ok_or_else(|| {
                Error::unknown_relationship(self.source.entity_name(), &self.relationship)
            })
    }
}

/// Surviving join table rows of one join table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JoinTableChanges {
    pub inserts: Vec<FlattenedArcKey>,
    pub deletes: Vec<FlattenedArcKey>,
}

/// Result of classifying one flush cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndirectChanges {
    /// Permanent objects whose relationships changed without touching their row.
    pub indirect: Vec<ObjectId>,
    pub flattened_inserts: Vec<FlattenedArcKey>,
    pub flattened_deletes: Vec<FlattenedArcKey>,
}

impl IndirectChanges {
    pub fn is_indirectly_modified(&self, id: &ObjectId) -> bool {
        self.indirect.contains(id)
    }

    pub fn has_flattened_changes(&self) -> bool {
        !self.flattened_inserts.is_empty() || !self.flattened_deletes.is_empty()
    }

    /// Flattened rows grouped by join table name.
    pub fn by_join_table(&self, schema: &Schema) -> Result<BTreeMap<String, JoinTableChanges>> {
        let mut tables: BTreeMap<String, JoinTableChanges> = BTreeMap::new();
        for key in &self.flattened_inserts {
            tables
                .entry(key.join_table(schema)?)
                .or_default()
                .inserts
                .push(key.clone());
        }
        for key in &self.flattened_deletes {
            tables
                .entry(key.join_table(schema)?)
                .or_default()
                .deletes
                .push(key.clone());
        }
        Ok(tables)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BuilderState {
    Collecting,
    Classified,
}

/// Collects arc events of one flush cycle.
///
/// Single use: after [`process_indirect_changes`](Self::process_indirect_changes)
/// the builder accepts no more events.
pub struct IndirectDiffBuilder<'s> {
    schema: &'s Schema,
    state: BuilderState,
    indirect: Vec<ObjectId>,
    indirect_seen: HashSet<ObjectId>,
    /// Pending keys with the sequence number of the event that added them.
    inserts: HashMap<FlattenedArcKey, u64>,
    deletes: HashMap<FlattenedArcKey, u64>,
    sequence: u64,
}

impl<'s> IndirectDiffBuilder<'s> {
    pub fn new(schema: &'s Schema) -> Self {
        Self {
            schema,
            state: BuilderState::Collecting,
            indirect: Vec::new(),
            indirect_seen: HashSet::new(),
            inserts: HashMap::new(),
            deletes: HashMap::new(),
            sequence: 0,
        }
    }

    /// Feed one graph change. Node level events are ignored.
    pub fn apply(&mut self, event: &GraphChange) -> Result<()> {
        match event {
            GraphChange::ArcCreated {
                source,
                target,
                relationship,
            } => self.arc_created(source, target, relationship),
            GraphChange::ArcDeleted {
                source,
                target,
                relationship,
            } => self.arc_deleted(source, target, relationship),
            _ => Ok(()),
        }
    }

    pub fn arc_created(
        &mut self,
        source: &ObjectId,
        target: &ObjectId,
        relationship: &str,
    ) -> Result<()> {
        if let Some(key) = self.flattened_key(source, target, relationship)? {
            if self.deletes.remove(&key).is_some() {
                tracing::trace!(key = ?key, "Insert cancels pending join row delete");
            } else if !self.inserts.contains_key(&key) {
                self.sequence += 1;
                self.inserts.insert(key, self.sequence);
            }
        }
        Ok(())
    }

    pub fn arc_deleted(
        &mut self,
        source: &ObjectId,
        target: &ObjectId,
        relationship: &str,
    ) -> Result<()> {
        if let Some(key) = self.flattened_key(source, target, relationship)? {
            if self.inserts.remove(&key).is_some() {
                tracing::trace!(key = ?key, "Delete cancels pending join row insert");
            } else if !self.deletes.contains_key(&key) {
                self.sequence += 1;
                self.deletes.insert(key, self.sequence);
            }
        }
        Ok(())
    }

    /// Common handling of both arc events; returns the join row key for
    /// flattened relationships.
    fn flattened_key(
        &mut self,
        source: &ObjectId,
        target: &ObjectId,
        relationship: &str,
    ) -> Result<Option<FlattenedArcKey>> {
        if self.state != BuilderState::Collecting {
            return Err(Error::state(
                Some(source.to_string()),
                "indirect changes were already processed for this flush",
            ));
        }

        let schema = self.schema;
        let rel = schema.relationship(source.entity_name(), relationship)?;
        if !schema.is_source_independent_from_target_change(rel)? {
            return Ok(None);
        }

        if !source.is_temporary() && self.indirect_seen.insert(source.clone()) {
            self.indirect.push(source.clone());
        }

        if !rel.is_flattened() {
            return Ok(None);
        }
        if rel.read_only {
            return Err(Error::ReadOnly(ReadOnlyError {
                entity: source.entity_name().to_string(),
                relationship: relationship.to_string(),
            }));
        }
        Ok(Some(FlattenedArcKey::new(
            source.clone(),
            target.clone(),
            relationship,
        )))
    }

    /// Finish the cycle and report surviving changes in event order.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn process_indirect_changes(&mut self) -> Result<IndirectChanges> {
        if self.state != BuilderState::Collecting {
            return Err(Error::state(
                None,
                "indirect changes were already processed for this flush",
            ));
        }
        self.state = BuilderState::Classified;

        let changes = IndirectChanges {
            indirect: std::mem::take(&mut self.indirect),
            flattened_inserts: Self::in_order(std::mem::take(&mut self.inserts)),
            flattened_deletes: Self::in_order(std::mem::take(&mut self.deletes)),
        };
        tracing::debug!(
            indirect = changes.indirect.len(),
            inserts = changes.flattened_inserts.len(),
            deletes = changes.flattened_deletes.len(),
            "Classified relationship changes"
        );
        Ok(changes)
    }

    fn in_order(keys: HashMap<FlattenedArcKey, u64>) -> Vec<FlattenedArcKey> {
        let mut keys: Vec<(FlattenedArcKey, u64)> = keys.into_iter().collect();
        keys.sort_by_key(|(_, sequence)| *sequence);
        keys.into_iter().map(|(key, _)| key).collect()
    }
}

/// Classify a complete change stream.
pub fn classify(events: &[GraphChange], schema: &Schema) -> Result<IndirectChanges> {
    let mut builder = IndirectDiffBuilder::new(schema);
    for event in events {
        builder.apply(event)?;
    }
    builder.process_indirect_changes()
}
