//! Graph change events recorded during one flush cycle.

use relmap_core::{ObjectId, Value};
use std::fmt;

/// One edit of the in-memory object graph.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphChange {
    NodeCreated(ObjectId),
    NodeRemoved(ObjectId),
    NodeIdChanged {
        old: ObjectId,
        new: ObjectId,
    },
    PropertyChanged {
        id: ObjectId,
        property: String,
        old: Value,
        new: Value,
    },
    ArcCreated {
        source: ObjectId,
        target: ObjectId,
        relationship: String,
    },
    ArcDeleted {
        source: ObjectId,
        target: ObjectId,
        relationship: String,
    },
}

impl GraphChange {
    pub fn arc_created(source: &ObjectId, target: &ObjectId, relationship: &str) -> Self {
        GraphChange::ArcCreated {
            source: source.clone(),
            target: target.clone(),
            relationship: relationship.to_string(),
        }
    }

    pub fn arc_deleted(source: &ObjectId, target: &ObjectId, relationship: &str) -> Self {
        GraphChange::ArcDeleted {
            source: source.clone(),
            target: target.clone(),
            relationship: relationship.to_string(),
        }
    }

    pub fn is_arc(&self) -> bool {
        matches!(
            self,
            GraphChange::ArcCreated { .. } | GraphChange::ArcDeleted { .. }
        )
    }
}

impl fmt::Display for GraphChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphChange::NodeCreated(id) => write!(f, "created {id}"),
            GraphChange::NodeRemoved(id) => write!(f, "removed {id}"),
            GraphChange::NodeIdChanged { old, new } => write!(f, "id {old} -> {new}"),
            GraphChange::PropertyChanged { id, property, .. } => write!(f, "{id}.{property} set"),
            GraphChange::ArcCreated {
                source,
                target,
                relationship,
            } => write!(f, "{source}.{relationship} += {target}"),
            GraphChange::ArcDeleted {
                source,
                target,
                relationship,
            } => write!(f, "{source}.{relationship} -= {target}"),
        }
    }
}

/// Ordered list of graph changes since the last commit or rollback.
#[derive(Debug, Default, Clone)]
pub struct ChangeLog {
    events: Vec<GraphChange>,
}

impl ChangeLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: GraphChange) {
        tracing::trace!(event = %event, "Graph change");
        self.events.push(event);
    }

    pub fn events(&self) -> &[GraphChange] {
        &self.events
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// Drop every arc event with `id` at either end.
    ///
    /// Used when a NEW object is forgotten: no join row can exist for it.
    pub fn forget_arcs_of(&mut self, id: &ObjectId) -> usize {
        let before = self.events.len();
        self.events.retain(|event| match event {
            GraphChange::ArcCreated { source, target, .. }
            | GraphChange::ArcDeleted { source, target, .. } => source != id && target != id,
            _ => true,
        });
        before - self.events.len()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
