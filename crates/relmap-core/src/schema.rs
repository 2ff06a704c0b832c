//! Entity, attribute and relationship metadata.
//!
//! Metadata is read-only once assembled into a [`Schema`]. Lookups of unknown
//! names fail fast with a [`MappingError`](crate::error::MappingError).

use crate::error::{Error, MappingError, MappingErrorKind, Result};
use crate::{ObjectId, Value};
use std::collections::BTreeMap;

/// Concurrency control applied when updating or deleting rows of an entity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LockType {
    /// Qualify by primary key only.
    #[default]
    None,
    /// Qualify by primary key plus every attribute flagged `used_for_locking`.
    Optimistic,
}

/// A mapped column of an entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeInfo {
    /// Object-side name.
    pub name: String,
    /// Database column name.
    pub column: String,
    pub primary_key: bool,
    pub used_for_locking: bool,
}

impl AttributeInfo {
    pub fn new(name: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            column: column.into(),
            primary_key: false,
            used_for_locking: false,
        }
    }

    /// Mark this attribute as (part of) the primary key.
    #[must_use]
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    /// Include this attribute in optimistic lock qualifiers.
    #[must_use]
    pub fn used_for_locking(mut self) -> Self {
        self.used_for_locking = true;
        self
    }
}

/// The type of relationship between two entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationshipKind {
    /// One-to-one
    OneToOne,
    /// Many-to-one: the source row holds the foreign key.
    ManyToOne,
    /// One-to-many: the target rows hold the foreign key.
    OneToMany,
    /// Many-to-many through a link table.
    ManyToMany,
}

/// One source column to target column pairing of a relationship join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinColumn {
    pub source: String,
    pub target: String,
}

/// A link table column and the primary key column it copies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkColumn {
    /// Column in the link table.
    pub link_column: String,
    /// Primary key column of the linked entity. `None` means the single PK column.
    pub key_column: Option<String>,
}

/// The implicit join entity backing a flattened relationship.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkTableInfo {
    /// The link table name (e.g., `"ARTIST_GROUP"`).
    pub table_name: String,
    /// Columns pointing to the source entity.
    pub local_columns: Vec<LinkColumn>,
    /// Columns pointing to the target entity.
    pub remote_columns: Vec<LinkColumn>,
}

impl LinkTableInfo {
    /// Link table for single-column primary keys on both ends.
    pub fn new(
        table_name: impl Into<String>,
        local_column: impl Into<String>,
        remote_column: impl Into<String>,
    ) -> Self {
        Self {
            table_name: table_name.into(),
            local_columns: vec![LinkColumn {
                link_column: local_column.into(),
                key_column: None,
            }],
            remote_columns: vec![LinkColumn {
                link_column: remote_column.into(),
                key_column: None,
            }],
        }
    }

    /// Link table for compound keys, given as `(link column, key column)` pairs.
    pub fn composite(
        table_name: impl Into<String>,
        local_columns: &[(&str, &str)],
        remote_columns: &[(&str, &str)],
    ) -> Self {
        let to_link = |pairs: &[(&str, &str)]| {
            pairs
                .iter()
                .map(|(link, key)| LinkColumn {
                    link_column: (*link).to_string(),
                    key_column: Some((*key).to_string()),
                })
                .collect()
        };
        Self {
            table_name: table_name.into(),
            local_columns: to_link(local_columns),
            remote_columns: to_link(remote_columns),
        }
    }

    /// Link row columns and values identifying `source` on the local side.
    pub fn local_values(&self, source: &ObjectId) -> Result<Vec<(String, Value)>> {
        Self::link_values(&self.table_name, &self.local_columns, source)
    }

    /// Link row columns and values identifying `target` on the remote side.
    pub fn remote_values(&self, target: &ObjectId) -> Result<Vec<(String, Value)>> {
        Self::link_values(&self.table_name, &self.remote_columns, target)
    }

    fn link_values(
        table: &str,
        columns: &[LinkColumn],
        id: &ObjectId,
    ) -> Result<Vec<(String, Value)>> {
        columns
            .iter()
            .map(|column| {
                let value = match &column.key_column {
                    Some(key) => id.pk_value(key),
                    None => id.single_pk_value(),
                };
                value
                    .map(|v| (column.link_column.clone(), v.clone()))
                    .ok_or_else(|| {
                        Error::Mapping(MappingError {
                            kind: MappingErrorKind::MissingPrimaryKey,
                            entity: id.entity_name().to_string(),
                            name: Some(column.link_column.clone()),
                            message: format!(
                                "cannot fill link column '{}.{}' from {}",
                                table, column.link_column, id
                            ),
                        })
                    })
            })
            .collect()
    }
}

/// A relationship from one entity to another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipInfo {
    pub name: String,
    pub target_entity: String,
    pub kind: RelationshipKind,
    /// Direct join columns. Empty for flattened relationships.
    pub joins: Vec<JoinColumn>,
    /// Set for flattened relationships.
    pub link_table: Option<LinkTableInfo>,
    pub read_only: bool,
    /// The target's primary key is propagated from the source's.
    pub to_dependent_pk: bool,
}

impl RelationshipInfo {
    fn new(name: impl Into<String>, target_entity: impl Into<String>, kind: RelationshipKind) -> Self {
        Self {
            name: name.into(),
            target_entity: target_entity.into(),
            kind,
            joins: Vec::new(),
            link_table: None,
            read_only: false,
            to_dependent_pk: false,
        }
    }

    pub fn many_to_one(name: impl Into<String>, target_entity: impl Into<String>) -> Self {
        Self::new(name, target_entity, RelationshipKind::ManyToOne)
    }

    pub fn one_to_one(name: impl Into<String>, target_entity: impl Into<String>) -> Self {
        Self::new(name, target_entity, RelationshipKind::OneToOne)
    }

    pub fn one_to_many(name: impl Into<String>, target_entity: impl Into<String>) -> Self {
        Self::new(name, target_entity, RelationshipKind::OneToMany)
    }

    /// Flattened many-to-many relationship through `link_table`.
    pub fn many_to_many(
        name: impl Into<String>,
        target_entity: impl Into<String>,
        link_table: LinkTableInfo,
    ) -> Self {
        let mut rel = Self::new(name, target_entity, RelationshipKind::ManyToMany);
        rel.link_table = Some(link_table);
        rel
    }

    /// Add a join column pair (source column, target column).
    #[must_use]
    pub fn join(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.joins.push(JoinColumn {
            source: source.into(),
            target: target.into(),
        });
        self
    }

    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    #[must_use]
    pub fn to_dependent_pk(mut self) -> Self {
        self.to_dependent_pk = true;
        self
    }

    pub fn is_to_many(&self) -> bool {
        matches!(
            self.kind,
            RelationshipKind::OneToMany | RelationshipKind::ManyToMany
        )
    }

    pub fn is_flattened(&self) -> bool {
        self.link_table.is_some()
    }
}

/// Mapping of one entity to a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDescriptor {
    pub name: String,
    pub table: String,
    pub attributes: Vec<AttributeInfo>,
    pub relationships: Vec<RelationshipInfo>,
    pub lock_type: LockType,
    /// Parent entity in an inheritance hierarchy.
    pub super_entity: Option<String>,
}

impl EntityDescriptor {
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            attributes: Vec::new(),
            relationships: Vec::new(),
            lock_type: LockType::None,
            super_entity: None,
        }
    }

    #[must_use]
    pub fn with_attribute(mut self, attribute: AttributeInfo) -> Self {
        self.attributes.push(attribute);
        self
    }

    #[must_use]
    pub fn with_relationship(mut self, relationship: RelationshipInfo) -> Self {
        self.relationships.push(relationship);
        self
    }

    #[must_use]
    pub fn optimistic_locking(mut self) -> Self {
        self.lock_type = LockType::Optimistic;
        self
    }

    #[must_use]
    pub fn inherits(mut self, super_entity: impl Into<String>) -> Self {
        self.super_entity = Some(super_entity.into());
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeInfo> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn attribute_for_column(&self, column: &str) -> Option<&AttributeInfo> {
        self.attributes.iter().find(|a| a.column == column)
    }

    pub fn relationship(&self, name: &str) -> Option<&RelationshipInfo> {
        self.relationships.iter().find(|r| r.name == name)
    }

    pub fn pk_columns(&self) -> Vec<&str> {
        self.attributes
            .iter()
            .filter(|a| a.primary_key)
            .map(|a| a.column.as_str())
            .collect()
    }

    /// Attributes whose snapshot values qualify optimistic updates.
    pub fn locking_attributes(&self) -> impl Iterator<Item = &AttributeInfo> {
        let optimistic = self.lock_type == LockType::Optimistic;
        self.attributes
            .iter()
            .filter(move |a| optimistic && a.used_for_locking && !a.primary_key)
    }

    /// To-one relationships whose foreign key lives on this entity's table.
    pub fn foreign_key_relationships(&self) -> impl Iterator<Item = &RelationshipInfo> {
        self.relationships
            .iter()
            .filter(|r| !r.is_to_many() && !r.is_flattened() && !r.joins.is_empty())
    }
}

/// One resolved step of an object path.
#[derive(Debug, Clone, Copy)]
pub enum PathComponent<'a> {
    Attribute(&'a AttributeInfo),
    Relationship(&'a RelationshipInfo),
}

/// Read-only registry of entity descriptors.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    entities: BTreeMap<String, EntityDescriptor>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_entity(mut self, entity: EntityDescriptor) -> Self {
        self.add_entity(entity);
        self
    }

    pub fn add_entity(&mut self, entity: EntityDescriptor) {
        self.entities.insert(entity.name.clone(), entity);
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntityDescriptor> {
        self.entities.values()
    }

    pub fn entity(&self, name: &str) -> Result<&EntityDescriptor> {
        self.entities
            .get(name)
            .ok_or_else(|| Error::unknown_entity(name))
    }

    pub fn relationship(&self, entity: &str, name: &str) -> Result<&RelationshipInfo> {
        self.entity(entity)?
            .relationship(name)
            .ok_or_else(|| Error::unknown_relationship(entity, name))
    }

    /// Top of the inheritance hierarchy `entity` belongs to.
    pub fn root_entity(&self, entity: &str) -> Result<&EntityDescriptor> {
        let mut current = self.entity(entity)?;
        let mut visited = vec![current.name.as_str()];
        while let Some(parent) = &current.super_entity {
            if visited.contains(&parent.as_str()) {
                return Err(Error::Mapping(MappingError {
                    kind: MappingErrorKind::InheritanceCycle,
                    entity: entity.to_string(),
                    name: Some(parent.clone()),
                    message: format!(
                        "entity '{entity}' inherits from itself via {}",
                        visited.join(" -> ")
                    ),
                }));
            }
            current = self.entity(parent)?;
            visited.push(current.name.as_str());
        }
        Ok(current)
    }

    pub fn has_sub_entities(&self, entity: &str) -> bool {
        self.entities
            .values()
            .any(|e| e.super_entity.as_deref() == Some(entity))
    }

    /// Whether a to-one relationship joins exactly onto the target's primary key.
    pub fn is_to_pk(&self, relationship: &RelationshipInfo) -> Result<bool> {
        if relationship.is_to_many() || relationship.joins.is_empty() {
            return Ok(false);
        }
        let target = self.entity(&relationship.target_entity)?;
        let pk = target.pk_columns();
        Ok(relationship
            .joins
            .iter()
            .all(|j| pk.contains(&j.target.as_str())))
    }

    /// Whether changing the relationship's target leaves the source row unchanged.
    ///
    /// True for to-many and flattened relationships and for to-one relationships
    /// that do not point at the target's primary key through a source-side key.
    pub fn is_source_independent_from_target_change(
        &self,
        relationship: &RelationshipInfo,
    ) -> Result<bool> {
        Ok(relationship.is_to_many()
            || relationship.is_flattened()
            || relationship.to_dependent_pk
            || !self.is_to_pk(relationship)?)
    }

    /// Entities whose rows `entity` references through foreign keys.
    pub fn dependencies(&self, entity: &str) -> Result<Vec<&str>> {
        let descriptor = self.entity(entity)?;
        let mut deps = Vec::new();
        for rel in descriptor.foreign_key_relationships() {
            if self.is_to_pk(rel)? && !rel.to_dependent_pk && rel.target_entity != entity {
                deps.push(rel.target_entity.as_str());
            }
        }
        Ok(deps)
    }

    /// Resolve a dot-separated object path starting at `entity`.
    pub fn resolve_path<'a>(&'a self, entity: &str, path: &str) -> Result<Vec<PathComponent<'a>>> {
        let mut current = self.entity(entity)?;
        let mut components = Vec::new();
        let mut segments = path.split('.').peekable();
        while let Some(segment) = segments.next() {
            if let Some(attribute) = current.attribute(segment) {
                if segments.peek().is_some() {
                    return Err(Error::Mapping(MappingError {
                        kind: MappingErrorKind::UnknownRelationship,
                        entity: current.name.clone(),
                        name: Some(segment.to_string()),
                        message: format!(
                            "'{}' in path '{}' is an attribute and cannot be traversed",
                            segment, path
                        ),
                    }));
                }
                components.push(PathComponent::Attribute(attribute));
            } else if let Some(rel) = current.relationship(segment) {
                components.push(PathComponent::Relationship(rel));
                current = self.entity(&rel.target_entity)?;
            } else {
                return Err(Error::unknown_attribute(current.name.clone(), segment));
            }
        }
        Ok(components)
    }
}
