//! Persistent object identity.
//!
//! An [`ObjectId`] names one database row by entity name plus primary key
//! values. Newly created objects get a temporary id that is swapped for a
//! permanent one once the key is known at flush time.

use crate::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_TEMPORARY_KEY: AtomicU64 = AtomicU64::new(1);

/// Unique identifier of a persistent object.
///
/// Primary key values are stored ordered by column name, so ids built from the
/// same columns in a different order compare and hash the same.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectId {
    entity_name: String,
    pk_values: BTreeMap<String, Value>,
    /// Set only for temporary ids.
    temporary_key: Option<u64>,
}

/// Integer key values compare by magnitude, matching `Value`'s hash.
fn key_value_eq(a: &Value, b: &Value) -> bool {
    match (a.as_i64(), b.as_i64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

impl PartialEq for ObjectId {
    fn eq(&self, other: &Self) -> bool {
        self.entity_name == other.entity_name
            && self.temporary_key == other.temporary_key
            && self.pk_values.len() == other.pk_values.len()
            && self
                .pk_values
                .iter()
                .zip(&other.pk_values)
                .all(|((ca, va), (cb, vb))| ca == cb && key_value_eq(va, vb))
    }
}

impl Eq for ObjectId {}

impl Hash for ObjectId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.entity_name.hash(state);
        self.temporary_key.hash(state);
        for (column, value) in &self.pk_values {
            column.hash(state);
            value.hash(state);
        }
    }
}

impl ObjectId {
    /// Create a permanent id from primary key column/value pairs.
    pub fn new<K, V>(entity_name: impl Into<String>, pk: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        Self {
            entity_name: entity_name.into(),
            pk_values: pk
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            temporary_key: None,
        }
    }

    /// Create a permanent id with a single primary key column.
    pub fn single(
        entity_name: impl Into<String>,
        column: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        Self::new(entity_name, [(column.into(), value.into())])
    }

    /// Create a fresh temporary id, unique within this process.
    pub fn temporary(entity_name: impl Into<String>) -> Self {
        Self {
            entity_name: entity_name.into(),
            pk_values: BTreeMap::new(),
            temporary_key: Some(NEXT_TEMPORARY_KEY.fetch_add(1, Ordering::Relaxed)),
        }
    }

    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    pub fn is_temporary(&self) -> bool {
        self.temporary_key.is_some()
    }

    /// Primary key values keyed by column name. Empty for temporary ids.
    pub fn pk_values(&self) -> &BTreeMap<String, Value> {
        &self.pk_values
    }

    pub fn pk_value(&self, column: &str) -> Option<&Value> {
        self.pk_values.get(column)
    }

    /// The only primary key value, if the key is not compound.
    pub fn single_pk_value(&self) -> Option<&Value> {
        if self.pk_values.len() == 1 {
            self.pk_values.values().next()
        } else {
            None
        }
    }

    /// Permanent id of the same entity with the given key values.
    pub fn to_permanent<K, V>(&self, pk: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        Self::new(self.entity_name.clone(), pk)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<ObjectId:{}", self.entity_name)?;
        if let Some(key) = self.temporary_key {
            write!(f, ", TEMP:{key}")?;
        }
        for (column, value) in &self.pk_values {
            write!(f, ", {column}={value}")?;
        }
        write!(f, ">")
    }
}
