//! Row snapshots.

use crate::error::{Error, MappingError, MappingErrorKind, Result};
use crate::{ObjectId, Value};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_VERSION: AtomicU64 = AtomicU64::new(1);

/// Allocate a new snapshot version stamp.
pub fn next_version() -> u64 {
    NEXT_VERSION.fetch_add(1, Ordering::Relaxed)
}

/// A point-in-time, column-keyed view of one database row.
///
/// Columns keep insertion order. A column that is absent is unknown, which is
/// different from a column that is present with [`Value::Null`]; snapshots with
/// absent columns are partial and are not authoritative for those columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRow {
    columns: Vec<String>,
    values: Vec<Value>,
    version: u64,
}

impl Default for DataRow {
    fn default() -> Self {
        Self::new()
    }
}

impl DataRow {
    /// Create an empty snapshot with a fresh version stamp.
    pub fn new() -> Self {
        Self {
            columns: Vec::new(),
            values: Vec::new(),
            version: next_version(),
        }
    }

    /// Builder-style column setter.
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(column, value);
        self
    }

    /// Builder-style version override.
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    /// Number of columns present.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    fn position(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }

    /// Value for `column`, or `None` if the column is absent.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.position(column).map(|i| &self.values[i])
    }

    pub fn contains(&self, column: &str) -> bool {
        self.position(column).is_some()
    }

    /// Set a column, replacing any previous value in place.
    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        let column = column.into();
        let value = value.into();
        match self.position(&column) {
            Some(i) => Some(std::mem::replace(&mut self.values[i], value)),
            None => {
                self.columns.push(column);
                self.values.push(value);
                None
            }
        }
    }

    pub fn remove(&mut self, column: &str) -> Option<Value> {
        let i = self.position(column)?;
        self.columns.remove(i);
        Some(self.values.remove(i))
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Iterate `(column, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }

    /// Copy of this row restricted to `columns`, keeping this row's version.
    ///
    /// Columns missing here stay missing in the result.
    pub fn project<'a>(&self, columns: impl IntoIterator<Item = &'a str>) -> DataRow {
        let mut row = DataRow {
            columns: Vec::new(),
            values: Vec::new(),
            version: self.version,
        };
        for column in columns {
            if let Some(value) = self.get(column) {
                row.insert(column, value.clone());
            }
        }
        row
    }

    /// Build the identity of the row for `entity` from its primary key columns.
    pub fn object_id(&self, entity: &str, pk_columns: &[&str]) -> Result<ObjectId> {
        let mut pk = Vec::with_capacity(pk_columns.len());
        for column in pk_columns {
            match self.get(column) {
                Some(value) if !value.is_null() => pk.push(((*column).to_string(), value.clone())),
                _ => {
                    return Err(Error::Mapping(MappingError {
                        kind: MappingErrorKind::MissingPrimaryKey,
                        entity: entity.to_string(),
                        name: Some((*column).to_string()),
                        message: format!(
                            "snapshot has no value for primary key column '{column}' of '{entity}'"
                        ),
                    }));
                }
            }
        }
        Ok(ObjectId::new(entity, pk))
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for DataRow {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut row = DataRow::new();
        for (k, v) in iter {
            row.insert(k, v);
        }
        row
    }
}
