//! Optimistic locking failures.

use crate::connection::SnapshotFetcher;
use crate::error::Result;
use crate::{DataRow, ObjectId};
use std::fmt;

/// Raised when an UPDATE or DELETE qualified by last-confirmed values matched
/// no row.
///
/// Carries what is needed to show the caller both sides of the conflict: the
/// expected values and, through [`fetch_current_snapshot`], the row as it is now.
///
/// [`fetch_current_snapshot`]: OptimisticLockFailure::fetch_current_snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct OptimisticLockFailure {
    object_id: ObjectId,
    root_entity: String,
    sql: String,
    qualifier: DataRow,
    pk_columns: Vec<String>,
}

impl OptimisticLockFailure {
    pub fn new(
        object_id: ObjectId,
        root_entity: impl Into<String>,
        sql: impl Into<String>,
        qualifier: DataRow,
        pk_columns: Vec<String>,
    ) -> Self {
        Self {
            object_id,
            root_entity: root_entity.into(),
            sql: sql.into(),
            qualifier,
            pk_columns,
        }
    }

    pub fn object_id(&self) -> &ObjectId {
        &self.object_id
    }

    pub fn root_entity(&self) -> &str {
        &self.root_entity
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Expected column values used in the WHERE clause.
    pub fn qualifier(&self) -> &DataRow {
        &self.qualifier
    }

    /// Primary key columns of the qualifier snapshot.
    pub fn primary_key(&self) -> DataRow {
        self.qualifier
            .project(self.pk_columns.iter().map(String::as_str))
    }

    /// Select the row by the qualifier's primary key.
    ///
    /// Returns `None` if the row was deleted concurrently.
    #[tracing::instrument(level = "debug", skip(self, fetcher), fields(id = %self.object_id))]
    pub fn fetch_current_snapshot(
        &self,
        fetcher: &mut dyn SnapshotFetcher,
    ) -> Result<Option<DataRow>> {
        let pk = self.primary_key();
        let row = fetcher.fetch_snapshot(&self.root_entity, &pk)?;
        tracing::debug!(found = row.is_some(), "Fetched current snapshot after lock failure");
        Ok(row)
    }
}

impl fmt::Display for OptimisticLockFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no row matched for {} using [", self.object_id)?;
        for (i, (column, value)) in self.qualifier.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{column}={value}")?;
        }
        write!(f, "] (SQL: {})", self.sql)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Value;

    struct Fixed(Option<DataRow>, Vec<DataRow>);

    impl SnapshotFetcher for Fixed {
        fn fetch_snapshot(&mut self, _entity: &str, primary_key: &DataRow) -> Result<Option<DataRow>> {
            self.1.push(primary_key.clone());
            Ok(self.0.clone())
        }
    }

    fn failure() -> OptimisticLockFailure {
        OptimisticLockFailure::new(
            ObjectId::single("Painting", "ID", 1),
            "Painting",
            "UPDATE \"PAINTING\" SET \"TITLE\" = $1 WHERE \"ID\" = $2 AND \"VERSION\" = $3",
            DataRow::new().with("ID", 1).with("VERSION", 1),
            vec!["ID".to_string()],
        )
    }

    #[test]
    fn refetch_uses_primary_key_only() {
        let current = DataRow::new().with("ID", 1).with("VERSION", 2);
        let mut fetcher = Fixed(Some(current.clone()), Vec::new());

        let row = failure().fetch_current_snapshot(&mut fetcher).unwrap();
        assert_eq!(row, Some(current));
        assert_eq!(fetcher.1.len(), 1);
        assert_eq!(fetcher.1[0].columns(), &["ID".to_string()]);
        assert_eq!(fetcher.1[0].get("ID"), Some(&Value::Int(1)));
    }

    #[test]
    fn refetch_of_deleted_row_is_none() {
        let mut fetcher = Fixed(None, Vec::new());
        assert_eq!(failure().fetch_current_snapshot(&mut fetcher).unwrap(), None);
    }

    #[test]
    fn display_lists_expected_values() {
        let text = failure().to_string();
        assert!(text.contains("VERSION=1"));
        assert!(text.contains("UPDATE"));
    }
}
