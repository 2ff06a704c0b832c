//! Object context configuration.

use crate::transaction::TransactionMode;
use relmap_core::Dialect;

/// Configuration for an [`ObjectContext`](crate::ObjectContext).
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// SQL dialect used for generated statements.
    pub dialect: Dialect,
    /// Invalidate resolved to-many relationships when an object is refreshed.
    pub invalidate_to_many_on_refresh: bool,
    /// Merge snapshots changed outside this context into registered objects.
    pub merge_external_changes: bool,
    /// Whether commit and rollback are propagated to connections.
    pub transaction_mode: TransactionMode,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            dialect: Dialect::default(),
            invalidate_to_many_on_refresh: true,
            merge_external_changes: true,
            transaction_mode: TransactionMode::Internal,
        }
    }
}

impl ContextConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    #[must_use]
    pub fn invalidate_to_many_on_refresh(mut self, value: bool) -> Self {
        self.invalidate_to_many_on_refresh = value;
        self
    }

    #[must_use]
    pub fn merge_external_changes(mut self, value: bool) -> Self {
        self.merge_external_changes = value;
        self
    }

    #[must_use]
    pub fn transaction_mode(mut self, mode: TransactionMode) -> Self {
        self.transaction_mode = mode;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ContextConfig::default();
        assert_eq!(config.dialect, Dialect::Postgres);
        assert!(config.invalidate_to_many_on_refresh);
        assert!(config.merge_external_changes);
        assert_eq!(config.transaction_mode, TransactionMode::Internal);
    }

    #[test]
    fn builder() {
        let config = ContextConfig::new()
            .dialect(Dialect::Sqlite)
            .merge_external_changes(false)
            .transaction_mode(TransactionMode::External);
        assert_eq!(config.dialect, Dialect::Sqlite);
        assert!(!config.merge_external_changes);
        assert_eq!(config.transaction_mode, TransactionMode::External);
    }
}
