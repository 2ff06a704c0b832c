//! Transactions spanning several connections.
//!
//! A [`TransactionCoordinator`] groups the connections opened for one unit of
//! work. Commit and rollback run sequentially over them; there is no two-phase
//! protocol, so a crash between two connection commits leaves the nodes
//! inconsistent.

use relmap_core::error::{TransactionError, TransactionErrorKind};
use relmap_core::{Error, Result, TransactionalConnection};
use std::fmt;

/// Lifecycle status of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    NoTransaction,
    Active,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
    /// A failure occurred; the only way out is a rollback.
    MarkedRollback,
}

impl TransactionStatus {
    /// Status name as used in log output.
    pub fn decode(self) -> &'static str {
        match self {
            TransactionStatus::NoTransaction => "STATUS_NO_TRANSACTION",
            TransactionStatus::Active => "STATUS_ACTIVE",
            TransactionStatus::Committing => "STATUS_COMMITTING",
            TransactionStatus::Committed => "STATUS_COMMITTED",
            TransactionStatus::RollingBack => "STATUS_ROLLING_BACK",
            TransactionStatus::RolledBack => "STATUS_ROLLEDBACK",
            TransactionStatus::MarkedRollback => "STATUS_MARKED_ROLLEDBACK",
        }
    }

    /// Whether the transaction has finished, successfully or not.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransactionStatus::Committed | TransactionStatus::RolledBack
        )
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.decode())
    }
}

/// Who controls commit and rollback of the enlisted connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransactionMode {
    /// relmap turns off auto-commit and commits or rolls back itself.
    #[default]
    Internal,
    /// An outer transaction manager owns the connections; they are only closed.
    External,
}

/// Sequential commit/rollback over the connections of one unit of work.
pub struct TransactionCoordinator<'a, C: ?Sized + TransactionalConnection> {
    mode: TransactionMode,
    status: TransactionStatus,
    connections: Vec<&'a mut C>,
}

impl<C: ?Sized + TransactionalConnection> fmt::Debug for TransactionCoordinator<'_, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionCoordinator")
            .field("mode", &self.mode)
            .field("status", &self.status)
            .field(
                "connections",
                &self.connections.iter().map(|c| c.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl<'a, C: ?Sized + TransactionalConnection> TransactionCoordinator<'a, C> {
    pub fn new(mode: TransactionMode) -> Self {
        Self {
            mode,
            status: TransactionStatus::NoTransaction,
            connections: Vec::new(),
        }
    }

    pub fn mode(&self) -> TransactionMode {
        self.mode
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    fn illegal_state(&self, message: impl Into<String>) -> Error {
        Error::Transaction(TransactionError {
            kind: TransactionErrorKind::IllegalState,
            connection: None,
            status: Some(self.status.decode().to_string()),
            message: message.into(),
            source: None,
        })
    }

    /// Start the transaction. Only allowed once.
    pub fn begin(&mut self) -> Result<()> {
        if self.status != TransactionStatus::NoTransaction {
            return Err(self.illegal_state(format!(
                "transaction must have 'STATUS_NO_TRANSACTION' to begin, current status: {}",
                self.status
            )));
        }
        self.status = TransactionStatus::Active;
        tracing::debug!(mode = ?self.mode, "Transaction started");
        Ok(())
    }

    /// Add a connection, starting the transaction if needed.
    ///
    /// Returns the index to use with [`connection_mut`](Self::connection_mut).
    #[tracing::instrument(level = "debug", skip(self, connection), fields(connection = %connection.name()))]
    pub fn enlist(&mut self, connection: &'a mut C) -> Result<usize> {
        if self.status == TransactionStatus::NoTransaction {
            self.begin()?;
        }
        if self.status != TransactionStatus::Active {
            return Err(self.illegal_state(format!(
                "transaction must have 'STATUS_ACTIVE' to add a connection, current status: {}",
                self.status
            )));
        }
        if self.mode == TransactionMode::Internal {
            if let Err(e) = connection.set_auto_commit(false) {
                // Some drivers refuse; statements still run, just not atomically.
                tracing::warn!(
                    connection = %connection.name(),
                    error = %e,
                    "Can't turn off auto-commit, ignoring"
                );
            }
        }
        self.connections.push(connection);
        Ok(self.connections.len() - 1)
    }

    pub fn connection_mut(&mut self, index: usize) -> Option<&mut C> {
        self.connections.get_mut(index).map(|c| &mut **c)
    }

    /// Mark the transaction so that the next commit rolls back instead.
    pub fn set_rollback_only(&mut self) {
        self.status = TransactionStatus::MarkedRollback;
    }

    /// Commit every connection in enlistment order.
    ///
    /// Once a connection fails to commit, the remaining ones are rolled back
    /// and the first commit failure is returned. Connections committed before
    /// the failure stay committed.
    #[tracing::instrument(level = "debug", skip(self), fields(connections = self.connections.len()))]
    pub fn commit(&mut self) -> Result<()> {
        match self.status {
            TransactionStatus::NoTransaction => return Ok(()),
            TransactionStatus::MarkedRollback => {
                self.rollback()?;
                return Err(self.illegal_state(
                    "transaction was marked rollback-only and has been rolled back",
                ));
            }
            TransactionStatus::Active => {}
            _ => {
                return Err(self.illegal_state(format!(
                    "transaction must have 'STATUS_ACTIVE' to be committed, current status: {}",
                    self.status
                )));
            }
        }

        let result = match self.mode {
            TransactionMode::Internal => self.process_commit(),
            TransactionMode::External => {
                tracing::debug!("No commit, transaction controlled externally");
                Ok(())
            }
        };
        if result.is_ok() {
            self.status = TransactionStatus::Committed;
            tracing::info!(connections = self.connections.len(), "Transaction committed");
        }
        self.close();
        result
    }

    fn process_commit(&mut self) -> Result<()> {
        self.status = TransactionStatus::Committing;
        let mut failure: Option<(String, Error)> = None;

        for connection in &mut self.connections {
            if failure.is_none() {
                if let Err(e) = connection.commit() {
                    failure = Some((connection.name().to_string(), e));
                }
            } else if let Err(e) = connection.rollback() {
                tracing::warn!(
                    connection = %connection.name(),
                    error = %e,
                    "Rollback after failed commit also failed"
                );
            }
        }

        match failure {
            None => Ok(()),
            Some((name, cause)) => {
                self.status = TransactionStatus::MarkedRollback;
                tracing::warn!(connection = %name, error = %cause, "Commit failed, transaction rolled back");
                Err(Error::Transaction(TransactionError {
                    kind: TransactionErrorKind::CommitFailed,
                    connection: Some(name),
                    status: Some(self.status.decode().to_string()),
                    message: format!("commit failed: {cause}"),
                    source: Some(Box::new(cause)),
                }))
            }
        }
    }

    /// Roll back every connection, continuing past failures.
    ///
    /// The last rollback failure, if any, is returned after all connections
    /// were attempted.
    #[tracing::instrument(level = "debug", skip(self), fields(connections = self.connections.len()))]
    pub fn rollback(&mut self) -> Result<()> {
        if matches!(
            self.status,
            TransactionStatus::NoTransaction
                | TransactionStatus::RolledBack
                | TransactionStatus::RollingBack
        ) {
            return Ok(());
        }
        if !matches!(
            self.status,
            TransactionStatus::Active | TransactionStatus::MarkedRollback
        ) {
            return Err(self.illegal_state(format!(
                "transaction must have 'STATUS_ACTIVE' to be rolled back, current status: {}",
                self.status
            )));
        }

        let result = match self.mode {
            TransactionMode::Internal => self.process_rollback(),
            TransactionMode::External => {
                tracing::debug!("No rollback, transaction controlled externally");
                Ok(())
            }
        };
        self.status = TransactionStatus::RolledBack;
        tracing::info!(connections = self.connections.len(), "Transaction rolled back");
        self.close();
        result
    }

    fn process_rollback(&mut self) -> Result<()> {
        self.status = TransactionStatus::RollingBack;
        let mut last: Option<(String, Error)> = None;

        for connection in &mut self.connections {
            if let Err(e) = connection.rollback() {
                if let Some((name, previous)) = &last {
                    tracing::warn!(connection = %name, error = %previous, "Rollback failed");
                }
                last = Some((connection.name().to_string(), e));
            }
        }

        match last {
            None => Ok(()),
            Some((name, cause)) => Err(Error::Transaction(TransactionError {
                kind: TransactionErrorKind::RollbackFailed,
                connection: Some(name),
                status: Some(TransactionStatus::RollingBack.decode().to_string()),
                message: format!("rollback failed: {cause}"),
                source: Some(Box::new(cause)),
            })),
        }
    }

    fn close(&mut self) {
        for connection in &mut self.connections {
            if let Err(e) = connection.close() {
                tracing::warn!(connection = %connection.name(), error = %e, "Error closing connection");
            }
        }
    }

    /// Run `work` inside this transaction.
    ///
    /// Commits when `work` succeeds. When it fails the transaction is rolled
    /// back and the original error is returned.
    pub fn perform<T>(&mut self, work: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if self.status == TransactionStatus::NoTransaction {
            self.begin()?;
        }
        match work(self) {
            Ok(value) => {
                self.commit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = self.rollback() {
                    tracing::warn!(error = %rollback, "Rollback after failed work also failed");
                }
                Err(e)
            }
        }
    }
}
