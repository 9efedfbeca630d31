pub mod config;
pub mod pool;

use crate::core::{ContributionId, DbError, ResourceId, Result};
use crate::storage::AggregateStore;
use crate::transaction::{Transaction, TransactionId};
use std::sync::Arc;
use std::time::Duration;

/// Store connection handle
///
/// Each concurrent unit of work uses its own connection, and a connection
/// runs at most one transaction at a time. Statements issued outside an
/// explicit transaction run in autocommit mode.
pub struct Connection {
    /// Unique connection ID
    id: u64,
    /// Shared store instance
    store: Arc<AggregateStore>,
    /// Connection state
    state: ConnectionState,
    /// Active transaction (if any)
    transaction: Option<Transaction>,
    /// Set while an autocommit transaction is open
    implicit: bool,
    lock_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Active,
    InTransaction,
    Closed,
}

impl Connection {
    /// Create a new connection (internal use)
    pub(crate) fn new(id: u64, store: Arc<AggregateStore>, lock_timeout: Option<Duration>) -> Self {
        Self {
            id,
            store,
            state: ConnectionState::Active,
            transaction: None,
            implicit: false,
            lock_timeout,
        }
    }

    /// Get connection ID
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn store(&self) -> &Arc<AggregateStore> {
        &self.store
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state == ConnectionState::Closed {
            return Err(DbError::ExecutionError("Connection is closed".into()));
        }
        Ok(())
    }

    fn transaction_mut(&mut self) -> Result<&mut Transaction> {
        self.transaction
            .as_mut()
            .ok_or_else(|| DbError::ExecutionError("No active transaction".into()))
    }

    /// Begin a new transaction
    ///
    /// # Examples
    ///
    /// ```ignore
    /// conn.begin().await?;
    /// let stock = conn.lock_and_read(item).await?;
    /// conn.write(item, stock + 10).await?;
    /// conn.commit().await?;
    /// ```
    pub async fn begin(&mut self) -> Result<TransactionId> {
        self.ensure_open()?;

        if self.implicit {
            self.rollback_now()?;
        }
        if self.state == ConnectionState::InTransaction {
            return Err(DbError::ExecutionError("Transaction already active".into()));
        }

        let tx = self.store.begin(self.lock_timeout)?;
        let id = tx.id();
        self.transaction = Some(tx);
        self.state = ConnectionState::InTransaction;

        Ok(id)
    }

    /// Commit the current transaction, releasing its row locks
    pub async fn commit(&mut self) -> Result<()> {
        if self.state != ConnectionState::InTransaction {
            return Err(DbError::ExecutionError("No active transaction".into()));
        }

        let result = match self.transaction.as_mut() {
            Some(tx) => self.store.commit(tx).await.map(|_| ()),
            None => Err(DbError::ExecutionError("No active transaction".into())),
        };

        // Committed or aborted, the transaction is finished either way.
        self.finish_transaction();
        result
    }

    /// Rollback the current transaction
    pub async fn rollback(&mut self) -> Result<()> {
        if self.state != ConnectionState::InTransaction {
            return Err(DbError::ExecutionError("No active transaction".into()));
        }
        self.rollback_now()
    }

    /// Synchronous rollback used by `Drop` paths
    pub(crate) fn rollback_now(&mut self) -> Result<()> {
        let result = match self.transaction.as_mut() {
            Some(tx) => self.store.rollback(tx),
            None => Ok(()),
        };
        self.finish_transaction();
        result
    }

    fn finish_transaction(&mut self) {
        self.transaction = None;
        self.implicit = false;
        if self.state == ConnectionState::InTransaction {
            self.state = ConnectionState::Active;
        }
    }

    /// Check if connection is in a transaction
    pub fn is_in_transaction(&self) -> bool {
        self.state == ConnectionState::InTransaction
    }

    pub fn transaction_id(&self) -> Option<TransactionId> {
        self.transaction.as_ref().map(Transaction::id)
    }

    /// Check if connection is active
    pub fn is_active(&self) -> bool {
        self.state != ConnectionState::Closed
    }

    /// Close the connection
    pub fn close(&mut self) -> Result<()> {
        if self.state == ConnectionState::InTransaction {
            self.rollback_now()?;
        }

        self.state = ConnectionState::Closed;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    /// Unlocked read of the last committed total
    pub async fn get(&self, resource: ResourceId) -> Result<u64> {
        self.ensure_open()?;
        self.store.get(resource).await
    }

    /// Lock the row and read its total; requires an explicit transaction
    pub async fn lock_and_read(&mut self, resource: ResourceId) -> Result<u64> {
        self.ensure_open()?;
        let store = Arc::clone(&self.store);
        let tx = self.transaction_mut()?;
        store.lock_and_read(resource, tx).await
    }

    /// Buffer a new total for a row locked by the current transaction
    pub async fn write(&mut self, resource: ResourceId, new_total: u64) -> Result<()> {
        self.ensure_open()?;
        let store = Arc::clone(&self.store);
        let tx = self.transaction_mut()?;
        store.write(resource, new_total, tx).await
    }

    pub async fn mark_applied(&mut self, contribution: ContributionId) -> Result<()> {
        self.ensure_open()?;
        let store = Arc::clone(&self.store);
        let tx = self.transaction_mut()?;
        store.mark_applied(contribution, tx)
    }

    /// Unconditional overwrite of a row's total.
    ///
    /// Behaves like a single `UPDATE ... SET total = ?` statement: it waits
    /// for the row lock only long enough to write, and does not re-read.
    pub async fn overwrite(&mut self, resource: ResourceId, new_total: u64) -> Result<()> {
        let implicit = self.begin_implicit().await?;
        let result = async {
            let store = Arc::clone(&self.store);
            let tx = self.transaction_mut()?;
            store.lock_and_read(resource, tx).await?;
            store.write(resource, new_total, tx).await
        }
        .await;
        self.finish_implicit(implicit, result).await
    }

    pub async fn create_resource(&mut self, resource: ResourceId, initial_total: u64) -> Result<()> {
        let implicit = self.begin_implicit().await?;
        let result = async {
            let store = Arc::clone(&self.store);
            let tx = self.transaction_mut()?;
            store.create_resource(resource, initial_total, tx).await
        }
        .await;
        self.finish_implicit(implicit, result).await
    }

    pub async fn delete_resource(&mut self, resource: ResourceId) -> Result<()> {
        let implicit = self.begin_implicit().await?;
        let result = async {
            let store = Arc::clone(&self.store);
            let tx = self.transaction_mut()?;
            store.delete_resource(resource, tx).await
        }
        .await;
        self.finish_implicit(implicit, result).await
    }

    /// Begin an autocommit transaction when none is active.
    ///
    /// An autocommit transaction left open by a cancelled statement is
    /// rolled back first.
    async fn begin_implicit(&mut self) -> Result<bool> {
        self.ensure_open()?;
        if self.implicit {
            self.rollback_now()?;
        }
        if self.is_in_transaction() {
            return Ok(false);
        }
        self.begin().await?;
        self.implicit = true;
        Ok(true)
    }

    async fn finish_implicit<T>(&mut self, implicit: bool, result: Result<T>) -> Result<T> {
        if !implicit {
            return result;
        }
        match result {
            Ok(value) => {
                self.commit().await?;
                Ok(value)
            }
            Err(err) => {
                self.rollback_now()?;
                Err(err)
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // Ensure connection is closed and transaction rolled back
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_connection() -> Connection {
        Connection::new(1, Arc::new(AggregateStore::new()), None)
    }

    #[tokio::test]
    async fn test_connection_creation() {
        let conn = create_test_connection();
        assert_eq!(conn.id(), 1);
        assert!(conn.is_active());
        assert!(!conn.is_in_transaction());
    }

    #[tokio::test]
    async fn test_transaction_lifecycle() {
        let mut conn = create_test_connection();

        assert!(conn.begin().await.is_ok());
        assert!(conn.is_in_transaction());
        assert!(conn.begin().await.is_err());

        assert!(conn.commit().await.is_ok());
        assert!(!conn.is_in_transaction());
        assert!(conn.commit().await.is_err());
    }

    #[tokio::test]
    async fn test_autocommit_statements() {
        let mut conn = create_test_connection();

        conn.create_resource(ResourceId(1), 5).await.unwrap();
        conn.overwrite(ResourceId(1), 12).await.unwrap();

        assert!(!conn.is_in_transaction());
        assert_eq!(conn.get(ResourceId(1)).await.unwrap(), 12);
    }

    #[tokio::test]
    async fn test_lock_and_read_requires_transaction() {
        let mut conn = create_test_connection();
        conn.create_resource(ResourceId(1), 0).await.unwrap();

        assert!(conn.lock_and_read(ResourceId(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_failed_autocommit_rolls_back() {
        let mut conn = create_test_connection();

        let result = conn.overwrite(ResourceId(99), 1).await;
        assert!(matches!(result, Err(DbError::ResourceNotFound(_))));
        assert!(!conn.is_in_transaction());
        assert!(!conn.store().lock_manager().is_locked(ResourceId(99)).unwrap());
    }

    #[tokio::test]
    async fn test_connection_close() {
        let mut conn = create_test_connection();
        conn.create_resource(ResourceId(1), 0).await.unwrap();

        assert!(conn.close().is_ok());
        assert!(!conn.is_active());

        // Should fail after close
        assert!(conn.get(ResourceId(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_cancelled_autocommit_is_discarded() {
        let mut conn = create_test_connection();
        conn.create_resource(ResourceId(1), 0).await.unwrap();

        // Leave an autocommit statement half-done
        conn.begin_implicit().await.unwrap();
        assert!(conn.is_in_transaction());

        conn.overwrite(ResourceId(1), 3).await.unwrap();
        assert!(!conn.is_in_transaction());
        assert_eq!(conn.get(ResourceId(1)).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_auto_rollback_on_drop() {
        let store = Arc::new(AggregateStore::new());
        let mut conn = Connection::new(1, Arc::clone(&store), None);
        conn.create_resource(ResourceId(1), 0).await.unwrap();

        conn.begin().await.unwrap();
        conn.lock_and_read(ResourceId(1)).await.unwrap();
        conn.write(ResourceId(1), 50).await.unwrap();

        // Drop should auto-rollback and release the row lock
        drop(conn);

        assert_eq!(store.get(ResourceId(1)).await.unwrap(), 0);
        assert!(!store.lock_manager().is_locked(ResourceId(1)).unwrap());
    }
}
