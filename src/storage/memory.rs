use super::{AggregateTable, RowLockManager};
use crate::contribution::ContributionLedger;
use crate::core::{AggregateRow, ContributionId, DbError, ResourceId, Result};
use crate::transaction::{Change, PendingRow, Transaction, TransactionManager, TransactionStats};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, trace};

/// In-memory aggregate store.
///
/// Committed rows live behind a table-wide `RwLock` that is only ever held
/// for the duration of a single read or a single commit. Write ordering
/// between transactions comes from the per-row locks in [`RowLockManager`],
/// which a transaction keeps from `lock_and_read` until it commits or rolls
/// back. Commit publishes the buffered changes before releasing those locks,
/// so the next holder always reads the value just committed.
pub struct AggregateStore {
    table: RwLock<AggregateTable>,
    locks: RowLockManager,
    ledger: ContributionLedger,
    transaction_manager: Arc<TransactionManager>,
}

impl AggregateStore {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(AggregateTable::new()),
            locks: RowLockManager::new(),
            ledger: ContributionLedger::new(),
            transaction_manager: Arc::new(TransactionManager::new()),
        }
    }

    pub fn ledger(&self) -> &ContributionLedger {
        &self.ledger
    }

    pub fn transaction_manager(&self) -> &Arc<TransactionManager> {
        &self.transaction_manager
    }

    pub fn lock_manager(&self) -> &RowLockManager {
        &self.locks
    }

    // ------------------------------------------------------------------
    // Unlocked reads
    // ------------------------------------------------------------------

    /// Last committed total. May be stale as soon as it returns.
    pub async fn get(&self, resource: ResourceId) -> Result<u64> {
        Ok(self.row(resource).await?.total)
    }

    pub async fn row(&self, resource: ResourceId) -> Result<AggregateRow> {
        let table = self.table.read().await;
        table
            .get(resource)
            .copied()
            .ok_or(DbError::ResourceNotFound(resource))
    }

    /// Snapshot of every committed row, ordered by resource id
    pub async fn resources(&self) -> Vec<AggregateRow> {
        let table = self.table.read().await;
        table.rows().copied().collect()
    }

    pub async fn contains(&self, resource: ResourceId) -> bool {
        self.table.read().await.contains(resource)
    }

    // ------------------------------------------------------------------
    // Transactional access
    // ------------------------------------------------------------------

    pub fn begin(&self, lock_timeout: Option<Duration>) -> Result<Transaction> {
        let tx = self.transaction_manager.begin(lock_timeout)?;
        trace!(txn = %tx.id(), "begin");
        Ok(tx)
    }

    /// Acquire the row lock for `resource` inside `tx` and return its total.
    ///
    /// Blocks while another transaction holds the lock (bounded by the
    /// transaction's lock timeout, if any). A lock already held by `tx` is
    /// not re-acquired, and the transaction's own buffered write wins over
    /// the committed value.
    pub async fn lock_and_read(&self, resource: ResourceId, tx: &mut Transaction) -> Result<u64> {
        tx.ensure_active()?;

        if !tx.holds_lock(resource) {
            let guard = self.locks.acquire(resource, tx.lock_timeout()).await?;
            debug!(
                txn = %tx.id(),
                resource = %resource,
                waited_us = guard.waited().as_micros() as u64,
                "row lock acquired"
            );
            tx.attach_lock(guard)?;
        }

        match tx.pending_row(resource) {
            Some(PendingRow::Total(total)) => return Ok(total),
            Some(PendingRow::Deleted) => return Err(DbError::ResourceNotFound(resource)),
            None => {}
        }

        let table = self.table.read().await;
        table
            .get(resource)
            .map(|row| row.total)
            .ok_or(DbError::ResourceNotFound(resource))
    }

    /// Buffer `new_total` for `resource`. Requires the row lock from
    /// [`AggregateStore::lock_and_read`] in the same transaction.
    pub async fn write(
        &self,
        resource: ResourceId,
        new_total: u64,
        tx: &mut Transaction,
    ) -> Result<()> {
        tx.ensure_active()?;
        if !tx.holds_lock(resource) {
            return Err(DbError::LockNotHeld(resource));
        }

        let old_total = match tx.pending_row(resource) {
            Some(PendingRow::Total(total)) => total,
            Some(PendingRow::Deleted) => return Err(DbError::ResourceNotFound(resource)),
            None => self.get(resource).await?,
        };
        tx.record_change(Change::WriteTotal {
            resource,
            old_total,
            new_total,
        })
    }

    pub async fn create_resource(
        &self,
        resource: ResourceId,
        initial_total: u64,
        tx: &mut Transaction,
    ) -> Result<()> {
        tx.ensure_active()?;
        let exists = match tx.pending_row(resource) {
            Some(PendingRow::Total(_)) => true,
            Some(PendingRow::Deleted) => false,
            None => self.contains(resource).await,
        };
        if exists {
            return Err(DbError::ResourceExists(resource));
        }
        tx.record_change(Change::CreateResource {
            resource,
            initial_total,
        })
    }

    /// Delete a row. Takes the row lock first, so it waits for any writer.
    pub async fn delete_resource(&self, resource: ResourceId, tx: &mut Transaction) -> Result<()> {
        self.lock_and_read(resource, tx).await?;
        tx.record_change(Change::DeleteResource { resource })
    }

    /// Buffer the "applied" marker for a contribution.
    pub fn mark_applied(&self, contribution: ContributionId, tx: &mut Transaction) -> Result<()> {
        tx.ensure_active()?;
        self.ledger.check_markable(contribution)?;
        tx.record_change(Change::MarkApplied { contribution })
    }

    /// Apply all buffered changes atomically, then release the row locks.
    ///
    /// On failure nothing is applied, the transaction is aborted and
    /// `TransactionAborted` is returned. Returns the commit sequence number.
    pub async fn commit(&self, tx: &mut Transaction) -> Result<u64> {
        tx.ensure_active()?;

        let outcome = {
            let mut table = self.table.write().await;
            let mut ledger = self.ledger.lock_for_commit()?;

            let changes = tx.changes();
            let verdict = table
                .validate(changes)
                .and_then(|_| ledger.validate(changes));
            if verdict.is_ok() {
                table.apply(changes);
                ledger.apply(changes);
            }
            verdict
        };

        match outcome {
            Ok(()) => {
                let change_count = tx.change_count();
                let locks = tx.held_lock_count();
                tx.commit()?;
                let sequence = self.transaction_manager.finish_commit(tx.id())?;
                debug!(
                    txn = %tx.id(),
                    sequence,
                    change_count,
                    locks_released = locks,
                    "commit"
                );
                Ok(sequence)
            }
            Err(err) => {
                self.rollback(tx)?;
                Err(DbError::TransactionAborted(err.to_string()))
            }
        }
    }

    /// Discard buffered changes and release row locks.
    ///
    /// Synchronous so it can run from `Drop`. Rolling back a finished
    /// transaction is a no-op.
    pub fn rollback(&self, tx: &mut Transaction) -> Result<()> {
        if !tx.state().is_active() {
            return Ok(());
        }
        let locks = tx.held_lock_count();
        tx.rollback()?;
        self.transaction_manager.finish_rollback(tx.id())?;
        debug!(txn = %tx.id(), locks_released = locks, "rollback");
        Ok(())
    }

    pub fn stats(&self) -> Result<TransactionStats> {
        self.transaction_manager.stats()
    }
}

impl Default for AggregateStore {
    fn default() -> Self {
        Self::new()
    }
}
