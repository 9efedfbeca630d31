// ============================================================================
// Transaction Manager
// ============================================================================

use super::{Transaction, TransactionId, TransactionState};
use crate::core::{DbError, Result};
use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Bookkeeping for every transaction begun against one store.
///
/// The transactions themselves are owned by their connections; the manager
/// only tracks which ones are live and how many finished each way. Its locks
/// are never held across an await, so rollback can run from `Drop`.
pub struct TransactionManager {
    // Start time of each active transaction.
    active: RwLock<HashMap<TransactionId, Instant>>,

    committed: AtomicU64,
    aborted: AtomicU64,

    // Incremented once per successful commit; doubles as commit sequence.
    global_version: AtomicU64,
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            active: RwLock::new(HashMap::new()),
            committed: AtomicU64::new(0),
            aborted: AtomicU64::new(0),
            global_version: AtomicU64::new(0),
        }
    }

    pub fn begin(&self, lock_timeout: Option<Duration>) -> Result<Transaction> {
        let transaction_id = TransactionId::new();
        let transaction = Transaction::new(transaction_id, lock_timeout);

        self.active.write()?.insert(transaction_id, Instant::now());

        Ok(transaction)
    }

    /// Record a successful commit; returns the commit sequence number.
    pub fn finish_commit(&self, txn_id: TransactionId) -> Result<u64> {
        if self.active.write()?.remove(&txn_id).is_none() {
            return Err(DbError::ExecutionError(format!(
                "Transaction {} not found",
                txn_id
            )));
        }
        self.committed.fetch_add(1, Ordering::SeqCst);
        Ok(self.global_version.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Record an abort. Unknown ids are ignored so rollback stays idempotent.
    pub fn finish_rollback(&self, txn_id: TransactionId) -> Result<()> {
        if self.active.write()?.remove(&txn_id).is_some() {
            self.aborted.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    pub fn is_active(&self, txn_id: TransactionId) -> Result<bool> {
        Ok(self.active.read()?.contains_key(&txn_id))
    }

    pub fn active_count(&self) -> Result<usize> {
        Ok(self.active.read()?.len())
    }

    pub fn global_version(&self) -> u64 {
        self.global_version.load(Ordering::SeqCst)
    }

    pub fn get_transaction_info(&self, txn_id: TransactionId) -> Result<Option<TransactionInfo>> {
        let active = self.active.read()?;
        Ok(active.get(&txn_id).map(|started| TransactionInfo {
            id: txn_id,
            state: TransactionState::Active,
            duration: started.elapsed(),
        }))
    }

    pub fn stats(&self) -> Result<TransactionStats> {
        Ok(TransactionStats {
            active: self.active_count()?,
            committed: self.committed.load(Ordering::SeqCst),
            aborted: self.aborted.load(Ordering::SeqCst),
        })
    }
}

pub struct TransactionInfo {
    pub id: TransactionId,
    pub state: TransactionState,
    pub duration: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionStats {
    pub active: usize,
    pub committed: u64,
    pub aborted: u64,
}
