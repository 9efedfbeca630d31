// ============================================================================
// Transaction State Management
// ============================================================================
//
// Implements the State Pattern for transaction lifecycle management.
// Each transaction moves through defined states: Active -> Committed/Aborted
//
// Writes are buffered as Changes and only become visible at commit.
// Row locks acquired by the transaction are owned by it and released
// when it reaches a terminal state or is dropped.
//
// ============================================================================

use super::Change;
use crate::core::{DbError, ResourceId, Result};
use crate::storage::RowLockGuard;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Global transaction ID counter
static NEXT_TXN_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// Generate a new unique transaction ID
    pub fn new() -> Self {
        TransactionId(NEXT_TXN_ID.fetch_add(1, Ordering::SeqCst))
    }

    /// Get the raw ID value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "txn_{}", self.0)
    }
}

/// Transaction state following the State Pattern
///
/// State transitions:
/// ```text
/// Active ──commit──> Committed
///   │
///   └──rollback──> Aborted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Transaction is active and can execute operations
    Active,

    /// Transaction has been successfully committed
    Committed,

    /// Transaction has been aborted/rolled back
    Aborted,
}

impl TransactionState {
    /// Check if transaction can execute operations
    pub fn is_active(&self) -> bool {
        matches!(self, TransactionState::Active)
    }

    /// Check if transaction is in a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Committed | TransactionState::Aborted
        )
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionState::Active => write!(f, "ACTIVE"),
            TransactionState::Committed => write!(f, "COMMITTED"),
            TransactionState::Aborted => write!(f, "ABORTED"),
        }
    }
}

/// A row as seen through one transaction's buffered changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingRow {
    Total(u64),
    Deleted,
}

/// A unit of work against the aggregate store
///
/// # Thread Safety
/// A transaction belongs to exactly one connection. Row locks it holds are
/// owned guards, so moving or dropping the transaction moves or releases
/// them with it.
#[derive(Debug)]
pub struct Transaction {
    /// Unique transaction identifier
    id: TransactionId,

    /// Current state (Active, Committed, Aborted)
    state: TransactionState,

    /// Buffered writes (Command Pattern), applied at commit
    changes: Vec<Change>,

    /// Row locks held by this transaction, keyed by resource
    held_locks: HashMap<ResourceId, RowLockGuard>,

    /// Upper bound on a single row lock wait, if any
    lock_timeout: Option<Duration>,

    /// Start time for diagnostics
    start_time: Instant,
}

impl Transaction {
    /// Create a new active transaction
    pub fn new(id: TransactionId, lock_timeout: Option<Duration>) -> Self {
        Self {
            id,
            state: TransactionState::Active,
            changes: Vec::new(),
            held_locks: HashMap::new(),
            lock_timeout,
            start_time: Instant::now(),
        }
    }

    /// Get the transaction ID
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Get the current state
    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout
    }

    /// Get all changes recorded in this transaction
    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    /// Get the number of changes
    pub fn change_count(&self) -> usize {
        self.changes.len()
    }

    /// Get transaction duration
    pub fn duration(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn holds_lock(&self, resource: ResourceId) -> bool {
        self.held_locks.contains_key(&resource)
    }

    pub fn held_lock_count(&self) -> usize {
        self.held_locks.len()
    }

    /// Latest buffered state of `resource`, or `None` if this transaction
    /// has not touched the row
    pub fn pending_row(&self, resource: ResourceId) -> Option<PendingRow> {
        self.changes.iter().rev().find_map(|change| match change {
            Change::WriteTotal {
                resource: r,
                new_total,
                ..
            } if *r == resource => Some(PendingRow::Total(*new_total)),
            Change::CreateResource {
                resource: r,
                initial_total,
            } if *r == resource => Some(PendingRow::Total(*initial_total)),
            Change::DeleteResource { resource: r } if *r == resource => Some(PendingRow::Deleted),
            _ => None,
        })
    }

    /// Latest total this transaction has buffered for `resource`, if any
    pub fn pending_total(&self, resource: ResourceId) -> Option<u64> {
        match self.pending_row(resource)? {
            PendingRow::Total(total) => Some(total),
            PendingRow::Deleted => None,
        }
    }

    /// Returns error if transaction is not active
    pub fn ensure_active(&self) -> Result<()> {
        if !self.state.is_active() {
            return Err(DbError::ExecutionError(format!(
                "Transaction {} is {}",
                self.id, self.state
            )));
        }
        Ok(())
    }

    /// Take ownership of a freshly acquired row lock
    pub fn attach_lock(&mut self, guard: RowLockGuard) -> Result<()> {
        self.ensure_active()?;
        self.held_locks.insert(guard.resource(), guard);
        Ok(())
    }

    /// Record a change in this transaction
    ///
    /// # Errors
    /// Returns error if transaction is not active
    pub fn record_change(&mut self, change: Change) -> Result<()> {
        if !self.state.is_active() {
            return Err(DbError::ExecutionError(format!(
                "Cannot record change: transaction {} is {}",
                self.id, self.state
            )));
        }

        self.changes.push(change);
        Ok(())
    }

    /// Mark transaction as committed and release its row locks
    ///
    /// The caller must have applied `changes()` to storage first.
    ///
    /// # Errors
    /// Returns error if transaction is not active
    pub fn commit(&mut self) -> Result<()> {
        if !self.state.is_active() {
            return Err(DbError::ExecutionError(format!(
                "Cannot commit: transaction {} is already {}",
                self.id, self.state
            )));
        }

        self.state = TransactionState::Committed;
        self.changes.clear();
        self.held_locks.clear();
        Ok(())
    }

    /// Mark transaction as aborted, discard changes and release locks
    ///
    /// # Errors
    /// Returns error if transaction is not active
    pub fn rollback(&mut self) -> Result<()> {
        if !self.state.is_active() {
            return Err(DbError::ExecutionError(format!(
                "Cannot rollback: transaction {} is already {}",
                self.id, self.state
            )));
        }

        self.changes.clear();
        self.held_locks.clear();
        self.state = TransactionState::Aborted;
        Ok(())
    }
}
