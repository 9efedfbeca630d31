// ============================================================================
// Transaction Management Module
// ============================================================================
//
// Read-modify-write transactions over aggregate rows with exclusive,
// transaction-scoped row locks.
//
// Design Patterns Used:
// - State Pattern: Transaction state management (Active, Committed, Aborted)
// - Command Pattern: Buffered changes applied atomically at commit
// - RAII: Row locks released when the owning transaction ends
//
// ============================================================================

pub mod change;
pub mod manager;
pub mod state;

pub use change::Change;
pub use manager::{TransactionInfo, TransactionManager, TransactionStats};
pub use state::{PendingRow, Transaction, TransactionId, TransactionState};
