pub mod lock;
pub mod memory;
pub mod table;

pub use lock::{RowLockGuard, RowLockManager};
pub use memory::AggregateStore;
pub use table::AggregateTable;
