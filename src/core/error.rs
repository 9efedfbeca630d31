use super::types::{ContributionId, ResourceId};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Resource {0} not found")]
    ResourceNotFound(ResourceId),

    #[error("Resource {0} already exists")]
    ResourceExists(ResourceId),

    #[error("Transaction aborted: {0}")]
    TransactionAborted(String),

    #[error("Timed out after {waited:?} waiting for the row lock on resource {resource}")]
    LockTimeout {
        resource: ResourceId,
        waited: Duration,
    },

    #[error("Row lock on resource {0} is not held by this transaction")]
    LockNotHeld(ResourceId),

    #[error("Invalid quantity {0}: contributions must be positive")]
    InvalidQuantity(u64),

    #[error("Contribution {0} has already been applied")]
    AlreadyApplied(ContributionId),

    #[error("Contribution {0} not found")]
    ContributionNotFound(ContributionId),

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Lock error: {0}")]
    LockError(String),
}

impl DbError {
    /// True when the failure came from waiting on another transaction
    /// rather than from the data itself.
    pub fn is_contention(&self) -> bool {
        matches!(self, DbError::LockTimeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, DbError>;

impl<T> From<std::sync::PoisonError<T>> for DbError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}
