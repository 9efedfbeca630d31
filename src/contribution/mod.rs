//! Contribution records: the immutable "add this much to that resource"
//! intent a unit of work creates before it touches the aggregate.

pub mod ledger;

pub use ledger::ContributionLedger;

use crate::core::{ContributionId, DbError, OwnerId, ResourceId, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An immutable request to add `quantity` to `resource_id`.
///
/// Creating a record has no effect on the aggregate; it must be applied
/// explicitly through the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContributionRecord {
    id: ContributionId,
    resource_id: ResourceId,
    quantity: u64,
    owner_id: OwnerId,
    created_at: DateTime<Utc>,
}

impl ContributionRecord {
    /// # Errors
    /// `InvalidQuantity` when `quantity` is zero.
    pub fn new(resource_id: ResourceId, quantity: u64, owner_id: OwnerId) -> Result<Self> {
        if quantity == 0 {
            return Err(DbError::InvalidQuantity(quantity));
        }

        Ok(Self {
            id: ContributionId::new(),
            resource_id,
            quantity,
            owner_id,
            created_at: Utc::now(),
        })
    }

    pub fn id(&self) -> ContributionId {
        self.id
    }

    pub fn resource_id(&self) -> ResourceId {
        self.resource_id
    }

    pub fn quantity(&self) -> u64 {
        self.quantity
    }

    pub fn owner_id(&self) -> &OwnerId {
        &self.owner_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}
