//! Locking transaction coordinator.
//!
//! [`Coordinator::apply`] is the protected path every unit of work should
//! use to add to an aggregate: lock the row, re-read, add, write, commit.
//! [`Coordinator::apply_unsafe`] is the classic unlocked read-modify-write,
//! kept for comparison and for demonstrating lost updates.

pub mod delay;

pub use delay::{DelayHook, FixedDelay, JitterDelay, NoDelay};

use crate::connection::config::ConnectionConfig;
use crate::connection::pool::{ConnectionPool, PoolStats};
use crate::connection::Connection;
use crate::contribution::ContributionRecord;
use crate::core::{AggregateRow, ContributionId, DbError, OwnerId, ResourceId, Result};
use std::sync::Arc;
use tracing::{debug, info_span, warn, Instrument};

pub struct Coordinator {
    pool: ConnectionPool,
    delay: Arc<dyn DelayHook>,
}

impl Coordinator {
    pub fn new(pool: ConnectionPool) -> Self {
        Self {
            pool,
            delay: Arc::new(NoDelay),
        }
    }

    /// Build a coordinator over a fresh store
    pub async fn connect(config: ConnectionConfig) -> Result<Self> {
        Ok(Self::new(ConnectionPool::new(config).await?))
    }

    /// Install the pause used by [`Coordinator::apply_unsafe`]
    pub fn with_delay_hook(mut self, hook: impl DelayHook + 'static) -> Self {
        self.delay = Arc::new(hook);
        self
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub async fn pool_stats(&self) -> PoolStats {
        self.pool.stats().await
    }

    /// Create a contribution record and append it to the ledger.
    ///
    /// Has no effect on the aggregate. The resource is not checked here;
    /// that happens when the record is applied.
    pub fn create_contribution(
        &self,
        resource: ResourceId,
        quantity: u64,
        owner: OwnerId,
    ) -> Result<ContributionRecord> {
        let record = ContributionRecord::new(resource, quantity, owner)?;
        self.pool.store().ledger().append(record.clone())?;
        debug!(
            contribution = %record.id(),
            resource = %resource,
            quantity,
            "contribution recorded"
        );
        Ok(record)
    }

    /// Add `quantity` to `resource` under its exclusive row lock.
    ///
    /// Concurrent calls on the same resource serialize on the lock, so each
    /// one re-reads the total committed by the previous holder. On any error
    /// the transaction is rolled back and nothing is applied; no retry is
    /// attempted.
    ///
    /// # Examples
    ///
    /// ```
    /// use tallydb::{ConnectionConfig, Coordinator, ResourceId};
    ///
    /// # tokio_test::block_on(async {
    /// let coordinator = Coordinator::connect(ConnectionConfig::new()).await.unwrap();
    /// coordinator.register_resource(ResourceId(7), 100).await.unwrap();
    ///
    /// assert_eq!(coordinator.apply(ResourceId(7), 25).await.unwrap(), 125);
    /// # });
    /// ```
    pub async fn apply(&self, resource: ResourceId, quantity: u64) -> Result<u64> {
        if quantity == 0 {
            return Err(DbError::InvalidQuantity(quantity));
        }
        self.run_locked(resource, quantity, None)
            .instrument(info_span!("apply", resource = %resource, quantity))
            .await
    }

    /// Apply a ledger record and mark it applied in the same transaction.
    pub async fn apply_contribution(&self, record: &ContributionRecord) -> Result<u64> {
        self.run_locked(record.resource_id(), record.quantity(), Some(record.id()))
            .instrument(info_span!(
                "apply_contribution",
                contribution = %record.id(),
                resource = %record.resource_id(),
                quantity = record.quantity()
            ))
            .await
    }

    async fn run_locked(
        &self,
        resource: ResourceId,
        quantity: u64,
        contribution: Option<ContributionId>,
    ) -> Result<u64> {
        let mut guard = self.pool.get_connection().await?;
        let outcome = locked_increment(guard.connection(), resource, quantity, contribution).await;

        match &outcome {
            Ok(new_total) => debug!(new_total, "applied"),
            Err(err) => warn!(error = %err, "apply failed"),
        }
        settle(outcome, guard.close().await)
    }

    /// Unlocked read, pause, blind overwrite. Can lose concurrent updates.
    pub async fn apply_unsafe(&self, resource: ResourceId, quantity: u64) -> Result<u64> {
        if quantity == 0 {
            return Err(DbError::InvalidQuantity(quantity));
        }

        let span = info_span!("apply_unsafe", resource = %resource, quantity);
        async {
            let mut guard = self.pool.get_connection().await?;
            let observed = guard.connection().get(resource).await?;

            self.delay.pause(resource).await;

            let new_total = checked_total(resource, observed, quantity)?;
            guard.connection().overwrite(resource, new_total).await?;

            debug!(observed, new_total, "overwrote");
            settle(Ok(new_total), guard.close().await)
        }
        .instrument(span)
        .await
    }

    /// Unlocked read of the committed total, for reporting
    pub async fn current_total(&self, resource: ResourceId) -> Result<u64> {
        self.pool.store().get(resource).await
    }

    pub async fn snapshot(&self) -> Vec<AggregateRow> {
        self.pool.store().resources().await
    }

    pub async fn register_resource(&self, resource: ResourceId, initial_total: u64) -> Result<()> {
        let mut guard = self.pool.get_connection().await?;
        let result = guard
            .connection()
            .create_resource(resource, initial_total)
            .await;
        settle(result, guard.close().await)
    }

    /// Delete a resource once no transaction holds its row lock
    pub async fn remove_resource(&self, resource: ResourceId) -> Result<()> {
        let mut guard = self.pool.get_connection().await?;
        let result = guard.connection().delete_resource(resource).await;
        settle(result, guard.close().await)
    }

    /// Contributions created but never applied (orphans after failures)
    pub fn unapplied_contributions(&self) -> Result<Vec<ContributionRecord>> {
        self.pool.store().ledger().unapplied()
    }
}

async fn locked_increment(
    conn: &mut Connection,
    resource: ResourceId,
    quantity: u64,
    contribution: Option<ContributionId>,
) -> Result<u64> {
    conn.begin().await?;

    let result: Result<u64> = async {
        let current = conn.lock_and_read(resource).await?;
        let new_total = checked_total(resource, current, quantity)?;
        conn.write(resource, new_total).await?;
        if let Some(id) = contribution {
            conn.mark_applied(id).await?;
        }
        Ok(new_total)
    }
    .await;

    match result {
        Ok(new_total) => {
            conn.commit().await?;
            Ok(new_total)
        }
        Err(err) => {
            if let Err(rollback_err) = conn.rollback().await {
                warn!(error = %rollback_err, "rollback failed");
            }
            Err(err)
        }
    }
}

/// Keep the statement's own result when returning the connection fails.
fn settle<T>(outcome: Result<T>, closed: Result<()>) -> Result<T> {
    if let Err(err) = closed {
        warn!(error = %err, "connection not returned cleanly");
    }
    outcome
}

fn checked_total(resource: ResourceId, current: u64, quantity: u64) -> Result<u64> {
    current.checked_add(quantity).ok_or_else(|| {
        DbError::TransactionAborted(format!(
            "total of {} would overflow: {} + {}",
            resource, current, quantity
        ))
    })
}
