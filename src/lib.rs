// ============================================================================
// TallyDB Library
// ============================================================================

pub mod core;
pub mod storage;
pub mod transaction;
pub mod connection;
pub mod contribution;
pub mod coordinator;
pub mod simulator;

// Re-export main types for convenience
pub use core::{AggregateRow, ContributionId, DbError, OwnerId, ResourceId, Result};
pub use contribution::{ContributionLedger, ContributionRecord};
pub use coordinator::{Coordinator, DelayHook, FixedDelay, JitterDelay, NoDelay};
pub use simulator::{SimulationPlan, SimulationReport, Simulator, TrialOutcome, WriteMode};
pub use storage::AggregateStore;

// Re-export connection API
pub use connection::{
    Connection,
    pool::{ConnectionPool, PoolGuard, PoolStats},
    config::ConnectionConfig,
};

/// Connect to a fresh in-memory store described by a connection string
///
/// # Examples
///
/// ```
/// # use tallydb::{OwnerId, ResourceId};
/// # #[tokio::main]
/// # async fn main() -> tallydb::Result<()> {
/// let coordinator = tallydb::connect("tallydb://localhost/stock?max_connections=4").await?;
/// coordinator.register_resource(ResourceId(1), 0).await?;
///
/// let record = coordinator.create_contribution(ResourceId(1), 10, OwnerId::new("order-17"))?;
/// let total = coordinator.apply_contribution(&record).await?;
/// assert_eq!(total, 10);
/// # Ok(())
/// # }
/// ```
pub async fn connect(url: &str) -> Result<Coordinator> {
    let config = ConnectionConfig::from_url(url).map_err(DbError::ConfigError)?;
    Coordinator::connect(config).await
}
