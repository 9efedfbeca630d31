// ============================================================================
// Concurrent Work Simulator
// ============================================================================
//
// Spawns N independent units of work against one resource, each creating
// a contribution and then applying it, and compares the final total with
// the expected sum. Used by the CLI and by the concurrency tests.
//
// ============================================================================

use crate::coordinator::Coordinator;
use crate::core::{DbError, OwnerId, ResourceId, Result};
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Barrier;
use tracing::{info, warn};

/// Which write path the workers use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    /// Locked read-modify-write via `apply_contribution`
    Safe,
    /// Unlocked read-modify-write via `apply_unsafe`
    Unsafe,
}

impl std::fmt::Display for WriteMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteMode::Safe => write!(f, "safe"),
            WriteMode::Unsafe => write!(f, "unsafe"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationPlan {
    pub resource: ResourceId,
    pub workers: usize,
    pub quantity: u64,
    pub initial_total: u64,
    pub mode: WriteMode,
}

impl SimulationPlan {
    pub fn new(resource: ResourceId, workers: usize, quantity: u64, mode: WriteMode) -> Self {
        Self {
            resource,
            workers,
            quantity,
            initial_total: 0,
            mode,
        }
    }

    pub fn initial_total(mut self, total: u64) -> Self {
        self.initial_total = total;
        self
    }

    /// Total expected once every worker has succeeded.
    ///
    /// Saturates at `u64::MAX`; such plans are rejected before they run.
    pub fn expected_total(&self) -> u64 {
        self.total_after(self.workers).unwrap_or(u64::MAX)
    }

    fn total_after(&self, successes: usize) -> Option<u64> {
        self.quantity
            .checked_mul(successes as u64)
            .and_then(|added| added.checked_add(self.initial_total))
    }

    fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(DbError::ConfigError("workers must be > 0".into()));
        }
        if self.quantity == 0 {
            return Err(DbError::InvalidQuantity(self.quantity));
        }
        if self.total_after(self.workers).is_none() {
            return Err(DbError::ConfigError(format!(
                "{} + {} x {} overflows the aggregate total",
                self.initial_total, self.workers, self.quantity
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TrialOutcome {
    pub trial: usize,
    pub expected: u64,
    pub observed: u64,
    pub succeeded: usize,
    pub failed: usize,
    pub elapsed_ms: u128,
}

impl TrialOutcome {
    /// Expected total given only the workers that reported success
    pub fn expected_from_successes(&self, plan: &SimulationPlan) -> u64 {
        plan.total_after(self.succeeded).unwrap_or(u64::MAX)
    }

    /// Quantity silently lost: reported applied but absent from the total
    pub fn lost_quantity(&self, plan: &SimulationPlan) -> u64 {
        self.expected_from_successes(plan).saturating_sub(self.observed)
    }

    pub fn lost_updates(&self, plan: &SimulationPlan) -> bool {
        self.lost_quantity(plan) > 0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub plan: SimulationPlan,
    pub trials: Vec<TrialOutcome>,
}

impl SimulationReport {
    pub fn lost_update_trials(&self) -> usize {
        self.trials
            .iter()
            .filter(|trial| trial.lost_updates(&self.plan))
            .count()
    }

    pub fn all_converged(&self) -> bool {
        self.trials
            .iter()
            .all(|trial| trial.failed == 0 && trial.observed == trial.expected)
    }
}

impl std::fmt::Display for SimulationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "mode={} resource={} workers={} quantity={} initial={}",
            self.plan.mode,
            self.plan.resource,
            self.plan.workers,
            self.plan.quantity,
            self.plan.initial_total
        )?;
        for trial in &self.trials {
            writeln!(
                f,
                "  trial {:>3}: expected {:>6} observed {:>6} failed {:>3} lost {:>6} ({} ms)",
                trial.trial,
                trial.expected,
                trial.observed,
                trial.failed,
                trial.lost_quantity(&self.plan),
                trial.elapsed_ms
            )?;
        }
        write!(
            f,
            "{} of {} trials lost updates",
            self.lost_update_trials(),
            self.trials.len()
        )
    }
}

pub struct Simulator {
    coordinator: Arc<Coordinator>,
}

impl Simulator {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// Recreate the resource at the plan's initial total
    async fn reset(&self, plan: &SimulationPlan) -> Result<()> {
        match self.coordinator.remove_resource(plan.resource).await {
            Ok(()) | Err(DbError::ResourceNotFound(_)) => {}
            Err(err) => return Err(err),
        }
        self.coordinator
            .register_resource(plan.resource, plan.initial_total)
            .await
    }

    /// Run one trial: all workers start together behind a barrier.
    pub async fn run_trial(&self, plan: &SimulationPlan, trial: usize) -> Result<TrialOutcome> {
        plan.validate()?;
        self.reset(plan).await?;

        let barrier = Arc::new(Barrier::new(plan.workers));
        let started = Instant::now();

        let handles: Vec<_> = (0..plan.workers)
            .map(|worker| {
                let coordinator = Arc::clone(&self.coordinator);
                let barrier = Arc::clone(&barrier);
                let plan = plan.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    let owner = OwnerId::new(format!("worker-{}", worker));
                    let record =
                        coordinator.create_contribution(plan.resource, plan.quantity, owner)?;
                    match plan.mode {
                        WriteMode::Safe => coordinator.apply_contribution(&record).await,
                        WriteMode::Unsafe => {
                            coordinator
                                .apply_unsafe(record.resource_id(), record.quantity())
                                .await
                        }
                    }
                })
            })
            .collect();

        let mut succeeded = 0;
        let mut failed = 0;
        for joined in join_all(handles).await {
            match joined {
                Ok(Ok(_)) => succeeded += 1,
                Ok(Err(err)) => {
                    warn!(trial, error = %err, "worker failed");
                    failed += 1;
                }
                Err(join_err) => {
                    warn!(trial, error = %join_err, "worker panicked or was cancelled");
                    failed += 1;
                }
            }
        }

        let observed = self.coordinator.current_total(plan.resource).await?;
        let outcome = TrialOutcome {
            trial,
            expected: plan.expected_total(),
            observed,
            succeeded,
            failed,
            elapsed_ms: started.elapsed().as_millis(),
        };
        info!(
            trial,
            mode = %plan.mode,
            expected = outcome.expected,
            observed,
            failed,
            "trial finished"
        );
        Ok(outcome)
    }

    pub async fn run(&self, plan: SimulationPlan, trials: usize) -> Result<SimulationReport> {
        let mut outcomes = Vec::with_capacity(trials);
        for trial in 1..=trials {
            outcomes.push(self.run_trial(&plan, trial).await?);
        }
        Ok(SimulationReport {
            plan,
            trials: outcomes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::config::ConnectionConfig;

    async fn simulator(max_connections: usize) -> Simulator {
        let config = ConnectionConfig::new().max_connections(max_connections);
        let coordinator = Coordinator::connect(config).await.unwrap();
        Simulator::new(Arc::new(coordinator))
    }

    #[test]
    fn test_expected_total() {
        let plan = SimulationPlan::new(ResourceId(1), 4, 10, WriteMode::Safe).initial_total(5);
        assert_eq!(plan.expected_total(), 45);
    }

    #[tokio::test]
    async fn test_overflowing_plan_is_rejected() {
        let plan = SimulationPlan::new(ResourceId(1), 2, 10, WriteMode::Safe)
            .initial_total(u64::MAX);
        assert_eq!(plan.expected_total(), u64::MAX);

        let outcome = TrialOutcome {
            trial: 1,
            expected: plan.expected_total(),
            observed: u64::MAX,
            succeeded: 2,
            failed: 0,
            elapsed_ms: 0,
        };
        assert_eq!(outcome.lost_quantity(&plan), 0);

        let simulator = simulator(2).await;
        let result = simulator.run_trial(&plan, 1).await;
        assert!(matches!(result, Err(DbError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_safe_trial_converges() {
        let simulator = simulator(8).await;
        let plan = SimulationPlan::new(ResourceId(1), 8, 3, WriteMode::Safe);

        let report = simulator.run(plan, 3).await.unwrap();

        assert!(report.all_converged());
        assert_eq!(report.lost_update_trials(), 0);
        assert!(report.trials.iter().all(|t| t.observed == 24));
        assert!(simulator.coordinator().unapplied_contributions().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_zero_workers_is_rejected() {
        let simulator = simulator(2).await;
        let plan = SimulationPlan::new(ResourceId(1), 0, 3, WriteMode::Safe);
        assert!(simulator.run_trial(&plan, 1).await.is_err());
    }

    #[test]
    fn test_report_display_and_json() {
        let plan = SimulationPlan::new(ResourceId(2), 2, 10, WriteMode::Unsafe);
        let report = SimulationReport {
            plan,
            trials: vec![TrialOutcome {
                trial: 1,
                expected: 20,
                observed: 10,
                succeeded: 2,
                failed: 0,
                elapsed_ms: 5,
            }],
        };

        assert_eq!(report.lost_update_trials(), 1);
        assert!(!report.all_converged());
        assert!(report.to_string().contains("1 of 1 trials lost updates"));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["plan"]["mode"], "unsafe");
        assert_eq!(json["trials"][0]["observed"], 10);
    }
}
