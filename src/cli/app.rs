use super::{Cli, Command, CompareArgs, Mode, SimulateArgs};
use anyhow::{Context, bail};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tallydb::{
    ConnectionConfig, Coordinator, FixedDelay, JitterDelay, NoDelay, ResourceId, SimulationPlan,
    Simulator, WriteMode,
};

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = ConnectionConfig::from_url(&cli.url)
        .map_err(anyhow::Error::msg)
        .context("invalid --url")?;

    match cli.command {
        Command::Simulate(args) => simulate(config, args).await,
        Command::Compare(args) => compare(config, args).await,
    }
}

async fn build_coordinator(
    config: ConnectionConfig,
    delay: Duration,
    jitter: Option<Duration>,
) -> anyhow::Result<Coordinator> {
    let coordinator = Coordinator::connect(config).await?;

    Ok(match jitter {
        Some(max) => coordinator.with_delay_hook(JitterDelay::new(delay, delay + max)),
        None if delay.is_zero() => coordinator.with_delay_hook(NoDelay),
        None => coordinator.with_delay_hook(FixedDelay(delay)),
    })
}

async fn simulate(config: ConnectionConfig, args: SimulateArgs) -> anyhow::Result<()> {
    let mode = match args.mode {
        Mode::Safe => WriteMode::Safe,
        Mode::Unsafe => WriteMode::Unsafe,
    };
    let coordinator = build_coordinator(
        config,
        Duration::from_millis(args.delay_ms),
        args.jitter_ms.map(Duration::from_millis),
    )
    .await?;

    let plan = SimulationPlan::new(ResourceId(args.resource), args.workers, args.quantity, mode)
        .initial_total(args.initial);
    let report = Simulator::new(Arc::new(coordinator))
        .run(plan, args.trials)
        .await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report);
    }

    if mode == WriteMode::Safe && !report.all_converged() {
        bail!(
            "locked path lost updates in {} trial(s)",
            report.lost_update_trials()
        );
    }
    Ok(())
}

async fn compare(config: ConnectionConfig, args: CompareArgs) -> anyhow::Result<()> {
    let delay = Duration::from_millis(args.delay_ms);
    let coordinator = build_coordinator(config, delay, None).await?;
    let simulator = Simulator::new(Arc::new(coordinator));

    let safe = simulator
        .run(
            SimulationPlan::new(ResourceId(1), 2, args.quantity, WriteMode::Safe),
            args.trials,
        )
        .await?;
    let unsafe_report = simulator
        .run(
            SimulationPlan::new(ResourceId(2), 2, args.quantity, WriteMode::Unsafe),
            args.trials,
        )
        .await?;

    if args.json {
        let summary = json!({
            "trials": args.trials,
            "safe": { "lost_update_trials": safe.lost_update_trials(), "report": safe },
            "unsafe": { "lost_update_trials": unsafe_report.lost_update_trials(), "report": unsafe_report },
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!(
            "locked path:   {} of {} trials lost updates",
            safe.lost_update_trials(),
            args.trials
        );
        println!(
            "unlocked path: {} of {} trials lost updates",
            unsafe_report.lost_update_trials(),
            args.trials
        );
    }

    if !safe.all_converged() {
        bail!("locked path lost updates");
    }
    Ok(())
}
