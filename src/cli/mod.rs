pub mod app;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Concurrent aggregate-counter workbench
#[derive(Debug, Parser)]
#[command(name = "tallydb", version, about)]
pub struct Cli {
    /// Store connection string
    #[arg(long, default_value = "tallydb://localhost/tallydb", global = true)]
    pub url: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run N concurrent workers against one resource and report the totals
    Simulate(SimulateArgs),
    /// Race two callers through both write paths and compare the outcomes
    Compare(CompareArgs),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Mode {
    Safe,
    Unsafe,
}

#[derive(Debug, Args)]
pub struct SimulateArgs {
    #[arg(long, value_enum, default_value_t = Mode::Safe)]
    pub mode: Mode,

    #[arg(long, default_value_t = 10)]
    pub workers: usize,

    #[arg(long, default_value_t = 10)]
    pub quantity: u64,

    #[arg(long, default_value_t = 0)]
    pub initial: u64,

    #[arg(long, default_value_t = 1)]
    pub trials: usize,

    #[arg(long, default_value_t = 1)]
    pub resource: u64,

    /// Pause between read and write on the unsafe path, in milliseconds
    #[arg(long, default_value_t = 0)]
    pub delay_ms: u64,

    /// Upper bound of a random extra pause on the unsafe path
    #[arg(long)]
    pub jitter_ms: Option<u64>,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct CompareArgs {
    #[arg(long, default_value_t = 20)]
    pub trials: usize,

    #[arg(long, default_value_t = 10)]
    pub quantity: u64,

    #[arg(long, default_value_t = 5)]
    pub delay_ms: u64,

    #[arg(long)]
    pub json: bool,
}
