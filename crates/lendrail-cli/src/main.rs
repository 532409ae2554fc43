//! lendrail CLI: operator commands against a running settlement node.
//!
//! Subcommands: init, status, incident, worker, reconcile, drill.

mod client;
mod commands;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// lendrail: loan settlement orchestration.
#[derive(Parser, Debug)]
#[command(name = "lendrail", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize a new node configuration.
    Init(commands::init::InitArgs),
    /// Query the status of a running node.
    Status(commands::status::StatusArgs),
    /// Manage circuit-breaker incidents.
    Incident(commands::incident::IncidentArgs),
    /// Pause or resume the dispatch worker.
    Worker(commands::worker::WorkerArgs),
    /// Reconcile stored loan status against the ledger.
    Reconcile(commands::reconcile::ReconcileArgs),
    /// Run an incident drill against a live node.
    Drill(commands::drill::DrillArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match &cli.command {
        Commands::Init(args) => commands::init::run(args),
        Commands::Status(args) => commands::status::run(args).await,
        Commands::Incident(args) => commands::incident::run(args).await,
        Commands::Worker(args) => commands::worker::run(args).await,
        Commands::Reconcile(args) => commands::reconcile::run(args).await,
        Commands::Drill(args) => commands::drill::run(args).await,
    }
}
