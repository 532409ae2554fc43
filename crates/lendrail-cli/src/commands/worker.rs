//! `lendrail worker`: pause or resume the dispatch worker.

use clap::{Args, Subcommand};
use serde::Deserialize;

use crate::client::{NodeClient, DEFAULT_ENDPOINT};

#[derive(Args, Debug)]
pub struct WorkerArgs {
    #[command(subcommand)]
    pub command: WorkerCommand,

    /// API endpoint of the node.
    #[arg(short, long, global = true, default_value = DEFAULT_ENDPOINT)]
    pub endpoint: String,
}

#[derive(Subcommand, Debug)]
pub enum WorkerCommand {
    /// Stop claiming new actions after the current cycle.
    Pause,
    /// Resume claiming.
    Resume,
}

#[derive(Deserialize)]
struct WorkerResponse {
    paused: bool,
    signer_address: String,
}

pub async fn run(args: &WorkerArgs) -> anyhow::Result<()> {
    let client = NodeClient::new(&args.endpoint);
    let path = match args.command {
        WorkerCommand::Pause => "/worker/pause",
        WorkerCommand::Resume => "/worker/resume",
    };

    match client
        .post::<_, WorkerResponse>(path, &serde_json::json!({}))
        .await
    {
        Ok(reply) => {
            let worker = reply.into_result("worker")?;
            println!(
                "Dispatch worker {}",
                if worker.paused { "paused" } else { "running" }
            );
            println!("  Signer: {}", worker.signer_address);
        }
        Err(e) => client.unreachable(&e),
    }

    Ok(())
}
