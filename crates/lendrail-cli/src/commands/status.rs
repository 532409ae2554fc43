//! `lendrail status`: query the status of a running node.

use clap::Args;
use lendrail_settlement::StatusSnapshot;
use serde::Deserialize;

use crate::client::{NodeClient, DEFAULT_ENDPOINT};

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// API endpoint of the node.
    #[arg(short, long, default_value = DEFAULT_ENDPOINT)]
    pub endpoint: String,
}

#[derive(Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub uptime_secs: u64,
    #[serde(flatten)]
    pub snapshot: StatusSnapshot,
}

pub async fn run(args: &StatusArgs) -> anyhow::Result<()> {
    let client = NodeClient::new(&args.endpoint);

    match client.get::<StatusResponse>("/status").await {
        Ok(reply) => {
            let status = reply.into_result("status")?;
            let snapshot = &status.snapshot;
            let enforcement = &snapshot.enforcement;
            println!("Node Status:");
            println!("  Version:     {}", status.version);
            println!("  Uptime:      {}s", status.uptime_secs);
            println!("  Gateway:     {}", snapshot.gateway_id);
            println!("  Signer:      {}", snapshot.signer_address);
            println!(
                "  Worker:      {}",
                if snapshot.worker_paused { "paused" } else { "running" }
            );
            println!("Enforcement (v{}):", enforcement.version);
            println!("  Global block:   {}", enforcement.global_block);
            println!("  Global freeze:  {}", enforcement.global_freeze);
            if enforcement.blocked_partner_ids.is_empty() {
                println!("  Blocked partners: (none)");
            } else {
                for partner in &enforcement.blocked_partner_ids {
                    println!("  Blocked partner:  {}", partner);
                }
            }
            println!("  Unresolved incidents: {}", snapshot.unresolved_incidents);
            println!("Queue:");
            for (action_status, count) in &snapshot.queue_depth {
                println!("  {:<12} {}", action_status.to_string(), count);
            }
        }
        Err(e) => client.unreachable(&e),
    }

    Ok(())
}
