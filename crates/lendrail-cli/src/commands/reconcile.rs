//! `lendrail reconcile`: compare stored loan status with the ledger.

use clap::Args;
use lendrail_settlement::{Finding, ReconciliationReport};
use serde::Serialize;

use crate::client::{NodeClient, DEFAULT_ENDPOINT};

#[derive(Args, Debug)]
pub struct ReconcileArgs {
    /// Check a random sample of this many loans instead of all of them.
    #[arg(long)]
    pub sample: Option<usize>,

    /// Exit with an error when the report has findings.
    #[arg(long)]
    pub strict: bool,

    /// API endpoint of the node.
    #[arg(short, long, default_value = DEFAULT_ENDPOINT)]
    pub endpoint: String,
}

#[derive(Serialize)]
struct ReconcileRequest {
    sample: Option<usize>,
}

fn describe(finding: &Finding) -> String {
    match finding {
        Finding::StatusMismatch {
            loan_id,
            stored,
            on_chain,
        } => format!("{}: stored {} but ledger says {}", loan_id, stored, on_chain),
        Finding::UnknownContractStatus { loan_id, code } => {
            format!("{}: ledger returned unknown status code {}", loan_id, code)
        }
        Finding::MissingOnChain {
            loan_id,
            contract_address,
        } => format!("{}: contract {} not found on ledger", loan_id, contract_address),
        Finding::ActiveWithoutDisbursement { loan_id } => {
            format!("{}: ACTIVE without a disbursement proof", loan_id)
        }
        Finding::MissingContractAddress {
            loan_id,
            create_status,
            ledger_address,
        } => format!(
            "{}: create_loan is {} but no contract address is stored (ledger has {})",
            loan_id,
            create_status,
            ledger_address.as_deref().unwrap_or("none")
        ),
    }
}

pub async fn run(args: &ReconcileArgs) -> anyhow::Result<()> {
    let client = NodeClient::new(&args.endpoint);
    let body = ReconcileRequest {
        sample: args.sample,
    };

    match client
        .post::<_, ReconciliationReport>("/reconcile", &body)
        .await
    {
        Ok(reply) => {
            let report = reply.into_result("reconcile")?;
            println!("Reconciliation:");
            println!("  Checked:       {}", report.checked);
            println!("  Skipped:       {}", report.skipped);
            println!("  Ledger paused: {}", report.ledger_paused);
            println!(
                "  Duration:      {}ms",
                (report.finished_at - report.started_at).num_milliseconds()
            );
            if report.is_clean() {
                println!("  Result:        clean");
            } else {
                println!("  Findings:      {}", report.findings.len());
                for finding in &report.findings {
                    println!("    - {}", describe(finding));
                }
                if args.strict {
                    anyhow::bail!("reconciliation found {} mismatches", report.findings.len());
                }
            }
        }
        Err(e) => client.unreachable(&e),
    }

    Ok(())
}
