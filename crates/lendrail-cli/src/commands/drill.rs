//! `lendrail drill`: scripted incident drills against a live node.
//!
//! Each step asserts on the node's machine-checkable replies (enforcement
//! flags, error codes) and the drill stops at the first failed step.

use clap::{Args, Subcommand};
use lendrail_core::{Incident, IncidentStatus, Loan, LoanParams, PartnerId, Trigger};
use lendrail_settlement::EnforcementState;
use reqwest::StatusCode;
use serde::Deserialize;

use crate::client::{NodeClient, Reply, DEFAULT_ENDPOINT};
use crate::commands::incident::{FireRequest, OperatorRequest};
use crate::commands::status::StatusResponse;

#[derive(Args, Debug)]
pub struct DrillArgs {
    #[command(subcommand)]
    pub command: DrillCommand,

    /// API endpoint of the node.
    #[arg(short, long, global = true, default_value = DEFAULT_ENDPOINT)]
    pub endpoint: String,
}

#[derive(Subcommand, Debug)]
pub enum DrillCommand {
    /// Fire an activation-without-disbursement incident, check that
    /// originations are blocked, then acknowledge, resolve and check that
    /// originations flow again.
    SoftHalt {
        /// Partner the drill originations are booked under.
        #[arg(long, default_value = "drill")]
        partner: String,
        /// Principal of the drill originations.
        #[arg(long, default_value_t = 1)]
        principal: u64,
        #[arg(long, default_value = "drill")]
        operator: String,
    },
}

#[derive(Deserialize)]
struct LoanActionResponse {
    loan: Loan,
}

struct Drill<'a> {
    client: &'a NodeClient,
    step: usize,
}

impl<'a> Drill<'a> {
    fn pass(&mut self, what: &str) {
        self.step += 1;
        println!("  [{}] ok    {}", self.step, what);
    }

    fn fail(&mut self, what: &str, detail: String) -> anyhow::Error {
        self.step += 1;
        println!("  [{}] FAIL  {}: {}", self.step, what, detail);
        anyhow::anyhow!("drill failed at step {}: {}", self.step, what)
    }

    async fn enforcement(&self) -> anyhow::Result<EnforcementState> {
        let status = self
            .client
            .get::<StatusResponse>("/status")
            .await?
            .into_result("status")?;
        Ok(status.snapshot.enforcement)
    }

    async fn originate(&self, trial: &LoanParams) -> anyhow::Result<Reply<LoanActionResponse>> {
        Ok(self.client.post("/loans", trial).await?)
    }

    async fn transition(
        &self,
        incident: &Incident,
        verb: &str,
        operator: &str,
    ) -> anyhow::Result<Incident> {
        self.client
            .post::<_, Incident>(
                &format!("/incidents/{}/{}", incident.id, verb),
                &OperatorRequest {
                    operator: operator.to_string(),
                },
            )
            .await?
            .into_result(verb)
    }
}

async fn soft_halt(
    client: &NodeClient,
    partner: &str,
    principal: u64,
    operator: &str,
) -> anyhow::Result<()> {
    let mut drill = Drill { client, step: 0 };
    let trial = LoanParams {
        partner_id: PartnerId::new(partner),
        borrower: "0xd0d0d0d0d0d0d0d0d0d0d0d0d0d0d0d0d0d0d0d0".into(),
        principal,
        interest_rate_bps: 500,
        duration_secs: 86_400,
    };

    println!("Soft-halt drill against {}", client.endpoint());

    let before = drill.enforcement().await?;
    if before.global_block {
        return Err(drill.fail(
            "node starts without a global block",
            format!("enforcement v{} already blocks originations", before.version),
        ));
    }
    drill.pass("node starts without a global block");

    let incident = client
        .post::<_, Incident>(
            "/incidents",
            &FireRequest {
                trigger: Trigger::ActivationWithoutDisbursement,
                operator: operator.to_string(),
            },
        )
        .await?
        .into_result("fire")?;
    drill.pass(&format!("fired incident {}", incident.id));

    let during = drill.enforcement().await?;
    if !during.global_block {
        return Err(drill.fail("global block is set", format!("{:?}", during)));
    }
    drill.pass("global block is set");

    match drill.originate(&trial).await? {
        Reply::Rejected { status, body }
            if status == StatusCode::LOCKED && body.code == "origination_blocked" =>
        {
            drill.pass("origination rejected with origination_blocked");
        }
        Reply::Rejected { status, body } => {
            return Err(drill.fail(
                "origination rejected with origination_blocked",
                format!("HTTP {} [{}] {}", status, body.code, body.error),
            ))
        }
        Reply::Ok(created) => {
            return Err(drill.fail(
                "origination rejected with origination_blocked",
                format!("loan {} was created", created.loan.id),
            ))
        }
    }

    let acked = drill.transition(&incident, "ack", operator).await?;
    if acked.status != IncidentStatus::Acknowledged {
        return Err(drill.fail("incident acknowledged", acked.status.to_string()));
    }
    drill.pass("incident acknowledged");

    let resolved = drill.transition(&incident, "resolve", operator).await?;
    if resolved.status != IncidentStatus::Resolved {
        return Err(drill.fail("incident resolved", resolved.status.to_string()));
    }
    drill.pass("incident resolved");

    let after = drill.enforcement().await?;
    if after.global_block {
        return Err(drill.fail("global block is lifted", format!("{:?}", after)));
    }
    drill.pass("global block is lifted");

    match drill.originate(&trial).await? {
        Reply::Ok(created) => {
            drill.pass(&format!("origination succeeds (loan {})", created.loan.id));
        }
        Reply::Rejected { status, body } => {
            return Err(drill.fail(
                "origination succeeds",
                format!("HTTP {} [{}] {}", status, body.code, body.error),
            ))
        }
    }

    println!("Soft-halt drill passed.");
    Ok(())
}

pub async fn run(args: &DrillArgs) -> anyhow::Result<()> {
    let client = NodeClient::new(&args.endpoint);
    match &args.command {
        DrillCommand::SoftHalt {
            partner,
            principal,
            operator,
        } => soft_halt(&client, partner, *principal, operator).await,
    }
}
