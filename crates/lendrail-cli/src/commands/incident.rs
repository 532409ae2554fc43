//! `lendrail incident`: list, fire, acknowledge and resolve circuit-breaker
//! incidents.

use clap::{Args, Subcommand, ValueEnum};
use lendrail_core::{Incident, PartnerId, Trigger};
use serde::Serialize;

use crate::client::{NodeClient, DEFAULT_ENDPOINT};

#[derive(Args, Debug)]
pub struct IncidentArgs {
    #[command(subcommand)]
    pub command: IncidentCommand,

    /// API endpoint of the node.
    #[arg(short, long, global = true, default_value = DEFAULT_ENDPOINT)]
    pub endpoint: String,
}

#[derive(Subcommand, Debug)]
pub enum IncidentCommand {
    /// List all incidents, newest state included.
    List,
    /// Open an incident for a trigger.
    Fire {
        trigger: TriggerKind,
        /// Partner for `partner-anomaly`.
        #[arg(long)]
        partner: Option<String>,
        #[arg(long, default_value = "operator")]
        operator: String,
    },
    /// Take ownership of an open incident.
    Ack {
        id: String,
        #[arg(long, default_value = "operator")]
        operator: String,
    },
    /// Lift an incident's effects.
    Resolve {
        id: String,
        #[arg(long, default_value = "operator")]
        operator: String,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    ActivationWithoutDisbursement,
    ReconciliationMismatch,
    TerminalFailureSpike,
    PartnerAnomaly,
    ManualHalt,
}

impl TriggerKind {
    pub fn to_trigger(self, partner: Option<&str>) -> anyhow::Result<Trigger> {
        Ok(match self {
            Self::ActivationWithoutDisbursement => Trigger::ActivationWithoutDisbursement,
            Self::ReconciliationMismatch => Trigger::ReconciliationMismatch,
            Self::TerminalFailureSpike => Trigger::TerminalFailureSpike,
            Self::ManualHalt => Trigger::ManualHalt,
            Self::PartnerAnomaly => match partner {
                Some(partner) => Trigger::PartnerAnomaly {
                    partner_id: PartnerId::new(partner),
                },
                None => anyhow::bail!("partner-anomaly requires --partner"),
            },
        })
    }
}

#[derive(Serialize)]
pub struct FireRequest {
    #[serde(flatten)]
    pub trigger: Trigger,
    pub operator: String,
}

#[derive(Serialize)]
pub struct OperatorRequest {
    pub operator: String,
}

pub fn print_incident(incident: &Incident) {
    println!("Incident {}", incident.id);
    println!("  Trigger:  {}", incident.trigger);
    println!("  Status:   {}", incident.status);
    let actions = incident
        .actions
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    println!("  Actions:  {}", actions);
    println!("  Opened:   {} by {}", incident.opened_at, incident.opened_by);
    if let (Some(at), Some(by)) = (&incident.acknowledged_at, &incident.acknowledged_by) {
        println!("  Acked:    {} by {}", at, by);
    }
    if let (Some(at), Some(by)) = (&incident.resolved_at, &incident.resolved_by) {
        println!("  Resolved: {} by {}", at, by);
    }
}

pub async fn run(args: &IncidentArgs) -> anyhow::Result<()> {
    let client = NodeClient::new(&args.endpoint);

    let result = match &args.command {
        IncidentCommand::List => client.get::<Vec<Incident>>("/incidents").await.map(|reply| {
            reply.into_result("list incidents").map(|incidents| {
                if incidents.is_empty() {
                    println!("No incidents.");
                }
                for incident in &incidents {
                    print_incident(incident);
                }
            })
        }),
        IncidentCommand::Fire {
            trigger,
            partner,
            operator,
        } => {
            let body = FireRequest {
                trigger: trigger.to_trigger(partner.as_deref())?,
                operator: operator.clone(),
            };
            client
                .post::<_, Incident>("/incidents", &body)
                .await
                .map(|reply| reply.into_result("fire").map(|i| print_incident(&i)))
        }
        IncidentCommand::Ack { id, operator } => client
            .post::<_, Incident>(
                &format!("/incidents/{}/ack", id),
                &OperatorRequest {
                    operator: operator.clone(),
                },
            )
            .await
            .map(|reply| reply.into_result("acknowledge").map(|i| print_incident(&i))),
        IncidentCommand::Resolve { id, operator } => client
            .post::<_, Incident>(
                &format!("/incidents/{}/resolve", id),
                &OperatorRequest {
                    operator: operator.clone(),
                },
            )
            .await
            .map(|reply| reply.into_result("resolve").map(|i| print_incident(&i))),
    };

    match result {
        Ok(outcome) => outcome,
        Err(e) => {
            client.unreachable(&e);
            Ok(())
        }
    }
}
