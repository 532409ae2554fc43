use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::action_state::ActionStatus;
use crate::error::CoreError;
use crate::incident_state::IncidentStatus;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new time-ordered identifier (UUID v7).
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            /// Get the inner UUID.
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|e| CoreError::ValidationError(format!("invalid id {:?}: {}", s, e)))
            }
        }
    };
}

uuid_id!(
    /// Identifier of an off-chain loan mirror row.
    LoanId
);
uuid_id!(
    /// Identifier of a queued chain action.
    ActionId
);
uuid_id!(
    /// Identifier of a circuit-breaker incident.
    IncidentId
);
uuid_id!(
    /// Identifier of a versioned guardrail record.
    GuardrailId
);

/// Identifier of an origination partner. Opaque to the core.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartnerId(pub String);

impl PartnerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PartnerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// Loans
// ---------------------------------------------------------------------------

/// Loan lifecycle status, mirrored from the loan contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoanStatus {
    Created,
    Funding,
    Active,
    Repaid,
    Defaulted,
    Closed,
}

impl LoanStatus {
    /// Terminal loans no longer count towards partner exposure.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Repaid | Self::Defaulted | Self::Closed)
    }

    /// Numeric status as returned by the loan contract's status accessor.
    pub fn to_contract_code(&self) -> u8 {
        match self {
            Self::Created => 0,
            Self::Funding => 1,
            Self::Active => 2,
            Self::Repaid => 3,
            Self::Defaulted => 4,
            Self::Closed => 5,
        }
    }

    /// Map the contract's numeric status onto the mirrored enum.
    pub fn from_contract_code(code: u8) -> Result<Self, CoreError> {
        match code {
            0 => Ok(Self::Created),
            1 => Ok(Self::Funding),
            2 => Ok(Self::Active),
            3 => Ok(Self::Repaid),
            4 => Ok(Self::Defaulted),
            5 => Ok(Self::Closed),
            other => Err(CoreError::UnknownContractStatus(other)),
        }
    }
}

impl fmt::Display for LoanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "CREATED"),
            Self::Funding => write!(f, "FUNDING"),
            Self::Active => write!(f, "ACTIVE"),
            Self::Repaid => write!(f, "REPAID"),
            Self::Defaulted => write!(f, "DEFAULTED"),
            Self::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Terms of an origination request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoanParams {
    pub partner_id: PartnerId,
    /// Borrower's ledger address.
    pub borrower: String,
    /// Principal in the ledger's smallest unit.
    pub principal: u64,
    pub interest_rate_bps: u32,
    pub duration_secs: u64,
}

/// Off-chain mirror of a loan contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Loan {
    pub id: LoanId,
    pub partner_id: PartnerId,
    pub borrower: String,
    pub principal: u64,
    pub interest_rate_bps: u32,
    pub duration_secs: u64,
    pub status: LoanStatus,
    /// Deployed loan-contract address; `None` until the create call is mined.
    pub contract_address: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Loan {
    /// Build a fresh CREATED loan from origination terms.
    pub fn new(params: LoanParams) -> Self {
        let now = Utc::now();
        Self {
            id: LoanId::new(),
            partner_id: params.partner_id,
            borrower: params.borrower,
            principal: params.principal,
            interest_rate_bps: params.interest_rate_bps,
            duration_secs: params.duration_secs,
            status: LoanStatus::Created,
            contract_address: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Side effect applied to a loan together with a mined chain action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoanUpdate {
    pub status: Option<LoanStatus>,
    pub contract_address: Option<String>,
}

impl LoanUpdate {
    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.contract_address.is_none()
    }
}

// ---------------------------------------------------------------------------
// Chain actions
// ---------------------------------------------------------------------------

/// The closed set of ledger mutations the core knows how to dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    CreateLoan,
    RecordDisbursement,
    Activate,
    RecordRepayment,
    MarkDefault,
    Close,
}

impl ActionKind {
    pub const ALL: [ActionKind; 6] = [
        Self::CreateLoan,
        Self::RecordDisbursement,
        Self::Activate,
        Self::RecordRepayment,
        Self::MarkDefault,
        Self::Close,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateLoan => "create_loan",
            Self::RecordDisbursement => "record_disbursement",
            Self::Activate => "activate",
            Self::RecordRepayment => "record_repayment",
            Self::MarkDefault => "mark_default",
            Self::Close => "close",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One intended ledger mutation, tracked through [`ActionStatus`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainAction {
    pub id: ActionId,
    /// Enqueue order; the worker claims the lowest claimable sequence first.
    pub seq: u64,
    pub loan_id: LoanId,
    pub kind: ActionKind,
    /// Kind-specific call arguments, opaque to the queue.
    pub payload: serde_json::Value,
    pub status: ActionStatus,
    pub attempts: u32,
    pub last_tx_ref: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Request to enqueue a chain action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewChainAction {
    pub loan_id: LoanId,
    pub kind: ActionKind,
    pub payload: serde_json::Value,
}

impl NewChainAction {
    pub fn new(loan_id: LoanId, kind: ActionKind, payload: serde_json::Value) -> Self {
        Self {
            loan_id,
            kind,
            payload,
        }
    }
}

/// Result of one dispatch attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ActionOutcome {
    Mined { tx_ref: String },
    Retry { error: String },
    Terminal { error: String },
}

// ---------------------------------------------------------------------------
// Fiat proofs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FiatActionType {
    Disbursement,
    Repayment,
}

impl fmt::Display for FiatActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disbursement => write!(f, "DISBURSEMENT"),
            Self::Repayment => write!(f, "REPAYMENT"),
        }
    }
}

impl FiatActionType {
    /// Chain action that records a proof of this type on the ledger.
    pub fn action_kind(&self) -> ActionKind {
        match self {
            Self::Disbursement => ActionKind::RecordDisbursement,
            Self::Repayment => ActionKind::RecordRepayment,
        }
    }
}

/// Payload of RECORD_DISBURSEMENT and RECORD_REPAYMENT actions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FiatPayload {
    pub reference: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<u64>,
}

impl FiatPayload {
    /// Payload of the action that records `proof`. Disbursements carry no
    /// amount; the contract knows its principal.
    pub fn for_proof(proof: &FiatProofRecord) -> Self {
        let amount = match proof.action_type {
            FiatActionType::Disbursement => None,
            FiatActionType::Repayment => proof.amount,
        };
        Self {
            reference: proof.reference.clone(),
            amount,
        }
    }

    /// Parse the payload of a fiat action, if it is one.
    pub fn from_action(action: &ChainAction) -> Option<Self> {
        serde_json::from_value(action.payload.clone()).ok()
    }

    pub fn to_value(&self) -> serde_json::Value {
        let mut value = serde_json::json!({ "reference": self.reference });
        if let Some(amount) = self.amount {
            value["amount"] = serde_json::json!(amount);
        }
        value
    }
}

/// Settlement-rail attestation. `reference` is unique across all action types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FiatProofRecord {
    pub reference: String,
    pub loan_id: LoanId,
    pub action_type: FiatActionType,
    /// Amount moved on the rail, when the rail reports one.
    pub amount: Option<u64>,
    pub recorded_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Guardrails
// ---------------------------------------------------------------------------

/// Per-partner bounds on loan terms and aggregate exposure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardrailBounds {
    pub min_rate_bps: u32,
    pub max_rate_bps: u32,
    pub min_duration_secs: u64,
    pub max_duration_secs: u64,
    /// Per-loan principal cap.
    pub max_principal: u64,
    /// Cap on outstanding principal across the partner's non-terminal loans.
    pub exposure_cap: u64,
}

/// A time-versioned guardrail. Active while `effective_to` is `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardrailRecord {
    pub id: GuardrailId,
    pub partner_id: PartnerId,
    pub bounds: GuardrailBounds,
    pub effective_from: DateTime<Utc>,
    pub effective_to: Option<DateTime<Utc>>,
}

impl GuardrailRecord {
    pub fn is_active(&self) -> bool {
        self.effective_to.is_none()
    }
}

// ---------------------------------------------------------------------------
// Incidents
// ---------------------------------------------------------------------------

/// Effects an incident applies to the enforcement state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnforcementAction {
    BlockAllOriginations,
    FreezeDispatch,
    SuspendPartner { partner_id: PartnerId },
}

impl fmt::Display for EnforcementAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BlockAllOriginations => write!(f, "BLOCK_ALL_ORIGINATIONS"),
            Self::FreezeDispatch => write!(f, "FREEZE_DISPATCH"),
            Self::SuspendPartner { partner_id } => write!(f, "SUSPEND_PARTNER({})", partner_id),
        }
    }
}

/// Enumerated causes that open an incident.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "trigger", rename_all = "snake_case")]
pub enum Trigger {
    /// An activation was observed for a loan with no disbursement proof.
    ActivationWithoutDisbursement,
    /// Reconciliation found the mirror and the ledger disagreeing.
    ReconciliationMismatch,
    /// The dispatch worker hit its consecutive terminal-failure threshold.
    TerminalFailureSpike,
    /// A single partner's traffic looks anomalous.
    PartnerAnomaly { partner_id: PartnerId },
    /// Operator-initiated full halt.
    ManualHalt,
}

impl Trigger {
    /// Enforcement effects applied when an incident with this trigger opens.
    pub fn actions(&self) -> Vec<EnforcementAction> {
        match self {
            Self::ActivationWithoutDisbursement => vec![EnforcementAction::BlockAllOriginations],
            Self::ReconciliationMismatch | Self::ManualHalt => vec![
                EnforcementAction::BlockAllOriginations,
                EnforcementAction::FreezeDispatch,
            ],
            Self::TerminalFailureSpike => vec![EnforcementAction::FreezeDispatch],
            Self::PartnerAnomaly { partner_id } => vec![EnforcementAction::SuspendPartner {
                partner_id: partner_id.clone(),
            }],
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ActivationWithoutDisbursement => write!(f, "activation_without_disbursement"),
            Self::ReconciliationMismatch => write!(f, "reconciliation_mismatch"),
            Self::TerminalFailureSpike => write!(f, "terminal_failure_spike"),
            Self::PartnerAnomaly { partner_id } => write!(f, "partner_anomaly({})", partner_id),
            Self::ManualHalt => write!(f, "manual_halt"),
        }
    }
}

/// One circuit-breaker episode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Incident {
    pub id: IncidentId,
    pub trigger: Trigger,
    pub status: IncidentStatus,
    pub actions: Vec<EnforcementAction>,
    pub opened_at: DateTime<Utc>,
    pub opened_by: String,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
}

impl Incident {
    /// Open a new incident for `trigger`, applying the trigger's actions.
    pub fn open(trigger: Trigger, opened_by: impl Into<String>) -> Self {
        let actions = trigger.actions();
        Self {
            id: IncidentId::new(),
            trigger,
            status: IncidentStatus::Open,
            actions,
            opened_at: Utc::now(),
            opened_by: opened_by.into(),
            acknowledged_at: None,
            acknowledged_by: None,
            resolved_at: None,
            resolved_by: None,
        }
    }

    /// OPEN and ACKNOWLEDGED incidents still hold their effects.
    pub fn is_unresolved(&self) -> bool {
        self.status != IncidentStatus::Resolved
    }
}
