use crate::action_state::ActionStatus;
use crate::incident_state::IncidentStatus;
use crate::types::{ActionKind, LoanId};

/// Domain-level errors.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("invalid chain action transition from {from} to {to}")]
    InvalidActionTransition { from: ActionStatus, to: ActionStatus },

    #[error("invalid incident transition from {from} to {to}")]
    InvalidIncidentTransition {
        from: IncidentStatus,
        to: IncidentStatus,
    },

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("unknown contract status code: {0}")]
    UnknownContractStatus(u8),
}

/// Persistence-layer errors.
///
/// Uniqueness violations are distinct variants so callers can tell an
/// idempotency conflict apart from an infrastructure failure.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{table} not found: {id}")]
    NotFound { table: &'static str, id: String },

    #[error("{table} already exists: {id}")]
    AlreadyExists { table: &'static str, id: String },

    #[error("a non-terminal {kind} action already exists for loan {loan_id}")]
    DuplicatePendingAction { loan_id: LoanId, kind: ActionKind },

    #[error("fiat reference already recorded: {0}")]
    DuplicateReference(String),

    #[error("disbursement already recorded for loan {0}")]
    DisbursementAlreadyRecorded(LoanId),

    #[error("exposure cap exceeded: outstanding {outstanding} + requested {requested} > cap {cap}")]
    ExposureCapExceeded {
        outstanding: u64,
        requested: u64,
        cap: u64,
    },

    #[error("state transition rejected: {0}")]
    Transition(#[from] CoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store lock poisoned")]
    LockPoisoned,

    #[error("storage backend error: {0}")]
    Backend(String),
}
