use lendrail_core::{ActionId, ActionKind, CoreError, IncidentId, LoanId, PartnerId, StoreError};
use lendrail_ledger::LedgerError;

use crate::guardrail::Violation;

/// Broad class of a [`SettlementError`], for callers that route on it
/// (HTTP status codes, drill assertions).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The request itself is invalid under current policy.
    Policy,
    /// The system is halted; the request may be fine.
    Halt,
    /// A duplicate of something already recorded or pending.
    Idempotency,
    NotFound,
    /// An operation that is illegal in the current lifecycle state.
    Conflict,
    Infrastructure,
}

/// Settlement-core errors.
#[derive(Debug, thiserror::Error)]
pub enum SettlementError {
    // -- policy --
    #[error("guardrail violation: {0}")]
    GuardrailViolation(Violation),

    #[error("no disbursement proof recorded for loan {0}")]
    FiatProofMissing(LoanId),

    #[error("precondition not met: {0}")]
    PreconditionNotMet(String),

    #[error("fiat reference must not be empty")]
    EmptyReference,

    // -- operational halt --
    #[error("origination blocked for partner {partner_id}: {reason}")]
    OriginationBlocked {
        partner_id: PartnerId,
        reason: String,
    },

    #[error("dispatch frozen by circuit breaker")]
    DispatchFrozen,

    // -- idempotency --
    #[error("a non-terminal {kind} action already exists for loan {loan_id}")]
    DuplicatePendingAction { loan_id: LoanId, kind: ActionKind },

    #[error("fiat reference already recorded: {0}")]
    DuplicateReference(String),

    #[error("disbursement already recorded for loan {0}")]
    DisbursementAlreadyRecorded(LoanId),

    // -- lifecycle --
    #[error("invalid incident transition: {0}")]
    InvalidIncidentTransition(String),

    #[error("incident not found: {0}")]
    IncidentNotFound(IncidentId),

    #[error("loan not found: {0}")]
    LoanNotFound(LoanId),

    #[error("chain action not found: {0}")]
    ActionNotFound(ActionId),

    #[error("recovery blocked: reconciliation reported {mismatches} finding(s)")]
    RecoveryBlocked { mismatches: usize },

    #[error("worker must be paused for this operation")]
    WorkerNotPaused,

    // -- plumbing --
    #[error("store error: {0}")]
    Store(StoreError),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("core error: {0}")]
    Core(CoreError),
}

impl SettlementError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::GuardrailViolation(_) => "guardrail_violation",
            Self::FiatProofMissing(_) => "fiat_proof_missing",
            Self::PreconditionNotMet(_) => "precondition_not_met",
            Self::EmptyReference => "empty_reference",
            Self::OriginationBlocked { .. } => "origination_blocked",
            Self::DispatchFrozen => "dispatch_frozen",
            Self::DuplicatePendingAction { .. } => "duplicate_pending_action",
            Self::DuplicateReference(_) => "duplicate_reference",
            Self::DisbursementAlreadyRecorded(_) => "disbursement_already_recorded",
            Self::InvalidIncidentTransition(_) => "invalid_incident_transition",
            Self::IncidentNotFound(_) => "incident_not_found",
            Self::LoanNotFound(_) => "loan_not_found",
            Self::ActionNotFound(_) => "action_not_found",
            Self::RecoveryBlocked { .. } => "recovery_blocked",
            Self::WorkerNotPaused => "worker_not_paused",
            Self::Store(_) => "store_error",
            Self::Ledger(_) => "ledger_error",
            Self::Core(_) => "core_error",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::GuardrailViolation(_)
            | Self::FiatProofMissing(_)
            | Self::PreconditionNotMet(_)
            | Self::EmptyReference => ErrorCategory::Policy,
            Self::OriginationBlocked { .. } | Self::DispatchFrozen => ErrorCategory::Halt,
            Self::DuplicatePendingAction { .. }
            | Self::DuplicateReference(_)
            | Self::DisbursementAlreadyRecorded(_) => ErrorCategory::Idempotency,
            Self::IncidentNotFound(_) | Self::LoanNotFound(_) | Self::ActionNotFound(_) => {
                ErrorCategory::NotFound
            }
            Self::InvalidIncidentTransition(_)
            | Self::RecoveryBlocked { .. }
            | Self::WorkerNotPaused => ErrorCategory::Conflict,
            Self::Core(CoreError::ValidationError(_)) => ErrorCategory::Policy,
            Self::Store(_) | Self::Ledger(_) | Self::Core(_) => ErrorCategory::Infrastructure,
        }
    }
}

impl From<StoreError> for SettlementError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicatePendingAction { loan_id, kind } => {
                Self::DuplicatePendingAction { loan_id, kind }
            }
            StoreError::DuplicateReference(reference) => Self::DuplicateReference(reference),
            StoreError::DisbursementAlreadyRecorded(loan_id) => {
                Self::DisbursementAlreadyRecorded(loan_id)
            }
            StoreError::ExposureCapExceeded {
                outstanding,
                requested,
                cap,
            } => Self::GuardrailViolation(Violation::ExposureCapExceeded {
                outstanding,
                requested,
                cap,
            }),
            StoreError::Transition(core) => Self::from(core),
            other => Self::Store(other),
        }
    }
}

impl From<CoreError> for SettlementError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InvalidIncidentTransition { .. } => {
                Self::InvalidIncidentTransition(err.to_string())
            }
            other => Self::Core(other),
        }
    }
}
