//! Persistence seam.
//!
//! The settlement core treats storage as a transactional key-value store
//! with unique constraints and aggregate queries. Each `Store` method is
//! one atomic unit: composite writes (loan + first action, fiat proof +
//! follow-up action, outcome + loan side effect) either land together or
//! not at all, and the uniqueness rules (one non-terminal action per
//! loan/kind, one global fiat reference, one disbursement per loan) are
//! enforced inside that unit rather than by callers.

mod memory;
mod tables;

pub use memory::{MemoryStore, RowSink, TableStore};
pub use tables::{Plan, Row, Tables};

use std::collections::BTreeMap;

use crate::action_state::ActionStatus;
use crate::error::StoreError;
use crate::types::{
    ActionId, ActionOutcome, ChainAction, FiatProofRecord, GuardrailRecord, Incident, IncidentId,
    Loan, LoanId, LoanUpdate, NewChainAction, PartnerId,
};

pub trait Store: Send + Sync {
    // -- loans --

    /// Insert a CREATED loan and enqueue its create action atomically.
    /// With `exposure_cap`, the partner's outstanding principal plus the new
    /// principal is re-checked inside the write.
    fn insert_loan(
        &self,
        loan: Loan,
        create: NewChainAction,
        exposure_cap: Option<u64>,
    ) -> Result<(Loan, ChainAction), StoreError>;

    fn get_loan(&self, id: &LoanId) -> Result<Option<Loan>, StoreError>;

    fn list_loans(&self) -> Result<Vec<Loan>, StoreError>;

    /// Sum of principal across the partner's non-terminal loans.
    fn outstanding_principal(&self, partner_id: &PartnerId) -> Result<u64, StoreError>;

    // -- chain actions --

    /// Create a QUEUED action, failing with `DuplicatePendingAction` when a
    /// non-terminal action of the same (loan, kind) exists.
    fn enqueue(&self, action: NewChainAction) -> Result<ChainAction, StoreError>;

    /// Conditionally move the oldest QUEUED/RETRYING action to PROCESSING.
    fn claim_next(&self) -> Result<Option<ChainAction>, StoreError>;

    fn mark_sent(&self, id: &ActionId, tx_ref: &str) -> Result<ChainAction, StoreError>;

    fn record_outcome(
        &self,
        id: &ActionId,
        outcome: &ActionOutcome,
        loan_update: Option<LoanUpdate>,
    ) -> Result<ChainAction, StoreError>;

    fn get_action(&self, id: &ActionId) -> Result<Option<ChainAction>, StoreError>;

    /// Actions in enqueue order, optionally filtered by status.
    fn list_actions(&self, status: Option<ActionStatus>) -> Result<Vec<ChainAction>, StoreError>;

    fn actions_for_loan(&self, loan_id: &LoanId) -> Result<Vec<ChainAction>, StoreError>;

    /// Number of actions per status; every status is present.
    fn queue_depth(&self) -> Result<BTreeMap<ActionStatus, usize>, StoreError>;

    // -- fiat proofs --

    /// Record a proof and queue its ledger action, or defer the action
    /// until the loan can take it (`None`).
    fn insert_fiat_proof(
        &self,
        record: FiatProofRecord,
    ) -> Result<(FiatProofRecord, Option<ChainAction>), StoreError>;

    fn get_fiat_proof(&self, reference: &str) -> Result<Option<FiatProofRecord>, StoreError>;

    fn fiat_proofs_for_loan(&self, loan_id: &LoanId) -> Result<Vec<FiatProofRecord>, StoreError>;

    // -- guardrails --

    /// Insert a new active guardrail, closing the previous one atomically.
    fn insert_guardrail(&self, record: GuardrailRecord) -> Result<GuardrailRecord, StoreError>;

    fn active_guardrail(&self, partner_id: &PartnerId)
        -> Result<Option<GuardrailRecord>, StoreError>;

    fn guardrail_history(&self, partner_id: &PartnerId)
        -> Result<Vec<GuardrailRecord>, StoreError>;

    // -- incidents --

    fn insert_incident(&self, incident: Incident) -> Result<Incident, StoreError>;

    fn update_incident(&self, incident: Incident) -> Result<Incident, StoreError>;

    fn get_incident(&self, id: &IncidentId) -> Result<Option<Incident>, StoreError>;

    fn list_incidents(&self) -> Result<Vec<Incident>, StoreError>;
}
