//! Indexed in-memory tables with plan/apply writes.
//!
//! Every write is split in two phases: `plan_*` validates against the
//! current tables without touching them and returns the rows it would
//! write; `apply` then installs those rows and maintains the secondary
//! indexes. A backend persists the planned rows between the two phases, so
//! a failed persist leaves memory untouched.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::action_state::{ActionEvent, ActionStateMachine, ActionStatus};
use crate::error::StoreError;
use crate::types::{
    ActionId, ActionKind, ActionOutcome, ChainAction, FiatActionType, FiatPayload,
    FiatProofRecord, GuardrailId, GuardrailRecord, Incident, IncidentId, Loan, LoanId, LoanStatus,
    LoanUpdate, NewChainAction, PartnerId,
};

/// One persisted row, tagged with its table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "table", content = "row", rename_all = "snake_case")]
pub enum Row {
    Loan(Loan),
    Action(ChainAction),
    FiatProof(FiatProofRecord),
    Guardrail(GuardrailRecord),
    Incident(Incident),
}

impl Row {
    pub fn table(&self) -> &'static str {
        match self {
            Self::Loan(_) => "loans",
            Self::Action(_) => "actions",
            Self::FiatProof(_) => "fiat_proofs",
            Self::Guardrail(_) => "guardrails",
            Self::Incident(_) => "incidents",
        }
    }

    /// Primary key within the row's table.
    pub fn key(&self) -> String {
        match self {
            Self::Loan(loan) => loan.id.to_string(),
            Self::Action(action) => action.id.to_string(),
            Self::FiatProof(proof) => proof.reference.clone(),
            Self::Guardrail(guardrail) => guardrail.id.to_string(),
            Self::Incident(incident) => incident.id.to_string(),
        }
    }
}

/// Planned write: the caller-visible result plus the rows to persist.
pub type Plan<T> = Result<(T, Vec<Row>), StoreError>;

#[derive(Debug, Default)]
pub struct Tables {
    loans: HashMap<LoanId, Loan>,
    actions: HashMap<ActionId, ChainAction>,
    /// seq → action, for ordered claiming.
    action_order: BTreeMap<u64, ActionId>,
    /// The one non-terminal action per (loan, kind).
    pending: HashMap<(LoanId, ActionKind), ActionId>,
    next_seq: u64,
    fiat_proofs: HashMap<String, FiatProofRecord>,
    /// loan → disbursement reference (one slot per loan, forever).
    disbursements: HashMap<LoanId, String>,
    guardrails: HashMap<GuardrailId, GuardrailRecord>,
    active_guardrails: HashMap<PartnerId, GuardrailId>,
    incidents: HashMap<IncidentId, Incident>,
}

impl Tables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild tables from previously persisted rows.
    pub fn from_rows(rows: impl IntoIterator<Item = Row>) -> Self {
        let mut tables = Self::new();
        tables.apply(rows);
        tables
    }

    /// Install planned rows and maintain the secondary indexes.
    pub fn apply(&mut self, rows: impl IntoIterator<Item = Row>) {
        for row in rows {
            match row {
                Row::Loan(loan) => {
                    self.loans.insert(loan.id, loan);
                }
                Row::Action(action) => {
                    let key = (action.loan_id, action.kind);
                    if action.status.is_terminal() {
                        if self.pending.get(&key) == Some(&action.id) {
                            self.pending.remove(&key);
                        }
                    } else {
                        self.pending.insert(key, action.id);
                    }
                    self.next_seq = self.next_seq.max(action.seq + 1);
                    self.action_order.insert(action.seq, action.id);
                    self.actions.insert(action.id, action);
                }
                Row::FiatProof(proof) => {
                    if proof.action_type == FiatActionType::Disbursement {
                        self.disbursements
                            .insert(proof.loan_id, proof.reference.clone());
                    }
                    self.fiat_proofs.insert(proof.reference.clone(), proof);
                }
                Row::Guardrail(guardrail) => {
                    if guardrail.is_active() {
                        self.active_guardrails
                            .insert(guardrail.partner_id.clone(), guardrail.id);
                    } else if self.active_guardrails.get(&guardrail.partner_id)
                        == Some(&guardrail.id)
                    {
                        self.active_guardrails.remove(&guardrail.partner_id);
                    }
                    self.guardrails.insert(guardrail.id, guardrail);
                }
                Row::Incident(incident) => {
                    self.incidents.insert(incident.id, incident);
                }
            }
        }
    }

    // -- reads --------------------------------------------------------------

    pub fn loan(&self, id: &LoanId) -> Option<&Loan> {
        self.loans.get(id)
    }

    pub fn loans(&self) -> Vec<Loan> {
        let mut loans: Vec<Loan> = self.loans.values().cloned().collect();
        loans.sort_by_key(|loan| (loan.created_at, loan.id));
        loans
    }

    /// Sum of principal over the partner's non-terminal loans.
    pub fn outstanding_principal(&self, partner_id: &PartnerId) -> u64 {
        self.loans
            .values()
            .filter(|loan| &loan.partner_id == partner_id && !loan.status.is_terminal())
            .map(|loan| loan.principal)
            .fold(0, u64::saturating_add)
    }

    pub fn action(&self, id: &ActionId) -> Option<&ChainAction> {
        self.actions.get(id)
    }

    /// Actions in enqueue order, optionally filtered by status.
    pub fn actions(&self, status: Option<ActionStatus>) -> Vec<ChainAction> {
        self.action_order
            .values()
            .filter_map(|id| self.actions.get(id))
            .filter(|action| status.map_or(true, |s| action.status == s))
            .cloned()
            .collect()
    }

    pub fn actions_for_loan(&self, loan_id: &LoanId) -> Vec<ChainAction> {
        self.action_order
            .values()
            .filter_map(|id| self.actions.get(id))
            .filter(|action| &action.loan_id == loan_id)
            .cloned()
            .collect()
    }

    pub fn queue_depth(&self) -> BTreeMap<ActionStatus, usize> {
        let mut depth: BTreeMap<ActionStatus, usize> =
            ActionStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for action in self.actions.values() {
            *depth.entry(action.status).or_default() += 1;
        }
        depth
    }

    pub fn fiat_proof(&self, reference: &str) -> Option<&FiatProofRecord> {
        self.fiat_proofs.get(reference)
    }

    pub fn fiat_proofs_for_loan(&self, loan_id: &LoanId) -> Vec<FiatProofRecord> {
        let mut proofs: Vec<FiatProofRecord> = self
            .fiat_proofs
            .values()
            .filter(|proof| &proof.loan_id == loan_id)
            .cloned()
            .collect();
        proofs.sort_by_key(|proof| proof.recorded_at);
        proofs
    }

    /// Oldest proof of `action_type` on the loan whose recording action has
    /// not been queued yet.
    fn oldest_deferred_proof(
        &self,
        loan_id: &LoanId,
        action_type: FiatActionType,
    ) -> Option<&FiatProofRecord> {
        let kind = action_type.action_kind();
        let queued: HashSet<String> = self
            .actions
            .values()
            .filter(|action| &action.loan_id == loan_id && action.kind == kind)
            .filter_map(FiatPayload::from_action)
            .map(|payload| payload.reference)
            .collect();
        self.fiat_proofs
            .values()
            .filter(|proof| {
                &proof.loan_id == loan_id
                    && proof.action_type == action_type
                    && !queued.contains(&proof.reference)
            })
            .min_by(|a, b| (a.recorded_at, &a.reference).cmp(&(b.recorded_at, &b.reference)))
    }

    pub fn active_guardrail(&self, partner_id: &PartnerId) -> Option<&GuardrailRecord> {
        self.active_guardrails
            .get(partner_id)
            .and_then(|id| self.guardrails.get(id))
    }

    pub fn guardrail_history(&self, partner_id: &PartnerId) -> Vec<GuardrailRecord> {
        let mut history: Vec<GuardrailRecord> = self
            .guardrails
            .values()
            .filter(|g| &g.partner_id == partner_id)
            .cloned()
            .collect();
        history.sort_by_key(|g| (g.effective_from, g.id));
        history
    }

    pub fn incident(&self, id: &IncidentId) -> Option<&Incident> {
        self.incidents.get(id)
    }

    pub fn incidents(&self) -> Vec<Incident> {
        let mut incidents: Vec<Incident> = self.incidents.values().cloned().collect();
        incidents.sort_by_key(|i| (i.opened_at, i.id));
        incidents
    }

    // -- planned writes -----------------------------------------------------

    fn new_action(&self, request: NewChainAction, seq: u64) -> Result<ChainAction, StoreError> {
        if let Some(existing) = self.pending.get(&(request.loan_id, request.kind)) {
            tracing::debug!(
                loan_id = %request.loan_id,
                kind = %request.kind,
                existing = %existing,
                "rejecting duplicate pending action"
            );
            return Err(StoreError::DuplicatePendingAction {
                loan_id: request.loan_id,
                kind: request.kind,
            });
        }
        Ok(Self::build_action(request, seq))
    }

    fn build_action(request: NewChainAction, seq: u64) -> ChainAction {
        let now = Utc::now();
        ChainAction {
            id: ActionId::new(),
            seq,
            loan_id: request.loan_id,
            kind: request.kind,
            payload: request.payload,
            status: ActionStatus::Queued,
            attempts: 0,
            last_tx_ref: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn require_loan(&self, id: &LoanId) -> Result<&Loan, StoreError> {
        self.loans.get(id).ok_or_else(|| StoreError::NotFound {
            table: "loans",
            id: id.to_string(),
        })
    }

    fn require_action(&self, id: &ActionId) -> Result<&ChainAction, StoreError> {
        self.actions.get(id).ok_or_else(|| StoreError::NotFound {
            table: "actions",
            id: id.to_string(),
        })
    }

    /// Insert a loan together with its first chain action, re-checking the
    /// exposure cap inside the same write.
    pub fn plan_insert_loan(
        &self,
        loan: Loan,
        create: NewChainAction,
        exposure_cap: Option<u64>,
    ) -> Plan<(Loan, ChainAction)> {
        if self.loans.contains_key(&loan.id) {
            return Err(StoreError::AlreadyExists {
                table: "loans",
                id: loan.id.to_string(),
            });
        }
        if create.loan_id != loan.id {
            return Err(StoreError::Backend(format!(
                "create action targets loan {} but inserting {}",
                create.loan_id, loan.id
            )));
        }
        if let Some(cap) = exposure_cap {
            let outstanding = self.outstanding_principal(&loan.partner_id);
            if outstanding.saturating_add(loan.principal) > cap {
                return Err(StoreError::ExposureCapExceeded {
                    outstanding,
                    requested: loan.principal,
                    cap,
                });
            }
        }
        let action = self.new_action(create, self.next_seq)?;
        Ok((
            (loan.clone(), action.clone()),
            vec![Row::Loan(loan), Row::Action(action)],
        ))
    }

    pub fn plan_enqueue(&self, request: NewChainAction) -> Plan<ChainAction> {
        self.require_loan(&request.loan_id)?;
        let action = self.new_action(request, self.next_seq)?;
        Ok((action.clone(), vec![Row::Action(action)]))
    }

    /// Move the oldest claimable action to PROCESSING.
    pub fn plan_claim_next(&self) -> Plan<Option<ChainAction>> {
        let next = self
            .action_order
            .values()
            .filter_map(|id| self.actions.get(id))
            .find(|action| action.status.is_claimable());

        let Some(action) = next else {
            return Ok((None, Vec::new()));
        };

        let mut claimed = action.clone();
        claimed.status = ActionStateMachine::transition(claimed.status, ActionEvent::Claim)?;
        claimed.updated_at = Utc::now();
        Ok((Some(claimed.clone()), vec![Row::Action(claimed)]))
    }

    pub fn plan_mark_sent(&self, id: &ActionId, tx_ref: &str) -> Plan<ChainAction> {
        let mut action = self.require_action(id)?.clone();
        action.status = ActionStateMachine::transition(action.status, ActionEvent::Submit)?;
        action.last_tx_ref = Some(tx_ref.to_string());
        action.updated_at = Utc::now();
        Ok((action.clone(), vec![Row::Action(action)]))
    }

    /// Record a dispatch outcome, bump the attempt count and apply the loan
    /// side effect in the same write.
    pub fn plan_record_outcome(
        &self,
        id: &ActionId,
        outcome: &ActionOutcome,
        loan_update: Option<LoanUpdate>,
    ) -> Plan<ChainAction> {
        let mut action = self.require_action(id)?.clone();
        let now = Utc::now();
        let event = match outcome {
            ActionOutcome::Mined { .. } => ActionEvent::Mine,
            ActionOutcome::Retry { .. } => ActionEvent::Retry,
            ActionOutcome::Terminal { .. } => ActionEvent::Fail,
        };
        action.status = ActionStateMachine::transition(action.status, event)?;
        action.attempts += 1;
        action.updated_at = now;
        match outcome {
            ActionOutcome::Mined { tx_ref } => action.last_tx_ref = Some(tx_ref.clone()),
            ActionOutcome::Retry { error } | ActionOutcome::Terminal { error } => {
                action.last_error = Some(error.clone())
            }
        }

        let mut rows = vec![Row::Action(action.clone())];
        if let Some(update) = loan_update.filter(|u| !u.is_empty()) {
            let mut loan = self.require_loan(&action.loan_id)?.clone();
            if let Some(status) = update.status {
                loan.status = status;
            }
            if let Some(address) = update.contract_address {
                loan.contract_address = Some(address);
            }
            loan.updated_at = now;
            rows.push(Row::Loan(loan));
        }
        if let Some(released) = self.release_deferred(&action, outcome) {
            rows.push(Row::Action(released));
        }
        Ok((action, rows))
    }

    /// The deferred proof action unblocked by `action` reaching `outcome`:
    /// a mined CREATE_LOAN releases the disbursement, and a RECORD_REPAYMENT
    /// that leaves the queue releases the next installment.
    fn release_deferred(
        &self,
        action: &ChainAction,
        outcome: &ActionOutcome,
    ) -> Option<ChainAction> {
        let action_type = match (action.kind, outcome) {
            (ActionKind::CreateLoan, ActionOutcome::Mined { .. }) => FiatActionType::Disbursement,
            (
                ActionKind::RecordRepayment,
                ActionOutcome::Mined { .. } | ActionOutcome::Terminal { .. },
            ) => FiatActionType::Repayment,
            _ => return None,
        };
        let proof = self.oldest_deferred_proof(&action.loan_id, action_type)?;
        let kind = action_type.action_kind();
        // The finishing action still holds its pending slot until apply.
        if let Some(pending) = self.pending.get(&(action.loan_id, kind)) {
            if pending != &action.id {
                return None;
            }
        }
        tracing::debug!(
            loan_id = %action.loan_id,
            reference = %proof.reference,
            kind = %kind,
            "queueing deferred fiat proof"
        );
        let request = NewChainAction::new(
            action.loan_id,
            kind,
            FiatPayload::for_proof(proof).to_value(),
        );
        Some(Self::build_action(request, self.next_seq))
    }

    /// Record a fiat proof and queue the chain action that records it on
    /// the ledger in the same write. The action is deferred (`None`) while
    /// it cannot run yet: a disbursement for a loan whose CREATE_LOAN has
    /// not mined, or a repayment behind another pending RECORD_REPAYMENT.
    /// Deferred proofs are queued by [`Tables::plan_record_outcome`].
    pub fn plan_insert_fiat_proof(
        &self,
        record: FiatProofRecord,
    ) -> Plan<(FiatProofRecord, Option<ChainAction>)> {
        let loan = self.require_loan(&record.loan_id)?;
        if self.fiat_proofs.contains_key(&record.reference) {
            return Err(StoreError::DuplicateReference(record.reference));
        }
        if record.action_type == FiatActionType::Disbursement
            && self.disbursements.contains_key(&record.loan_id)
        {
            return Err(StoreError::DisbursementAlreadyRecorded(record.loan_id));
        }

        let kind = record.action_type.action_kind();
        let deferred = match record.action_type {
            FiatActionType::Disbursement => loan.status == LoanStatus::Created,
            FiatActionType::Repayment => self.pending.contains_key(&(record.loan_id, kind)),
        };
        let mut rows = vec![Row::FiatProof(record.clone())];
        if deferred {
            tracing::debug!(
                loan_id = %record.loan_id,
                reference = %record.reference,
                kind = %kind,
                "fiat proof action deferred"
            );
            return Ok(((record, None), rows));
        }
        let request = NewChainAction::new(
            record.loan_id,
            kind,
            FiatPayload::for_proof(&record).to_value(),
        );
        let action = self.new_action(request, self.next_seq)?;
        rows.push(Row::Action(action.clone()));
        Ok(((record, Some(action)), rows))
    }

    /// Insert a guardrail, closing the partner's previous one at the same
    /// instant so there is neither a gap nor an overlap.
    pub fn plan_insert_guardrail(&self, mut record: GuardrailRecord) -> Plan<GuardrailRecord> {
        let mut rows = Vec::with_capacity(2);
        if let Some(previous) = self.active_guardrail(&record.partner_id) {
            let mut closed = previous.clone();
            closed.effective_to = Some(record.effective_from);
            rows.push(Row::Guardrail(closed));
        }
        record.effective_to = None;
        rows.push(Row::Guardrail(record.clone()));
        Ok((record, rows))
    }

    pub fn plan_insert_incident(&self, incident: Incident) -> Plan<Incident> {
        if self.incidents.contains_key(&incident.id) {
            return Err(StoreError::AlreadyExists {
                table: "incidents",
                id: incident.id.to_string(),
            });
        }
        Ok((incident.clone(), vec![Row::Incident(incident)]))
    }

    pub fn plan_update_incident(&self, incident: Incident) -> Plan<Incident> {
        if !self.incidents.contains_key(&incident.id) {
            return Err(StoreError::NotFound {
                table: "incidents",
                id: incident.id.to_string(),
            });
        }
        Ok((incident.clone(), vec![Row::Incident(incident)]))
    }
}
