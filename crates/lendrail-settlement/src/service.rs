use std::collections::BTreeMap;
use std::sync::Arc;

use lendrail_core::{
    ActionId, ActionKind, ActionStatus, ChainAction, DispatchConfig, FiatProofRecord,
    GuardrailBounds, GuardrailRecord, Incident, IncidentId, Loan, LoanId, LoanParams, LoanStatus,
    NewChainAction, PartnerId, Store, Trigger,
};
use lendrail_ledger::{LedgerGateway, Signer};
use serde::{Deserialize, Serialize};

use crate::breaker::{CircuitBreaker, EnforcementState};
use crate::error::SettlementError;
use crate::fiat::FiatProofLedger;
use crate::guardrail::GuardrailEvaluator;
use crate::queue::ChainActionQueue;
use crate::reconcile::{ReconcileScope, Reconciler, ReconciliationReport};
use crate::worker::DispatchWorker;

/// Status/metrics read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub queue_depth: BTreeMap<ActionStatus, usize>,
    pub enforcement: EnforcementState,
    pub worker_paused: bool,
    pub unresolved_incidents: usize,
    pub signer_address: String,
    pub gateway_id: String,
}

/// A loan with its chain actions and fiat proofs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoanDetail {
    pub loan: Loan,
    pub actions: Vec<ChainAction>,
    pub fiat_proofs: Vec<FiatProofRecord>,
}

/// The seams the HTTP layer, the CLI drills and the tests all call
/// through.
pub struct SettlementService {
    store: Arc<dyn Store>,
    ledger: Arc<dyn LedgerGateway>,
    queue: ChainActionQueue,
    breaker: Arc<CircuitBreaker>,
    guardrails: GuardrailEvaluator,
    fiat: FiatProofLedger,
    reconciler: Reconciler,
    worker: Arc<DispatchWorker>,
}

impl SettlementService {
    pub fn new(
        store: Arc<dyn Store>,
        ledger: Arc<dyn LedgerGateway>,
        signer: Signer,
        config: DispatchConfig,
    ) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(store.clone()));
        let worker = Arc::new(DispatchWorker::new(
            store.clone(),
            ledger.clone(),
            breaker.clone(),
            signer,
            config,
        ));
        Self {
            queue: ChainActionQueue::new(store.clone()),
            guardrails: GuardrailEvaluator::new(store.clone()),
            fiat: FiatProofLedger::new(store.clone()),
            reconciler: Reconciler::new(store.clone(), ledger.clone()),
            store,
            ledger,
            breaker,
            worker,
        }
    }

    /// Start-up recovery: replay unresolved incidents, then return stranded
    /// in-flight actions to the queue.
    pub async fn recover(&self) -> Result<(), SettlementError> {
        let incidents = self.breaker.restore()?;
        let actions = self.worker.recover_in_flight().await?;
        tracing::info!(incidents, actions, "settlement core recovered");
        Ok(())
    }

    pub fn worker(&self) -> Arc<DispatchWorker> {
        Arc::clone(&self.worker)
    }

    pub fn breaker(&self) -> Arc<CircuitBreaker> {
        Arc::clone(&self.breaker)
    }

    // -- loans --------------------------------------------------------------

    /// Gate, check guardrails, then write the CREATED loan and its
    /// CREATE_LOAN action together.
    pub fn originate(&self, params: LoanParams) -> Result<(Loan, ChainAction), SettlementError> {
        if params.borrower.trim().is_empty() {
            return Err(SettlementError::PreconditionNotMet(
                "borrower address is required".into(),
            ));
        }
        if params.principal == 0 {
            return Err(SettlementError::PreconditionNotMet(
                "principal must be positive".into(),
            ));
        }
        self.breaker.assert_origination_allowed(&params.partner_id)?;
        let guardrail = self.guardrails.enforce(&params.partner_id, &params)?;

        let loan = Loan::new(params);
        let create = NewChainAction::new(loan.id, ActionKind::CreateLoan, serde_json::json!({}));
        let (loan, action) = self.store.insert_loan(
            loan,
            create,
            guardrail.map(|g| g.bounds.exposure_cap),
        )?;
        tracing::info!(
            loan_id = %loan.id,
            partner_id = %loan.partner_id,
            principal = loan.principal,
            action_id = %action.id,
            "loan originated"
        );
        Ok((loan, action))
    }

    pub fn loan(&self, loan_id: &LoanId) -> Result<Loan, SettlementError> {
        self.store
            .get_loan(loan_id)?
            .ok_or(SettlementError::LoanNotFound(*loan_id))
    }

    pub fn loan_detail(&self, loan_id: &LoanId) -> Result<LoanDetail, SettlementError> {
        Ok(LoanDetail {
            loan: self.loan(loan_id)?,
            actions: self.queue.for_loan(loan_id)?,
            fiat_proofs: self.fiat.proofs_for_loan(loan_id)?,
        })
    }

    pub fn loans(&self) -> Result<Vec<Loan>, SettlementError> {
        Ok(self.store.list_loans()?)
    }

    /// The returned action is `None` while the loan's CREATE_LOAN is still
    /// pending; it is queued once that mines.
    pub fn record_disbursement(
        &self,
        loan_id: LoanId,
        reference: &str,
    ) -> Result<(FiatProofRecord, Option<ChainAction>), SettlementError> {
        self.fiat.record_disbursement(loan_id, reference)
    }

    pub fn record_repayment(
        &self,
        loan_id: LoanId,
        reference: &str,
        amount: u64,
    ) -> Result<(FiatProofRecord, Option<ChainAction>), SettlementError> {
        self.fiat.record_repayment(loan_id, reference, amount)
    }

    /// Queue activation once the loan is FUNDING, a disbursement proof is on
    /// file and the ledger has mined its record.
    pub fn request_activation(&self, loan_id: LoanId) -> Result<ChainAction, SettlementError> {
        let loan = self.loan(&loan_id)?;
        if !self.fiat.has_disbursement(&loan_id)? {
            return Err(SettlementError::FiatProofMissing(loan_id));
        }
        require_status(&loan, &[LoanStatus::Funding])?;
        let recorded_on_chain = self.queue.for_loan(&loan_id)?.iter().any(|a| {
            a.kind == ActionKind::RecordDisbursement && a.status == ActionStatus::Mined
        });
        if !recorded_on_chain {
            return Err(SettlementError::PreconditionNotMet(format!(
                "disbursement for loan {} is not yet recorded on the ledger",
                loan_id
            )));
        }
        self.queue
            .enqueue(loan_id, ActionKind::Activate, serde_json::json!({}))
    }

    pub fn request_default(&self, loan_id: LoanId) -> Result<ChainAction, SettlementError> {
        let loan = self.loan(&loan_id)?;
        require_status(&loan, &[LoanStatus::Active])?;
        self.queue
            .enqueue(loan_id, ActionKind::MarkDefault, serde_json::json!({}))
    }

    pub fn request_close(&self, loan_id: LoanId) -> Result<ChainAction, SettlementError> {
        let loan = self.loan(&loan_id)?;
        require_status(&loan, &[LoanStatus::Repaid, LoanStatus::Defaulted])?;
        self.queue
            .enqueue(loan_id, ActionKind::Close, serde_json::json!({}))
    }

    /// Sum of principal across the partner's non-terminal loans.
    pub fn outstanding_principal(&self, partner_id: &PartnerId) -> Result<u64, SettlementError> {
        Ok(self.store.outstanding_principal(partner_id)?)
    }

    // -- guardrails ---------------------------------------------------------

    pub fn set_guardrail(
        &self,
        partner_id: PartnerId,
        bounds: GuardrailBounds,
    ) -> Result<GuardrailRecord, SettlementError> {
        self.guardrails.set(partner_id, bounds)
    }

    pub fn guardrail(&self, partner_id: &PartnerId) -> Result<Option<GuardrailRecord>, SettlementError> {
        self.guardrails.active(partner_id)
    }

    pub fn guardrail_history(
        &self,
        partner_id: &PartnerId,
    ) -> Result<Vec<GuardrailRecord>, SettlementError> {
        self.guardrails.history(partner_id)
    }

    // -- queue --------------------------------------------------------------

    pub fn list_actions(&self, status: Option<ActionStatus>) -> Result<Vec<ChainAction>, SettlementError> {
        self.queue.list(status)
    }

    pub fn dead_letters(&self) -> Result<Vec<ChainAction>, SettlementError> {
        self.queue.dead_letters()
    }

    /// Queue a fresh copy of a dead-lettered action. The FAILED row is left
    /// as it was.
    pub fn redrive(&self, action_id: &ActionId) -> Result<ChainAction, SettlementError> {
        let failed = self.queue.get(action_id)?;
        if failed.status != ActionStatus::Failed {
            return Err(SettlementError::PreconditionNotMet(format!(
                "action {} is {}, only FAILED actions can be re-driven",
                action_id, failed.status
            )));
        }
        let action = self
            .queue
            .enqueue(failed.loan_id, failed.kind, failed.payload.clone())?;
        tracing::info!(
            failed_action_id = %action_id,
            action_id = %action.id,
            kind = %action.kind,
            "dead-lettered action re-driven"
        );
        Ok(action)
    }

    // -- incidents ----------------------------------------------------------

    pub fn fire(&self, trigger: Trigger, operator: &str) -> Result<Incident, SettlementError> {
        self.breaker.fire(trigger, operator)
    }

    pub fn acknowledge(&self, id: &IncidentId, operator: &str) -> Result<Incident, SettlementError> {
        self.breaker.acknowledge(id, operator)
    }

    /// Resolve an incident. When the resolution would lift the dispatch
    /// freeze, a full reconciliation must come back clean first.
    pub async fn resolve(&self, id: &IncidentId, operator: &str) -> Result<Incident, SettlementError> {
        if self.breaker.resolution_lifts_freeze(id)? {
            let report = self.reconciler.run(ReconcileScope::Full).await?;
            if !report.is_clean() {
                tracing::warn!(
                    incident_id = %id,
                    findings = report.findings.len(),
                    "recovery blocked by reconciliation"
                );
                return Err(SettlementError::RecoveryBlocked {
                    mismatches: report.findings.len(),
                });
            }
        }
        self.breaker.resolve(id, operator)
    }

    pub fn incident(&self, id: &IncidentId) -> Result<Incident, SettlementError> {
        self.breaker.incident(id)
    }

    pub fn incidents(&self) -> Result<Vec<Incident>, SettlementError> {
        self.breaker.incidents()
    }

    // -- worker -------------------------------------------------------------

    pub fn pause_worker(&self) {
        self.worker.pause();
    }

    pub fn resume_worker(&self) {
        self.worker.resume();
    }

    /// Pause, rotate, resume. The worker stays paused if it already was.
    pub async fn rotate_signer(&self, signer: Signer) -> Result<String, SettlementError> {
        let was_paused = self.worker.is_paused();
        self.worker.pause();
        let rotated = self.worker.rotate_signer(signer).await;
        if !was_paused {
            self.worker.resume();
        }
        rotated
    }

    // -- reconciliation and status -----------------------------------------

    pub async fn reconcile(&self, scope: ReconcileScope) -> Result<ReconciliationReport, SettlementError> {
        self.reconciler.run(scope).await
    }

    pub fn status(&self) -> Result<StatusSnapshot, SettlementError> {
        Ok(StatusSnapshot {
            queue_depth: self.queue.depth()?,
            enforcement: self.breaker.snapshot().as_ref().clone(),
            worker_paused: self.worker.is_paused(),
            unresolved_incidents: self.breaker.unresolved()?.len(),
            signer_address: self.worker.signer_address(),
            gateway_id: self.ledger.gateway_id().to_string(),
        })
    }
}

fn require_status(loan: &Loan, allowed: &[LoanStatus]) -> Result<(), SettlementError> {
    if allowed.contains(&loan.status) {
        return Ok(());
    }
    let allowed = allowed
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(" or ");
    Err(SettlementError::PreconditionNotMet(format!(
        "loan {} is {}, expected {}",
        loan.id, loan.status, allowed
    )))
}
