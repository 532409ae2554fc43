use std::sync::Arc;

use chrono::Utc;
use lendrail_core::{ChainAction, FiatActionType, FiatProofRecord, Loan, LoanId, LoanStatus, Store};

use crate::error::SettlementError;

/// Idempotent recorder of settlement-rail references.
///
/// References share one namespace across disbursements and repayments and
/// are never accepted twice. A loan has a single disbursement slot. An
/// accepted proof is always kept; the chain action that records it on the
/// ledger is queued in the same store write, or later once the loan can
/// take it (the CREATE_LOAN has mined, or the previous installment has left
/// the queue).
pub struct FiatProofLedger {
    store: Arc<dyn Store>,
}

impl FiatProofLedger {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Record the disbursement for a CREATED or FUNDING loan. The returned
    /// RECORD_DISBURSEMENT action is `None` until the loan's CREATE_LOAN has
    /// mined.
    pub fn record_disbursement(
        &self,
        loan_id: LoanId,
        reference: &str,
    ) -> Result<(FiatProofRecord, Option<ChainAction>), SettlementError> {
        let reference = normalize(reference)?;
        let loan = self.load_loan(&loan_id)?;
        self.reject_duplicates(&loan, &reference, FiatActionType::Disbursement)?;
        if !matches!(loan.status, LoanStatus::Created | LoanStatus::Funding) {
            return Err(SettlementError::PreconditionNotMet(format!(
                "disbursement requires a CREATED or FUNDING loan, loan {} is {}",
                loan_id, loan.status
            )));
        }

        self.insert(FiatProofRecord {
            reference,
            loan_id,
            action_type: FiatActionType::Disbursement,
            amount: Some(loan.principal),
            recorded_at: Utc::now(),
        })
    }

    /// Record one repayment installment for an ACTIVE loan. Installments are
    /// recorded on the ledger one at a time in arrival order; the returned
    /// action is `None` while an earlier one is still pending.
    pub fn record_repayment(
        &self,
        loan_id: LoanId,
        reference: &str,
        amount: u64,
    ) -> Result<(FiatProofRecord, Option<ChainAction>), SettlementError> {
        let reference = normalize(reference)?;
        let loan = self.load_loan(&loan_id)?;
        self.reject_duplicates(&loan, &reference, FiatActionType::Repayment)?;
        if amount == 0 {
            return Err(SettlementError::PreconditionNotMet(
                "repayment amount must be positive".into(),
            ));
        }
        if loan.status != LoanStatus::Active {
            return Err(SettlementError::PreconditionNotMet(format!(
                "repayment requires an ACTIVE loan, loan {} is {}",
                loan_id, loan.status
            )));
        }

        self.insert(FiatProofRecord {
            reference,
            loan_id,
            action_type: FiatActionType::Repayment,
            amount: Some(amount),
            recorded_at: Utc::now(),
        })
    }

    pub fn has_disbursement(&self, loan_id: &LoanId) -> Result<bool, SettlementError> {
        Ok(self
            .store
            .fiat_proofs_for_loan(loan_id)?
            .iter()
            .any(|p| p.action_type == FiatActionType::Disbursement))
    }

    pub fn proofs_for_loan(
        &self,
        loan_id: &LoanId,
    ) -> Result<Vec<FiatProofRecord>, SettlementError> {
        Ok(self.store.fiat_proofs_for_loan(loan_id)?)
    }

    pub fn get(&self, reference: &str) -> Result<Option<FiatProofRecord>, SettlementError> {
        Ok(self.store.get_fiat_proof(reference)?)
    }

    fn load_loan(&self, loan_id: &LoanId) -> Result<Loan, SettlementError> {
        self.store
            .get_loan(loan_id)?
            .ok_or(SettlementError::LoanNotFound(*loan_id))
    }

    /// Early idempotency checks so a replayed webhook is reported as a
    /// duplicate even after the loan has moved on. The store re-checks both
    /// rules inside the insert.
    fn reject_duplicates(
        &self,
        loan: &Loan,
        reference: &str,
        action_type: FiatActionType,
    ) -> Result<(), SettlementError> {
        if self.store.get_fiat_proof(reference)?.is_some() {
            tracing::warn!(loan_id = %loan.id, reference, "duplicate fiat reference rejected");
            return Err(SettlementError::DuplicateReference(reference.to_string()));
        }
        if action_type == FiatActionType::Disbursement && self.has_disbursement(&loan.id)? {
            tracing::warn!(loan_id = %loan.id, "second disbursement rejected");
            return Err(SettlementError::DisbursementAlreadyRecorded(loan.id));
        }
        Ok(())
    }

    fn insert(
        &self,
        record: FiatProofRecord,
    ) -> Result<(FiatProofRecord, Option<ChainAction>), SettlementError> {
        let (record, action) = self.store.insert_fiat_proof(record)?;
        match &action {
            Some(action) => tracing::info!(
                loan_id = %record.loan_id,
                reference = %record.reference,
                action_type = %record.action_type,
                action_id = %action.id,
                "fiat proof recorded"
            ),
            None => tracing::info!(
                loan_id = %record.loan_id,
                reference = %record.reference,
                action_type = %record.action_type,
                "fiat proof recorded, ledger action deferred"
            ),
        }
        Ok((record, action))
    }
}

fn normalize(reference: &str) -> Result<String, SettlementError> {
    let trimmed = reference.trim();
    if trimmed.is_empty() || trimmed.chars().all(|c| c == '0') {
        return Err(SettlementError::EmptyReference);
    }
    Ok(trimmed.to_string())
}
