use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use lendrail_core::{ActionKind, ActionStatus, FiatActionType, Loan, LoanId, LoanStatus, Store};
use lendrail_ledger::{LedgerError, LedgerGateway};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::error::SettlementError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", content = "size", rename_all = "snake_case")]
pub enum ReconcileScope {
    /// Every loan in the mirror.
    Full,
    /// A uniform random sample of at most this many loans.
    Sample(usize),
}

/// One disagreement between the mirror and the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "finding", rename_all = "snake_case")]
pub enum Finding {
    StatusMismatch {
        loan_id: LoanId,
        stored: LoanStatus,
        on_chain: LoanStatus,
    },
    UnknownContractStatus {
        loan_id: LoanId,
        code: u8,
    },
    /// The mirror has a contract address the ledger does not know.
    MissingOnChain {
        loan_id: LoanId,
        contract_address: String,
    },
    /// ACTIVE in the mirror with no disbursement proof on file.
    ActiveWithoutDisbursement {
        loan_id: LoanId,
    },
    /// CREATE_LOAN was submitted and the mirror has no contract address,
    /// yet the ledger deployed one (`ledger_address`) or the action mined.
    MissingContractAddress {
        loan_id: LoanId,
        create_status: ActionStatus,
        ledger_address: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub scope: ReconcileScope,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Loans compared against the ledger.
    pub checked: usize,
    /// Loans whose CREATE_LOAN has not been submitted yet.
    pub skipped: usize,
    pub ledger_paused: bool,
    pub findings: Vec<Finding>,
}

impl ReconciliationReport {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }
}

/// Read-only comparator between stored loan status and live contract
/// status.
pub struct Reconciler {
    store: Arc<dyn Store>,
    ledger: Arc<dyn LedgerGateway>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn Store>, ledger: Arc<dyn LedgerGateway>) -> Self {
        Self { store, ledger }
    }

    pub async fn run(
        &self,
        scope: ReconcileScope,
    ) -> Result<ReconciliationReport, SettlementError> {
        let started_at = Utc::now();
        let mut loans = self.store.list_loans()?;
        if let ReconcileScope::Sample(size) = scope {
            loans.shuffle(&mut rand::thread_rng());
            loans.truncate(size);
        }

        let mut disbursed = HashSet::new();
        for loan in loans.iter().filter(|l| l.status == LoanStatus::Active) {
            let proofs = self.store.fiat_proofs_for_loan(&loan.id)?;
            if proofs
                .iter()
                .any(|p| p.action_type == FiatActionType::Disbursement)
            {
                disbursed.insert(loan.id);
            }
        }

        let ledger_paused = self.ledger.is_paused().await?;
        let mut report = ReconciliationReport {
            scope,
            started_at,
            finished_at: started_at,
            checked: 0,
            skipped: 0,
            ledger_paused,
            findings: Vec::new(),
        };

        for loan in &loans {
            if loan.status == LoanStatus::Active && !disbursed.contains(&loan.id) {
                report
                    .findings
                    .push(Finding::ActiveWithoutDisbursement { loan_id: loan.id });
            }
            match self.compare(loan).await? {
                Comparison::Skipped => report.skipped += 1,
                Comparison::Checked(finding) => {
                    report.checked += 1;
                    report.findings.extend(finding);
                }
            }
        }

        report.finished_at = Utc::now();
        for finding in &report.findings {
            tracing::warn!(?finding, "reconciliation finding");
        }
        tracing::info!(
            checked = report.checked,
            skipped = report.skipped,
            findings = report.findings.len(),
            ledger_paused,
            "reconciliation complete"
        );
        Ok(report)
    }

    async fn compare(&self, loan: &Loan) -> Result<Comparison, SettlementError> {
        let Some(address) = loan.contract_address.as_deref() else {
            return self.compare_undeployed(loan).await;
        };
        let code = match self.ledger.loan_status(address).await {
            Ok(code) => code,
            Err(LedgerError::UnknownLoan(_)) => {
                return Ok(Comparison::Checked(Some(Finding::MissingOnChain {
                    loan_id: loan.id,
                    contract_address: address.to_string(),
                })))
            }
            Err(e) => return Err(e.into()),
        };
        let finding = match LoanStatus::from_contract_code(code) {
            Ok(on_chain) if on_chain == loan.status => None,
            Ok(on_chain) => Some(Finding::StatusMismatch {
                loan_id: loan.id,
                stored: loan.status,
                on_chain,
            }),
            Err(_) => Some(Finding::UnknownContractStatus {
                loan_id: loan.id,
                code,
            }),
        };
        Ok(Comparison::Checked(finding))
    }

    async fn compare_undeployed(&self, loan: &Loan) -> Result<Comparison, SettlementError> {
        let submitted = self
            .store
            .actions_for_loan(&loan.id)?
            .into_iter()
            .filter(|a| a.kind == ActionKind::CreateLoan)
            .map(|a| a.status)
            .find(|status| {
                matches!(
                    status,
                    ActionStatus::Sent | ActionStatus::Mined | ActionStatus::Failed
                )
            });
        let Some(create_status) = submitted else {
            return Ok(Comparison::Skipped);
        };
        let ledger_address = self.ledger.loan_address(&loan.id).await?;
        if ledger_address.is_none() && create_status != ActionStatus::Mined {
            return Ok(Comparison::Checked(None));
        }
        Ok(Comparison::Checked(Some(Finding::MissingContractAddress {
            loan_id: loan.id,
            create_status,
            ledger_address,
        })))
    }
}

enum Comparison {
    Skipped,
    Checked(Option<Finding>),
}
