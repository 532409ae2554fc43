//! Chain-action payloads and their translation into ledger calls.

use lendrail_core::{ActionKind, ChainAction, FiatPayload, Loan, LoanStatus, LoanUpdate};
use lendrail_ledger::{LedgerCall, TxReceipt};

use crate::error::SettlementError;

fn contract_address(loan: &Loan) -> Result<String, SettlementError> {
    loan.contract_address.clone().ok_or_else(|| {
        SettlementError::PreconditionNotMet(format!("loan {} has no contract address", loan.id))
    })
}

fn fiat_payload(action: &ChainAction) -> Result<FiatPayload, SettlementError> {
    serde_json::from_value(action.payload.clone()).map_err(|e| {
        SettlementError::PreconditionNotMet(format!("malformed {} payload: {}", action.kind, e))
    })
}

/// Build the ledger call a claimed action stands for.
pub fn build_call(action: &ChainAction, loan: &Loan) -> Result<LedgerCall, SettlementError> {
    let call = match action.kind {
        ActionKind::CreateLoan => LedgerCall::CreateLoan {
            loan_id: loan.id,
            borrower: loan.borrower.clone(),
            principal: loan.principal,
            interest_rate_bps: loan.interest_rate_bps,
            duration_secs: loan.duration_secs,
        },
        ActionKind::RecordDisbursement => LedgerCall::RecordDisbursement {
            loan_address: contract_address(loan)?,
            reference: fiat_payload(action)?.reference,
        },
        ActionKind::Activate => LedgerCall::Activate {
            loan_address: contract_address(loan)?,
        },
        ActionKind::RecordRepayment => {
            let payload = fiat_payload(action)?;
            LedgerCall::RecordRepayment {
                loan_address: contract_address(loan)?,
                reference: payload.reference,
                amount: payload.amount.unwrap_or_default(),
            }
        }
        ActionKind::MarkDefault => LedgerCall::MarkDefault {
            loan_address: contract_address(loan)?,
        },
        ActionKind::Close => LedgerCall::Close {
            loan_address: contract_address(loan)?,
        },
    };
    Ok(call)
}

/// Loan side effect of a mined action.
pub fn loan_effect(kind: ActionKind, receipt: &TxReceipt) -> Option<LoanUpdate> {
    let update = match kind {
        ActionKind::CreateLoan => LoanUpdate {
            status: Some(LoanStatus::Funding),
            contract_address: receipt.contract_address.clone(),
        },
        ActionKind::RecordDisbursement => return None,
        ActionKind::Activate => LoanUpdate {
            status: Some(LoanStatus::Active),
            contract_address: None,
        },
        // Only the final installment moves the loan.
        ActionKind::RecordRepayment => {
            if receipt.loan_status != Some(LoanStatus::Repaid.to_contract_code()) {
                return None;
            }
            LoanUpdate {
                status: Some(LoanStatus::Repaid),
                contract_address: None,
            }
        }
        ActionKind::MarkDefault => LoanUpdate {
            status: Some(LoanStatus::Defaulted),
            contract_address: None,
        },
        ActionKind::Close => LoanUpdate {
            status: Some(LoanStatus::Closed),
            contract_address: None,
        },
    };
    Some(update)
}
