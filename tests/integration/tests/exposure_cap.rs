//! Integration test: partner exposure caps across the loan lifecycle.

use lendrail_core::{GuardrailBounds, LoanStatus, PartnerId};
use lendrail_integration_tests::{params, Harness};
use lendrail_settlement::{SettlementError, Violation};

const PARTNER: &str = "partner-cap";

fn cap_bounds(exposure_cap: u64) -> GuardrailBounds {
    GuardrailBounds {
        min_rate_bps: 100,
        max_rate_bps: 5_000,
        min_duration_secs: 86_400,
        max_duration_secs: 365 * 86_400,
        max_principal: exposure_cap,
        exposure_cap,
    }
}

fn outstanding(h: &Harness) -> u64 {
    h.service
        .outstanding_principal(&PartnerId::from(PARTNER))
        .unwrap()
}

/// Drive an ACTIVE loan to REPAID with one full installment.
async fn repay_in_full(h: &Harness, loan_id: lendrail_core::LoanId, amount: u64, reference: &str) {
    h.service.record_repayment(loan_id, reference, amount).unwrap();
    h.drain().await;
}

// =========================================================================
// 15M cap: 10M fits, another 10M does not until the first is settled
// =========================================================================

#[tokio::test]
async fn test_exposure_cap_scenario() {
    let h = Harness::new();
    h.service
        .set_guardrail(PartnerId::from(PARTNER), cap_bounds(15_000_000))
        .unwrap();

    let first = h.funded_loan(PARTNER, 10_000_000).await;
    assert_eq!(outstanding(&h), 10_000_000);

    let err = h
        .service
        .originate(params(PARTNER, 10_000_000))
        .unwrap_err();
    assert_eq!(err.code(), "guardrail_violation");
    assert!(matches!(
        err,
        SettlementError::GuardrailViolation(Violation::ExposureCapExceeded {
            outstanding: 10_000_000,
            requested: 10_000_000,
            cap: 15_000_000,
        })
    ));
    assert_eq!(outstanding(&h), 10_000_000);

    // Settle the first loan: disburse, activate, repay in full, close.
    h.service.record_disbursement(first.id, "WIRE-CAP-1").unwrap();
    h.drain().await;
    h.service.request_activation(first.id).unwrap();
    h.drain().await;
    assert_eq!(h.loan(&first).status, LoanStatus::Active);
    assert_eq!(outstanding(&h), 10_000_000);

    repay_in_full(&h, first.id, 10_000_000, "REPAY-CAP-1").await;
    assert_eq!(h.loan(&first).status, LoanStatus::Repaid);
    assert_eq!(outstanding(&h), 0);

    h.service.request_close(first.id).unwrap();
    h.drain().await;
    assert_eq!(h.loan(&first).status, LoanStatus::Closed);
    assert_eq!(outstanding(&h), 0);

    // The retry now fits.
    let (second, _) = h.service.originate(params(PARTNER, 10_000_000)).unwrap();
    assert_eq!(second.status, LoanStatus::Created);
    assert_eq!(outstanding(&h), 10_000_000);
}

#[tokio::test]
async fn test_default_releases_exposure() {
    let h = Harness::new();
    h.service
        .set_guardrail(PartnerId::from(PARTNER), cap_bounds(15_000_000))
        .unwrap();

    let loan = h.active_loan(PARTNER, 8_000_000, "WIRE-DEF-1").await;
    h.funded_loan(PARTNER, 5_000_000).await;
    assert_eq!(outstanding(&h), 13_000_000);

    h.service.request_default(loan.id).unwrap();
    h.drain().await;
    assert_eq!(h.loan(&loan).status, LoanStatus::Defaulted);
    // Strictly decreases by the defaulted loan's principal.
    assert_eq!(outstanding(&h), 5_000_000);
    h.assert_active_implies_disbursement();
}

#[tokio::test]
async fn test_partial_repayment_keeps_exposure() {
    let h = Harness::new();
    let loan = h.active_loan(PARTNER, 1_000, "WIRE-PART-1").await;

    repay_in_full(&h, loan.id, 400, "REPAY-PART-1").await;
    assert_eq!(h.loan(&loan).status, LoanStatus::Active);
    assert_eq!(outstanding(&h), 1_000);

    repay_in_full(&h, loan.id, 600, "REPAY-PART-2").await;
    assert_eq!(h.loan(&loan).status, LoanStatus::Repaid);
    assert_eq!(outstanding(&h), 0);
    let contract = h
        .ledger
        .contract(loan.contract_address.as_deref().unwrap())
        .unwrap();
    assert_eq!(contract.outstanding, 0);
    assert_eq!(contract.repayment_refs.len(), 2);
}

#[tokio::test]
async fn test_guardrail_versions_apply_to_new_originations_only() {
    let h = Harness::new();
    let partner = PartnerId::from(PARTNER);
    h.service.set_guardrail(partner.clone(), cap_bounds(2_000)).unwrap();
    h.service.originate(params(PARTNER, 1_500)).unwrap();

    // Tighter cap below current exposure: existing loans stay, new ones fail.
    h.service.set_guardrail(partner.clone(), cap_bounds(1_000)).unwrap();
    assert!(h.service.originate(params(PARTNER, 1)).is_err());
    assert_eq!(outstanding(&h), 1_500);

    let history = h.service.guardrail_history(&partner).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history.iter().filter(|g| g.is_active()).count(), 1);
    assert_eq!(
        h.service.guardrail(&partner).unwrap().unwrap().bounds.exposure_cap,
        1_000
    );
}
