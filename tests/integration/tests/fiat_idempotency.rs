//! Integration test: replayed settlement-rail webhooks never change state
//! twice.

use lendrail_core::{ActionKind, ActionStatus, LoanStatus, Store};
use lendrail_integration_tests::{params, Harness};
use lendrail_settlement::SettlementError;

// =========================================================================
// Duplicate repayment webhook
// =========================================================================

#[tokio::test]
async fn test_duplicate_repayment_webhook() {
    let h = Harness::new();
    let loan = h.active_loan("partner-a", 1_000, "WIRE-1").await;
    let address = loan.contract_address.clone().unwrap();

    h.service.record_repayment(loan.id, "ACH-R", 300).unwrap();
    let depth_before = h.store.queue_depth().unwrap();

    let err = h.service.record_repayment(loan.id, "ACH-R", 300).unwrap_err();
    assert!(matches!(err, SettlementError::DuplicateReference(ref r) if r == "ACH-R"));
    assert_eq!(h.store.queue_depth().unwrap(), depth_before);

    h.drain().await;
    // Replay after the first was mined is rejected the same way.
    assert!(h.service.record_repayment(loan.id, "ACH-R", 300).is_err());

    let contract = h.ledger.contract(&address).unwrap();
    assert_eq!(contract.outstanding, 700);
    assert_eq!(contract.repayment_refs, vec!["ACH-R".to_string()]);
    assert_eq!(h.loan(&loan).status, LoanStatus::Active);

    let detail = h.service.loan_detail(&loan.id).unwrap();
    assert_eq!(detail.fiat_proofs.len(), 2);
    let repayments = detail
        .actions
        .iter()
        .filter(|a| a.kind == ActionKind::RecordRepayment)
        .count();
    assert_eq!(repayments, 1);
}

#[tokio::test]
async fn test_repayment_cannot_reuse_disbursement_reference() {
    let h = Harness::new();
    let loan = h.active_loan("partner-a", 1_000, "SHARED-REF").await;
    let err = h
        .service
        .record_repayment(loan.id, "SHARED-REF", 100)
        .unwrap_err();
    assert_eq!(err.code(), "duplicate_reference");
}

// =========================================================================
// Installments arriving back to back
// =========================================================================

#[tokio::test]
async fn test_back_to_back_installments_are_all_recorded() {
    let h = Harness::new();
    let loan = h.active_loan("partner-a", 1_000, "WIRE-INST").await;
    let address = loan.contract_address.clone().unwrap();

    let (_, first) = h.service.record_repayment(loan.id, "ACH-1", 300).unwrap();
    let (_, second) = h.service.record_repayment(loan.id, "ACH-2", 200).unwrap();
    let (_, third) = h.service.record_repayment(loan.id, "ACH-3", 500).unwrap();
    assert!(first.is_some());
    assert!(second.is_none());
    assert!(third.is_none());

    assert_eq!(h.drain().await, 3);
    let contract = h.ledger.contract(&address).unwrap();
    assert_eq!(
        contract.repayment_refs,
        vec!["ACH-1".to_string(), "ACH-2".to_string(), "ACH-3".to_string()]
    );
    assert_eq!(contract.outstanding, 0);
    assert_eq!(h.loan(&loan).status, LoanStatus::Repaid);
    assert_eq!(h.service.loan_detail(&loan.id).unwrap().fiat_proofs.len(), 4);
}

// =========================================================================
// Disbursement: one slot per loan, forever
// =========================================================================

#[tokio::test]
async fn test_second_disbursement_always_fails() {
    let h = Harness::new();
    let loan = h.funded_loan("partner-a", 1_000).await;

    h.service.record_disbursement(loan.id, "WIRE-A").unwrap();
    assert!(matches!(
        h.service.record_disbursement(loan.id, "WIRE-A"),
        Err(SettlementError::DuplicateReference(_))
    ));
    assert!(matches!(
        h.service.record_disbursement(loan.id, "WIRE-B"),
        Err(SettlementError::DisbursementAlreadyRecorded(_))
    ));

    h.drain().await;
    h.service.request_activation(loan.id).unwrap();
    h.drain().await;
    // Still rejected once the loan has moved on.
    assert!(matches!(
        h.service.record_disbursement(loan.id, "WIRE-C"),
        Err(SettlementError::DisbursementAlreadyRecorded(_))
    ));
}

#[tokio::test]
async fn test_disbursement_before_create_mines_is_kept() {
    let h = Harness::new();
    let (loan, _) = h.service.originate(params("partner-a", 1_000)).unwrap();
    let (proof, action) = h.service.record_disbursement(loan.id, "WIRE-EARLY").unwrap();
    assert_eq!(proof.reference, "WIRE-EARLY");
    assert!(action.is_none());

    assert_eq!(h.drain().await, 2);
    let address = h.loan(&loan).contract_address.unwrap();
    assert_eq!(
        h.ledger.contract(&address).unwrap().disbursement_ref.as_deref(),
        Some("WIRE-EARLY")
    );
    h.service.request_activation(loan.id).unwrap();
    h.drain().await;
    assert_eq!(h.loan(&loan).status, LoanStatus::Active);
}

#[tokio::test]
async fn test_empty_reference_rejected() {
    let h = Harness::new();
    let loan = h.funded_loan("partner-a", 1_000).await;
    for reference in ["", "  ", "000"] {
        let err = h.service.record_disbursement(loan.id, reference).unwrap_err();
        assert_eq!(err.code(), "empty_reference");
    }
    assert!(h.service.loan_detail(&loan.id).unwrap().fiat_proofs.is_empty());
}

// =========================================================================
// Activation gate
// =========================================================================

#[tokio::test]
async fn test_activation_requires_proof_and_mined_record() {
    let h = Harness::new();
    let loan = h.funded_loan("partner-a", 1_000).await;

    let err = h.service.request_activation(loan.id).unwrap_err();
    assert!(matches!(err, SettlementError::FiatProofMissing(_)));

    h.service.record_disbursement(loan.id, "WIRE-G").unwrap();
    // Proof on file but not yet recorded on the ledger.
    let err = h.service.request_activation(loan.id).unwrap_err();
    assert_eq!(err.code(), "precondition_not_met");

    h.drain().await;
    let action = h.service.request_activation(loan.id).unwrap();
    assert_eq!(action.status, ActionStatus::Queued);
    let err = h.service.request_activation(loan.id).unwrap_err();
    assert_eq!(err.code(), "duplicate_pending_action");

    h.drain().await;
    assert_eq!(h.loan(&loan).status, LoanStatus::Active);
    h.assert_active_implies_disbursement();
}
