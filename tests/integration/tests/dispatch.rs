//! Integration test: chain-action dispatch under injected ledger faults.

use std::time::Duration;

use lendrail_core::{
    ActionKind, ActionStatus, DispatchConfig, IncidentStatus, LoanStatus, Trigger,
};
use lendrail_integration_tests::{params, test_config, Harness};
use lendrail_settlement::{SettlementError, TickOutcome};

// =========================================================================
// Happy path
// =========================================================================

#[tokio::test]
async fn test_originate_round_trip() {
    let h = Harness::new();
    let (loan, action) = h.service.originate(params("partner-a", 5_000)).unwrap();
    assert_eq!(loan.status, LoanStatus::Created);
    assert_eq!(action.kind, ActionKind::CreateLoan);
    assert_eq!(action.status, ActionStatus::Queued);

    assert_eq!(h.drain().await, 1);

    let mined = h.service.list_actions(Some(ActionStatus::Mined)).unwrap();
    assert_eq!(mined.len(), 1);
    assert_eq!(mined[0].id, action.id);
    assert!(mined[0].attempts >= 1);
    assert!(mined[0].last_tx_ref.is_some());

    let loan = h.loan(&loan);
    assert_eq!(loan.status, LoanStatus::Funding);
    let address = loan.contract_address.clone().unwrap();
    assert_eq!(h.ledger.contract(&address).unwrap().principal, 5_000);
    assert_eq!(h.ledger.submission_count(), 1);

    // Nothing left to do; draining again is a no-op.
    assert_eq!(h.drain().await, 0);
    assert_eq!(h.ledger.submission_count(), 1);
}

#[tokio::test]
async fn test_full_lifecycle_mines_in_order() {
    let h = Harness::new();
    let loan = h.active_loan("partner-a", 2_000, "WIRE-LIFE").await;
    h.service.record_repayment(loan.id, "ACH-LIFE", 2_000).unwrap();
    h.drain().await;
    h.service.request_close(loan.id).unwrap();
    h.drain().await;

    assert_eq!(h.loan(&loan).status, LoanStatus::Closed);
    let kinds: Vec<ActionKind> = h
        .service
        .loan_detail(&loan.id)
        .unwrap()
        .actions
        .iter()
        .map(|a| a.kind)
        .collect();
    assert_eq!(
        kinds,
        vec![
            ActionKind::CreateLoan,
            ActionKind::RecordDisbursement,
            ActionKind::Activate,
            ActionKind::RecordRepayment,
            ActionKind::Close,
        ]
    );
    assert_eq!(h.depth(ActionStatus::Mined), 5);
    h.assert_active_implies_disbursement();
}

// =========================================================================
// Transient faults
// =========================================================================

#[tokio::test]
async fn test_nonce_fault_retries_then_mines() {
    let h = Harness::new();
    let (loan, action) = h.service.originate(params("partner-a", 1_000)).unwrap();
    h.ledger.fail_next("nonce too low: next nonce 3, tx nonce 2");

    let first = match h.service.worker().tick().await.unwrap() {
        TickOutcome::Dispatched(a) => a,
        other => panic!("expected a dispatch, got {:?}", other),
    };
    assert_eq!(first.id, action.id);
    assert_eq!(first.status, ActionStatus::Retrying);
    assert_eq!(first.attempts, 1);
    assert!(first.last_error.as_deref().unwrap().contains("nonce too low"));
    assert_eq!(h.loan(&loan).status, LoanStatus::Created);

    h.drain().await;
    let mined = h.store_action(&action.id);
    assert_eq!(mined.status, ActionStatus::Mined);
    assert_eq!(mined.attempts, 2);
    assert_eq!(h.loan(&loan).status, LoanStatus::Funding);
    assert_eq!(h.ledger.submission_count(), 2);
}

#[tokio::test]
async fn test_submission_timeout_retries() {
    let h = Harness::new();
    let (loan, action) = h.service.originate(params("partner-a", 1_000)).unwrap();
    h.ledger.set_latency(Duration::from_millis(2_000));

    match h.service.worker().tick().await.unwrap() {
        TickOutcome::Dispatched(a) => {
            assert_eq!(a.status, ActionStatus::Retrying);
            assert!(a.last_error.as_deref().unwrap().contains("timed out"));
        }
        other => panic!("expected a dispatch, got {:?}", other),
    }
    // The abandoned submission never reached contract state.
    assert_eq!(h.loan(&loan).status, LoanStatus::Created);

    h.ledger.set_latency(Duration::ZERO);
    h.drain().await;
    assert_eq!(h.store_action(&action.id).status, ActionStatus::Mined);
    assert_eq!(h.loan(&loan).status, LoanStatus::Funding);
}

#[tokio::test]
async fn test_attempt_ceiling_dead_letters() {
    let h = Harness::with_config(DispatchConfig {
        max_attempts: 3,
        ..test_config()
    });
    let (_, action) = h.service.originate(params("partner-a", 1_000)).unwrap();
    for _ in 0..3 {
        h.ledger.fail_next("connection reset by peer");
    }

    h.drain().await;
    let failed = h.store_action(&action.id);
    assert_eq!(failed.status, ActionStatus::Failed);
    assert_eq!(failed.attempts, 3);
    assert!(failed
        .last_error
        .as_deref()
        .unwrap()
        .contains("attempt ceiling"));
    assert_eq!(h.service.dead_letters().unwrap().len(), 1);
}

// =========================================================================
// Terminal faults
// =========================================================================

#[tokio::test]
async fn test_revert_is_dead_lettered() {
    let h = Harness::new();
    let (loan, action) = h.service.originate(params("partner-a", 1_000)).unwrap();
    h.ledger.pause();

    h.drain().await;
    let failed = h.store_action(&action.id);
    assert_eq!(failed.status, ActionStatus::Failed);
    assert_eq!(failed.attempts, 1);
    assert!(failed
        .last_error
        .as_deref()
        .unwrap()
        .starts_with("execution reverted"));
    assert_eq!(h.loan(&loan).status, LoanStatus::Created);

    let dead = h.service.dead_letters().unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, action.id);
    // A single terminal failure does not open an incident.
    assert!(h.service.incidents().unwrap().is_empty());
}

#[tokio::test]
async fn test_terminal_failure_spike_freezes_dispatch() {
    let h = Harness::new();
    for _ in 0..6 {
        h.service.originate(params("partner-a", 1_000)).unwrap();
    }
    h.ledger.pause();

    assert_eq!(h.drain().await, 5);
    assert_eq!(h.depth(ActionStatus::Failed), 5);
    assert_eq!(h.depth(ActionStatus::Queued), 1);

    let incidents = h.service.incidents().unwrap();
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0].trigger, Trigger::TerminalFailureSpike);
    let status = h.service.status().unwrap();
    assert!(status.enforcement.global_freeze);
    // Originations are unaffected by a dispatch freeze.
    assert!(!status.enforcement.global_block);
    h.service.originate(params("partner-a", 1_000)).unwrap();

    let submissions = h.ledger.submission_count();
    for _ in 0..5 {
        assert_eq!(
            h.service.worker().tick().await.unwrap(),
            TickOutcome::Frozen
        );
    }
    assert_eq!(h.ledger.submission_count(), submissions);

    // Ledger fixed; nothing mined yet so reconciliation is clean.
    h.ledger.unpause();
    let resolved = h.service.resolve(&incidents[0].id, "ops").await.unwrap();
    assert_eq!(resolved.status, IncidentStatus::Resolved);
    assert_eq!(h.drain().await, 2);
    assert_eq!(h.depth(ActionStatus::Mined), 2);
}

#[tokio::test]
async fn test_success_resets_failure_run() {
    let h = Harness::new();
    for _ in 0..8 {
        h.service.originate(params("partner-a", 1_000)).unwrap();
    }
    // Four reverts, one success, four more reverts: never five in a row.
    for _ in 0..4 {
        h.ledger.fail_next("execution reverted: Loan: injected");
    }
    h.drain_cycles(5).await;
    for _ in 0..4 {
        h.ledger.fail_next("execution reverted: Loan: injected");
    }
    h.drain().await;

    assert_eq!(h.depth(ActionStatus::Mined), 1);
    assert_eq!(h.depth(ActionStatus::Failed), 7);
    assert!(h.service.incidents().unwrap().is_empty());
    assert!(!h.service.status().unwrap().enforcement.global_freeze);
}

// =========================================================================
// Activation guard
// =========================================================================

#[tokio::test]
async fn test_activation_without_proof_is_refused() {
    let h = Harness::new();
    let loan = h.funded_loan("partner-a", 1_000).await;

    let err = h.service.request_activation(loan.id).unwrap_err();
    assert!(matches!(err, SettlementError::FiatProofMissing(id) if id == loan.id));
    assert!(h
        .service
        .list_actions(None)
        .unwrap()
        .iter()
        .all(|a| a.kind != ActionKind::Activate));

    h.drain().await;
    assert_eq!(h.loan(&loan).status, LoanStatus::Funding);
    h.assert_active_implies_disbursement();
}

#[tokio::test]
async fn test_paused_worker_claims_nothing() {
    let h = Harness::new();
    h.service.originate(params("partner-a", 1_000)).unwrap();
    h.service.pause_worker();

    assert_eq!(
        h.service.worker().tick().await.unwrap(),
        TickOutcome::Paused
    );
    assert_eq!(h.depth(ActionStatus::Queued), 1);
    assert_eq!(h.ledger.submission_count(), 0);

    h.service.resume_worker();
    assert_eq!(h.drain().await, 1);
}
