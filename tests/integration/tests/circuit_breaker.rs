//! Integration test: circuit-breaker halts observed through the settlement
//! service and the dispatch worker.

use lendrail_core::{ActionStatus, IncidentStatus, LoanStatus, PartnerId, Trigger};
use lendrail_integration_tests::{params, Harness};
use lendrail_settlement::{SettlementError, TickOutcome};

// =========================================================================
// Soft halt: block originations, acknowledge, resolve, originate again
// =========================================================================

#[tokio::test]
async fn test_soft_halt_drill() {
    let h = Harness::new();
    assert!(!h.service.status().unwrap().enforcement.global_block);

    let incident = h
        .service
        .fire(Trigger::ActivationWithoutDisbursement, "drill")
        .unwrap();
    assert_eq!(incident.status, IncidentStatus::Open);
    assert!(h.service.status().unwrap().enforcement.global_block);

    let err = h.service.originate(params("partner-a", 1_000)).unwrap_err();
    assert!(matches!(err, SettlementError::OriginationBlocked { .. }));
    assert_eq!(err.code(), "origination_blocked");

    let acked = h.service.acknowledge(&incident.id, "ops").unwrap();
    assert_eq!(acked.status, IncidentStatus::Acknowledged);
    // Still blocked while acknowledged.
    assert!(h.service.originate(params("partner-a", 1_000)).is_err());

    let resolved = h.service.resolve(&incident.id, "ops").await.unwrap();
    assert_eq!(resolved.status, IncidentStatus::Resolved);
    let enforcement = h.service.status().unwrap().enforcement;
    assert!(!enforcement.global_block);
    assert!(enforcement.version >= 2);

    assert!(h.service.originate(params("partner-a", 1_000)).is_ok());
}

#[tokio::test]
async fn test_soft_halt_leaves_dispatch_running() {
    let h = Harness::new();
    let (loan, _) = h.service.originate(params("partner-a", 1_000)).unwrap();
    h.service
        .fire(Trigger::ActivationWithoutDisbursement, "drill")
        .unwrap();

    // Originations are blocked but already queued work still drains.
    assert_eq!(h.drain().await, 1);
    assert_eq!(h.loan(&loan).status, LoanStatus::Funding);
}

// =========================================================================
// Freeze: the worker claims nothing while globalFreeze is set
// =========================================================================

#[tokio::test]
async fn test_freeze_claims_zero_actions() {
    let h = Harness::new();
    for _ in 0..3 {
        h.service.originate(params("partner-a", 1_000)).unwrap();
    }
    let incident = h.service.fire(Trigger::ManualHalt, "ops").unwrap();
    assert!(h.service.status().unwrap().enforcement.global_freeze);

    let queued_before = h.depth(ActionStatus::Queued);
    let worker = h.service.worker();
    for _ in 0..10 {
        assert_eq!(worker.tick().await.unwrap(), TickOutcome::Frozen);
    }
    assert_eq!(h.depth(ActionStatus::Queued), queued_before);
    assert_eq!(h.depth(ActionStatus::Processing), 0);
    assert_eq!(h.depth(ActionStatus::Mined), 0);
    assert_eq!(h.ledger.submission_count(), 0);

    // Nothing on the ledger yet, so reconciliation is clean and the halt
    // can be lifted.
    h.service.resolve(&incident.id, "ops").await.unwrap();
    assert_eq!(h.drain().await, 3);
    assert_eq!(h.depth(ActionStatus::Mined), 3);
}

#[tokio::test]
async fn test_frozen_run_loop_claims_nothing() {
    let h = Harness::new();
    h.service.originate(params("partner-a", 1_000)).unwrap();
    h.service.fire(Trigger::ReconciliationMismatch, "ops").unwrap();

    let (tx, rx) = tokio::sync::watch::channel(false);
    let task = tokio::spawn(h.service.worker().run(rx));
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    tx.send(true).unwrap();
    task.await.unwrap();

    assert_eq!(h.depth(ActionStatus::Queued), 1);
    assert_eq!(h.ledger.submission_count(), 0);
}

#[tokio::test]
async fn test_resolve_blocked_by_reconciliation_mismatch() {
    let h = Harness::new();
    let loan = h.funded_loan("partner-a", 1_000).await;
    let address = loan.contract_address.clone().unwrap();

    let incident = h.service.fire(Trigger::ManualHalt, "ops").unwrap();
    h.ledger.set_loan_status(&address, 4);

    let err = h.service.resolve(&incident.id, "ops").await.unwrap_err();
    assert!(matches!(err, SettlementError::RecoveryBlocked { mismatches: 1 }));
    assert!(h.service.status().unwrap().enforcement.global_freeze);

    // Repair the ledger view and retry.
    h.ledger.set_loan_status(&address, 1);
    h.service.resolve(&incident.id, "ops").await.unwrap();
    assert!(!h.service.status().unwrap().enforcement.global_freeze);
}

// =========================================================================
// Partner suspension is scoped to one partner
// =========================================================================

#[tokio::test]
async fn test_partner_anomaly_blocks_only_that_partner() {
    let h = Harness::new();
    let incident = h
        .service
        .fire(
            Trigger::PartnerAnomaly {
                partner_id: PartnerId::from("partner-b"),
            },
            "risk",
        )
        .unwrap();

    let err = h.service.originate(params("partner-b", 1_000)).unwrap_err();
    assert_eq!(err.code(), "origination_blocked");
    assert!(h.service.originate(params("partner-a", 1_000)).is_ok());

    h.service.resolve(&incident.id, "risk").await.unwrap();
    assert!(h.service.originate(params("partner-b", 1_000)).is_ok());
}

#[tokio::test]
async fn test_fire_is_idempotent_per_trigger() {
    let h = Harness::new();
    let first = h.service.fire(Trigger::ManualHalt, "a").unwrap();
    let second = h.service.fire(Trigger::ManualHalt, "b").unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(h.service.status().unwrap().unresolved_incidents, 1);

    h.service.resolve(&first.id, "a").await.unwrap();
    let err = h.service.resolve(&first.id, "a").await.unwrap_err();
    assert_eq!(err.code(), "invalid_incident_transition");
}
