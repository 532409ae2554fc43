//! Shared harness for the end-to-end settlement scenarios: a
//! [`SettlementService`] over an in-memory store and the simulated ledger,
//! with helpers that walk loans through their lifecycle.

use std::sync::Arc;

use lendrail_core::{
    ActionId, ActionStatus, ChainAction, DispatchConfig, FiatActionType, Loan, LoanParams,
    LoanStatus, MemoryStore, PartnerId, Store,
};
use lendrail_ledger::{Signer, SimulatedLedger};
use lendrail_settlement::SettlementService;

pub struct Harness {
    pub service: Arc<SettlementService>,
    pub store: Arc<MemoryStore>,
    pub ledger: Arc<SimulatedLedger>,
}

/// Fast worker settings for tests.
pub fn test_config() -> DispatchConfig {
    DispatchConfig {
        poll_interval_ms: 10,
        submission_timeout_ms: 500,
        max_attempts: 5,
        failure_trip_threshold: 5,
    }
}

pub fn params(partner: &str, principal: u64) -> LoanParams {
    LoanParams {
        partner_id: PartnerId::from(partner),
        borrower: "0xb0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0".into(),
        principal,
        interest_rate_bps: 1_200,
        duration_secs: 90 * 86_400,
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: DispatchConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(SimulatedLedger::new());
        let service = Arc::new(SettlementService::new(
            store.clone(),
            ledger.clone(),
            Signer::generate(),
            config,
        ));
        Self {
            service,
            store,
            ledger,
        }
    }

    /// Run worker cycles until one dispatches nothing.
    pub async fn drain(&self) -> usize {
        self.service
            .worker()
            .drain(100)
            .await
            .expect("worker cycle failed")
    }

    /// Run at most `cycles` worker cycles.
    pub async fn drain_cycles(&self, cycles: usize) -> usize {
        self.service
            .worker()
            .drain(cycles)
            .await
            .expect("worker cycle failed")
    }

    pub fn store_action(&self, id: &ActionId) -> ChainAction {
        self.store
            .get_action(id)
            .expect("action lookup failed")
            .expect("action missing")
    }

    pub fn loan(&self, loan: &Loan) -> Loan {
        self.service.loan(&loan.id).expect("loan lookup failed")
    }

    /// Originate and mine the create action: the loan ends up FUNDING.
    pub async fn funded_loan(&self, partner: &str, principal: u64) -> Loan {
        let (loan, _) = self
            .service
            .originate(params(partner, principal))
            .expect("origination failed");
        self.drain().await;
        let loan = self.loan(&loan);
        assert_eq!(loan.status, LoanStatus::Funding);
        loan
    }

    /// Fund, disburse and activate: the loan ends up ACTIVE.
    pub async fn active_loan(&self, partner: &str, principal: u64, reference: &str) -> Loan {
        let loan = self.funded_loan(partner, principal).await;
        self.service
            .record_disbursement(loan.id, reference)
            .expect("disbursement failed");
        self.drain().await;
        self.service
            .request_activation(loan.id)
            .expect("activation request failed");
        self.drain().await;
        let loan = self.loan(&loan);
        assert_eq!(loan.status, LoanStatus::Active);
        loan
    }

    /// Every ACTIVE loan has a disbursement proof on file.
    pub fn assert_active_implies_disbursement(&self) {
        for loan in self.store.list_loans().expect("list loans") {
            if loan.status != LoanStatus::Active {
                continue;
            }
            let proofs = self.store.fiat_proofs_for_loan(&loan.id).expect("proofs");
            assert!(
                proofs
                    .iter()
                    .any(|p| p.action_type == FiatActionType::Disbursement),
                "loan {} is ACTIVE without a disbursement proof",
                loan.id
            );
        }
    }

    pub fn depth(&self, status: ActionStatus) -> usize {
        self.store
            .queue_depth()
            .expect("queue depth")
            .get(&status)
            .copied()
            .unwrap_or(0)
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
