use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use lendrail_core::{
    ActionKind, ActionOutcome, ChainAction, DispatchConfig, FiatActionType, LoanStatus,
    LoanUpdate, Store, StoreError, Trigger,
};
use lendrail_ledger::{LedgerGateway, Signer};
use tokio::sync::{watch, Mutex};

use crate::breaker::CircuitBreaker;
use crate::calls::{build_call, loan_effect};
use crate::classifier::{classify, nonce_action, FaultClass, NonceAction};
use crate::error::SettlementError;
use crate::queue::ChainActionQueue;

/// Operator identity recorded on incidents the worker opens.
pub const WORKER_OPERATOR: &str = "dispatch-worker";

/// What a single worker cycle did.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Administratively paused; nothing claimed.
    Paused,
    /// Dispatch freeze in effect; nothing claimed.
    Frozen,
    /// Nothing claimable.
    Idle,
    /// One action was claimed and driven to its next resting state.
    Dispatched(ChainAction),
}

/// State owned by whichever cycle is running.
#[derive(Debug, Default)]
struct Cycle {
    /// Next nonce for the current signer, when known.
    nonce: Option<u64>,
}

/// Polling loop that drains the chain-action queue one submission at a time.
pub struct DispatchWorker {
    queue: ChainActionQueue,
    store: Arc<dyn Store>,
    ledger: Arc<dyn LedgerGateway>,
    breaker: Arc<CircuitBreaker>,
    signer: RwLock<Arc<Signer>>,
    config: DispatchConfig,
    paused: AtomicBool,
    consecutive_terminal: AtomicU32,
    /// Serialises cycles, so at most one submission is in flight.
    cycle: Mutex<Cycle>,
}

impl DispatchWorker {
    pub fn new(
        store: Arc<dyn Store>,
        ledger: Arc<dyn LedgerGateway>,
        breaker: Arc<CircuitBreaker>,
        signer: Signer,
        config: DispatchConfig,
    ) -> Self {
        Self {
            queue: ChainActionQueue::new(store.clone()),
            store,
            ledger,
            breaker,
            signer: RwLock::new(Arc::new(signer)),
            config,
            paused: AtomicBool::new(false),
            consecutive_terminal: AtomicU32::new(0),
            cycle: Mutex::new(Cycle::default()),
        }
    }

    /// Stop claiming work from the next cycle on. Idempotent. A submission
    /// already in flight completes and is recorded.
    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            tracing::info!("dispatch worker paused");
        }
    }

    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            tracing::info!("dispatch worker resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn signer_address(&self) -> String {
        self.current_signer().address().to_string()
    }

    /// Swap the settlement signer. Only legal while paused; waits for an
    /// in-flight submission to finish so nothing is signed by the old key
    /// afterwards. Returns the new signer address.
    pub async fn rotate_signer(&self, signer: Signer) -> Result<String, SettlementError> {
        if !self.is_paused() {
            return Err(SettlementError::WorkerNotPaused);
        }
        let mut cycle = self.cycle.lock().await;
        let address = signer.address().to_string();
        let previous = {
            let mut slot = self
                .signer
                .write()
                .map_err(|_| SettlementError::Store(StoreError::LockPoisoned))?;
            std::mem::replace(&mut *slot, Arc::new(signer))
        };
        cycle.nonce = None;
        tracing::info!(from = previous.address(), to = %address, "settlement signer rotated");
        Ok(address)
    }

    /// Move actions stranded in PROCESSING/SENT back to RETRYING. Run once
    /// before the loop starts.
    pub async fn recover_in_flight(&self) -> Result<usize, SettlementError> {
        let mut cycle = self.cycle.lock().await;
        let recovered = self.queue.recover_in_flight()?;
        if recovered > 0 {
            cycle.nonce = None;
        }
        Ok(recovered)
    }

    /// One worker cycle: gate checks, then claim and dispatch at most one
    /// action.
    pub async fn tick(&self) -> Result<TickOutcome, SettlementError> {
        let mut cycle = self.cycle.lock().await;
        if self.is_paused() {
            tracing::debug!("worker paused, skipping cycle");
            return Ok(TickOutcome::Paused);
        }
        if self.breaker.assert_dispatch_allowed().is_err() {
            tracing::debug!("dispatch frozen, skipping cycle");
            return Ok(TickOutcome::Frozen);
        }
        let Some(action) = self.queue.claim_next()? else {
            return Ok(TickOutcome::Idle);
        };
        tracing::debug!(
            action_id = %action.id,
            loan_id = %action.loan_id,
            kind = %action.kind,
            attempt = action.attempts + 1,
            "claimed chain action"
        );
        let action = self.dispatch(action, &mut cycle).await?;
        Ok(TickOutcome::Dispatched(action))
    }

    /// Run cycles back to back until one claims nothing, up to
    /// `max_cycles`. Returns the number of actions dispatched.
    pub async fn drain(&self, max_cycles: usize) -> Result<usize, SettlementError> {
        let mut dispatched = 0;
        for _ in 0..max_cycles {
            match self.tick().await? {
                TickOutcome::Dispatched(_) => dispatched += 1,
                _ => break,
            }
        }
        Ok(dispatched)
    }

    /// Poll until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            poll_interval_ms = self.config.poll_interval_ms,
            submission_timeout_ms = self.config.submission_timeout_ms,
            signer = %self.signer_address(),
            "dispatch worker started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.tick().await {
                tracing::error!(error = %e, "dispatch cycle failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::info!("dispatch worker stopped");
    }

    fn current_signer(&self) -> Arc<Signer> {
        match self.signer.read() {
            Ok(signer) => Arc::clone(&signer),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    fn has_disbursement(&self, action: &ChainAction) -> Result<bool, SettlementError> {
        Ok(self
            .store
            .fiat_proofs_for_loan(&action.loan_id)?
            .iter()
            .any(|p| p.action_type == FiatActionType::Disbursement))
    }

    async fn dispatch(
        &self,
        action: ChainAction,
        cycle: &mut Cycle,
    ) -> Result<ChainAction, SettlementError> {
        let Some(loan) = self.store.get_loan(&action.loan_id)? else {
            return self.fail(&action, SettlementError::LoanNotFound(action.loan_id).to_string());
        };

        if action.kind == ActionKind::Activate && !self.has_disbursement(&action)? {
            tracing::error!(
                action_id = %action.id,
                loan_id = %loan.id,
                "activation claimed without a disbursement proof"
            );
            let failed = self.fail(&action, SettlementError::FiatProofMissing(loan.id).to_string());
            self.breaker
                .fire(Trigger::ActivationWithoutDisbursement, WORKER_OPERATOR)?;
            return failed;
        }

        // A resubmitted CREATE_LOAN may already have executed on a previous
        // attempt whose reply was lost.
        if action.kind == ActionKind::CreateLoan && action.attempts > 0 {
            if let Some(adopted) = self.adopt_deployed_contract(&action, false).await? {
                return Ok(adopted);
            }
        }

        let call = match build_call(&action, &loan) {
            Ok(call) => call,
            Err(e) => return self.fail(&action, e.to_string()),
        };

        let signer = self.current_signer();
        let nonce = match cycle.nonce {
            Some(nonce) => nonce,
            None => match self.ledger.next_nonce(signer.address()).await {
                Ok(nonce) => nonce,
                Err(e) => return self.failed_attempt(&action, e.to_string(), cycle),
            },
        };
        let signed = match signer.sign_call(call, nonce) {
            Ok(signed) => signed,
            Err(e) => return self.fail(&action, e.to_string()),
        };
        let tx_ref = signed.tx_ref();
        if let Err(e) = self.queue.mark_sent(&action.id, &tx_ref) {
            // Nothing was submitted.
            self.release_unsent(&action, &e);
            return Err(e);
        }

        let submission = self.ledger.submit(signed);
        match tokio::time::timeout(self.config.submission_timeout(), submission).await {
            Ok(Ok(receipt)) => {
                cycle.nonce = Some(nonce + 1);
                self.consecutive_terminal.store(0, Ordering::SeqCst);
                let update = loan_effect(action.kind, &receipt);
                let mined = self.queue.record_outcome(
                    &action.id,
                    &ActionOutcome::Mined {
                        tx_ref: receipt.tx_ref.clone(),
                    },
                    update,
                )?;
                tracing::info!(
                    action_id = %mined.id,
                    loan_id = %mined.loan_id,
                    kind = %mined.kind,
                    tx_ref = %receipt.tx_ref,
                    block_number = receipt.block_number,
                    attempts = mined.attempts,
                    "chain action mined"
                );
                Ok(mined)
            }
            Ok(Err(e)) => {
                let message = e.to_string();
                if action.kind == ActionKind::CreateLoan && message.contains("loan exists") {
                    if let Some(adopted) = self.adopt_deployed_contract(&action, true).await? {
                        return Ok(adopted);
                    }
                }
                self.failed_attempt(&action, message, cycle)
            }
            Err(_) => {
                cycle.nonce = None;
                let message = format!(
                    "submission timed out after {}ms",
                    self.config.submission_timeout_ms
                );
                self.failed_attempt(&action, message, cycle)
            }
        }
    }

    /// Mirror a contract the ledger already deployed for the action's loan
    /// and record the CREATE_LOAN as mined. Returns `None` when the ledger
    /// has no such contract or cannot be asked.
    async fn adopt_deployed_contract(
        &self,
        action: &ChainAction,
        sent: bool,
    ) -> Result<Option<ChainAction>, SettlementError> {
        let address = match self.ledger.loan_address(&action.loan_id).await {
            Ok(Some(address)) => address,
            Ok(None) => return Ok(None),
            Err(e) => {
                tracing::warn!(
                    action_id = %action.id,
                    loan_id = %action.loan_id,
                    error = %e,
                    "could not look up loan contract"
                );
                return Ok(None);
            }
        };
        let tx_ref = action
            .last_tx_ref
            .clone()
            .unwrap_or_else(|| format!("adopted:{}", address));
        if !sent {
            self.queue.mark_sent(&action.id, &tx_ref)?;
        }
        let update = LoanUpdate {
            status: Some(LoanStatus::Funding),
            contract_address: Some(address.clone()),
        };
        let mined = self.queue.record_outcome(
            &action.id,
            &ActionOutcome::Mined {
                tx_ref: tx_ref.clone(),
            },
            Some(update),
        )?;
        self.consecutive_terminal.store(0, Ordering::SeqCst);
        tracing::warn!(
            action_id = %action.id,
            loan_id = %action.loan_id,
            contract_address = %address,
            tx_ref = %tx_ref,
            "adopted loan contract deployed by an earlier attempt"
        );
        Ok(Some(mined))
    }

    fn release_unsent(&self, action: &ChainAction, cause: &SettlementError) {
        let outcome = ActionOutcome::Retry {
            error: cause.to_string(),
        };
        match self.queue.record_outcome(&action.id, &outcome, None) {
            Ok(_) => tracing::warn!(
                action_id = %action.id,
                error = %cause,
                "could not mark action sent, returned to the queue"
            ),
            Err(e) => tracing::error!(
                action_id = %action.id,
                error = %e,
                cause = %cause,
                "could not mark action sent or return it to the queue"
            ),
        }
    }

    /// Classify a failed attempt and record RETRYING or FAILED.
    fn failed_attempt(
        &self,
        action: &ChainAction,
        message: String,
        cycle: &mut Cycle,
    ) -> Result<ChainAction, SettlementError> {
        if nonce_action(&message) == Some(NonceAction::Refresh) {
            cycle.nonce = None;
        }
        match classify(&message) {
            FaultClass::Retry if action.attempts + 1 < self.config.max_attempts => {
                let retried = self.queue.record_outcome(
                    &action.id,
                    &ActionOutcome::Retry {
                        error: message.clone(),
                    },
                    None,
                )?;
                tracing::warn!(
                    action_id = %action.id,
                    kind = %action.kind,
                    attempt = retried.attempts,
                    error = %message,
                    "transient submission failure, will retry"
                );
                Ok(retried)
            }
            FaultClass::Retry => self.fail(
                action,
                format!(
                    "attempt ceiling reached ({}): {}",
                    self.config.max_attempts, message
                ),
            ),
            FaultClass::Terminal => self.fail(action, message),
        }
    }

    /// Record FAILED and trip the breaker on a run of terminal failures.
    fn fail(&self, action: &ChainAction, error: String) -> Result<ChainAction, SettlementError> {
        let failed = self.queue.record_outcome(
            &action.id,
            &ActionOutcome::Terminal {
                error: error.clone(),
            },
            None,
        )?;
        tracing::error!(
            action_id = %action.id,
            loan_id = %action.loan_id,
            kind = %action.kind,
            attempts = failed.attempts,
            error = %error,
            "chain action failed"
        );

        let run = self.consecutive_terminal.fetch_add(1, Ordering::SeqCst) + 1;
        if run >= self.config.failure_trip_threshold {
            self.consecutive_terminal.store(0, Ordering::SeqCst);
            self.breaker
                .fire(Trigger::TerminalFailureSpike, WORKER_OPERATOR)?;
        }
        Ok(failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use lendrail_core::{
        ActionStatus, FiatProofRecord, Loan, LoanId, LoanParams, LoanStatus, MemoryStore,
        NewChainAction, PartnerId, Row, RowSink, TableStore,
    };
    use lendrail_ledger::{LedgerCall, SimulatedLedger};
    use serde_json::json;
    use std::time::Duration;

    struct Harness {
        store: Arc<MemoryStore>,
        ledger: Arc<SimulatedLedger>,
        breaker: Arc<CircuitBreaker>,
        worker: Arc<DispatchWorker>,
    }

    fn config() -> DispatchConfig {
        DispatchConfig {
            poll_interval_ms: 10,
            submission_timeout_ms: 1_000,
            max_attempts: 5,
            failure_trip_threshold: 5,
        }
    }

    fn harness_with(config: DispatchConfig, ledger: SimulatedLedger, seed: [u8; 32]) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(ledger);
        let breaker = Arc::new(CircuitBreaker::new(store.clone()));
        let worker = Arc::new(DispatchWorker::new(
            store.clone(),
            ledger.clone(),
            breaker.clone(),
            Signer::from_seed(&seed),
            config,
        ));
        Harness {
            store,
            ledger,
            breaker,
            worker,
        }
    }

    fn harness() -> Harness {
        harness_with(config(), SimulatedLedger::new(), [7u8; 32])
    }

    impl Harness {
        fn insert_loan(&self) -> LoanId {
            let loan = Loan::new(LoanParams {
                partner_id: PartnerId::from("p"),
                borrower: "0xborrower".into(),
                principal: 1_000,
                interest_rate_bps: 900,
                duration_secs: 86_400,
            });
            let id = loan.id;
            self.store
                .insert_loan(
                    loan,
                    NewChainAction::new(id, ActionKind::CreateLoan, json!({})),
                    None,
                )
                .unwrap();
            id
        }

        fn loan(&self, id: &LoanId) -> Loan {
            self.store.get_loan(id).unwrap().unwrap()
        }

        async fn tick_action(&self) -> ChainAction {
            match self.worker.tick().await.unwrap() {
                TickOutcome::Dispatched(action) => action,
                other => panic!("expected a dispatch, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_create_mined_advances_loan() {
        let h = harness();
        let loan_id = h.insert_loan();

        let action = h.tick_action().await;
        assert_eq!(action.status, ActionStatus::Mined);
        assert_eq!(action.attempts, 1);
        assert!(action.last_tx_ref.is_some());

        let loan = h.loan(&loan_id);
        assert_eq!(loan.status, LoanStatus::Funding);
        assert!(loan.contract_address.is_some());
        assert_eq!(h.worker.tick().await.unwrap(), TickOutcome::Idle);
    }

    #[tokio::test]
    async fn test_paused_claims_nothing() {
        let h = harness();
        h.insert_loan();
        h.worker.pause();
        h.worker.pause();
        let before = h.store.queue_depth().unwrap();
        assert_eq!(h.worker.tick().await.unwrap(), TickOutcome::Paused);
        assert_eq!(h.store.queue_depth().unwrap(), before);
        assert_eq!(h.ledger.submission_count(), 0);

        h.worker.resume();
        assert_eq!(h.tick_action().await.status, ActionStatus::Mined);
    }

    #[tokio::test]
    async fn test_frozen_claims_nothing() {
        let h = harness();
        h.insert_loan();
        h.breaker.fire(Trigger::ManualHalt, "ops").unwrap();
        for _ in 0..3 {
            assert_eq!(h.worker.tick().await.unwrap(), TickOutcome::Frozen);
        }
        assert_eq!(h.store.queue_depth().unwrap()[&ActionStatus::Queued], 1);
        assert_eq!(h.ledger.submission_count(), 0);
    }

    #[tokio::test]
    async fn test_transient_failure_retries_then_mines() {
        let h = harness();
        let loan_id = h.insert_loan();
        h.ledger.fail_next("connection reset by peer");

        let retried = h.tick_action().await;
        assert_eq!(retried.status, ActionStatus::Retrying);
        assert_eq!(retried.attempts, 1);
        assert_eq!(retried.last_error.as_deref(), Some("connection reset by peer"));

        let mined = h.tick_action().await;
        assert_eq!(mined.id, retried.id);
        assert_eq!(mined.status, ActionStatus::Mined);
        assert_eq!(mined.attempts, 2);
        assert_eq!(h.loan(&loan_id).status, LoanStatus::Funding);
    }

    #[tokio::test]
    async fn test_revert_is_terminal_and_never_retried() {
        let h = harness();
        let loan_id = h.insert_loan();
        h.ledger.fail_next("execution reverted: LoanFactory: paused");

        let failed = h.tick_action().await;
        assert_eq!(failed.status, ActionStatus::Failed);
        assert_eq!(h.worker.tick().await.unwrap(), TickOutcome::Idle);
        assert_eq!(h.loan(&loan_id).status, LoanStatus::Created);
        assert_eq!(h.store.list_actions(Some(ActionStatus::Failed)).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_error_is_terminal() {
        let h = harness();
        h.insert_loan();
        h.ledger.fail_next("the ledger is having a bad day");
        assert_eq!(h.tick_action().await.status, ActionStatus::Failed);
    }

    #[tokio::test]
    async fn test_attempt_ceiling_forces_terminal() {
        let mut cfg = config();
        cfg.max_attempts = 2;
        let h = harness_with(cfg, SimulatedLedger::new(), [7u8; 32]);
        h.insert_loan();
        h.ledger.fail_next("request timed out");
        h.ledger.fail_next("request timed out");

        assert_eq!(h.tick_action().await.status, ActionStatus::Retrying);
        let failed = h.tick_action().await;
        assert_eq!(failed.status, ActionStatus::Failed);
        assert_eq!(failed.attempts, 2);
        assert!(failed
            .last_error
            .as_deref()
            .unwrap()
            .starts_with("attempt ceiling reached"));
    }

    #[tokio::test]
    async fn test_submission_timeout_is_retried() {
        let mut cfg = config();
        cfg.submission_timeout_ms = 50;
        let h = harness_with(
            cfg,
            SimulatedLedger::new().with_latency(Duration::from_millis(500)),
            [7u8; 32],
        );
        h.insert_loan();

        let timed_out = h.tick_action().await;
        assert_eq!(timed_out.status, ActionStatus::Retrying);
        assert!(timed_out.last_error.as_deref().unwrap().contains("timed out"));

        h.ledger.set_latency(Duration::ZERO);
        assert_eq!(h.tick_action().await.status, ActionStatus::Mined);
    }

    #[tokio::test]
    async fn test_stale_nonce_is_refreshed() {
        let seed = [9u8; 32];
        let h = harness_with(config(), SimulatedLedger::new(), seed);
        h.insert_loan();
        h.tick_action().await; // cache now holds nonce 1

        // Another submitter using the same key moves the ledger's nonce on.
        let outsider = Signer::from_seed(&seed);
        let signed = outsider
            .sign_call(
                LedgerCall::CreateLoan {
                    loan_id: LoanId::new(),
                    borrower: "0xother".into(),
                    principal: 1,
                    interest_rate_bps: 1,
                    duration_secs: 1,
                },
                1,
            )
            .unwrap();
        h.ledger.submit(signed).await.unwrap();

        h.insert_loan();
        let retried = h.tick_action().await;
        assert_eq!(retried.status, ActionStatus::Retrying);
        assert!(retried.last_error.as_deref().unwrap().starts_with("nonce too low"));
        assert_eq!(h.tick_action().await.status, ActionStatus::Mined);
    }

    #[tokio::test]
    async fn test_activation_without_proof_trips_breaker() {
        let h = harness();
        let loan_id = h.insert_loan();
        h.tick_action().await;
        let submissions = h.ledger.submission_count();

        // Bypass the request layer's proof check.
        h.store
            .enqueue(NewChainAction::new(loan_id, ActionKind::Activate, json!({})))
            .unwrap();
        let failed = h.tick_action().await;
        assert_eq!(failed.status, ActionStatus::Failed);
        assert!(failed
            .last_error
            .as_deref()
            .unwrap()
            .contains("no disbursement proof"));
        assert_eq!(h.ledger.submission_count(), submissions);
        assert!(h.breaker.snapshot().global_block);
        assert_ne!(h.loan(&loan_id).status, LoanStatus::Active);
    }

    #[tokio::test]
    async fn test_activation_with_proof_mines() {
        let h = harness();
        let loan_id = h.insert_loan();
        h.tick_action().await;
        h.store
            .insert_fiat_proof(FiatProofRecord {
                reference: "D-1".into(),
                loan_id,
                action_type: FiatActionType::Disbursement,
                amount: None,
                recorded_at: Utc::now(),
            })
            .unwrap();
        assert_eq!(h.tick_action().await.status, ActionStatus::Mined);

        h.store
            .enqueue(NewChainAction::new(loan_id, ActionKind::Activate, json!({})))
            .unwrap();
        assert_eq!(h.tick_action().await.status, ActionStatus::Mined);
        assert_eq!(h.loan(&loan_id).status, LoanStatus::Active);
    }

    fn deploy_elsewhere(loan: &Loan) -> lendrail_ledger::SignedCall {
        Signer::generate()
            .sign_call(
                LedgerCall::CreateLoan {
                    loan_id: loan.id,
                    borrower: loan.borrower.clone(),
                    principal: loan.principal,
                    interest_rate_bps: loan.interest_rate_bps,
                    duration_secs: loan.duration_secs,
                },
                0,
            )
            .unwrap()
    }

    #[tokio::test]
    async fn test_resubmitted_create_adopts_deployed_contract() {
        let h = harness();
        let loan_id = h.insert_loan();
        h.ledger.fail_next("connection reset by peer");
        assert_eq!(h.tick_action().await.status, ActionStatus::Retrying);

        // The first attempt's reply was lost after the factory deployed it.
        h.ledger.submit(deploy_elsewhere(&h.loan(&loan_id))).await.unwrap();
        let submissions = h.ledger.submission_count();

        let adopted = h.tick_action().await;
        assert_eq!(adopted.status, ActionStatus::Mined);
        assert_eq!(h.ledger.submission_count(), submissions);
        let loan = h.loan(&loan_id);
        assert_eq!(loan.status, LoanStatus::Funding);
        assert_eq!(
            loan.contract_address,
            h.ledger.loan_address(&loan_id).await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_loan_exists_revert_adopts_deployed_contract() {
        let h = harness();
        let loan_id = h.insert_loan();
        h.ledger.submit(deploy_elsewhere(&h.loan(&loan_id))).await.unwrap();

        let adopted = h.tick_action().await;
        assert_eq!(adopted.status, ActionStatus::Mined);
        assert!(adopted.last_tx_ref.is_some());
        assert!(h.loan(&loan_id).contract_address.is_some());
        assert!(h.store.list_actions(Some(ActionStatus::Failed)).unwrap().is_empty());
    }

    /// Rejects writes that contain a matching row while armed.
    struct ArmedSink {
        armed: Arc<AtomicBool>,
        rejects: fn(&Row) -> bool,
    }

    impl RowSink for ArmedSink {
        fn persist(&self, rows: &[Row]) -> Result<(), StoreError> {
            if self.armed.load(Ordering::SeqCst) && rows.iter().any(self.rejects) {
                return Err(StoreError::Backend("disk full".into()));
            }
            Ok(())
        }
    }

    struct FlakyHarness {
        store: Arc<TableStore<ArmedSink>>,
        ledger: Arc<SimulatedLedger>,
        worker: DispatchWorker,
        armed: Arc<AtomicBool>,
    }

    fn flaky_harness(rejects: fn(&Row) -> bool) -> FlakyHarness {
        let armed = Arc::new(AtomicBool::new(false));
        let sink = ArmedSink {
            armed: armed.clone(),
            rejects,
        };
        let store = Arc::new(TableStore::with_sink(sink, Vec::new()));
        let ledger = Arc::new(SimulatedLedger::new());
        let breaker = Arc::new(CircuitBreaker::new(store.clone()));
        let worker = DispatchWorker::new(
            store.clone(),
            ledger.clone(),
            breaker,
            Signer::from_seed(&[7u8; 32]),
            config(),
        );
        FlakyHarness {
            store,
            ledger,
            worker,
            armed,
        }
    }

    impl FlakyHarness {
        fn insert_loan(&self) -> LoanId {
            let loan = Loan::new(LoanParams {
                partner_id: PartnerId::from("p"),
                borrower: "0xborrower".into(),
                principal: 1_000,
                interest_rate_bps: 900,
                duration_secs: 86_400,
            });
            let id = loan.id;
            self.store
                .insert_loan(
                    loan,
                    NewChainAction::new(id, ActionKind::CreateLoan, json!({})),
                    None,
                )
                .unwrap();
            id
        }

        fn only_action(&self, kind: ActionKind) -> ChainAction {
            let mut actions: Vec<ChainAction> = self
                .store
                .list_actions(None)
                .unwrap()
                .into_iter()
                .filter(|a| a.kind == kind)
                .collect();
            assert_eq!(actions.len(), 1);
            actions.remove(0)
        }
    }

    #[tokio::test]
    async fn test_failed_mark_sent_returns_action_to_queue() {
        let h = flaky_harness(|row| {
            matches!(row, Row::Action(a) if a.status == ActionStatus::Sent)
        });
        h.insert_loan();
        h.armed.store(true, Ordering::SeqCst);

        assert!(h.worker.tick().await.is_err());
        let action = h.only_action(ActionKind::CreateLoan);
        assert_eq!(action.status, ActionStatus::Retrying);
        assert!(action.last_error.as_deref().unwrap().contains("disk full"));
        assert_eq!(h.ledger.submission_count(), 0);

        h.armed.store(false, Ordering::SeqCst);
        match h.worker.tick().await.unwrap() {
            TickOutcome::Dispatched(action) => assert_eq!(action.status, ActionStatus::Mined),
            other => panic!("expected a dispatch, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_breaker_store_failure_still_fails_activation() {
        let h = flaky_harness(|row| matches!(row, Row::Incident(_)));
        let loan_id = h.insert_loan();
        h.worker.tick().await.unwrap();
        h.store
            .enqueue(NewChainAction::new(loan_id, ActionKind::Activate, json!({})))
            .unwrap();
        h.armed.store(true, Ordering::SeqCst);

        assert!(h.worker.tick().await.is_err());
        let activation = h.only_action(ActionKind::Activate);
        assert_eq!(activation.status, ActionStatus::Failed);
        assert_eq!(h.worker.tick().await.unwrap(), TickOutcome::Idle);
    }

    #[tokio::test]
    async fn test_terminal_spike_freezes_dispatch() {
        let mut cfg = config();
        cfg.failure_trip_threshold = 2;
        let h = harness_with(cfg, SimulatedLedger::new(), [7u8; 32]);
        for _ in 0..3 {
            h.insert_loan();
        }
        h.ledger.fail_next("execution reverted: a");
        h.ledger.fail_next("execution reverted: b");

        assert_eq!(h.tick_action().await.status, ActionStatus::Failed);
        assert!(!h.breaker.snapshot().global_freeze);
        assert_eq!(h.tick_action().await.status, ActionStatus::Failed);
        assert!(h.breaker.snapshot().global_freeze);
        assert_eq!(h.worker.tick().await.unwrap(), TickOutcome::Frozen);
    }

    #[tokio::test]
    async fn test_rotate_signer_requires_pause() {
        let h = harness();
        let err = h.worker.rotate_signer(Signer::generate()).await.unwrap_err();
        assert!(matches!(err, SettlementError::WorkerNotPaused));

        h.insert_loan();
        h.tick_action().await;

        h.worker.pause();
        let next = Signer::generate();
        let expected = next.address().to_string();
        assert_eq!(h.worker.rotate_signer(next).await.unwrap(), expected);
        assert_eq!(h.worker.signer_address(), expected);
        h.worker.resume();

        // The new key starts from its own nonce on the ledger.
        h.insert_loan();
        assert_eq!(h.tick_action().await.status, ActionStatus::Mined);
    }

    #[tokio::test]
    async fn test_recover_in_flight() {
        let h = harness();
        h.insert_loan();
        let claimed = h.store.claim_next().unwrap().unwrap();
        h.store.mark_sent(&claimed.id, "0xlost").unwrap();

        assert_eq!(h.worker.recover_in_flight().await.unwrap(), 1);
        assert_eq!(
            h.store.get_action(&claimed.id).unwrap().unwrap().status,
            ActionStatus::Retrying
        );
        assert_eq!(h.tick_action().await.status, ActionStatus::Mined);
    }

    #[tokio::test]
    async fn test_run_loop_until_shutdown() {
        let h = harness();
        let loan_id = h.insert_loan();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(h.worker.clone().run(rx));

        for _ in 0..100 {
            if h.loan(&loan_id).status == LoanStatus::Funding {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.loan(&loan_id).status, LoanStatus::Funding);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_drain_stops_when_idle() {
        let h = harness();
        h.insert_loan();
        h.insert_loan();
        assert_eq!(h.worker.drain(10).await.unwrap(), 2);
        assert_eq!(h.worker.drain(10).await.unwrap(), 0);
    }
}
