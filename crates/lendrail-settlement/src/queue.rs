use std::collections::BTreeMap;
use std::sync::Arc;

use lendrail_core::{
    ActionId, ActionKind, ActionOutcome, ActionStatus, ChainAction, LoanId, LoanUpdate,
    NewChainAction, Store,
};

use crate::error::SettlementError;

/// Durable, ordered backlog of ledger mutations.
///
/// A thin layer over the [`Store`]: the one-pending-action-per-(loan, kind)
/// rule and the conditional claim live in the store write itself.
#[derive(Clone)]
pub struct ChainActionQueue {
    store: Arc<dyn Store>,
}

impl ChainActionQueue {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn enqueue(
        &self,
        loan_id: LoanId,
        kind: ActionKind,
        payload: serde_json::Value,
    ) -> Result<ChainAction, SettlementError> {
        let action = self
            .store
            .enqueue(NewChainAction::new(loan_id, kind, payload))?;
        tracing::info!(
            action_id = %action.id,
            loan_id = %loan_id,
            kind = %kind,
            seq = action.seq,
            "chain action queued"
        );
        Ok(action)
    }

    /// Atomically move the oldest QUEUED/RETRYING action to PROCESSING.
    pub fn claim_next(&self) -> Result<Option<ChainAction>, SettlementError> {
        Ok(self.store.claim_next()?)
    }

    pub fn mark_sent(&self, id: &ActionId, tx_ref: &str) -> Result<ChainAction, SettlementError> {
        Ok(self.store.mark_sent(id, tx_ref)?)
    }

    /// Apply a dispatch outcome and its loan side effect in one write.
    pub fn record_outcome(
        &self,
        id: &ActionId,
        outcome: &ActionOutcome,
        loan_update: Option<LoanUpdate>,
    ) -> Result<ChainAction, SettlementError> {
        Ok(self.store.record_outcome(id, outcome, loan_update)?)
    }

    pub fn get(&self, id: &ActionId) -> Result<ChainAction, SettlementError> {
        self.store
            .get_action(id)?
            .ok_or(SettlementError::ActionNotFound(*id))
    }

    pub fn list(&self, status: Option<ActionStatus>) -> Result<Vec<ChainAction>, SettlementError> {
        Ok(self.store.list_actions(status)?)
    }

    pub fn for_loan(&self, loan_id: &LoanId) -> Result<Vec<ChainAction>, SettlementError> {
        Ok(self.store.actions_for_loan(loan_id)?)
    }

    /// Dead-lettered (FAILED) actions, in enqueue order.
    pub fn dead_letters(&self) -> Result<Vec<ChainAction>, SettlementError> {
        self.list(Some(ActionStatus::Failed))
    }

    pub fn depth(&self) -> Result<BTreeMap<ActionStatus, usize>, SettlementError> {
        Ok(self.store.queue_depth()?)
    }

    /// Return actions stranded in PROCESSING or SENT by a previous worker
    /// to RETRYING. Returns the number moved.
    pub fn recover_in_flight(&self) -> Result<usize, SettlementError> {
        let mut stranded = self.list(Some(ActionStatus::Processing))?;
        stranded.extend(self.list(Some(ActionStatus::Sent))?);
        for action in &stranded {
            self.record_outcome(
                &action.id,
                &ActionOutcome::Retry {
                    error: "worker restarted while action was in flight".into(),
                },
                None,
            )?;
            tracing::warn!(
                action_id = %action.id,
                from = %action.status,
                "recovered in-flight chain action"
            );
        }
        Ok(stranded.len())
    }
}
