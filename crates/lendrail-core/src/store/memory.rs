use std::collections::BTreeMap;
use std::sync::Mutex;

use super::tables::{Plan, Row, Tables};
use super::Store;
use crate::action_state::ActionStatus;
use crate::error::StoreError;
use crate::types::{
    ActionId, ActionOutcome, ChainAction, FiatProofRecord, GuardrailRecord, Incident, IncidentId,
    Loan, LoanId, LoanUpdate, NewChainAction, PartnerId,
};

/// Durable backend for planned rows. Called under the store lock, before
/// the rows become visible in memory.
pub trait RowSink: Send + Sync {
    fn persist(&self, rows: &[Row]) -> Result<(), StoreError>;
}

/// Volatile sink: nothing outlives the process.
impl RowSink for () {
    fn persist(&self, _rows: &[Row]) -> Result<(), StoreError> {
        Ok(())
    }
}

/// A [`Store`] over indexed in-memory tables, serialised by one lock and
/// written through to a [`RowSink`].
pub struct TableStore<S = ()> {
    tables: Mutex<Tables>,
    sink: S,
}

/// Process-local store used by tests and by `storage.backend = "memory"`.
pub type MemoryStore = TableStore<()>;

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_sink((), Vec::new())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: RowSink> TableStore<S> {
    /// Build a store over `sink`, seeded with rows previously persisted there.
    pub fn with_sink(sink: S, rows: impl IntoIterator<Item = Row>) -> Self {
        Self {
            tables: Mutex::new(Tables::from_rows(rows)),
            sink,
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    fn write<T>(&self, plan: impl FnOnce(&Tables) -> Plan<T>) -> Result<T, StoreError> {
        let mut tables = self.tables.lock().map_err(|_| StoreError::LockPoisoned)?;
        let (out, rows) = plan(&tables)?;
        if !rows.is_empty() {
            self.sink.persist(&rows)?;
            tables.apply(rows);
        }
        Ok(out)
    }

    fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> Result<T, StoreError> {
        let tables = self.tables.lock().map_err(|_| StoreError::LockPoisoned)?;
        Ok(f(&tables))
    }
}

impl<S: RowSink> Store for TableStore<S> {
    fn insert_loan(
        &self,
        loan: Loan,
        create: NewChainAction,
        exposure_cap: Option<u64>,
    ) -> Result<(Loan, ChainAction), StoreError> {
        self.write(|t| t.plan_insert_loan(loan, create, exposure_cap))
    }

    fn get_loan(&self, id: &LoanId) -> Result<Option<Loan>, StoreError> {
        self.read(|t| t.loan(id).cloned())
    }

    fn list_loans(&self) -> Result<Vec<Loan>, StoreError> {
        self.read(|t| t.loans())
    }

    fn outstanding_principal(&self, partner_id: &PartnerId) -> Result<u64, StoreError> {
        self.read(|t| t.outstanding_principal(partner_id))
    }

    fn enqueue(&self, action: NewChainAction) -> Result<ChainAction, StoreError> {
        self.write(|t| t.plan_enqueue(action))
    }

    fn claim_next(&self) -> Result<Option<ChainAction>, StoreError> {
        self.write(|t| t.plan_claim_next())
    }

    fn mark_sent(&self, id: &ActionId, tx_ref: &str) -> Result<ChainAction, StoreError> {
        self.write(|t| t.plan_mark_sent(id, tx_ref))
    }

    fn record_outcome(
        &self,
        id: &ActionId,
        outcome: &ActionOutcome,
        loan_update: Option<LoanUpdate>,
    ) -> Result<ChainAction, StoreError> {
        self.write(|t| t.plan_record_outcome(id, outcome, loan_update))
    }

    fn get_action(&self, id: &ActionId) -> Result<Option<ChainAction>, StoreError> {
        self.read(|t| t.action(id).cloned())
    }

    fn list_actions(&self, status: Option<ActionStatus>) -> Result<Vec<ChainAction>, StoreError> {
        self.read(|t| t.actions(status))
    }

    fn actions_for_loan(&self, loan_id: &LoanId) -> Result<Vec<ChainAction>, StoreError> {
        self.read(|t| t.actions_for_loan(loan_id))
    }

    fn queue_depth(&self) -> Result<BTreeMap<ActionStatus, usize>, StoreError> {
        self.read(|t| t.queue_depth())
    }

    fn insert_fiat_proof(
        &self,
        record: FiatProofRecord,
    ) -> Result<(FiatProofRecord, Option<ChainAction>), StoreError> {
        self.write(|t| t.plan_insert_fiat_proof(record))
    }

    fn get_fiat_proof(&self, reference: &str) -> Result<Option<FiatProofRecord>, StoreError> {
        self.read(|t| t.fiat_proof(reference).cloned())
    }

    fn fiat_proofs_for_loan(&self, loan_id: &LoanId) -> Result<Vec<FiatProofRecord>, StoreError> {
        self.read(|t| t.fiat_proofs_for_loan(loan_id))
    }

    fn insert_guardrail(&self, record: GuardrailRecord) -> Result<GuardrailRecord, StoreError> {
        self.write(|t| t.plan_insert_guardrail(record))
    }

    fn active_guardrail(
        &self,
        partner_id: &PartnerId,
    ) -> Result<Option<GuardrailRecord>, StoreError> {
        self.read(|t| t.active_guardrail(partner_id).cloned())
    }

    fn guardrail_history(
        &self,
        partner_id: &PartnerId,
    ) -> Result<Vec<GuardrailRecord>, StoreError> {
        self.read(|t| t.guardrail_history(partner_id))
    }

    fn insert_incident(&self, incident: Incident) -> Result<Incident, StoreError> {
        self.write(|t| t.plan_insert_incident(incident))
    }

    fn update_incident(&self, incident: Incident) -> Result<Incident, StoreError> {
        self.write(|t| t.plan_update_incident(incident))
    }

    fn get_incident(&self, id: &IncidentId) -> Result<Option<Incident>, StoreError> {
        self.read(|t| t.incident(id).cloned())
    }

    fn list_incidents(&self) -> Result<Vec<Incident>, StoreError> {
        self.read(|t| t.incidents())
    }
}
