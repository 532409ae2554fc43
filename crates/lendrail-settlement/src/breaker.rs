use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use lendrail_core::{
    EnforcementAction, Incident, IncidentEvent, IncidentId, IncidentStateMachine, PartnerId,
    Store, StoreError, Trigger,
};
use serde::{Deserialize, Serialize};

use crate::error::SettlementError;

/// Process-wide enforcement flags. Readers get an immutable snapshot; only
/// the [`CircuitBreaker`] produces new versions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnforcementState {
    /// Bumped on every change.
    pub version: u64,
    /// Blocks all new originations.
    pub global_block: bool,
    /// Blocks all dispatch.
    pub global_freeze: bool,
    pub blocked_partner_ids: BTreeSet<PartnerId>,
}

impl EnforcementState {
    /// Union of the effects held by `incidents`.
    fn from_incidents<'a>(version: u64, incidents: impl IntoIterator<Item = &'a Incident>) -> Self {
        let mut state = Self {
            version,
            ..Self::default()
        };
        for action in incidents.into_iter().flat_map(|i| i.actions.iter()) {
            match action {
                EnforcementAction::BlockAllOriginations => state.global_block = true,
                EnforcementAction::FreezeDispatch => state.global_freeze = true,
                EnforcementAction::SuspendPartner { partner_id } => {
                    state.blocked_partner_ids.insert(partner_id.clone());
                }
            }
        }
        state
    }

    fn same_effects(&self, other: &Self) -> bool {
        self.global_block == other.global_block
            && self.global_freeze == other.global_freeze
            && self.blocked_partner_ids == other.blocked_partner_ids
    }

    pub fn is_clear(&self) -> bool {
        !self.global_block && !self.global_freeze && self.blocked_partner_ids.is_empty()
    }
}

/// Incident lifecycle owner and the sole writer of [`EnforcementState`].
///
/// Enforcement is recomputed as the union of the actions held by every
/// unresolved incident, so resolving one incident only lifts an effect
/// when no other unresolved incident still holds it.
///
/// Gates read the current snapshot and are advisory: an incident fired
/// after a gate passed takes effect at the next gate check.
pub struct CircuitBreaker {
    store: Arc<dyn Store>,
    /// Unresolved incidents. Held for the whole of every write.
    active: Mutex<BTreeMap<IncidentId, Incident>>,
    state: RwLock<Arc<EnforcementState>>,
}

impl CircuitBreaker {
    /// A breaker in the all-clear state. Call [`restore`](Self::restore)
    /// to replay persisted incidents.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            active: Mutex::new(BTreeMap::new()),
            state: RwLock::new(Arc::new(EnforcementState::default())),
        }
    }

    /// Reload unresolved incidents from the store and re-apply their
    /// effects. Returns the number restored.
    pub fn restore(&self) -> Result<usize, SettlementError> {
        let mut active = self.lock_active()?;
        active.clear();
        for incident in self.store.list_incidents()? {
            if incident.is_unresolved() {
                active.insert(incident.id, incident);
            }
        }
        self.publish(&active)?;
        let count = active.len();
        if count > 0 {
            let state = self.snapshot();
            tracing::warn!(
                incidents = count,
                global_block = state.global_block,
                global_freeze = state.global_freeze,
                "restored unresolved incidents"
            );
        }
        Ok(count)
    }

    /// Current enforcement snapshot.
    pub fn snapshot(&self) -> Arc<EnforcementState> {
        match self.state.read() {
            Ok(state) => Arc::clone(&state),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Open an incident for `trigger` and apply its effects. When an
    /// unresolved incident with the same trigger already exists it is
    /// returned unchanged.
    pub fn fire(&self, trigger: Trigger, opened_by: &str) -> Result<Incident, SettlementError> {
        let mut active = self.lock_active()?;
        if let Some(existing) = active.values().find(|i| i.trigger == trigger) {
            tracing::debug!(incident_id = %existing.id, %trigger, "trigger already has an unresolved incident");
            return Ok(existing.clone());
        }

        let incident = self.store.insert_incident(Incident::open(trigger, opened_by))?;
        active.insert(incident.id, incident.clone());
        let state = self.publish(&active)?;
        tracing::error!(
            incident_id = %incident.id,
            trigger = %incident.trigger,
            opened_by,
            version = state.version,
            global_block = state.global_block,
            global_freeze = state.global_freeze,
            "circuit breaker tripped"
        );
        Ok(incident)
    }

    /// OPEN → ACKNOWLEDGED. No enforcement change.
    pub fn acknowledge(&self, id: &IncidentId, operator: &str) -> Result<Incident, SettlementError> {
        let mut active = self.lock_active()?;
        let mut incident = self.load(id)?;
        incident.status = IncidentStateMachine::transition(incident.status, IncidentEvent::Acknowledge)?;
        incident.acknowledged_at = Some(Utc::now());
        incident.acknowledged_by = Some(operator.to_string());
        let incident = self.store.update_incident(incident)?;
        active.insert(incident.id, incident.clone());
        tracing::info!(incident_id = %id, operator, "incident acknowledged");
        Ok(incident)
    }

    /// ACKNOWLEDGED → RESOLVED, lifting whatever effects no other
    /// unresolved incident still holds.
    pub fn resolve(&self, id: &IncidentId, operator: &str) -> Result<Incident, SettlementError> {
        let mut active = self.lock_active()?;
        let mut incident = self.load(id)?;
        incident.status = IncidentStateMachine::transition(incident.status, IncidentEvent::Resolve)?;
        incident.resolved_at = Some(Utc::now());
        incident.resolved_by = Some(operator.to_string());
        let incident = self.store.update_incident(incident)?;
        active.remove(id);
        let state = self.publish(&active)?;
        tracing::info!(
            incident_id = %id,
            operator,
            version = state.version,
            global_block = state.global_block,
            global_freeze = state.global_freeze,
            "incident resolved"
        );
        Ok(incident)
    }

    /// Whether resolving `id` would clear the dispatch freeze.
    pub fn resolution_lifts_freeze(&self, id: &IncidentId) -> Result<bool, SettlementError> {
        let active = self.lock_active()?;
        let Some(target) = active.get(id) else {
            return Ok(false);
        };
        let holds_freeze =
            |i: &Incident| i.actions.contains(&EnforcementAction::FreezeDispatch);
        Ok(holds_freeze(target)
            && !active.values().any(|other| other.id != *id && holds_freeze(other)))
    }

    /// Fails with `OriginationBlocked` under a global block or when the
    /// partner is suspended.
    pub fn assert_origination_allowed(&self, partner_id: &PartnerId) -> Result<(), SettlementError> {
        let state = self.snapshot();
        let reason = if state.global_block {
            "global origination block"
        } else if state.blocked_partner_ids.contains(partner_id) {
            "partner suspended"
        } else {
            return Ok(());
        };
        tracing::warn!(partner_id = %partner_id, reason, "origination blocked");
        Err(SettlementError::OriginationBlocked {
            partner_id: partner_id.clone(),
            reason: reason.to_string(),
        })
    }

    /// Fails with `DispatchFrozen` while the dispatch freeze is set.
    pub fn assert_dispatch_allowed(&self) -> Result<(), SettlementError> {
        if self.snapshot().global_freeze {
            return Err(SettlementError::DispatchFrozen);
        }
        Ok(())
    }

    pub fn unresolved(&self) -> Result<Vec<Incident>, SettlementError> {
        Ok(self.lock_active()?.values().cloned().collect())
    }

    pub fn incident(&self, id: &IncidentId) -> Result<Incident, SettlementError> {
        self.load(id)
    }

    /// Every incident ever opened, oldest first.
    pub fn incidents(&self) -> Result<Vec<Incident>, SettlementError> {
        let mut incidents = self.store.list_incidents()?;
        incidents.sort_by_key(|i| (i.opened_at, i.id));
        Ok(incidents)
    }

    fn load(&self, id: &IncidentId) -> Result<Incident, SettlementError> {
        self.store
            .get_incident(id)?
            .ok_or(SettlementError::IncidentNotFound(*id))
    }

    fn lock_active(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, BTreeMap<IncidentId, Incident>>, SettlementError> {
        self.active
            .lock()
            .map_err(|_| SettlementError::Store(StoreError::LockPoisoned))
    }

    /// Recompute enforcement from `active` and publish a new snapshot if
    /// the effects changed.
    fn publish(
        &self,
        active: &BTreeMap<IncidentId, Incident>,
    ) -> Result<Arc<EnforcementState>, SettlementError> {
        let mut slot = self
            .state
            .write()
            .map_err(|_| SettlementError::Store(StoreError::LockPoisoned))?;
        let next = EnforcementState::from_incidents(slot.version + 1, active.values());
        if !next.same_effects(&slot) {
            tracing::debug!(
                version = next.version,
                global_block = next.global_block,
                global_freeze = next.global_freeze,
                blocked_partners = next.blocked_partner_ids.len(),
                "enforcement state changed"
            );
            *slot = Arc::new(next);
        }
        Ok(Arc::clone(&slot))
    }
}
