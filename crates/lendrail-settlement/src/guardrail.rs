use std::sync::Arc;

use chrono::Utc;
use lendrail_core::{GuardrailBounds, GuardrailId, GuardrailRecord, LoanParams, PartnerId, Store};
use serde::{Deserialize, Serialize};

use crate::error::SettlementError;

/// A single breached guardrail bound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "violation", rename_all = "snake_case")]
pub enum Violation {
    #[error("interest rate {rate_bps} bps outside [{min}, {max}]")]
    RateOutOfBounds { rate_bps: u32, min: u32, max: u32 },

    #[error("duration {duration_secs}s outside [{min}, {max}]")]
    DurationOutOfBounds {
        duration_secs: u64,
        min: u64,
        max: u64,
    },

    #[error("principal {principal} exceeds per-loan cap {cap}")]
    PrincipalAboveCap { principal: u64, cap: u64 },

    #[error("exposure cap exceeded: outstanding {outstanding} + requested {requested} > cap {cap}")]
    ExposureCapExceeded {
        outstanding: u64,
        requested: u64,
        cap: u64,
    },
}

/// Check loan terms against `bounds`, given the partner's current
/// outstanding principal.
pub fn check(bounds: &GuardrailBounds, params: &LoanParams, outstanding: u64) -> Result<(), Violation> {
    if params.interest_rate_bps < bounds.min_rate_bps
        || params.interest_rate_bps > bounds.max_rate_bps
    {
        return Err(Violation::RateOutOfBounds {
            rate_bps: params.interest_rate_bps,
            min: bounds.min_rate_bps,
            max: bounds.max_rate_bps,
        });
    }
    if params.duration_secs < bounds.min_duration_secs
        || params.duration_secs > bounds.max_duration_secs
    {
        return Err(Violation::DurationOutOfBounds {
            duration_secs: params.duration_secs,
            min: bounds.min_duration_secs,
            max: bounds.max_duration_secs,
        });
    }
    if params.principal > bounds.max_principal {
        return Err(Violation::PrincipalAboveCap {
            principal: params.principal,
            cap: bounds.max_principal,
        });
    }
    if outstanding.saturating_add(params.principal) > bounds.exposure_cap {
        return Err(Violation::ExposureCapExceeded {
            outstanding,
            requested: params.principal,
            cap: bounds.exposure_cap,
        });
    }
    Ok(())
}

/// Per-partner policy checks at origination time.
pub struct GuardrailEvaluator {
    store: Arc<dyn Store>,
}

impl GuardrailEvaluator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Install a new active guardrail for `partner_id`, closing the previous
    /// one at the same instant.
    pub fn set(
        &self,
        partner_id: PartnerId,
        bounds: GuardrailBounds,
    ) -> Result<GuardrailRecord, SettlementError> {
        if bounds.min_rate_bps > bounds.max_rate_bps {
            return Err(SettlementError::PreconditionNotMet(
                "min_rate_bps exceeds max_rate_bps".into(),
            ));
        }
        if bounds.min_duration_secs > bounds.max_duration_secs {
            return Err(SettlementError::PreconditionNotMet(
                "min_duration_secs exceeds max_duration_secs".into(),
            ));
        }
        let record = self.store.insert_guardrail(GuardrailRecord {
            id: GuardrailId::new(),
            partner_id,
            bounds,
            effective_from: Utc::now(),
            effective_to: None,
        })?;
        tracing::info!(
            partner_id = %record.partner_id,
            guardrail_id = %record.id,
            exposure_cap = record.bounds.exposure_cap,
            "guardrail installed"
        );
        Ok(record)
    }

    pub fn active(&self, partner_id: &PartnerId) -> Result<Option<GuardrailRecord>, SettlementError> {
        Ok(self.store.active_guardrail(partner_id)?)
    }

    pub fn history(&self, partner_id: &PartnerId) -> Result<Vec<GuardrailRecord>, SettlementError> {
        Ok(self.store.guardrail_history(partner_id)?)
    }

    /// Enforce the partner's active guardrail. No active guardrail is a
    /// pass. Returns the record that was applied so the caller can carry its
    /// exposure cap into the insert.
    pub fn enforce(
        &self,
        partner_id: &PartnerId,
        params: &LoanParams,
    ) -> Result<Option<GuardrailRecord>, SettlementError> {
        let Some(record) = self.store.active_guardrail(partner_id)? else {
            return Ok(None);
        };
        let outstanding = self.store.outstanding_principal(partner_id)?;
        if let Err(violation) = check(&record.bounds, params, outstanding) {
            tracing::warn!(partner_id = %partner_id, %violation, "guardrail rejected origination");
            return Err(SettlementError::GuardrailViolation(violation));
        }
        Ok(Some(record))
    }
}
