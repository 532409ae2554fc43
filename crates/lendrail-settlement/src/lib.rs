//! lendrail settlement orchestration core
//!
//! The chain-action queue and its dispatch worker, the fault classifier,
//! the circuit breaker that owns enforcement state, per-partner guardrails,
//! the fiat proof ledger that gates activation, and reconciliation against
//! the live ledger. [`SettlementService`] bundles them behind the seams the
//! node's HTTP layer and the tests call.

pub mod breaker;
pub mod calls;
pub mod classifier;
pub mod error;
pub mod fiat;
pub mod guardrail;
pub mod queue;
pub mod reconcile;
pub mod service;
pub mod worker;

pub use breaker::{CircuitBreaker, EnforcementState};
pub use classifier::{classify, nonce_action, FaultClass, NonceAction};
pub use error::{ErrorCategory, SettlementError};
pub use fiat::FiatProofLedger;
pub use guardrail::{GuardrailEvaluator, Violation};
pub use lendrail_core::FiatPayload;
pub use queue::ChainActionQueue;
pub use reconcile::{Finding, ReconcileScope, ReconciliationReport, Reconciler};
pub use service::{LoanDetail, SettlementService, StatusSnapshot};
pub use worker::{DispatchWorker, TickOutcome, WORKER_OPERATOR};
