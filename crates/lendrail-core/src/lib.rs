//! lendrail core: domain types, the chain-action and incident state
//! machines, dispatch configuration, and the persistence seam shared by the
//! settlement core and the node.

pub mod action_state;
pub mod config;
pub mod error;
pub mod incident_state;
pub mod store;
pub mod types;

pub use action_state::{ActionEvent, ActionStateMachine, ActionStatus};
pub use config::DispatchConfig;
pub use error::{CoreError, StoreError};
pub use incident_state::{IncidentEvent, IncidentStateMachine, IncidentStatus};
pub use store::{MemoryStore, Row, RowSink, Store, TableStore};
pub use types::{
    ActionId, ActionKind, ActionOutcome, ChainAction, EnforcementAction, FiatActionType,
    FiatPayload, FiatProofRecord, GuardrailBounds, GuardrailId, GuardrailRecord, Incident,
    IncidentId, Loan, LoanId, LoanParams, LoanStatus, LoanUpdate, NewChainAction, PartnerId,
    Trigger,
};
