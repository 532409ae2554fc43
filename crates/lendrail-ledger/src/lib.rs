//! lendrail ledger boundary
//!
//! The loan contracts are a remote service. This crate models them as a
//! small enumerated call surface behind the [`LedgerGateway`] trait, signs
//! calls with the settlement key, and ships two gateways: a JSON-RPC relay
//! client and an in-process simulation of the contracts' revert rules for
//! tests and local nodes.

pub mod adapters;
pub mod error;
pub mod signer;
pub mod traits;
pub mod types;

pub use adapters::{HttpLedger, SimulatedContract, SimulatedLedger};
pub use error::LedgerError;
pub use signer::{address_for, verify_signed_call, Signer};
pub use traits::LedgerGateway;
pub use types::{LedgerCall, SignedCall, TxReceipt};
