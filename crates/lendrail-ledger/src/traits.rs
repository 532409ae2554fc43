use async_trait::async_trait;
use lendrail_core::LoanId;

use crate::error::LedgerError;
use crate::types::{SignedCall, TxReceipt};

/// Ledger gateway interface.
///
/// Each implementation bridges the settlement core to a concrete ledger
/// endpoint (a JSON-RPC relay, an in-process simulation). Role-based
/// permissions and the ledger's own revert rules are enforced on the far
/// side; the core only sees receipts and error messages.
#[async_trait]
pub trait LedgerGateway: Send + Sync {
    /// Submit a signed call and wait for it to be mined.
    async fn submit(&self, call: SignedCall) -> Result<TxReceipt, LedgerError>;

    /// Numeric status of a deployed loan contract
    /// (CREATED=0 .. CLOSED=5).
    async fn loan_status(&self, loan_address: &str) -> Result<u8, LedgerError>;

    /// Address of the contract the factory deployed for `loan_id`, if any.
    async fn loan_address(&self, loan_id: &LoanId) -> Result<Option<String>, LedgerError>;

    /// Next nonce the ledger expects from `signer`.
    async fn next_nonce(&self, signer: &str) -> Result<u64, LedgerError>;

    /// Whether the ledger's admin pause is engaged.
    async fn is_paused(&self) -> Result<bool, LedgerError>;

    /// Unique identifier of this gateway (e.g. "ledger-simulated").
    fn gateway_id(&self) -> &str;
}
