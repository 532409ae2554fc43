use lendrail_core::{ActionKind, LoanId};
use serde::{Deserialize, Serialize};

/// The enumerated set of loan-contract calls the core submits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum LedgerCall {
    /// Deploy a loan contract; the receipt carries its address.
    CreateLoan {
        loan_id: LoanId,
        borrower: String,
        principal: u64,
        interest_rate_bps: u32,
        duration_secs: u64,
    },
    /// Record the off-chain disbursement reference on the contract.
    RecordDisbursement {
        loan_address: String,
        reference: String,
    },
    /// FUNDING → ACTIVE. Reverts without an on-chain disbursement proof.
    Activate { loan_address: String },
    RecordRepayment {
        loan_address: String,
        reference: String,
        amount: u64,
    },
    MarkDefault { loan_address: String },
    Close { loan_address: String },
}

impl LedgerCall {
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::CreateLoan { .. } => ActionKind::CreateLoan,
            Self::RecordDisbursement { .. } => ActionKind::RecordDisbursement,
            Self::Activate { .. } => ActionKind::Activate,
            Self::RecordRepayment { .. } => ActionKind::RecordRepayment,
            Self::MarkDefault { .. } => ActionKind::MarkDefault,
            Self::Close { .. } => ActionKind::Close,
        }
    }

    /// Target contract, for every call except creation.
    pub fn loan_address(&self) -> Option<&str> {
        match self {
            Self::CreateLoan { .. } => None,
            Self::RecordDisbursement { loan_address, .. }
            | Self::Activate { loan_address }
            | Self::RecordRepayment { loan_address, .. }
            | Self::MarkDefault { loan_address }
            | Self::Close { loan_address } => Some(loan_address),
        }
    }
}

/// A call signed by the settlement signer, ready for submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedCall {
    pub call: LedgerCall,
    pub nonce: u64,
    /// Signer address (`0x` + 20 bytes of blake3(public key)).
    pub signer: String,
    /// Hex-encoded ed25519 verifying key.
    pub public_key: String,
    /// Hex-encoded ed25519 signature over [`SignedCall::signing_payload`].
    pub signature: String,
}

impl SignedCall {
    /// Canonical bytes covered by the signature.
    pub fn signing_payload(call: &LedgerCall, nonce: u64) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&(call, nonce))
    }

    /// Transaction reference: blake3 of the signature bytes. Known before
    /// submission, so a SENT action can carry it.
    pub fn tx_ref(&self) -> String {
        let sig = hex::decode(&self.signature).unwrap_or_default();
        format!("0x{}", hex::encode(blake3::hash(&sig).as_bytes()))
    }
}

/// Mining result for a submitted call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReceipt {
    pub tx_ref: String,
    pub block_number: u64,
    /// Deployed loan contract, for `CreateLoan`.
    pub contract_address: Option<String>,
    /// Contract status code after the call was applied.
    pub loan_status: Option<u8>,
}
