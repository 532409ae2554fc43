/// Ledger-boundary errors.
///
/// `Rpc` carries the remote node's message verbatim; the dispatch worker's
/// fault classifier pattern-matches on that text, so it must not be
/// reworded on the way through.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("{0}")]
    Rpc(String),

    /// Connect failures and timeouts only.
    #[error("connection error: {0}")]
    Transport(String),

    /// The relay answered with a non-2xx HTTP status.
    #[error("relay returned HTTP {status} {reason}")]
    Relay { status: u16, reason: String },

    /// The relay's reply could not be decoded.
    #[error("malformed relay response: {0}")]
    Decode(String),

    /// The request failed for a reason other than connect or timeout.
    #[error("relay request failed: {0}")]
    Request(String),

    #[error("loan contract not found: {0}")]
    UnknownLoan(String),

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
