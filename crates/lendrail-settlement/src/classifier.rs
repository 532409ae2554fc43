//! Fault classification for ledger submission errors.
//!
//! Classification is by substring over the lowercased message. Known
//! contract reverts and resource exhaustion are terminal and are matched
//! before the transient signatures, so a revert that happens to mention a
//! timeout is still terminal. Anything unrecognised is terminal.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FaultClass {
    Retry,
    Terminal,
}

/// What to do with the cached nonce before the next submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceAction {
    /// The ledger's view of the signer's nonce differs; re-derive it.
    Refresh,
    /// The nonce is right; resubmit unchanged.
    Resubmit,
}

const TERMINAL_PATTERNS: &[&str] = &[
    "execution reverted",
    "revert",
    "out of gas",
    "gas required exceeds allowance",
    "intrinsic gas too low",
    "invalid opcode",
    "stack underflow",
    "stack overflow",
    "insufficient funds",
    "invalid signature",
];

const RETRY_PATTERNS: &[&str] = &[
    "nonce too low",
    "nonce too high",
    "nonce expired",
    "invalid nonce",
    "nonce has already been used",
    "replacement transaction underpriced",
    "transaction underpriced",
    "already known",
    "known transaction",
    "timeout",
    "timed out",
    "connection reset",
    "connection refused",
    "connection closed",
    "connection error",
    "econnreset",
    "econnrefused",
    "etimedout",
    "socket hang up",
    "network error",
    "service unavailable",
    "bad gateway",
    "too many requests",
    "rate limit",
    "header not found",
    "rpc unavailable",
    // Relay replies: any 5xx, plus 429.
    "relay returned http 5",
    "relay returned http 429",
];

const REFRESH_PATTERNS: &[&str] = &[
    "nonce too low",
    "nonce too high",
    "nonce expired",
    "invalid nonce",
    "nonce has already been used",
];

const RESUBMIT_PATTERNS: &[&str] = &[
    "replacement transaction underpriced",
    "transaction underpriced",
    "already known",
    "known transaction",
];

/// Map a raw submission error to RETRY or TERMINAL.
pub fn classify(message: &str) -> FaultClass {
    let message = message.to_ascii_lowercase();
    if TERMINAL_PATTERNS.iter().any(|p| message.contains(p)) {
        return FaultClass::Terminal;
    }
    if RETRY_PATTERNS.iter().any(|p| message.contains(p)) {
        return FaultClass::Retry;
    }
    FaultClass::Terminal
}

/// Nonce sub-classification. `None` when the error says nothing about
/// nonces.
pub fn nonce_action(message: &str) -> Option<NonceAction> {
    let message = message.to_ascii_lowercase();
    if REFRESH_PATTERNS.iter().any(|p| message.contains(p)) {
        Some(NonceAction::Refresh)
    } else if RESUBMIT_PATTERNS.iter().any(|p| message.contains(p)) {
        Some(NonceAction::Resubmit)
    } else {
        None
    }
}
