use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use lendrail_core::LoanId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::LedgerError;
use crate::traits::LedgerGateway;
use crate::types::{SignedCall, TxReceipt};

/// JSON-RPC error code the relay uses for an unknown loan contract.
pub const UNKNOWN_LOAN_CODE: i64 = -32004;

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

/// Ledger gateway over a JSON-RPC relay.
///
/// Methods: `ledger_submit`, `ledger_loanStatus`, `ledger_nextNonce`,
/// `ledger_isPaused`. Remote error messages are surfaced untouched.
pub struct HttpLedger {
    client: reqwest::Client,
    endpoint: String,
    next_id: AtomicU64,
}

impl HttpLedger {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, LedgerError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LedgerError::Request(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, LedgerError> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };
        tracing::debug!(method, id = request.id, "ledger rpc request");

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(send_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(LedgerError::Relay {
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or_default().to_string(),
            });
        }
        let body: RpcResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                send_error(e)
            } else {
                LedgerError::Decode(e.to_string())
            }
        })?;

        if let Some(error) = body.error {
            if error.code == UNKNOWN_LOAN_CODE {
                return Err(LedgerError::UnknownLoan(error.message));
            }
            return Err(LedgerError::Rpc(error.message));
        }
        let result = body.result.unwrap_or(Value::Null);
        Ok(serde_json::from_value(result)?)
    }
}

fn send_error(err: reqwest::Error) -> LedgerError {
    if err.is_timeout() {
        LedgerError::Transport(format!("request timed out: {}", err))
    } else if err.is_connect() {
        LedgerError::Transport(err.to_string())
    } else {
        LedgerError::Request(err.to_string())
    }
}

#[async_trait]
impl LedgerGateway for HttpLedger {
    async fn submit(&self, call: SignedCall) -> Result<TxReceipt, LedgerError> {
        self.call("ledger_submit", json!([call])).await
    }

    async fn loan_status(&self, loan_address: &str) -> Result<u8, LedgerError> {
        self.call("ledger_loanStatus", json!([loan_address])).await
    }

    async fn loan_address(&self, loan_id: &LoanId) -> Result<Option<String>, LedgerError> {
        self.call("ledger_loanAddress", json!([loan_id])).await
    }

    async fn next_nonce(&self, signer: &str) -> Result<u64, LedgerError> {
        self.call("ledger_nextNonce", json!([signer])).await
    }

    async fn is_paused(&self) -> Result<bool, LedgerError> {
        self.call("ledger_isPaused", json!([])).await
    }

    fn gateway_id(&self) -> &str {
        "ledger-http"
    }
}
