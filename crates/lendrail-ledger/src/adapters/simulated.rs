use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use lendrail_core::LoanId;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::LedgerError;
use crate::signer::verify_signed_call;
use crate::traits::LedgerGateway;
use crate::types::{LedgerCall, SignedCall, TxReceipt};

const CREATED: u8 = 0;
const FUNDING: u8 = 1;
const ACTIVE: u8 = 2;
const REPAID: u8 = 3;
const DEFAULTED: u8 = 4;
const CLOSED: u8 = 5;

/// State of one simulated loan contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedContract {
    pub address: String,
    pub principal: u64,
    pub outstanding: u64,
    pub status: u8,
    pub disbursement_ref: Option<String>,
    pub repayment_refs: Vec<String>,
}

/// In-process ledger with the loan contracts' observable behaviour.
///
/// Calls are checked the way the remote node would check them: signature,
/// per-signer nonce, then the contract's revert rules. A reverted call is
/// rejected before inclusion and does not consume its nonce. The admin
/// pause blocks loan creation only; repayment, default and close stay open.
///
/// Test hooks: [`fail_next`](Self::fail_next) queues raw RPC errors,
/// [`with_latency`](Self::with_latency) delays every submission, and
/// [`set_loan_status`](Self::set_loan_status) rewrites a contract behind the
/// core's back.
pub struct SimulatedLedger {
    contracts: DashMap<String, SimulatedContract>,
    /// Fiat references recorded on-chain, across all contracts.
    references: DashMap<String, String>,
    nonces: DashMap<String, u64>,
    paused: AtomicBool,
    block_number: AtomicU64,
    submissions: AtomicU64,
    latency_ms: AtomicU64,
    injected: Mutex<VecDeque<String>>,
}

impl SimulatedLedger {
    pub fn new() -> Self {
        Self {
            contracts: DashMap::new(),
            references: DashMap::new(),
            nonces: DashMap::new(),
            paused: AtomicBool::new(false),
            block_number: AtomicU64::new(0),
            submissions: AtomicU64::new(0),
            latency_ms: AtomicU64::new(0),
            injected: Mutex::new(VecDeque::new()),
        }
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        self.set_latency(latency);
        self
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Make the next submission fail with `message`, verbatim. Queued
    /// messages are consumed in order, one per submission.
    pub fn fail_next(&self, message: impl Into<String>) {
        if let Ok(mut queue) = self.injected.lock() {
            queue.push_back(message.into());
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        tracing::info!("simulated ledger paused");
    }

    pub fn unpause(&self) {
        self.paused.store(false, Ordering::SeqCst);
        tracing::info!("simulated ledger unpaused");
    }

    /// Overwrite a contract's status code. Returns false for unknown
    /// addresses.
    pub fn set_loan_status(&self, loan_address: &str, code: u8) -> bool {
        match self.contracts.get_mut(loan_address) {
            Some(mut contract) => {
                contract.status = code;
                true
            }
            None => false,
        }
    }

    pub fn contract(&self, loan_address: &str) -> Option<SimulatedContract> {
        self.contracts.get(loan_address).map(|c| c.clone())
    }

    /// Number of submissions received, including rejected ones.
    pub fn submission_count(&self) -> u64 {
        self.submissions.load(Ordering::SeqCst)
    }

    fn take_injected(&self) -> Option<String> {
        self.injected.lock().ok().and_then(|mut q| q.pop_front())
    }

    fn contract_address(loan_id: &LoanId) -> String {
        let digest = blake3::hash(loan_id.as_uuid().as_bytes());
        format!("0x{}", hex::encode(&digest.as_bytes()[..20]))
    }

    fn claim_reference(&self, reference: &str, loan_address: &str) -> Result<(), String> {
        match self.references.entry(reference.to_string()) {
            Entry::Occupied(_) => Err(revert("Loan: reference already used")),
            Entry::Vacant(slot) => {
                slot.insert(loan_address.to_string());
                Ok(())
            }
        }
    }

    /// Apply `call` to contract state, returning (contract address, status).
    fn execute(&self, call: &LedgerCall) -> Result<(String, u8), String> {
        if let LedgerCall::CreateLoan {
            loan_id, principal, ..
        } = call
        {
            if self.paused.load(Ordering::SeqCst) {
                return Err(revert("LoanFactory: paused"));
            }
            let address = Self::contract_address(loan_id);
            return match self.contracts.entry(address.clone()) {
                Entry::Occupied(_) => Err(revert("LoanFactory: loan exists")),
                Entry::Vacant(slot) => {
                    slot.insert(SimulatedContract {
                        address: address.clone(),
                        principal: *principal,
                        outstanding: *principal,
                        status: FUNDING,
                        disbursement_ref: None,
                        repayment_refs: Vec::new(),
                    });
                    Ok((address, FUNDING))
                }
            };
        }

        let address = call.loan_address().unwrap_or_default().to_string();
        let mut contract = self
            .contracts
            .get_mut(&address)
            .ok_or_else(|| revert("LoanFactory: unknown loan"))?;

        match call {
            LedgerCall::CreateLoan { .. } => return Err(revert("Loan: unsupported call")),
            LedgerCall::RecordDisbursement { reference, .. } => {
                if contract.status != FUNDING && contract.status != CREATED {
                    return Err(revert("Loan: not in funding state"));
                }
                if contract.disbursement_ref.is_some() {
                    return Err(revert("Loan: disbursement already recorded"));
                }
                self.claim_reference(reference, &address)?;
                contract.disbursement_ref = Some(reference.clone());
            }
            LedgerCall::Activate { .. } => {
                if contract.status != FUNDING {
                    return Err(revert("Loan: not in funding state"));
                }
                if contract.disbursement_ref.is_none() {
                    return Err(revert("Loan: no disbursement proof"));
                }
                contract.status = ACTIVE;
            }
            LedgerCall::RecordRepayment {
                reference, amount, ..
            } => {
                if contract.status != ACTIVE {
                    return Err(revert("Loan: not active"));
                }
                self.claim_reference(reference, &address)?;
                contract.repayment_refs.push(reference.clone());
                contract.outstanding = contract.outstanding.saturating_sub(*amount);
                if contract.outstanding == 0 {
                    contract.status = REPAID;
                }
            }
            LedgerCall::MarkDefault { .. } => {
                if contract.status != ACTIVE {
                    return Err(revert("Loan: not active"));
                }
                contract.status = DEFAULTED;
            }
            LedgerCall::Close { .. } => {
                if contract.status != REPAID && contract.status != DEFAULTED {
                    return Err(revert("Loan: not settled"));
                }
                contract.status = CLOSED;
            }
        }
        Ok((address, contract.status))
    }
}

fn revert(reason: &str) -> String {
    format!("execution reverted: {}", reason)
}

impl Default for SimulatedLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerGateway for SimulatedLedger {
    async fn submit(&self, signed: SignedCall) -> Result<TxReceipt, LedgerError> {
        self.submissions.fetch_add(1, Ordering::SeqCst);

        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        if let Some(message) = self.take_injected() {
            tracing::debug!(%message, "simulated ledger injecting failure");
            return Err(LedgerError::Rpc(message));
        }

        verify_signed_call(&signed)?;

        let mut expected = self.nonces.entry(signed.signer.clone()).or_insert(0);
        if signed.nonce < *expected {
            return Err(LedgerError::Rpc(format!(
                "nonce too low: next nonce {}, tx nonce {}",
                *expected, signed.nonce
            )));
        }
        if signed.nonce > *expected {
            return Err(LedgerError::Rpc(format!(
                "nonce too high: next nonce {}, tx nonce {}",
                *expected, signed.nonce
            )));
        }

        let (address, status) = self.execute(&signed.call).map_err(LedgerError::Rpc)?;
        *expected += 1;
        drop(expected);

        let block_number = self.block_number.fetch_add(1, Ordering::SeqCst) + 1;
        let contract_address = match signed.call {
            LedgerCall::CreateLoan { .. } => Some(address.clone()),
            _ => None,
        };
        tracing::info!(
            kind = %signed.call.kind(),
            loan_address = %address,
            block_number,
            "simulated ledger mined call"
        );

        Ok(TxReceipt {
            tx_ref: signed.tx_ref(),
            block_number,
            contract_address,
            loan_status: Some(status),
        })
    }

    async fn loan_status(&self, loan_address: &str) -> Result<u8, LedgerError> {
        self.contracts
            .get(loan_address)
            .map(|c| c.status)
            .ok_or_else(|| LedgerError::UnknownLoan(loan_address.to_string()))
    }

    async fn loan_address(&self, loan_id: &LoanId) -> Result<Option<String>, LedgerError> {
        let address = Self::contract_address(loan_id);
        Ok(self.contracts.contains_key(&address).then_some(address))
    }

    async fn next_nonce(&self, signer: &str) -> Result<u64, LedgerError> {
        Ok(self.nonces.get(signer).map(|n| *n).unwrap_or(0))
    }

    async fn is_paused(&self) -> Result<bool, LedgerError> {
        Ok(self.paused.load(Ordering::SeqCst))
    }

    fn gateway_id(&self) -> &str {
        "ledger-simulated"
    }
}
