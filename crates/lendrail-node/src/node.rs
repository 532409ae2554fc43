//! The lendrail node orchestrator.
//!
//! Opens the store, connects the ledger gateway, loads the settlement
//! signer, recovers the settlement core, then runs the dispatch worker and
//! the HTTP API as background tasks.

use anyhow::Result;
use lendrail_core::{MemoryStore, Store};
use lendrail_ledger::{HttpLedger, LedgerGateway, Signer, SimulatedLedger};
use lendrail_settlement::SettlementService;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{LedgerMode, LendrailConfig, StorageBackend};
use crate::state::NodeState;
use crate::storage::open_store;

pub struct LendrailNode {
    /// Node configuration.
    config: LendrailConfig,
    /// Settlement core (None until started).
    service: Option<Arc<SettlementService>>,
    /// Flips the dispatch worker's shutdown flag.
    shutdown_tx: Option<watch::Sender<bool>>,
    worker_task: Option<JoinHandle<()>>,
    api_task: Option<JoinHandle<Result<()>>>,
}

impl LendrailNode {
    pub fn new(config: LendrailConfig) -> Result<Self> {
        tracing::info!(
            storage = ?config.storage.backend,
            ledger = ?config.ledger.mode,
            "lendrail node created"
        );
        Ok(Self {
            config,
            service: None,
            shutdown_tx: None,
            worker_task: None,
            api_task: None,
        })
    }

    /// Initialize and start the node: store, ledger, worker, HTTP API.
    pub async fn start(&mut self) -> Result<()> {
        tracing::info!("starting lendrail node");

        let store = self.open_store()?;
        let ledger = self.connect_ledger()?;
        let signer = match self.config.ledger.signer_key_path {
            Some(ref path) => Self::load_or_generate_signer(path)?,
            None => {
                tracing::warn!("no signer_key_path configured, using an ephemeral signer");
                Signer::generate()
            }
        };

        let service = Arc::new(SettlementService::new(
            store,
            ledger,
            signer,
            self.config.dispatch.clone(),
        ));
        service.recover().await?;

        // Spawn the dispatch worker
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = service.worker();
        self.worker_task = Some(tokio::spawn(worker.run(shutdown_rx)));

        // Spawn the HTTP API server
        let api_addr: SocketAddr = self.config.api_addr().parse()?;
        let api_state = Arc::new(NodeState::new(service.clone()));
        self.api_task = Some(tokio::spawn(async move {
            let result = crate::api::start_api_server(api_addr, api_state).await;
            if let Err(ref e) = result {
                tracing::error!(error = %e, "HTTP API server error");
            }
            result
        }));

        self.service = Some(service);
        self.shutdown_tx = Some(shutdown_tx);
        Ok(())
    }

    /// Wait on the API server; returns when it stops.
    pub async fn run(&mut self) -> Result<()> {
        let api_task = self
            .api_task
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("node not started"))?;
        api_task.await??;
        Ok(())
    }

    /// Stop the worker after its current cycle, then the API server.
    pub async fn shutdown(&mut self) -> Result<()> {
        tracing::info!("shutting down lendrail node");

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        if let Some(worker) = self.worker_task.take() {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "dispatch worker task failed");
            }
        }
        if let Some(api) = self.api_task.take() {
            api.abort();
            // Wait for the task to drop its handle on the store.
            let _ = api.await;
        }
        if self.service.take().is_some() {
            tracing::info!("store closed");
        }

        tracing::info!("lendrail node shut down");
        Ok(())
    }

    pub fn service(&self) -> Option<Arc<SettlementService>> {
        self.service.clone()
    }

    pub fn config(&self) -> &LendrailConfig {
        &self.config
    }

    fn open_store(&self) -> Result<Arc<dyn Store>> {
        match self.config.storage.backend {
            StorageBackend::Memory => {
                tracing::warn!("memory storage backend: state is lost on exit");
                Ok(Arc::new(MemoryStore::new()))
            }
            StorageBackend::Rocksdb => {
                let path = &self.config.storage.data_dir;
                let store = open_store(path)?;
                tracing::info!(path = %path.display(), "storage initialized");
                Ok(Arc::new(store))
            }
        }
    }

    fn connect_ledger(&self) -> Result<Arc<dyn LedgerGateway>> {
        match self.config.ledger.mode {
            LedgerMode::Simulated => {
                if self.config.storage.backend == StorageBackend::Rocksdb {
                    tracing::warn!(
                        "simulated ledger does not survive restarts; \
                         reconciliation will report persisted loans as missing"
                    );
                }
                Ok(Arc::new(SimulatedLedger::new()))
            }
            LedgerMode::Http => {
                let ledger = HttpLedger::new(
                    self.config.ledger.endpoint.clone(),
                    self.config.ledger.request_timeout(),
                )?;
                tracing::info!(endpoint = %ledger.endpoint(), "ledger relay configured");
                Ok(Arc::new(ledger))
            }
        }
    }

    /// Load the signer seed from disk, or generate and save a new one.
    fn load_or_generate_signer(path: &Path) -> Result<Signer> {
        if path.exists() {
            let encoded = std::fs::read_to_string(path)?;
            let signer = Signer::from_hex(&encoded)?;
            tracing::info!(path = %path.display(), address = %signer.address(), "loaded signer from disk");
            Ok(signer)
        } else {
            let signer = Signer::generate();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, signer.to_hex())?;
            tracing::info!(path = %path.display(), address = %signer.address(), "generated and saved new signer");
            Ok(signer)
        }
    }
}
