//! Shared state handed to the HTTP handlers.

use lendrail_settlement::SettlementService;
use std::sync::Arc;
use std::time::Instant;

pub struct NodeState {
    pub service: Arc<SettlementService>,
    pub start_time: Instant,
}

impl NodeState {
    pub fn new(service: Arc<SettlementService>) -> Self {
        Self {
            service,
            start_time: Instant::now(),
        }
    }
}
