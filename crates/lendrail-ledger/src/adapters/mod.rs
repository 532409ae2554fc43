pub mod http;
pub mod simulated;

pub use http::HttpLedger;
pub use simulated::{SimulatedContract, SimulatedLedger};
