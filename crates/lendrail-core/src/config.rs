use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Dispatch worker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Fixed pause between worker cycles (milliseconds).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Upper bound on one submit-and-mine round trip (milliseconds).
    #[serde(default = "default_submission_timeout_ms")]
    pub submission_timeout_ms: u64,
    /// Attempt ceiling after which a retryable failure is forced terminal.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Consecutive terminal failures that trip the circuit breaker.
    #[serde(default = "default_failure_trip_threshold")]
    pub failure_trip_threshold: u32,
}

fn default_poll_interval_ms() -> u64 {
    2_000
}
fn default_submission_timeout_ms() -> u64 {
    5_000
}
fn default_max_attempts() -> u32 {
    5
}
fn default_failure_trip_threshold() -> u32 {
    5
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            submission_timeout_ms: default_submission_timeout_ms(),
            max_attempts: default_max_attempts(),
            failure_trip_threshold: default_failure_trip_threshold(),
        }
    }
}

impl DispatchConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn submission_timeout(&self) -> Duration {
        Duration::from_millis(self.submission_timeout_ms)
    }
}
