use std::fmt;

use crate::error::CoreError;

/// Circuit-breaker incident lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncidentStatus {
    /// Effects applied, nobody owns it yet.
    Open,
    /// An operator has taken ownership. Effects still applied.
    Acknowledged,
    /// Effects reversed. Final state.
    Resolved,
}

impl fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "OPEN"),
            Self::Acknowledged => write!(f, "ACKNOWLEDGED"),
            Self::Resolved => write!(f, "RESOLVED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncidentEvent {
    Acknowledge,
    Resolve,
}

/// OPEN → ACKNOWLEDGED → RESOLVED is the only legal path.
pub struct IncidentStateMachine;

impl IncidentStateMachine {
    pub fn transition(
        current: IncidentStatus,
        event: IncidentEvent,
    ) -> Result<IncidentStatus, CoreError> {
        match (current, event) {
            (IncidentStatus::Open, IncidentEvent::Acknowledge) => Ok(IncidentStatus::Acknowledged),
            (IncidentStatus::Acknowledged, IncidentEvent::Resolve) => Ok(IncidentStatus::Resolved),
            _ => Err(CoreError::InvalidIncidentTransition {
                from: current,
                to: match event {
                    IncidentEvent::Acknowledge => IncidentStatus::Acknowledged,
                    IncidentEvent::Resolve => IncidentStatus::Resolved,
                },
            }),
        }
    }
}
