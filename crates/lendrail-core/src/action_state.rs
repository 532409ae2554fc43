use std::fmt;

use crate::error::CoreError;

/// Lifecycle of a queued chain action.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionStatus {
    /// Waiting to be claimed by the dispatch worker.
    Queued,
    /// Claimed by the worker, not yet handed to the ledger.
    Processing,
    /// Signed and submitted; awaiting the mining result.
    Sent,
    /// Failed with a transient error; eligible for the next claim.
    Retrying,
    /// Mined on the ledger. Final state.
    Mined,
    /// Dead-lettered; never retried automatically. Final state.
    Failed,
}

impl ActionStatus {
    pub const ALL: [ActionStatus; 6] = [
        Self::Queued,
        Self::Processing,
        Self::Sent,
        Self::Retrying,
        Self::Mined,
        Self::Failed,
    ];

    /// Whether this is a final (terminal) state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Mined | Self::Failed)
    }

    /// Whether the worker may claim an action in this state.
    pub fn is_claimable(&self) -> bool {
        matches!(self, Self::Queued | Self::Retrying)
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "QUEUED"),
            Self::Processing => write!(f, "PROCESSING"),
            Self::Sent => write!(f, "SENT"),
            Self::Retrying => write!(f, "RETRYING"),
            Self::Mined => write!(f, "MINED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

impl std::str::FromStr for ActionStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.to_string().eq_ignore_ascii_case(s))
            .ok_or_else(|| CoreError::ValidationError(format!("unknown action status: {}", s)))
    }
}

/// Events that move a chain action between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionEvent {
    /// The worker claimed the action.
    Claim,
    /// The signed call was handed to the ledger.
    Submit,
    /// A transient failure; the action goes back to the queue.
    Retry,
    /// The ledger mined the call.
    Mine,
    /// A terminal failure; the action is dead-lettered.
    Fail,
}

/// Valid transitions:
/// - Queued → Processing (Claim)
/// - Retrying → Processing (Claim)
/// - Processing → Sent (Submit)
/// - Processing → Retrying (Retry)
/// - Processing → Failed (Fail)
/// - Sent → Mined (Mine)
/// - Sent → Retrying (Retry)
/// - Sent → Failed (Fail)
///
/// Retrying → Processing is the only edge that revisits an earlier state.
pub struct ActionStateMachine;

impl ActionStateMachine {
    /// Attempt a state transition based on an event.
    pub fn transition(current: ActionStatus, event: ActionEvent) -> Result<ActionStatus, CoreError> {
        let new_state = match (current, event) {
            (ActionStatus::Queued, ActionEvent::Claim) => ActionStatus::Processing,
            (ActionStatus::Retrying, ActionEvent::Claim) => ActionStatus::Processing,

            (ActionStatus::Processing, ActionEvent::Submit) => ActionStatus::Sent,
            (ActionStatus::Processing, ActionEvent::Retry) => ActionStatus::Retrying,
            (ActionStatus::Processing, ActionEvent::Fail) => ActionStatus::Failed,

            (ActionStatus::Sent, ActionEvent::Mine) => ActionStatus::Mined,
            (ActionStatus::Sent, ActionEvent::Retry) => ActionStatus::Retrying,
            (ActionStatus::Sent, ActionEvent::Fail) => ActionStatus::Failed,

            _ => {
                let target = match event {
                    ActionEvent::Claim => ActionStatus::Processing,
                    ActionEvent::Submit => ActionStatus::Sent,
                    ActionEvent::Retry => ActionStatus::Retrying,
                    ActionEvent::Mine => ActionStatus::Mined,
                    ActionEvent::Fail => ActionStatus::Failed,
                };
                return Err(CoreError::InvalidActionTransition {
                    from: current,
                    to: target,
                });
            }
        };

        tracing::debug!(
            from = %current,
            to = %new_state,
            event = ?event,
            "chain action state transition"
        );

        Ok(new_state)
    }

    /// Check if a transition is valid without performing it.
    pub fn can_transition(current: ActionStatus, event: ActionEvent) -> bool {
        Self::transition(current, event).is_ok()
    }
}
