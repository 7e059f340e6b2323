//! Lifecycle state and scheduling hints for Task Units.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a Task Unit.
///
/// Variants are declared in lifecycle order, so `PartialOrd` compares how far a
/// unit has progressed.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnitState {
    /// Created, not yet submitted to a queue.
    #[default]
    Initialized,
    /// Submitted; waiting for dependencies to finish.
    Pending,
    /// Conditions are being evaluated.
    EvaluatingConditions,
    /// Conditions evaluated; waiting for a worker slot.
    Ready,
    /// The work body is running.
    Executing,
    /// Finish was requested; observers are being notified.
    Finishing,
    /// Terminal.
    Finished,
}

impl UnitState {
    /// Returns true if `self -> target` is a legal transition.
    ///
    /// `Pending -> Finishing` and `Ready -> Finishing` are the cancellation
    /// paths that skip execution.
    pub fn can_transition_to(&self, target: UnitState) -> bool {
        matches!(
            (self, target),
            (Self::Initialized, Self::Pending)
                | (Self::Pending, Self::EvaluatingConditions)
                | (Self::Pending, Self::Finishing)
                | (Self::EvaluatingConditions, Self::Ready)
                | (Self::Ready, Self::Executing)
                | (Self::Ready, Self::Finishing)
                | (Self::Executing, Self::Finishing)
                | (Self::Finishing, Self::Finished)
        )
    }

    /// Returns true if the unit reached its terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished)
    }

    /// Returns true once the unit left the queue's hands for good.
    pub fn is_finishing_or_finished(&self) -> bool {
        matches!(self, Self::Finishing | Self::Finished)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Pending => "pending",
            Self::EvaluatingConditions => "evaluating_conditions",
            Self::Ready => "ready",
            Self::Executing => "executing",
            Self::Finishing => "finishing",
            Self::Finished => "finished",
        }
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User-priority hint. When worker slots are scarce, higher priorities are
/// served first. Never affects correctness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Background,
    #[default]
    Default,
    UserInitiated,
}

impl Priority {
    /// Returns true if the unit was started on behalf of the user.
    pub fn is_user_initiated(&self) -> bool {
        matches!(self, Self::UserInitiated)
    }
}
