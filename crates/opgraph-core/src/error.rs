//! Error taxonomy delivered to observers when a unit finishes.

use thiserror::Error;

use crate::state::UnitState;

/// Errors accumulated over a Task Unit's lifecycle.
///
/// Errors are cloned into every observer's finish callback and into the error
/// list of any enclosing group, so the type is `Clone`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OpError {
    /// A condition evaluated to failed.
    #[error("Condition '{condition}' failed: {details}")]
    ConditionFailed { condition: String, details: String },

    /// The work body reported a failure.
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    /// Engine invariant violated.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: UnitState, to: UnitState },

    /// A condition, observer or dependency was added too late.
    #[error("Cannot modify {attribute} of a unit in state {state}")]
    InvalidMutation {
        attribute: &'static str,
        state: UnitState,
    },

    /// A dependency finished with errors and the unit required clean dependencies.
    #[error("Dependency '{dependency}' failed")]
    DependencyFailed { dependency: String },

    /// The unit was cancelled.
    #[error("Cancelled{}", .reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
    Cancelled { reason: Option<String> },

    /// The unit was cancelled by a timeout observer.
    #[error("Timed out after {after_ms}ms")]
    TimedOut { after_ms: u64 },

    /// A response processor reported that it did not consume its input.
    #[error("Response was not processed")]
    NotProcessed,

    /// A response processor had nothing to process.
    #[error("No response data")]
    NoData,

    /// A child was added to a group that already began finishing.
    #[error("Group '{0}' no longer accepts units")]
    GroupClosed(String),
}

impl OpError {
    /// Convenience for the common `ExecutionFailed` case.
    pub fn execution(message: impl Into<String>) -> Self {
        Self::ExecutionFailed(message.into())
    }

    /// Cancellation without a reason.
    pub fn cancelled() -> Self {
        Self::Cancelled { reason: None }
    }

    /// Returns true for errors produced by cancelling a unit.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled { .. } | Self::TimedOut { .. })
    }
}
