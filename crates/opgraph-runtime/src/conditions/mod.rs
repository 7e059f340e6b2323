//! Readiness conditions evaluated before a unit may execute.

mod block;
mod dependency_success;
mod exclusive;

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;

use opgraph_core::OpError;

use crate::unit::TaskUnit;

pub use block::BlockCondition;
pub use dependency_success::DependencySuccessCondition;
pub use exclusive::MutuallyExclusive;

/// Result of evaluating one condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditionOutcome {
    Satisfied,
    Failed(OpError),
}

/// A gating predicate attached to a unit.
///
/// The queue asks every condition for a prerequisite unit at submit time and
/// makes the gated unit depend on it, so prerequisites always finish before
/// `evaluate` runs.
#[async_trait]
pub trait Condition: Send + Sync {
    /// Name used in `ConditionFailed` errors and logs.
    fn name(&self) -> &str;

    /// Mutual-exclusion category, if this condition claims one.
    fn category(&self) -> Option<&str> {
        None
    }

    /// A unit that must run before this condition is evaluated.
    fn dependency_for(&self, _unit: &TaskUnit) -> Option<TaskUnit> {
        None
    }

    async fn evaluate(&self, unit: &TaskUnit) -> ConditionOutcome;
}

/// Evaluate all conditions concurrently and collect failures in declaration order.
pub(crate) async fn evaluate_all(conditions: &[Arc<dyn Condition>], unit: &TaskUnit) -> Vec<OpError> {
    join_all(conditions.iter().map(|condition| condition.evaluate(unit)))
        .await
        .into_iter()
        .filter_map(|outcome| match outcome {
            ConditionOutcome::Satisfied => None,
            ConditionOutcome::Failed(error) => Some(error),
        })
        .collect()
}
