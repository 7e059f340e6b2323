use async_trait::async_trait;

use opgraph_core::OpError;

use super::{Condition, ConditionOutcome};
use crate::unit::TaskUnit;

/// Requires every dependency to have finished without errors.
///
/// Dependents run regardless of dependency failures unless they carry this
/// condition.
#[derive(Debug, Default, Clone, Copy)]
pub struct DependencySuccessCondition;

impl DependencySuccessCondition {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Condition for DependencySuccessCondition {
    fn name(&self) -> &str {
        "DependencySuccess"
    }

    async fn evaluate(&self, unit: &TaskUnit) -> ConditionOutcome {
        match unit.dependencies().iter().find(|dependency| dependency.failed()) {
            Some(dependency) => ConditionOutcome::Failed(OpError::DependencyFailed {
                dependency: dependency.name().to_string(),
            }),
            None => ConditionOutcome::Satisfied,
        }
    }
}
