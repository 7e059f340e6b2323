use std::sync::Arc;

use async_trait::async_trait;

use opgraph_core::OpError;

use super::{Condition, ConditionOutcome};
use crate::unit::TaskUnit;

type Predicate = Arc<dyn Fn(&TaskUnit) -> bool + Send + Sync>;
type PrerequisiteFactory = Arc<dyn Fn(&TaskUnit) -> Option<TaskUnit> + Send + Sync>;

/// Condition backed by a closure, optionally with a prerequisite unit
/// (for example a unit that requests a permission the predicate then checks).
#[derive(Clone)]
pub struct BlockCondition {
    name: String,
    predicate: Predicate,
    prerequisite: Option<PrerequisiteFactory>,
}

impl BlockCondition {
    pub fn new(
        name: impl Into<String>,
        predicate: impl Fn(&TaskUnit) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            predicate: Arc::new(predicate),
            prerequisite: None,
        }
    }

    /// Run the unit built by `factory` before evaluating the predicate.
    pub fn with_prerequisite(
        mut self,
        factory: impl Fn(&TaskUnit) -> Option<TaskUnit> + Send + Sync + 'static,
    ) -> Self {
        self.prerequisite = Some(Arc::new(factory));
        self
    }
}

#[async_trait]
impl Condition for BlockCondition {
    fn name(&self) -> &str {
        &self.name
    }

    fn dependency_for(&self, unit: &TaskUnit) -> Option<TaskUnit> {
        self.prerequisite.as_ref().and_then(|factory| factory(unit))
    }

    async fn evaluate(&self, unit: &TaskUnit) -> ConditionOutcome {
        if (self.predicate)(unit) {
            ConditionOutcome::Satisfied
        } else {
            ConditionOutcome::Failed(OpError::ConditionFailed {
                condition: self.name.clone(),
                details: format!("predicate rejected unit '{}'", unit.name()),
            })
        }
    }
}
