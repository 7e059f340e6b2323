use async_trait::async_trait;

use super::{Condition, ConditionOutcome};
use crate::unit::TaskUnit;

/// Allows at most one executing unit per category across every queue that
/// shares an exclusivity controller.
///
/// Evaluation always succeeds; the queue holds the unit back until the
/// category is free instead of failing it.
#[derive(Debug, Clone)]
pub struct MutuallyExclusive {
    name: String,
    category: String,
}

impl MutuallyExclusive {
    pub fn new(category: impl Into<String>) -> Self {
        let category = category.into();
        Self {
            name: format!("MutuallyExclusive<{category}>"),
            category,
        }
    }
}

#[async_trait]
impl Condition for MutuallyExclusive {
    fn name(&self) -> &str {
        &self.name
    }

    fn category(&self) -> Option<&str> {
        Some(&self.category)
    }

    async fn evaluate(&self, _unit: &TaskUnit) -> ConditionOutcome {
        ConditionOutcome::Satisfied
    }
}
