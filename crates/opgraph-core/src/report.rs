//! Point-in-time summaries of Task Units.

use crate::{OpError, Priority, UnitId, UnitState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Summary of a Task Unit, safe to hand out of the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitReport {
    /// Unique unit identifier.
    pub unit_id: UnitId,

    /// Diagnostic name.
    pub name: String,

    /// State at the time the report was taken.
    pub state: UnitState,

    /// Scheduling hint.
    pub priority: Priority,

    /// True iff the unit finished with at least one error.
    pub failed: bool,

    /// Error messages, in accumulation order.
    pub errors: Vec<String>,

    /// When the work body started, if it did.
    pub started_at: Option<DateTime<Utc>>,

    /// When the unit reached `Finished`.
    pub finished_at: Option<DateTime<Utc>>,
}

impl UnitReport {
    /// Create a report for a unit that has not run yet.
    pub fn new(unit_id: UnitId, name: impl Into<String>) -> Self {
        Self {
            unit_id,
            name: name.into(),
            state: UnitState::Initialized,
            priority: Priority::Default,
            failed: false,
            errors: Vec::new(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Record the errors a unit finished with.
    pub fn with_errors(mut self, errors: &[OpError]) -> Self {
        self.failed = !errors.is_empty();
        self.errors = errors.iter().map(ToString::to_string).collect();
        self
    }

    /// Wall-clock execution time, when both timestamps are known.
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }

    /// Check if the unit is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}
