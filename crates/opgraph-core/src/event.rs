//! Unit lifecycle events for tracking execution stages.

use crate::error::OpError;
use crate::ids::UnitId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A lifecycle event emitted for a Task Unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitEvent {
    /// Unit this event belongs to.
    pub unit_id: UnitId,
    /// Diagnostic name of the unit.
    pub unit_name: String,
    /// Type of event.
    pub event_type: UnitEventType,
    /// Unix timestamp (milliseconds) when event occurred.
    pub timestamp_ms: i64,
    /// Event-specific metadata (produced unit, error messages, etc.).
    pub metadata: HashMap<String, String>,
}

impl UnitEvent {
    /// Create a new unit event.
    pub fn new(
        unit_id: UnitId,
        unit_name: impl Into<String>,
        event_type: UnitEventType,
        metadata: HashMap<String, String>,
    ) -> Self {
        Self {
            unit_id,
            unit_name: unit_name.into(),
            event_type,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            metadata,
        }
    }

    /// Create a Started event.
    pub fn started(unit_id: UnitId, unit_name: &str) -> Self {
        Self::new(unit_id, unit_name, UnitEventType::Started, HashMap::new())
    }

    /// Create a Produced event naming the unit handed to the queue.
    pub fn produced(unit_id: UnitId, unit_name: &str, produced_id: &UnitId, produced_name: &str) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert("produced_id".to_string(), produced_id.to_string());
        metadata.insert("produced_name".to_string(), produced_name.to_string());
        Self::new(unit_id, unit_name, UnitEventType::Produced, metadata)
    }

    /// Create a finish event. The type depends on the errors the unit carried.
    pub fn finished(unit_id: UnitId, unit_name: &str, errors: &[OpError]) -> Self {
        let event_type = if errors.is_empty() {
            UnitEventType::Finished
        } else if errors.iter().all(OpError::is_cancellation) {
            UnitEventType::Cancelled
        } else {
            UnitEventType::Failed
        };

        let mut metadata = HashMap::new();
        if !errors.is_empty() {
            metadata.insert("error_count".to_string(), errors.len().to_string());
            let joined = errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            metadata.insert("errors".to_string(), joined);
        }
        Self::new(unit_id, unit_name, event_type, metadata)
    }
}

/// Type of unit lifecycle event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UnitEventType {
    /// The work body began.
    Started,
    /// A running unit handed an extra unit to its queue.
    Produced,
    /// The unit finished without errors.
    Finished,
    /// The unit finished with at least one non-cancellation error.
    Failed,
    /// The unit finished with cancellation errors only.
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_started() {
        let id = UnitId::generate();
        let event = UnitEvent::started(id.clone(), "load");

        assert_eq!(event.unit_id, id);
        assert_eq!(event.unit_name, "load");
        assert_eq!(event.event_type, UnitEventType::Started);
        assert!(event.timestamp_ms > 0);
    }

    #[test]
    fn test_finished_classification() {
        let id = UnitId::generate();
        assert_eq!(
            UnitEvent::finished(id.clone(), "a", &[]).event_type,
            UnitEventType::Finished
        );
        assert_eq!(
            UnitEvent::finished(id.clone(), "a", &[OpError::cancelled()]).event_type,
            UnitEventType::Cancelled
        );

        let event = UnitEvent::finished(id, "a", &[OpError::cancelled(), OpError::NoData]);
        assert_eq!(event.event_type, UnitEventType::Failed);
        assert_eq!(event.metadata.get("error_count"), Some(&"2".to_string()));
        assert_eq!(
            event.metadata.get("errors"),
            Some(&"Cancelled; No response data".to_string())
        );
    }

    #[test]
    fn test_produced_metadata() {
        let parent = UnitId::generate();
        let child = UnitId::new("child-1");
        let event = UnitEvent::produced(parent, "parent", &child, "child");

        assert_eq!(event.event_type, UnitEventType::Produced);
        assert_eq!(event.metadata.get("produced_id"), Some(&"child-1".to_string()));
        assert_eq!(event.metadata.get("produced_name"), Some(&"child".to_string()));
    }
}
