use tokio::sync::mpsc;

use opgraph_core::{OpError, UnitEvent};

use super::Observer;
use crate::unit::TaskUnit;

/// Forwards lifecycle events to a channel. Send failures are ignored; a
/// dropped receiver just means nobody is listening anymore.
#[derive(Debug, Clone)]
pub struct EventObserver {
    tx: mpsc::UnboundedSender<UnitEvent>,
}

impl EventObserver {
    pub fn new(tx: mpsc::UnboundedSender<UnitEvent>) -> Self {
        Self { tx }
    }

    /// Create an observer together with the receiving end.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<UnitEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Observer for EventObserver {
    fn did_start(&self, unit: &TaskUnit) {
        let _ = self
            .tx
            .send(UnitEvent::started(unit.id().clone(), unit.name()));
    }

    fn did_produce(&self, unit: &TaskUnit, produced: &TaskUnit) {
        let _ = self.tx.send(UnitEvent::produced(
            unit.id().clone(),
            unit.name(),
            produced.id(),
            produced.name(),
        ));
    }

    fn did_finish(&self, unit: &TaskUnit, errors: &[OpError]) {
        let _ = self
            .tx
            .send(UnitEvent::finished(unit.id().clone(), unit.name(), errors));
    }
}
