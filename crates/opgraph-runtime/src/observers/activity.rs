use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use opgraph_core::OpError;

use super::Observer;
use crate::unit::TaskUnit;

/// Shared reference count of running units.
#[derive(Debug, Clone, Default)]
pub struct ActivityCounter {
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl ActivityCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Units currently between start and finish.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Highest value `active` ever reached.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Observer that feeds this counter.
    pub fn observer(&self) -> ActivityObserver {
        ActivityObserver {
            counter: self.clone(),
        }
    }
}

/// Increments its counter when a unit starts and decrements it when the unit
/// finishes. Units cancelled before starting never touch the counter.
#[derive(Debug, Clone)]
pub struct ActivityObserver {
    counter: ActivityCounter,
}

impl Observer for ActivityObserver {
    fn did_start(&self, _unit: &TaskUnit) {
        let now = self.counter.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.counter.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn did_finish(&self, unit: &TaskUnit, _errors: &[OpError]) {
        if unit.report().started_at.is_some() {
            self.counter.active.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
