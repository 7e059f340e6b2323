//! Listeners notified of a unit's start, produce and finish events.

mod activity;
mod block;
mod events;
mod timeout;

use opgraph_core::OpError;

use crate::unit::TaskUnit;

pub use activity::{ActivityCounter, ActivityObserver};
pub use block::BlockObserver;
pub use events::EventObserver;
pub use timeout::TimeoutObserver;

/// Lifecycle listener attached to a unit.
///
/// Callbacks run synchronously on the thread driving the unit, in registration
/// order, and each fires at most once per unit (`did_produce` once per produced
/// unit). Keep them short; spawn if real work is needed.
pub trait Observer: Send + Sync {
    fn did_start(&self, _unit: &TaskUnit) {}

    fn did_produce(&self, _unit: &TaskUnit, _produced: &TaskUnit) {}

    fn did_finish(&self, _unit: &TaskUnit, _errors: &[OpError]) {}
}
