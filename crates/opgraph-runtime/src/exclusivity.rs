//! Registry of mutual-exclusion categories and the units holding them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::debug;

use opgraph_core::UnitId;

/// Tracks which unit currently holds each mutual-exclusion category.
///
/// One controller is shared by a queue and every group queue nested under it,
/// so a category is exclusive across the whole graph.
#[derive(Debug, Default)]
pub struct ExclusivityController {
    holders: Mutex<HashMap<String, UnitId>>,
    released: Notify,
}

/// Outcome of an attempt to claim categories.
pub(crate) enum Claim {
    /// Every category was free and the unit entered `Executing`.
    Acquired(ExclusivityClaim),
    /// At least one category is held by another unit.
    Busy,
    /// Categories were free but the unit refused to start (cancelled).
    Aborted,
}

impl ExclusivityController {
    pub fn new() -> Self {
        Self::default()
    }

    /// The unit currently holding `category`, if any.
    pub fn holder(&self, category: &str) -> Option<UnitId> {
        self.lock().get(category).cloned()
    }

    /// Number of categories currently held.
    pub fn held_count(&self) -> usize {
        self.lock().len()
    }

    /// A future that resolves on the next release. Enable it before checking
    /// availability so a release in between is not missed.
    pub(crate) fn released(&self) -> Notified<'_> {
        self.released.notified()
    }

    /// Claim every category in `categories` for `unit_id` and run `enter`
    /// under the same lock, so claiming and entering `Executing` are atomic.
    pub(crate) fn try_claim(
        self: &Arc<Self>,
        categories: &[String],
        unit_id: &UnitId,
        enter: impl FnOnce() -> bool,
    ) -> Claim {
        let mut holders = self.lock();
        if let Some(category) = categories.iter().find(|c| holders.contains_key(*c)) {
            debug!(
                category = %category,
                unit_id = %unit_id.short(),
                "Exclusive category busy"
            );
            return Claim::Busy;
        }
        if !enter() {
            return Claim::Aborted;
        }
        for category in categories {
            holders.insert(category.clone(), unit_id.clone());
        }
        Claim::Acquired(ExclusivityClaim {
            controller: Arc::clone(self),
            categories: categories.to_vec(),
            unit_id: unit_id.clone(),
        })
    }

    fn release(&self, categories: &[String], unit_id: &UnitId) {
        if categories.is_empty() {
            return;
        }
        {
            let mut holders = self.lock();
            for category in categories {
                if holders.get(category) == Some(unit_id) {
                    holders.remove(category);
                }
            }
        }
        debug!(unit_id = %unit_id.short(), released = categories.len(), "Exclusive categories released");
        self.released.notify_waiters();
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, UnitId>> {
        self.holders.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Held by an executing unit; releases its categories when dropped.
#[derive(Debug)]
pub struct ExclusivityClaim {
    controller: Arc<ExclusivityController>,
    categories: Vec<String>,
    unit_id: UnitId,
}

impl Drop for ExclusivityClaim {
    fn drop(&mut self) {
        self.controller.release(&self.categories, &self.unit_id);
    }
}
