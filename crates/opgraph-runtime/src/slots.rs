//! Worker slots handed out by priority.
//!
//! A freed slot goes to the highest-priority waiter, oldest first within a
//! priority level.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;

use opgraph_core::Priority;

struct Waiter {
    priority: Priority,
    seq: u64,
    tx: oneshot::Sender<SlotPermit>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then the earlier arrival.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct PoolState {
    available: usize,
    waiters: BinaryHeap<Waiter>,
    next_seq: u64,
}

pub(crate) struct SlotPool {
    state: Mutex<PoolState>,
}

impl SlotPool {
    pub(crate) fn new(slots: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PoolState {
                available: slots.max(1),
                waiters: BinaryHeap::new(),
                next_seq: 0,
            }),
        })
    }

    /// Wait for a slot. Dropping the future gives up the place in line.
    pub(crate) async fn acquire(self: &Arc<Self>, priority: Priority) -> Option<SlotPermit> {
        let rx = {
            let mut state = self.lock();
            if state.available > 0 {
                state.available -= 1;
                return Some(SlotPermit {
                    pool: Some(self.clone()),
                });
            }
            let (tx, rx) = oneshot::channel();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.waiters.push(Waiter { priority, seq, tx });
            rx
        };
        rx.await.ok()
    }

    /// Slots not currently held.
    pub(crate) fn available(&self) -> usize {
        self.lock().available
    }

    fn release(self: &Arc<Self>) {
        let mut state = self.lock();
        while let Some(waiter) = state.waiters.pop() {
            let permit = SlotPermit {
                pool: Some(self.clone()),
            };
            match waiter.tx.send(permit) {
                Ok(()) => return,
                // The waiter gave up; its permit must not release again.
                Err(mut permit) => permit.pool = None,
            }
        }
        state.available += 1;
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A held worker slot, returned to the pool on drop.
pub(crate) struct SlotPermit {
    pool: Option<Arc<SlotPool>>,
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.release();
        }
    }
}
