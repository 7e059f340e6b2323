//! Task Group: many units presented as one.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::{debug, info};

use opgraph_core::OpError;

use crate::config::QueueConfig;
use crate::observers::Observer;
use crate::queue::{ExecutionQueue, QueueDelegate};
use crate::unit::{ExecutionContext, TaskUnit, WorkBody};

/// Collects the errors of every unit that finishes on the group's queue,
/// produced units included.
#[derive(Default)]
struct ErrorCollector {
    errors: Mutex<Vec<OpError>>,
}

impl ErrorCollector {
    fn take(&self) -> Vec<OpError> {
        std::mem::take(&mut *self.errors.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

impl QueueDelegate for ErrorCollector {
    fn unit_finished(&self, _queue: &ExecutionQueue, _unit: &TaskUnit, errors: &[OpError]) {
        if !errors.is_empty() {
            self.errors
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .extend_from_slice(errors);
        }
    }
}

struct Admission {
    /// Set once the group began finishing; no children are accepted after.
    closed: bool,
    /// Children held back until the group starts executing; `None` after.
    held: Option<Vec<TaskUnit>>,
}

struct GroupShared {
    name: String,
    queue: ExecutionQueue,
    collector: Arc<ErrorCollector>,
    admission: Mutex<Admission>,
}

impl GroupShared {
    fn lock_admission(&self) -> MutexGuard<'_, Admission> {
        self.admission.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Hand held children to the queue; later additions go straight to it.
    fn release_held(&self) {
        let held = self.lock_admission().held.take().unwrap_or_default();
        if !held.is_empty() {
            debug!(group = %self.name, children = held.len(), "Submitting children");
        }
        for child in held {
            self.queue.submit(child);
        }
    }
}

/// A unit that owns a private queue and finishes once every child has.
///
/// Children run to completion even when some fail; their errors become the
/// group's errors. Children are handed to the private queue once the group
/// starts executing, so a group can be built outside a tokio runtime.
#[derive(Clone)]
pub struct TaskGroup {
    unit: TaskUnit,
    shared: Arc<GroupShared>,
}

impl TaskGroup {
    pub fn new(name: impl Into<String>, children: impl IntoIterator<Item = TaskUnit>) -> Self {
        let name = name.into();
        let config = QueueConfig::named(format!("{name}/children"));
        Self::with_config(name, config, children)
    }

    /// Create a group whose internal queue uses `config`. The queue always
    /// starts suspended, whatever the config says.
    pub fn with_config(
        name: impl Into<String>,
        config: QueueConfig,
        children: impl IntoIterator<Item = TaskUnit>,
    ) -> Self {
        let name = name.into();
        let queue = ExecutionQueue::new(config.suspended());
        let collector = Arc::new(ErrorCollector::default());
        queue.set_delegate(collector.clone());

        let held: Vec<TaskUnit> = children.into_iter().collect();
        debug!(group = %name, children = held.len(), "Group created");

        let shared = Arc::new(GroupShared {
            name: name.clone(),
            queue,
            collector,
            admission: Mutex::new(Admission {
                closed: false,
                held: Some(held),
            }),
        });

        let unit = TaskUnit::new(
            name,
            GroupBody {
                shared: shared.clone(),
            },
        );
        // Attached while the unit is still initialized, so this cannot fail.
        let _ = unit.add_observer(GroupTeardown {
            shared: shared.clone(),
        });

        Self { unit, shared }
    }

    /// The unit representing the whole group; submit this to a queue.
    pub fn unit(&self) -> &TaskUnit {
        &self.unit
    }

    pub fn into_unit(self) -> TaskUnit {
        self.unit
    }

    /// The group's private queue.
    pub fn queue(&self) -> &ExecutionQueue {
        &self.shared.queue
    }

    /// Add a child. Allowed until the group begins finishing.
    pub fn add(&self, child: TaskUnit) -> Result<(), OpError> {
        let mut admission = self.shared.lock_admission();
        if admission.closed {
            return Err(OpError::GroupClosed(self.shared.name.clone()));
        }
        if self.unit.is_cancelled() {
            child.cancel();
        }
        match admission.held.as_mut() {
            Some(held) => held.push(child),
            // Submitted under the lock so the group cannot close in between.
            None => self.shared.queue.submit(child),
        }
        Ok(())
    }

    /// Cancel the group and every outstanding child.
    pub fn cancel(&self) {
        self.unit.cancel();
        self.shared.queue.cancel_all();
    }
}

impl std::fmt::Debug for TaskGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGroup")
            .field("name", &self.shared.name)
            .field("state", &self.unit.state())
            .field("children", &self.shared.queue.len())
            .finish()
    }
}

struct GroupBody {
    shared: Arc<GroupShared>,
}

#[async_trait]
impl WorkBody for GroupBody {
    async fn execute(self: Box<Self>, ctx: ExecutionContext) {
        let shared = self.shared;
        let queue = &shared.queue;

        // Share categories with the queue running the group.
        queue.adopt_exclusivity(ctx.queue().exclusivity());
        shared.release_held();
        queue.resume();

        let mut cancelled = false;
        loop {
            if cancelled {
                queue.cancel_all();
                queue.wait_until_idle().await;
            } else {
                tokio::select! {
                    _ = ctx.cancelled() => {
                        info!(group = %shared.name, "Group cancelled, cancelling children");
                        cancelled = true;
                        continue;
                    }
                    _ = queue.wait_until_idle() => {}
                }
            }

            // A child may have been added between idle and here.
            let mut admission = shared.lock_admission();
            if queue.is_idle() {
                admission.closed = true;
                break;
            }
        }

        ctx.finish(shared.collector.take());
    }
}

/// Makes sure nothing is left behind when the group finishes without having
/// executed (cancelled or failed conditions).
struct GroupTeardown {
    shared: Arc<GroupShared>,
}

impl Observer for GroupTeardown {
    fn did_finish(&self, _unit: &TaskUnit, _errors: &[OpError]) {
        let held = {
            let mut admission = self.shared.lock_admission();
            admission.closed = true;
            admission.held.take().unwrap_or_default()
        };
        // Never-started children still finish, cancelled.
        for child in held {
            child.cancel();
            self.shared.queue.submit(child);
        }
        self.shared.queue.cancel_all();
        self.shared.queue.resume();
    }
}
