//! The Task Unit: a cancellable, observable piece of asynchronous work.
//!
//! A unit is a handle (`Arc` inside) around a small state machine. The
//! [`ExecutionQueue`] drives it forward; the work body finishes it through the
//! [`ExecutionContext`] it is handed.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use opgraph_core::{OpError, Priority, UnitId, UnitReport, UnitState};

use crate::conditions::Condition;
use crate::exclusivity::ExclusivityClaim;
use crate::observers::Observer;
use crate::queue::ExecutionQueue;

/// The work a unit performs once it reaches `Executing`.
///
/// Implementations must call [`ExecutionContext::finish`] on every exit path,
/// possibly long after `execute` returned (for example from an I/O callback).
/// A body that never finishes leaves the unit executing forever and blocks
/// every dependent.
#[async_trait]
pub trait WorkBody: Send + 'static {
    async fn execute(self: Box<Self>, ctx: ExecutionContext);
}

/// Hook run once at finish, before observers.
type FinishedHook = Box<dyn FnOnce(&[OpError]) + Send>;

struct UnitCore {
    state: UnitState,
    /// Every state entered so far, oldest first.
    history: Vec<UnitState>,
    priority: Priority,
    conditions: Vec<Arc<dyn Condition>>,
    observers: Vec<Arc<dyn Observer>>,
    dependencies: Vec<TaskUnit>,
    internal_errors: Vec<OpError>,
    errors: Vec<OpError>,
    condition_failures: bool,
    failed: bool,
    cancelled: bool,
    finish_requested: bool,
    body: Option<Box<dyn WorkBody>>,
    finished_hook: Option<FinishedHook>,
    claim: Option<ExclusivityClaim>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

struct UnitInner {
    id: UnitId,
    name: String,
    core: Mutex<UnitCore>,
    cancel: CancellationToken,
    finished_tx: watch::Sender<bool>,
}

/// A schedulable unit of work. Cloning yields another handle to the same unit.
#[derive(Clone)]
pub struct TaskUnit {
    inner: Arc<UnitInner>,
}

/// Non-owning handle, used by observers that must not keep a unit alive.
#[derive(Clone)]
pub struct WeakUnit {
    inner: Weak<UnitInner>,
}

impl WeakUnit {
    pub fn upgrade(&self) -> Option<TaskUnit> {
        self.inner.upgrade().map(|inner| TaskUnit { inner })
    }
}

impl TaskUnit {
    /// Create a unit around an arbitrary work body.
    pub fn new(name: impl Into<String>, body: impl WorkBody) -> Self {
        let (finished_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(UnitInner {
                id: UnitId::generate(),
                name: name.into(),
                core: Mutex::new(UnitCore {
                    state: UnitState::Initialized,
                    history: vec![UnitState::Initialized],
                    priority: Priority::Default,
                    conditions: Vec::new(),
                    observers: Vec::new(),
                    dependencies: Vec::new(),
                    internal_errors: Vec::new(),
                    errors: Vec::new(),
                    condition_failures: false,
                    failed: false,
                    cancelled: false,
                    finish_requested: false,
                    body: Some(Box::new(body)),
                    finished_hook: None,
                    claim: None,
                    started_at: None,
                    finished_at: None,
                }),
                cancel: CancellationToken::new(),
                finished_tx,
            }),
        }
    }

    /// Create a unit from an async closure. The unit finishes with the
    /// closure's result once the returned future completes.
    pub fn block<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: FnOnce(ExecutionContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), OpError>> + Send + 'static,
    {
        Self::new(name, BlockBody { f })
    }

    /// A unit that does nothing; useful as a gate or a join point.
    pub fn noop(name: impl Into<String>) -> Self {
        Self::block(name, |_| async { Ok(()) })
    }

    pub fn id(&self) -> &UnitId {
        &self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> UnitState {
        self.lock().state
    }

    pub fn priority(&self) -> Priority {
        self.lock().priority
    }

    /// The states the unit went through, starting with `Initialized`.
    pub fn state_history(&self) -> Vec<UnitState> {
        self.lock().history.clone()
    }

    /// Set the scheduling hint. Only allowed before execution begins.
    pub fn set_priority(&self, priority: Priority) -> Result<(), OpError> {
        let mut core = self.lock();
        if core.state >= UnitState::Executing {
            return Err(OpError::InvalidMutation {
                attribute: "priority",
                state: core.state,
            });
        }
        core.priority = priority;
        Ok(())
    }

    /// Attach a condition. Only allowed before the unit is submitted.
    pub fn add_condition(&self, condition: impl Condition + 'static) -> Result<(), OpError> {
        let mut core = self.lock();
        if core.state != UnitState::Initialized {
            return Err(OpError::InvalidMutation {
                attribute: "conditions",
                state: core.state,
            });
        }
        core.conditions.push(Arc::new(condition));
        Ok(())
    }

    /// Attach an observer. Allowed until execution begins.
    pub fn add_observer(&self, observer: impl Observer + 'static) -> Result<(), OpError> {
        self.add_shared_observer(Arc::new(observer))
    }

    /// Attach an observer that is shared with other units.
    pub fn add_shared_observer(&self, observer: Arc<dyn Observer>) -> Result<(), OpError> {
        let mut core = self.lock();
        if core.state >= UnitState::Executing {
            return Err(OpError::InvalidMutation {
                attribute: "observers",
                state: core.state,
            });
        }
        core.observers.push(observer);
        Ok(())
    }

    /// Declare that `dependency` must finish before this unit may start.
    /// Only allowed before the unit is submitted.
    pub fn add_dependency(&self, dependency: &TaskUnit) -> Result<(), OpError> {
        debug_assert!(
            !Arc::ptr_eq(&self.inner, &dependency.inner),
            "a unit cannot depend on itself"
        );
        let mut core = self.lock();
        if core.state != UnitState::Initialized {
            return Err(OpError::InvalidMutation {
                attribute: "dependencies",
                state: core.state,
            });
        }
        core.dependencies.push(dependency.clone());
        Ok(())
    }

    /// Register a hook run once when the unit finishes, before any observer.
    pub fn on_finished(&self, hook: impl FnOnce(&[OpError]) + Send + 'static) -> Result<(), OpError> {
        let mut core = self.lock();
        if core.finish_requested {
            return Err(OpError::InvalidMutation {
                attribute: "finished hook",
                state: core.state,
            });
        }
        core.finished_hook = Some(Box::new(hook));
        Ok(())
    }

    pub fn dependencies(&self) -> Vec<TaskUnit> {
        self.lock().dependencies.clone()
    }

    pub(crate) fn conditions(&self) -> Vec<Arc<dyn Condition>> {
        self.lock().conditions.clone()
    }

    /// Mutual-exclusion categories claimed by this unit's conditions.
    pub fn exclusivity_categories(&self) -> Vec<String> {
        let mut categories: Vec<String> = self
            .lock()
            .conditions
            .iter()
            .filter_map(|c| c.category().map(str::to_owned))
            .collect();
        categories.sort();
        categories.dedup();
        categories
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    pub fn is_finished(&self) -> bool {
        self.lock().state == UnitState::Finished
    }

    /// True iff the unit finished with at least one error.
    pub fn failed(&self) -> bool {
        self.lock().failed
    }

    /// Errors the unit finished with. Empty until it finishes.
    pub fn errors(&self) -> Vec<OpError> {
        self.lock().errors.clone()
    }

    /// Whether the queue may hand this unit to a worker.
    ///
    /// A cancelled unit is always ready so it can take the fast path to
    /// `Finished`. Otherwise the unit must have reached `Ready` without
    /// condition failures and every dependency must be finished.
    pub fn is_ready(&self) -> bool {
        let dependencies = {
            let core = self.lock();
            if core.cancelled {
                return !core.state.is_finishing_or_finished();
            }
            if core.state != UnitState::Ready || core.condition_failures {
                return false;
            }
            core.dependencies.clone()
        };
        dependencies.iter().all(TaskUnit::is_finished)
    }

    /// Cancel with a plain `Cancelled` error.
    pub fn cancel(&self) {
        self.cancel_with_error(OpError::cancelled());
    }

    /// Cancel with a `Cancelled` error carrying a reason.
    pub fn cancel_with_reason(&self, reason: impl Into<String>) {
        self.cancel_with_error(OpError::Cancelled {
            reason: Some(reason.into()),
        });
    }

    /// Cancel, recording `error` as the cause.
    ///
    /// Before execution the unit skips straight to `Finished`. While executing
    /// this only raises the cancellation flag; the body decides when to stop.
    /// Cancelling twice, or after finish, has no effect.
    pub fn cancel_with_error(&self, error: OpError) {
        {
            let mut core = self.lock();
            if core.cancelled || core.finish_requested {
                return;
            }
            core.cancelled = true;
            core.internal_errors.push(error);
        }
        info!(unit = %self.name(), unit_id = %self.id().short(), "Unit cancelled");
        self.inner.cancel.cancel();
    }

    /// Resolves once the unit reaches `Finished`, observers included.
    ///
    /// There is no blocking counterpart.
    pub async fn finished(&self) {
        let mut rx = self.inner.finished_tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Point-in-time summary of the unit.
    pub fn report(&self) -> UnitReport {
        let core = self.lock();
        let mut report =
            UnitReport::new(self.id().clone(), self.name()).with_errors(&core.errors);
        report.state = core.state;
        report.priority = core.priority;
        report.failed = core.failed;
        report.started_at = core.started_at;
        report.finished_at = core.finished_at;
        report
    }

    pub fn downgrade(&self) -> WeakUnit {
        WeakUnit {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn ptr_eq(&self, other: &TaskUnit) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // ---- engine-facing transitions ----

    pub(crate) fn cancellation(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    /// `Initialized -> Pending`. Returns false if the unit was already submitted.
    pub(crate) fn will_enqueue(&self) -> bool {
        let mut core = self.lock();
        self.transition(&mut core, UnitState::Pending)
    }

    /// `Pending -> EvaluatingConditions`, unless the unit was cancelled.
    ///
    /// Returns the conditions to evaluate, or `None` when evaluation must be
    /// skipped. A second call is a no-op.
    pub(crate) fn begin_condition_evaluation(&self) -> Option<Vec<Arc<dyn Condition>>> {
        let mut core = self.lock();
        if core.cancelled || core.state != UnitState::Pending {
            return None;
        }
        if self.transition(&mut core, UnitState::EvaluatingConditions) {
            Some(core.conditions.clone())
        } else {
            None
        }
    }

    /// `EvaluatingConditions -> Ready`, recording any failures.
    pub(crate) fn conditions_evaluated(&self, failures: Vec<OpError>) {
        let mut core = self.lock();
        if !failures.is_empty() {
            debug!(
                unit = %self.name(),
                failures = failures.len(),
                "Conditions failed; unit will not execute"
            );
            core.condition_failures = true;
            core.internal_errors.extend(failures);
        }
        self.transition(&mut core, UnitState::Ready);
    }

    /// True when a ready unit must finish without running its body.
    pub(crate) fn should_skip_execution(&self) -> bool {
        let core = self.lock();
        core.cancelled || core.condition_failures
    }

    /// `Ready -> Executing`. Refuses when the unit was cancelled meanwhile.
    pub(crate) fn begin_executing(&self) -> bool {
        let mut core = self.lock();
        if core.cancelled || core.state != UnitState::Ready {
            return false;
        }
        let entered = self.transition(&mut core, UnitState::Executing);
        if entered {
            core.started_at = Some(Utc::now());
        }
        entered
    }

    pub(crate) fn hold_claim(&self, claim: ExclusivityClaim) {
        self.lock().claim = Some(claim);
    }

    pub(crate) fn take_body(&self) -> Option<Box<dyn WorkBody>> {
        self.lock().body.take()
    }

    pub(crate) fn notify_started(&self) {
        let observers = self.lock().observers.clone();
        for observer in &observers {
            observer.did_start(self);
        }
    }

    pub(crate) fn produce(&self, produced: &TaskUnit) {
        let observers = self.lock().observers.clone();
        debug!(unit = %self.name(), produced = %produced.name(), "Unit produced a new unit");
        for observer in &observers {
            observer.did_produce(self, produced);
        }
    }

    /// Finish the unit. Only the first call has any effect.
    ///
    /// Internal errors (condition failures, cancellation) come first, followed
    /// by `errors`. The finished hook and then every observer see the merged
    /// list before the unit is marked `Finished`.
    pub(crate) fn finish(&self, errors: Vec<OpError>) {
        let (combined, observers, hook) = {
            let mut core = self.lock();
            if core.finish_requested {
                debug!(unit = %self.name(), "Finish called again; ignoring");
                return;
            }
            if !self.transition(&mut core, UnitState::Finishing) {
                return;
            }
            core.finish_requested = true;

            let mut combined = std::mem::take(&mut core.internal_errors);
            combined.extend(errors);
            core.failed = !combined.is_empty();
            core.errors = combined.clone();
            (combined, core.observers.clone(), core.finished_hook.take())
        };

        if combined.is_empty() {
            info!(unit = %self.name(), unit_id = %self.id().short(), "Unit finished");
        } else {
            warn!(
                unit = %self.name(),
                unit_id = %self.id().short(),
                errors = combined.len(),
                first_error = %combined[0],
                "Unit finished with errors"
            );
        }

        if let Some(hook) = hook {
            hook(&combined);
        }
        for observer in &observers {
            observer.did_finish(self, &combined);
        }

        let claim = {
            let mut core = self.lock();
            self.transition(&mut core, UnitState::Finished);
            core.finished_at = Some(Utc::now());
            core.claim.take()
        };
        drop(claim);
        self.inner.finished_tx.send_replace(true);
    }

    fn transition(&self, core: &mut UnitCore, to: UnitState) -> bool {
        if core.state.can_transition_to(to) {
            debug!(unit = %self.name(), from = %core.state, to = %to, "State transition");
            core.state = to;
            core.history.push(to);
            true
        } else {
            error!(
                unit = %self.name(),
                unit_id = %self.id(),
                error = %OpError::InvalidStateTransition { from: core.state, to },
                "Rejected state transition"
            );
            debug_assert!(false, "invalid state transition {} -> {}", core.state, to);
            false
        }
    }

    fn lock(&self) -> MutexGuard<'_, UnitCore> {
        self.inner.core.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for TaskUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskUnit")
            .field("id", self.id())
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

/// Handed to a work body while its unit is executing.
#[derive(Clone)]
pub struct ExecutionContext {
    unit: TaskUnit,
    queue: ExecutionQueue,
}

impl ExecutionContext {
    pub(crate) fn new(unit: TaskUnit, queue: ExecutionQueue) -> Self {
        Self { unit, queue }
    }

    /// The unit being executed.
    pub fn unit(&self) -> &TaskUnit {
        &self.unit
    }

    /// The queue running the unit.
    pub fn queue(&self) -> &ExecutionQueue {
        &self.queue
    }

    pub fn is_cancelled(&self) -> bool {
        self.unit.is_cancelled()
    }

    /// Resolves when the unit is cancelled. Long-running bodies should select on it.
    pub async fn cancelled(&self) {
        self.unit.cancellation().cancelled().await
    }

    /// Hand a new unit to the queue running this one.
    pub fn produce(&self, unit: TaskUnit) {
        self.unit.produce(&unit);
    }

    /// Finish the unit with zero or more errors.
    pub fn finish(&self, errors: Vec<OpError>) {
        self.unit.finish(errors);
    }

    pub fn finish_with_error(&self, error: Option<OpError>) {
        self.finish(error.into_iter().collect());
    }
}

/// Body that runs a closure and finishes with its result.
struct BlockBody<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> WorkBody for BlockBody<F>
where
    F: FnOnce(ExecutionContext) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), OpError>> + Send + 'static,
{
    async fn execute(self: Box<Self>, ctx: ExecutionContext) {
        if ctx.is_cancelled() {
            ctx.finish(Vec::new());
            return;
        }
        let result = (self.f)(ctx.clone()).await;
        ctx.finish_with_error(result.err());
    }
}
