//! Dependency- and condition-aware concurrent executor.
//!
//! Every submitted unit gets a driver task that walks it through its
//! lifecycle: wait for dependencies, evaluate conditions, wait for a free
//! slot and its exclusive categories, run the body, and wait for finish.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures_util::future::join_all;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use opgraph_core::{OpError, UnitId, UnitState};

use crate::conditions;
use crate::config::QueueConfig;
use crate::exclusivity::{Claim, ExclusivityController};
use crate::observers::Observer;
use crate::slots::{SlotPermit, SlotPool};
use crate::unit::{ExecutionContext, TaskUnit};

/// Notified of every unit entering and leaving a queue.
pub trait QueueDelegate: Send + Sync {
    fn unit_submitted(&self, _queue: &ExecutionQueue, _unit: &TaskUnit) {}

    /// Called once the unit is `Finished`, before the queue stops counting it.
    fn unit_finished(&self, _queue: &ExecutionQueue, _unit: &TaskUnit, _errors: &[OpError]) {}
}

struct QueueInner {
    config: QueueConfig,
    slots: Arc<SlotPool>,
    units: Mutex<HashMap<UnitId, TaskUnit>>,
    active: watch::Sender<usize>,
    suspended: watch::Sender<bool>,
    exclusivity: Mutex<Arc<ExclusivityController>>,
    delegate: Mutex<Option<Arc<dyn QueueDelegate>>>,
    submitted: AtomicU64,
}

/// Runs submitted units once their dependencies finished and their
/// conditions passed, with bounded parallelism.
///
/// When every slot is taken, a freed slot goes to the waiting unit with the
/// highest priority, first come first served within the same priority.
///
/// Cloning yields another handle to the same queue. Submitting requires a
/// running tokio runtime.
#[derive(Clone)]
pub struct ExecutionQueue {
    inner: Arc<QueueInner>,
}

impl ExecutionQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self::with_exclusivity(config, Arc::new(ExclusivityController::new()))
    }

    /// Create a queue sharing an existing exclusivity controller.
    pub fn with_exclusivity(config: QueueConfig, exclusivity: Arc<ExclusivityController>) -> Self {
        let (active, _) = watch::channel(0);
        let (suspended, _) = watch::channel(config.start_suspended);
        Self {
            inner: Arc::new(QueueInner {
                slots: SlotPool::new(config.max_concurrent),
                config,
                units: Mutex::new(HashMap::new()),
                active,
                suspended,
                exclusivity: Mutex::new(exclusivity),
                delegate: Mutex::new(None),
                submitted: AtomicU64::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    pub fn exclusivity(&self) -> Arc<ExclusivityController> {
        self.inner
            .exclusivity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Switch to another exclusivity controller. Units that already hold
    /// categories keep them in the old controller until they finish.
    pub fn adopt_exclusivity(&self, controller: Arc<ExclusivityController>) {
        *self
            .inner
            .exclusivity
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = controller;
    }

    pub fn set_delegate(&self, delegate: Arc<dyn QueueDelegate>) {
        *self.inner.delegate.lock().unwrap_or_else(|e| e.into_inner()) = Some(delegate);
    }

    pub fn submit(&self, unit: TaskUnit) {
        self.submit_with_dependencies(unit, &[]);
    }

    /// Submit `unit`, first making it depend on `dependencies`.
    ///
    /// Prerequisite units supplied by the unit's conditions are added as
    /// dependencies and submitted here as well.
    pub fn submit_with_dependencies(&self, unit: TaskUnit, dependencies: &[TaskUnit]) {
        if unit.state() != UnitState::Initialized {
            error!(
                queue = %self.name(),
                unit = %unit.name(),
                state = %unit.state(),
                "Unit submitted more than once"
            );
            debug_assert!(false, "unit '{}' submitted more than once", unit.name());
            return;
        }

        for dependency in dependencies {
            if let Err(e) = unit.add_dependency(dependency) {
                warn!(unit = %unit.name(), error = %e, "Failed to add dependency");
            }
        }

        for condition in unit.conditions() {
            let Some(prerequisite) = condition.dependency_for(&unit) else {
                continue;
            };
            debug!(
                unit = %unit.name(),
                condition = %condition.name(),
                prerequisite = %prerequisite.name(),
                "Injecting condition prerequisite"
            );
            if unit.add_dependency(&prerequisite).is_ok()
                && prerequisite.state() == UnitState::Initialized
            {
                self.submit(prerequisite);
            }
        }

        let adoption = QueueAdoption {
            queue: Arc::downgrade(&self.inner),
        };
        if let Err(e) = unit.add_shared_observer(Arc::new(adoption)) {
            warn!(unit = %unit.name(), error = %e, "Failed to attach queue observer");
        }

        if !unit.will_enqueue() {
            return;
        }

        self.lock_units().insert(unit.id().clone(), unit.clone());
        self.inner.active.send_modify(|n| *n += 1);
        self.inner.submitted.fetch_add(1, Ordering::SeqCst);
        if let Some(delegate) = self.delegate() {
            delegate.unit_submitted(self, &unit);
        }

        debug!(
            queue = %self.name(),
            unit = %unit.name(),
            unit_id = %unit.id().short(),
            dependencies = unit.dependencies().len(),
            "Unit submitted"
        );

        let queue = self.clone();
        tokio::spawn(async move { queue.drive(unit).await });
    }

    /// Hold back execution of units that have not started yet.
    pub fn suspend(&self) {
        self.inner.suspended.send_replace(true);
    }

    pub fn resume(&self) {
        self.inner.suspended.send_replace(false);
    }

    pub fn is_suspended(&self) -> bool {
        *self.inner.suspended.borrow()
    }

    /// Units submitted and not yet finished.
    pub fn len(&self) -> usize {
        *self.inner.active.borrow()
    }

    pub fn is_idle(&self) -> bool {
        self.len() == 0
    }

    /// Total number of units ever submitted.
    pub fn submitted_count(&self) -> u64 {
        self.inner.submitted.load(Ordering::SeqCst)
    }

    /// Snapshot of the units currently held by the queue.
    pub fn units(&self) -> Vec<TaskUnit> {
        self.lock_units().values().cloned().collect()
    }

    /// Resolves once every submitted unit finished, including units submitted
    /// while waiting.
    pub async fn wait_until_idle(&self) {
        let mut rx = self.inner.active.subscribe();
        // `self` keeps the sender alive, so this cannot fail.
        let _ = rx.wait_for(|active| *active == 0).await;
    }

    pub fn cancel_all(&self) {
        let units = self.units();
        if !units.is_empty() {
            info!(queue = %self.name(), units = units.len(), "Cancelling all units");
        }
        for unit in units {
            unit.cancel();
        }
    }

    async fn drive(self, unit: TaskUnit) {
        self.advance(&unit).await;
        unit.finished().await;
        self.retire(&unit);
    }

    async fn advance(&self, unit: &TaskUnit) {
        let token = unit.cancellation().clone();

        let dependencies = unit.dependencies();
        if !dependencies.is_empty() {
            tokio::select! {
                biased;
                _ = token.cancelled() => {}
                _ = join_all(dependencies.iter().map(TaskUnit::finished)) => {}
            }
        }

        // Cancelled while pending: no evaluation, no execution.
        let Some(conditions) = unit.begin_condition_evaluation() else {
            unit.finish(Vec::new());
            return;
        };
        let failures = conditions::evaluate_all(&conditions, unit).await;
        unit.conditions_evaluated(failures);
        if unit.should_skip_execution() {
            unit.finish(Vec::new());
            return;
        }

        if !self.wait_while_suspended(&token).await {
            unit.finish(Vec::new());
            return;
        }

        debug_assert!(unit.is_ready());
        let categories = unit.exclusivity_categories();
        match self.acquire_slot(unit, &token, &categories).await {
            Some(permit) => self.execute(unit, permit).await,
            None => unit.finish(Vec::new()),
        }
    }

    async fn wait_while_suspended(&self, token: &CancellationToken) -> bool {
        let mut rx = self.inner.suspended.subscribe();
        tokio::select! {
            biased;
            _ = token.cancelled() => false,
            result = rx.wait_for(|suspended| !*suspended) => result.is_ok(),
        }
    }

    /// Wait for a worker slot and the unit's exclusive categories, then move
    /// the unit to `Executing`. Returns `None` if the unit was cancelled first.
    async fn acquire_slot(
        &self,
        unit: &TaskUnit,
        token: &CancellationToken,
        categories: &[String],
    ) -> Option<SlotPermit> {
        loop {
            let controller = self.exclusivity();
            let released = controller.released();
            tokio::pin!(released);
            released.as_mut().enable();

            let permit = tokio::select! {
                biased;
                _ = token.cancelled() => return None,
                permit = self.inner.slots.acquire(unit.priority()) => permit?,
            };

            match controller.try_claim(categories, unit.id(), || unit.begin_executing()) {
                Claim::Acquired(claim) => {
                    unit.hold_claim(claim);
                    return Some(permit);
                }
                Claim::Aborted => return None,
                Claim::Busy => {
                    drop(permit);
                    debug!(unit = %unit.name(), ?categories, "Waiting for exclusive category");
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => return None,
                        _ = &mut released => {}
                    }
                }
            }
        }
    }

    async fn execute(&self, unit: &TaskUnit, permit: SlotPermit) {
        info!(
            queue = %self.name(),
            unit = %unit.name(),
            unit_id = %unit.id().short(),
            priority = ?unit.priority(),
            "Unit started"
        );
        unit.notify_started();

        let Some(body) = unit.take_body() else {
            error!(unit = %unit.name(), "Unit has no work body");
            unit.finish(vec![OpError::execution("work body already consumed")]);
            return;
        };

        let ctx = ExecutionContext::new(unit.clone(), self.clone());
        if let Err(join_error) = tokio::spawn(body.execute(ctx)).await {
            if join_error.is_panic() {
                error!(unit = %unit.name(), "Work body panicked");
                unit.finish(vec![OpError::execution("work body panicked")]);
            }
        }

        if let Some(watchdog) = self.inner.config.finish_watchdog {
            if tokio::time::timeout(watchdog, unit.finished()).await.is_err() {
                warn!(
                    unit = %unit.name(),
                    unit_id = %unit.id().short(),
                    watchdog_ms = watchdog.as_millis() as u64,
                    "Work body returned but the unit has not finished"
                );
            }
        }
        unit.finished().await;
        drop(permit);
    }

    fn retire(&self, unit: &TaskUnit) {
        if let Some(delegate) = self.delegate() {
            delegate.unit_finished(self, unit, &unit.errors());
        }
        self.lock_units().remove(unit.id());
        self.inner.active.send_modify(|n| *n = n.saturating_sub(1));
    }

    fn delegate(&self) -> Option<Arc<dyn QueueDelegate>> {
        self.inner
            .delegate
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn lock_units(&self) -> MutexGuard<'_, HashMap<UnitId, TaskUnit>> {
        self.inner.units.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for ExecutionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionQueue")
            .field("name", &self.name())
            .field("active", &self.len())
            .field("suspended", &self.is_suspended())
            .finish()
    }
}

/// Submits units produced by a running unit to the queue that runs it.
struct QueueAdoption {
    queue: Weak<QueueInner>,
}

impl Observer for QueueAdoption {
    fn did_produce(&self, _unit: &TaskUnit, produced: &TaskUnit) {
        if let Some(inner) = self.queue.upgrade() {
            ExecutionQueue { inner }.submit(produced.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opgraph_core::Priority;
    use crate::conditions::{BlockCondition, DependencySuccessCondition, MutuallyExclusive};
    use crate::observers::{ActivityCounter, BlockObserver, TimeoutObserver};
    use rand::Rng;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;

    fn queue(max_concurrent: usize) -> ExecutionQueue {
        ExecutionQueue::new(QueueConfig::named("test").with_max_concurrent(max_concurrent))
    }

    fn counting_unit(name: &str, runs: Arc<AtomicUsize>) -> TaskUnit {
        TaskUnit::block(name, move |_| async move {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[tokio::test]
    async fn test_dependency_chain_runs_in_order() {
        let queue = queue(4);
        let order = Arc::new(Mutex::new(Vec::new()));

        let make = |name: &'static str| {
            let order = order.clone();
            TaskUnit::block(name, move |_| async move {
                order.lock().unwrap().push(name);
                Ok(())
            })
        };
        let a = make("a");
        let b = make("b");
        let c = make("c");

        // Submit out of order; dependencies decide.
        queue.submit_with_dependencies(c.clone(), &[b.clone()]);
        queue.submit_with_dependencies(b.clone(), &[a.clone()]);
        queue.submit(a.clone());

        c.finished().await;
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(queue.submitted_count(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_random_dag_respects_dependencies() {
        let queue = queue(8);
        let clock = Arc::new(AtomicUsize::new(0));
        let spans: Arc<Mutex<HashMap<usize, (usize, usize)>>> = Arc::new(Mutex::new(HashMap::new()));
        let mut rng = rand::thread_rng();

        let mut units = Vec::new();
        let mut edges = Vec::new();
        for i in 0..40 {
            let clock = clock.clone();
            let spans = spans.clone();
            let unit = TaskUnit::block(format!("node-{i}"), move |_| async move {
                let start = clock.fetch_add(1, Ordering::SeqCst);
                tokio::task::yield_now().await;
                let end = clock.fetch_add(1, Ordering::SeqCst);
                spans.lock().unwrap().insert(i, (start, end));
                Ok(())
            });
            for j in 0..i {
                if rng.gen_bool(0.15) {
                    unit.add_dependency(&units[j]).unwrap();
                    edges.push((j, i));
                }
            }
            units.push(unit);
        }

        // Reverse submission order so dependents are queued before their dependencies.
        for unit in units.iter().rev() {
            queue.submit(unit.clone());
        }
        queue.wait_until_idle().await;

        let spans = spans.lock().unwrap();
        assert_eq!(spans.len(), 40);
        for (dependency, dependent) in edges {
            let (_, dep_end) = spans[&dependency];
            let (start, _) = spans[&dependent];
            assert!(
                dep_end < start,
                "node-{dependent} started before node-{dependency} finished"
            );
        }
    }

    #[tokio::test]
    async fn test_failed_dependency_does_not_propagate() {
        let queue = queue(2);
        let y = TaskUnit::block("y", |_| async { Err(OpError::execution("E1")) });
        let runs = Arc::new(AtomicUsize::new(0));
        let x = counting_unit("x", runs.clone());

        queue.submit_with_dependencies(x.clone(), &[y.clone()]);
        queue.submit(y.clone());
        x.finished().await;

        assert!(y.failed());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!x.failed());
        assert!(x.errors().is_empty());
    }

    #[tokio::test]
    async fn test_dependency_success_condition_blocks_execution() {
        let queue = queue(2);
        let y = TaskUnit::block("y", |_| async { Err(OpError::execution("E1")) });
        let runs = Arc::new(AtomicUsize::new(0));
        let x = counting_unit("x", runs.clone());
        x.add_condition(DependencySuccessCondition::new()).unwrap();

        queue.submit(y.clone());
        queue.submit_with_dependencies(x.clone(), &[y.clone()]);
        x.finished().await;

        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(
            x.errors(),
            vec![OpError::DependencyFailed {
                dependency: "y".to_string()
            }]
        );
        assert!(x.report().started_at.is_none());
    }

    #[tokio::test]
    async fn test_cancel_before_pending_skips_everything() {
        let queue = queue(2);
        let evaluations = Arc::new(AtomicUsize::new(0));
        let runs = Arc::new(AtomicUsize::new(0));
        let finishes = Arc::new(Mutex::new(Vec::new()));

        let unit = counting_unit("cancelled", runs.clone());
        let counter = evaluations.clone();
        unit.add_condition(BlockCondition::new("counted", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        }))
        .unwrap();
        let seen = finishes.clone();
        unit.add_observer(BlockObserver::new().on_finish(move |_, errors| {
            seen.lock().unwrap().push(errors.to_vec());
        }))
        .unwrap();

        unit.cancel();
        queue.submit(unit.clone());
        unit.finished().await;

        assert_eq!(evaluations.load(Ordering::SeqCst), 0);
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(*finishes.lock().unwrap(), vec![vec![OpError::cancelled()]]);
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_on_dependency() {
        let queue = queue(2);
        let gate = TaskUnit::block("gate", |ctx| async move {
            ctx.cancelled().await;
            Ok(())
        });
        let runs = Arc::new(AtomicUsize::new(0));
        let waiting = counting_unit("waiting", runs.clone());

        queue.submit(gate.clone());
        queue.submit_with_dependencies(waiting.clone(), &[gate.clone()]);
        waiting.cancel_with_reason("no longer needed");
        waiting.finished().await;

        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(!gate.is_finished());
        gate.cancel();
        gate.finished().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_mutually_exclusive_units_never_overlap() {
        let queue = queue(8);
        let activity = ActivityCounter::new();
        let intervals = Arc::new(Mutex::new(Vec::new()));

        let mut units = Vec::new();
        for i in 0..8 {
            let intervals = intervals.clone();
            let unit = TaskUnit::block(format!("store-{i}"), move |_| async move {
                let start = std::time::Instant::now();
                tokio::time::sleep(Duration::from_millis(5)).await;
                intervals.lock().unwrap().push((start, std::time::Instant::now()));
                Ok(())
            });
            unit.add_condition(MutuallyExclusive::new("object-store")).unwrap();
            unit.add_observer(activity.observer()).unwrap();
            units.push(unit);
        }
        for unit in &units {
            queue.submit(unit.clone());
        }
        queue.wait_until_idle().await;

        assert_eq!(activity.peak(), 1);
        let mut intervals = intervals.lock().unwrap().clone();
        intervals.sort();
        for pair in intervals.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "exclusive intervals overlap");
        }
        assert_eq!(queue.exclusivity().held_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallelism_is_bounded() {
        let queue = queue(2);
        let activity = ActivityCounter::new();

        for i in 0..6 {
            let unit = TaskUnit::block(format!("sleep-{i}"), |_| async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(())
            });
            unit.add_observer(activity.observer()).unwrap();
            queue.submit(unit);
        }
        queue.wait_until_idle().await;

        assert!(activity.peak() <= 2, "peak was {}", activity.peak());
        assert_eq!(activity.active(), 0);
    }

    #[tokio::test]
    async fn test_condition_failure_skips_body() {
        let queue = queue(2);
        let runs = Arc::new(AtomicUsize::new(0));
        let unit = counting_unit("gated", runs.clone());
        unit.add_condition(BlockCondition::new("closed", |_| false)).unwrap();

        queue.submit(unit.clone());
        unit.finished().await;

        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(unit.failed());
        assert!(matches!(
            unit.errors().as_slice(),
            [OpError::ConditionFailed { condition, .. }] if condition == "closed"
        ));
    }

    #[tokio::test]
    async fn test_condition_prerequisite_runs_first() {
        let queue = queue(2);
        let granted = Arc::new(AtomicBool::new(false));

        let grant = granted.clone();
        let check = granted.clone();
        let condition = BlockCondition::new("permission", move |_| check.load(Ordering::SeqCst))
            .with_prerequisite(move |_| {
                let grant = grant.clone();
                Some(TaskUnit::block("request-permission", move |_| async move {
                    grant.store(true, Ordering::SeqCst);
                    Ok(())
                }))
            });

        let runs = Arc::new(AtomicUsize::new(0));
        let unit = counting_unit("needs-permission", runs.clone());
        unit.add_condition(condition).unwrap();

        queue.submit(unit.clone());
        unit.finished().await;

        assert_eq!(unit.dependencies().len(), 1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!unit.failed());
    }

    #[tokio::test]
    async fn test_produced_units_are_adopted() {
        let queue = queue(2);
        let runs = Arc::new(AtomicUsize::new(0));
        let produced_names = Arc::new(Mutex::new(Vec::new()));

        let child_runs = runs.clone();
        let parent = TaskUnit::block("parent", move |ctx| async move {
            ctx.produce(counting_unit("child", child_runs));
            Ok(())
        });
        let names = produced_names.clone();
        parent
            .add_observer(BlockObserver::new().on_produce(move |_, produced| {
                names.lock().unwrap().push(produced.name().to_string());
            }))
            .unwrap();

        queue.submit(parent);
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.wait_until_idle().await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(*produced_names.lock().unwrap(), vec!["child"]);
        assert_eq!(queue.submitted_count(), 2);
    }

    #[tokio::test]
    async fn test_suspended_queue_holds_execution() {
        let queue = ExecutionQueue::new(QueueConfig::named("held").suspended());
        let runs = Arc::new(AtomicUsize::new(0));
        let unit = counting_unit("held", runs.clone());

        queue.submit(unit.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(unit.state(), UnitState::Ready);
        assert!(queue.is_suspended());

        queue.resume();
        unit.finished().await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_while_executing_is_cooperative() {
        let queue = queue(2);
        let started = Arc::new(tokio::sync::Notify::new());
        let notify = started.clone();
        let unit = TaskUnit::block("long", move |ctx| async move {
            notify.notify_one();
            ctx.cancelled().await;
            Ok(())
        });

        queue.submit(unit.clone());
        started.notified().await;
        assert_eq!(unit.state(), UnitState::Executing);

        unit.cancel();
        unit.finished().await;
        assert_eq!(unit.errors(), vec![OpError::cancelled()]);
    }

    #[tokio::test]
    async fn test_continuation_body_finishes_later() {
        struct Deferred;

        #[async_trait::async_trait]
        impl crate::unit::WorkBody for Deferred {
            async fn execute(self: Box<Self>, ctx: ExecutionContext) {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    ctx.finish(vec![OpError::execution("late")]);
                });
            }
        }

        let queue = queue(1);
        let unit = TaskUnit::new("deferred", Deferred);
        queue.submit(unit.clone());
        unit.finished().await;

        assert_eq!(unit.errors(), vec![OpError::execution("late")]);
        queue.wait_until_idle().await;
    }

    #[tokio::test]
    async fn test_panicking_body_fails_unit() {
        let queue = queue(1);
        let unit = TaskUnit::block("panics", |_| async {
            if true {
                panic!("boom");
            }
            Ok(())
        });

        queue.submit(unit.clone());
        unit.finished().await;
        assert_eq!(unit.errors(), vec![OpError::execution("work body panicked")]);
    }

    #[tokio::test]
    async fn test_timeout_observer_cancels_unit() {
        let queue = queue(1);
        let unit = TaskUnit::block("slow", |ctx| async move {
            tokio::select! {
                _ = ctx.cancelled() => Ok(()),
                _ = tokio::time::sleep(Duration::from_secs(5)) => Ok(()),
            }
        });
        unit.add_observer(TimeoutObserver::new(Duration::from_millis(20)))
            .unwrap();

        queue.submit(unit.clone());
        unit.finished().await;
        assert_eq!(unit.errors(), vec![OpError::TimedOut { after_ms: 20 }]);
    }

    #[tokio::test]
    async fn test_delegate_sees_every_unit() {
        #[derive(Default)]
        struct Recorder {
            submitted: AtomicUsize,
            finished: Mutex<Vec<String>>,
        }

        impl QueueDelegate for Recorder {
            fn unit_submitted(&self, _queue: &ExecutionQueue, _unit: &TaskUnit) {
                self.submitted.fetch_add(1, Ordering::SeqCst);
            }

            fn unit_finished(&self, _queue: &ExecutionQueue, unit: &TaskUnit, _errors: &[OpError]) {
                self.finished.lock().unwrap().push(unit.name().to_string());
            }
        }

        let queue = queue(2);
        let recorder = Arc::new(Recorder::default());
        queue.set_delegate(recorder.clone());

        queue.submit(TaskUnit::noop("one"));
        queue.submit(TaskUnit::noop("two"));
        queue.wait_until_idle().await;

        assert_eq!(recorder.submitted.load(Ordering::SeqCst), 2);
        let mut finished = recorder.finished.lock().unwrap().clone();
        finished.sort();
        assert_eq!(finished, vec!["one", "two"]);
        assert!(queue.units().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_free_slot_goes_to_higher_priority() {
        let queue = queue(1);
        let order = Arc::new(Mutex::new(Vec::new()));
        let (release, hold) = tokio::sync::oneshot::channel::<()>();

        let blocker = TaskUnit::block("blocker", |_| async move {
            let _ = hold.await;
            Ok(())
        });
        queue.submit(blocker.clone());
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(blocker.state(), UnitState::Executing);

        let make = |name: &'static str, priority: Priority| {
            let order = order.clone();
            let unit = TaskUnit::block(name, move |_| async move {
                order.lock().unwrap().push(name);
                Ok(())
            });
            unit.set_priority(priority).unwrap();
            unit
        };
        queue.submit(make("bg", Priority::Background));
        queue.submit(make("default", Priority::Default));
        queue.submit(make("user", Priority::UserInitiated));
        // Paused clock: this only returns once every driver is parked on a slot.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(order.lock().unwrap().is_empty());

        let _ = release.send(());
        queue.wait_until_idle().await;
        assert_eq!(*order.lock().unwrap(), vec!["user", "default", "bg"]);
    }

    fn assert_legal_history(unit: &TaskUnit) {
        let history = unit.state_history();
        assert_eq!(history.first(), Some(&UnitState::Initialized));
        assert_eq!(
            history.last(),
            Some(&UnitState::Finished),
            "{} stopped at {:?}",
            unit.name(),
            history
        );
        for step in history.windows(2) {
            assert!(
                step[0].can_transition_to(step[1]),
                "{}: illegal {} -> {} in {:?}",
                unit.name(),
                step[0],
                step[1],
                history
            );
        }
    }

    async fn settle(unit: &TaskUnit) {
        tokio::time::timeout(Duration::from_secs(5), unit.finished())
            .await
            .unwrap_or_else(|_| panic!("{} never finished: {:?}", unit.name(), unit.state_history()));
    }

    async fn wait_for_state(unit: &TaskUnit, state: UnitState) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while unit.state() != state {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("{} never reached {state}", unit.name()));
    }

    #[tokio::test]
    async fn test_live_runs_follow_transition_table() {
        use UnitState::*;
        let queue = queue(2);

        let plain = TaskUnit::noop("plain");
        queue.submit(plain.clone());
        settle(&plain).await;
        assert_legal_history(&plain);
        assert_eq!(
            plain.state_history(),
            vec![Initialized, Pending, EvaluatingConditions, Ready, Executing, Finishing, Finished]
        );

        let cancelled = TaskUnit::noop("cancelled-early");
        cancelled.cancel();
        queue.submit(cancelled.clone());
        settle(&cancelled).await;
        assert_legal_history(&cancelled);
        assert_eq!(cancelled.state_history(), vec![Initialized, Pending, Finishing, Finished]);

        let gated = TaskUnit::noop("gated");
        gated.add_condition(BlockCondition::new("closed", |_| false)).unwrap();
        queue.submit(gated.clone());
        settle(&gated).await;
        assert_legal_history(&gated);
        assert_eq!(
            gated.state_history(),
            vec![Initialized, Pending, EvaluatingConditions, Ready, Finishing, Finished]
        );

        let failing = TaskUnit::block("failing", |_| async { Err(OpError::execution("E1")) });
        let clean = TaskUnit::noop("needs-clean");
        clean.add_condition(DependencySuccessCondition::new()).unwrap();
        queue.submit_with_dependencies(clean.clone(), &[failing.clone()]);
        queue.submit(failing.clone());
        settle(&clean).await;
        assert_legal_history(&failing);
        assert_legal_history(&clean);

        let running = TaskUnit::block("running", |ctx| async move {
            ctx.cancelled().await;
            Ok(())
        });
        queue.submit(running.clone());
        wait_for_state(&running, Executing).await;
        let waiting = TaskUnit::noop("waiting-on-dependency");
        queue.submit_with_dependencies(waiting.clone(), &[running.clone()]);
        waiting.cancel();
        settle(&waiting).await;
        running.cancel();
        settle(&running).await;
        assert_legal_history(&waiting);
        assert_legal_history(&running);
        assert_eq!(waiting.state_history(), vec![Initialized, Pending, Finishing, Finished]);

        let holder = TaskUnit::block("holder", |ctx| async move {
            ctx.cancelled().await;
            Ok(())
        });
        holder.add_condition(MutuallyExclusive::new("single")).unwrap();
        let contender = TaskUnit::noop("contender");
        contender.add_condition(MutuallyExclusive::new("single")).unwrap();
        queue.submit(holder.clone());
        wait_for_state(&holder, Executing).await;
        queue.submit(contender.clone());
        wait_for_state(&contender, Ready).await;
        contender.cancel();
        settle(&contender).await;
        holder.cancel();
        settle(&holder).await;
        assert_legal_history(&contender);
        assert_legal_history(&holder);
        assert!(!contender.state_history().contains(&Executing));
    }
}
