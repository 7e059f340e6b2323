//! Scheduled Task Coordinator: periodically asks providers for work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError, Weak};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::CoordinatorConfig;
use crate::queue::ExecutionQueue;
use crate::registry::{ResolveError, ServiceRegistry};
use crate::unit::TaskUnit;

/// Manufactures recurring units on demand.
pub trait TaskProvider: Send + Sync {
    /// Providers are keyed by this; registering the same identifier twice
    /// replaces the earlier provider.
    fn identifier(&self) -> &str;

    fn make_scheduled_tasks(&self) -> Vec<TaskUnit>;
}

struct CoordinatorInner {
    queue: ExecutionQueue,
    config: CoordinatorConfig,
    providers: Mutex<Vec<Arc<dyn TaskProvider>>>,
    active: AtomicBool,
    ticker: Mutex<Option<JoinHandle<()>>>,
    /// Held for the duration of one tick.
    tick: Mutex<()>,
}

/// Injects provider output into an [`ExecutionQueue`] at a fixed cadence.
///
/// Starts paused. `resume()` fires once immediately and then every
/// `config.interval`.
#[derive(Clone)]
pub struct TimedTaskCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl TimedTaskCoordinator {
    pub fn new(queue: ExecutionQueue, config: CoordinatorConfig) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                queue,
                config,
                providers: Mutex::new(Vec::new()),
                active: AtomicBool::new(false),
                ticker: Mutex::new(None),
                tick: Mutex::new(()),
            }),
        }
    }

    /// Build a coordinator feeding the registry's shared queue.
    pub fn from_registry(
        registry: &ServiceRegistry,
        config: CoordinatorConfig,
    ) -> Result<Self, ResolveError> {
        let queue = registry.resolve::<ExecutionQueue>()?;
        Ok(Self::new(ExecutionQueue::clone(&queue), config))
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Start ticking. Must be called inside a tokio runtime.
    pub fn resume(&self) {
        self.inner.active.store(true, Ordering::SeqCst);

        let mut ticker = self.lock_ticker();
        if ticker.as_ref().is_some_and(|handle| !handle.is_finished()) {
            drop(ticker);
            // Already ticking; fire now like a fresh start would.
            self.schedule_tasks();
            return;
        }

        info!(
            interval_ms = self.inner.config.interval.as_millis() as u64,
            "Scheduled task coordinator resumed"
        );
        *ticker = Some(spawn_ticker(Arc::downgrade(&self.inner), self.inner.config.interval));
    }

    /// Stop ticking. Units already submitted keep running.
    pub fn pause(&self) {
        self.inner.active.store(false, Ordering::SeqCst);
        if let Some(handle) = self.lock_ticker().take() {
            handle.abort();
            info!("Scheduled task coordinator paused");
        }
    }

    /// Ask every provider for units and submit them. Returns the number of
    /// units submitted; zero while paused or when another tick is running.
    pub fn schedule_tasks(&self) -> usize {
        if !self.is_active() {
            return 0;
        }
        let _tick = match self.inner.tick.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
            Err(TryLockError::WouldBlock) => {
                warn!("Previous tick still running, skipping");
                return 0;
            }
        };

        let providers = self
            .inner
            .providers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let mut submitted = 0;
        for provider in providers {
            let units = provider.make_scheduled_tasks();
            if !units.is_empty() {
                debug!(provider = %provider.identifier(), units = units.len(), "Provider produced units");
            }
            for unit in units {
                self.inner.queue.submit(unit);
                submitted += 1;
            }
        }
        submitted
    }

    pub fn add_task_provider(&self, provider: Arc<dyn TaskProvider>) {
        let mut providers = self.inner.providers.lock().unwrap_or_else(|e| e.into_inner());
        providers.retain(|p| p.identifier() != provider.identifier());
        debug!(provider = %provider.identifier(), "Task provider registered");
        providers.push(provider);
    }

    pub fn remove_task_provider(&self, identifier: &str) {
        self.inner
            .providers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|p| p.identifier() != identifier);
    }

    pub fn provider_count(&self) -> usize {
        self.inner
            .providers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    fn lock_ticker(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.inner.ticker.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for CoordinatorInner {
    fn drop(&mut self) {
        if let Some(handle) = self
            .ticker
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
    }
}

fn spawn_ticker(inner: Weak<CoordinatorInner>, period: std::time::Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            // The first tick completes immediately.
            interval.tick().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            let submitted = TimedTaskCoordinator { inner }.schedule_tasks();
            debug!(submitted, "Coordinator tick");
        }
    })
}
