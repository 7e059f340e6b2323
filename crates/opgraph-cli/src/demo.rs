//! Demo workloads driven by the CLI.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use tracing::info;

use opgraph_core::{OpError, Priority};
use opgraph_runtime::conditions::MutuallyExclusive;
use opgraph_runtime::observers::EventObserver;
use opgraph_runtime::service::{ResponsePayload, ResponseProcessor, ServiceRequest};
use opgraph_runtime::{QueueConfig, TaskGroup, TaskProvider, TaskUnit};

/// Simulated startup work.
#[derive(Debug, Clone)]
pub struct StepPlan {
    pub step: Duration,
    /// Name of a step that should fail, if any.
    pub fail_step: Option<String>,
}

impl StepPlan {
    fn unit(&self, name: &'static str, events: &EventObserver) -> TaskUnit {
        let step = self.step;
        let fails = self.fail_step.as_deref() == Some(name);
        let unit = TaskUnit::block(name, move |ctx| async move {
            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                _ = tokio::time::sleep(step) => {}
            }
            if fails {
                return Err(OpError::execution(format!("{name} failed")));
            }
            Ok(())
        });
        let _ = unit.add_observer(events.clone());
        unit
    }
}

/// The application startup sequence as one group:
///
/// ```text
/// appearance -> defaults -> environment -> continue
///                                             |
///                 upgrade-alert -> object-store -> gate
/// ```
///
/// `continue` only learns what to add once the environment is known. It adds
/// the remaining steps to the group and returns; the group waits for them.
/// `children` configures the group's own queue.
pub fn startup_sequence(plan: &StepPlan, events: &EventObserver, children: QueueConfig) -> TaskGroup {
    let appearance = plan.unit("configure-appearance", events);
    let defaults = plan.unit("register-defaults", events);
    let environment = plan.unit("initialize-environment", events);
    let _ = defaults.add_dependency(&appearance);
    let _ = environment.add_dependency(&defaults);

    let group = TaskGroup::with_config(
        "startup-sequence",
        children,
        [appearance, defaults, environment.clone()],
    );
    let _ = group.unit().add_observer(events.clone());
    let _ = group.unit().set_priority(Priority::UserInitiated);

    let handle = group.clone();
    let later = plan.clone();
    let later_events = events.clone();
    let resume = TaskUnit::block("continue-startup", move |_| async move {
        let upgrade = later.unit("upgrade-alert", &later_events);
        let store = later.unit("initialize-object-store", &later_events);
        let _ = store.add_condition(MutuallyExclusive::new("object-store"));
        let _ = store.add_dependency(&upgrade);

        let gate = later.unit("startup-gate", &later_events);
        let _ = gate.add_condition(MutuallyExclusive::new("startup-gate"));
        let _ = gate.add_dependency(&store);
        let _ = gate.on_finished(|errors| {
            info!(errors = errors.len(), "Startup gate passed");
        });

        handle.add(upgrade)?;
        handle.add(store)?;
        handle.add(gate)?;
        Ok(())
    });
    let _ = resume.add_dependency(&environment);
    let _ = resume.add_observer(events.clone());

    // The group has not started, so it accepts it.
    let _ = group.add(resume);
    group
}

/// Produces a fixed number of short refresh units per tick.
pub struct RefreshProvider {
    pub per_tick: usize,
    pub events: EventObserver,
}

impl TaskProvider for RefreshProvider {
    fn identifier(&self) -> &str {
        "refresh"
    }

    fn make_scheduled_tasks(&self) -> Vec<TaskUnit> {
        (0..self.per_tick)
            .map(|i| {
                let unit = TaskUnit::block(format!("refresh-{i}"), |_| async {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok(())
                });
                let _ = unit.set_priority(Priority::Background);
                let _ = unit.add_observer(self.events.clone());
                unit
            })
            .collect()
    }
}

/// Counts the bytes of a response; an empty body is "not processed".
pub struct ByteCounter;

#[async_trait]
impl ResponseProcessor for ByteCounter {
    async fn process(&self, request: &ServiceRequest, input: ResponsePayload) -> ResponsePayload {
        let total = match input {
            ResponsePayload::Bytes(bytes) => bytes.len(),
            ResponsePayload::Stream(mut stream) => {
                let mut total = 0;
                while let Some(chunk) = stream.next().await {
                    match chunk {
                        Ok(chunk) => total += chunk.len(),
                        Err(e) => return ResponsePayload::Error(e),
                    }
                }
                total
            }
            terminal => return terminal,
        };
        info!(url = %request.url, bytes = total, "Response processed");
        ResponsePayload::Processed(total > 0)
    }
}
