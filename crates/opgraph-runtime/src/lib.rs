//! opgraph Runtime
//!
//! The scheduling engine built on tokio:
//! - `TaskUnit`: a cancellable, observable unit of work
//! - `ExecutionQueue`: runs units once dependencies finished and conditions passed
//! - `TaskGroup`: many units presented as one
//! - `TimedTaskCoordinator`: periodically injects provider output into a queue
//! - `ServiceRegistry`: explicit, lazily-built shared services
//! - `service`: fetch-then-process units for network responses

pub mod conditions;
pub mod config;
pub mod coordinator;
pub mod exclusivity;
pub mod group;
pub mod observers;
pub mod queue;
pub mod registry;
pub mod service;
mod slots;
pub mod unit;

// Re-export commonly used types
pub use conditions::{Condition, ConditionOutcome};
pub use config::{CoordinatorConfig, QueueConfig};
pub use coordinator::{TaskProvider, TimedTaskCoordinator};
pub use exclusivity::ExclusivityController;
pub use group::TaskGroup;
pub use observers::Observer;
pub use queue::{ExecutionQueue, QueueDelegate};
pub use registry::{ResolveError, ServiceRegistry};
pub use unit::{ExecutionContext, TaskUnit, WeakUnit, WorkBody};

pub use opgraph_core::{OpError, Priority, UnitEvent, UnitEventType, UnitId, UnitReport, UnitState};
