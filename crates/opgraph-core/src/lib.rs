//! opgraph Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - An async runtime
//! - Threads or locks
//! - Network access
//!
//! The engine in `opgraph-runtime` drives these types; the CLI renders them.

pub mod error;
pub mod event;
pub mod ids;
pub mod report;
pub mod state;

// Re-export commonly used types
pub use error::OpError;
pub use event::{UnitEvent, UnitEventType};
pub use ids::UnitId;
pub use report::UnitReport;
pub use state::{Priority, UnitState};
