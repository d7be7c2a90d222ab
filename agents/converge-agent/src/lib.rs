//! Converge Agent Library
//!
//! This crate provides the core functionality for the Converge host agent:
//! periodically fetching a desired configuration from the control service,
//! synchronizing policy bundles to disk, executing them in order, and
//! reporting output and applied revisions back.

pub mod agent;
pub mod cli;
pub mod connection;
pub mod runtime;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use agent::cycle::{CycleError, CycleOrchestrator, CycleSettings};
pub use agent::scheduler::{CycleRunner, Scheduler, SchedulerStats};
pub use agent::state::{CycleStage, StageTracker};
pub use cli::config::Config;
pub use connection::client::{ControlPlane, HttpControlPlane};
pub use connection::protocol::{AppliedConfiguration, DesiredConfiguration};
pub use connection::retry::{retry, RetryError, RetryPolicy};
pub use runtime::adapter::CommandRunner;
pub use runtime::process::ProcessRunner;
