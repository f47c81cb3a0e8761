//! Worker side: poll the coordinator, run tasks in execution contexts,
//! report state and evict idle contexts.

pub mod client;
pub mod control;
pub mod executor;
pub mod instances;
pub mod model;
pub mod server;

pub use client::{CoordinatorClient, HttpCoordinatorClient};
pub use control::{Runner, RunnerPhase};
pub use executor::{CommandExecutor, TaskExecutor};
pub use instances::{Acquired, ExecutionContext, InstancePool};
pub use model::{ContextState, ContextSummary, RunnerState, RunnerTask, TaskResult};
pub use server::runner_routes;
