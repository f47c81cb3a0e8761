//! Coordinator side: accepts runner connections, hands out polled tasks and
//! routes replies back to requesters.

pub mod registry;
pub mod routes;
pub mod script;
pub mod store;
pub mod tasks;

use std::sync::Arc;

use axum::Router;

use crate::bus::{Bus, ReplyCorrelator};
use crate::config::CoordinatorConfig;
use crate::relay::QueueBridge;

pub use registry::RunnerRegistry;
pub use routes::{CoordinatorState, coordinator_routes};
pub use script::{Script, ScriptRequest};
pub use store::{AppConfig, AppRecord, MemoryStore, ScriptDefaults, Store};
pub use tasks::TaskQueue;

/// The coordinator service, wired to a bus and an application store.
pub struct Coordinator {
    state: CoordinatorState,
}

impl Coordinator {
    pub fn new(config: &CoordinatorConfig, bus: Arc<dyn Bus>, store: Arc<dyn Store>) -> Self {
        Self {
            state: CoordinatorState {
                bridge: QueueBridge::new(Arc::clone(&bus)),
                correlator: ReplyCorrelator::new(Arc::clone(&bus)),
                bus,
                tasks: Arc::new(TaskQueue::new()),
                registry: Arc::new(RunnerRegistry::new()),
                store,
                runner_token: config.runner_token.clone(),
                request_timeout: config.request_timeout,
            },
        }
    }

    pub fn router(&self) -> Router {
        coordinator_routes(self.state.clone())
    }

    pub fn bridge(&self) -> &Arc<QueueBridge> {
        &self.state.bridge
    }

    pub fn correlator(&self) -> &ReplyCorrelator {
        &self.state.correlator
    }

    pub fn tasks(&self) -> &Arc<TaskQueue> {
        &self.state.tasks
    }

    pub fn registry(&self) -> &Arc<RunnerRegistry> {
        &self.state.registry
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.state.store
    }

    /// Close every runner session through its normal teardown path.
    pub fn shutdown(&self) {
        self.state.bridge.shutdown();
    }
}
