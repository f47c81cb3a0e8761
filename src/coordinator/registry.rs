//! Latest state reported by each runner.

use std::collections::HashMap;

use tokio::sync::RwLock;
use tracing::debug;

use crate::runner::model::RunnerState;

/// Last-write-wins snapshot per runner id. No history is kept.
#[derive(Default)]
pub struct RunnerRegistry {
    states: RwLock<HashMap<String, RunnerState>>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn update(&self, state: RunnerState) {
        debug!(
            runner_id = %state.runner_id,
            free_memory = state.free_memory,
            instances = state.model_instances.len(),
            "Runner state updated"
        );
        self.states.write().await.insert(state.runner_id.clone(), state);
    }

    pub async fn get(&self, runner_id: &str) -> Option<RunnerState> {
        self.states.read().await.get(runner_id).cloned()
    }

    /// All snapshots ordered by runner id.
    pub async fn list(&self) -> Vec<RunnerState> {
        let mut states: Vec<_> = self.states.read().await.values().cloned().collect();
        states.sort_by(|a, b| a.runner_id.cmp(&b.runner_id));
        states
    }
}
