//! Pending tasks handed out to polling runners.

use std::collections::VecDeque;

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::runner::model::{RunnerState, RunnerTask};

/// FIFO of tasks waiting for a runner.
#[derive(Default)]
pub struct TaskQueue {
    tasks: RwLock<VecDeque<RunnerTask>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, task: RunnerTask) {
        info!(task_id = %task.id, kind = %task.kind, memory_bytes = task.memory_bytes, "Task enqueued");
        self.tasks.write().await.push_back(task);
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }

    /// Take the oldest task the runner can serve.
    ///
    /// With a known state, a task fits when every one of its labels is
    /// carried by the runner and its memory does not exceed the runner's
    /// total. Without a state, the oldest task is handed out.
    pub async fn next_for(&self, runner_id: &str, state: Option<&RunnerState>) -> Option<RunnerTask> {
        let mut tasks = self.tasks.write().await;
        let index = match state {
            Some(state) => tasks.iter().position(|task| fits(task, state))?,
            None if tasks.is_empty() => return None,
            None => 0,
        };
        let task = tasks.remove(index)?;
        debug!(runner_id, task_id = %task.id, "Task assigned");
        Some(task)
    }
}

fn fits(task: &RunnerTask, state: &RunnerState) -> bool {
    task.memory_bytes <= state.total_memory
        && task
            .labels
            .iter()
            .all(|(key, value)| state.labels.get(key) == Some(value))
}
