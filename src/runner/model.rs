//! Task, result and state types shared by the runner and the coordinator.

use std::collections::BTreeMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::relay::envelope::{WorkKind, base64_bytes};

/// A unit of work handed to a runner by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerTask {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub kind: WorkKind,
    /// Memory the execution context for this task needs.
    #[serde(default)]
    pub memory_bytes: u64,
    /// Labels the execution context must carry, compared as a whole set.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Bus subject the result is published to.
    #[serde(default)]
    pub reply: String,
    #[serde(with = "base64_bytes", default)]
    pub payload: Bytes,
}

impl RunnerTask {
    pub fn new(kind: WorkKind, payload: impl Into<Bytes>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            memory_bytes: 0,
            labels: BTreeMap::new(),
            reply: String::new(),
            payload: payload.into(),
        }
    }

    pub fn with_memory(mut self, bytes: u64) -> Self {
        self.memory_bytes = bytes;
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = reply.into();
        self
    }
}

/// Outcome of one task, sent back to the coordinator and published on the
/// task's reply subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: Uuid,
    pub reply: String,
    #[serde(with = "base64_bytes", default)]
    pub payload: Bytes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskResult {
    pub fn success(task: &RunnerTask, payload: Bytes) -> Self {
        Self {
            task_id: task.id,
            reply: task.reply.clone(),
            payload,
            error: None,
        }
    }

    pub fn failure(task: &RunnerTask, error: impl Into<String>) -> Self {
        Self {
            task_id: task.id,
            reply: task.reply.clone(),
            payload: Bytes::new(),
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Lifecycle state of an execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextState {
    Idle,
    Running,
}

impl std::fmt::Display for ContextState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
        };
        write!(f, "{s}")
    }
}

/// Reported view of one execution context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextSummary {
    pub id: Uuid,
    pub memory_bytes: u64,
    pub labels: BTreeMap<String, String>,
    pub state: ContextState,
    pub created: DateTime<Utc>,
    /// Milliseconds since the context last started or finished a task.
    pub idle_ms: u64,
    pub tasks_served: u64,
}

/// Snapshot a runner pushes to the coordinator on every report tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerState {
    pub runner_id: String,
    pub created: DateTime<Utc>,
    pub total_memory: u64,
    pub free_memory: u64,
    pub labels: BTreeMap<String, String>,
    pub model_instances: Vec<ContextSummary>,
}
