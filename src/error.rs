//! Error types for the runner relay.

use std::time::Duration;

use uuid::Uuid;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Invalid memory size: {0}")]
    InvalidMemorySize(String),

    #[error("Invalid label {0:?}, expected key=value")]
    InvalidLabel(String),
}

/// Message bus errors.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("bus closed")]
    Closed,

    #[error("invalid subject {0:?}")]
    InvalidSubject(String),

    #[error("handler for {subject} failed: {reason}")]
    Handler { subject: String, reason: String },
}

/// Errors on the coordinator ↔ runner relay path.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("connection for runner {runner_id} is closed")]
    ConnectionClosed { runner_id: String },

    #[error("failed to write frame to runner {runner_id}: {reason}")]
    WriteFailed { runner_id: String, reason: String },

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("no reply on {subject} within {timeout:?}")]
    Timeout { subject: String, timeout: Duration },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Errors raised by the runner control loop.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error(
        "Not enough memory for task {task_id}: requires {required} bytes, {available} of {capacity} available"
    )]
    ResourceExhausted {
        task_id: Uuid,
        required: u64,
        available: u64,
        capacity: u64,
    },

    #[error("Execution context {id} not found")]
    ContextNotFound { id: Uuid },

    #[error("Task {task_id} execution failed: {reason}")]
    ExecutionFailed { task_id: Uuid, reason: String },

    #[error("Task {task_id} timed out after {timeout:?}")]
    ExecutionTimeout { task_id: Uuid, timeout: Duration },

    #[error("Coordinator request failed: {0}")]
    Coordinator(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Application store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("App {id} not found")]
    NotFound { id: String },

    #[error("App {id} already exists")]
    AlreadyExists { id: String },
}
