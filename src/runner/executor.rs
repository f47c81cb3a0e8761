//! Task execution against an execution context.
//!
//! `CommandExecutor` runs an external program per task:
//! - The task payload is written to stdin
//! - stdout becomes the result payload
//! - A non-zero exit status fails the task with stderr as the reason
//! - Tasks exceeding the timeout, payload write included, are killed

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::instances::ExecutionContext;
use super::model::RunnerTask;
use crate::error::RunnerError;

/// Maximum stderr kept in a failure reason (4KB).
const MAX_ERROR_OUTPUT: usize = 4 * 1024;

/// Runs tasks inside execution contexts.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Prepare a freshly created context (load a model, warm a process).
    async fn start(&self, _context: &ExecutionContext) -> Result<(), RunnerError> {
        Ok(())
    }

    /// Run one task and return its result payload.
    async fn execute(
        &self,
        context: &ExecutionContext,
        task: &RunnerTask,
    ) -> Result<Bytes, RunnerError>;

    /// Release whatever `start` acquired.
    async fn stop(&self, _context: &ExecutionContext) -> Result<(), RunnerError> {
        Ok(())
    }
}

/// Executes each task by spawning a program.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandExecutor {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }
}

#[async_trait]
impl TaskExecutor for CommandExecutor {
    async fn execute(
        &self,
        context: &ExecutionContext,
        task: &RunnerTask,
    ) -> Result<Bytes, RunnerError> {
        let failed = |reason: String| RunnerError::ExecutionFailed {
            task_id: task.id,
            reason,
        };

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env("RUNNER_TASK_ID", task.id.to_string())
            .env("RUNNER_TASK_KIND", task.kind.to_string())
            .env("RUNNER_CONTEXT_ID", context.id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let run = async {
            let mut child = command
                .spawn()
                .map_err(|e| failed(format!("Failed to spawn {}: {}", self.program, e)))?;

            // stdin is fed while stdout is drained, otherwise a program that
            // streams output blocks on a full pipe and never reads the rest.
            let stdin = child.stdin.take();
            let payload = &task.payload;
            let feed = async move {
                let Some(mut stdin) = stdin else {
                    return Ok(());
                };
                match stdin.write_all(payload).await {
                    // A program that exits without reading its input is
                    // judged by its exit status, not by the broken pipe.
                    Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => Err(e),
                    _ => Ok(()),
                }
            };

            let (fed, output) = tokio::join!(feed, child.wait_with_output());
            fed.map_err(|e| failed(format!("Failed to write task payload: {e}")))?;
            Ok::<_, RunnerError>(output?)
        };

        // Dropping `run` on timeout kills the child.
        let output = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| RunnerError::ExecutionTimeout {
                task_id: task.id,
                timeout: self.timeout,
            })??;

        debug!(
            task_id = %task.id,
            status = %output.status,
            stdout_len = output.stdout.len(),
            "Task process exited"
        );

        if !output.status.success() {
            let mut stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            if stderr.len() > MAX_ERROR_OUTPUT {
                let mut end = MAX_ERROR_OUTPUT;
                while !stderr.is_char_boundary(end) {
                    end -= 1;
                }
                stderr.truncate(end);
            }
            return Err(failed(format!("{} ({})", stderr.trim(), output.status)));
        }

        Ok(Bytes::from(output.stdout))
    }
}
