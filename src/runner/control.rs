//! Runner control loop.
//!
//! Three independent tasks share one [`InstancePool`]:
//! - the poller asks the coordinator for work every `poll_interval` and runs it
//! - the reporter pushes a [`RunnerState`] snapshot every `report_interval`
//! - the reaper destroys contexts idle for longer than `idle_timeout`
//!
//! A slow or failing coordinator on one path never stalls the others.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::client::CoordinatorClient;
use super::executor::TaskExecutor;
use super::instances::{ExecutionContext, InstancePool};
use super::model::{RunnerState, RunnerTask, TaskResult};
use crate::config::RunnerConfig;
use crate::error::RunnerError;

/// Where the poller currently is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerPhase {
    Idle,
    Requesting,
    Dispatching,
    Executing,
    Reporting,
}

impl std::fmt::Display for RunnerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Requesting => "requesting",
            Self::Dispatching => "dispatching",
            Self::Executing => "executing",
            Self::Reporting => "reporting",
        };
        write!(f, "{s}")
    }
}

/// A worker process: polls for tasks, runs them in execution contexts and
/// keeps the coordinator informed.
pub struct Runner {
    config: RunnerConfig,
    client: Arc<dyn CoordinatorClient>,
    executor: Arc<dyn TaskExecutor>,
    pool: Mutex<InstancePool>,
    phase: parking_lot::Mutex<RunnerPhase>,
    created: DateTime<Utc>,
    shutdown: CancellationToken,
}

impl Runner {
    pub fn new(
        config: RunnerConfig,
        client: Arc<dyn CoordinatorClient>,
        executor: Arc<dyn TaskExecutor>,
    ) -> Arc<Self> {
        let pool = InstancePool::new(config.memory_bytes);
        Arc::new(Self {
            config,
            client,
            executor,
            pool: Mutex::new(pool),
            phase: parking_lot::Mutex::new(RunnerPhase::Idle),
            created: Utc::now(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn phase(&self) -> RunnerPhase {
        *self.phase.lock()
    }

    fn set_phase(&self, phase: RunnerPhase) {
        *self.phase.lock() = phase;
    }

    /// First contact with the coordinator. A runner that cannot report its
    /// state once should not start polling.
    pub async fn initialize(&self) -> Result<(), RunnerError> {
        self.report_once().await?;
        info!(
            runner_id = %self.config.runner_id,
            memory_bytes = self.config.memory_bytes,
            labels = ?self.config.labels,
            "Runner registered with coordinator"
        );
        Ok(())
    }

    /// Current snapshot of this runner.
    pub async fn state(&self) -> RunnerState {
        let pool = self.pool.lock().await;
        RunnerState {
            runner_id: self.config.runner_id.clone(),
            created: self.created,
            total_memory: pool.capacity(),
            free_memory: pool.free_memory(),
            labels: self.config.labels.clone(),
            model_instances: pool.summaries(Instant::now()),
        }
    }

    pub async fn report_once(&self) -> Result<(), RunnerError> {
        let state = self.state().await;
        self.client.report_state(&state).await
    }

    /// Request one task and run it to completion.
    ///
    /// Returns `Ok(false)` when the coordinator had nothing to hand out.
    /// Task failures are reported to the coordinator as failed results and
    /// do not surface here.
    pub async fn run_once(&self) -> Result<bool, RunnerError> {
        self.set_phase(RunnerPhase::Requesting);
        let task = match self.client.next_task(&self.config.runner_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                self.set_phase(RunnerPhase::Idle);
                return Ok(false);
            }
            Err(e) => {
                self.set_phase(RunnerPhase::Idle);
                return Err(e);
            }
        };

        debug!(task_id = %task.id, kind = %task.kind, memory_bytes = task.memory_bytes, "Received task");
        let result = self.dispatch(&task).await;

        self.set_phase(RunnerPhase::Reporting);
        if let Err(e) = self
            .client
            .submit_result(&self.config.runner_id, &result)
            .await
        {
            warn!(task_id = %task.id, error = %e, "Failed to submit task result");
        }
        self.set_phase(RunnerPhase::Idle);
        Ok(true)
    }

    async fn dispatch(&self, task: &RunnerTask) -> TaskResult {
        self.set_phase(RunnerPhase::Dispatching);
        let acquired = self.pool.lock().await.acquire(task, Instant::now());
        let acquired = match acquired {
            Ok(acquired) => acquired,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Task rejected");
                return TaskResult::failure(task, e.to_string());
            }
        };
        let context = acquired.context;

        if acquired.created {
            if let Err(e) = self.executor.start(&context).await {
                error!(context_id = %context.id, error = %e, "Failed to start execution context");
                self.pool.lock().await.remove(context.id);
                return TaskResult::failure(task, e.to_string());
            }
        }

        self.set_phase(RunnerPhase::Executing);
        let outcome = self.executor.execute(&context, task).await;

        if let Err(e) = self.pool.lock().await.release(context.id, Instant::now()) {
            warn!(context_id = %context.id, error = %e, "Failed to release execution context");
        }

        match outcome {
            Ok(payload) => {
                info!(task_id = %task.id, context_id = %context.id, bytes = payload.len(), "Task completed");
                TaskResult::success(task, payload)
            }
            Err(e) => {
                warn!(task_id = %task.id, context_id = %context.id, error = %e, "Task failed");
                TaskResult::failure(task, e.to_string())
            }
        }
    }

    /// Destroy contexts idle for longer than the configured timeout.
    /// Returns how many were destroyed.
    pub async fn evict_idle(&self) -> usize {
        let evicted = self
            .pool
            .lock()
            .await
            .evict_idle(self.config.idle_timeout, Instant::now());
        let count = evicted.len();
        self.destroy(evicted).await;
        count
    }

    async fn destroy(&self, contexts: Vec<ExecutionContext>) {
        for context in contexts {
            if let Err(e) = self.executor.stop(&context).await {
                warn!(context_id = %context.id, error = %e, "Failed to stop execution context");
            }
        }
    }

    /// Run the poller, reporter and reaper until [`Runner::shutdown`] is
    /// called, then destroy every remaining context.
    pub async fn run(self: Arc<Self>) {
        let poller = {
            let runner = Arc::clone(&self);
            self.spawn_ticker("poller", self.config.poll_interval, move || {
                let runner = Arc::clone(&runner);
                async move {
                    if let Err(e) = runner.run_once().await {
                        warn!(error = %e, "Failed to fetch next task");
                    }
                }
            })
        };
        let reporter = {
            let runner = Arc::clone(&self);
            self.spawn_ticker("reporter", self.config.report_interval, move || {
                let runner = Arc::clone(&runner);
                async move {
                    if let Err(e) = runner.report_once().await {
                        warn!(error = %e, "Failed to report state");
                    }
                }
            })
        };
        let reaper = {
            let runner = Arc::clone(&self);
            self.spawn_ticker("reaper", self.config.eviction_interval, move || {
                let runner = Arc::clone(&runner);
                async move {
                    runner.evict_idle().await;
                }
            })
        };

        info!(runner_id = %self.config.runner_id, "Runner started");
        for handle in [poller, reporter, reaper] {
            if let Err(e) = handle.await {
                error!(error = %e, "Runner task panicked");
            }
        }

        let remaining = self.pool.lock().await.drain();
        info!(contexts = remaining.len(), "Destroying execution contexts");
        self.destroy(remaining).await;
        self.set_phase(RunnerPhase::Idle);
    }

    /// Stop every runner task. Work in flight is abandoned.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn spawn_ticker<F, Fut>(&self, name: &'static str, period: Duration, mut tick: F) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = async {
                        interval.tick().await;
                        tick().await;
                    } => {}
                }
            }
            debug!(task = name, "Runner task stopped");
        })
    }
}
