//! Execution contexts held by a runner and the pool that admits, reuses and
//! evicts them.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use super::model::{ContextState, ContextSummary, RunnerTask};
use crate::error::RunnerError;

/// A worker-local resource binding (e.g. a loaded model).
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub id: Uuid,
    pub memory_bytes: u64,
    pub labels: BTreeMap<String, String>,
    pub state: ContextState,
    pub last_active: Instant,
    pub created: DateTime<Utc>,
    pub tasks_served: u64,
}

impl ExecutionContext {
    fn for_task(task: &RunnerTask, now: Instant) -> Self {
        Self {
            id: Uuid::new_v4(),
            memory_bytes: task.memory_bytes,
            labels: task.labels.clone(),
            state: ContextState::Idle,
            last_active: now,
            created: Utc::now(),
            tasks_served: 0,
        }
    }

    /// Whether this context may serve `task` right now.
    pub fn matches(&self, task: &RunnerTask) -> bool {
        self.state == ContextState::Idle
            && self.labels == task.labels
            && self.memory_bytes >= task.memory_bytes
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_active)
    }

    pub fn summary(&self, now: Instant) -> ContextSummary {
        ContextSummary {
            id: self.id,
            memory_bytes: self.memory_bytes,
            labels: self.labels.clone(),
            state: self.state,
            created: self.created,
            idle_ms: self.idle_for(now).as_millis() as u64,
            tasks_served: self.tasks_served,
        }
    }
}

/// Result of dispatching a task onto the pool.
#[derive(Debug, Clone)]
pub struct Acquired {
    /// The context, already marked running.
    pub context: ExecutionContext,
    /// Whether the context was created for this task.
    pub created: bool,
}

/// All execution contexts of one runner, bounded by its declared memory.
///
/// Every context counts against capacity for as long as it exists, idle or
/// not; making room is the eviction task's job, never admission's.
#[derive(Debug)]
pub struct InstancePool {
    capacity: u64,
    contexts: Vec<ExecutionContext>,
}

impl InstancePool {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            contexts: Vec::new(),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn used_memory(&self) -> u64 {
        self.contexts.iter().map(|c| c.memory_bytes).sum()
    }

    pub fn free_memory(&self) -> u64 {
        self.capacity.saturating_sub(self.used_memory())
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub fn get(&self, id: Uuid) -> Option<&ExecutionContext> {
        self.contexts.iter().find(|c| c.id == id)
    }

    /// Select the first idle context matching `task`, or create one if the
    /// memory fits, and mark it running.
    pub fn acquire(&mut self, task: &RunnerTask, now: Instant) -> Result<Acquired, RunnerError> {
        if let Some(context) = self.contexts.iter_mut().find(|c| c.matches(task)) {
            context.state = ContextState::Running;
            context.last_active = now;
            debug!(context_id = %context.id, task_id = %task.id, "Reusing execution context");
            return Ok(Acquired {
                context: context.clone(),
                created: false,
            });
        }

        let used = self.used_memory();
        if used.saturating_add(task.memory_bytes) > self.capacity {
            return Err(RunnerError::ResourceExhausted {
                task_id: task.id,
                required: task.memory_bytes,
                available: self.capacity.saturating_sub(used),
                capacity: self.capacity,
            });
        }

        let mut context = ExecutionContext::for_task(task, now);
        context.state = ContextState::Running;
        info!(
            context_id = %context.id,
            task_id = %task.id,
            memory_bytes = context.memory_bytes,
            "Creating execution context"
        );
        self.contexts.push(context.clone());
        Ok(Acquired {
            context,
            created: true,
        })
    }

    /// Return a context to idle after a task finished.
    pub fn release(&mut self, id: Uuid, now: Instant) -> Result<(), RunnerError> {
        let context = self
            .contexts
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or(RunnerError::ContextNotFound { id })?;
        context.state = ContextState::Idle;
        context.last_active = now;
        context.tasks_served += 1;
        Ok(())
    }

    /// Mark a context as active without changing its state.
    #[cfg(test)]
    pub fn touch(&mut self, id: Uuid, now: Instant) -> Result<(), RunnerError> {
        let context = self
            .contexts
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or(RunnerError::ContextNotFound { id })?;
        context.last_active = now;
        Ok(())
    }

    /// Remove a context regardless of state. Used when a freshly created
    /// context fails to start.
    pub fn remove(&mut self, id: Uuid) -> Option<ExecutionContext> {
        let index = self.contexts.iter().position(|c| c.id == id)?;
        Some(self.contexts.remove(index))
    }

    /// Remove idle contexts unused for longer than `timeout`. Running
    /// contexts are never evicted.
    pub fn evict_idle(&mut self, timeout: Duration, now: Instant) -> Vec<ExecutionContext> {
        let (evicted, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.contexts)
            .into_iter()
            .partition(|c| c.state == ContextState::Idle && c.idle_for(now) > timeout);
        self.contexts = kept;

        for context in &evicted {
            info!(
                context_id = %context.id,
                idle_secs = context.idle_for(now).as_secs(),
                memory_bytes = context.memory_bytes,
                "Evicting idle execution context"
            );
        }
        evicted
    }

    /// Remove every context, for shutdown.
    pub fn drain(&mut self) -> Vec<ExecutionContext> {
        std::mem::take(&mut self.contexts)
    }

    pub fn summaries(&self, now: Instant) -> Vec<ContextSummary> {
        self.contexts.iter().map(|c| c.summary(now)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::WorkKind;

    const GB: u64 = 1_000_000_000;

    fn task(memory: u64) -> RunnerTask {
        RunnerTask::new(WorkKind::Script, "run").with_memory(memory)
    }

    #[test]
    fn creates_then_reuses_matching_context() {
        let mut pool = InstancePool::new(4 * GB);
        let now = Instant::now();

        let first = pool.acquire(&task(GB), now).unwrap();
        assert!(first.created);
        pool.release(first.context.id, now).unwrap();

        let second = pool.acquire(&task(GB), now).unwrap();
        assert!(!second.created);
        assert_eq!(second.context.id, first.context.id);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn running_context_is_not_reused() {
        let mut pool = InstancePool::new(4 * GB);
        let now = Instant::now();

        let first = pool.acquire(&task(GB), now).unwrap();
        let second = pool.acquire(&task(GB), now).unwrap();
        assert!(second.created);
        assert_ne!(first.context.id, second.context.id);
    }

    #[test]
    fn labels_must_match_as_a_whole() {
        let mut pool = InstancePool::new(4 * GB);
        let now = Instant::now();

        let a = pool
            .acquire(&task(GB).with_label("gpu", "a100"), now)
            .unwrap();
        pool.release(a.context.id, now).unwrap();

        let b = pool
            .acquire(&task(GB).with_label("gpu", "a100").with_label("zone", "eu"), now)
            .unwrap();
        assert!(b.created, "superset of labels is a different context");
    }

    #[test]
    fn admission_rejects_when_capacity_exceeded() {
        let mut pool = InstancePool::new(2 * GB);
        let now = Instant::now();
        pool.acquire(&task(GB), now).unwrap();

        let err = pool.acquire(&task(2 * GB), now).unwrap_err();
        match err {
            RunnerError::ResourceExhausted {
                required,
                available,
                capacity,
                ..
            } => {
                assert_eq!(required, 2 * GB);
                assert_eq!(available, GB);
                assert_eq!(capacity, 2 * GB);
            }
            other => panic!("expected ResourceExhausted, got {other:?}"),
        }
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn idle_context_still_counts_until_evicted() {
        // capacity 2GB, idle 1.5GB context with a 5s timeout, new 1GB task
        let mut pool = InstancePool::new(2 * GB);
        let start = Instant::now();
        let timeout = Duration::from_secs(5);

        let a = pool
            .acquire(&task(1_500_000_000).with_label("model", "a"), start)
            .unwrap();
        pool.release(a.context.id, start).unwrap();

        let at_3s = start + Duration::from_secs(3);
        assert!(pool.evict_idle(timeout, at_3s).is_empty());
        let rejected = pool.acquire(&task(GB).with_label("model", "b"), at_3s);
        assert!(matches!(rejected, Err(RunnerError::ResourceExhausted { .. })));

        let at_5s = start + Duration::from_millis(5_001);
        assert_eq!(pool.evict_idle(timeout, at_5s).len(), 1);
        let admitted = pool
            .acquire(&task(GB).with_label("model", "b"), at_5s)
            .unwrap();
        assert!(admitted.created);
        assert_eq!(pool.used_memory(), GB);
    }

    #[test]
    fn eviction_respects_timeout_and_touch() {
        let mut pool = InstancePool::new(4 * GB);
        let start = Instant::now();
        let timeout = Duration::from_secs(10);

        let a = pool.acquire(&task(GB), start).unwrap();
        pool.release(a.context.id, start).unwrap();

        // Touched just before the deadline, the timer restarts.
        pool.touch(a.context.id, start + Duration::from_millis(9_900))
            .unwrap();
        assert!(pool
            .evict_idle(timeout, start + Duration::from_millis(10_100))
            .is_empty());

        let evicted = pool.evict_idle(timeout, start + Duration::from_millis(20_000));
        assert_eq!(evicted.len(), 1);
        assert!(pool.is_empty());
        assert_eq!(pool.free_memory(), 4 * GB);
    }

    #[test]
    fn running_context_never_evicted() {
        let mut pool = InstancePool::new(4 * GB);
        let start = Instant::now();
        pool.acquire(&task(GB), start).unwrap();

        let evicted = pool.evict_idle(Duration::from_secs(1), start + Duration::from_secs(60));
        assert!(evicted.is_empty());
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn summaries_report_state() {
        let mut pool = InstancePool::new(4 * GB);
        let start = Instant::now();
        let a = pool.acquire(&task(GB), start).unwrap();
        pool.release(a.context.id, start).unwrap();

        let summaries = pool.summaries(start + Duration::from_millis(250));
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].state, ContextState::Idle);
        assert_eq!(summaries[0].idle_ms, 250);
        assert_eq!(summaries[0].tasks_served, 1);
    }
}
