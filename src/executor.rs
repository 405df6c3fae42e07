//! Execution collaborator interface
//!
//! The core never runs task payloads itself. It hands `(task, agent)` to
//! an implementation of [`TaskExecutor`] together with an
//! [`ExecutionContext`] carrying the heartbeat channel, the deadline and
//! a cooperative cancel flag. Executors are expected to emit heartbeats
//! while work is in flight and to observe the cancel flag at suspension
//! points.

use crate::types::{Agent, FabricResult, Task, TaskId, TaskResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Liveness signal emitted by executors while a task runs
#[derive(Debug, Clone)]
pub struct Heartbeat {
    /// Task the heartbeat belongs to
    pub task_id: TaskId,
    /// When the executor produced it
    pub at: DateTime<Utc>,
}

/// Per-dispatch context handed to the executor
#[derive(Clone)]
pub struct ExecutionContext {
    /// Channel for liveness heartbeats
    pub heartbeat_tx: async_channel::Sender<Heartbeat>,
    /// Absolute deadline for the whole execution, if any
    pub deadline: Option<DateTime<Utc>>,
    /// Cooperative cancellation flag
    cancelled: Arc<AtomicBool>,
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("deadline", &self.deadline)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl ExecutionContext {
    /// Create a context with a fresh cancel flag.
    pub fn new(
        heartbeat_tx: async_channel::Sender<Heartbeat>,
        deadline: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            heartbeat_tx,
            deadline,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Request cooperative cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested; executors check this at
    /// suspension points and return a cancelled outcome.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Emit a heartbeat for `task_id`, stamped `at`.
    pub fn heartbeat(&self, task_id: TaskId, at: DateTime<Utc>) {
        let _ = self.heartbeat_tx.try_send(Heartbeat { task_id, at });
    }
}

/// The external collaborator that actually runs task payloads
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Execute `task` on `agent`. Implementations report the outcome in
    /// the returned [`TaskResult`]; transport-level problems (the agent
    /// is unreachable, the channel broke) surface as errors and are
    /// treated as retriable executor failures.
    async fn execute(
        &self,
        task: &Task,
        agent: &Agent,
        ctx: &ExecutionContext,
    ) -> FabricResult<TaskResult>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_flag_round_trips() {
        let (tx, _rx) = async_channel::unbounded();
        let ctx = ExecutionContext::new(tx, None);
        assert!(!ctx.is_cancelled());
        ctx.cancel();
        assert!(ctx.is_cancelled());
    }

    #[tokio::test]
    async fn heartbeats_reach_the_channel() {
        let (tx, rx) = async_channel::unbounded();
        let ctx = ExecutionContext::new(tx, None);
        let id = uuid::Uuid::new_v4();
        ctx.heartbeat(id, Utc::now());
        assert_eq!(rx.recv().await.unwrap().task_id, id);
    }
}
