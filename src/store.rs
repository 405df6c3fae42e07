//! Persistence collaborator interface
//!
//! The core writes ahead on every state transition and periodically
//! snapshots tasks, agents, graph edges and circuit breakers. Durability
//! is optional: the fabric is fully functional on the [`NoopStore`].
//! Restoring a snapshot and replaying post-snapshot records must produce
//! an identical in-memory state, modulo monotonic timestamps.

use crate::balancer::CircuitBreaker;
use crate::graph::DependencyEdge;
use crate::types::{Agent, AgentId, FabricError, FabricResult, Task, TaskId, TaskStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// One write-ahead record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum WalRecord {
    /// A task was created or changed state; the full record is written
    /// so replay is a plain upsert
    TaskUpserted {
        /// The task after the transition
        task: Box<Task>,
    },
    /// A task left the retention horizon
    TaskRemoved {
        /// Removed id
        id: TaskId,
        /// Status at removal time
        last_status: TaskStatus,
    },
    /// An agent registered or its record changed
    AgentUpserted {
        /// The agent after the change
        agent: Box<Agent>,
    },
    /// An agent was unregistered or evicted
    AgentRemoved {
        /// Removed id
        id: AgentId,
    },
    /// A circuit breaker changed state
    BreakerUpserted {
        /// Owning agent
        agent_id: AgentId,
        /// Breaker after the change
        breaker: CircuitBreaker,
    },
}

/// Full snapshot of the fabric's restorable state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// All tracked tasks
    pub tasks: Vec<Task>,
    /// All registered agents
    pub agents: Vec<Agent>,
    /// All dependency edges
    pub edges: Vec<DependencyEdge>,
    /// All circuit breakers with recorded outcomes
    pub breakers: Vec<(AgentId, CircuitBreaker)>,
    /// When the snapshot was taken
    pub taken_at: Option<DateTime<Utc>>,
}

/// Write-ahead store the core persists through
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Append one record to the log.
    async fn append(&self, record: WalRecord) -> FabricResult<()>;

    /// Replace the current snapshot and truncate the log.
    async fn write_snapshot(&self, snapshot: &StateSnapshot) -> FabricResult<()>;

    /// Load the latest snapshot plus post-snapshot records, if any state
    /// was ever persisted.
    async fn load(&self) -> FabricResult<Option<(StateSnapshot, Vec<WalRecord>)>>;
}

/// Store that drops everything; the durability-off default.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStore;

#[async_trait]
impl StateStore for NoopStore {
    async fn append(&self, _record: WalRecord) -> FabricResult<()> {
        Ok(())
    }

    async fn write_snapshot(&self, _snapshot: &StateSnapshot) -> FabricResult<()> {
        Ok(())
    }

    async fn load(&self) -> FabricResult<Option<(StateSnapshot, Vec<WalRecord>)>> {
        Ok(None)
    }
}

/// In-memory store for tests and single-process durability checks
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryStoreState>,
}

#[derive(Debug, Default)]
struct MemoryStoreState {
    snapshot: Option<StateSnapshot>,
    log: Vec<WalRecord>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of log records since the last snapshot.
    pub async fn log_len(&self) -> usize {
        self.inner.lock().await.log.len()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn append(&self, record: WalRecord) -> FabricResult<()> {
        // Round-trip through serde so anything unserializable fails here,
        // not in a real backend.
        let encoded = serde_json::to_vec(&record)
            .map_err(|e| FabricError::Internal(format!("wal encode: {e}")))?;
        let decoded: WalRecord = serde_json::from_slice(&encoded)
            .map_err(|e| FabricError::Internal(format!("wal decode: {e}")))?;
        self.inner.lock().await.log.push(decoded);
        Ok(())
    }

    async fn write_snapshot(&self, snapshot: &StateSnapshot) -> FabricResult<()> {
        let mut inner = self.inner.lock().await;
        inner.snapshot = Some(snapshot.clone());
        inner.log.clear();
        Ok(())
    }

    async fn load(&self) -> FabricResult<Option<(StateSnapshot, Vec<WalRecord>)>> {
        let inner = self.inner.lock().await;
        match &inner.snapshot {
            Some(snapshot) => Ok(Some((snapshot.clone(), inner.log.clone()))),
            None if !inner.log.is_empty() => {
                Ok(Some((StateSnapshot::default(), inner.log.clone())))
            }
            None => Ok(None),
        }
    }
}

/// Apply post-snapshot records to a snapshot, producing the state to
/// restore. Upserts replace by id; removals drop.
pub fn replay(mut snapshot: StateSnapshot, records: Vec<WalRecord>) -> StateSnapshot {
    for record in records {
        match record {
            WalRecord::TaskUpserted { task } => {
                match snapshot.tasks.iter_mut().find(|t| t.id == task.id) {
                    Some(slot) => *slot = *task,
                    None => snapshot.tasks.push(*task),
                }
            }
            WalRecord::TaskRemoved { id, .. } => {
                snapshot.tasks.retain(|t| t.id != id);
                snapshot.edges.retain(|e| e.from != id && e.to != id);
            }
            WalRecord::AgentUpserted { agent } => {
                match snapshot.agents.iter_mut().find(|a| a.id == agent.id) {
                    Some(slot) => *slot = *agent,
                    None => snapshot.agents.push(*agent),
                }
            }
            WalRecord::AgentRemoved { id } => {
                snapshot.agents.retain(|a| a.id != id);
            }
            WalRecord::BreakerUpserted { agent_id, breaker } => {
                match snapshot.breakers.iter_mut().find(|(id, _)| *id == agent_id) {
                    Some(slot) => slot.1 = breaker,
                    None => snapshot.breakers.push((agent_id, breaker)),
                }
            }
        }
    }
    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Priority, TaskCategory};
    use std::collections::HashSet;

    #[tokio::test]
    async fn memory_store_round_trips() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let task = Task::new("t", TaskCategory::Feature, Priority::Medium, now);
        let agent = Agent::new("a1".to_string(), HashSet::new(), 2, now);

        let snapshot = StateSnapshot {
            tasks: vec![task.clone()],
            agents: vec![agent],
            edges: Vec::new(),
            breakers: Vec::new(),
            taken_at: Some(now),
        };
        store.write_snapshot(&snapshot).await.unwrap();

        let mut updated = task;
        updated.title = "renamed".to_string();
        store
            .append(WalRecord::TaskUpserted {
                task: Box::new(updated.clone()),
            })
            .await
            .unwrap();

        let (loaded, log) = store.load().await.unwrap().unwrap();
        let replayed = replay(loaded, log);
        assert_eq!(replayed.tasks.len(), 1);
        assert_eq!(replayed.tasks[0].title, "renamed");
        assert_eq!(replayed.agents.len(), 1);
    }

    #[tokio::test]
    async fn snapshot_truncates_log() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let task = Task::new("t", TaskCategory::Feature, Priority::Medium, now);
        store
            .append(WalRecord::TaskUpserted {
                task: Box::new(task),
            })
            .await
            .unwrap();
        assert_eq!(store.log_len().await, 1);
        store.write_snapshot(&StateSnapshot::default()).await.unwrap();
        assert_eq!(store.log_len().await, 0);
    }

    #[tokio::test]
    async fn replay_applies_removals() {
        let now = Utc::now();
        let task = Task::new("t", TaskCategory::Feature, Priority::Medium, now);
        let id = task.id;
        let snapshot = StateSnapshot {
            tasks: vec![task],
            ..Default::default()
        };
        let replayed = replay(
            snapshot,
            vec![WalRecord::TaskRemoved {
                id,
                last_status: TaskStatus::Archived,
            }],
        );
        assert!(replayed.tasks.is_empty());
    }
}
