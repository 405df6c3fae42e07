//! In-process typed event bus
//!
//! Publish/subscribe feed with at-least-once delivery. Each subscriber
//! gets its own unbounded channel; publication never blocks the control
//! loop and a closed subscriber is pruned instead of failing the bus.
//! Events for the same task are published under the owning component's
//! state lock, so per-task ordering follows transition ordering; across
//! tasks the bus may interleave.

use crate::clock::Clock;
use crate::types::{AgentId, MetadataValue, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Kinds of events the fabric emits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A task was created
    TaskCreated,
    /// A task entered the queue
    TaskQueued,
    /// A task was bound to an agent
    TaskAssigned,
    /// An agent reported task start
    TaskStarted,
    /// A task completed successfully
    TaskCompleted,
    /// A task failed (possibly pending retry)
    TaskFailed,
    /// A task was cancelled
    TaskCancelled,
    /// An agent registered
    AgentRegistered,
    /// An agent missed heartbeats and went offline
    AgentDisconnected,
    /// A task or agent changed status
    StatusChanged,
    /// The health monitor flagged an issue
    IssueDetected,
    /// A recovery action started executing
    RecoveryStarted,
    /// A recovery action finished
    RecoveryCompleted,
    /// An SLA threshold was crossed
    SlaViolation,
    /// A significant metric trend was detected
    TrendDetected,
    /// The load balancer moved work between agents
    LoadBalanced,
    /// A handler or component error that was contained
    InternalError,
}

/// A single event on the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// What happened
    pub kind: EventKind,
    /// When it happened
    pub at: DateTime<Utc>,
    /// Subject task, if any
    pub task_id: Option<TaskId>,
    /// Subject agent, if any
    pub agent_id: Option<AgentId>,
    /// Free-form typed metadata
    pub metadata: HashMap<String, MetadataValue>,
}

impl Event {
    /// Build an event with empty metadata.
    pub fn new(kind: EventKind, at: DateTime<Utc>) -> Self {
        Self {
            kind,
            at,
            task_id: None,
            agent_id: None,
            metadata: HashMap::new(),
        }
    }

    /// Attach a subject task.
    pub fn task(mut self, id: TaskId) -> Self {
        self.task_id = Some(id);
        self
    }

    /// Attach a subject agent.
    pub fn agent(mut self, id: impl Into<AgentId>) -> Self {
        self.agent_id = Some(id.into());
        self
    }

    /// Attach one metadata entry.
    pub fn meta(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Fan-out bus with one queue per subscriber
pub struct EventBus {
    clock: Arc<dyn Clock>,
    subscribers: RwLock<Vec<async_channel::Sender<Event>>>,
}

impl EventBus {
    /// Create a bus stamping events with the given clock.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Subscribe to all events. The receiver buffers without bound; a
    /// dropped receiver is pruned on the next publish.
    pub async fn subscribe(&self) -> async_channel::Receiver<Event> {
        let (tx, rx) = async_channel::unbounded();
        self.subscribers.write().await.push(tx);
        rx
    }

    /// Publish an event to every live subscriber.
    pub async fn publish(&self, event: Event) {
        let mut subscribers = self.subscribers.write().await;
        subscribers.retain(|tx| tx.try_send(event.clone()).is_ok());
        debug!(kind = ?event.kind, subscribers = subscribers.len(), "event published");
    }

    /// Build and publish an event stamped with the bus clock.
    pub async fn emit(&self, kind: EventKind) -> Event {
        let event = Event::new(kind, self.clock.now());
        self.publish(event.clone()).await;
        event
    }

    /// Number of live subscribers; pruning happens on publish.
    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }
}
