//! Agent registry
//!
//! Maintains the set of known agents, indexes them by capability, tracks
//! liveness via heartbeats, and ranks candidates for discovery queries.
//! All state lives behind one lock so selection reads see a consistent
//! snapshot of headroom and liveness.

use crate::clock::Clock;
use crate::event_bus::{Event, EventBus, EventKind};
use crate::types::{
    Agent, AgentId, AgentStatus, FabricError, FabricResult, TaskId,
};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Registry tuning knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Agents silent for longer than this are marked Offline
    pub heartbeat_timeout_ms: u64,
    /// Offline agents silent for longer than this are unregistered
    pub eviction_timeout_ms: u64,
    /// Discovery ranking weight: capability match ratio
    pub weight_capability: f64,
    /// Discovery ranking weight: free capacity fraction
    pub weight_headroom: f64,
    /// Discovery ranking weight: historical success rate
    pub weight_success: f64,
    /// Discovery ranking weight: heartbeat recency
    pub weight_recency: f64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: 60_000,
            eviction_timeout_ms: 3_600_000,
            weight_capability: 0.4,
            weight_headroom: 0.3,
            weight_success: 0.2,
            weight_recency: 0.1,
        }
    }
}

/// Stats an agent reports with each heartbeat
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatStats {
    /// Tasks the agent believes it is running
    pub running_tasks: usize,
    /// Optional self-reported load in [0, 1]
    pub reported_load: Option<f64>,
}

/// Discovery query for capability-matched agents
#[derive(Debug, Clone, Default)]
pub struct AgentQuery {
    /// Capabilities the agent must have; non-matching agents are dropped
    pub required_capabilities: HashSet<String>,
    /// Capabilities that improve the ranking but are not mandatory
    pub preferred_capabilities: HashSet<String>,
    /// Agents never returned
    pub exclude: HashSet<AgentId>,
    /// Agents ranked above equal-scoring peers
    pub prefer: HashSet<AgentId>,
    /// Drop agents below this success rate
    pub min_success_rate: Option<f64>,
    /// Drop agents with zero free slots
    pub require_headroom: bool,
}

/// One ranked discovery result
#[derive(Debug, Clone)]
pub struct AgentCandidate {
    /// The agent snapshot at ranking time
    pub agent: Agent,
    /// Composite ranking score, higher is better
    pub score: f64,
}

#[derive(Debug, Default)]
struct RegistryState {
    agents: HashMap<AgentId, Agent>,
    capability_index: HashMap<String, HashSet<AgentId>>,
}

/// Agent registry and capability index
pub struct AgentRegistry {
    config: RegistryConfig,
    clock: Arc<dyn Clock>,
    bus: Arc<EventBus>,
    state: RwLock<RegistryState>,
}

impl AgentRegistry {
    /// Create an empty registry.
    pub fn new(config: RegistryConfig, clock: Arc<dyn Clock>, bus: Arc<EventBus>) -> Self {
        Self {
            config,
            clock,
            bus,
            state: RwLock::new(RegistryState::default()),
        }
    }

    /// Register an agent, or update capabilities and capacity if the id
    /// is already known. Returns the stored record.
    pub async fn register(
        &self,
        id: AgentId,
        capabilities: HashSet<String>,
        max_concurrent_tasks: usize,
    ) -> FabricResult<Agent> {
        if id.is_empty() {
            return Err(FabricError::Validation("agent id must not be empty".into()));
        }
        if max_concurrent_tasks == 0 {
            return Err(FabricError::Validation(format!(
                "agent {id} must allow at least one concurrent task"
            )));
        }
        let now = self.clock.now();
        let mut guard = self.state.write().await;
        let state = &mut *guard;

        let agent = match state.agents.get_mut(&id) {
            Some(existing) => {
                // Idempotent re-registration: refresh capabilities, keep
                // performance history and in-flight assignments.
                for cap in &existing.capabilities {
                    if let Some(set) = state.capability_index.get_mut(cap) {
                        set.remove(&id);
                    }
                }
                existing.capabilities = capabilities.clone();
                existing.max_concurrent_tasks = max_concurrent_tasks;
                existing.last_heartbeat_at = now;
                if existing.status == AgentStatus::Offline {
                    existing.status = AgentStatus::Idle;
                }
                existing.refresh_load_status();
                debug!(agent = %id, "agent re-registered");
                existing.clone()
            }
            None => {
                let agent = Agent::new(id.clone(), capabilities.clone(), max_concurrent_tasks, now);
                state.agents.insert(id.clone(), agent.clone());
                info!(agent = %id, capabilities = capabilities.len(), "agent registered");
                agent
            }
        };
        for cap in &capabilities {
            state
                .capability_index
                .entry(cap.clone())
                .or_default()
                .insert(id.clone());
        }
        drop(guard);

        self.bus
            .publish(Event::new(EventKind::AgentRegistered, now).agent(id))
            .await;
        Ok(agent)
    }

    /// Remove an agent permanently.
    pub async fn unregister(&self, id: &AgentId) -> FabricResult<Agent> {
        let mut state = self.state.write().await;
        let mut agent = state
            .agents
            .remove(id)
            .ok_or_else(|| FabricError::NotFound(format!("agent {id}")))?;
        for cap in &agent.capabilities {
            if let Some(set) = state.capability_index.get_mut(cap) {
                set.remove(id);
            }
        }
        agent.status = AgentStatus::Terminated;
        info!(agent = %id, "agent unregistered");
        Ok(agent)
    }

    /// Record a heartbeat. Offline agents come back as Idle/Active.
    pub async fn heartbeat(&self, id: &AgentId, stats: HeartbeatStats) -> FabricResult<()> {
        let now = self.clock.now();
        let mut state = self.state.write().await;
        let agent = state
            .agents
            .get_mut(id)
            .ok_or_else(|| FabricError::NotFound(format!("agent {id}")))?;
        agent.last_heartbeat_at = now;
        if agent.status == AgentStatus::Offline {
            info!(agent = %id, "agent back online");
            agent.status = AgentStatus::Idle;
            agent.refresh_load_status();
        }
        if stats.running_tasks != agent.current_tasks.len() {
            debug!(
                agent = %id,
                reported = stats.running_tasks,
                tracked = agent.current_tasks.len(),
                "heartbeat task count differs from registry view"
            );
        }
        Ok(())
    }

    /// Fetch one agent by id.
    pub async fn get(&self, id: &AgentId) -> FabricResult<Agent> {
        self.state
            .read()
            .await
            .agents
            .get(id)
            .cloned()
            .ok_or_else(|| FabricError::NotFound(format!("agent {id}")))
    }

    /// Snapshot of all agents.
    pub async fn list(&self) -> Vec<Agent> {
        self.state.read().await.agents.values().cloned().collect()
    }

    /// Rank live agents against a query.
    pub async fn discover(&self, query: &AgentQuery) -> Vec<AgentCandidate> {
        let now = self.clock.now();
        let state = self.state.read().await;
        let mut candidates: Vec<AgentCandidate> = state
            .agents
            .values()
            .filter(|a| !query.exclude.contains(&a.id))
            .filter(|a| {
                !matches!(
                    a.status,
                    AgentStatus::Offline | AgentStatus::Error | AgentStatus::Terminated
                )
            })
            .filter(|a| a.has_capabilities(&query.required_capabilities))
            .filter(|a| {
                query
                    .min_success_rate
                    .map_or(true, |min| a.performance.success_rate >= min)
            })
            .filter(|a| !query.require_headroom || a.headroom() > 0)
            .map(|a| {
                let capability = if query.preferred_capabilities.is_empty() {
                    1.0
                } else {
                    let hits = query
                        .preferred_capabilities
                        .iter()
                        .filter(|c| a.capabilities.contains(*c))
                        .count();
                    hits as f64 / query.preferred_capabilities.len() as f64
                };
                let headroom = 1.0 - a.load();
                let recency = {
                    let silent_ms = (now - a.last_heartbeat_at).num_milliseconds().max(0) as f64;
                    let timeout = self.config.heartbeat_timeout_ms as f64;
                    (1.0 - silent_ms / timeout).clamp(0.0, 1.0)
                };
                let mut score = self.config.weight_capability * capability
                    + self.config.weight_headroom * headroom
                    + self.config.weight_success * a.performance.success_rate
                    + self.config.weight_recency * recency;
                if query.prefer.contains(&a.id) {
                    score += 0.05;
                }
                AgentCandidate {
                    agent: a.clone(),
                    score,
                }
            })
            .collect();
        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.agent.id.cmp(&b.agent.id))
        });
        candidates
    }

    /// Bind a task to an agent, consuming one slot.
    pub async fn assign_task(&self, id: &AgentId, task: TaskId) -> FabricResult<()> {
        let mut state = self.state.write().await;
        let agent = state
            .agents
            .get_mut(id)
            .ok_or_else(|| FabricError::NotFound(format!("agent {id}")))?;
        if agent.headroom() == 0 {
            return Err(FabricError::ResourceExhausted(format!(
                "agent {id} is at capacity ({})",
                agent.max_concurrent_tasks
            )));
        }
        agent.current_tasks.insert(task);
        agent.refresh_load_status();
        debug!(agent = %id, %task, load = agent.load(), "task assigned");
        Ok(())
    }

    /// Release a task slot without recording an outcome (requeue paths).
    pub async fn release_task(&self, id: &AgentId, task: &TaskId) -> FabricResult<()> {
        let mut state = self.state.write().await;
        let agent = state
            .agents
            .get_mut(id)
            .ok_or_else(|| FabricError::NotFound(format!("agent {id}")))?;
        agent.current_tasks.remove(task);
        agent.refresh_load_status();
        Ok(())
    }

    /// Release a task slot and fold the outcome into performance figures.
    pub async fn record_completion(
        &self,
        id: &AgentId,
        task: &TaskId,
        success: bool,
        duration_ms: u64,
    ) -> FabricResult<()> {
        let mut state = self.state.write().await;
        let agent = state
            .agents
            .get_mut(id)
            .ok_or_else(|| FabricError::NotFound(format!("agent {id}")))?;
        agent.current_tasks.remove(task);
        agent.performance.record(success, duration_ms);
        agent.refresh_load_status();
        Ok(())
    }

    /// Mark an agent as in error; sticky until the next recovery.
    pub async fn mark_error(&self, id: &AgentId) -> FabricResult<()> {
        let mut state = self.state.write().await;
        let agent = state
            .agents
            .get_mut(id)
            .ok_or_else(|| FabricError::NotFound(format!("agent {id}")))?;
        agent.status = AgentStatus::Error;
        warn!(agent = %id, "agent marked error");
        Ok(())
    }

    /// Clear a sticky Error status back to load-derived status.
    pub async fn clear_error(&self, id: &AgentId) -> FabricResult<()> {
        let mut state = self.state.write().await;
        let agent = state
            .agents
            .get_mut(id)
            .ok_or_else(|| FabricError::NotFound(format!("agent {id}")))?;
        if agent.status == AgentStatus::Error {
            agent.status = AgentStatus::Idle;
            agent.refresh_load_status();
        }
        Ok(())
    }

    /// Sweep liveness: agents past the heartbeat timeout go Offline (with
    /// an `agent_disconnected` event); agents past the eviction timeout
    /// are unregistered. Returns ids that went offline this sweep.
    pub async fn sweep_liveness(&self) -> Vec<AgentId> {
        let now = self.clock.now();
        let heartbeat_timeout = Duration::milliseconds(self.config.heartbeat_timeout_ms as i64);
        let eviction_timeout = Duration::milliseconds(self.config.eviction_timeout_ms as i64);

        let mut went_offline = Vec::new();
        let mut evicted = Vec::new();
        {
            let mut state = self.state.write().await;
            for (id, agent) in state.agents.iter_mut() {
                if agent.status == AgentStatus::Terminated {
                    continue;
                }
                let silent = now - agent.last_heartbeat_at;
                if silent > eviction_timeout {
                    evicted.push(id.clone());
                } else if silent > heartbeat_timeout && agent.status != AgentStatus::Offline {
                    warn!(agent = %id, silent_ms = silent.num_milliseconds(), "agent offline");
                    agent.status = AgentStatus::Offline;
                    went_offline.push((
                        id.clone(),
                        silent.num_milliseconds(),
                        agent.performance.success_rate,
                        agent.current_tasks.len(),
                    ));
                }
            }
            for id in &evicted {
                if let Some(agent) = state.agents.remove(id) {
                    for cap in &agent.capabilities {
                        if let Some(set) = state.capability_index.get_mut(cap) {
                            set.remove(id);
                        }
                    }
                    warn!(agent = %id, "agent evicted after prolonged silence");
                }
            }
        }

        for (id, silent_ms, success_rate, tracked_tasks) in &went_offline {
            self.bus
                .publish(
                    Event::new(EventKind::AgentDisconnected, now)
                        .agent(id.clone())
                        .meta("silent_ms", *silent_ms as f64)
                        .meta("last_success_rate", *success_rate)
                        .meta("tracked_tasks", *tracked_tasks as f64),
                )
                .await;
        }
        went_offline.into_iter().map(|(id, ..)| id).collect()
    }

    /// Restore an agent snapshot verbatim (replay path).
    pub async fn restore(&self, agent: Agent) {
        let mut state = self.state.write().await;
        for cap in &agent.capabilities {
            state
                .capability_index
                .entry(cap.clone())
                .or_default()
                .insert(agent.id.clone());
        }
        state.agents.insert(agent.id.clone(), agent);
    }
}
