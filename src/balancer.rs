//! Load balancer
//!
//! Given a runnable task and the registry's candidate view, picks the
//! target agent under a runtime-selectable strategy. Owns the per-agent
//! circuit breakers that keep failing agents out of rotation, and the
//! periodic rebalancing pass that proposes moving queued work off
//! overloaded agents.

use crate::clock::Clock;
use crate::types::{Agent, AgentId, FabricResult, Priority, Task, TaskId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Agent selection strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceStrategy {
    /// Cycle through candidates in stable order
    RoundRobin,
    /// Minimize current load fraction
    LeastLoaded,
    /// Maximize success rate weighted by speed
    PerformanceBased,
    /// Maximize weighted free capacity
    Weighted,
    /// Performance-based for hot tasks and hot systems, least-loaded otherwise
    Adaptive,
}

/// Balancer tuning knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    /// Active strategy
    pub strategy: BalanceStrategy,
    /// Consecutive failures before a breaker opens
    pub failure_threshold: u32,
    /// How long an open breaker blocks selection
    pub cooldown_ms: u64,
    /// Whether the rebalancing pass is active
    pub rebalance_enabled: bool,
    /// Whether Critical tasks may preempt running work
    pub preemption_enabled: bool,
    /// Load fraction above which an agent counts as overloaded
    pub overload_threshold: f64,
    /// Load fraction below which an agent counts as underutilized
    pub underload_threshold: f64,
    /// Weight applied to free slots under the Weighted strategy
    pub capacity_weight: f64,
    /// Speed weight under the performance strategy
    pub performance_speed_weight: f64,
    /// Global load fraction at which Adaptive switches to performance
    pub adaptive_load_threshold: f64,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            strategy: BalanceStrategy::Adaptive,
            failure_threshold: 5,
            cooldown_ms: 60_000,
            rebalance_enabled: true,
            preemption_enabled: false,
            overload_threshold: 0.75,
            underload_threshold: 0.25,
            capacity_weight: 1.0,
            performance_speed_weight: 1.0,
            adaptive_load_threshold: 0.8,
        }
    }
}

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Normal operation
    Closed,
    /// Blocking selection until the cooldown elapses
    Open,
    /// Cooldown elapsed; exactly one probe may pass
    HalfOpen,
}

/// Per-agent circuit breaker
///
/// closed -> open after `failure_threshold` consecutive failures;
/// open -> half-open after the cooldown; half-open -> closed on one
/// success, back to open on failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreaker {
    /// Current state
    pub state: BreakerState,
    /// Consecutive failures observed
    pub consecutive_failures: u32,
    /// When the breaker last opened
    pub opened_at: Option<DateTime<Utc>>,
    /// Cooldown before a half-open probe
    pub cooldown_ms: u64,
    /// Whether the single half-open probe is in flight
    probe_in_flight: bool,
}

impl CircuitBreaker {
    fn new(cooldown_ms: u64) -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            cooldown_ms,
            probe_in_flight: false,
        }
    }

    /// Whether a dispatch may pass right now. Transitions open ->
    /// half-open when the cooldown has elapsed and claims the probe slot.
    fn allow(&mut self, now: DateTime<Utc>) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed = self
                    .opened_at
                    .map(|t| now - t >= Duration::milliseconds(self.cooldown_ms as i64))
                    .unwrap_or(true);
                if elapsed {
                    self.state = BreakerState::HalfOpen;
                    self.probe_in_flight = true;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if self.probe_in_flight {
                    false
                } else {
                    self.probe_in_flight = true;
                    true
                }
            }
        }
    }

    fn record_success(&mut self) {
        self.state = BreakerState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.probe_in_flight = false;
    }

    fn record_failure(&mut self, threshold: u32, now: DateTime<Utc>) {
        self.consecutive_failures += 1;
        self.probe_in_flight = false;
        match self.state {
            BreakerState::HalfOpen => {
                self.state = BreakerState::Open;
                self.opened_at = Some(now);
            }
            BreakerState::Closed if self.consecutive_failures >= threshold => {
                self.state = BreakerState::Open;
                self.opened_at = Some(now);
            }
            _ => {}
        }
    }
}

/// A proposed task move from the rebalancing pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalanceMove {
    /// Task to move
    pub task_id: TaskId,
    /// Agent to move it off
    pub from_agent: AgentId,
    /// Agent to move it onto
    pub to_agent: AgentId,
    /// Whether applying the move requires preempting running work
    pub preempts: bool,
}

/// Strategy-driven agent selector with circuit breakers
pub struct LoadBalancer {
    config: BalancerConfig,
    clock: Arc<dyn Clock>,
    strategy: RwLock<BalanceStrategy>,
    breakers: RwLock<HashMap<AgentId, CircuitBreaker>>,
    round_robin_cursor: RwLock<usize>,
}

impl LoadBalancer {
    /// Create a balancer with the configured default strategy.
    pub fn new(config: BalancerConfig, clock: Arc<dyn Clock>) -> Self {
        let strategy = config.strategy;
        Self {
            config,
            clock,
            strategy: RwLock::new(strategy),
            breakers: RwLock::new(HashMap::new()),
            round_robin_cursor: RwLock::new(0),
        }
    }

    /// Swap the selection strategy at runtime.
    pub async fn set_strategy(&self, strategy: BalanceStrategy) {
        info!(?strategy, "balancer strategy changed");
        *self.strategy.write().await = strategy;
    }

    /// Current strategy.
    pub async fn strategy(&self) -> BalanceStrategy {
        *self.strategy.read().await
    }

    /// Choose an agent for `task` among `candidates`.
    ///
    /// Candidates must already satisfy capability requirements; this
    /// method applies breaker gating, headroom and the active strategy.
    pub async fn select(&self, task: &Task, candidates: &[Agent]) -> Option<AgentId> {
        let now = self.clock.now();
        let mut breakers = self.breakers.write().await;
        let admitted: Vec<&Agent> = candidates
            .iter()
            .filter(|a| a.headroom() > 0)
            .filter(|a| {
                breakers
                    .entry(a.id.clone())
                    .or_insert_with(|| CircuitBreaker::new(self.config.cooldown_ms))
                    .allow(now)
            })
            .collect();
        drop(breakers);

        if admitted.is_empty() {
            return None;
        }

        let strategy = *self.strategy.read().await;
        let effective = match strategy {
            BalanceStrategy::Adaptive => {
                let global_load = Self::global_load(candidates);
                if task.base_priority >= Priority::High
                    || global_load > self.config.adaptive_load_threshold
                {
                    BalanceStrategy::PerformanceBased
                } else {
                    BalanceStrategy::LeastLoaded
                }
            }
            other => other,
        };

        let chosen = match effective {
            BalanceStrategy::RoundRobin => {
                let mut sorted: Vec<&&Agent> = admitted.iter().collect();
                sorted.sort_by(|a, b| a.id.cmp(&b.id));
                let mut cursor = self.round_robin_cursor.write().await;
                let pick = sorted[*cursor % sorted.len()].id.clone();
                *cursor = cursor.wrapping_add(1);
                pick
            }
            BalanceStrategy::LeastLoaded => Self::pick_by(&admitted, |a| -a.load()),
            BalanceStrategy::PerformanceBased => Self::pick_by(&admitted, |a| {
                // Agents with no history get a neutral 1s baseline so they
                // neither dominate nor starve.
                let avg_ms = if a.performance.average_completion_time_ms > 0.0 {
                    a.performance.average_completion_time_ms
                } else {
                    1_000.0
                };
                a.performance.success_rate * (1.0 / avg_ms) * self.config.performance_speed_weight
            }),
            BalanceStrategy::Weighted => Self::pick_by(&admitted, |a| {
                a.headroom() as f64 * self.config.capacity_weight
            }),
            BalanceStrategy::Adaptive => unreachable!("resolved above"),
        };

        debug!(task = %task.id, agent = %chosen, ?effective, "agent selected");
        Some(chosen)
    }

    fn pick_by<F: Fn(&Agent) -> f64>(admitted: &[&Agent], score: F) -> AgentId {
        let mut best: Option<(&Agent, f64)> = None;
        for agent in admitted {
            let s = score(agent);
            let better = match best {
                None => true,
                Some((b, bs)) => s > bs || (s == bs && agent.id < b.id),
            };
            if better {
                best = Some((agent, s));
            }
        }
        best.map(|(a, _)| a.id.clone()).expect("admitted is non-empty")
    }

    fn global_load(candidates: &[Agent]) -> f64 {
        let capacity: usize = candidates.iter().map(|a| a.max_concurrent_tasks).sum();
        if capacity == 0 {
            return 1.0;
        }
        let used: usize = candidates.iter().map(|a| a.current_tasks.len()).sum();
        used as f64 / capacity as f64
    }

    /// Record a successful dispatch outcome for breaker accounting.
    pub async fn record_success(&self, agent: &AgentId) {
        if let Some(breaker) = self.breakers.write().await.get_mut(agent) {
            breaker.record_success();
        }
    }

    /// Record a failed dispatch outcome. Opens the breaker at the
    /// configured threshold.
    pub async fn record_failure(&self, agent: &AgentId) {
        let now = self.clock.now();
        let mut breakers = self.breakers.write().await;
        let breaker = breakers
            .entry(agent.clone())
            .or_insert_with(|| CircuitBreaker::new(self.config.cooldown_ms));
        breaker.record_failure(self.config.failure_threshold, now);
        if breaker.state == BreakerState::Open {
            warn!(
                agent = %agent,
                failures = breaker.consecutive_failures,
                "circuit breaker opened"
            );
        }
    }

    /// Breaker snapshot for one agent, if any outcomes were recorded.
    pub async fn breaker(&self, agent: &AgentId) -> Option<CircuitBreaker> {
        self.breakers.read().await.get(agent).cloned()
    }

    /// All breaker snapshots, for persistence.
    pub async fn breaker_snapshots(&self) -> Vec<(AgentId, CircuitBreaker)> {
        self.breakers
            .read()
            .await
            .iter()
            .map(|(id, b)| (id.clone(), b.clone()))
            .collect()
    }

    /// Restore a breaker snapshot verbatim (replay path).
    pub async fn restore_breaker(&self, agent: AgentId, breaker: CircuitBreaker) {
        self.breakers.write().await.insert(agent, breaker);
    }

    /// Propose moves from overloaded agents to underutilized ones.
    ///
    /// Only assigned-but-not-started tasks move freely. A running task is
    /// proposed only when preemption is enabled and the task is Critical.
    pub async fn rebalance(&self, agents: &[Agent], movable: &[Task]) -> FabricResult<Vec<RebalanceMove>> {
        if !self.config.rebalance_enabled {
            return Ok(Vec::new());
        }
        let mut overloaded: Vec<&Agent> = agents
            .iter()
            .filter(|a| a.load() > self.config.overload_threshold)
            .collect();
        let mut underutilized: Vec<&Agent> = agents
            .iter()
            .filter(|a| a.load() < self.config.underload_threshold && a.headroom() > 0)
            .collect();
        if overloaded.is_empty() || underutilized.is_empty() {
            return Ok(Vec::new());
        }
        overloaded.sort_by(|a, b| b.load().partial_cmp(&a.load()).unwrap_or(std::cmp::Ordering::Equal));
        underutilized.sort_by(|a, b| a.load().partial_cmp(&b.load()).unwrap_or(std::cmp::Ordering::Equal));

        let mut spare: HashMap<AgentId, usize> = underutilized
            .iter()
            .map(|a| (a.id.clone(), a.headroom()))
            .collect();
        let mut moves = Vec::new();

        for source in overloaded {
            for task in movable.iter().filter(|t| {
                t.assigned_agent.as_ref() == Some(&source.id)
            }) {
                let preempts = task.started_at.is_some();
                if preempts
                    && !(self.config.preemption_enabled
                        && task.base_priority == Priority::Critical)
                {
                    continue;
                }
                let target = underutilized
                    .iter()
                    .filter(|a| spare.get(&a.id).copied().unwrap_or(0) > 0)
                    .find(|a| a.has_capabilities(&task.required_capabilities));
                if let Some(target) = target {
                    *spare.get_mut(&target.id).expect("target has spare entry") -= 1;
                    moves.push(RebalanceMove {
                        task_id: task.id,
                        from_agent: source.id.clone(),
                        to_agent: target.id.clone(),
                        preempts,
                    });
                }
            }
        }
        if !moves.is_empty() {
            info!(count = moves.len(), "rebalance proposed task moves");
        }
        Ok(moves)
    }
}
