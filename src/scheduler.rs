//! Priority scheduler and task queue
//!
//! Admits tasks, maintains the dependency graph and per-tag resource
//! counters, computes dynamic priority scores, and selects the next
//! runnable tasks. Retry backoff, starvation boosting and the
//! cancellation cascade policy live here too.
//!
//! All task state sits behind a single lock so every selection sees a
//! consistent snapshot of readiness, resource usage and agent-visible
//! status (the shared-resource policy of the concurrency model). Events
//! are published while the lock is held, which keeps per-task event
//! order identical to transition order.

use crate::clock::Clock;
use crate::event_bus::{Event, EventBus, EventKind};
use crate::graph::{DependencyEdge, DependencyGraph, EdgeStrength};
use crate::types::{
    AgentId, FabricError, FabricResult, FailureKind, FailureReason, MetadataValue, Priority, Task,
    TaskCategory, TaskId, TaskResult, TaskStatus,
};
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Selection strategies for the dynamic score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingStrategy {
    /// Base priority only
    Static,
    /// Full weighted formula
    Hybrid,
    /// Full formula plus a critical-path bonus
    DependencyAware,
    /// Full formula with contention weighted up under high load
    WorkloadAdaptive,
}

/// Starvation-prevention modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StarvationMode {
    /// No boosting
    None,
    /// Full boost once the wait threshold is crossed
    FixedBoost,
    /// Boost proportional to wait/threshold, capped
    AdaptiveBoost,
    /// Guarantee each originator a minimum share of throughput
    Quota,
}

/// What happens to dependents when a task fails terminally or is cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CascadePolicy {
    /// Fail (or cancel) every transitive hard dependent
    FailDependents,
    /// Park direct dependents as Blocked for manual resolution
    UnblockAsBlocked,
    /// Leave dependents alone; they simply never become runnable
    Ignore,
}

/// Weights for the priority-score terms
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityWeights {
    /// Base priority term
    pub priority: f64,
    /// Age term (bounded, concave)
    pub age: f64,
    /// Deadline-proximity term
    pub deadline: f64,
    /// Transitive-dependent-count term
    pub dependency_impact: f64,
    /// Historical category success-rate term
    pub history: f64,
    /// Resource-contention penalty
    pub contention: f64,
    /// Bonus for critical-path membership (DependencyAware only)
    pub critical_path: f64,
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            priority: 1.0,
            age: 10.0,
            deadline: 25.0,
            dependency_impact: 5.0,
            history: 10.0,
            contention: 10.0,
            critical_path: 15.0,
        }
    }
}

/// Retry backoff policy: `initial * multiplier^attempt +/- jitter`,
/// capped at `max_delay_ms`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// First retry delay
    pub initial_delay_ms: u64,
    /// Exponential growth factor
    pub multiplier: f64,
    /// Ceiling for the computed delay
    pub max_delay_ms: u64,
    /// Random jitter as a fraction of the delay, in [0, 1]
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 300_000,
            jitter: 0.1,
        }
    }
}

/// Scheduler tuning knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Scoring strategy
    pub strategy: SchedulingStrategy,
    /// Cadence of the periodic adjustment/starvation scan
    pub adjustment_interval_ms: u64,
    /// Starvation mode
    pub starvation_mode: StarvationMode,
    /// Wait beyond which a queued task is considered starving
    pub max_starvation_time_ms: u64,
    /// Ceiling on the starvation boost added to a score
    pub max_priority_boost: f64,
    /// Minimum throughput share per originator under Quota mode
    pub min_execution_quota: f64,
    /// Rolling window for quota accounting
    pub quota_window_ms: u64,
    /// Score term weights
    pub weights: PriorityWeights,
    /// How many resource-blocked candidates to skip before giving up
    pub lookahead_depth: usize,
    /// Retry backoff policy
    pub retry: RetryPolicy,
    /// Dependent handling on terminal failure or cancellation
    pub cascade_policy: CascadePolicy,
    /// Window used by the deadline-proximity term
    pub deadline_window_ms: u64,
    /// Age at which the age term saturates
    pub age_saturation_ms: u64,
    /// Per-tag resource capacities; absent tags are uncapacitated
    pub resource_capacities: HashMap<String, u64>,
    /// How long terminal tasks are retained before archival
    pub task_history_retention_ms: u64,
    /// Utilization above which WorkloadAdaptive doubles the contention weight
    pub high_load_threshold: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            strategy: SchedulingStrategy::Hybrid,
            adjustment_interval_ms: 30_000,
            starvation_mode: StarvationMode::AdaptiveBoost,
            max_starvation_time_ms: 300_000,
            max_priority_boost: 500.0,
            min_execution_quota: 0.05,
            quota_window_ms: 600_000,
            weights: PriorityWeights::default(),
            lookahead_depth: 8,
            retry: RetryPolicy::default(),
            cascade_policy: CascadePolicy::FailDependents,
            deadline_window_ms: 3_600_000,
            age_saturation_ms: 600_000,
            resource_capacities: HashMap::new(),
            task_history_retention_ms: 86_400_000,
            high_load_threshold: 0.8,
        }
    }
}

/// Selection filter applied by callers (usually the coordinator)
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    /// Only tasks whose required capabilities are covered by this set
    pub capabilities: Option<HashSet<String>>,
    /// Only tasks of this category
    pub category: Option<TaskCategory>,
    /// Only tasks from this originator
    pub originator: Option<String>,
}

impl TaskFilter {
    fn matches(&self, task: &Task) -> bool {
        if let Some(caps) = &self.capabilities {
            if !task.required_capabilities.iter().all(|c| caps.contains(c)) {
                return false;
            }
        }
        if let Some(category) = self.category {
            if task.category != category {
                return false;
            }
        }
        if let Some(originator) = &self.originator {
            if task.originator.as_deref() != Some(originator.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Caller-driven progress update
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgressUpdate {
    /// Optional status transition
    pub status: Option<TaskStatus>,
    /// Completion estimate in [0, 100]
    pub progress_percent: Option<f64>,
    /// Free-form note appended to the history
    pub notes: Option<String>,
}

/// Outcome of a cancellation, including cascaded releases
#[derive(Debug, Clone)]
pub struct CancelOutcome {
    /// The cancelled task
    pub task: Task,
    /// Agent slots freed by the cancellation (task id, agent id)
    pub released_agents: Vec<(TaskId, AgentId)>,
}

/// Scheduler statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerStats {
    /// All tracked tasks
    pub total: usize,
    /// Tasks waiting for selection
    pub queued: usize,
    /// Tasks bound to an agent or running
    pub running: usize,
    /// Tasks parked as Blocked
    pub blocked: usize,
    /// Completed tasks still retained
    pub completed: usize,
    /// Failed tasks still retained
    pub failed: usize,
    /// Cancelled tasks still retained
    pub cancelled: usize,
}

#[derive(Debug, Default)]
struct SchedulerState {
    tasks: HashMap<TaskId, Task>,
    graph: DependencyGraph,
    resources_used: HashMap<String, u64>,
    boosts: HashMap<TaskId, f64>,
    completions: VecDeque<(DateTime<Utc>, Option<String>)>,
    category_stats: HashMap<TaskCategory, (u64, u64)>,
    critical_cache: Option<HashSet<TaskId>>,
}

impl SchedulerState {
    fn completed_ids(&self) -> HashSet<TaskId> {
        self.tasks
            .values()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| t.id)
            .collect()
    }

    fn category_success_rate(&self, category: TaskCategory) -> f64 {
        match self.category_stats.get(&category) {
            Some((completed, failed)) if completed + failed > 0 => {
                *completed as f64 / (completed + failed) as f64
            }
            _ => 1.0,
        }
    }
}

/// The multi-level, dependency-aware priority scheduler
pub struct PriorityScheduler {
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    bus: Arc<EventBus>,
    state: RwLock<SchedulerState>,
}

impl PriorityScheduler {
    /// Create an empty scheduler.
    pub fn new(config: SchedulerConfig, clock: Arc<dyn Clock>, bus: Arc<EventBus>) -> Self {
        Self {
            config,
            clock,
            bus,
            state: RwLock::new(SchedulerState::default()),
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Admit a task. The task arrives in Created state; its declared
    /// `dependencies` become hard edges. Rejects duplicate ids and
    /// dependencies on unknown tasks; a dependency set that would close a
    /// hard cycle is rejected atomically with no state change.
    pub async fn add_task(&self, mut task: Task) -> FabricResult<TaskId> {
        let now = self.clock.now();
        let mut guard = self.state.write().await;
        let state = &mut *guard;

        if task.status != TaskStatus::Created {
            return Err(FabricError::Validation(format!(
                "task {} must be admitted in created state, got {}",
                task.id, task.status
            )));
        }
        if state.tasks.contains_key(&task.id) {
            return Err(FabricError::Conflict(format!("duplicate task id {}", task.id)));
        }
        if task.dependencies.contains(&task.id) {
            return Err(FabricError::Validation(format!(
                "task {} cannot depend on itself",
                task.id
            )));
        }
        for dep in &task.dependencies {
            if !state.tasks.contains_key(dep) {
                return Err(FabricError::Validation(format!(
                    "task {} depends on unknown task {dep}",
                    task.id
                )));
            }
        }

        state.graph.add_node(task.id, task.estimated_effort_ms);
        let mut added: Vec<TaskId> = Vec::new();
        for dep in &task.dependencies {
            // A brand-new node has no dependents, so this cannot cycle;
            // the rollback guards against future invariant drift.
            if let Err(err) = state.graph.add_dependency(task.id, *dep, EdgeStrength::Hard) {
                for rollback in &added {
                    let _ = state.graph.remove_dependency(&task.id, rollback);
                }
                state.graph.remove_node(&task.id);
                return Err(err);
            }
            added.push(*dep);
        }
        for dep in &task.dependencies {
            if let Some(dep_task) = state.tasks.get_mut(dep) {
                dep_task.dependents.insert(task.id);
            }
        }
        state.critical_cache = None;

        let id = task.id;
        task.history.push(crate::types::TaskAction {
            at: now,
            action: "created".to_string(),
            detail: None,
        });
        task.transition_to(TaskStatus::Queued, now, None)?;
        info!(task = %id, title = %task.title, priority = ?task.base_priority, "task admitted");
        state.tasks.insert(id, task);

        self.bus
            .publish(Event::new(EventKind::TaskCreated, now).task(id))
            .await;
        self.bus
            .publish(Event::new(EventKind::TaskQueued, now).task(id))
            .await;
        Ok(id)
    }

    /// Add a dependency between existing tasks. Hard edges also update
    /// the tasks' dependency/dependent sets.
    pub async fn add_dependency(
        &self,
        task: TaskId,
        depends_on: TaskId,
        strength: EdgeStrength,
    ) -> FabricResult<()> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        if !state.tasks.contains_key(&task) {
            return Err(FabricError::NotFound(format!("task {task}")));
        }
        if !state.tasks.contains_key(&depends_on) {
            return Err(FabricError::NotFound(format!("task {depends_on}")));
        }
        state.graph.add_dependency(task, depends_on, strength)?;
        if strength == EdgeStrength::Hard {
            if let Some(t) = state.tasks.get_mut(&task) {
                t.dependencies.insert(depends_on);
            }
            if let Some(d) = state.tasks.get_mut(&depends_on) {
                d.dependents.insert(task);
            }
        }
        state.critical_cache = None;
        Ok(())
    }

    /// Fetch one task by id.
    pub async fn get_task(&self, id: &TaskId) -> FabricResult<Task> {
        self.state
            .read()
            .await
            .tasks
            .get(id)
            .cloned()
            .ok_or_else(|| FabricError::NotFound(format!("task {id}")))
    }

    /// Snapshot of all tracked tasks.
    pub async fn list_tasks(&self) -> Vec<Task> {
        self.state.read().await.tasks.values().cloned().collect()
    }

    /// Peek at the highest-scoring runnable task without committing.
    pub async fn get_next_task(&self, filter: Option<&TaskFilter>) -> Option<Task> {
        let state = self.state.read().await;
        let now = self.clock.now();
        self.select_runnable(&state, now, 1, filter)
            .into_iter()
            .next()
            .and_then(|id| state.tasks.get(&id).cloned())
    }

    /// Up to `k` runnable tasks by descending score. Runnability requires
    /// every hard dependency Completed, so the result can never contain
    /// two tasks with an unmet hard edge between them.
    pub async fn get_next_tasks(&self, k: usize, filter: Option<&TaskFilter>) -> Vec<Task> {
        let state = self.state.read().await;
        let now = self.clock.now();
        self.select_runnable(&state, now, k, filter)
            .into_iter()
            .filter_map(|id| state.tasks.get(&id).cloned())
            .collect()
    }

    /// Claim the highest-scoring runnable task for `agent`: the commit
    /// form of `get_next_task`. Transitions Queued -> Assigned, records
    /// the agent and reserves the task's resource tags.
    pub async fn claim_next_task(
        &self,
        filter: Option<&TaskFilter>,
        agent: &AgentId,
    ) -> FabricResult<Option<Task>> {
        let now = self.clock.now();
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let Some(id) = self.select_runnable(state, now, 1, filter).into_iter().next() else {
            return Ok(None);
        };

        let task = state
            .tasks
            .get_mut(&id)
            .ok_or_else(|| FabricError::NotFound(format!("task {id}")))?;
        task.transition_to(
            TaskStatus::Assigned,
            now,
            Some(format!("assigned to {agent}")),
        )?;
        task.assigned_agent = Some(agent.clone());
        for tag in &task.required_resources {
            *state.resources_used.entry(tag.clone()).or_insert(0) += 1;
        }
        state.boosts.remove(&id);
        let snapshot = task.clone();
        debug!(task = %id, agent = %agent, "task claimed");

        self.bus
            .publish(
                Event::new(EventKind::TaskAssigned, now)
                    .task(id)
                    .agent(agent.clone()),
            )
            .await;
        Ok(Some(snapshot))
    }

    /// Claim a specific task for `agent`, re-validating runnability under
    /// the state lock (the optimistic-selection commit: callers peek
    /// without the lock, then claim and retry on conflict).
    pub async fn claim_task(&self, id: &TaskId, agent: &AgentId) -> FabricResult<Task> {
        let now = self.clock.now();
        let mut guard = self.state.write().await;
        let state = &mut *guard;

        let completed = state.completed_ids();
        let task = state
            .tasks
            .get(id)
            .ok_or_else(|| FabricError::NotFound(format!("task {id}")))?;
        if task.status != TaskStatus::Queued {
            return Err(FabricError::Conflict(format!(
                "task {id} is {} and cannot be claimed",
                task.status
            )));
        }
        if task.backoff_until.is_some_and(|until| now < until) {
            return Err(FabricError::ResourceExhausted(format!(
                "task {id} is in retry backoff"
            )));
        }
        if !state.graph.hard_deps_satisfied(id, &completed) {
            return Err(FabricError::Conflict(format!(
                "task {id} has incomplete hard dependencies"
            )));
        }
        let fits = task.required_resources.iter().all(|tag| {
            match self.config.resource_capacities.get(tag) {
                Some(capacity) => {
                    state.resources_used.get(tag).copied().unwrap_or(0) + 1 <= *capacity
                }
                None => true,
            }
        });
        if !fits {
            return Err(FabricError::ResourceExhausted(format!(
                "task {id} cannot reserve its resource tags"
            )));
        }

        let task = state.tasks.get_mut(id).expect("checked above");
        task.transition_to(
            TaskStatus::Assigned,
            now,
            Some(format!("assigned to {agent}")),
        )?;
        task.assigned_agent = Some(agent.clone());
        for tag in &task.required_resources {
            *state.resources_used.entry(tag.clone()).or_insert(0) += 1;
        }
        state.boosts.remove(id);
        let snapshot = task.clone();
        debug!(task = %id, agent = %agent, "task claimed");

        self.bus
            .publish(
                Event::new(EventKind::TaskAssigned, now)
                    .task(*id)
                    .agent(agent.clone()),
            )
            .await;
        Ok(snapshot)
    }

    /// Put an Assigned task back in the queue (dispatch fell through),
    /// releasing its agent binding and resource reservations.
    pub async fn requeue(&self, id: &TaskId, reason: &str) -> FabricResult<Task> {
        let now = self.clock.now();
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let task = state
            .tasks
            .get_mut(id)
            .ok_or_else(|| FabricError::NotFound(format!("task {id}")))?;
        if task.status != TaskStatus::Assigned {
            return Err(FabricError::Conflict(format!(
                "task {id} is {} and cannot be requeued",
                task.status
            )));
        }
        let tags: Vec<String> = task.required_resources.iter().cloned().collect();
        task.transition_to(TaskStatus::Queued, now, Some(reason.to_string()))?;
        Self::release_resources(&mut state.resources_used, &tags);
        let snapshot = task.clone();

        self.bus
            .publish(Event::new(EventKind::TaskQueued, now).task(*id))
            .await;
        Ok(snapshot)
    }

    /// Record that the agent started work: Assigned -> InProgress.
    pub async fn mark_started(&self, id: &TaskId) -> FabricResult<Task> {
        let now = self.clock.now();
        let mut state = self.state.write().await;
        let task = state
            .tasks
            .get_mut(id)
            .ok_or_else(|| FabricError::NotFound(format!("task {id}")))?;
        let agent = task.assigned_agent.clone();
        task.transition_to(TaskStatus::InProgress, now, None)?;
        task.assigned_agent = agent.clone();
        let snapshot = task.clone();
        drop(state);

        let mut event = Event::new(EventKind::TaskStarted, now).task(*id);
        if let Some(agent) = agent {
            event = event.agent(agent);
        }
        self.bus.publish(event).await;
        Ok(snapshot)
    }

    /// Feed an execution outcome back into the queue.
    ///
    /// Success completes the task, releases resources and re-evaluates
    /// dependents. A retriable failure with budget left re-enqueues with
    /// exponential backoff; otherwise the task fails terminally and the
    /// configured cascade policy is applied to its dependents.
    pub async fn update_task_result(&self, id: &TaskId, result: &TaskResult) -> FabricResult<Task> {
        let now = self.clock.now();
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let mut events: Vec<Event> = Vec::new();

        let task = state
            .tasks
            .get_mut(id)
            .ok_or_else(|| FabricError::NotFound(format!("task {id}")))?;
        if !matches!(
            task.status,
            TaskStatus::Assigned | TaskStatus::InProgress | TaskStatus::Review
        ) {
            return Err(FabricError::Conflict(format!(
                "task {id} is {} and cannot accept a result",
                task.status
            )));
        }

        let originator = task.originator.clone();
        let category = task.category;
        let tags: Vec<String> = task.required_resources.iter().cloned().collect();

        let snapshot = if result.success {
            task.transition_to(TaskStatus::Completed, now, None)?;
            let snapshot = task.clone();
            Self::release_resources(&mut state.resources_used, &tags);

            let stats = state.category_stats.entry(category).or_insert((0, 0));
            stats.0 += 1;
            state.completions.push_back((now, originator));
            Self::trim_completions(&mut state.completions, now, self.config.quota_window_ms);

            events.push(
                Event::new(EventKind::TaskCompleted, now)
                    .task(*id)
                    .meta("duration_ms", result.duration_ms as f64),
            );

            // Dependents parked as Blocked go back to the queue now that a
            // prerequisite finished.
            for dep_id in state.graph.direct_dependents(id) {
                if let Some(dep) = state.tasks.get_mut(&dep_id) {
                    if dep.status == TaskStatus::Blocked {
                        dep.transition_to(
                            TaskStatus::Queued,
                            now,
                            Some(format!("unblocked by completion of {id}")),
                        )?;
                        events.push(Event::new(EventKind::TaskQueued, now).task(dep_id));
                    }
                }
            }
            info!(task = %id, duration_ms = result.duration_ms, "task completed");
            snapshot
        } else {
            let stats = state.category_stats.entry(category).or_insert((0, 0));
            stats.1 += 1;

            let retriable = result.retriable && task.retries_left();
            if retriable {
                task.current_retries += 1;
                let attempt = task.current_retries;
                let delay = self.retry_delay(attempt);
                task.transition_to(
                    TaskStatus::Failed,
                    now,
                    Some(format!(
                        "attempt {attempt} failed: {}",
                        result.error.as_deref().unwrap_or("unknown error")
                    )),
                )?;
                task.transition_to(TaskStatus::Queued, now, Some("retry scheduled".to_string()))?;
                task.backoff_until = Some(now + Duration::milliseconds(delay as i64));
                let snapshot = task.clone();
                Self::release_resources(&mut state.resources_used, &tags);
                warn!(task = %id, attempt, delay_ms = delay, "task failed, retry scheduled");

                events.push(
                    Event::new(EventKind::TaskFailed, now)
                        .task(*id)
                        .meta("retriable", true)
                        .meta("attempt", attempt as f64)
                        .meta("backoff_ms", delay as f64),
                );
                events.push(Event::new(EventKind::TaskQueued, now).task(*id));
                snapshot
            } else {
                let reason = FailureReason {
                    kind: FailureKind::ExecutorFailed,
                    message: result
                        .error
                        .clone()
                        .unwrap_or_else(|| "executor reported failure".to_string()),
                    cause: None,
                    retriable: false,
                };
                Self::fail_terminally(task, &reason, now)?;
                let snapshot = task.clone();
                Self::release_resources(&mut state.resources_used, &tags);
                warn!(task = %id, error = ?result.error, "task failed terminally");
                events.push(
                    Event::new(EventKind::TaskFailed, now)
                        .task(*id)
                        .meta("retriable", false),
                );

                let cascade_reason = FailureReason {
                    kind: FailureKind::DependencyFailed,
                    message: format!("dependency {id} failed"),
                    cause: Some(reason.message.clone()),
                    retriable: false,
                };
                Self::apply_cascade(
                    state,
                    id,
                    self.config.cascade_policy,
                    &cascade_reason,
                    now,
                    &mut events,
                    &mut Vec::new(),
                )?;
                snapshot
            }
        };
        state.critical_cache = None;

        for event in events {
            self.bus.publish(event).await;
        }
        Ok(snapshot)
    }

    /// Cancel a non-terminal task and handle dependents per policy.
    pub async fn cancel(&self, id: &TaskId, reason: &str) -> FabricResult<CancelOutcome> {
        let now = self.clock.now();
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let mut events: Vec<Event> = Vec::new();
        let mut released: Vec<(TaskId, AgentId)> = Vec::new();

        let task = state
            .tasks
            .get_mut(id)
            .ok_or_else(|| FabricError::NotFound(format!("task {id}")))?;
        if task.status.is_terminal()
            || (task.status == TaskStatus::Failed && !task.retries_left())
        {
            return Err(FabricError::Conflict(format!(
                "task {id} is already {}",
                task.status
            )));
        }
        let held_agent = task.assigned_agent.clone();
        let held_resources = task.status.holds_agent();
        let tags: Vec<String> = task.required_resources.iter().cloned().collect();
        task.transition_to(TaskStatus::Cancelled, now, Some(reason.to_string()))?;
        let snapshot = task.clone();
        if held_resources {
            Self::release_resources(&mut state.resources_used, &tags);
        }
        if let Some(agent) = held_agent {
            released.push((*id, agent));
        }
        state.boosts.remove(id);
        info!(task = %id, reason, "task cancelled");
        events.push(
            Event::new(EventKind::TaskCancelled, now)
                .task(*id)
                .meta("reason", reason),
        );

        let cascade_reason = FailureReason {
            kind: FailureKind::DependencyFailed,
            message: format!("dependency {id} was cancelled"),
            cause: Some(reason.to_string()),
            retriable: false,
        };
        Self::apply_cascade(
            state,
            id,
            self.config.cascade_policy,
            &cascade_reason,
            now,
            &mut events,
            &mut released,
        )?;
        state.critical_cache = None;

        for event in events {
            self.bus.publish(event).await;
        }
        Ok(CancelOutcome {
            task: snapshot,
            released_agents: released,
        })
    }

    /// Apply a caller-driven progress update.
    pub async fn update_progress(&self, id: &TaskId, update: ProgressUpdate) -> FabricResult<Task> {
        let now = self.clock.now();
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let mut events: Vec<Event> = Vec::new();

        let task = state
            .tasks
            .get_mut(id)
            .ok_or_else(|| FabricError::NotFound(format!("task {id}")))?;

        if let Some(percent) = update.progress_percent {
            if !(0.0..=100.0).contains(&percent) {
                return Err(FabricError::Validation(format!(
                    "progress {percent} outside [0, 100]"
                )));
            }
            task.metadata
                .insert("progress_percent".to_string(), MetadataValue::Number(percent));
            task.updated_at = now;
        }
        if let Some(notes) = update.notes {
            task.history.push(crate::types::TaskAction {
                at: now,
                action: "note".to_string(),
                detail: Some(notes),
            });
        }
        if let Some(status) = update.status {
            let was_holding = task.status.holds_agent();
            let agent = task.assigned_agent.clone();
            let tags: Vec<String> = task.required_resources.iter().cloned().collect();
            task.transition_to(status, now, Some("caller progress update".to_string()))?;
            if status == TaskStatus::InProgress {
                task.assigned_agent = agent;
            } else if was_holding && !status.holds_agent() {
                Self::release_resources(&mut state.resources_used, &tags);
            }
            events.push(
                Event::new(EventKind::StatusChanged, now)
                    .task(*id)
                    .meta("status", status.to_string()),
            );
        }
        let snapshot = state.tasks.get(id).cloned().expect("task present");

        for event in events {
            self.bus.publish(event).await;
        }
        Ok(snapshot)
    }

    /// Reassign an Assigned (not yet started) task to a different agent;
    /// used when applying rebalance moves.
    pub async fn reassign(&self, id: &TaskId, to_agent: &AgentId) -> FabricResult<Task> {
        let now = self.clock.now();
        let mut state = self.state.write().await;
        let task = state
            .tasks
            .get_mut(id)
            .ok_or_else(|| FabricError::NotFound(format!("task {id}")))?;
        if task.status != TaskStatus::Assigned {
            return Err(FabricError::Conflict(format!(
                "task {id} is {} and cannot be reassigned",
                task.status
            )));
        }
        let from = task.assigned_agent.clone();
        task.assigned_agent = Some(to_agent.clone());
        task.updated_at = now;
        task.history.push(crate::types::TaskAction {
            at: now,
            action: "reassigned".to_string(),
            detail: Some(format!(
                "{} -> {to_agent}",
                from.as_deref().unwrap_or("unassigned")
            )),
        });
        let snapshot = task.clone();
        drop(state);

        self.bus
            .publish(
                Event::new(EventKind::LoadBalanced, now)
                    .task(*id)
                    .agent(to_agent.clone()),
            )
            .await;
        Ok(snapshot)
    }

    /// Periodic starvation scan. Boosts queued tasks whose wait exceeds
    /// the threshold, per the configured mode. Returns boosted task ids.
    pub async fn run_starvation_scan(&self) -> Vec<TaskId> {
        let now = self.clock.now();
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let mut boosted = Vec::new();

        match self.config.starvation_mode {
            StarvationMode::None => {}
            StarvationMode::FixedBoost | StarvationMode::AdaptiveBoost => {
                let threshold = self.config.max_starvation_time_ms as f64;
                for task in state.tasks.values() {
                    if task.status != TaskStatus::Queued {
                        continue;
                    }
                    let wait = task.wait_ms(now) as f64;
                    if wait <= threshold {
                        continue;
                    }
                    let boost = match self.config.starvation_mode {
                        StarvationMode::FixedBoost => self.config.max_priority_boost,
                        _ => (self.config.max_priority_boost * wait / threshold)
                            .min(self.config.max_priority_boost),
                    };
                    let entry = state.boosts.entry(task.id).or_insert(0.0);
                    if boost > *entry {
                        *entry = boost;
                        boosted.push(task.id);
                    }
                }
            }
            StarvationMode::Quota => {
                let total = state.completions.len().max(1) as f64;
                let mut per_origin: HashMap<Option<String>, usize> = HashMap::new();
                for (_, origin) in &state.completions {
                    *per_origin.entry(origin.clone()).or_insert(0) += 1;
                }
                for task in state.tasks.values() {
                    if task.status != TaskStatus::Queued {
                        continue;
                    }
                    let share = per_origin
                        .get(&task.originator)
                        .copied()
                        .unwrap_or(0) as f64
                        / total;
                    if share < self.config.min_execution_quota {
                        let entry = state.boosts.entry(task.id).or_insert(0.0);
                        if self.config.max_priority_boost > *entry {
                            *entry = self.config.max_priority_boost;
                            boosted.push(task.id);
                        }
                    }
                }
            }
        }
        if !boosted.is_empty() {
            debug!(count = boosted.len(), "starvation boost applied");
        }
        boosted
    }

    /// Archive terminal tasks past the retention horizon and drop tasks
    /// that have been archived for a further full horizon.
    pub async fn archive_expired(&self) -> usize {
        let now = self.clock.now();
        let horizon = Duration::milliseconds(self.config.task_history_retention_ms as i64);
        let mut guard = self.state.write().await;
        let state = &mut *guard;

        let mut to_archive = Vec::new();
        let mut to_drop = Vec::new();
        for task in state.tasks.values() {
            let idle = now - task.updated_at;
            match task.status {
                TaskStatus::Archived if idle > horizon => to_drop.push(task.id),
                TaskStatus::Completed | TaskStatus::Cancelled if idle > horizon => {
                    to_archive.push(task.id)
                }
                TaskStatus::Failed if idle > horizon && !task.retries_left() => {
                    to_archive.push(task.id)
                }
                _ => {}
            }
        }
        for id in &to_archive {
            if let Some(task) = state.tasks.get_mut(id) {
                let _ = task.transition_to(TaskStatus::Archived, now, None);
            }
            // Archived nodes leave the graph so dependents no longer see
            // an edge to a node that will eventually disappear.
            state.graph.remove_node(id);
        }
        for id in &to_drop {
            state.tasks.remove(id);
        }
        let touched = to_archive.len() + to_drop.len();
        if touched > 0 {
            state.critical_cache = None;
            debug!(archived = to_archive.len(), dropped = to_drop.len(), "retention pass");
        }
        touched
    }

    /// Queue and status statistics.
    pub async fn stats(&self) -> SchedulerStats {
        let state = self.state.read().await;
        let mut stats = SchedulerStats {
            total: state.tasks.len(),
            ..Default::default()
        };
        for task in state.tasks.values() {
            match task.status {
                TaskStatus::Queued => stats.queued += 1,
                TaskStatus::Assigned | TaskStatus::InProgress | TaskStatus::Review => {
                    stats.running += 1
                }
                TaskStatus::Blocked => stats.blocked += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
                _ => {}
            }
        }
        stats
    }

    /// Task counts grouped by status, category and priority.
    pub async fn status_breakdown(
        &self,
    ) -> (
        HashMap<String, usize>,
        HashMap<String, usize>,
        HashMap<String, usize>,
    ) {
        let state = self.state.read().await;
        let mut by_status: HashMap<String, usize> = HashMap::new();
        let mut by_category: HashMap<String, usize> = HashMap::new();
        let mut by_priority: HashMap<String, usize> = HashMap::new();
        for task in state.tasks.values() {
            *by_status.entry(task.status.to_string()).or_insert(0) += 1;
            *by_category.entry(task.category.to_string()).or_insert(0) += 1;
            *by_priority
                .entry(format!("{:?}", task.base_priority).to_lowercase())
                .or_insert(0) += 1;
        }
        (by_status, by_category, by_priority)
    }

    /// Run the dependency analyses against the live graph.
    pub async fn analyze_graph(&self) -> crate::graph::GraphValidationReport {
        self.state.read().await.graph.validate()
    }

    /// Clone of the current graph for read-only analysis.
    pub async fn graph_snapshot(&self) -> DependencyGraph {
        self.state.read().await.graph.clone()
    }

    /// Current dynamic score of a task, for observability.
    pub async fn score_of(&self, id: &TaskId) -> FabricResult<f64> {
        let state = self.state.read().await;
        let now = self.clock.now();
        let task = state
            .tasks
            .get(id)
            .ok_or_else(|| FabricError::NotFound(format!("task {id}")))?;
        let critical = self.critical_set(&state);
        Ok(self.score(&state, task, now, critical.as_ref()))
    }

    /// Tasks and edges for persistence snapshots.
    pub async fn snapshot(&self) -> (Vec<Task>, Vec<DependencyEdge>) {
        let state = self.state.read().await;
        (
            state.tasks.values().cloned().collect(),
            state.graph.edges(),
        )
    }

    /// Restore tasks and edges verbatim (replay path). Resource counters
    /// are rebuilt from tasks holding agents.
    pub async fn restore(&self, tasks: Vec<Task>, edges: Vec<DependencyEdge>) {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        for task in tasks {
            state.graph.add_node(task.id, task.estimated_effort_ms);
            state.tasks.insert(task.id, task);
        }
        for edge in edges {
            let _ = state.graph.add_dependency(edge.to, edge.from, edge.strength);
        }
        state.resources_used.clear();
        let holding: Vec<Vec<String>> = state
            .tasks
            .values()
            .filter(|t| t.status.holds_agent())
            .map(|t| t.required_resources.iter().cloned().collect())
            .collect();
        for tags in holding {
            for tag in tags {
                *state.resources_used.entry(tag).or_insert(0) += 1;
            }
        }
        state.critical_cache = None;
    }

    // ---- internal helpers -------------------------------------------------

    fn release_resources(used: &mut HashMap<String, u64>, tags: &[String]) {
        for tag in tags {
            if let Some(count) = used.get_mut(tag) {
                *count = count.saturating_sub(1);
            }
        }
    }

    fn trim_completions(
        completions: &mut VecDeque<(DateTime<Utc>, Option<String>)>,
        now: DateTime<Utc>,
        window_ms: u64,
    ) {
        let cutoff = now - Duration::milliseconds(window_ms as i64);
        while completions.front().is_some_and(|(at, _)| *at < cutoff) {
            completions.pop_front();
        }
    }

    fn fail_terminally(
        task: &mut Task,
        reason: &FailureReason,
        now: DateTime<Utc>,
    ) -> FabricResult<()> {
        task.transition_to(
            TaskStatus::Failed,
            now,
            serde_json::to_string(reason).ok(),
        )?;
        // Exhaust the budget so `retries_left` reports terminal.
        task.current_retries = task.max_retries;
        task.metadata.insert(
            "failure_kind".to_string(),
            MetadataValue::String(format!("{:?}", reason.kind).to_lowercase()),
        );
        Ok(())
    }

    fn apply_cascade(
        state: &mut SchedulerState,
        id: &TaskId,
        policy: CascadePolicy,
        reason: &FailureReason,
        now: DateTime<Utc>,
        events: &mut Vec<Event>,
        released: &mut Vec<(TaskId, AgentId)>,
    ) -> FabricResult<()> {
        match policy {
            CascadePolicy::Ignore => {}
            CascadePolicy::UnblockAsBlocked => {
                for dep_id in state.graph.direct_dependents(id) {
                    if let Some(dep) = state.tasks.get_mut(&dep_id) {
                        if dep.status == TaskStatus::Queued {
                            dep.transition_to(
                                TaskStatus::Blocked,
                                now,
                                Some(reason.message.clone()),
                            )?;
                            events.push(
                                Event::new(EventKind::StatusChanged, now)
                                    .task(dep_id)
                                    .meta("status", "blocked"),
                            );
                        }
                    }
                }
            }
            CascadePolicy::FailDependents => {
                let mut queue: VecDeque<TaskId> = state.graph.direct_dependents(id).into();
                let mut seen: HashSet<TaskId> = HashSet::new();
                while let Some(dep_id) = queue.pop_front() {
                    if !seen.insert(dep_id) {
                        continue;
                    }
                    queue.extend(state.graph.direct_dependents(&dep_id));
                    let Some(dep) = state.tasks.get_mut(&dep_id) else {
                        continue;
                    };
                    if dep.status.is_terminal() || dep.status == TaskStatus::Failed {
                        continue;
                    }
                    if let Some(agent) = dep.assigned_agent.clone() {
                        released.push((dep_id, agent));
                    }
                    let held = dep.status.holds_agent();
                    let tags: Vec<String> =
                        dep.required_resources.iter().cloned().collect();
                    // Queued/Blocked/Assigned/InProgress all have a legal
                    // path to Failed; anything else is skipped above.
                    Self::fail_terminally(dep, reason, now)?;
                    if held {
                        Self::release_resources(&mut state.resources_used, &tags);
                    }
                    state.boosts.remove(&dep_id);
                    events.push(
                        Event::new(EventKind::TaskFailed, now)
                            .task(dep_id)
                            .meta("retriable", false)
                            .meta("cascaded_from", id.to_string()),
                    );
                }
            }
        }
        Ok(())
    }

    fn retry_delay(&self, attempt: u32) -> u64 {
        let policy = &self.config.retry;
        let base = policy.initial_delay_ms as f64
            * policy.multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = base.min(policy.max_delay_ms as f64);
        let jitter_span = capped * policy.jitter;
        let jitter = if jitter_span > 0.0 {
            rand::thread_rng().gen_range(-jitter_span..=jitter_span)
        } else {
            0.0
        };
        (capped + jitter).max(0.0) as u64
    }

    fn critical_set(&self, state: &SchedulerState) -> Option<HashSet<TaskId>> {
        if self.config.strategy != SchedulingStrategy::DependencyAware {
            return None;
        }
        if let Some(cache) = &state.critical_cache {
            return Some(cache.clone());
        }
        state
            .graph
            .critical_path()
            .ok()
            .map(|a| a.critical_nodes.into_iter().collect())
    }

    fn global_utilization(&self, state: &SchedulerState) -> f64 {
        let mut used_total = 0u64;
        let mut capacity_total = 0u64;
        for (tag, capacity) in &self.config.resource_capacities {
            capacity_total += capacity;
            used_total += state.resources_used.get(tag).copied().unwrap_or(0);
        }
        if capacity_total == 0 {
            0.0
        } else {
            used_total as f64 / capacity_total as f64
        }
    }

    fn score(
        &self,
        state: &SchedulerState,
        task: &Task,
        now: DateTime<Utc>,
        critical: Option<&HashSet<TaskId>>,
    ) -> f64 {
        let w = &self.config.weights;
        let p = task.base_priority.weight();
        if self.config.strategy == SchedulingStrategy::Static {
            return w.priority * p + state.boosts.get(&task.id).copied().unwrap_or(0.0);
        }

        let age_ms = (now - task.created_at).num_milliseconds().max(0) as f64;
        let age = 1.0 - (-age_ms / self.config.age_saturation_ms as f64).exp();

        let deadline = task
            .deadline
            .map(|d| {
                let remaining_ms = (d - now).num_milliseconds() as f64;
                (1.0 - remaining_ms / self.config.deadline_window_ms as f64).max(0.0)
            })
            .unwrap_or(0.0);

        let impact = (1.0 + state.graph.transitive_dependents(&task.id).len() as f64).ln();
        let history = state.category_success_rate(task.category);

        let contention = {
            let capacitated: Vec<&String> = task
                .required_resources
                .iter()
                .filter(|t| self.config.resource_capacities.contains_key(*t))
                .collect();
            if capacitated.is_empty() {
                0.0
            } else {
                capacitated
                    .iter()
                    .map(|tag| {
                        let used =
                            state.resources_used.get(*tag).copied().unwrap_or(0) as f64;
                        let capacity = self.config.resource_capacities[*tag] as f64;
                        (used / capacity).min(1.0)
                    })
                    .sum::<f64>()
                    / capacitated.len() as f64
            }
        };
        let mut contention_weight = w.contention;
        if self.config.strategy == SchedulingStrategy::WorkloadAdaptive
            && self.global_utilization(state) > self.config.high_load_threshold
        {
            contention_weight *= 2.0;
        }

        let mut score = w.priority * p + w.age * age + w.deadline * deadline
            + w.dependency_impact * impact
            + w.history * history
            - contention_weight * contention;
        if let Some(critical) = critical {
            if critical.contains(&task.id) {
                score += w.critical_path;
            }
        }
        score + state.boosts.get(&task.id).copied().unwrap_or(0.0)
    }

    /// Score and order runnable candidates, applying resource gating with
    /// bounded look-ahead. Returns up to `k` task ids.
    fn select_runnable(
        &self,
        state: &SchedulerState,
        now: DateTime<Utc>,
        k: usize,
        filter: Option<&TaskFilter>,
    ) -> Vec<TaskId> {
        let completed = state.completed_ids();
        let critical = self.critical_set(state);

        let mut candidates: Vec<(&Task, f64)> = state
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Queued)
            .filter(|t| t.backoff_until.map_or(true, |until| now >= until))
            .filter(|t| filter.map_or(true, |f| f.matches(t)))
            .filter(|t| state.graph.hard_deps_satisfied(&t.id, &completed))
            .map(|t| (t, self.score(state, t, now, critical.as_ref())))
            .collect();
        candidates.sort_by(|(a, sa), (b, sb)| {
            sb.partial_cmp(sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.to_string().cmp(&b.id.to_string()))
        });

        let mut tentative_used = state.resources_used.clone();
        let mut picked = Vec::new();
        let mut skipped = 0usize;
        for (task, _) in candidates {
            if picked.len() >= k {
                break;
            }
            let fits = task.required_resources.iter().all(|tag| {
                match self.config.resource_capacities.get(tag) {
                    Some(capacity) => {
                        tentative_used.get(tag).copied().unwrap_or(0) + 1 <= *capacity
                    }
                    None => true,
                }
            });
            if fits {
                for tag in &task.required_resources {
                    *tentative_used.entry(tag.clone()).or_insert(0) += 1;
                }
                picked.push(task.id);
            } else if task.base_priority == Priority::Critical {
                // A resource-starved Critical head holds the line: no
                // lower-priority task may jump it.
                break;
            } else {
                skipped += 1;
                if skipped > self.config.lookahead_depth {
                    break;
                }
            }
        }
        picked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn scheduler_with(config: SchedulerConfig) -> (Arc<PriorityScheduler>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let bus = Arc::new(EventBus::new(clock.clone()));
        (
            Arc::new(PriorityScheduler::new(config, clock.clone(), bus)),
            clock,
        )
    }

    fn scheduler() -> (Arc<PriorityScheduler>, Arc<ManualClock>) {
        scheduler_with(SchedulerConfig::default())
    }

    fn task(clock: &ManualClock, priority: Priority) -> Task {
        Task::new("work", TaskCategory::Feature, priority, clock.now())
    }

    #[tokio::test]
    async fn duplicate_id_is_a_conflict() {
        let (scheduler, clock) = scheduler();
        let t = task(&clock, Priority::Medium);
        let dup = t.clone();
        scheduler.add_task(t).await.unwrap();
        let err = scheduler.add_task(dup).await.unwrap_err();
        assert!(matches!(err, FabricError::Conflict(_)));
    }

    #[tokio::test]
    async fn unknown_dependency_is_rejected() {
        let (scheduler, clock) = scheduler();
        let mut t = task(&clock, Priority::Medium);
        t.dependencies.insert(uuid::Uuid::new_v4());
        let err = scheduler.add_task(t).await.unwrap_err();
        assert!(matches!(err, FabricError::Validation(_)));
    }

    #[tokio::test]
    async fn hard_cycle_edge_is_rejected_with_cycle() {
        let (scheduler, clock) = scheduler();
        let a = scheduler.add_task(task(&clock, Priority::Medium)).await.unwrap();
        let mut b_task = task(&clock, Priority::Medium);
        b_task.dependencies.insert(a);
        let b = scheduler.add_task(b_task).await.unwrap();

        let err = scheduler
            .add_dependency(a, b, EdgeStrength::Hard)
            .await
            .unwrap_err();
        match err {
            FabricError::Precondition { cycle, .. } => {
                assert!(cycle.contains(&a) && cycle.contains(&b));
                assert_eq!(cycle.first(), cycle.last());
            }
            other => panic!("expected precondition, got {other:?}"),
        }
        // No state change: B still runnable only after A.
        let next = scheduler.get_next_task(None).await.unwrap();
        assert_eq!(next.id, a);
    }

    #[tokio::test]
    async fn selection_respects_hard_dependencies() {
        let (scheduler, clock) = scheduler();
        let a = scheduler.add_task(task(&clock, Priority::Low)).await.unwrap();
        let mut b_task = task(&clock, Priority::Critical);
        b_task.dependencies.insert(a);
        let b = scheduler.add_task(b_task).await.unwrap();

        // B outranks A but is not runnable until A completes.
        let batch = scheduler.get_next_tasks(10, None).await;
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, a);

        let claimed = scheduler
            .claim_next_task(None, &"agent-1".to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, a);
        assert_eq!(claimed.status, TaskStatus::Assigned);
        assert_eq!(claimed.assigned_agent.as_deref(), Some("agent-1"));

        scheduler.mark_started(&a).await.unwrap();
        scheduler
            .update_task_result(&a, &TaskResult::ok(5))
            .await
            .unwrap();

        let next = scheduler.get_next_task(None).await.unwrap();
        assert_eq!(next.id, b);
    }

    #[tokio::test]
    async fn capability_filter_excludes_mismatches() {
        let (scheduler, clock) = scheduler();
        let mut t = task(&clock, Priority::High);
        t.required_capabilities.insert("backend".to_string());
        t.required_capabilities.insert("database".to_string());
        scheduler.add_task(t).await.unwrap();

        let filter = TaskFilter {
            capabilities: Some(["frontend".to_string()].into_iter().collect()),
            ..Default::default()
        };
        assert!(scheduler.get_next_task(Some(&filter)).await.is_none());

        let filter = TaskFilter {
            capabilities: Some(
                ["backend".to_string(), "database".to_string()]
                    .into_iter()
                    .collect(),
            ),
            ..Default::default()
        };
        assert!(scheduler.get_next_task(Some(&filter)).await.is_some());
    }

    #[tokio::test]
    async fn retry_backoff_gates_requeue() {
        let (scheduler, clock) = scheduler();
        let id = scheduler.add_task(task(&clock, Priority::Medium)).await.unwrap();
        scheduler
            .claim_next_task(None, &"agent-1".to_string())
            .await
            .unwrap();
        scheduler.mark_started(&id).await.unwrap();

        let updated = scheduler
            .update_task_result(&id, &TaskResult::failed(10, "flaky"))
            .await
            .unwrap();
        assert_eq!(updated.status, TaskStatus::Queued);
        assert_eq!(updated.current_retries, 1);
        assert!(updated.backoff_until.is_some());

        // Not runnable until the backoff elapses.
        assert!(scheduler.get_next_task(None).await.is_none());
        clock.advance(Duration::milliseconds(2_000));
        assert!(scheduler.get_next_task(None).await.is_some());
    }

    #[tokio::test]
    async fn exhausted_retries_fail_terminally_and_cascade() {
        let (scheduler, clock) = scheduler();
        let mut root = task(&clock, Priority::Medium);
        root.max_retries = 0;
        let root_id = scheduler.add_task(root).await.unwrap();
        let mut dependent = task(&clock, Priority::Medium);
        dependent.dependencies.insert(root_id);
        let dep_id = scheduler.add_task(dependent).await.unwrap();

        scheduler
            .claim_next_task(None, &"agent-1".to_string())
            .await
            .unwrap();
        scheduler.mark_started(&root_id).await.unwrap();
        let updated = scheduler
            .update_task_result(&root_id, &TaskResult::failed(10, "boom"))
            .await
            .unwrap();
        assert_eq!(updated.status, TaskStatus::Failed);
        assert!(!updated.retries_left());

        // FailDependents cascades to the dependent.
        let dep = scheduler.get_task(&dep_id).await.unwrap();
        assert_eq!(dep.status, TaskStatus::Failed);
        assert!(!dep.retries_left());
    }

    #[tokio::test]
    async fn unblock_as_blocked_parks_dependents() {
        let config = SchedulerConfig {
            cascade_policy: CascadePolicy::UnblockAsBlocked,
            ..Default::default()
        };
        let (scheduler, clock) = scheduler_with(config);
        let root_id = scheduler.add_task(task(&clock, Priority::Medium)).await.unwrap();
        let mut dependent = task(&clock, Priority::Medium);
        dependent.dependencies.insert(root_id);
        let dep_id = scheduler.add_task(dependent).await.unwrap();

        scheduler.cancel(&root_id, "operator request").await.unwrap();
        let dep = scheduler.get_task(&dep_id).await.unwrap();
        assert_eq!(dep.status, TaskStatus::Blocked);
    }

    #[tokio::test]
    async fn cancel_releases_agent_and_resources() {
        let config = SchedulerConfig {
            resource_capacities: [("gpu".to_string(), 1)].into_iter().collect(),
            ..Default::default()
        };
        let (scheduler, clock) = scheduler_with(config);
        let mut t = task(&clock, Priority::Medium);
        t.required_resources.insert("gpu".to_string());
        let id = scheduler.add_task(t).await.unwrap();
        scheduler
            .claim_next_task(None, &"agent-1".to_string())
            .await
            .unwrap();

        let mut blocked = task(&clock, Priority::Medium);
        blocked.required_resources.insert("gpu".to_string());
        scheduler.add_task(blocked).await.unwrap();
        // gpu capacity is taken by the claimed task.
        assert!(scheduler.get_next_task(None).await.is_none());

        let outcome = scheduler.cancel(&id, "no longer needed").await.unwrap();
        assert_eq!(outcome.task.status, TaskStatus::Cancelled);
        assert_eq!(outcome.released_agents.len(), 1);
        // Resource released: the second task becomes runnable.
        assert!(scheduler.get_next_task(None).await.is_some());
    }

    #[tokio::test]
    async fn starvation_boost_lifts_low_priority_task() {
        let config = SchedulerConfig {
            starvation_mode: StarvationMode::AdaptiveBoost,
            max_starvation_time_ms: 1_000,
            max_priority_boost: 500.0,
            ..Default::default()
        };
        let (scheduler, clock) = scheduler_with(config);

        let low = scheduler.add_task(task(&clock, Priority::Low)).await.unwrap();
        // The Low task starves while a fresh High backlog keeps arriving.
        clock.advance(Duration::milliseconds(2_000));
        for _ in 0..20 {
            scheduler.add_task(task(&clock, Priority::High)).await.unwrap();
        }
        // Without a scan, a High task wins.
        assert_eq!(
            scheduler.get_next_task(None).await.unwrap().base_priority,
            Priority::High
        );

        let boosted = scheduler.run_starvation_scan().await;
        assert!(boosted.contains(&low));
        // Only the starving task is boosted, and 500 dwarfs the
        // High-Low base gap.
        assert_eq!(scheduler.get_next_task(None).await.unwrap().id, low);
    }

    #[tokio::test]
    async fn quota_mode_boosts_underserved_originator() {
        let config = SchedulerConfig {
            starvation_mode: StarvationMode::Quota,
            min_execution_quota: 0.25,
            ..Default::default()
        };
        let (scheduler, clock) = scheduler_with(config);

        // Originator "a" has all the completions in the window.
        for _ in 0..4 {
            let mut t = task(&clock, Priority::Medium);
            t.originator = Some("a".to_string());
            let id = scheduler.add_task(t).await.unwrap();
            scheduler
                .claim_next_task(None, &"agent-1".to_string())
                .await
                .unwrap();
            scheduler.mark_started(&id).await.unwrap();
            scheduler
                .update_task_result(&id, &TaskResult::ok(5))
                .await
                .unwrap();
        }

        let mut hungry = task(&clock, Priority::Low);
        hungry.originator = Some("b".to_string());
        let hungry_id = scheduler.add_task(hungry).await.unwrap();
        let mut fed = task(&clock, Priority::High);
        fed.originator = Some("a".to_string());
        scheduler.add_task(fed).await.unwrap();

        let boosted = scheduler.run_starvation_scan().await;
        assert!(boosted.contains(&hungry_id));
        assert_eq!(scheduler.get_next_task(None).await.unwrap().id, hungry_id);
    }

    #[tokio::test]
    async fn resource_lookahead_skips_blocked_head() {
        let config = SchedulerConfig {
            resource_capacities: [("gpu".to_string(), 0)].into_iter().collect(),
            ..Default::default()
        };
        let (scheduler, clock) = scheduler_with(config);
        let mut gpu_task = task(&clock, Priority::High);
        gpu_task.required_resources.insert("gpu".to_string());
        scheduler.add_task(gpu_task).await.unwrap();
        let cpu_task = scheduler.add_task(task(&clock, Priority::Low)).await.unwrap();

        // High-priority head is resource-blocked; look-ahead picks the Low.
        assert_eq!(scheduler.get_next_task(None).await.unwrap().id, cpu_task);
    }

    #[tokio::test]
    async fn critical_resource_blocked_head_holds_the_line() {
        let config = SchedulerConfig {
            resource_capacities: [("gpu".to_string(), 0)].into_iter().collect(),
            ..Default::default()
        };
        let (scheduler, clock) = scheduler_with(config);
        let mut gpu_task = task(&clock, Priority::Critical);
        gpu_task.required_resources.insert("gpu".to_string());
        scheduler.add_task(gpu_task).await.unwrap();
        scheduler.add_task(task(&clock, Priority::Low)).await.unwrap();

        assert!(scheduler.get_next_task(None).await.is_none());
    }

    #[tokio::test]
    async fn score_is_monotonic_in_wait_time() {
        let (scheduler, clock) = scheduler();
        let id = scheduler.add_task(task(&clock, Priority::Medium)).await.unwrap();
        let s1 = scheduler.score_of(&id).await.unwrap();
        clock.advance(Duration::milliseconds(60_000));
        let s2 = scheduler.score_of(&id).await.unwrap();
        clock.advance(Duration::milliseconds(600_000));
        let s3 = scheduler.score_of(&id).await.unwrap();
        assert!(s2 > s1);
        assert!(s3 > s2);
    }

    #[tokio::test]
    async fn deadline_proximity_raises_score() {
        let (scheduler, clock) = scheduler();
        let mut near = task(&clock, Priority::Medium);
        near.deadline = Some(clock.now() + Duration::minutes(5));
        let near_id = scheduler.add_task(near).await.unwrap();
        let mut far = task(&clock, Priority::Medium);
        far.deadline = Some(clock.now() + Duration::hours(10));
        let far_id = scheduler.add_task(far).await.unwrap();

        let near_score = scheduler.score_of(&near_id).await.unwrap();
        let far_score = scheduler.score_of(&far_id).await.unwrap();
        assert!(near_score > far_score);
    }

    #[tokio::test]
    async fn completion_unblocks_parked_dependents() {
        let config = SchedulerConfig {
            cascade_policy: CascadePolicy::UnblockAsBlocked,
            ..Default::default()
        };
        let (scheduler, clock) = scheduler_with(config);
        let a = scheduler.add_task(task(&clock, Priority::Medium)).await.unwrap();
        let b = scheduler.add_task(task(&clock, Priority::Medium)).await.unwrap();
        let mut c = task(&clock, Priority::Medium);
        c.dependencies.insert(a);
        c.dependencies.insert(b);
        let c_id = scheduler.add_task(c).await.unwrap();

        // Cancel B: C is parked Blocked.
        scheduler.cancel(&b, "superseded").await.unwrap();
        assert_eq!(
            scheduler.get_task(&c_id).await.unwrap().status,
            TaskStatus::Blocked
        );

        // A completing re-queues C.
        scheduler
            .claim_next_task(None, &"agent-1".to_string())
            .await
            .unwrap();
        scheduler.mark_started(&a).await.unwrap();
        scheduler
            .update_task_result(&a, &TaskResult::ok(5))
            .await
            .unwrap();
        assert_eq!(
            scheduler.get_task(&c_id).await.unwrap().status,
            TaskStatus::Queued
        );
    }

    #[tokio::test]
    async fn static_strategy_ignores_age() {
        let config = SchedulerConfig {
            strategy: SchedulingStrategy::Static,
            ..Default::default()
        };
        let (scheduler, clock) = scheduler_with(config);
        let id = scheduler.add_task(task(&clock, Priority::Medium)).await.unwrap();
        let s1 = scheduler.score_of(&id).await.unwrap();
        clock.advance(Duration::hours(1));
        let s2 = scheduler.score_of(&id).await.unwrap();
        assert_eq!(s1, s2);
    }

    #[tokio::test]
    async fn retention_archives_and_drops() {
        let config = SchedulerConfig {
            task_history_retention_ms: 1_000,
            ..Default::default()
        };
        let (scheduler, clock) = scheduler_with(config);
        let id = scheduler.add_task(task(&clock, Priority::Medium)).await.unwrap();
        scheduler
            .claim_next_task(None, &"agent-1".to_string())
            .await
            .unwrap();
        scheduler.mark_started(&id).await.unwrap();
        scheduler
            .update_task_result(&id, &TaskResult::ok(1))
            .await
            .unwrap();

        clock.advance(Duration::milliseconds(2_000));
        scheduler.archive_expired().await;
        assert_eq!(
            scheduler.get_task(&id).await.unwrap().status,
            TaskStatus::Archived
        );

        clock.advance(Duration::milliseconds(2_000));
        scheduler.archive_expired().await;
        assert!(scheduler.get_task(&id).await.is_err());
    }
}
