//! Coordinator: the control loop
//!
//! Drives the lifecycle: drain the scheduler, discover candidates, let
//! the balancer pick an agent, dispatch through the execution
//! collaborator, await the outcome under the command timeout, and feed
//! everything back into the scheduler, registry, balancer, metrics and
//! store. Also owns heartbeat bookkeeping: a task whose executor misses
//! heartbeats for the configured timeout is failed with
//! `HEARTBEAT_TIMEOUT` and the agent's breaker records a failure.

use crate::balancer::LoadBalancer;
use crate::clock::Clock;
use crate::event_bus::EventBus;
use crate::executor::{ExecutionContext, Heartbeat, TaskExecutor};
use crate::metrics::FabricMetrics;
use crate::registry::{AgentQuery, AgentRegistry};
use crate::scheduler::PriorityScheduler;
use crate::store::{StateStore, WalRecord};
use crate::types::{AgentId, FabricError, FabricResult, Task, TaskId, TaskResult};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Per-task phase timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Environment preparation budget
    pub setup_ms: u64,
    /// Execution budget; the hard deadline for the executor call
    pub command_ms: u64,
    /// Result validation budget
    pub validation_ms: u64,
    /// Teardown budget
    pub cleanup_ms: u64,
    /// Max silence between executor heartbeats while a task runs
    pub heartbeat_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            setup_ms: 30_000,
            command_ms: 300_000,
            validation_ms: 60_000,
            cleanup_ms: 30_000,
            heartbeat_ms: 60_000,
        }
    }
}

/// Coordinator tuning knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Phase timeouts
    pub timeouts: TimeoutConfig,
    /// Cadence of the dispatch/sweep loop
    pub poll_interval_ms: u64,
    /// Upper bound on concurrently dispatched tasks
    pub max_inflight: usize,
    /// How many queue heads to try per dispatch cycle
    pub dispatch_fanout: usize,
    /// Cadence of the rebalancing pass
    pub rebalance_interval_ms: u64,
    /// Cadence of state snapshots to the store
    pub snapshot_interval_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            timeouts: TimeoutConfig::default(),
            poll_interval_ms: 500,
            max_inflight: 64,
            dispatch_fanout: 8,
            rebalance_interval_ms: 60_000,
            snapshot_interval_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone)]
struct InflightEntry {
    agent_id: AgentId,
    context: ExecutionContext,
    started_at: Option<DateTime<Utc>>,
    last_heartbeat_at: DateTime<Utc>,
}

/// The control loop gluing the components together
pub struct Coordinator {
    config: CoordinatorConfig,
    clock: Arc<dyn Clock>,
    bus: Arc<EventBus>,
    scheduler: Arc<PriorityScheduler>,
    registry: Arc<AgentRegistry>,
    balancer: Arc<LoadBalancer>,
    metrics: Arc<FabricMetrics>,
    executor: Arc<dyn TaskExecutor>,
    store: Arc<dyn StateStore>,
    heartbeat_tx: async_channel::Sender<Heartbeat>,
    heartbeat_rx: async_channel::Receiver<Heartbeat>,
    inflight: RwLock<HashMap<TaskId, InflightEntry>>,
    shutdown: Arc<RwLock<bool>>,
}

impl Coordinator {
    /// Wire a coordinator over the shared components.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: CoordinatorConfig,
        clock: Arc<dyn Clock>,
        bus: Arc<EventBus>,
        scheduler: Arc<PriorityScheduler>,
        registry: Arc<AgentRegistry>,
        balancer: Arc<LoadBalancer>,
        metrics: Arc<FabricMetrics>,
        executor: Arc<dyn TaskExecutor>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        let (heartbeat_tx, heartbeat_rx) = async_channel::unbounded();
        Self {
            config,
            clock,
            bus,
            scheduler,
            registry,
            balancer,
            metrics,
            executor,
            store,
            heartbeat_tx,
            heartbeat_rx,
            inflight: RwLock::new(HashMap::new()),
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    /// Shared shutdown flag; the facade flips it on shutdown.
    pub fn shutdown_flag(&self) -> Arc<RwLock<bool>> {
        self.shutdown.clone()
    }

    /// Number of dispatches currently in flight.
    pub async fn inflight_count(&self) -> usize {
        self.inflight.read().await.len()
    }

    /// Run the control loop until the shutdown flag flips.
    pub async fn run(self: Arc<Self>) {
        info!("coordinator loop starting");
        let mut tick =
            tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms));
        let mut last_adjustment = self.clock.now();
        let mut last_rebalance = self.clock.now();
        let mut last_snapshot = self.clock.now();

        loop {
            if *self.shutdown.read().await {
                break;
            }
            tokio::select! {
                _ = tick.tick() => {
                    self.dispatch_cycle().await;
                    self.sweep_heartbeat_timeouts().await;
                    self.registry.sweep_liveness().await;

                    let now = self.clock.now();
                    let adjustment =
                        ChronoDuration::milliseconds(self.scheduler.config().adjustment_interval_ms as i64);
                    if now - last_adjustment >= adjustment {
                        last_adjustment = now;
                        self.scheduler.run_starvation_scan().await;
                        self.scheduler.archive_expired().await;
                    }
                    if now - last_rebalance
                        >= ChronoDuration::milliseconds(self.config.rebalance_interval_ms as i64)
                    {
                        last_rebalance = now;
                        if let Err(err) = self.apply_rebalance().await {
                            warn!(error = %err, "rebalance pass failed");
                        }
                    }
                    if now - last_snapshot
                        >= ChronoDuration::milliseconds(self.config.snapshot_interval_ms as i64)
                    {
                        last_snapshot = now;
                        if let Err(err) = self.write_snapshot().await {
                            warn!(error = %err, "snapshot failed");
                        }
                    }
                    self.refresh_gauges().await;
                }
                Ok(heartbeat) = self.heartbeat_rx.recv() => {
                    self.record_heartbeat(heartbeat).await;
                }
            }
        }
        info!("coordinator loop stopped");
    }

    /// One dispatch pass: bind runnable tasks to agents and spawn their
    /// executions, up to the inflight cap.
    pub async fn dispatch_cycle(self: &Arc<Self>) {
        loop {
            {
                let inflight = self.inflight.read().await;
                if inflight.len() >= self.config.max_inflight {
                    return;
                }
            }
            let candidates = self
                .scheduler
                .get_next_tasks(self.config.dispatch_fanout, None)
                .await;
            if candidates.is_empty() {
                return;
            }

            let mut dispatched = false;
            for task in candidates {
                if self.try_dispatch(&task).await {
                    dispatched = true;
                    break;
                }
            }
            if !dispatched {
                // Runnable work exists but no agent can take any of it
                // right now; wait for the next tick.
                return;
            }
        }
    }

    /// Try to bind one specific task; returns whether a dispatch started.
    async fn try_dispatch(self: &Arc<Self>, task: &Task) -> bool {
        let query = AgentQuery {
            required_capabilities: task.required_capabilities.clone(),
            require_headroom: true,
            ..Default::default()
        };
        let candidates: Vec<_> = self
            .registry
            .discover(&query)
            .await
            .into_iter()
            .map(|c| c.agent)
            .collect();
        if candidates.is_empty() {
            return false;
        }
        let Some(agent_id) = self.balancer.select(task, &candidates).await else {
            return false;
        };

        // Optimistic selection: the claim re-validates under the lock and
        // simply loses the race if the world moved.
        let claimed = match self.scheduler.claim_task(&task.id, &agent_id).await {
            Ok(claimed) => claimed,
            Err(FabricError::Conflict(_)) | Err(FabricError::ResourceExhausted(_)) => {
                return false;
            }
            Err(err) => {
                warn!(task = %task.id, error = %err, "claim failed");
                return false;
            }
        };
        if let Err(err) = self.registry.assign_task(&agent_id, claimed.id).await {
            // Agent filled up between discovery and claim; put the task back.
            debug!(task = %claimed.id, agent = %agent_id, error = %err, "assignment raced");
            let _ = self
                .scheduler
                .requeue(&claimed.id, "agent capacity race")
                .await;
            return false;
        }

        let now = self.clock.now();
        if let Some(queued_at) = claimed.queued_at {
            self.metrics
                .record_dispatch_latency((now - queued_at).num_milliseconds().max(0) as f64);
        }
        let _ = self
            .store
            .append(WalRecord::TaskUpserted {
                task: Box::new(claimed.clone()),
            })
            .await;

        let deadline = now + ChronoDuration::milliseconds(self.config.timeouts.command_ms as i64);
        let context = ExecutionContext::new(self.heartbeat_tx.clone(), Some(deadline));
        self.inflight.write().await.insert(
            claimed.id,
            InflightEntry {
                agent_id: agent_id.clone(),
                context: context.clone(),
                started_at: None,
                last_heartbeat_at: now,
            },
        );

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.dispatch_one(claimed, agent_id, context).await;
        });
        true
    }

    /// Execute one dispatched task end to end.
    async fn dispatch_one(&self, task: Task, agent_id: AgentId, context: ExecutionContext) {
        let agent = match self.registry.get(&agent_id).await {
            Ok(agent) => agent,
            Err(err) => {
                error!(task = %task.id, agent = %agent_id, error = %err, "agent vanished before start");
                self.finish(
                    &task.id,
                    &agent_id,
                    &TaskResult::failed(0, format!("agent {agent_id} not found")),
                )
                .await;
                return;
            }
        };

        match self.scheduler.mark_started(&task.id).await {
            Ok(_) => {
                let now = self.clock.now();
                let mut inflight = self.inflight.write().await;
                if let Some(entry) = inflight.get_mut(&task.id) {
                    entry.started_at = Some(now);
                    entry.last_heartbeat_at = now;
                }
            }
            Err(err) => {
                // Cancelled between claim and start; nothing to execute.
                debug!(task = %task.id, error = %err, "start aborted");
                self.inflight.write().await.remove(&task.id);
                return;
            }
        }

        let budget = Duration::from_millis(self.config.timeouts.command_ms);
        let outcome = tokio::time::timeout(
            budget,
            self.executor.execute(&task, &agent, &context),
        )
        .await;

        let result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(FabricError::ExecutorFailed { message, retriable })) => TaskResult {
                retriable,
                ..TaskResult::failed(0, message)
            },
            Ok(Err(err)) => TaskResult::failed(0, err.to_string()),
            Err(_elapsed) => {
                context.cancel();
                warn!(task = %task.id, agent = %agent_id, "command timeout");
                TaskResult::failed(
                    self.config.timeouts.command_ms,
                    format!(
                        "COMMAND_TIMEOUT after {} ms",
                        self.config.timeouts.command_ms
                    ),
                )
            }
        };
        self.finish(&task.id, &agent_id, &result).await;
    }

    /// Feed an outcome back into scheduler, registry, balancer, metrics
    /// and the store. Safe to race with the heartbeat sweep: whoever gets
    /// there second finds the task already settled and stands down.
    async fn finish(&self, task_id: &TaskId, agent_id: &AgentId, result: &TaskResult) {
        if self.inflight.write().await.remove(task_id).is_none() {
            // The heartbeat sweep already settled this dispatch.
            return;
        }

        let updated = match self.scheduler.update_task_result(task_id, result).await {
            Ok(updated) => Some(updated),
            Err(FabricError::Conflict(msg)) => {
                debug!(task = %task_id, %msg, "result arrived after settlement");
                None
            }
            Err(err) => {
                error!(task = %task_id, error = %err, "result handling failed");
                self.bus
                    .publish(
                        crate::event_bus::Event::new(
                            crate::event_bus::EventKind::InternalError,
                            self.clock.now(),
                        )
                        .task(*task_id)
                        .meta("error", err.to_string()),
                    )
                    .await;
                None
            }
        };

        let _ = self
            .registry
            .record_completion(agent_id, task_id, result.success, result.duration_ms)
            .await;
        if result.success {
            self.balancer.record_success(agent_id).await;
            self.metrics.record_completed(result.duration_ms);
        } else {
            self.balancer.record_failure(agent_id).await;
            let retried = updated
                .as_ref()
                .is_some_and(|t| t.status == crate::types::TaskStatus::Queued);
            self.metrics.record_failed(retried);
        }

        if let Some(updated) = updated {
            let _ = self
                .store
                .append(WalRecord::TaskUpserted {
                    task: Box::new(updated),
                })
                .await;
        }
        if let Ok(agent) = self.registry.get(agent_id).await {
            let _ = self
                .store
                .append(WalRecord::AgentUpserted {
                    agent: Box::new(agent),
                })
                .await;
        }
        if let Some(breaker) = self.balancer.breaker(agent_id).await {
            let _ = self
                .store
                .append(WalRecord::BreakerUpserted {
                    agent_id: agent_id.clone(),
                    breaker,
                })
                .await;
        }
    }

    /// Record an executor heartbeat for an in-flight task.
    pub async fn record_heartbeat(&self, heartbeat: Heartbeat) {
        let mut inflight = self.inflight.write().await;
        if let Some(entry) = inflight.get_mut(&heartbeat.task_id) {
            entry.last_heartbeat_at = heartbeat.at;
            let agent_id = entry.agent_id.clone();
            drop(inflight);
            let _ = self
                .registry
                .heartbeat(&agent_id, crate::registry::HeartbeatStats::default())
                .await;
        }
    }

    /// Fail in-flight tasks whose executors went silent past the
    /// heartbeat timeout. The failure is retry-eligible and counts
    /// against the agent's breaker.
    pub async fn sweep_heartbeat_timeouts(&self) {
        let now = self.clock.now();
        let timeout = ChronoDuration::milliseconds(self.config.timeouts.heartbeat_ms as i64);
        let stale: Vec<(TaskId, AgentId, ExecutionContext)> = {
            let inflight = self.inflight.read().await;
            inflight
                .iter()
                .filter(|(_, entry)| entry.started_at.is_some())
                .filter(|(_, entry)| now - entry.last_heartbeat_at > timeout)
                .map(|(id, entry)| (*id, entry.agent_id.clone(), entry.context.clone()))
                .collect()
        };

        for (task_id, agent_id, context) in stale {
            warn!(task = %task_id, agent = %agent_id, "heartbeat timeout");
            context.cancel();
            self.finish(
                &task_id,
                &agent_id,
                &TaskResult::failed(
                    self.config.timeouts.heartbeat_ms,
                    "HEARTBEAT_TIMEOUT: executor went silent",
                ),
            )
            .await;
        }
    }

    /// Apply non-preempting rebalance moves proposed by the balancer.
    pub async fn apply_rebalance(&self) -> FabricResult<()> {
        let agents = self.registry.list().await;
        let movable: Vec<Task> = self
            .scheduler
            .list_tasks()
            .await
            .into_iter()
            .filter(|t| t.status == crate::types::TaskStatus::Assigned)
            .collect();
        let moves = self.balancer.rebalance(&agents, &movable).await?;
        for mv in moves.into_iter().filter(|m| !m.preempts) {
            // A task already handed to an executor stays where it is;
            // moves only apply to claims no dispatch has picked up.
            if self.inflight.read().await.contains_key(&mv.task_id) {
                continue;
            }
            if self
                .registry
                .assign_task(&mv.to_agent, mv.task_id)
                .await
                .is_err()
            {
                continue;
            }
            match self.scheduler.reassign(&mv.task_id, &mv.to_agent).await {
                Ok(_) => {
                    let _ = self.registry.release_task(&mv.from_agent, &mv.task_id).await;
                }
                Err(err) => {
                    debug!(task = %mv.task_id, error = %err, "rebalance move lost the race");
                    let _ = self.registry.release_task(&mv.to_agent, &mv.task_id).await;
                }
            }
        }
        Ok(())
    }

    /// Write a full state snapshot to the store.
    pub async fn write_snapshot(&self) -> FabricResult<()> {
        let (tasks, edges) = self.scheduler.snapshot().await;
        let snapshot = crate::store::StateSnapshot {
            tasks,
            agents: self.registry.list().await,
            edges,
            breakers: self.balancer.breaker_snapshots().await,
            taken_at: Some(self.clock.now()),
        };
        self.store.write_snapshot(&snapshot).await
    }

    async fn refresh_gauges(&self) {
        let stats = self.scheduler.stats().await;
        self.metrics.set_queue_depth(stats.queued);
        self.metrics
            .set_agents_registered(self.registry.list().await.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::{BalancerConfig, BalanceStrategy};
    use crate::clock::ManualClock;
    use crate::registry::RegistryConfig;
    use crate::scheduler::SchedulerConfig;
    use crate::store::MemoryStore;
    use crate::types::{Agent, Priority, TaskCategory};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct InstantExecutor {
        fail_first: AtomicUsize,
    }

    #[async_trait]
    impl TaskExecutor for InstantExecutor {
        async fn execute(
            &self,
            _task: &Task,
            _agent: &Agent,
            ctx: &ExecutionContext,
        ) -> FabricResult<TaskResult> {
            ctx.heartbeat(_task.id, Utc::now());
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Ok(TaskResult::failed(5, "injected failure"));
            }
            Ok(TaskResult::ok(5))
        }
    }

    struct Harness {
        coordinator: Arc<Coordinator>,
        scheduler: Arc<PriorityScheduler>,
        registry: Arc<AgentRegistry>,
        clock: Arc<ManualClock>,
    }

    async fn harness(failures: usize) -> Harness {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let bus = Arc::new(EventBus::new(clock.clone()));
        let scheduler = Arc::new(PriorityScheduler::new(
            SchedulerConfig::default(),
            clock.clone(),
            bus.clone(),
        ));
        let registry = Arc::new(AgentRegistry::new(
            RegistryConfig::default(),
            clock.clone(),
            bus.clone(),
        ));
        let balancer = Arc::new(LoadBalancer::new(
            BalancerConfig {
                strategy: BalanceStrategy::LeastLoaded,
                ..Default::default()
            },
            clock.clone(),
        ));
        let metrics = Arc::new(FabricMetrics::new().unwrap());
        let executor = Arc::new(InstantExecutor {
            fail_first: AtomicUsize::new(failures),
        });
        let store = Arc::new(MemoryStore::new());
        let coordinator = Arc::new(Coordinator::new(
            CoordinatorConfig::default(),
            clock.clone(),
            bus,
            scheduler.clone(),
            registry.clone(),
            balancer,
            metrics,
            executor,
            store,
        ));
        Harness {
            coordinator,
            scheduler,
            registry,
            clock,
        }
    }

    async fn settle(harness: &Harness) {
        // Drain spawned dispatches without a running control loop.
        for _ in 0..50 {
            if harness.coordinator.inflight_count().await == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn dispatches_and_completes_a_task() {
        let h = harness(0).await;
        h.registry
            .register("a1".to_string(), HashSet::new(), 2)
            .await
            .unwrap();
        let id = h
            .scheduler
            .add_task(Task::new("t", TaskCategory::Feature, Priority::Medium, h.clock.now()))
            .await
            .unwrap();

        h.coordinator.dispatch_cycle().await;
        settle(&h).await;

        let task = h.scheduler.get_task(&id).await.unwrap();
        assert_eq!(task.status, crate::types::TaskStatus::Completed);
        let agent = h.registry.get(&"a1".to_string()).await.unwrap();
        assert!(agent.current_tasks.is_empty());
        assert_eq!(agent.performance.completed_tasks, 1);
    }

    #[tokio::test]
    async fn capability_mismatch_leaves_task_queued() {
        let h = harness(0).await;
        h.registry
            .register(
                "frontend-only".to_string(),
                ["frontend".to_string()].into_iter().collect(),
                2,
            )
            .await
            .unwrap();
        let mut task = Task::new("t", TaskCategory::Feature, Priority::High, h.clock.now());
        task.required_capabilities.insert("backend".to_string());
        task.required_capabilities.insert("database".to_string());
        let id = h.scheduler.add_task(task).await.unwrap();

        h.coordinator.dispatch_cycle().await;
        settle(&h).await;

        assert_eq!(
            h.scheduler.get_task(&id).await.unwrap().status,
            crate::types::TaskStatus::Queued
        );
        let agent = h.registry.get(&"frontend-only".to_string()).await.unwrap();
        assert!(agent.current_tasks.is_empty());
    }

    #[tokio::test]
    async fn failed_execution_is_requeued_for_retry() {
        let h = harness(1).await;
        h.registry
            .register("a1".to_string(), HashSet::new(), 2)
            .await
            .unwrap();
        let id = h
            .scheduler
            .add_task(Task::new("t", TaskCategory::Feature, Priority::Medium, h.clock.now()))
            .await
            .unwrap();

        h.coordinator.dispatch_cycle().await;
        settle(&h).await;

        let task = h.scheduler.get_task(&id).await.unwrap();
        assert_eq!(task.status, crate::types::TaskStatus::Queued);
        assert_eq!(task.current_retries, 1);

        // After the backoff the retry goes through and completes.
        h.clock.advance(ChronoDuration::milliseconds(5_000));
        h.coordinator.dispatch_cycle().await;
        settle(&h).await;
        assert_eq!(
            h.scheduler.get_task(&id).await.unwrap().status,
            crate::types::TaskStatus::Completed
        );
    }

    #[tokio::test]
    async fn heartbeat_sweep_fails_silent_tasks() {
        let h = harness(0).await;
        h.registry
            .register("a1".to_string(), HashSet::new(), 2)
            .await
            .unwrap();
        let task = Task::new("t", TaskCategory::Feature, Priority::Medium, h.clock.now());
        let id = h.scheduler.add_task(task).await.unwrap();

        // Claim and start by hand so no executor future is attached.
        h.scheduler.claim_task(&id, &"a1".to_string()).await.unwrap();
        h.registry.assign_task(&"a1".to_string(), id).await.unwrap();
        h.scheduler.mark_started(&id).await.unwrap();
        let now = h.clock.now();
        let (tx, _rx) = async_channel::unbounded();
        h.coordinator.inflight.write().await.insert(
            id,
            InflightEntry {
                agent_id: "a1".to_string(),
                context: ExecutionContext::new(tx, None),
                started_at: Some(now),
                last_heartbeat_at: now,
            },
        );

        h.clock.advance(ChronoDuration::milliseconds(61_000));
        h.coordinator.sweep_heartbeat_timeouts().await;

        let task = h.scheduler.get_task(&id).await.unwrap();
        // Retry-eligible: the failure went back to the queue.
        assert_eq!(task.status, crate::types::TaskStatus::Queued);
        assert_eq!(task.current_retries, 1);
        assert!(task
            .history
            .iter()
            .any(|a| a.detail.as_deref().unwrap_or_default().contains("HEARTBEAT_TIMEOUT")));
        assert_eq!(h.coordinator.inflight_count().await, 0);
    }

    #[tokio::test]
    async fn snapshot_reaches_the_store() {
        let h = harness(0).await;
        h.registry
            .register("a1".to_string(), HashSet::new(), 2)
            .await
            .unwrap();
        h.scheduler
            .add_task(Task::new("t", TaskCategory::Feature, Priority::Medium, h.clock.now()))
            .await
            .unwrap();
        h.coordinator.write_snapshot().await.unwrap();
        let loaded = h.coordinator.store.load().await.unwrap().unwrap();
        assert_eq!(loaded.0.tasks.len(), 1);
        assert_eq!(loaded.0.agents.len(), 1);
    }
}
