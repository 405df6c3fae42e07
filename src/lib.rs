//! TaskFabric - Autonomous Task Orchestration Core
//!
//! This library implements the orchestration engine for long-running,
//! multi-agent workloads: a stream of tasks is admitted, scheduled
//! against a dependency DAG and per-tag resource capacities, bound to
//! capability-matched agents under a pluggable balancing strategy, and
//! watched by a health monitor that detects trends, tracks SLAs and
//! drives recovery.
//!
//! ## Key Components
//!
//! - **Scheduler**: multi-level priority queue with dynamic scores,
//!   starvation boosting, retry backoff and cascade policies
//! - **Dependency Graph**: Tarjan SCC, Kahn ordering, critical path,
//!   parallel groups
//! - **Agent Registry**: capability index, liveness, discovery ranking
//! - **Load Balancer**: five strategies plus per-agent circuit breakers
//! - **Coordinator**: the control loop binding tasks to agents and
//!   feeding outcomes back
//! - **Health Monitor**: periodic checks, trend fitting, SLA accounting,
//!   automatic recovery
//!
//! ## Collaborators
//!
//! Execution and persistence are capability interfaces the host
//! provides: a [`TaskExecutor`] that runs payloads and heartbeats, and a
//! [`StateStore`] with write-ahead semantics (the [`store::NoopStore`]
//! disables durability). The event stream is an in-process typed bus
//! with at-least-once delivery.
//!
//! ## Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use taskfabric::*;
//!
//! # struct MyExecutor;
//! # #[async_trait::async_trait]
//! # impl TaskExecutor for MyExecutor {
//! #     async fn execute(&self, _t: &Task, _a: &Agent, _c: &ExecutionContext)
//! #         -> FabricResult<TaskResult> { Ok(TaskResult::ok(1)) }
//! # }
//! #[tokio::main]
//! async fn main() -> FabricResult<()> {
//!     let config = FabricConfig::default();
//!     let fabric = TaskFabric::new(config, Arc::new(MyExecutor), Arc::new(store::NoopStore))?;
//!     fabric.start().await;
//!
//!     fabric
//!         .register_agent(RegisterAgentRequest {
//!             id: "worker-1".to_string(),
//!             capabilities: vec!["rust".to_string()],
//!             max_concurrent_tasks: Some(4),
//!         })
//!         .await?;
//!     let task_id = fabric
//!         .create_task(CreateTaskRequest {
//!             title: "build".to_string(),
//!             ..Default::default()
//!         })
//!         .await?;
//!     println!("queued {task_id}");
//!     fabric.shutdown().await;
//!     Ok(())
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::info;

pub mod balancer;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod event_bus;
pub mod executor;
pub mod graph;
pub mod health;
pub mod metrics;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod types;

pub use balancer::{BalanceStrategy, BalancerConfig, BreakerState, LoadBalancer};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::FabricConfig;
pub use coordinator::{Coordinator, CoordinatorConfig, TimeoutConfig};
pub use event_bus::{Event, EventBus, EventKind};
pub use executor::{ExecutionContext, Heartbeat, TaskExecutor};
pub use graph::{CriticalPathAnalysis, DependencyGraph, EdgeStrength, GraphValidationReport};
pub use health::{HealthConfig, HealthMonitor, RegistryProbe, SlaReport, TrendReport};
pub use metrics::{FabricMetrics, MetricsSnapshot};
pub use registry::{AgentQuery, AgentRegistry, HeartbeatStats, RegistryConfig};
pub use scheduler::{
    CascadePolicy, PriorityScheduler, ProgressUpdate, SchedulerConfig, SchedulingStrategy,
    StarvationMode, TaskFilter,
};
pub use store::{StateSnapshot, StateStore, WalRecord};
pub use types::{
    Agent, AgentId, AgentStatus, FabricError, FabricResult, MetadataValue, Priority, Task,
    TaskCategory, TaskId, TaskResult, TaskStatus,
};

/// Version of the fabric
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Request to create and admit a task
#[derive(Debug, Clone)]
pub struct CreateTaskRequest {
    /// Short title
    pub title: String,
    /// Longer description
    pub description: String,
    /// Work category
    pub category: TaskCategory,
    /// Base priority
    pub priority: Priority,
    /// Relative complexity estimate
    pub complexity: u32,
    /// Effort estimate in milliseconds
    pub estimated_effort_ms: u64,
    /// Hard prerequisites; must reference already-admitted tasks
    pub dependencies: Vec<TaskId>,
    /// Resource tags held while the task is assigned or running
    pub required_resources: Vec<String>,
    /// Capabilities the executing agent must advertise
    pub required_capabilities: Vec<String>,
    /// Optional deadline
    pub deadline: Option<chrono::DateTime<chrono::Utc>>,
    /// Retry budget
    pub max_retries: u32,
    /// Originating submitter, for quota fairness
    pub originator: Option<String>,
    /// Free-form typed metadata
    pub metadata: HashMap<String, MetadataValue>,
}

impl Default for CreateTaskRequest {
    fn default() -> Self {
        Self {
            title: String::new(),
            description: String::new(),
            category: TaskCategory::Feature,
            priority: Priority::Medium,
            complexity: 1,
            estimated_effort_ms: 0,
            dependencies: Vec::new(),
            required_resources: Vec::new(),
            required_capabilities: Vec::new(),
            deadline: None,
            max_retries: 3,
            originator: None,
            metadata: HashMap::new(),
        }
    }
}

/// Request to register (or idempotently update) an agent
#[derive(Debug, Clone)]
pub struct RegisterAgentRequest {
    /// Caller-supplied opaque id
    pub id: AgentId,
    /// Advertised capabilities
    pub capabilities: Vec<String>,
    /// Concurrent task slots; defaults to 1
    pub max_concurrent_tasks: Option<usize>,
}

/// Aggregate task counts for the status report
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct TaskTotals {
    /// All tracked tasks
    pub total: usize,
    /// Count per status name
    pub by_status: HashMap<String, usize>,
    /// Count per category name
    pub by_category: HashMap<String, usize>,
    /// Count per priority name
    pub by_priority: HashMap<String, usize>,
}

/// Aggregate agent counts for the status report
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct AgentTotals {
    /// All registered agents
    pub total: usize,
    /// Agents with some capacity in use
    pub active: usize,
    /// Agents at capacity
    pub busy: usize,
    /// Agents with nothing in flight
    pub idle: usize,
    /// Agents past the heartbeat timeout
    pub offline: usize,
}

/// Point-in-time system status
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct SystemStatus {
    /// Task totals
    pub tasks: TaskTotals,
    /// Agent totals
    pub agents: AgentTotals,
    /// Current queue depth
    pub queue_depth: usize,
}

/// Combined output of the dependency analyses
#[derive(Debug, Clone)]
pub struct DependencyAnalysis {
    /// Validation findings and cycles
    pub report: GraphValidationReport,
    /// CPM result; absent while a hard cycle exists
    pub critical_path: Option<CriticalPathAnalysis>,
    /// BFS levels safe to run concurrently
    pub parallel_groups: Vec<Vec<TaskId>>,
}

/// The orchestration fabric: wiring, lifecycle and the submitter API
pub struct TaskFabric {
    clock: Arc<dyn Clock>,
    bus: Arc<EventBus>,
    scheduler: Arc<PriorityScheduler>,
    registry: Arc<AgentRegistry>,
    balancer: Arc<LoadBalancer>,
    coordinator: Arc<Coordinator>,
    health: Arc<HealthMonitor>,
    metrics: Arc<FabricMetrics>,
    store: Arc<dyn StateStore>,
    health_interval_ms: u64,
    shutdown: Arc<RwLock<bool>>,
    handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl TaskFabric {
    /// Wire a fabric over the system clock.
    pub fn new(
        config: FabricConfig,
        executor: Arc<dyn TaskExecutor>,
        store: Arc<dyn StateStore>,
    ) -> FabricResult<Self> {
        Self::with_clock(config, executor, store, Arc::new(SystemClock))
    }

    /// Wire a fabric over an explicit clock (tests use [`ManualClock`]).
    pub fn with_clock(
        config: FabricConfig,
        executor: Arc<dyn TaskExecutor>,
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
    ) -> FabricResult<Self> {
        let bus = Arc::new(EventBus::new(clock.clone()));
        let scheduler = Arc::new(PriorityScheduler::new(
            config.scheduler.clone(),
            clock.clone(),
            bus.clone(),
        ));
        let registry = Arc::new(AgentRegistry::new(
            config.registry.clone(),
            clock.clone(),
            bus.clone(),
        ));
        let balancer = Arc::new(LoadBalancer::new(config.balancer.clone(), clock.clone()));
        let metrics = Arc::new(FabricMetrics::new()?);
        let health = Arc::new(HealthMonitor::new(
            config.health.clone(),
            clock.clone(),
            bus.clone(),
            registry.clone(),
            Arc::new(RegistryProbe),
        ));
        let coordinator = Arc::new(Coordinator::new(
            config.coordinator.clone(),
            clock.clone(),
            bus.clone(),
            scheduler.clone(),
            registry.clone(),
            balancer.clone(),
            metrics.clone(),
            executor,
            store.clone(),
        ));
        let shutdown = coordinator.shutdown_flag();

        Ok(Self {
            clock,
            bus,
            scheduler,
            registry,
            balancer,
            coordinator,
            health,
            metrics,
            store,
            health_interval_ms: config.health.check_interval_ms,
            shutdown,
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Wire a fabric and restore state from the store's latest snapshot
    /// plus replayed write-ahead records.
    pub async fn restore(
        config: FabricConfig,
        executor: Arc<dyn TaskExecutor>,
        store: Arc<dyn StateStore>,
    ) -> FabricResult<Self> {
        let fabric = Self::new(config, executor, store)?;
        if let Some((snapshot, records)) = fabric.store.load().await? {
            let restored = store::replay(snapshot, records);
            info!(
                tasks = restored.tasks.len(),
                agents = restored.agents.len(),
                "restoring fabric state"
            );
            fabric
                .scheduler
                .restore(restored.tasks, restored.edges)
                .await;
            for agent in restored.agents {
                fabric.registry.restore(agent).await;
            }
            for (agent_id, breaker) in restored.breakers {
                fabric.balancer.restore_breaker(agent_id, breaker).await;
            }
        }
        Ok(fabric)
    }

    /// Start the control and health loops.
    pub async fn start(&self) {
        info!(version = VERSION, "taskfabric starting");
        let mut handles = self.handles.lock().await;
        handles.push(tokio::spawn(self.coordinator.clone().run()));

        let health = self.health.clone();
        let registry = self.registry.clone();
        let shutdown = self.shutdown.clone();
        let interval_ms = self.health_interval_ms;
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_millis(interval_ms));
            loop {
                tick.tick().await;
                if *shutdown.read().await {
                    break;
                }
                health.check_all().await;
                for agent in registry.list().await {
                    health.analyze_trends(&agent.id).await;
                    health.sla_report(&agent.id).await;
                }
            }
        }));
    }

    /// Stop the loops and wait for them to finish.
    pub async fn shutdown(&self) {
        info!("taskfabric shutting down");
        *self.shutdown.write().await = true;
        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            let _ = handle.await;
        }
        info!("taskfabric shutdown complete");
    }

    /// Create and admit a task; returns its id (status is Queued).
    pub async fn create_task(&self, req: CreateTaskRequest) -> FabricResult<TaskId> {
        if req.title.trim().is_empty() {
            return Err(FabricError::Validation(
                "task title must not be empty".into(),
            ));
        }
        let now = self.clock.now();
        let mut task = Task::new(req.title, req.category, req.priority, now);
        task.description = req.description;
        task.complexity = req.complexity;
        task.estimated_effort_ms = req.estimated_effort_ms;
        task.dependencies = req.dependencies.into_iter().collect();
        task.required_resources = req.required_resources.into_iter().collect();
        task.required_capabilities = req.required_capabilities.into_iter().collect();
        task.deadline = req.deadline;
        task.max_retries = req.max_retries;
        task.originator = req.originator;
        task.metadata = req.metadata;

        let admitted = task.clone();
        let id = self.scheduler.add_task(task).await?;
        self.metrics.record_submitted();
        let _ = self
            .store
            .append(WalRecord::TaskUpserted {
                task: Box::new(admitted),
            })
            .await;
        Ok(id)
    }

    /// Register (or idempotently update) an agent.
    pub async fn register_agent(&self, req: RegisterAgentRequest) -> FabricResult<Agent> {
        let capabilities: HashSet<String> = req.capabilities.into_iter().collect();
        let agent = self
            .registry
            .register(req.id, capabilities, req.max_concurrent_tasks.unwrap_or(1))
            .await?;
        let _ = self
            .store
            .append(WalRecord::AgentUpserted {
                agent: Box::new(agent.clone()),
            })
            .await;
        Ok(agent)
    }

    /// Record an agent heartbeat.
    pub async fn heartbeat_agent(&self, id: &AgentId, stats: HeartbeatStats) -> FabricResult<()> {
        self.registry.heartbeat(id, stats).await
    }

    /// Caller-driven progress update for a task.
    pub async fn update_progress(&self, id: &TaskId, update: ProgressUpdate) -> FabricResult<Task> {
        let task = self.scheduler.update_progress(id, update).await?;
        let _ = self
            .store
            .append(WalRecord::TaskUpserted {
                task: Box::new(task.clone()),
            })
            .await;
        Ok(task)
    }

    /// Cancel a task; dependents follow the configured cascade policy and
    /// agent slots held by cascaded tasks are released.
    pub async fn cancel(&self, id: &TaskId, reason: &str) -> FabricResult<Task> {
        let outcome = self.scheduler.cancel(id, reason).await?;
        for (task_id, agent_id) in &outcome.released_agents {
            let _ = self.registry.release_task(agent_id, task_id).await;
        }
        self.metrics.record_cancelled();
        let _ = self
            .store
            .append(WalRecord::TaskUpserted {
                task: Box::new(outcome.task.clone()),
            })
            .await;
        Ok(outcome.task)
    }

    /// Aggregate status across tasks, agents and the queue.
    pub async fn get_system_status(&self) -> SystemStatus {
        let (by_status, by_category, by_priority) = self.scheduler.status_breakdown().await;
        let stats = self.scheduler.stats().await;
        let agents = self.registry.list().await;

        let mut totals = AgentTotals {
            total: agents.len(),
            ..Default::default()
        };
        for agent in &agents {
            match agent.status {
                AgentStatus::Active => totals.active += 1,
                AgentStatus::Busy => totals.busy += 1,
                AgentStatus::Idle => totals.idle += 1,
                AgentStatus::Offline => totals.offline += 1,
                _ => {}
            }
        }

        SystemStatus {
            tasks: TaskTotals {
                total: stats.total,
                by_status,
                by_category,
                by_priority,
            },
            agents: totals,
            queue_depth: stats.queued,
        }
    }

    /// Subscribe to the typed event stream.
    pub async fn subscribe(&self) -> async_channel::Receiver<Event> {
        self.bus.subscribe().await
    }

    /// Run the dependency analyses over the live graph.
    pub async fn analyze_dependencies(&self) -> DependencyAnalysis {
        let graph = self.scheduler.graph_snapshot().await;
        let report = graph.validate();
        let critical_path = graph.critical_path().ok();
        let parallel_groups = graph.parallel_groups().unwrap_or_default();
        DependencyAnalysis {
            report,
            critical_path,
            parallel_groups,
        }
    }

    /// Fetch one task.
    pub async fn get_task(&self, id: &TaskId) -> FabricResult<Task> {
        self.scheduler.get_task(id).await
    }

    /// Fetch one agent.
    pub async fn get_agent(&self, id: &AgentId) -> FabricResult<Agent> {
        self.registry.get(id).await
    }

    /// Current metric counters.
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Prometheus text exposition of all fabric metrics.
    pub fn export_prometheus_metrics(&self) -> FabricResult<String> {
        self.metrics.export_prometheus()
    }

    /// The scheduler, for hosts that drive selection themselves.
    pub fn scheduler(&self) -> &Arc<PriorityScheduler> {
        &self.scheduler
    }

    /// The agent registry.
    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// The load balancer.
    pub fn balancer(&self) -> &Arc<LoadBalancer> {
        &self.balancer
    }

    /// The health monitor.
    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    /// The coordinator.
    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// Write a full snapshot to the store now.
    pub async fn write_snapshot(&self) -> FabricResult<()> {
        self.coordinator.write_snapshot().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NoopStore;
    use async_trait::async_trait;

    struct OkExecutor;

    #[async_trait]
    impl TaskExecutor for OkExecutor {
        async fn execute(
            &self,
            _task: &Task,
            _agent: &Agent,
            _ctx: &ExecutionContext,
        ) -> FabricResult<TaskResult> {
            Ok(TaskResult::ok(1))
        }
    }

    fn fabric() -> TaskFabric {
        TaskFabric::new(
            FabricConfig::default(),
            Arc::new(OkExecutor),
            Arc::new(NoopStore),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn create_task_requires_a_title() {
        let fabric = fabric();
        let err = fabric
            .create_task(CreateTaskRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FabricError::Validation(_)));
    }

    #[tokio::test]
    async fn create_and_report_status() {
        let fabric = fabric();
        fabric
            .register_agent(RegisterAgentRequest {
                id: "a1".to_string(),
                capabilities: vec!["rust".to_string()],
                max_concurrent_tasks: Some(2),
            })
            .await
            .unwrap();
        let id = fabric
            .create_task(CreateTaskRequest {
                title: "build".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let status = fabric.get_system_status().await;
        assert_eq!(status.tasks.total, 1);
        assert_eq!(status.queue_depth, 1);
        assert_eq!(status.agents.total, 1);
        assert_eq!(status.agents.idle, 1);
        assert_eq!(status.tasks.by_status.get("queued"), Some(&1));

        let task = fabric.get_task(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn events_flow_through_subscription() {
        let fabric = fabric();
        let rx = fabric.subscribe().await;
        fabric
            .create_task(CreateTaskRequest {
                title: "t".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().kind, EventKind::TaskCreated);
        assert_eq!(rx.recv().await.unwrap().kind, EventKind::TaskQueued);
    }

    #[tokio::test]
    async fn analysis_reflects_submitted_dependencies() {
        let fabric = fabric();
        let a = fabric
            .create_task(CreateTaskRequest {
                title: "a".to_string(),
                estimated_effort_ms: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        let b = fabric
            .create_task(CreateTaskRequest {
                title: "b".to_string(),
                estimated_effort_ms: 10,
                dependencies: vec![a],
                ..Default::default()
            })
            .await
            .unwrap();

        let analysis = fabric.analyze_dependencies().await;
        assert!(analysis.report.is_valid());
        let cpm = analysis.critical_path.unwrap();
        assert_eq!(cpm.project_duration_ms, 20);
        assert_eq!(analysis.parallel_groups, vec![vec![a], vec![b]]);
    }
}
