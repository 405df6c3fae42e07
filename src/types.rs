//! Core type definitions for the orchestration fabric
//!
//! This module defines the data structures shared across the fabric:
//! tasks, agents, the metadata variant, structured failure reasons, and
//! the error taxonomy. All types serialize with serde so the persistence
//! collaborator can snapshot them and hosts can ship them across process
//! boundaries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for tasks in the orchestration system
pub type TaskId = Uuid;

/// Unique identifier for agents. Agent ids are caller-supplied opaque
/// strings; registration with an existing id is an idempotent update.
pub type AgentId = String;

/// Priority levels for task scheduling
///
/// Higher values indicate higher priority. The scheduler uses this as the
/// base term of the dynamic score, with Critical tasks always outranking
/// Background tasks at equal age.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Mission-critical tasks that must execute immediately
    Critical = 100,
    /// High-priority tasks for important operations
    High = 75,
    /// Standard priority for regular tasks
    Medium = 50,
    /// Low-priority tasks that can wait
    Low = 25,
    /// Background tasks with minimal priority
    Background = 10,
}

impl Priority {
    /// Numeric weight used by the scoring formula.
    pub fn weight(self) -> f64 {
        self as u8 as f64
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (*self as u8).cmp(&(*other as u8))
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Work category a task belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    /// New functionality
    Feature,
    /// Defect fix
    BugFix,
    /// Improvement of existing functionality
    Enhancement,
    /// Code restructuring without behavior change
    Refactoring,
    /// Test authoring or repair
    Testing,
    /// Documentation work
    Documentation,
    /// Security hardening
    Security,
    /// Performance work
    Performance,
    /// Routine upkeep
    Maintenance,
    /// Exploratory work
    Research,
    /// Build, deploy, tooling
    Infrastructure,
}

impl fmt::Display for TaskCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskCategory::Feature => "feature",
            TaskCategory::BugFix => "bug_fix",
            TaskCategory::Enhancement => "enhancement",
            TaskCategory::Refactoring => "refactoring",
            TaskCategory::Testing => "testing",
            TaskCategory::Documentation => "documentation",
            TaskCategory::Security => "security",
            TaskCategory::Performance => "performance",
            TaskCategory::Maintenance => "maintenance",
            TaskCategory::Research => "research",
            TaskCategory::Infrastructure => "infrastructure",
        };
        f.write_str(s)
    }
}

/// Lifecycle state of a task
///
/// Transitions follow a fixed machine; every mutation goes through
/// [`Task::transition_to`], which rejects anything the machine does not
/// allow with [`FabricError::Conflict`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Task object exists but has not been admitted
    Created,
    /// Admitted and waiting for selection
    Queued,
    /// Selected and bound to an agent, not yet running
    Assigned,
    /// Agent reported work started
    InProgress,
    /// Execution finished, awaiting review
    Review,
    /// Waiting on an external unblock event
    Blocked,
    /// Finished successfully (terminal)
    Completed,
    /// Execution failed; terminal once retries are exhausted
    Failed,
    /// Cancelled before completion (terminal)
    Cancelled,
    /// Retained past its lifecycle for audit (terminal)
    Archived,
}

impl TaskStatus {
    /// Whether this status admits a transition to `next`.
    ///
    /// `Failed -> Queued` is the retry edge; whether it may be taken also
    /// depends on the retry budget, which the scheduler checks separately.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Created, Queued) => true,
            // Queued -> Failed is the dependency-failure cascade edge.
            (Queued, Assigned) | (Queued, Blocked) | (Queued, Failed) => true,
            (Assigned, InProgress) | (Assigned, Queued) | (Assigned, Failed) => true,
            (InProgress, Review)
            | (InProgress, Completed)
            | (InProgress, Failed)
            | (InProgress, Blocked) => true,
            (Review, Completed) | (Review, Failed) => true,
            (Blocked, Queued) | (Blocked, Failed) => true,
            (Failed, Queued) => true,
            (Completed, Archived) | (Cancelled, Archived) | (Failed, Archived) => true,
            // Any non-terminal state can be cancelled.
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }

    /// Terminal states never transition again (except into Archived).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Cancelled | TaskStatus::Archived
        )
    }

    /// Whether the task currently holds an agent binding.
    pub fn holds_agent(self) -> bool {
        matches!(self, TaskStatus::Assigned | TaskStatus::InProgress)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Created => "created",
            TaskStatus::Queued => "queued",
            TaskStatus::Assigned => "assigned",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Review => "review",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Archived => "archived",
        };
        f.write_str(s)
    }
}

/// Schema-less but typed metadata value
///
/// Dynamic task and event metadata is a tagged variant rather than raw
/// JSON so consumers can match on the payload without re-parsing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataValue {
    /// UTF-8 text
    String(String),
    /// Double-precision number
    Number(f64),
    /// Boolean flag
    Bool(bool),
    /// Point in time
    Timestamp(DateTime<Utc>),
    /// Opaque bytes
    Bytes(Vec<u8>),
    /// Nested mapping
    Map(HashMap<String, MetadataValue>),
    /// Ordered list
    List(Vec<MetadataValue>),
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        MetadataValue::String(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        MetadataValue::String(value)
    }
}

impl From<f64> for MetadataValue {
    fn from(value: f64) -> Self {
        MetadataValue::Number(value)
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        MetadataValue::Bool(value)
    }
}

/// One entry in a task's append-only audit trail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAction {
    /// When the action happened
    pub at: DateTime<Utc>,
    /// Short machine-readable action name ("queued", "assigned", ...)
    pub action: String,
    /// Free-form detail for operators
    pub detail: Option<String>,
}

/// Classification of a failure, mirroring the error taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Bad input
    Validation,
    /// Duplicate id or illegal state transition
    Conflict,
    /// Unknown id
    NotFound,
    /// Violated precondition such as a cyclic hard dependency
    Precondition,
    /// No runnable slot
    ResourceExhausted,
    /// Heartbeat or command timeout
    Timeout,
    /// Reported by the execution collaborator
    ExecutorFailed,
    /// A dependency failed or was cancelled
    DependencyFailed,
    /// Bug in the fabric itself
    Internal,
}

/// Structured reason recorded for every terminal failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureReason {
    /// Failure classification
    pub kind: FailureKind,
    /// Human-readable message
    pub message: String,
    /// Upstream cause, if any
    pub cause: Option<String>,
    /// Whether a retry could have succeeded
    pub retriable: bool,
}

impl FailureReason {
    /// Convenience constructor without a cause.
    pub fn new(kind: FailureKind, message: impl Into<String>, retriable: bool) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
            retriable,
        }
    }
}

/// A unit of work flowing through the fabric
///
/// Tasks are opaque to the core: the payload lives in `metadata` and the
/// execution collaborator interprets it. The core owns the lifecycle,
/// dependency, and scheduling fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier
    pub id: TaskId,
    /// Short human-readable title
    pub title: String,
    /// Longer description of the work
    pub description: String,
    /// Work category
    pub category: TaskCategory,
    /// Base priority; the dynamic score builds on this
    pub base_priority: Priority,
    /// Relative complexity estimate (1 = trivial)
    pub complexity: u32,
    /// Estimated effort in milliseconds; drives critical-path analysis
    pub estimated_effort_ms: u64,
    /// Hard prerequisites by id; must be Completed before this task runs
    pub dependencies: HashSet<TaskId>,
    /// Reverse edges, derived by the graph on mutation
    pub dependents: HashSet<TaskId>,
    /// Resource tags this task holds while assigned or running
    pub required_resources: HashSet<String>,
    /// Capabilities the executing agent must advertise
    pub required_capabilities: HashSet<String>,
    /// Optional completion deadline
    pub deadline: Option<DateTime<Utc>>,
    /// Retry budget
    pub max_retries: u32,
    /// Retries consumed so far
    pub current_retries: u32,
    /// Lifecycle state
    pub status: TaskStatus,
    /// Originating submitter, used by quota-based fairness
    pub originator: Option<String>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp
    pub updated_at: DateTime<Utc>,
    /// When the task entered the queue
    pub queued_at: Option<DateTime<Utc>>,
    /// When the task was bound to an agent
    pub assigned_at: Option<DateTime<Utc>>,
    /// When the agent reported start
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached Completed
    pub completed_at: Option<DateTime<Utc>>,
    /// Retry backoff gate; the task is not runnable before this instant
    pub backoff_until: Option<DateTime<Utc>>,
    /// Agent currently bound to the task; set iff status holds an agent
    pub assigned_agent: Option<AgentId>,
    /// Append-only audit trail
    pub history: Vec<TaskAction>,
    /// Free-form typed metadata
    pub metadata: HashMap<String, MetadataValue>,
}

impl Task {
    /// Create a task in the Created state with the given effort estimate.
    pub fn new(
        title: impl Into<String>,
        category: TaskCategory,
        base_priority: Priority,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            description: String::new(),
            category,
            base_priority,
            complexity: 1,
            estimated_effort_ms: 0,
            dependencies: HashSet::new(),
            dependents: HashSet::new(),
            required_resources: HashSet::new(),
            required_capabilities: HashSet::new(),
            deadline: None,
            max_retries: 3,
            current_retries: 0,
            status: TaskStatus::Created,
            originator: None,
            created_at: now,
            updated_at: now,
            queued_at: None,
            assigned_at: None,
            started_at: None,
            completed_at: None,
            backoff_until: None,
            assigned_agent: None,
            history: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Apply a state transition, enforcing the machine and the
    /// agent-binding invariant, and append an audit entry.
    pub fn transition_to(
        &mut self,
        next: TaskStatus,
        now: DateTime<Utc>,
        detail: Option<String>,
    ) -> FabricResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(FabricError::Conflict(format!(
                "task {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        self.updated_at = now;
        match next {
            TaskStatus::Queued => self.queued_at = Some(now),
            TaskStatus::Assigned => self.assigned_at = Some(now),
            TaskStatus::InProgress => self.started_at = Some(now),
            TaskStatus::Completed => self.completed_at = Some(now),
            _ => {}
        }
        if !next.holds_agent() {
            self.assigned_agent = None;
        }
        self.history.push(TaskAction {
            at: now,
            action: next.to_string(),
            detail,
        });
        Ok(())
    }

    /// Whether the retry budget still allows another attempt.
    pub fn retries_left(&self) -> bool {
        self.current_retries < self.max_retries
    }

    /// Milliseconds spent waiting in the queue as of `now`.
    pub fn wait_ms(&self, now: DateTime<Utc>) -> i64 {
        self.queued_at
            .map(|q| (now - q).num_milliseconds())
            .unwrap_or(0)
            .max(0)
    }
}

/// Lifecycle states of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Agent is starting up
    Initializing,
    /// No tasks in flight
    Idle,
    /// Some capacity in use
    Active,
    /// At maximum concurrent tasks
    Busy,
    /// Blocked on an external condition
    Blocked,
    /// Health monitor flagged the agent
    Error,
    /// Missed heartbeats past the timeout
    Offline,
    /// Permanently removed
    Terminated,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentStatus::Initializing => "initializing",
            AgentStatus::Idle => "idle",
            AgentStatus::Active => "active",
            AgentStatus::Busy => "busy",
            AgentStatus::Blocked => "blocked",
            AgentStatus::Error => "error",
            AgentStatus::Offline => "offline",
            AgentStatus::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Rolling performance figures per agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentPerformance {
    /// Total tasks completed successfully
    pub completed_tasks: u64,
    /// Total tasks failed
    pub failed_tasks: u64,
    /// Rolling average completion time in milliseconds
    pub average_completion_time_ms: f64,
    /// completed / (completed + failed), 1.0 with no history
    pub success_rate: f64,
}

impl Default for AgentPerformance {
    fn default() -> Self {
        Self {
            completed_tasks: 0,
            failed_tasks: 0,
            average_completion_time_ms: 0.0,
            success_rate: 1.0,
        }
    }
}

impl AgentPerformance {
    /// Fold one task outcome into the rolling figures.
    pub fn record(&mut self, success: bool, duration_ms: u64) {
        if success {
            self.completed_tasks += 1;
        } else {
            self.failed_tasks += 1;
        }
        let total = self.completed_tasks + self.failed_tasks;
        self.success_rate = if total == 0 {
            1.0
        } else {
            self.completed_tasks as f64 / total as f64
        };
        // Exponential moving average keeps the figure responsive without
        // retaining per-task samples.
        let alpha = 0.2;
        if self.average_completion_time_ms == 0.0 {
            self.average_completion_time_ms = duration_ms as f64;
        } else {
            self.average_completion_time_ms =
                alpha * duration_ms as f64 + (1.0 - alpha) * self.average_completion_time_ms;
        }
    }
}

/// A worker process registered with the fabric
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    /// Caller-supplied opaque identifier
    pub id: AgentId,
    /// Advertised capabilities
    pub capabilities: HashSet<String>,
    /// Maximum concurrent task slots
    pub max_concurrent_tasks: usize,
    /// Tasks currently bound to the agent
    pub current_tasks: HashSet<TaskId>,
    /// Lifecycle state
    pub status: AgentStatus,
    /// Registration timestamp
    pub registered_at: DateTime<Utc>,
    /// Last heartbeat timestamp
    pub last_heartbeat_at: DateTime<Utc>,
    /// Rolling performance figures
    pub performance: AgentPerformance,
}

impl Agent {
    /// Create a freshly registered agent.
    pub fn new(
        id: AgentId,
        capabilities: HashSet<String>,
        max_concurrent_tasks: usize,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            capabilities,
            max_concurrent_tasks,
            current_tasks: HashSet::new(),
            status: AgentStatus::Idle,
            registered_at: now,
            last_heartbeat_at: now,
            performance: AgentPerformance::default(),
        }
    }

    /// Fraction of capacity in use, in [0, 1].
    pub fn load(&self) -> f64 {
        if self.max_concurrent_tasks == 0 {
            return 1.0;
        }
        self.current_tasks.len() as f64 / self.max_concurrent_tasks as f64
    }

    /// Free task slots remaining.
    pub fn headroom(&self) -> usize {
        self.max_concurrent_tasks.saturating_sub(self.current_tasks.len())
    }

    /// Whether the agent advertises every capability in `required`.
    pub fn has_capabilities(&self, required: &HashSet<String>) -> bool {
        required.iter().all(|c| self.capabilities.contains(c))
    }

    /// Recompute the derived status from current load. Offline, Error,
    /// Blocked and Terminated are sticky and only cleared by their owners.
    pub fn refresh_load_status(&mut self) {
        if matches!(
            self.status,
            AgentStatus::Offline
                | AgentStatus::Error
                | AgentStatus::Blocked
                | AgentStatus::Terminated
        ) {
            return;
        }
        self.status = if self.current_tasks.is_empty() {
            AgentStatus::Idle
        } else if self.current_tasks.len() >= self.max_concurrent_tasks {
            AgentStatus::Busy
        } else {
            AgentStatus::Active
        };
    }
}

/// Outcome returned by the execution collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    /// Whether execution succeeded
    pub success: bool,
    /// Process exit code, when applicable
    pub exit_code: Option<i32>,
    /// Wall-clock execution time
    pub duration_ms: u64,
    /// Captured output, if any
    pub output: Option<String>,
    /// Error description on failure
    pub error: Option<String>,
    /// Whether a retry is worthwhile; terminal failures set this false
    pub retriable: bool,
    /// Produced artifact references
    pub artifacts: Vec<String>,
}

impl TaskResult {
    /// A successful result with the given duration.
    pub fn ok(duration_ms: u64) -> Self {
        Self {
            success: true,
            exit_code: Some(0),
            duration_ms,
            output: None,
            error: None,
            retriable: false,
            artifacts: Vec::new(),
        }
    }

    /// A retriable failure.
    pub fn failed(duration_ms: u64, error: impl Into<String>) -> Self {
        Self {
            success: false,
            exit_code: None,
            duration_ms,
            output: None,
            error: Some(error.into()),
            retriable: true,
            artifacts: Vec::new(),
        }
    }

    /// A failure no retry can fix.
    pub fn failed_terminal(duration_ms: u64, error: impl Into<String>) -> Self {
        Self {
            retriable: false,
            ..Self::failed(duration_ms, error)
        }
    }
}

/// Error taxonomy for fabric operations
///
/// Validation, Conflict, NotFound and Precondition are synchronous error
/// returns and never cascade. Timeout, ExecutorFailed and
/// ResourceExhausted are recovered locally via retry, backoff or deferral
/// and surface as events plus state transitions. Internal errors are
/// fatal only to the affected task or agent, never to the process.
#[derive(Debug, thiserror::Error)]
pub enum FabricError {
    /// Bad input; reported to the caller
    #[error("validation failed: {0}")]
    Validation(String),

    /// Duplicate id or illegal state transition
    #[error("conflict: {0}")]
    Conflict(String),

    /// Unknown task or agent id
    #[error("not found: {0}")]
    NotFound(String),

    /// Violated precondition, carrying the offending cycle when relevant
    #[error("precondition failed: {message}")]
    Precondition {
        /// What was violated
        message: String,
        /// The cycle that would have been created, first node repeated last
        cycle: Vec<TaskId>,
    },

    /// No runnable slot; recovered by waiting
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Heartbeat or command deadline elapsed
    #[error("timed out after {0} ms")]
    Timeout(u64),

    /// The execution collaborator reported failure
    #[error("executor failed: {message}")]
    ExecutorFailed {
        /// Collaborator-provided message
        message: String,
        /// Whether a retry could succeed
        retriable: bool,
    },

    /// Bug in the fabric; logged and surfaced via event
    #[error("internal error: {0}")]
    Internal(String),
}

impl FabricError {
    /// Map the error onto the failure taxonomy for audit records.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            FabricError::Validation(_) => FailureKind::Validation,
            FabricError::Conflict(_) => FailureKind::Conflict,
            FabricError::NotFound(_) => FailureKind::NotFound,
            FabricError::Precondition { .. } => FailureKind::Precondition,
            FabricError::ResourceExhausted(_) => FailureKind::ResourceExhausted,
            FabricError::Timeout(_) => FailureKind::Timeout,
            FabricError::ExecutorFailed { .. } => FailureKind::ExecutorFailed,
            FabricError::Internal(_) => FailureKind::Internal,
        }
    }
}

/// Result type alias for fabric operations
pub type FabricResult<T> = Result<T, FabricError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
        assert!(Priority::Low > Priority::Background);
        assert_eq!(Priority::Critical.weight(), 100.0);
    }

    #[test]
    fn status_machine_allows_documented_paths() {
        use TaskStatus::*;
        assert!(Created.can_transition_to(Queued));
        assert!(Queued.can_transition_to(Assigned));
        assert!(Assigned.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Completed));
        assert!(InProgress.can_transition_to(Review));
        assert!(Review.can_transition_to(Completed));
        assert!(Failed.can_transition_to(Queued));
        assert!(Blocked.can_transition_to(Queued));
        assert!(Queued.can_transition_to(Cancelled));
    }

    #[test]
    fn status_machine_rejects_illegal_paths() {
        use TaskStatus::*;
        assert!(!Created.can_transition_to(InProgress));
        assert!(!Completed.can_transition_to(Queued));
        assert!(!Cancelled.can_transition_to(Queued));
        assert!(!Completed.can_transition_to(Cancelled));
        assert!(!Queued.can_transition_to(Completed));
    }

    #[test]
    fn transition_clears_agent_binding() {
        let now = Utc::now();
        let mut task = Task::new("t", TaskCategory::Feature, Priority::Medium, now);
        task.transition_to(TaskStatus::Queued, now, None).unwrap();
        task.assigned_agent = Some("agent-1".to_string());
        task.transition_to(TaskStatus::Assigned, now, None).unwrap();
        assert!(task.assigned_agent.is_some());
        task.transition_to(TaskStatus::InProgress, now, None).unwrap();
        task.transition_to(TaskStatus::Completed, now, None).unwrap();
        assert!(task.assigned_agent.is_none());
        assert_eq!(task.history.len(), 4);
    }

    #[test]
    fn illegal_transition_is_a_conflict() {
        let now = Utc::now();
        let mut task = Task::new("t", TaskCategory::Feature, Priority::Medium, now);
        let err = task
            .transition_to(TaskStatus::Completed, now, None)
            .unwrap_err();
        assert!(matches!(err, FabricError::Conflict(_)));
        assert_eq!(task.status, TaskStatus::Created);
    }

    #[test]
    fn performance_rollup() {
        let mut perf = AgentPerformance::default();
        perf.record(true, 100);
        perf.record(true, 100);
        perf.record(false, 50);
        assert_eq!(perf.completed_tasks, 2);
        assert_eq!(perf.failed_tasks, 1);
        assert!((perf.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!(perf.average_completion_time_ms > 0.0);
    }

    #[test]
    fn agent_load_and_headroom() {
        let now = Utc::now();
        let mut agent = Agent::new("a".to_string(), HashSet::new(), 2, now);
        assert_eq!(agent.load(), 0.0);
        assert_eq!(agent.headroom(), 2);
        agent.current_tasks.insert(Uuid::new_v4());
        agent.refresh_load_status();
        assert_eq!(agent.status, AgentStatus::Active);
        agent.current_tasks.insert(Uuid::new_v4());
        agent.refresh_load_status();
        assert_eq!(agent.status, AgentStatus::Busy);
        assert_eq!(agent.headroom(), 0);
    }

    #[test]
    fn metadata_round_trip() {
        let mut map = HashMap::new();
        map.insert("attempt".to_string(), MetadataValue::Number(2.0));
        map.insert("source".to_string(), MetadataValue::from("ci"));
        let value = MetadataValue::Map(map);
        let json = serde_json::to_string(&value).unwrap();
        let back: MetadataValue = serde_json::from_str(&json).unwrap();
        assert_eq!(value, back);
    }
}
