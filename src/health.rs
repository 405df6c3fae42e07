//! Fleet health monitor
//!
//! Runs a periodic health check over every registered agent, classifies
//! issues against severity thresholds, fits linear trends over a rolling
//! window, tracks SLA figures per period, and drives automatic recovery
//! actions for the issue codes that allow it.

use crate::clock::Clock;
use crate::event_bus::{Event, EventBus, EventKind};
use crate::registry::{AgentQuery, AgentRegistry};
use crate::types::{Agent, AgentId, AgentStatus, FabricResult};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Severity of a detected issue
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    /// Informational
    Info,
    /// Needs attention
    Warning,
    /// Needs action now
    Critical,
}

/// What part of agent behavior an issue concerns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCategory {
    /// Latency and throughput
    Performance,
    /// Reachability and liveness
    Availability,
    /// Load and headroom
    Capacity,
    /// Error rates
    Reliability,
}

/// One classified finding from a health check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthIssue {
    /// Stable machine-readable code (e.g. HIGH_ERROR_RATE)
    pub code: String,
    /// Severity tier
    pub severity: IssueSeverity,
    /// Affected dimension
    pub category: IssueCategory,
    /// Human-readable description
    pub message: String,
}

/// One health check observation for one agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckRecord {
    /// When the check ran
    pub at: DateTime<Utc>,
    /// Checked agent
    pub agent_id: AgentId,
    /// Probe response time
    pub response_time_ms: f64,
    /// Tasks currently bound to the agent
    pub task_queue_size: usize,
    /// 1 - success rate
    pub error_rate: f64,
    /// Capacity fraction in use
    pub current_load: f64,
    /// Time since last heartbeat
    pub idle_ms: i64,
    /// Whether the agent was reachable
    pub online: bool,
    /// Classified findings
    pub issues: Vec<HealthIssue>,
}

/// Direction of a fitted metric trend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    /// Metric is getting better
    Improving,
    /// No significant movement
    Stable,
    /// Metric is getting worse
    Degrading,
}

/// A fitted trend over one metric's recent history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendReport {
    /// Agent the trend belongs to
    pub agent_id: AgentId,
    /// Metric name ("response_time_ms" or "error_rate")
    pub metric: String,
    /// Fitted direction
    pub direction: TrendDirection,
    /// Regression slope per minute
    pub slope_per_minute: f64,
    /// Fit confidence (R^2) in [0, 1]
    pub confidence: f64,
}

impl TrendReport {
    /// A trend worth surfacing: real slope, confident fit.
    pub fn is_significant(&self, epsilon: f64, min_confidence: f64) -> bool {
        self.direction != TrendDirection::Stable
            && self.slope_per_minute.abs() > epsilon
            && self.confidence > min_confidence
    }
}

/// SLA figures for one agent over one rolling period
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaReport {
    /// Agent the report covers
    pub agent_id: AgentId,
    /// Fraction of checks where the agent was reachable
    pub availability: f64,
    /// Median response time
    pub p50_ms: f64,
    /// 95th percentile response time
    pub p95_ms: f64,
    /// 99th percentile response time
    pub p99_ms: f64,
    /// Health checks per hour over the period
    pub throughput_per_hour: f64,
    /// Whether availability dropped below the target
    pub violated: bool,
}

/// Recovery actions the monitor can take
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryKind {
    /// Ask the agent to restart
    Restart,
    /// Move work to a capability-matched alternative
    Failover,
    /// Request more capacity
    Scale,
    /// Reduce the agent's intake
    Throttle,
    /// Notify operators only
    Alert,
}

/// Lifecycle of a recovery action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStatus {
    /// Created, not yet running
    Pending,
    /// In flight
    Executing,
    /// Finished successfully
    Completed,
    /// Did not complete
    Failed,
}

/// A tracked recovery action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryAction {
    /// Unique action id
    pub id: Uuid,
    /// Agent being recovered
    pub agent_id: AgentId,
    /// What the action does
    pub kind: RecoveryKind,
    /// Issue code that triggered it
    pub issue_code: String,
    /// Current status
    pub status: RecoveryStatus,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Completion timestamp
    pub completed_at: Option<DateTime<Utc>>,
    /// Outcome detail
    pub detail: Option<String>,
}

/// Severity thresholds for issue classification
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthThresholds {
    /// Response time warning bound
    pub response_warn_ms: f64,
    /// Response time critical bound
    pub response_crit_ms: f64,
    /// Error-rate warning bound
    pub error_rate_warn: f64,
    /// Error-rate critical bound
    pub error_rate_crit: f64,
    /// Load warning bound
    pub load_warn: f64,
    /// Inactivity warning bound
    pub inactivity_warn_ms: i64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            response_warn_ms: 5_000.0,
            response_crit_ms: 10_000.0,
            error_rate_warn: 0.10,
            error_rate_crit: 0.20,
            load_warn: 0.90,
            inactivity_warn_ms: 300_000,
        }
    }
}

/// Health monitor tuning knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Cadence of the check loop
    pub check_interval_ms: u64,
    /// Checks retained per agent
    pub history_retention: usize,
    /// Rolling window for trend fitting
    pub trend_window_ms: u64,
    /// Rolling period for SLA figures
    pub sla_period_ms: u64,
    /// Availability below this violates the SLA
    pub sla_availability_target: f64,
    /// Minimum absolute slope (per minute) for a significant trend
    pub trend_slope_epsilon: f64,
    /// Minimum R^2 for a significant trend
    pub trend_confidence: f64,
    /// Whether critical issues trigger automatic recovery
    pub auto_recovery: bool,
    /// Classification thresholds
    pub thresholds: HealthThresholds,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 30_000,
            history_retention: 1_000,
            trend_window_ms: 3_600_000,
            sla_period_ms: 3_600_000,
            sla_availability_target: 0.95,
            trend_slope_epsilon: 1.0,
            trend_confidence: 0.7,
            auto_recovery: true,
            thresholds: HealthThresholds::default(),
        }
    }
}

/// Issue codes eligible for automatic recovery.
const AUTO_RECOVERABLE: &[&str] = &["AGENT_NOT_FOUND", "HIGH_RESPONSE_TIME", "HIGH_ERROR_RATE"];

/// Probe measuring how quickly an agent responds to a health inquiry
#[async_trait]
pub trait AgentProbe: Send + Sync {
    /// Measure the response time for `agent` in milliseconds. Errors are
    /// treated as unreachable.
    async fn probe(&self, agent: &Agent) -> FabricResult<f64>;
}

/// Default probe for in-process registries: measures the local lookup.
/// Hosts with remote agents substitute a network probe.
#[derive(Debug, Default, Clone, Copy)]
pub struct RegistryProbe;

#[async_trait]
impl AgentProbe for RegistryProbe {
    async fn probe(&self, agent: &Agent) -> FabricResult<f64> {
        let started = std::time::Instant::now();
        // The record is already in hand; the probe cost is the scheduling
        // latency of this call itself.
        let _ = agent.current_tasks.len();
        Ok(started.elapsed().as_secs_f64() * 1_000.0)
    }
}

#[derive(Debug, Default)]
struct HealthState {
    history: HashMap<AgentId, VecDeque<HealthCheckRecord>>,
    last_status: HashMap<AgentId, AgentStatus>,
    actions: Vec<RecoveryAction>,
}

/// The periodic health monitor
pub struct HealthMonitor {
    config: HealthConfig,
    clock: Arc<dyn Clock>,
    bus: Arc<EventBus>,
    registry: Arc<AgentRegistry>,
    probe: Arc<dyn AgentProbe>,
    state: RwLock<HealthState>,
}

impl HealthMonitor {
    /// Create a monitor over the given registry.
    pub fn new(
        config: HealthConfig,
        clock: Arc<dyn Clock>,
        bus: Arc<EventBus>,
        registry: Arc<AgentRegistry>,
        probe: Arc<dyn AgentProbe>,
    ) -> Self {
        Self {
            config,
            clock,
            bus,
            registry,
            probe,
            state: RwLock::new(HealthState::default()),
        }
    }

    /// Run one full check cycle over every registered agent. Returns the
    /// records produced this cycle.
    pub async fn check_all(&self) -> Vec<HealthCheckRecord> {
        let now = self.clock.now();
        let agents = self.registry.list().await;
        let mut records = Vec::with_capacity(agents.len());

        for agent in agents {
            let record = self.check_agent(&agent, now).await;
            records.push(record);
        }

        for record in &records {
            self.ingest(record.clone()).await;
        }
        records
    }

    async fn check_agent(&self, agent: &Agent, now: DateTime<Utc>) -> HealthCheckRecord {
        let online = !matches!(agent.status, AgentStatus::Offline | AgentStatus::Terminated);
        let response_time_ms = if online {
            match self.probe.probe(agent).await {
                Ok(ms) => ms,
                Err(_) => self.config.thresholds.response_crit_ms + 1.0,
            }
        } else {
            self.config.thresholds.response_crit_ms + 1.0
        };
        let error_rate = 1.0 - agent.performance.success_rate;
        let current_load = agent.load();
        let idle_ms = (now - agent.last_heartbeat_at).num_milliseconds().max(0);

        let issues = self.classify(agent, online, response_time_ms, error_rate, current_load, idle_ms);
        HealthCheckRecord {
            at: now,
            agent_id: agent.id.clone(),
            response_time_ms,
            task_queue_size: agent.current_tasks.len(),
            error_rate,
            current_load,
            idle_ms,
            online,
            issues,
        }
    }

    fn classify(
        &self,
        agent: &Agent,
        online: bool,
        response_time_ms: f64,
        error_rate: f64,
        current_load: f64,
        idle_ms: i64,
    ) -> Vec<HealthIssue> {
        let t = &self.config.thresholds;
        let mut issues = Vec::new();

        if !online {
            issues.push(HealthIssue {
                code: "AGENT_NOT_FOUND".to_string(),
                severity: IssueSeverity::Critical,
                category: IssueCategory::Availability,
                message: format!("agent {} is unreachable", agent.id),
            });
        }
        if response_time_ms > t.response_crit_ms {
            issues.push(HealthIssue {
                code: "HIGH_RESPONSE_TIME".to_string(),
                severity: IssueSeverity::Critical,
                category: IssueCategory::Performance,
                message: format!("response time {response_time_ms:.0}ms"),
            });
        } else if response_time_ms > t.response_warn_ms {
            issues.push(HealthIssue {
                code: "HIGH_RESPONSE_TIME".to_string(),
                severity: IssueSeverity::Warning,
                category: IssueCategory::Performance,
                message: format!("response time {response_time_ms:.0}ms"),
            });
        }
        if error_rate > t.error_rate_crit {
            issues.push(HealthIssue {
                code: "HIGH_ERROR_RATE".to_string(),
                severity: IssueSeverity::Critical,
                category: IssueCategory::Reliability,
                message: format!("error rate {:.0}%", error_rate * 100.0),
            });
        } else if error_rate > t.error_rate_warn {
            issues.push(HealthIssue {
                code: "HIGH_ERROR_RATE".to_string(),
                severity: IssueSeverity::Warning,
                category: IssueCategory::Reliability,
                message: format!("error rate {:.0}%", error_rate * 100.0),
            });
        }
        if current_load > t.load_warn {
            issues.push(HealthIssue {
                code: "HIGH_LOAD".to_string(),
                severity: IssueSeverity::Warning,
                category: IssueCategory::Capacity,
                message: format!("load {:.0}%", current_load * 100.0),
            });
        }
        if online && idle_ms > t.inactivity_warn_ms {
            issues.push(HealthIssue {
                code: "INACTIVE".to_string(),
                severity: IssueSeverity::Warning,
                category: IssueCategory::Availability,
                message: format!("no activity for {}s", idle_ms / 1_000),
            });
        }
        issues
    }

    /// Fold a record into history, emit events and trigger recovery.
    async fn ingest(&self, record: HealthCheckRecord) {
        let agent_id = record.agent_id.clone();
        let mut pending_recovery: Vec<HealthIssue> = Vec::new();
        let mut status_change: Option<(AgentStatus, Option<AgentStatus>)> = None;

        {
            let mut state = self.state.write().await;
            let history = state.history.entry(agent_id.clone()).or_default();
            history.push_back(record.clone());
            while history.len() > self.config.history_retention {
                history.pop_front();
            }

            let current = if record.online {
                if record.issues.iter().any(|i| i.severity == IssueSeverity::Critical) {
                    AgentStatus::Error
                } else {
                    AgentStatus::Active
                }
            } else {
                AgentStatus::Offline
            };
            let previous = state.last_status.insert(agent_id.clone(), current);
            if previous != Some(current) {
                status_change = Some((current, previous));
            }

            if self.config.auto_recovery {
                for issue in &record.issues {
                    let already_running = state.actions.iter().any(|a| {
                        a.agent_id == agent_id
                            && a.issue_code == issue.code
                            && matches!(a.status, RecoveryStatus::Pending | RecoveryStatus::Executing)
                    });
                    if issue.severity == IssueSeverity::Critical
                        && AUTO_RECOVERABLE.contains(&issue.code.as_str())
                        && !already_running
                    {
                        pending_recovery.push(issue.clone());
                    }
                }
            }
        }

        for issue in &record.issues {
            if issue.severity >= IssueSeverity::Warning {
                self.bus
                    .publish(
                        Event::new(EventKind::IssueDetected, record.at)
                            .agent(agent_id.clone())
                            .meta("code", issue.code.as_str())
                            .meta("severity", format!("{:?}", issue.severity).to_lowercase())
                            .meta("message", issue.message.as_str()),
                    )
                    .await;
            }
        }
        if let Some((current, _previous)) = status_change {
            self.bus
                .publish(
                    Event::new(EventKind::StatusChanged, record.at)
                        .agent(agent_id.clone())
                        .meta("status", current.to_string()),
                )
                .await;
        }

        for issue in pending_recovery {
            self.run_recovery(&agent_id, &issue).await;
        }
    }

    fn recovery_kind_for(code: &str) -> RecoveryKind {
        match code {
            "AGENT_NOT_FOUND" => RecoveryKind::Failover,
            "HIGH_ERROR_RATE" => RecoveryKind::Restart,
            "HIGH_RESPONSE_TIME" => RecoveryKind::Throttle,
            _ => RecoveryKind::Alert,
        }
    }

    /// Execute one recovery action for `agent_id` triggered by `issue`.
    async fn run_recovery(&self, agent_id: &AgentId, issue: &HealthIssue) {
        let now = self.clock.now();
        let kind = Self::recovery_kind_for(&issue.code);
        let action_id = Uuid::new_v4();
        {
            let mut state = self.state.write().await;
            state.actions.push(RecoveryAction {
                id: action_id,
                agent_id: agent_id.clone(),
                kind,
                issue_code: issue.code.clone(),
                status: RecoveryStatus::Executing,
                created_at: now,
                completed_at: None,
                detail: None,
            });
        }
        info!(agent = %agent_id, ?kind, code = %issue.code, "recovery started");
        self.bus
            .publish(
                Event::new(EventKind::RecoveryStarted, now)
                    .agent(agent_id.clone())
                    .meta("kind", format!("{kind:?}").to_lowercase())
                    .meta("code", issue.code.as_str()),
            )
            .await;

        let outcome: FabricResult<String> = match kind {
            RecoveryKind::Failover => self.failover(agent_id).await,
            RecoveryKind::Restart => {
                // Flag the agent and clear it so the next heartbeat starts
                // from a clean Idle state.
                self.registry.mark_error(agent_id).await.and(
                    self.registry
                        .clear_error(agent_id)
                        .await
                        .map(|_| "restart requested".to_string()),
                )
            }
            RecoveryKind::Throttle => Ok("intake throttled".to_string()),
            RecoveryKind::Scale => Ok("scale-up requested".to_string()),
            RecoveryKind::Alert => Ok("operators alerted".to_string()),
        };

        let done = self.clock.now();
        let (status, detail) = match outcome {
            Ok(detail) => (RecoveryStatus::Completed, detail),
            Err(err) => {
                warn!(agent = %agent_id, error = %err, "recovery failed");
                (RecoveryStatus::Failed, err.to_string())
            }
        };
        {
            let mut state = self.state.write().await;
            if let Some(action) = state.actions.iter_mut().find(|a| a.id == action_id) {
                action.status = status;
                action.completed_at = Some(done);
                action.detail = Some(detail.clone());
            }
        }
        if status == RecoveryStatus::Completed {
            self.bus
                .publish(
                    Event::new(EventKind::RecoveryCompleted, done)
                        .agent(agent_id.clone())
                        .meta("kind", format!("{kind:?}").to_lowercase())
                        .meta("detail", detail.as_str()),
                )
                .await;
        }
    }

    /// Find a capability-matched alternative for a failing agent.
    async fn failover(&self, failing: &AgentId) -> FabricResult<String> {
        let capabilities = match self.registry.get(failing).await {
            Ok(agent) => agent.capabilities,
            Err(_) => HashSet::new(),
        };
        let query = AgentQuery {
            required_capabilities: capabilities,
            exclude: [failing.clone()].into_iter().collect(),
            require_headroom: true,
            ..Default::default()
        };
        let candidates = self.registry.discover(&query).await;
        match candidates.first() {
            Some(candidate) => Ok(format!("failover target {}", candidate.agent.id)),
            None => Err(crate::types::FabricError::ResourceExhausted(format!(
                "no failover target for {failing}"
            ))),
        }
    }

    /// Fit trends for one agent over the rolling window and emit events
    /// for the significant ones.
    pub async fn analyze_trends(&self, agent_id: &AgentId) -> Vec<TrendReport> {
        let now = self.clock.now();
        let window_start = now - Duration::milliseconds(self.config.trend_window_ms as i64);
        let state = self.state.read().await;
        let Some(history) = state.history.get(agent_id) else {
            return Vec::new();
        };
        let windowed: Vec<&HealthCheckRecord> =
            history.iter().filter(|r| r.at >= window_start).collect();
        if windowed.len() < 3 {
            return Vec::new();
        }

        let origin = windowed[0].at;
        let minutes = |at: DateTime<Utc>| (at - origin).num_milliseconds() as f64 / 60_000.0;

        let mut reports = Vec::new();
        for (metric, values) in [
            (
                "response_time_ms",
                windowed
                    .iter()
                    .map(|r| (minutes(r.at), r.response_time_ms))
                    .collect::<Vec<_>>(),
            ),
            (
                "error_rate",
                windowed
                    .iter()
                    .map(|r| (minutes(r.at), r.error_rate))
                    .collect::<Vec<_>>(),
            ),
        ] {
            if let Some((slope, confidence)) = linear_fit(&values) {
                let direction = if slope > self.config.trend_slope_epsilon {
                    TrendDirection::Degrading
                } else if slope < -self.config.trend_slope_epsilon {
                    TrendDirection::Improving
                } else {
                    TrendDirection::Stable
                };
                reports.push(TrendReport {
                    agent_id: agent_id.clone(),
                    metric: metric.to_string(),
                    direction,
                    slope_per_minute: slope,
                    confidence,
                });
            }
        }
        drop(state);

        for report in &reports {
            if report.is_significant(self.config.trend_slope_epsilon, self.config.trend_confidence)
            {
                debug!(agent = %agent_id, metric = %report.metric, direction = ?report.direction, "trend detected");
                self.bus
                    .publish(
                        Event::new(EventKind::TrendDetected, now)
                            .agent(agent_id.clone())
                            .meta("metric", report.metric.as_str())
                            .meta(
                                "direction",
                                format!("{:?}", report.direction).to_lowercase(),
                            )
                            .meta("confidence", report.confidence),
                    )
                    .await;
            }
        }
        reports
    }

    /// Compute the SLA report for one agent over the rolling period and
    /// emit a violation event when availability misses the target.
    pub async fn sla_report(&self, agent_id: &AgentId) -> Option<SlaReport> {
        let now = self.clock.now();
        let period_start = now - Duration::milliseconds(self.config.sla_period_ms as i64);
        let state = self.state.read().await;
        let history = state.history.get(agent_id)?;
        let windowed: Vec<&HealthCheckRecord> =
            history.iter().filter(|r| r.at >= period_start).collect();
        if windowed.is_empty() {
            return None;
        }

        let online = windowed.iter().filter(|r| r.online).count();
        let availability = online as f64 / windowed.len() as f64;
        let mut responses: Vec<f64> = windowed.iter().map(|r| r.response_time_ms).collect();
        responses.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let period_hours = self.config.sla_period_ms as f64 / 3_600_000.0;
        let report = SlaReport {
            agent_id: agent_id.clone(),
            availability,
            p50_ms: percentile(&responses, 0.50),
            p95_ms: percentile(&responses, 0.95),
            p99_ms: percentile(&responses, 0.99),
            throughput_per_hour: windowed.len() as f64 / period_hours,
            violated: availability < self.config.sla_availability_target,
        };
        drop(state);

        if report.violated {
            warn!(agent = %agent_id, availability, "SLA violation");
            self.bus
                .publish(
                    Event::new(EventKind::SlaViolation, now)
                        .agent(agent_id.clone())
                        .meta("availability", availability),
                )
                .await;
        }
        Some(report)
    }

    /// Recorded recovery actions, newest last.
    pub async fn recovery_actions(&self) -> Vec<RecoveryAction> {
        self.state.read().await.actions.clone()
    }

    /// Retained history for one agent.
    pub async fn history(&self, agent_id: &AgentId) -> Vec<HealthCheckRecord> {
        self.state
            .read()
            .await
            .history
            .get(agent_id)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// Least-squares fit over (x, y) points; returns (slope, R^2).
fn linear_fit(points: &[(f64, f64)]) -> Option<(f64, f64)> {
    let n = points.len() as f64;
    if points.len() < 2 {
        return None;
    }
    let sum_x: f64 = points.iter().map(|(x, _)| x).sum();
    let sum_y: f64 = points.iter().map(|(_, y)| y).sum();
    let mean_x = sum_x / n;
    let mean_y = sum_y / n;
    let ss_xx: f64 = points.iter().map(|(x, _)| (x - mean_x).powi(2)).sum();
    if ss_xx == 0.0 {
        return None;
    }
    let ss_xy: f64 = points
        .iter()
        .map(|(x, y)| (x - mean_x) * (y - mean_y))
        .sum();
    let slope = ss_xy / ss_xx;
    let ss_yy: f64 = points.iter().map(|(_, y)| (y - mean_y).powi(2)).sum();
    let r2 = if ss_yy == 0.0 {
        // A flat series is a perfect fit of a zero slope.
        1.0
    } else {
        (ss_xy * ss_xy) / (ss_xx * ss_yy)
    };
    Some((slope, r2))
}

/// Nearest-rank percentile over a sorted slice.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((q * sorted.len() as f64).ceil() as usize).clamp(1, sorted.len());
    sorted[rank - 1]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::registry::{HeartbeatStats, RegistryConfig};

    async fn setup() -> (Arc<HealthMonitor>, Arc<AgentRegistry>, Arc<ManualClock>, Arc<EventBus>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let bus = Arc::new(EventBus::new(clock.clone()));
        let registry = Arc::new(AgentRegistry::new(
            RegistryConfig::default(),
            clock.clone(),
            bus.clone(),
        ));
        let monitor = Arc::new(HealthMonitor::new(
            HealthConfig::default(),
            clock.clone(),
            bus.clone(),
            registry.clone(),
            Arc::new(RegistryProbe),
        ));
        (monitor, registry, clock, bus)
    }

    #[tokio::test]
    async fn healthy_agent_produces_clean_record() {
        let (monitor, registry, _clock, _bus) = setup().await;
        registry
            .register("a1".to_string(), HashSet::new(), 2)
            .await
            .unwrap();
        let records = monitor.check_all().await;
        assert_eq!(records.len(), 1);
        assert!(records[0].online);
        assert!(records[0].issues.is_empty());
    }

    #[tokio::test]
    async fn high_error_rate_is_critical() {
        let (monitor, registry, _clock, _bus) = setup().await;
        registry
            .register("a1".to_string(), HashSet::new(), 2)
            .await
            .unwrap();
        // 3 failures out of 4 -> 75% error rate.
        let task = uuid::Uuid::new_v4();
        for success in [true, false, false, false] {
            registry
                .record_completion(&"a1".to_string(), &task, success, 10)
                .await
                .unwrap();
        }
        let records = monitor.check_all().await;
        let issue = records[0]
            .issues
            .iter()
            .find(|i| i.code == "HIGH_ERROR_RATE")
            .expect("error-rate issue");
        assert_eq!(issue.severity, IssueSeverity::Critical);
        assert_eq!(issue.category, IssueCategory::Reliability);
    }

    #[tokio::test]
    async fn offline_agent_triggers_failover_recovery() {
        let (monitor, registry, clock, bus) = setup().await;
        let rx = bus.subscribe().await;
        registry
            .register("dead".to_string(), HashSet::new(), 2)
            .await
            .unwrap();
        registry
            .register("spare".to_string(), HashSet::new(), 2)
            .await
            .unwrap();

        // Only the spare keeps heartbeating.
        clock.advance(Duration::milliseconds(61_000));
        registry
            .heartbeat(&"spare".to_string(), HeartbeatStats::default())
            .await
            .unwrap();
        registry.sweep_liveness().await;

        monitor.check_all().await;
        let actions = monitor.recovery_actions().await;
        let failover = actions
            .iter()
            .find(|a| a.agent_id == "dead" && a.kind == RecoveryKind::Failover)
            .expect("failover action");
        assert_eq!(failover.status, RecoveryStatus::Completed);
        assert!(failover
            .detail
            .as_deref()
            .unwrap_or_default()
            .contains("spare"));

        // recovery_started then recovery_completed appear on the bus.
        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.kind);
        }
        assert!(kinds.contains(&EventKind::RecoveryStarted));
        assert!(kinds.contains(&EventKind::RecoveryCompleted));
    }

    #[tokio::test]
    async fn degrading_trend_is_detected() {
        let (monitor, _registry, clock, _bus) = setup().await;
        // Inject a steadily worsening response series directly.
        let agent_id = "a1".to_string();
        {
            let mut state = monitor.state.write().await;
            let history = state.history.entry(agent_id.clone()).or_default();
            for i in 0..10 {
                history.push_back(HealthCheckRecord {
                    at: clock.now() + Duration::minutes(i),
                    agent_id: agent_id.clone(),
                    response_time_ms: 100.0 + 50.0 * i as f64,
                    task_queue_size: 0,
                    error_rate: 0.0,
                    current_load: 0.0,
                    idle_ms: 0,
                    online: true,
                    issues: Vec::new(),
                });
            }
        }
        clock.advance(Duration::minutes(10));
        let reports = monitor.analyze_trends(&agent_id).await;
        let response = reports
            .iter()
            .find(|r| r.metric == "response_time_ms")
            .unwrap();
        assert_eq!(response.direction, TrendDirection::Degrading);
        assert!(response.confidence > 0.9);
    }

    #[tokio::test]
    async fn sla_violation_fires_below_target() {
        let (monitor, _registry, clock, bus) = setup().await;
        let rx = bus.subscribe().await;
        let agent_id = "flaky".to_string();
        {
            let mut state = monitor.state.write().await;
            let history = state.history.entry(agent_id.clone()).or_default();
            // 10 checks, 2 offline -> 80% availability.
            for i in 0..10 {
                history.push_back(HealthCheckRecord {
                    at: clock.now() + Duration::minutes(i),
                    agent_id: agent_id.clone(),
                    response_time_ms: 50.0,
                    task_queue_size: 0,
                    error_rate: 0.0,
                    current_load: 0.0,
                    idle_ms: 0,
                    online: i % 5 != 0,
                    issues: Vec::new(),
                });
            }
        }
        clock.advance(Duration::minutes(10));
        let report = monitor.sla_report(&agent_id).await.unwrap();
        assert!(report.violated);
        assert!((report.availability - 0.8).abs() < 1e-9);
        assert_eq!(report.p50_ms, 50.0);

        let mut saw_violation = false;
        while let Ok(event) = rx.try_recv() {
            saw_violation |= event.kind == EventKind::SlaViolation;
        }
        assert!(saw_violation);
    }

    #[test]
    fn linear_fit_recovers_slope() {
        let points: Vec<(f64, f64)> = (0..10).map(|i| (i as f64, 2.0 * i as f64 + 1.0)).collect();
        let (slope, r2) = linear_fit(&points).unwrap();
        assert!((slope - 2.0).abs() < 1e-9);
        assert!((r2 - 1.0).abs() < 1e-9);
    }

    #[test]
    fn percentile_nearest_rank() {
        let sorted = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0];
        assert_eq!(percentile(&sorted, 0.50), 5.0);
        assert_eq!(percentile(&sorted, 0.95), 10.0);
        assert_eq!(percentile(&sorted, 0.99), 10.0);
    }
}
