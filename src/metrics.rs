//! Fabric metrics and Prometheus export
//!
//! Counters, gauges and histograms covering task flow, agent fleet size
//! and dispatch latency, collected in a dedicated Prometheus registry
//! and exported through the text encoder. The facade exposes the export
//! as a method; serving it over HTTP is the host's business.

use crate::types::{FabricError, FabricResult};
use prometheus::{
    histogram_opts, opts, Encoder, Histogram, IntCounter, IntGauge, TextEncoder,
};
use serde::{Deserialize, Serialize};

fn registry_err(e: prometheus::Error) -> FabricError {
    FabricError::Internal(format!("metrics registry: {e}"))
}

/// Point-in-time view of the core counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Tasks admitted since start
    pub tasks_submitted: u64,
    /// Tasks completed successfully
    pub tasks_completed: u64,
    /// Task failures (each attempt counts)
    pub tasks_failed: u64,
    /// Retries scheduled
    pub tasks_retried: u64,
    /// Tasks cancelled
    pub tasks_cancelled: u64,
    /// Current queue depth
    pub queue_depth: i64,
    /// Currently registered agents
    pub agents_registered: i64,
}

/// Prometheus-backed metrics for the fabric
pub struct FabricMetrics {
    registry: prometheus::Registry,
    tasks_submitted: IntCounter,
    tasks_completed: IntCounter,
    tasks_failed: IntCounter,
    tasks_retried: IntCounter,
    tasks_cancelled: IntCounter,
    queue_depth: IntGauge,
    agents_registered: IntGauge,
    task_duration_ms: Histogram,
    dispatch_latency_ms: Histogram,
}

impl FabricMetrics {
    /// Create and register all metrics in a fresh registry.
    pub fn new() -> FabricResult<Self> {
        let registry = prometheus::Registry::new();
        let tasks_submitted = IntCounter::with_opts(opts!(
            "taskfabric_tasks_submitted_total",
            "Tasks admitted to the scheduler"
        ))
        .map_err(registry_err)?;
        let tasks_completed = IntCounter::with_opts(opts!(
            "taskfabric_tasks_completed_total",
            "Tasks completed successfully"
        ))
        .map_err(registry_err)?;
        let tasks_failed = IntCounter::with_opts(opts!(
            "taskfabric_tasks_failed_total",
            "Task failures, counting each attempt"
        ))
        .map_err(registry_err)?;
        let tasks_retried = IntCounter::with_opts(opts!(
            "taskfabric_tasks_retried_total",
            "Retries scheduled after failures"
        ))
        .map_err(registry_err)?;
        let tasks_cancelled = IntCounter::with_opts(opts!(
            "taskfabric_tasks_cancelled_total",
            "Tasks cancelled before completion"
        ))
        .map_err(registry_err)?;
        let queue_depth = IntGauge::with_opts(opts!(
            "taskfabric_queue_depth",
            "Tasks currently queued for selection"
        ))
        .map_err(registry_err)?;
        let agents_registered = IntGauge::with_opts(opts!(
            "taskfabric_agents_registered",
            "Agents currently registered"
        ))
        .map_err(registry_err)?;
        let task_duration_ms = Histogram::with_opts(histogram_opts!(
            "taskfabric_task_duration_ms",
            "Wall-clock task execution time in milliseconds",
            vec![10.0, 100.0, 1_000.0, 10_000.0, 60_000.0, 600_000.0, 3_600_000.0]
        ))
        .map_err(registry_err)?;
        let dispatch_latency_ms = Histogram::with_opts(histogram_opts!(
            "taskfabric_dispatch_latency_ms",
            "Queue-to-assignment latency in milliseconds",
            vec![1.0, 10.0, 100.0, 1_000.0, 10_000.0, 60_000.0]
        ))
        .map_err(registry_err)?;

        for metric in [
            Box::new(tasks_submitted.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(tasks_completed.clone()),
            Box::new(tasks_failed.clone()),
            Box::new(tasks_retried.clone()),
            Box::new(tasks_cancelled.clone()),
            Box::new(queue_depth.clone()),
            Box::new(agents_registered.clone()),
            Box::new(task_duration_ms.clone()),
            Box::new(dispatch_latency_ms.clone()),
        ] {
            registry.register(metric).map_err(registry_err)?;
        }

        Ok(Self {
            registry,
            tasks_submitted,
            tasks_completed,
            tasks_failed,
            tasks_retried,
            tasks_cancelled,
            queue_depth,
            agents_registered,
            task_duration_ms,
            dispatch_latency_ms,
        })
    }

    /// One task admitted.
    pub fn record_submitted(&self) {
        self.tasks_submitted.inc();
    }

    /// One task completed, with its execution time.
    pub fn record_completed(&self, duration_ms: u64) {
        self.tasks_completed.inc();
        self.task_duration_ms.observe(duration_ms as f64);
    }

    /// One failed attempt; `retried` marks whether a retry was scheduled.
    pub fn record_failed(&self, retried: bool) {
        self.tasks_failed.inc();
        if retried {
            self.tasks_retried.inc();
        }
    }

    /// One task cancelled.
    pub fn record_cancelled(&self) {
        self.tasks_cancelled.inc();
    }

    /// Queue-to-assignment latency for one claim.
    pub fn record_dispatch_latency(&self, latency_ms: f64) {
        self.dispatch_latency_ms.observe(latency_ms);
    }

    /// Update the queue-depth gauge.
    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.set(depth as i64);
    }

    /// Update the registered-agents gauge.
    pub fn set_agents_registered(&self, count: usize) {
        self.agents_registered.set(count as i64);
    }

    /// Current counter values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            tasks_submitted: self.tasks_submitted.get(),
            tasks_completed: self.tasks_completed.get(),
            tasks_failed: self.tasks_failed.get(),
            tasks_retried: self.tasks_retried.get(),
            tasks_cancelled: self.tasks_cancelled.get(),
            queue_depth: self.queue_depth.get(),
            agents_registered: self.agents_registered.get(),
        }
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn export_prometheus(&self) -> FabricResult<String> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&families, &mut buffer)
            .map_err(registry_err)?;
        String::from_utf8(buffer)
            .map_err(|e| FabricError::Internal(format!("metrics encoding: {e}")))
    }
}
