//! Metrics collection and reporting

use crate::error::Result;
use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec, CounterVec,
    Gauge, GaugeVec, HistogramVec, Registry,
};
use std::time::Duration;

/// Global metrics registry
pub static METRICS_REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// Workflow terminal outcomes, labelled with the closed set
/// {completed, failed, cancelled}
pub static WORKFLOWS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "flowlane_workflows_total",
        "Workflows reaching a terminal state",
        &["outcome"]
    )
    .unwrap()
});

/// Task terminal outcomes, labelled with the closed set
/// {completed, failed, cancelled}
pub static TASKS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "flowlane_tasks_total",
        "Tasks reaching a terminal state",
        &["outcome"]
    )
    .unwrap()
});

/// Lane admission outcomes, labelled with the closed set
/// {accepted, rejected, redirected, dropped}
pub static LANE_SUBMISSIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "flowlane_lane_submissions_total",
        "Lane submissions by admission outcome",
        &["lane", "outcome"]
    )
    .unwrap()
});

/// Workflow duration histogram
pub static WORKFLOW_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "flowlane_workflow_duration_seconds",
        "Workflow wall time from submission to terminal state",
        &["outcome"],
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 60.0, 300.0]
    )
    .unwrap()
});

/// Task duration histogram
pub static TASK_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "flowlane_task_duration_seconds",
        "Task wall time from first run to terminal state",
        &["outcome"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 60.0]
    )
    .unwrap()
});

/// Lane wait duration histogram, enqueue to dequeue
pub static LANE_WAIT: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "flowlane_lane_wait_seconds",
        "Time tasks spend queued before a worker picks them up",
        &["lane"],
        vec![0.0001, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
    )
    .unwrap()
});

/// Active workflow gauge
pub static ACTIVE_WORKFLOWS: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!("flowlane_active_workflows", "Workflows not yet terminal").unwrap()
});

/// Lane queue depth gauge
pub static LANE_QUEUE_DEPTH: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "flowlane_lane_queue_depth",
        "Tasks currently queued per lane",
        &["lane"]
    )
    .unwrap()
});

/// Compensation passes that exhausted their retries
pub static SAGA_COMPENSATION_FAILURES: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "flowlane_saga_compensation_failures_total",
        "Sagas whose compensation retries were exhausted",
        &["definition"]
    )
    .unwrap()
});

/// Initialize all metrics
pub fn init_metrics() -> Result<()> {
    METRICS_REGISTRY.register(Box::new(WORKFLOWS_TOTAL.clone()))?;
    METRICS_REGISTRY.register(Box::new(TASKS_TOTAL.clone()))?;
    METRICS_REGISTRY.register(Box::new(LANE_SUBMISSIONS_TOTAL.clone()))?;
    METRICS_REGISTRY.register(Box::new(WORKFLOW_DURATION.clone()))?;
    METRICS_REGISTRY.register(Box::new(TASK_DURATION.clone()))?;
    METRICS_REGISTRY.register(Box::new(LANE_WAIT.clone()))?;
    METRICS_REGISTRY.register(Box::new(ACTIVE_WORKFLOWS.clone()))?;
    METRICS_REGISTRY.register(Box::new(LANE_QUEUE_DEPTH.clone()))?;
    METRICS_REGISTRY.register(Box::new(SAGA_COMPENSATION_FAILURES.clone()))?;

    Ok(())
}

/// Metrics sink trait; the engine and lanes record through this seam
pub trait MetricsSink: Send + Sync {
    /// Record a workflow terminal outcome
    fn record_workflow(&self, outcome: &str, duration: Duration);

    /// Record a task terminal outcome
    fn record_task(&self, outcome: &str, duration: Duration);

    /// Record a lane admission outcome
    fn record_lane_submission(&self, lane: &str, outcome: &str);

    /// Observe queue wait time for a dequeued task
    fn observe_lane_wait(&self, lane: &str, wait: Duration);

    /// Update the queue depth gauge for a lane
    fn set_lane_depth(&self, lane: &str, depth: usize);

    /// A workflow entered the system
    fn workflow_started(&self);

    /// A workflow reached a terminal state
    fn workflow_finished(&self);

    /// A saga exhausted its compensation retries
    fn record_compensation_failure(&self, definition: &str);
}

/// Prometheus-backed metrics sink
#[derive(Clone, Default)]
pub struct PrometheusSink;

impl MetricsSink for PrometheusSink {
    fn record_workflow(&self, outcome: &str, duration: Duration) {
        WORKFLOWS_TOTAL.with_label_values(&[outcome]).inc();
        WORKFLOW_DURATION
            .with_label_values(&[outcome])
            .observe(duration.as_secs_f64());
    }

    fn record_task(&self, outcome: &str, duration: Duration) {
        TASKS_TOTAL.with_label_values(&[outcome]).inc();
        TASK_DURATION
            .with_label_values(&[outcome])
            .observe(duration.as_secs_f64());
    }

    fn record_lane_submission(&self, lane: &str, outcome: &str) {
        LANE_SUBMISSIONS_TOTAL
            .with_label_values(&[lane, outcome])
            .inc();
    }

    fn observe_lane_wait(&self, lane: &str, wait: Duration) {
        LANE_WAIT
            .with_label_values(&[lane])
            .observe(wait.as_secs_f64());
    }

    fn set_lane_depth(&self, lane: &str, depth: usize) {
        LANE_QUEUE_DEPTH
            .with_label_values(&[lane])
            .set(depth as f64);
    }

    fn workflow_started(&self) {
        ACTIVE_WORKFLOWS.inc();
    }

    fn workflow_finished(&self) {
        ACTIVE_WORKFLOWS.dec();
    }

    fn record_compensation_failure(&self, definition: &str) {
        SAGA_COMPENSATION_FAILURES
            .with_label_values(&[definition])
            .inc();
    }
}

/// No-op sink for tests
#[derive(Clone, Default)]
pub struct NullSink;

impl MetricsSink for NullSink {
    fn record_workflow(&self, _outcome: &str, _duration: Duration) {}
    fn record_task(&self, _outcome: &str, _duration: Duration) {}
    fn record_lane_submission(&self, _lane: &str, _outcome: &str) {}
    fn observe_lane_wait(&self, _lane: &str, _wait: Duration) {}
    fn set_lane_depth(&self, _lane: &str, _depth: usize) {}
    fn workflow_started(&self) {}
    fn workflow_finished(&self) {}
    fn record_compensation_failure(&self, _definition: &str) {}
}
