#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Flowlane execution engine
//!
//! The engine owns the lane manager, the scheduler, and the per-workflow
//! trackers. It gates admission on its lifecycle state, persists lifecycle
//! records, and wires every workflow's transition hooks into the stream
//! bridge and the metrics sink.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use flowlane_common::config::Config;
use flowlane_common::error::{Error, Result};
use flowlane_common::metrics::{MetricsSink, PrometheusSink};
use flowlane_common::types::{
    CancellationReason, TaskResult, WorkflowId, WorkflowResult, WorkflowSpec, WorkflowState,
    DEFAULT_LANE,
};
use flowlane_core::compiler::{compile, ExecutionPlan};
use flowlane_core::store::{task_key, workflow_key, StateStore};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};
use uuid::Uuid;

pub mod lane;
pub mod manager;
pub mod retry;
pub mod scheduler;
pub mod signal;
pub mod stream;
pub mod tracker;

pub use lane::{Lane, LaneStats, LaneTask};
pub use manager::{LaneManager, ManagerStats};
pub use retry::BackoffPolicy;
pub use scheduler::{noop_body, Scheduler, TaskBodies, TaskBody, TaskContext};
pub use signal::{Signal, SignalBus};
pub use stream::{StreamBridge, StreamSubscription};
pub use tracker::{StateTracker, TransitionCtx, TransitionEvent, TransitionKind};

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const STOPPING: u8 = 2;
const STOPPED: u8 = 3;

/// How a submission returns to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitMode {
    /// Block until terminal when every task has an executable body
    Sync,
    /// Persist as pending and return immediately
    Async,
}

/// Response to a submission
#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub workflow_id: WorkflowId,
    pub status: WorkflowState,
    /// Populated only for synchronous executions that ran to terminal
    pub result: Option<WorkflowResult>,
}

/// One row of a workflow listing
#[derive(Debug, Clone)]
pub struct WorkflowSummary {
    pub workflow_id: WorkflowId,
    pub name: String,
    pub status: WorkflowState,
    pub task_count: usize,
    pub submitted_at: DateTime<Utc>,
}

/// Listing filter
#[derive(Debug, Clone, Copy, Default)]
pub struct ListFilter {
    pub status: Option<WorkflowState>,
}

/// Listing pagination
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 50,
        }
    }
}

struct WorkflowEntry {
    spec: Arc<WorkflowSpec>,
    plan: Arc<ExecutionPlan>,
    tracker: Arc<StateTracker>,
    cancel: CancellationToken,
    bodies: Mutex<Option<TaskBodies>>,
    submitted_at: DateTime<Utc>,
}

struct EngineInner {
    lifecycle: AtomicU8,
    config: Config,
    manager: Arc<LaneManager>,
    scheduler: Scheduler,
    store: Arc<dyn StateStore>,
    bridge: Arc<StreamBridge>,
    signals: Arc<SignalBus>,
    metrics: Arc<dyn MetricsSink>,
    workflows: DashMap<WorkflowId, Arc<WorkflowEntry>>,
}

/// Lifecycle owner of the execution pipeline
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(config: Config, store: Arc<dyn StateStore>) -> Self {
        Self::with_metrics(config, store, Arc::new(PrometheusSink))
    }

    pub fn with_metrics(
        config: Config,
        store: Arc<dyn StateStore>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let manager = Arc::new(LaneManager::new(
            config.engine.redirect_max_depth,
            Arc::clone(&metrics),
        ));
        let scheduler = Scheduler::new(
            Arc::clone(&manager),
            BackoffPolicy::from_engine_config(&config.engine),
        );
        let bridge = StreamBridge::new(config.engine.node_id.clone(), config.stream.clone());
        let signals = Arc::new(SignalBus::new(
            config.engine.node_id.clone(),
            config.stream.subscriber_buffer.max(1),
        ));
        Self {
            inner: Arc::new(EngineInner {
                lifecycle: AtomicU8::new(IDLE),
                config,
                manager,
                scheduler,
                store,
                bridge,
                signals,
                metrics,
                workflows: DashMap::new(),
            }),
        }
    }

    /// Launch the engine: registers the configured lanes plus the default
    /// lane. Only valid from idle; calling again while running is a no-op.
    pub fn start(&self) -> Result<()> {
        match self.inner.lifecycle.compare_exchange(
            IDLE,
            RUNNING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(RUNNING) => return Ok(()),
            Err(_) => return Err(Error::NotRunning),
        }

        for lane in &self.inner.config.lanes {
            self.inner.manager.register(lane.clone())?;
        }
        if self.inner.manager.get(DEFAULT_LANE).is_none() {
            self.inner.manager.register(Default::default())?;
        }
        info!(node_id = %self.inner.config.engine.node_id, "engine started");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner.lifecycle.load(Ordering::Acquire) == RUNNING
    }

    /// Event stream surface
    pub fn stream(&self) -> &Arc<StreamBridge> {
        &self.inner.bridge
    }

    /// Signal delivery surface
    pub fn signals(&self) -> &Arc<SignalBus> {
        &self.inner.signals
    }

    /// Aggregate lane statistics
    pub fn lane_stats(&self) -> ManagerStats {
        self.inner.manager.stats()
    }

    /// Submit a workflow for execution
    ///
    /// Admission is gated on the lifecycle state before anything reaches a
    /// lane. In sync mode the call blocks to the terminal result only when
    /// every task carries an executable body; otherwise the workflow is
    /// persisted pending and handed back immediately for later activation.
    #[instrument(skip(self, spec, bodies), fields(workflow_id = %spec.id, mode = ?mode))]
    pub async fn submit(
        &self,
        mut spec: WorkflowSpec,
        bodies: TaskBodies,
        mode: SubmitMode,
    ) -> Result<SubmitOutcome> {
        if self.inner.lifecycle.load(Ordering::Acquire) != RUNNING {
            return Err(Error::NotRunning);
        }

        if spec.id.is_empty() {
            spec.id = Uuid::new_v4().to_string();
        }
        let plan = compile(&spec)?;
        if self.inner.workflows.contains_key(&spec.id) {
            return Err(Error::Internal(format!(
                "workflow {} already submitted",
                spec.id
            )));
        }

        let executable = plan.order.iter().all(|id| bodies.contains_key(id));
        let workflow_id = spec.id.clone();
        let tracker = StateTracker::new(workflow_id.clone());
        Arc::clone(&self.inner.bridge).attach(&tracker);
        attach_metrics_hook(&tracker, Arc::clone(&self.inner.metrics));

        let entry = Arc::new(WorkflowEntry {
            spec: Arc::new(spec),
            plan: Arc::new(plan),
            tracker,
            cancel: CancellationToken::new(),
            bodies: Mutex::new(Some(bodies)),
            submitted_at: Utc::now(),
        });
        self.inner
            .workflows
            .insert(workflow_id.clone(), Arc::clone(&entry));

        self.inner.persist_pending(&entry).await?;
        entry.tracker.init_tasks(&entry.plan.order);

        match (mode, executable) {
            (SubmitMode::Sync, true) => {
                let result = Arc::clone(&self.inner).execute(entry).await;
                Ok(SubmitOutcome {
                    workflow_id,
                    status: result.status,
                    result: Some(result),
                })
            }
            (SubmitMode::Async, true) => {
                let inner = Arc::clone(&self.inner);
                tokio::spawn(async move {
                    inner.execute(entry).await;
                });
                Ok(SubmitOutcome {
                    workflow_id,
                    status: WorkflowState::Pending,
                    result: None,
                })
            }
            // Bodies are not complete yet; the surrounding runtime injects
            // them later through activate()
            (_, false) => Ok(SubmitOutcome {
                workflow_id,
                status: WorkflowState::Pending,
                result: None,
            }),
        }
    }

    /// Attach bodies to a pending workflow and schedule its admission
    pub fn activate(&self, workflow_id: &str, bodies: TaskBodies) -> Result<SubmitOutcome> {
        if self.inner.lifecycle.load(Ordering::Acquire) != RUNNING {
            return Err(Error::NotRunning);
        }
        let entry = self
            .inner
            .workflows
            .get(workflow_id)
            .map(|e| Arc::clone(&e))
            .ok_or_else(|| Error::WorkflowNotFound(workflow_id.to_string()))?;
        let status = entry.tracker.status();
        if status != WorkflowState::Pending {
            return Err(Error::IllegalTransition {
                from: status.as_str().to_string(),
                to: WorkflowState::Scheduled.as_str().to_string(),
            });
        }

        *entry.bodies.lock() = Some(bodies);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.execute(entry).await;
        });
        Ok(SubmitOutcome {
            workflow_id: workflow_id.to_string(),
            status: WorkflowState::Pending,
            result: None,
        })
    }

    /// Cancel a workflow. Valid while pending, scheduled, or running; a
    /// no-op once terminal. Idempotent.
    pub async fn cancel(&self, workflow_id: &str) -> Result<()> {
        let entry = self
            .inner
            .workflows
            .get(workflow_id)
            .map(|e| Arc::clone(&e))
            .ok_or_else(|| Error::WorkflowNotFound(workflow_id.to_string()))?;

        let status = entry.tracker.status();
        if status.is_terminal() {
            return Ok(());
        }
        entry.cancel.cancel();

        // A workflow that never reached the scheduler settles here
        if status == WorkflowState::Pending {
            for id in &entry.plan.order {
                let _ = entry.tracker.transition_task(
                    id,
                    flowlane_common::types::TaskState::Cancelled,
                    TransitionCtx::cancelled(CancellationReason::User, "cancelled before scheduling"),
                );
            }
            let settled = entry.tracker.transition_workflow(
                WorkflowState::Cancelled,
                TransitionCtx::cancelled(CancellationReason::User, "workflow cancelled"),
            );
            if settled.is_ok() {
                let result = entry.tracker.snapshot();
                self.inner.persist_terminal(&entry, &result).await?;
            }
        }
        Ok(())
    }

    /// Current state of a workflow
    pub async fn query(&self, workflow_id: &str) -> Result<WorkflowResult> {
        if let Some(entry) = self.inner.workflows.get(workflow_id) {
            return Ok(entry.tracker.snapshot());
        }
        self.inner.load_persisted(workflow_id).await
    }

    /// Current state of a single task
    pub async fn get_task_result(&self, workflow_id: &str, task_id: &str) -> Result<TaskResult> {
        let result = self.query(workflow_id).await?;
        result
            .task_results
            .get(task_id)
            .cloned()
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))
    }

    /// List workflows with filter and pagination, newest first
    pub fn list(&self, filter: ListFilter, page: Page) -> Vec<WorkflowSummary> {
        let mut rows: Vec<WorkflowSummary> = self
            .inner
            .workflows
            .iter()
            .map(|entry| WorkflowSummary {
                workflow_id: entry.spec.id.clone(),
                name: entry.spec.name.clone(),
                status: entry.tracker.status(),
                task_count: entry.plan.task_count(),
                submitted_at: entry.submitted_at,
            })
            .filter(|row| filter.status.is_none_or(|wanted| row.status == wanted))
            .collect();
        rows.sort_by(|a, b| {
            b.submitted_at
                .cmp(&a.submitted_at)
                .then_with(|| a.workflow_id.cmp(&b.workflow_id))
        });
        rows.into_iter().skip(page.offset).take(page.limit).collect()
    }

    /// Stop admission, drain the lanes within the configured grace period,
    /// and settle the lifecycle. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        match self.inner.lifecycle.compare_exchange(
            RUNNING,
            STOPPING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(IDLE) => {
                self.inner.lifecycle.store(STOPPED, Ordering::Release);
                return Ok(());
            }
            Err(_) => return Ok(()),
        }

        info!("engine stopping");
        for entry in self.inner.workflows.iter() {
            if !entry.tracker.status().is_terminal() {
                entry.cancel.cancel();
            }
        }

        let timeout = Duration::from_millis(self.inner.config.engine.shutdown_timeout_ms);
        let closed = self.inner.manager.close(timeout).await;
        self.inner.signals.close();
        self.inner.lifecycle.store(STOPPED, Ordering::Release);
        info!("engine stopped");
        closed
    }
}

impl EngineInner {
    async fn execute(self: Arc<Self>, entry: Arc<WorkflowEntry>) -> WorkflowResult {
        let bodies = entry.bodies.lock().take().unwrap_or_default();
        let result = self
            .scheduler
            .run(
                &entry.spec,
                &entry.plan,
                &bodies,
                &entry.tracker,
                &entry.cancel,
            )
            .await;
        if let Err(err) = self.persist_terminal(&entry, &result).await {
            error!(workflow_id = %entry.spec.id, %err, "failed to persist terminal state");
        }
        result
    }

    async fn persist_pending(&self, entry: &WorkflowEntry) -> Result<()> {
        self.store
            .put(
                &workflow_key(&entry.spec.id),
                json!({
                    "id": entry.spec.id,
                    "name": entry.spec.name,
                    "status": WorkflowState::Pending,
                    "metadata": entry.spec.metadata,
                    "submitted_at": entry.submitted_at,
                }),
            )
            .await
    }

    async fn persist_terminal(&self, entry: &WorkflowEntry, result: &WorkflowResult) -> Result<()> {
        self.store
            .put(
                &workflow_key(&entry.spec.id),
                json!({
                    "id": entry.spec.id,
                    "name": entry.spec.name,
                    "status": result.status,
                    "error": result.error,
                    "metadata": entry.spec.metadata,
                    "submitted_at": entry.submitted_at,
                    "finished_at": Utc::now(),
                }),
            )
            .await?;
        for (task_id, task) in &result.task_results {
            self.store
                .put(
                    &task_key(&entry.spec.id, task_id),
                    serde_json::to_value(task)?,
                )
                .await?;
        }
        Ok(())
    }

    async fn load_persisted(&self, workflow_id: &str) -> Result<WorkflowResult> {
        let record = self
            .store
            .get(&workflow_key(workflow_id))
            .await?
            .ok_or_else(|| Error::WorkflowNotFound(workflow_id.to_string()))?;
        let status: WorkflowState = serde_json::from_value(
            record
                .get("status")
                .cloned()
                .unwrap_or(serde_json::Value::Null),
        )?;
        let error = record
            .get("error")
            .and_then(|v| v.as_str())
            .map(ToString::to_string);

        let mut task_results = std::collections::HashMap::new();
        let prefix = format!("task:{workflow_id}:");
        for (_, value) in self.store.scan_prefix(&prefix).await? {
            let task: TaskResult = serde_json::from_value(value)?;
            task_results.insert(task.task_id.clone(), task);
        }
        Ok(WorkflowResult {
            workflow_id: workflow_id.to_string(),
            status,
            task_results,
            error,
        })
    }
}

/// Record terminal outcomes exactly once per attempt; the tracker's guards
/// make the terminal hook fire a single time per task and workflow.
fn attach_metrics_hook(tracker: &StateTracker, metrics: Arc<dyn MetricsSink>) {
    tracker.subscribe(Box::new(move |event| match event.kind {
        TransitionKind::Workflow { from, to } => {
            if from == WorkflowState::Pending && to == WorkflowState::Pending {
                metrics.workflow_started();
            }
            if to.is_terminal() {
                metrics.record_workflow(to.as_str(), event.duration.unwrap_or_default());
                metrics.workflow_finished();
            }
        }
        TransitionKind::Task { to, .. } => {
            if to.is_terminal() {
                metrics.record_task(to.as_str(), event.duration.unwrap_or_default());
            }
        }
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowlane_common::metrics::NullSink;
    use flowlane_common::types::{TaskSpec, TaskState};
    use flowlane_core::store::MemoryStore;
    use futures::FutureExt;
    use serde_json::json;
    use std::time::Duration;

    fn engine() -> Engine {
        let engine = Engine::with_metrics(
            Config::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(NullSink),
        );
        engine.start().unwrap();
        engine
    }

    fn ok_bodies(ids: &[&str]) -> TaskBodies {
        let mut bodies = TaskBodies::new();
        for id in ids {
            bodies.insert(
                (*id).to_string(),
                Arc::new(|_ctx: TaskContext| async { Ok(json!(null)) }.boxed()) as TaskBody,
            );
        }
        bodies
    }

    fn two_task_spec(id: &str) -> WorkflowSpec {
        WorkflowSpec::new(id)
            .with_task(TaskSpec::new("a"))
            .with_task(TaskSpec::new("b").depends_on("a"))
    }

    async fn wait_for_terminal(engine: &Engine, id: &str) -> WorkflowResult {
        for _ in 0..500 {
            let result = engine.query(id).await.unwrap();
            if result.status.is_terminal() {
                return result;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("workflow never reached terminal state");
    }

    #[tokio::test]
    async fn sync_submit_runs_to_completion() {
        let engine = engine();
        let outcome = engine
            .submit(two_task_spec("wf1"), ok_bodies(&["a", "b"]), SubmitMode::Sync)
            .await
            .unwrap();
        assert_eq!(outcome.status, WorkflowState::Completed);
        let result = outcome.result.unwrap();
        assert_eq!(result.task_results["a"].state, TaskState::Completed);
        assert_eq!(result.task_results["b"].state, TaskState::Completed);
    }

    #[tokio::test]
    async fn async_submit_returns_pending_then_completes() {
        let engine = engine();
        let outcome = engine
            .submit(two_task_spec("wf2"), ok_bodies(&["a", "b"]), SubmitMode::Async)
            .await
            .unwrap();
        assert_eq!(outcome.status, WorkflowState::Pending);
        let result = wait_for_terminal(&engine, "wf2").await;
        assert_eq!(result.status, WorkflowState::Completed);
    }

    #[tokio::test]
    async fn sync_submit_without_bodies_stays_pending_until_activated() {
        let engine = engine();
        let outcome = engine
            .submit(two_task_spec("wf3"), TaskBodies::new(), SubmitMode::Sync)
            .await
            .unwrap();
        assert_eq!(outcome.status, WorkflowState::Pending);
        assert!(outcome.result.is_none());
        assert_eq!(
            engine.query("wf3").await.unwrap().status,
            WorkflowState::Pending
        );

        engine.activate("wf3", ok_bodies(&["a", "b"])).unwrap();
        let result = wait_for_terminal(&engine, "wf3").await;
        assert_eq!(result.status, WorkflowState::Completed);
    }

    #[tokio::test]
    async fn submission_rejected_before_start_and_after_stop() {
        let engine = Engine::with_metrics(
            Config::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(NullSink),
        );
        let err = engine
            .submit(two_task_spec("wf"), TaskBodies::new(), SubmitMode::Async)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotRunning));

        engine.start().unwrap();
        engine.stop().await.unwrap();
        let err = engine
            .submit(two_task_spec("wf"), TaskBodies::new(), SubmitMode::Async)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotRunning));
    }

    #[tokio::test]
    async fn compile_errors_surface_on_submit() {
        let engine = engine();
        let spec = WorkflowSpec::new("bad").with_task(TaskSpec::new("a").depends_on("ghost"));
        let err = engine
            .submit(spec, TaskBodies::new(), SubmitMode::Sync)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DependencyNotFound { .. }));
    }

    #[tokio::test]
    async fn cancel_pending_workflow_settles_cancelled() {
        let engine = engine();
        engine
            .submit(two_task_spec("wf4"), TaskBodies::new(), SubmitMode::Sync)
            .await
            .unwrap();
        engine.cancel("wf4").await.unwrap();

        let result = engine.query("wf4").await.unwrap();
        assert_eq!(result.status, WorkflowState::Cancelled);
        for task in result.task_results.values() {
            assert_eq!(task.state, TaskState::Cancelled);
            assert_eq!(task.cancellation_reason, Some(CancellationReason::User));
        }

        // Idempotent, including on terminal state
        engine.cancel("wf4").await.unwrap();
        engine.cancel("wf4").await.unwrap();
        assert_eq!(
            engine.query("wf4").await.unwrap().status,
            WorkflowState::Cancelled
        );
    }

    #[tokio::test]
    async fn cancel_unknown_workflow_errors() {
        let engine = engine();
        assert!(matches!(
            engine.cancel("missing").await,
            Err(Error::WorkflowNotFound(_))
        ));
    }

    #[tokio::test]
    async fn terminal_state_is_persisted_and_queryable() {
        let store = Arc::new(MemoryStore::new());
        let engine = Engine::with_metrics(
            Config::default(),
            Arc::clone(&store) as Arc<dyn StateStore>,
            Arc::new(NullSink),
        );
        engine.start().unwrap();
        engine
            .submit(two_task_spec("wf5"), ok_bodies(&["a", "b"]), SubmitMode::Sync)
            .await
            .unwrap();

        let record = store.get(&workflow_key("wf5")).await.unwrap().unwrap();
        assert_eq!(record["status"], json!("completed"));
        let task = store.get(&task_key("wf5", "a")).await.unwrap().unwrap();
        let task: TaskResult = serde_json::from_value(task).unwrap();
        assert_eq!(task.state, TaskState::Completed);
    }

    #[tokio::test]
    async fn get_task_result_distinguishes_unknown_task() {
        let engine = engine();
        engine
            .submit(two_task_spec("wf6"), ok_bodies(&["a", "b"]), SubmitMode::Sync)
            .await
            .unwrap();
        assert!(engine.get_task_result("wf6", "a").await.is_ok());
        assert!(matches!(
            engine.get_task_result("wf6", "zz").await,
            Err(Error::TaskNotFound(_))
        ));
        assert!(matches!(
            engine.get_task_result("nope", "a").await,
            Err(Error::WorkflowNotFound(_))
        ));
    }

    #[tokio::test]
    async fn list_filters_and_paginates() {
        let engine = engine();
        for i in 0..5 {
            engine
                .submit(
                    WorkflowSpec::new(format!("wf{i}")).with_task(TaskSpec::new("a")),
                    ok_bodies(&["a"]),
                    SubmitMode::Sync,
                )
                .await
                .unwrap();
        }
        engine
            .submit(
                WorkflowSpec::new("pending").with_task(TaskSpec::new("a")),
                TaskBodies::new(),
                SubmitMode::Sync,
            )
            .await
            .unwrap();

        let completed = engine.list(
            ListFilter {
                status: Some(WorkflowState::Completed),
            },
            Page::default(),
        );
        assert_eq!(completed.len(), 5);

        let first_page = engine.list(ListFilter::default(), Page { offset: 0, limit: 2 });
        assert_eq!(first_page.len(), 2);
        let second_page = engine.list(ListFilter::default(), Page { offset: 2, limit: 2 });
        assert_eq!(second_page.len(), 2);
        assert_ne!(
            first_page[0].workflow_id,
            second_page[0].workflow_id
        );
    }

    #[tokio::test]
    async fn concurrent_workflows_share_a_tiny_lane_without_deadlock() {
        let mut config = Config::default();
        config.lanes.push(flowlane_common::types::LaneConfig {
            capacity: 1,
            max_concurrency: 1,
            ..flowlane_common::types::LaneConfig::default()
        });
        let engine = Engine::with_metrics(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(NullSink),
        );
        engine.start().unwrap();

        let slow_body = || -> TaskBody {
            Arc::new(|_ctx: TaskContext| {
                async {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok(json!(null))
                }
                .boxed()
            })
        };
        for id in ["left", "right"] {
            let mut bodies = TaskBodies::new();
            bodies.insert("a".to_string(), slow_body());
            engine
                .submit(
                    WorkflowSpec::new(id).with_task(TaskSpec::new("a")),
                    bodies,
                    SubmitMode::Async,
                )
                .await
                .unwrap();
        }

        assert_eq!(
            wait_for_terminal(&engine, "left").await.status,
            WorkflowState::Completed
        );
        assert_eq!(
            wait_for_terminal(&engine, "right").await.status,
            WorkflowState::Completed
        );
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_double_start_is_noop() {
        let engine = engine();
        assert!(engine.start().is_ok());
        engine.stop().await.unwrap();
        engine.stop().await.unwrap();
        assert!(!engine.is_running());
        // Restart after stop is rejected
        assert!(matches!(engine.start(), Err(Error::NotRunning)));
    }
}
