//! Layered workflow scheduling
//!
//! Drives a compiled plan through the lane manager one layer at a time. No
//! task in layer k+1 starts before every task in layer k is terminal. A
//! non-cancelled failure drains the current layer and cancels everything
//! that was never scheduled; context cancellation stops further submission
//! and lets in-flight tasks observe their tokens.

use crate::lane::LaneTask;
use crate::manager::LaneManager;
use crate::retry::BackoffPolicy;
use crate::tracker::{StateTracker, TransitionCtx};
use dashmap::DashMap;
use flowlane_common::error::{Error, Result};
use flowlane_common::types::{
    CancellationReason, TaskId, TaskState, WorkflowId, WorkflowResult, WorkflowSpec, WorkflowState,
};
use flowlane_core::compiler::ExecutionPlan;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Execution context handed to a task body
pub struct TaskContext {
    pub workflow_id: WorkflowId,
    pub task_id: TaskId,
    pub payload: serde_json::Value,
    /// Outputs of this task's dependencies, keyed by task id
    pub inputs: HashMap<TaskId, serde_json::Value>,
    /// Cancellation context; long-running bodies should observe it
    pub cancel: CancellationToken,
}

/// Executable task body
pub type TaskBody =
    Arc<dyn Fn(TaskContext) -> BoxFuture<'static, Result<serde_json::Value>> + Send + Sync>;

/// Bodies keyed by task id
pub type TaskBodies = HashMap<TaskId, TaskBody>;

/// Body that completes immediately with a null output
pub fn noop_body() -> TaskBody {
    Arc::new(|_ctx| async { Ok(serde_json::Value::Null) }.boxed())
}

/// Drives compiled plans through lanes
pub struct Scheduler {
    manager: Arc<LaneManager>,
    backoff: BackoffPolicy,
}

impl Scheduler {
    pub fn new(manager: Arc<LaneManager>, backoff: BackoffPolicy) -> Self {
        Self { manager, backoff }
    }

    /// Execute the plan to a terminal workflow state
    #[instrument(skip_all, fields(workflow_id = %spec.id))]
    pub async fn run(
        &self,
        spec: &WorkflowSpec,
        plan: &ExecutionPlan,
        bodies: &TaskBodies,
        tracker: &Arc<StateTracker>,
        cancel: &CancellationToken,
    ) -> WorkflowResult {
        if let Err(error) = tracker.transition_workflow(WorkflowState::Scheduled, TransitionCtx::default())
        {
            warn!(%error, "workflow could not enter scheduled state");
            return tracker.snapshot();
        }
        if let Err(error) =
            tracker.transition_workflow(WorkflowState::Running, TransitionCtx::default())
        {
            warn!(%error, "workflow could not enter running state");
            return tracker.snapshot();
        }

        let outputs: Arc<DashMap<TaskId, serde_json::Value>> = Arc::new(DashMap::new());
        let mut failure_seen = false;

        for layer in &plan.layers {
            if failure_seen {
                self.skip_layer(tracker, layer, None, "skipped due to upstream failure");
                continue;
            }
            if cancel.is_cancelled() {
                self.skip_layer(
                    tracker,
                    layer,
                    Some(CancellationReason::User),
                    "workflow cancelled",
                );
                continue;
            }

            let submissions = layer.iter().map(|id| {
                self.submit_task(spec, id, bodies, tracker, cancel, &outputs)
            });
            let admitted = futures::future::join_all(submissions).await;

            // Layer barrier: every admitted task must reach terminal state
            for (id, waiter) in admitted {
                let Some(waiter) = waiter else { continue };
                if waiter.await.is_err() {
                    // The closure was dropped without running, which happens
                    // when its lane shuts down underneath it
                    cancel_task(tracker, &id, CancellationReason::User, "execution abandoned");
                }
            }

            if layer
                .iter()
                .any(|id| tracker.task_state(id) == Some(TaskState::Failed))
            {
                failure_seen = true;
            }
        }

        let status = tracker.implied_terminal_status();
        let ctx = match status {
            WorkflowState::Failed => TransitionCtx {
                error: tracker.first_failure(),
                ..TransitionCtx::default()
            },
            WorkflowState::Cancelled => TransitionCtx {
                error: Some("workflow cancelled".to_string()),
                reason: Some(tracker.implied_cancellation_reason()),
                ..TransitionCtx::default()
            },
            _ => TransitionCtx::default(),
        };
        if let Err(error) = tracker.transition_workflow(status, ctx) {
            warn!(%error, "workflow terminal transition rejected");
        }
        tracker.snapshot()
    }

    /// Transition one task to scheduled and hand it to its lane. Returns the
    /// barrier receiver when the task was admitted.
    async fn submit_task(
        &self,
        spec: &WorkflowSpec,
        id: &str,
        bodies: &TaskBodies,
        tracker: &Arc<StateTracker>,
        cancel: &CancellationToken,
        outputs: &Arc<DashMap<TaskId, serde_json::Value>>,
    ) -> (TaskId, Option<oneshot::Receiver<()>>) {
        let task_spec = spec
            .task(id)
            .expect("plan only references declared tasks");

        if tracker
            .transition_task(id, TaskState::Scheduled, TransitionCtx::default())
            .is_err()
        {
            // Already terminal, e.g. cancelled before scheduling
            return (id.to_string(), None);
        }

        let inputs: HashMap<TaskId, serde_json::Value> = task_spec
            .dependencies
            .iter()
            .filter_map(|dep| outputs.get(dep).map(|v| (dep.clone(), v.value().clone())))
            .collect();

        let (done_tx, done_rx) = oneshot::channel::<()>();
        let run = {
            let tracker = Arc::clone(tracker);
            let outputs = Arc::clone(outputs);
            let cancel = cancel.clone();
            let backoff = self.backoff.clone();
            let body = bodies.get(id).cloned().unwrap_or_else(noop_body);
            let workflow_id = spec.id.clone();
            let task_id = id.to_string();
            let payload = task_spec.payload.clone();
            let retries = task_spec.retries;
            let timeout_ms = task_spec.timeout_ms;
            async move {
                let result = run_attempts(
                    &tracker,
                    &task_id,
                    &workflow_id,
                    payload,
                    inputs,
                    body,
                    retries,
                    timeout_ms,
                    &backoff,
                    &cancel,
                    &outputs,
                )
                .await;
                let _ = done_tx.send(());
                result
            }
            .boxed()
        };

        let lane_task = LaneTask {
            workflow_id: spec.id.clone(),
            task_id: id.to_string(),
            lane: task_spec.lane.clone(),
            priority: task_spec.priority,
            run,
        };

        match self.manager.submit(lane_task, cancel).await {
            Ok(()) => (id.to_string(), Some(done_rx)),
            Err(error) if error.is_cancellation() => {
                debug!(task = id, %error, "admission cancelled");
                cancel_task(tracker, id, CancellationReason::User, error.to_string());
                (id.to_string(), None)
            }
            Err(error) => {
                // Admission failure is a deterministic task failure
                let reason = Error::LaneSubmit(error.to_string());
                let _ = tracker.transition_task(
                    id,
                    TaskState::Failed,
                    TransitionCtx::failed(reason.to_string()),
                );
                (id.to_string(), None)
            }
        }
    }

    fn skip_layer(
        &self,
        tracker: &Arc<StateTracker>,
        layer: &[TaskId],
        reason: Option<CancellationReason>,
        message: &str,
    ) {
        for id in layer {
            let ctx = TransitionCtx {
                error: Some(message.to_string()),
                reason,
                output: None,
            };
            let _ = tracker.transition_task(id, TaskState::Cancelled, ctx);
        }
    }
}

/// Cancel a task from whatever non-terminal state it is in
fn cancel_task(
    tracker: &Arc<StateTracker>,
    id: &str,
    reason: CancellationReason,
    message: impl Into<String>,
) {
    let _ = tracker.transition_task(
        id,
        TaskState::Cancelled,
        TransitionCtx::cancelled(reason, message),
    );
}

/// Run a task body through its retry budget, transitioning state around
/// every attempt
#[allow(clippy::too_many_arguments)]
async fn run_attempts(
    tracker: &Arc<StateTracker>,
    task_id: &str,
    workflow_id: &str,
    payload: serde_json::Value,
    inputs: HashMap<TaskId, serde_json::Value>,
    body: TaskBody,
    retries: u32,
    timeout_ms: u64,
    backoff: &BackoffPolicy,
    cancel: &CancellationToken,
    outputs: &Arc<DashMap<TaskId, serde_json::Value>>,
) -> Result<()> {
    let mut attempt: u32 = 0;
    loop {
        tracker.transition_task(task_id, TaskState::Running, TransitionCtx::default())?;

        let ctx = TaskContext {
            workflow_id: workflow_id.to_string(),
            task_id: task_id.to_string(),
            payload: payload.clone(),
            inputs: inputs.clone(),
            cancel: cancel.clone(),
        };
        let fut = body(ctx);

        // None means the per-task deadline expired
        let outcome: Option<Result<serde_json::Value>> = if timeout_ms > 0 {
            tokio::select! {
                res = tokio::time::timeout(Duration::from_millis(timeout_ms), fut) => {
                    match res {
                        Ok(inner) => Some(inner),
                        Err(_) => None,
                    }
                }
                () = cancel.cancelled() => {
                    cancel_task(tracker, task_id, CancellationReason::User, "cancelled");
                    return Err(Error::Cancelled(CancellationReason::User));
                }
            }
        } else {
            tokio::select! {
                res = fut => Some(res),
                () = cancel.cancelled() => {
                    cancel_task(tracker, task_id, CancellationReason::User, "cancelled");
                    return Err(Error::Cancelled(CancellationReason::User));
                }
            }
        };

        match outcome {
            None => {
                cancel_task(
                    tracker,
                    task_id,
                    CancellationReason::Timeout,
                    "deadline exceeded",
                );
                return Err(Error::Cancelled(CancellationReason::Timeout));
            }
            Some(Ok(output)) => {
                outputs.insert(task_id.to_string(), output.clone());
                tracker.transition_task(
                    task_id,
                    TaskState::Completed,
                    TransitionCtx::completed(output),
                )?;
                return Ok(());
            }
            Some(Err(error)) if error.is_cancellation() => {
                let reason = match &error {
                    Error::Cancelled(reason) => *reason,
                    _ => CancellationReason::User,
                };
                cancel_task(tracker, task_id, reason, error.to_string());
                return Err(error);
            }
            Some(Err(error)) => {
                if attempt < retries {
                    attempt += 1;
                    tracker.transition_task(
                        task_id,
                        TaskState::Retrying,
                        TransitionCtx::failed(error.to_string()),
                    )?;
                    tracker.transition_task(
                        task_id,
                        TaskState::Scheduled,
                        TransitionCtx::default(),
                    )?;
                    let delay = backoff.delay(attempt);
                    debug!(task = task_id, attempt, ?delay, "retrying after failure");
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = cancel.cancelled() => {
                            cancel_task(
                                tracker,
                                task_id,
                                CancellationReason::User,
                                "cancelled during retry backoff",
                            );
                            return Err(Error::Cancelled(CancellationReason::User));
                        }
                    }
                } else {
                    tracker.transition_task(
                        task_id,
                        TaskState::Failed,
                        TransitionCtx::failed(error.to_string()),
                    )?;
                    return Err(error);
                }
            }
        }
    }
}
