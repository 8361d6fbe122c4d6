//! Per-workflow state tracking and transition hooks
//!
//! One tracker exists per workflow execution. All transitions are guarded
//! by the state machine tables and serialized by the workflow lock; hooks
//! run synchronously in registration order under that lock, so every
//! subscriber observes the same total order of transitions. Hooks must not
//! block; subscribers that need to do heavy work hand off to their own
//! channels.

use chrono::{DateTime, Utc};
use flowlane_common::error::{Error, Result};
use flowlane_common::types::{
    CancellationReason, TaskId, TaskResult, TaskState, WorkflowId, WorkflowResult, WorkflowState,
};
use flowlane_core::state::{guard_task_transition, guard_workflow_transition};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// What changed in a single transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionKind {
    Task { from: TaskState, to: TaskState },
    Workflow { from: WorkflowState, to: WorkflowState },
}

/// One committed transition, as observed by hooks
#[derive(Debug, Clone)]
pub struct TransitionEvent {
    pub workflow_id: WorkflowId,
    pub task_id: Option<TaskId>,
    pub kind: TransitionKind,
    /// Per-workflow monotonic sequence shared by task and workflow
    /// transitions, starting at 1
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<CancellationReason>,
    pub error: Option<String>,
    /// Wall time to terminal, present on terminal transitions
    pub duration: Option<Duration>,
}

/// Optional context attached to a transition
#[derive(Debug, Clone, Default)]
pub struct TransitionCtx {
    pub error: Option<String>,
    pub reason: Option<CancellationReason>,
    pub output: Option<serde_json::Value>,
}

impl TransitionCtx {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn cancelled(reason: CancellationReason, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            reason: Some(reason),
            ..Self::default()
        }
    }

    pub fn completed(output: serde_json::Value) -> Self {
        Self {
            output: Some(output),
            ..Self::default()
        }
    }
}

/// Synchronous transition subscriber
pub type TransitionHook = Box<dyn Fn(&TransitionEvent) + Send + Sync>;

struct TrackerInner {
    status: WorkflowState,
    tasks: HashMap<TaskId, TaskResult>,
    sequence: u64,
    hooks: Vec<TransitionHook>,
    created_at: DateTime<Utc>,
    workflow_error: Option<String>,
}

/// Per-workflow state store with ordered transition hooks
pub struct StateTracker {
    workflow_id: WorkflowId,
    inner: Mutex<TrackerInner>,
}

impl StateTracker {
    pub fn new(workflow_id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            workflow_id: workflow_id.into(),
            inner: Mutex::new(TrackerInner {
                status: WorkflowState::Pending,
                tasks: HashMap::new(),
                sequence: 0,
                hooks: Vec::new(),
                created_at: Utc::now(),
                workflow_error: None,
            }),
        })
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// Register a hook; hooks fire in registration order
    pub fn subscribe(&self, hook: TransitionHook) {
        self.inner.lock().hooks.push(hook);
    }

    /// Initialize every task as pending and announce the pending states.
    /// The workflow's pending event takes sequence 1.
    pub fn init_tasks(&self, ids: &[TaskId]) {
        let mut inner = self.inner.lock();
        for id in ids {
            inner.tasks.insert(id.clone(), TaskResult::new(id.clone()));
        }
        self.emit(
            &mut inner,
            None,
            TransitionKind::Workflow {
                from: WorkflowState::Pending,
                to: WorkflowState::Pending,
            },
            None,
            None,
            None,
        );
        for id in ids {
            self.emit(
                &mut inner,
                Some(id.clone()),
                TransitionKind::Task {
                    from: TaskState::Pending,
                    to: TaskState::Pending,
                },
                None,
                None,
                None,
            );
        }
    }

    /// Transition one task; illegal transitions are rejected without any
    /// mutation. Returns the event sequence on success.
    pub fn transition_task(&self, task_id: &str, to: TaskState, ctx: TransitionCtx) -> Result<u64> {
        let mut inner = self.inner.lock();
        let task = inner
            .tasks
            .get(task_id)
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))?;
        let from = task.state;
        guard_task_transition(from, to)?;

        let now = Utc::now();
        let task = inner
            .tasks
            .get_mut(task_id)
            .expect("task id checked above");
        task.state = to;
        match to {
            TaskState::Running => {
                if task.started_at.is_none() {
                    task.started_at = Some(now);
                }
            }
            TaskState::Retrying => {
                task.retries_used += 1;
                task.error = ctx.error.clone();
            }
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled => {
                task.ended_at = Some(now);
                task.error = ctx.error.clone();
                task.cancellation_reason = ctx.reason;
                task.output = ctx.output.clone();
            }
            TaskState::Pending | TaskState::Scheduled => {}
        }
        let duration = match (to.is_terminal(), task.started_at, task.ended_at) {
            (true, Some(start), Some(end)) => {
                Some((end - start).to_std().unwrap_or_default())
            }
            (true, _, _) => Some(Duration::ZERO),
            _ => None,
        };

        let sequence = self.emit(
            &mut inner,
            Some(task_id.to_string()),
            TransitionKind::Task { from, to },
            ctx.reason,
            ctx.error,
            duration,
        );
        Ok(sequence)
    }

    /// Transition the workflow itself
    pub fn transition_workflow(
        &self,
        to: WorkflowState,
        ctx: TransitionCtx,
    ) -> Result<u64> {
        let mut inner = self.inner.lock();
        let from = inner.status;
        guard_workflow_transition(from, to)?;
        inner.status = to;
        if to.is_terminal() {
            inner.workflow_error = ctx.error.clone();
        }
        let duration = if to.is_terminal() {
            Some(
                (Utc::now() - inner.created_at)
                    .to_std()
                    .unwrap_or_default(),
            )
        } else {
            None
        };
        let sequence = self.emit(
            &mut inner,
            None,
            TransitionKind::Workflow { from, to },
            ctx.reason,
            ctx.error,
            duration,
        );
        Ok(sequence)
    }

    fn emit(
        &self,
        inner: &mut TrackerInner,
        task_id: Option<TaskId>,
        kind: TransitionKind,
        reason: Option<CancellationReason>,
        error: Option<String>,
        duration: Option<Duration>,
    ) -> u64 {
        inner.sequence += 1;
        let event = TransitionEvent {
            workflow_id: self.workflow_id.clone(),
            task_id,
            kind,
            sequence: inner.sequence,
            timestamp: Utc::now(),
            reason,
            error,
            duration,
        };
        for hook in &inner.hooks {
            hook(&event);
        }
        inner.sequence
    }

    pub fn status(&self) -> WorkflowState {
        self.inner.lock().status
    }

    pub fn task_state(&self, task_id: &str) -> Option<TaskState> {
        self.inner.lock().tasks.get(task_id).map(|t| t.state)
    }

    /// Terminal workflow status implied by the task outcomes: any failure
    /// dominates, then cancellation, else completion
    pub fn implied_terminal_status(&self) -> WorkflowState {
        let inner = self.inner.lock();
        let mut cancelled = false;
        for task in inner.tasks.values() {
            match task.state {
                TaskState::Failed => return WorkflowState::Failed,
                TaskState::Cancelled => cancelled = true,
                _ => {}
            }
        }
        if cancelled {
            WorkflowState::Cancelled
        } else {
            WorkflowState::Completed
        }
    }

    /// Cancellation reason implied by the task outcomes: user cancellation
    /// dominates, a pure deadline expiry reports as timeout
    pub fn implied_cancellation_reason(&self) -> CancellationReason {
        let inner = self.inner.lock();
        let mut timeout_seen = false;
        for task in inner.tasks.values() {
            match task.cancellation_reason {
                Some(CancellationReason::User) => return CancellationReason::User,
                Some(CancellationReason::Timeout) => timeout_seen = true,
                None => {}
            }
        }
        if timeout_seen {
            CancellationReason::Timeout
        } else {
            CancellationReason::User
        }
    }

    /// First recorded task failure message, if any
    pub fn first_failure(&self) -> Option<String> {
        let inner = self.inner.lock();
        let mut failures: Vec<&TaskResult> = inner
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Failed)
            .collect();
        failures.sort_by(|a, b| a.ended_at.cmp(&b.ended_at));
        failures.first().and_then(|t| t.error.clone())
    }

    /// Consistent copy of the workflow state
    pub fn snapshot(&self) -> WorkflowResult {
        let inner = self.inner.lock();
        WorkflowResult {
            workflow_id: self.workflow_id.clone(),
            status: inner.status,
            task_results: inner.tasks.clone(),
            error: inner.workflow_error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker_with_tasks(ids: &[&str]) -> Arc<StateTracker> {
        let tracker = StateTracker::new("wf");
        let ids: Vec<TaskId> = ids.iter().map(|s| (*s).to_string()).collect();
        tracker.init_tasks(&ids);
        tracker
    }

    #[test]
    fn sequences_are_strictly_increasing_from_one() {
        let tracker = StateTracker::new("wf");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        tracker.subscribe(Box::new(move |ev| sink.lock().push(ev.sequence)));

        tracker.init_tasks(&["a".to_string(), "b".to_string()]);
        tracker
            .transition_task("a", TaskState::Scheduled, TransitionCtx::default())
            .unwrap();
        tracker
            .transition_task("b", TaskState::Scheduled, TransitionCtx::default())
            .unwrap();

        let seen = seen.lock();
        assert_eq!(*seen, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn hooks_fire_in_registration_order() {
        let tracker = tracker_with_tasks(&["a"]);
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let sink = Arc::clone(&order);
            tracker.subscribe(Box::new(move |_| sink.lock().push(tag)));
        }
        tracker
            .transition_task("a", TaskState::Scheduled, TransitionCtx::default())
            .unwrap();
        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn illegal_transition_does_not_mutate() {
        let tracker = tracker_with_tasks(&["a"]);
        let err = tracker
            .transition_task("a", TaskState::Completed, TransitionCtx::default())
            .unwrap_err();
        assert!(matches!(err, Error::IllegalTransition { .. }));
        assert_eq!(tracker.task_state("a"), Some(TaskState::Pending));
    }

    #[test]
    fn second_terminal_transition_is_rejected() {
        let tracker = tracker_with_tasks(&["a"]);
        let count = Arc::new(Mutex::new(0u32));
        let sink = Arc::clone(&count);
        tracker.subscribe(Box::new(move |ev| {
            if let TransitionKind::Task { to, .. } = ev.kind {
                if to.is_terminal() {
                    *sink.lock() += 1;
                }
            }
        }));

        tracker
            .transition_task("a", TaskState::Scheduled, TransitionCtx::default())
            .unwrap();
        tracker
            .transition_task("a", TaskState::Running, TransitionCtx::default())
            .unwrap();
        tracker
            .transition_task("a", TaskState::Completed, TransitionCtx::default())
            .unwrap();
        assert!(tracker
            .transition_task("a", TaskState::Failed, TransitionCtx::failed("late"))
            .is_err());

        // Exactly one terminal callback fired
        assert_eq!(*count.lock(), 1);
        assert_eq!(tracker.task_state("a"), Some(TaskState::Completed));
    }

    #[test]
    fn retrying_increments_retry_counter() {
        let tracker = tracker_with_tasks(&["a"]);
        for to in [TaskState::Scheduled, TaskState::Running, TaskState::Retrying] {
            tracker
                .transition_task("a", to, TransitionCtx::default())
                .unwrap();
        }
        for to in [TaskState::Scheduled, TaskState::Running, TaskState::Retrying] {
            tracker
                .transition_task("a", to, TransitionCtx::default())
                .unwrap();
        }
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.task_results["a"].retries_used, 2);
    }

    #[test]
    fn cancellation_is_recorded_with_reason() {
        let tracker = tracker_with_tasks(&["a"]);
        tracker
            .transition_task("a", TaskState::Scheduled, TransitionCtx::default())
            .unwrap();
        tracker
            .transition_task(
                "a",
                TaskState::Cancelled,
                TransitionCtx::cancelled(CancellationReason::Timeout, "deadline exceeded"),
            )
            .unwrap();
        let snapshot = tracker.snapshot();
        let task = &snapshot.task_results["a"];
        assert_eq!(task.state, TaskState::Cancelled);
        assert_eq!(task.cancellation_reason, Some(CancellationReason::Timeout));
    }

    #[test]
    fn failure_dominates_cancellation_in_implied_status() {
        let tracker = tracker_with_tasks(&["a", "b", "c"]);
        for (id, to) in [("a", TaskState::Scheduled), ("b", TaskState::Scheduled)] {
            tracker.transition_task(id, to, TransitionCtx::default()).unwrap();
        }
        tracker
            .transition_task("a", TaskState::Running, TransitionCtx::default())
            .unwrap();
        tracker
            .transition_task("a", TaskState::Failed, TransitionCtx::failed("boom"))
            .unwrap();
        tracker
            .transition_task(
                "b",
                TaskState::Cancelled,
                TransitionCtx::cancelled(CancellationReason::User, "skipped"),
            )
            .unwrap();
        tracker
            .transition_task(
                "c",
                TaskState::Cancelled,
                TransitionCtx::cancelled(CancellationReason::User, "skipped"),
            )
            .unwrap();
        assert_eq!(tracker.implied_terminal_status(), WorkflowState::Failed);
    }

    #[test]
    fn all_completed_implies_completed() {
        let tracker = tracker_with_tasks(&["a"]);
        for to in [TaskState::Scheduled, TaskState::Running, TaskState::Completed] {
            tracker
                .transition_task("a", to, TransitionCtx::default())
                .unwrap();
        }
        assert_eq!(tracker.implied_terminal_status(), WorkflowState::Completed);
    }
}
