//! Task and workflow state machines
//!
//! Transitions are one-way. The guard functions are the single source of
//! truth consulted before any state mutation; a rejected transition must
//! leave the caller's state untouched.

use flowlane_common::error::{Error, Result};
use flowlane_common::types::{TaskState, WorkflowState};

/// Whether a task may move from `from` to `to`
pub fn task_transition_allowed(from: TaskState, to: TaskState) -> bool {
    use TaskState::{Cancelled, Completed, Failed, Pending, Retrying, Running, Scheduled};
    matches!(
        (from, to),
        (Pending, Scheduled)
            | (Pending, Cancelled)
            | (Scheduled, Running)
            | (Scheduled, Cancelled)
            | (Running, Completed)
            | (Running, Failed)
            | (Running, Cancelled)
            | (Running, Retrying)
            | (Retrying, Scheduled)
            | (Retrying, Cancelled)
    )
}

/// Whether a workflow may move from `from` to `to`
pub fn workflow_transition_allowed(from: WorkflowState, to: WorkflowState) -> bool {
    use WorkflowState::{Cancelled, Completed, Failed, Pending, Running, Scheduled};
    matches!(
        (from, to),
        (Pending, Scheduled)
            | (Pending, Cancelled)
            | (Scheduled, Running)
            | (Scheduled, Cancelled)
            | (Running, Completed)
            | (Running, Failed)
            | (Running, Cancelled)
    )
}

/// Guard a task transition, rejecting illegal edges
pub fn guard_task_transition(from: TaskState, to: TaskState) -> Result<()> {
    if task_transition_allowed(from, to) {
        Ok(())
    } else {
        Err(Error::IllegalTransition {
            from: from.as_str().to_string(),
            to: to.as_str().to_string(),
        })
    }
}

/// Guard a workflow transition, rejecting illegal edges
pub fn guard_workflow_transition(from: WorkflowState, to: WorkflowState) -> Result<()> {
    if workflow_transition_allowed(from, to) {
        Ok(())
    } else {
        Err(Error::IllegalTransition {
            from: from.as_str().to_string(),
            to: to.as_str().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TaskState as T;
    use WorkflowState as W;

    #[test]
    fn task_happy_path() {
        assert!(task_transition_allowed(T::Pending, T::Scheduled));
        assert!(task_transition_allowed(T::Scheduled, T::Running));
        assert!(task_transition_allowed(T::Running, T::Completed));
    }

    #[test]
    fn task_retry_loop() {
        assert!(task_transition_allowed(T::Running, T::Retrying));
        assert!(task_transition_allowed(T::Retrying, T::Scheduled));
        assert!(!task_transition_allowed(T::Retrying, T::Running));
    }

    #[test]
    fn terminal_states_are_frozen() {
        for terminal in [T::Completed, T::Failed, T::Cancelled] {
            for next in [
                T::Pending,
                T::Scheduled,
                T::Running,
                T::Completed,
                T::Failed,
                T::Cancelled,
                T::Retrying,
            ] {
                assert!(
                    !task_transition_allowed(terminal, next),
                    "{terminal:?} -> {next:?} must be rejected"
                );
            }
        }
    }

    #[test]
    fn no_back_edges() {
        assert!(!task_transition_allowed(T::Running, T::Pending));
        assert!(!task_transition_allowed(T::Scheduled, T::Pending));
        assert!(!workflow_transition_allowed(W::Running, W::Scheduled));
    }

    #[test]
    fn workflow_early_cancellation() {
        assert!(workflow_transition_allowed(W::Pending, W::Cancelled));
        assert!(workflow_transition_allowed(W::Scheduled, W::Cancelled));
        assert!(!workflow_transition_allowed(W::Completed, W::Cancelled));
    }

    #[test]
    fn guard_reports_both_states() {
        let err = guard_task_transition(T::Completed, T::Running).unwrap_err();
        match err {
            Error::IllegalTransition { from, to } => {
                assert_eq!(from, "completed");
                assert_eq!(to, "running");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
