//! Lifecycle event envelope
//!
//! The versioned wire shape carrying one state transition from the runtime
//! to stream subscribers and the cluster bus. Consumers must tolerate
//! unknown fields and deduplicate by `event_id`; `(workflow_id, sequence)`
//! is strictly increasing per workflow.

use chrono::{DateTime, Utc};
use flowlane_common::types::{NodeId, TaskId, TaskState, WorkflowId, WorkflowState};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current envelope schema version
pub const SCHEMA_VERSION: u32 = 1;

/// Closed set of lifecycle event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "workflow.pending")]
    WorkflowPending,
    #[serde(rename = "workflow.scheduled")]
    WorkflowScheduled,
    #[serde(rename = "workflow.running")]
    WorkflowRunning,
    #[serde(rename = "workflow.completed")]
    WorkflowCompleted,
    #[serde(rename = "workflow.failed")]
    WorkflowFailed,
    #[serde(rename = "workflow.cancelled")]
    WorkflowCancelled,
    #[serde(rename = "task.pending")]
    TaskPending,
    #[serde(rename = "task.scheduled")]
    TaskScheduled,
    #[serde(rename = "task.running")]
    TaskRunning,
    #[serde(rename = "task.completed")]
    TaskCompleted,
    #[serde(rename = "task.failed")]
    TaskFailed,
    #[serde(rename = "task.cancelled")]
    TaskCancelled,
    #[serde(rename = "task.retrying")]
    TaskRetrying,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorkflowPending => "workflow.pending",
            Self::WorkflowScheduled => "workflow.scheduled",
            Self::WorkflowRunning => "workflow.running",
            Self::WorkflowCompleted => "workflow.completed",
            Self::WorkflowFailed => "workflow.failed",
            Self::WorkflowCancelled => "workflow.cancelled",
            Self::TaskPending => "task.pending",
            Self::TaskScheduled => "task.scheduled",
            Self::TaskRunning => "task.running",
            Self::TaskCompleted => "task.completed",
            Self::TaskFailed => "task.failed",
            Self::TaskCancelled => "task.cancelled",
            Self::TaskRetrying => "task.retrying",
        }
    }

    /// Event type announcing a task entering `state`
    pub fn for_task(state: TaskState) -> Self {
        match state {
            TaskState::Pending => Self::TaskPending,
            TaskState::Scheduled => Self::TaskScheduled,
            TaskState::Running => Self::TaskRunning,
            TaskState::Completed => Self::TaskCompleted,
            TaskState::Failed => Self::TaskFailed,
            TaskState::Cancelled => Self::TaskCancelled,
            TaskState::Retrying => Self::TaskRetrying,
        }
    }

    /// Event type announcing a workflow entering `state`
    pub fn for_workflow(state: WorkflowState) -> Self {
        match state {
            WorkflowState::Pending => Self::WorkflowPending,
            WorkflowState::Scheduled => Self::WorkflowScheduled,
            WorkflowState::Running => Self::WorkflowRunning,
            WorkflowState::Completed => Self::WorkflowCompleted,
            WorkflowState::Failed => Self::WorkflowFailed,
            WorkflowState::Cancelled => Self::WorkflowCancelled,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::WorkflowCompleted
                | Self::WorkflowFailed
                | Self::WorkflowCancelled
                | Self::TaskCompleted
                | Self::TaskFailed
                | Self::TaskCancelled
        )
    }
}

/// Versioned lifecycle event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub workflow_id: WorkflowId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    pub timestamp: DateTime<Utc>,
    pub node_id: NodeId,
    pub schema_version: u32,
    /// Per-workflow monotonic sequence, starting at 1
    pub sequence: u64,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    pub fn new(
        event_type: EventType,
        workflow_id: impl Into<String>,
        task_id: Option<TaskId>,
        node_id: impl Into<String>,
        sequence: u64,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            workflow_id: workflow_id.into(),
            task_id,
            timestamp: Utc::now(),
            node_id: node_id.into(),
            schema_version: SCHEMA_VERSION,
            sequence,
            payload,
        }
    }
}
