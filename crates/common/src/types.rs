//! Common types used across the runtime

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Workflow ID type
pub type WorkflowId = String;

/// Task ID type, unique within a workflow
pub type TaskId = String;

/// Cluster node ID type
pub type NodeId = String;

/// Generic string metadata
pub type Metadata = HashMap<String, String>;

/// Name of the lane tasks are routed to when they do not name one
pub const DEFAULT_LANE: &str = "default";

/// Task lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Scheduled,
    Running,
    Completed,
    Failed,
    Cancelled,
    Retrying,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Retrying => "retrying",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Workflow lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Pending,
    Scheduled,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Why a task or workflow ended up cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancellationReason {
    User,
    Timeout,
}

impl CancellationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for CancellationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task definition within a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: TaskId,
    pub name: String,
    /// Lane the task is routed to; empty routes to `DEFAULT_LANE`
    #[serde(default)]
    pub lane: String,
    /// Higher priority dequeues first on priority-enabled lanes
    #[serde(default)]
    pub priority: i32,
    /// Ids of tasks that must reach terminal success before this one runs
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    /// Per-task deadline in milliseconds; 0 means unbounded
    #[serde(default)]
    pub timeout_ms: u64,
    /// Additional attempts after the first failure
    #[serde(default)]
    pub retries: u32,
    /// Opaque payload handed to the task body
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl TaskSpec {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            lane: String::new(),
            priority: 0,
            dependencies: Vec::new(),
            timeout_ms: 0,
            retries: 0,
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_lane(mut self, lane: impl Into<String>) -> Self {
        self.lane = lane.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.dependencies.push(id.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub id: WorkflowId,
    pub name: String,
    pub tasks: Vec<TaskSpec>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl WorkflowSpec {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            tasks: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_task(mut self, task: TaskSpec) -> Self {
        self.tasks.push(task);
        self
    }

    /// Direct lookup by task id
    pub fn task(&self, id: &str) -> Result<&TaskSpec> {
        self.tasks
            .iter()
            .find(|t| t.id == id)
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))
    }
}

/// Per-task outcome record, frozen once terminal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub state: TaskState,
    pub error: Option<String>,
    pub cancellation_reason: Option<CancellationReason>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub retries_used: u32,
    pub output: Option<serde_json::Value>,
}

impl TaskResult {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            state: TaskState::Pending,
            error: None,
            cancellation_reason: None,
            started_at: None,
            ended_at: None,
            retries_used: 0,
            output: None,
        }
    }
}

/// Workflow outcome record, frozen at the terminal transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub workflow_id: WorkflowId,
    pub status: WorkflowState,
    pub task_results: HashMap<TaskId, TaskResult>,
    pub error: Option<String>,
}

/// Policy applied when a lane is at capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackpressurePolicy {
    Block,
    Drop,
    Redirect,
}

/// Lane configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaneConfig {
    pub name: String,
    /// Maximum number of queued tasks
    pub capacity: usize,
    /// Worker pool size
    pub max_concurrency: usize,
    pub backpressure: BackpressurePolicy,
    /// Target lane for the redirect policy
    #[serde(default)]
    pub redirect_target: Option<String>,
    /// Dequeues per second; 0 disables rate limiting
    #[serde(default)]
    pub rate_limit: u32,
    /// Token bucket burst; defaults to capacity / 8, minimum 1
    #[serde(default)]
    pub burst: Option<u32>,
    #[serde(default)]
    pub priority_enabled: bool,
}

impl Default for LaneConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_LANE.to_string(),
            capacity: 256,
            max_concurrency: 8,
            backpressure: BackpressurePolicy::Block,
            redirect_target: None,
            rate_limit: 0,
            burst: None,
            priority_enabled: false,
        }
    }
}

impl LaneConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Config("lane name must not be empty".to_string()));
        }
        if self.capacity == 0 {
            return Err(Error::Config(format!(
                "lane {}: capacity must be greater than 0",
                self.name
            )));
        }
        if self.max_concurrency == 0 {
            return Err(Error::Config(format!(
                "lane {}: max_concurrency must be greater than 0",
                self.name
            )));
        }
        if self.backpressure == BackpressurePolicy::Redirect && self.redirect_target.is_none() {
            return Err(Error::Config(format!(
                "lane {}: redirect policy requires redirect_target",
                self.name
            )));
        }
        Ok(())
    }

    /// Effective token bucket burst
    pub fn effective_burst(&self) -> u32 {
        self.burst
            .unwrap_or_else(|| (self.capacity / 8).max(1) as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_lookup_reports_unknown_id() {
        let wf = WorkflowSpec::new("wf").with_task(TaskSpec::new("a"));
        assert!(wf.task("a").is_ok());
        assert!(matches!(wf.task("b"), Err(Error::TaskNotFound(id)) if id == "b"));
    }

    #[test]
    fn redirect_requires_target() {
        let mut cfg = LaneConfig::new("edge");
        cfg.backpressure = BackpressurePolicy::Redirect;
        assert!(cfg.validate().is_err());
        cfg.redirect_target = Some("overflow".to_string());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn burst_defaults_to_capacity_fraction() {
        let cfg = LaneConfig {
            capacity: 64,
            ..LaneConfig::default()
        };
        assert_eq!(cfg.effective_burst(), 8);
        let tiny = LaneConfig {
            capacity: 2,
            ..LaneConfig::default()
        };
        assert_eq!(tiny.effective_burst(), 1);
    }
}
