//! Error types for the Flowlane runtime

use crate::types::CancellationReason;
use thiserror::Error;

/// Main error type for the runtime
#[derive(Error, Debug)]
pub enum Error {
    /// A workflow declared the same task id twice
    #[error("duplicate task id: {0}")]
    DuplicateTaskId(String),

    /// A task declared a dependency on an id that does not exist in the workflow
    #[error("task {task} depends on unknown task {dependency}")]
    DependencyNotFound { task: String, dependency: String },

    /// Direct lookup of a task id failed
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// Direct lookup of a workflow id failed
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    /// The dependency graph contains a cycle
    #[error("cyclic dependency among tasks: {0}")]
    CyclicDependency(String),

    /// The state machine guard rejected a transition; state is unchanged
    #[error("illegal transition from {from} to {to}")]
    IllegalTransition { from: String, to: String },

    /// Drop-policy rejection on a full lane
    #[error("lane {0} is full")]
    LaneFull(String),

    /// The lane stopped accepting work
    #[error("lane {0} is closed")]
    LaneClosed(String),

    /// Any other lane admission failure
    #[error("lane admission failed: {0}")]
    LaneSubmit(String),

    /// The lane manager has been closed
    #[error("lane manager is closed")]
    ManagerClosed,

    /// The engine is not in the running state
    #[error("engine is not running")]
    NotRunning,

    /// Context cancellation or deadline expiry
    #[error("cancelled ({0})")]
    Cancelled(CancellationReason),

    /// A signal was routed while task ownership moved to another node
    #[error("ownership of task {task} changed to node {owner}")]
    OwnershipChanged { task: String, owner: String },

    /// All compensation retries were exhausted
    #[error("compensation failed for saga {0}")]
    CompensationFailed(String),

    /// Write-ahead log or checkpoint durability error
    #[error("write-ahead log error: {0}")]
    WalIo(String),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Metrics registration errors
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// IO errors
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors
    #[error("internal error: {0}")]
    Internal(String),

    /// Unknown errors
    #[error("unknown error: {0}")]
    Unknown(#[from] anyhow::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Check if the operation may succeed when repeated
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::LaneFull(_) | Error::Io(_))
    }

    /// Whether the error represents a cancellation rather than a failure
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            Error::Cancelled(_) | Error::LaneClosed(_) | Error::ManagerClosed
        )
    }

    /// Get error severity for metrics and alerting
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Error::Config(_) | Error::WalIo(_) | Error::CompensationFailed(_) => {
                ErrorSeverity::Critical
            }
            Error::CyclicDependency(_)
            | Error::DuplicateTaskId(_)
            | Error::DependencyNotFound { .. }
            | Error::LaneSubmit(_) => ErrorSeverity::High,
            Error::LaneFull(_) | Error::LaneClosed(_) | Error::ManagerClosed | Error::NotRunning => {
                ErrorSeverity::Medium
            }
            Error::Cancelled(_) | Error::IllegalTransition { .. } => ErrorSeverity::Low,
            _ => ErrorSeverity::Medium,
        }
    }
}

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}
