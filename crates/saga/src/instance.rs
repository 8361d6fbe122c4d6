//! Saga instances and WAL entries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Saga lifecycle states; terminal states never transition again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaState {
    Created,
    Running,
    Completed,
    Compensating,
    Compensated,
    CompensationFailed,
}

impl SagaState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Compensated | Self::CompensationFailed
        )
    }
}

/// The persisted face of a saga; the checkpoint record is this struct
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaInstance {
    pub saga_id: String,
    pub definition_id: String,
    pub state: SagaState,
    /// Steps whose completion was recorded, in completion order
    pub completed_steps: Vec<String>,
    pub failed_step: Option<String>,
    pub step_results: HashMap<String, serde_json::Value>,
    /// Last WAL sequence written for this saga
    pub last_sequence: u64,
    pub last_updated: DateTime<Utc>,
}

impl SagaInstance {
    pub fn new(saga_id: impl Into<String>, definition_id: impl Into<String>) -> Self {
        Self {
            saga_id: saga_id.into(),
            definition_id: definition_id.into(),
            state: SagaState::Created,
            completed_steps: Vec::new(),
            failed_step: None,
            step_results: HashMap::new(),
            last_sequence: 0,
            last_updated: Utc::now(),
        }
    }
}

/// WAL record types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalEntryType {
    StepStarted,
    StepCompleted,
    StepFailed,
    CompensationStarted,
    CompensationCompleted,
    CompensationFailed,
}

/// One write-ahead log record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    pub saga_id: String,
    pub step_id: String,
    pub entry_type: WalEntryType,
    #[serde(default)]
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub sequence: u64,
}
