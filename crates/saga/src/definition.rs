//! Saga definitions
//!
//! A saga is a DAG of steps. Each step carries an action, an optional
//! compensation, and a policy deciding how the backward pass treats it.

use flowlane_common::error::Result;
use flowlane_common::types::{TaskSpec, WorkflowSpec};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// How the backward pass treats a completed step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationPolicy {
    /// Compensate automatically when the saga rolls back
    Auto,
    /// Pause the backward pass until an operator confirms
    Manual,
    /// Never compensate this step
    Skip,
}

/// Context handed to actions and compensations
pub struct StepContext {
    pub saga_id: String,
    pub step_id: String,
    /// Results of completed upstream steps, keyed by step id
    pub inputs: HashMap<String, serde_json::Value>,
}

/// Step action or compensation closure
pub type StepAction =
    Arc<dyn Fn(StepContext) -> BoxFuture<'static, Result<serde_json::Value>> + Send + Sync>;

/// One step of a saga
#[derive(Clone)]
pub struct SagaStep {
    pub id: String,
    pub name: String,
    pub dependencies: Vec<String>,
    pub action: StepAction,
    pub compensation: Option<StepAction>,
    pub policy: CompensationPolicy,
    /// Compensation retry ceiling; falls back to the saga configuration
    pub max_retries: Option<u32>,
}

impl SagaStep {
    pub fn new(id: impl Into<String>, action: StepAction) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            dependencies: Vec::new(),
            action,
            compensation: None,
            policy: CompensationPolicy::Auto,
            max_retries: None,
        }
    }

    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.dependencies.push(id.into());
        self
    }

    pub fn with_compensation(mut self, compensation: StepAction) -> Self {
        self.compensation = Some(compensation);
        self
    }

    pub fn with_policy(mut self, policy: CompensationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// A registered saga definition
#[derive(Clone)]
pub struct SagaDefinition {
    pub id: String,
    pub name: String,
    pub steps: Vec<SagaStep>,
}

impl SagaDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            steps: Vec::new(),
        }
    }

    pub fn with_step(mut self, step: SagaStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn step(&self, id: &str) -> Option<&SagaStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Project the step DAG into a workflow for the execution pipeline
    pub fn to_workflow_spec(&self, workflow_id: &str) -> WorkflowSpec {
        let mut spec = WorkflowSpec::new(workflow_id);
        spec.name = self.name.clone();
        for step in &self.steps {
            let mut task = TaskSpec::new(step.id.clone());
            task.name = step.name.clone();
            task.dependencies = step.dependencies.clone();
            spec.tasks.push(task);
        }
        spec
    }
}
