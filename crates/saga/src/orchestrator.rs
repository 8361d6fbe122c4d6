//! Saga orchestration
//!
//! The forward pass projects the step DAG into a workflow and runs it
//! through the engine's compile/schedule pipeline; every step body writes
//! `StepStarted` before its action and `StepCompleted`/`StepFailed` plus a
//! fresh checkpoint after it. A failure flips the saga into compensation:
//! completed steps roll back in reverse topological order with retries.
//!
//! A step that was in flight at failure time — `StepStarted` written but no
//! `StepCompleted` — is not compensated; the backward pass covers exactly
//! the steps whose completion was recorded.

use crate::definition::{CompensationPolicy, SagaDefinition, StepContext};
use crate::instance::{SagaInstance, SagaState, WalEntryType};
use crate::wal::SagaLog;
use dashmap::DashMap;
use flowlane_common::config::SagaConfig;
use flowlane_common::error::{Error, Result};
use flowlane_common::metrics::{MetricsSink, PrometheusSink};
use flowlane_common::types::WorkflowState;
use flowlane_core::compiler::compile;
use flowlane_core::store::StateStore;
use flowlane_engine::{BackoffPolicy, Engine, SubmitMode, TaskBodies, TaskBody, TaskContext};
use futures::FutureExt;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// What recovery found and did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Non-terminal sagas resumed forward
    pub resumed: usize,
    /// Sagas whose compensation pass was resumed
    pub compensated: usize,
    /// Checkpoints skipped for lack of a registered definition
    pub skipped: usize,
}

/// Orchestrates sagas over the execution pipeline
pub struct SagaOrchestrator {
    engine: Arc<Engine>,
    log: Arc<SagaLog>,
    definitions: DashMap<String, Arc<SagaDefinition>>,
    instances: DashMap<String, Arc<Mutex<SagaInstance>>>,
    config: SagaConfig,
    backoff: BackoffPolicy,
    metrics: Arc<dyn MetricsSink>,
    manual_confirmations: DashMap<String, Arc<Notify>>,
}

impl SagaOrchestrator {
    pub fn new(engine: Arc<Engine>, store: Arc<dyn StateStore>, config: SagaConfig) -> Arc<Self> {
        Self::with_metrics(engine, store, config, Arc::new(PrometheusSink))
    }

    pub fn with_metrics(
        engine: Arc<Engine>,
        store: Arc<dyn StateStore>,
        config: SagaConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            engine,
            log: Arc::new(SagaLog::new(store)),
            definitions: DashMap::new(),
            instances: DashMap::new(),
            config,
            backoff: BackoffPolicy::default().with_initial_backoff(50),
            metrics,
            manual_confirmations: DashMap::new(),
        })
    }

    /// Durability layer, shared with the retention sweeper
    pub fn log(&self) -> &Arc<SagaLog> {
        &self.log
    }

    pub fn register(&self, definition: SagaDefinition) {
        info!(definition_id = %definition.id, steps = definition.steps.len(), "registered saga definition");
        self.definitions
            .insert(definition.id.clone(), Arc::new(definition));
    }

    /// Current instance state
    pub async fn status(&self, saga_id: &str) -> Option<SagaInstance> {
        let entry = self.instances.get(saga_id).map(|e| Arc::clone(&e))?;
        let instance = entry.lock().await;
        Some(instance.clone())
    }

    /// Start a saga and drive it to a terminal or paused state
    #[instrument(skip(self))]
    pub async fn start(
        &self,
        definition_id: &str,
        saga_id: Option<String>,
    ) -> Result<SagaInstance> {
        let definition = self
            .definitions
            .get(definition_id)
            .map(|d| Arc::clone(&d))
            .ok_or_else(|| {
                Error::Internal(format!("unknown saga definition: {definition_id}"))
            })?;

        let saga_id = saga_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let instance = Arc::new(Mutex::new(SagaInstance::new(
            saga_id.clone(),
            definition_id.to_string(),
        )));
        self.instances.insert(saga_id.clone(), Arc::clone(&instance));
        {
            let mut locked = instance.lock().await;
            self.log.checkpoint(&mut locked).await?;
        }

        self.run_saga(instance, definition).await
    }

    /// Forward pass plus, on failure, the policy-gated backward pass
    async fn run_saga(
        &self,
        instance: Arc<Mutex<SagaInstance>>,
        definition: Arc<SagaDefinition>,
    ) -> Result<SagaInstance> {
        let saga_id = {
            let mut locked = instance.lock().await;
            locked.state = SagaState::Running;
            self.log.checkpoint(&mut locked).await?;
            locked.saga_id.clone()
        };

        let workflow_id = format!("saga-{saga_id}");
        let spec = definition.to_workflow_spec(&workflow_id);
        let mut bodies = TaskBodies::new();
        for step in &definition.steps {
            bodies.insert(step.id.clone(), self.wrap_step(step, &instance, &saga_id));
        }

        let outcome = self
            .engine
            .submit(spec, bodies, SubmitMode::Sync)
            .await?;
        let completed_forward = outcome.status == WorkflowState::Completed;

        if completed_forward {
            let mut locked = instance.lock().await;
            locked.state = SagaState::Completed;
            self.log.checkpoint(&mut locked).await?;
            info!(saga_id, "saga completed");
            return Ok(locked.clone());
        }

        let (failed_step, trigger_policy) = {
            let mut locked = instance.lock().await;
            locked.state = SagaState::Compensating;
            self.log.checkpoint(&mut locked).await?;
            let failed = locked.failed_step.clone();
            let policy = failed
                .as_deref()
                .and_then(|id| definition.step(id))
                .map_or(CompensationPolicy::Auto, |s| s.policy);
            (failed, policy)
        };
        warn!(saga_id, ?failed_step, "saga forward pass failed");

        if trigger_policy == CompensationPolicy::Auto {
            self.run_compensation(&instance, &definition).await?;
        }
        Ok(instance.lock().await.clone())
    }

    /// Wrap a step action with its WAL and checkpoint writes
    fn wrap_step(
        &self,
        step: &crate::definition::SagaStep,
        instance: &Arc<Mutex<SagaInstance>>,
        saga_id: &str,
    ) -> TaskBody {
        let log = Arc::clone(&self.log);
        let instance = Arc::clone(instance);
        let action = Arc::clone(&step.action);
        let step_id = step.id.clone();
        let saga_id = saga_id.to_string();

        Arc::new(move |ctx: TaskContext| {
            let log = Arc::clone(&log);
            let instance = Arc::clone(&instance);
            let action = Arc::clone(&action);
            let step_id = step_id.clone();
            let saga_id = saga_id.clone();
            async move {
                {
                    let mut locked = instance.lock().await;
                    // Recovery idempotence: a step the checkpoint already
                    // records is replayed from its stored result
                    if locked.completed_steps.contains(&step_id) {
                        return Ok(locked
                            .step_results
                            .get(&step_id)
                            .cloned()
                            .unwrap_or(serde_json::Value::Null));
                    }
                    log.append(&mut locked, &step_id, WalEntryType::StepStarted, json!(null))
                        .await?;
                }

                let result = action(StepContext {
                    saga_id,
                    step_id: step_id.clone(),
                    inputs: ctx.inputs,
                })
                .await;

                let mut locked = instance.lock().await;
                match result {
                    Ok(value) => {
                        log.append(
                            &mut locked,
                            &step_id,
                            WalEntryType::StepCompleted,
                            value.clone(),
                        )
                        .await?;
                        locked.completed_steps.push(step_id.clone());
                        locked.step_results.insert(step_id.clone(), value.clone());
                        log.checkpoint(&mut locked).await?;
                        Ok(value)
                    }
                    Err(err) => {
                        log.append(
                            &mut locked,
                            &step_id,
                            WalEntryType::StepFailed,
                            json!({ "error": err.to_string() }),
                        )
                        .await?;
                        locked.failed_step = Some(step_id.clone());
                        log.checkpoint(&mut locked).await?;
                        Err(err)
                    }
                }
            }
            .boxed()
        })
    }

    /// Resume or trigger the backward pass by hand, e.g. after a failed
    /// step whose policy is manual
    pub async fn compensate(&self, saga_id: &str) -> Result<SagaInstance> {
        let instance = self
            .instances
            .get(saga_id)
            .map(|e| Arc::clone(&e))
            .ok_or_else(|| Error::WorkflowNotFound(saga_id.to_string()))?;
        let definition_id = {
            let mut locked = instance.lock().await;
            if locked.state.is_terminal() {
                return Ok(locked.clone());
            }
            locked.state = SagaState::Compensating;
            self.log.checkpoint(&mut locked).await?;
            locked.definition_id.clone()
        };
        let definition = self
            .definitions
            .get(&definition_id)
            .map(|d| Arc::clone(&d))
            .ok_or_else(|| Error::Internal(format!("unknown saga definition: {definition_id}")))?;
        self.run_compensation(&instance, &definition).await?;
        let result = instance.lock().await.clone();
        Ok(result)
    }

    /// Unblock a manual-policy step waiting in the backward pass
    pub fn confirm_compensation(&self, saga_id: &str, step_id: &str) {
        let key = format!("{saga_id}/{step_id}");
        self.manual_confirmations
            .entry(key)
            .or_insert_with(|| Arc::new(Notify::new()))
            .notify_one();
    }

    /// Compensate completed steps in reverse topological order
    async fn run_compensation(
        &self,
        instance: &Arc<Mutex<SagaInstance>>,
        definition: &Arc<SagaDefinition>,
    ) -> Result<()> {
        let (saga_id, completed, inputs) = {
            let locked = instance.lock().await;
            (
                locked.saga_id.clone(),
                locked.completed_steps.iter().cloned().collect::<HashSet<_>>(),
                locked.step_results.clone(),
            )
        };

        // Skip steps a previous pass already rolled back
        let already_compensated: HashSet<String> = self
            .log
            .read_wal(&saga_id)
            .await?
            .into_iter()
            .filter(|e| e.entry_type == WalEntryType::CompensationCompleted)
            .map(|e| e.step_id)
            .collect();

        let plan = compile(&definition.to_workflow_spec(&saga_id))?;
        for step_id in plan.order.iter().rev() {
            if !completed.contains(step_id) || already_compensated.contains(step_id) {
                continue;
            }
            let step = definition
                .step(step_id)
                .ok_or_else(|| Error::TaskNotFound(step_id.clone()))?;
            match step.policy {
                CompensationPolicy::Skip => continue,
                CompensationPolicy::Manual => {
                    info!(saga_id, step = %step_id, "compensation paused for manual confirmation");
                    self.await_confirmation(&saga_id, step_id).await;
                }
                CompensationPolicy::Auto => {}
            }
            let Some(compensation) = step.compensation.clone() else {
                continue;
            };

            {
                let mut locked = instance.lock().await;
                self.log
                    .append(
                        &mut locked,
                        step_id,
                        WalEntryType::CompensationStarted,
                        json!(null),
                    )
                    .await?;
            }

            let max_retries = step.max_retries.unwrap_or(self.config.max_compensation_retries);
            let mut attempt: u32 = 0;
            loop {
                let result = compensation(StepContext {
                    saga_id: saga_id.clone(),
                    step_id: step_id.clone(),
                    inputs: inputs.clone(),
                })
                .await;
                match result {
                    Ok(_) => {
                        let mut locked = instance.lock().await;
                        self.log
                            .append(
                                &mut locked,
                                step_id,
                                WalEntryType::CompensationCompleted,
                                json!(null),
                            )
                            .await?;
                        self.log.checkpoint(&mut locked).await?;
                        break;
                    }
                    Err(err) if attempt < max_retries => {
                        attempt += 1;
                        warn!(
                            saga_id,
                            step = %step_id,
                            attempt,
                            %err,
                            "compensation attempt failed, retrying"
                        );
                        tokio::time::sleep(self.backoff.delay(attempt)).await;
                    }
                    Err(err) => {
                        // Exhausted: this is an operator-facing terminal state,
                        // never silently dropped
                        let mut locked = instance.lock().await;
                        self.log
                            .append(
                                &mut locked,
                                step_id,
                                WalEntryType::CompensationFailed,
                                json!({ "error": err.to_string() }),
                            )
                            .await?;
                        locked.state = SagaState::CompensationFailed;
                        self.log.checkpoint(&mut locked).await?;
                        self.metrics
                            .record_compensation_failure(&locked.definition_id);
                        error!(
                            saga_id,
                            step = %step_id,
                            %err,
                            "compensation retries exhausted, operator intervention required"
                        );
                        return Err(Error::CompensationFailed(saga_id));
                    }
                }
            }
        }

        let mut locked = instance.lock().await;
        locked.state = SagaState::Compensated;
        self.log.checkpoint(&mut locked).await?;
        info!(saga_id, "saga compensated");
        Ok(())
    }

    async fn await_confirmation(&self, saga_id: &str, step_id: &str) {
        let key = format!("{saga_id}/{step_id}");
        let notify = self
            .manual_confirmations
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone();
        notify.notified().await;
        self.manual_confirmations.remove(&key);
    }

    /// Resume every non-terminal saga found in the checkpoint store.
    /// Idempotent: completed steps replay from their stored results and
    /// compensations already logged are not run again.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        for instance in self.log.scan_checkpoints().await? {
            if instance.state.is_terminal() {
                continue;
            }
            let Some(definition) = self
                .definitions
                .get(&instance.definition_id)
                .map(|d| Arc::clone(&d))
            else {
                warn!(
                    saga_id = %instance.saga_id,
                    definition_id = %instance.definition_id,
                    "checkpoint references unregistered definition, skipping"
                );
                report.skipped += 1;
                continue;
            };

            let saga_id = instance.saga_id.clone();
            let state = instance.state;
            let shared = Arc::new(Mutex::new(instance));
            self.instances.insert(saga_id.clone(), Arc::clone(&shared));

            match state {
                SagaState::Created | SagaState::Running => {
                    info!(saga_id, "resuming saga forward");
                    if let Err(err) = self.run_saga(shared, definition).await {
                        warn!(saga_id, %err, "saga recovery ended in error");
                    }
                    report.resumed += 1;
                }
                SagaState::Compensating => {
                    info!(saga_id, "resuming saga compensation");
                    if let Err(err) = self.run_compensation(&shared, &definition).await {
                        warn!(saga_id, %err, "compensation recovery ended in error");
                    }
                    report.compensated += 1;
                }
                _ => {}
            }
        }
        Ok(report)
    }
}
