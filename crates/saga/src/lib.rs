#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Saga orchestration for the Flowlane runtime
//!
//! Distributed-transaction semantics by local orchestration: forward
//! execution over the step DAG through the engine pipeline, write-ahead
//! logging and checkpointing around every step transition, deterministic
//! compensation in reverse topological order, and idempotent recovery from
//! the checkpoint store.

pub mod definition;
pub mod instance;
pub mod orchestrator;
pub mod sweeper;
pub mod wal;

pub use definition::{CompensationPolicy, SagaDefinition, SagaStep, StepAction, StepContext};
pub use instance::{SagaInstance, SagaState, WalEntry, WalEntryType};
pub use orchestrator::{RecoveryReport, SagaOrchestrator};
pub use sweeper::{spawn_sweeper, sweep_once};
pub use wal::SagaLog;
