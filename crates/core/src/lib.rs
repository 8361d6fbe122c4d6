#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Core abstractions for the Flowlane runtime
//!
//! This crate holds the pieces every other component agrees on: the workflow
//! compiler, the state machine guard tables, the event envelope, and the
//! persisted-state seam.

pub mod compiler;
pub mod events;
pub mod state;
pub mod store;

pub use compiler::{compile, ExecutionPlan};
pub use events::{EventEnvelope, EventType, SCHEMA_VERSION};
pub use store::{MemoryStore, StateStore};
