//! Per-task signal delivery
//!
//! Signals steer, interrupt, or collect from running tasks. Local delivery
//! uses bounded broadcast channels whose lagging receivers skip the oldest
//! entries, giving ring-buffer overflow semantics. Distributed routing is an
//! injected seam: an ownership oracle decides whether a task is local, and a
//! transport forwards signals for remotely-owned tasks. A signal is delivered
//! on exactly one of the two paths.

use async_trait::async_trait;
use dashmap::DashMap;
use flowlane_common::error::{Error, Result};
use flowlane_common::types::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// Typed task signals
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Signal {
    /// Adjust a running task's behavior
    Steer {
        payload: HashMap<String, serde_json::Value>,
    },
    /// Ask a task to stop
    Interrupt {
        reason: String,
        graceful: bool,
        timeout_ms: u64,
    },
    /// Deliver a result into a waiting task
    Collect { result: serde_json::Value },
}

/// Decides which node owns a task
pub trait OwnershipOracle: Send + Sync {
    fn owner_of(&self, workflow_id: &str, task_id: &str) -> NodeId;
}

/// Oracle that owns every task locally
pub struct LocalOwnership {
    node_id: NodeId,
}

impl LocalOwnership {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
        }
    }
}

impl OwnershipOracle for LocalOwnership {
    fn owner_of(&self, _workflow_id: &str, _task_id: &str) -> NodeId {
        self.node_id.clone()
    }
}

/// Forwards signals to the node owning a task
///
/// Implementations return `OwnershipChanged` when the task moved while the
/// signal was in flight; the bus never retries on the local path after a
/// forward, so duplicate delivery cannot occur.
#[async_trait]
pub trait SignalTransport: Send + Sync {
    async fn forward(
        &self,
        owner: &NodeId,
        workflow_id: &str,
        task_id: &str,
        signal: Signal,
    ) -> Result<()>;
}

/// Per-task signal bus
pub struct SignalBus {
    node_id: NodeId,
    capacity: usize,
    channels: DashMap<String, broadcast::Sender<Signal>>,
    oracle: Arc<dyn OwnershipOracle>,
    transport: Option<Arc<dyn SignalTransport>>,
    closed: AtomicBool,
}

impl SignalBus {
    /// Local-only bus
    pub fn new(node_id: impl Into<String>, capacity: usize) -> Self {
        let node_id = node_id.into();
        Self {
            oracle: Arc::new(LocalOwnership::new(node_id.clone())),
            node_id,
            capacity,
            channels: DashMap::new(),
            transport: None,
            closed: AtomicBool::new(false),
        }
    }

    /// Bus with injected ownership and transport for distributed mode
    pub fn with_routing(
        node_id: impl Into<String>,
        capacity: usize,
        oracle: Arc<dyn OwnershipOracle>,
        transport: Arc<dyn SignalTransport>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            capacity,
            channels: DashMap::new(),
            oracle,
            transport: Some(transport),
            closed: AtomicBool::new(false),
        }
    }

    fn key(workflow_id: &str, task_id: &str) -> String {
        format!("{workflow_id}/{task_id}")
    }

    /// Deliver a signal to a task, locally or through the transport
    pub async fn publish(&self, workflow_id: &str, task_id: &str, signal: Signal) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Internal("signal bus is closed".to_string()));
        }

        let owner = self.oracle.owner_of(workflow_id, task_id);
        if owner != self.node_id {
            let transport = self.transport.as_ref().ok_or_else(|| {
                Error::OwnershipChanged {
                    task: task_id.to_string(),
                    owner: owner.clone(),
                }
            })?;
            debug!(task = task_id, %owner, "forwarding signal to owner node");
            return transport.forward(&owner, workflow_id, task_id, signal).await;
        }

        let key = Self::key(workflow_id, task_id);
        if let Some(sender) = self.channels.get(&key) {
            // No receivers is fine; the signal is simply unobserved
            let _ = sender.send(signal);
        }
        Ok(())
    }

    /// Subscribe to a task's signals; the channel is bounded and lagging
    /// receivers skip the oldest signals
    pub fn subscribe(&self, workflow_id: &str, task_id: &str) -> broadcast::Receiver<Signal> {
        let key = Self::key(workflow_id, task_id);
        self.channels
            .entry(key)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Drop a task's channel; outstanding receivers observe closure
    pub fn unsubscribe(&self, workflow_id: &str, task_id: &str) {
        self.channels.remove(&Self::key(workflow_id, task_id));
    }

    /// Stop delivery and drop every channel
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.channels.clear();
    }
}
