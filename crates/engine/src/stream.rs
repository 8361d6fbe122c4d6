//! Stream bridge
//!
//! Subscribes to tracker transition hooks, wraps every transition in a
//! versioned event envelope, and fans envelopes out to per-workflow
//! subscribers. Delivery is at-least-once with per-workflow ordering;
//! consumers deduplicate by event id. The bridge never blocks inside a hook:
//! full subscriber channels mark the consumer slow and delivery continues
//! best-effort until the cleanup task drops stale slow consumers.

use crate::tracker::{StateTracker, TransitionEvent, TransitionKind};
use dashmap::DashMap;
use flowlane_common::config::StreamConfig;
use flowlane_common::types::{NodeId, WorkflowId};
use flowlane_core::events::{EventEnvelope, EventType};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use uuid::Uuid;

/// A live event subscription for one workflow
pub struct StreamSubscription {
    pub id: Uuid,
    pub receiver: mpsc::Receiver<EventEnvelope>,
}

struct Subscriber {
    id: Uuid,
    tx: mpsc::Sender<EventEnvelope>,
    slow_since: Option<Instant>,
}

#[derive(Default)]
struct WorkflowStream {
    subscribers: Vec<Subscriber>,
    window: VecDeque<EventEnvelope>,
    terminal_seen: bool,
    last_activity: Option<Instant>,
}

/// Fan-out bridge from transition hooks to stream consumers
pub struct StreamBridge {
    node_id: NodeId,
    config: StreamConfig,
    streams: DashMap<WorkflowId, WorkflowStream>,
}

impl StreamBridge {
    pub fn new(node_id: impl Into<String>, config: StreamConfig) -> Arc<Self> {
        Arc::new(Self {
            node_id: node_id.into(),
            config,
            streams: DashMap::new(),
        })
    }

    /// Wire this bridge into a tracker's hook chain
    pub fn attach(self: Arc<Self>, tracker: &StateTracker) {
        tracker.subscribe(Box::new(move |event| self.publish_transition(event)));
    }

    /// Convert a committed transition into an envelope and fan it out.
    /// Runs under the workflow lock, so it must not block.
    pub fn publish_transition(&self, event: &TransitionEvent) {
        let event_type = match event.kind {
            TransitionKind::Task { to, .. } => EventType::for_task(to),
            TransitionKind::Workflow { to, .. } => EventType::for_workflow(to),
        };

        let mut payload = serde_json::Map::new();
        if let Some(error) = &event.error {
            payload.insert("error".to_string(), serde_json::Value::String(error.clone()));
        }
        if let Some(reason) = event.reason {
            payload.insert(
                "cancellation_reason".to_string(),
                serde_json::Value::String(reason.as_str().to_string()),
            );
        }
        if let Some(duration) = event.duration {
            payload.insert(
                "duration_ms".to_string(),
                serde_json::Value::from(duration.as_millis() as u64),
            );
        }

        let envelope = EventEnvelope::new(
            event_type,
            event.workflow_id.clone(),
            event.task_id.clone(),
            self.node_id.clone(),
            event.sequence,
            serde_json::Value::Object(payload),
        );
        self.publish(envelope);
    }

    fn publish(&self, envelope: EventEnvelope) {
        let mut stream = self
            .streams
            .entry(envelope.workflow_id.clone())
            .or_default();

        stream.window.push_back(envelope.clone());
        while stream.window.len() > self.config.replay_window {
            stream.window.pop_front();
        }
        stream.terminal_seen = stream.terminal_seen
            || matches!(
                envelope.event_type,
                EventType::WorkflowCompleted
                    | EventType::WorkflowFailed
                    | EventType::WorkflowCancelled
            );
        stream.last_activity = Some(Instant::now());

        stream.subscribers.retain_mut(|subscriber| {
            match subscriber.tx.try_send(envelope.clone()) {
                Ok(()) => {
                    subscriber.slow_since = None;
                    true
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    if subscriber.slow_since.is_none() {
                        debug!(
                            workflow_id = %envelope.workflow_id,
                            subscriber = %subscriber.id,
                            "subscriber cannot keep up, marking slow"
                        );
                        subscriber.slow_since = Some(Instant::now());
                    }
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    trace!(subscriber = %subscriber.id, "removing closed subscriber");
                    false
                }
            }
        });
    }

    /// Subscribe to a workflow's events. Passing the last observed sequence
    /// replays every retained event after it before live delivery resumes.
    pub fn subscribe(
        &self,
        workflow_id: &str,
        last_sequence: Option<u64>,
    ) -> StreamSubscription {
        let (tx, rx) = mpsc::channel(self.config.subscriber_buffer.max(1));
        let id = Uuid::new_v4();

        let mut stream = self.streams.entry(workflow_id.to_string()).or_default();
        if let Some(last) = last_sequence {
            for envelope in stream.window.iter().filter(|e| e.sequence > last) {
                // Replay is bounded by the window and best-effort like live
                // delivery; a full channel simply truncates the replay
                if tx.try_send(envelope.clone()).is_err() {
                    break;
                }
            }
        }
        stream.subscribers.push(Subscriber {
            id,
            tx,
            slow_since: None,
        });

        StreamSubscription { id, receiver: rx }
    }

    pub fn unsubscribe(&self, workflow_id: &str, subscription_id: Uuid) {
        if let Some(mut stream) = self.streams.get_mut(workflow_id) {
            stream.subscribers.retain(|s| s.id != subscription_id);
        }
    }

    pub fn subscriber_count(&self, workflow_id: &str) -> usize {
        self.streams
            .get(workflow_id)
            .map_or(0, |s| s.subscribers.len())
    }

    /// Drop slow consumers older than the configured max age and retire
    /// fully-terminal streams nobody listens to
    pub fn sweep(&self) {
        let max_age = Duration::from_millis(self.config.slow_consumer_max_age_ms);
        let now = Instant::now();

        for mut entry in self.streams.iter_mut() {
            entry.subscribers.retain(|subscriber| {
                let stale = subscriber
                    .slow_since
                    .is_some_and(|since| now.duration_since(since) > max_age);
                if stale {
                    debug!(subscriber = %subscriber.id, "dropping stale slow consumer");
                }
                !stale
            });
        }

        self.streams.retain(|_, stream| {
            let idle = stream
                .last_activity
                .is_none_or(|at| now.duration_since(at) > max_age);
            !(stream.terminal_seen && stream.subscribers.is_empty() && idle)
        });
    }

    /// Run the cleanup sweep on an interval until shutdown
    pub fn spawn_cleanup(self: Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let bridge = self;
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_millis(bridge.config.cleanup_interval_ms));
            loop {
                tokio::select! {
                    _ = ticker.tick() => bridge.sweep(),
                    () = shutdown.cancelled() => return,
                }
            }
        })
    }
}
