//! Lane registry and routing
//!
//! The manager owns every lane in the process. Submissions route by the
//! task's lane name, falling back to the default lane, and the redirect
//! chain for full redirect-policy lanes is resolved here so the depth cap
//! and the source lane's outcome accounting stay in one place.

use crate::lane::{Lane, LaneRejection, LaneStats, LaneTask, RejectReason};
use flowlane_common::error::{Error, Result};
use flowlane_common::metrics::MetricsSink;
use flowlane_common::types::{BackpressurePolicy, LaneConfig, DEFAULT_LANE};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// Aggregate statistics over all registered lanes
#[derive(Debug, Clone, Default)]
pub struct ManagerStats {
    pub lanes: HashMap<String, LaneStats>,
    pub totals: LaneStats,
}

/// Registry of named lanes
pub struct LaneManager {
    lanes: RwLock<HashMap<String, Arc<Lane>>>,
    closed: AtomicBool,
    redirect_max_depth: usize,
    metrics: Arc<dyn MetricsSink>,
}

impl LaneManager {
    pub fn new(redirect_max_depth: usize, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            lanes: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
            redirect_max_depth,
            metrics,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Register a lane and launch its worker pool
    pub fn register(&self, config: LaneConfig) -> Result<Arc<Lane>> {
        if self.is_closed() {
            return Err(Error::ManagerClosed);
        }
        config.validate()?;

        let mut lanes = self.lanes.write();
        if lanes.contains_key(&config.name) {
            return Err(Error::Config(format!(
                "lane {} already registered",
                config.name
            )));
        }
        let name = config.name.clone();
        let lane = Lane::new(config, Arc::clone(&self.metrics));
        lanes.insert(name.clone(), Arc::clone(&lane));
        info!(lane = %name, "registered lane");
        Ok(lane)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Lane>> {
        self.lanes.read().get(name).cloned()
    }

    /// Route a task to its lane, applying the redirect chain when the
    /// target is full
    #[instrument(skip(self, task, cancel), fields(task_id = %task.task_id, lane = %task.lane))]
    pub async fn submit(&self, task: LaneTask, cancel: &CancellationToken) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ManagerClosed);
        }

        let name = if task.lane.is_empty() {
            DEFAULT_LANE
        } else {
            task.lane.as_str()
        };
        let lane = self
            .get(name)
            .ok_or_else(|| Error::LaneSubmit(format!("unknown lane: {name}")))?;

        if lane.config().backpressure != BackpressurePolicy::Redirect {
            return lane.submit(task, cancel).await;
        }

        // Redirect chain: only the target's acceptance counts as redirected
        // on the source; anything else is a rejection on the source.
        match lane.try_enqueue(task) {
            Ok(()) => Ok(()),
            Err(LaneRejection {
                reason: RejectReason::Closed,
                ..
            }) => {
                lane.note_rejected();
                Err(Error::LaneClosed(lane.name().to_string()))
            }
            Err(LaneRejection { mut task, .. }) => {
                let mut current = Arc::clone(&lane);
                let mut depth = 0;
                loop {
                    if depth >= self.redirect_max_depth {
                        lane.note_rejected();
                        return Err(Error::LaneFull(lane.name().to_string()));
                    }
                    let target_name = match current.config().redirect_target.as_deref() {
                        Some(target) => target.to_string(),
                        None => {
                            lane.note_rejected();
                            return Err(Error::LaneFull(lane.name().to_string()));
                        }
                    };
                    let Some(target) = self.get(&target_name) else {
                        lane.note_rejected();
                        return Err(Error::LaneSubmit(format!(
                            "redirect target not registered: {target_name}"
                        )));
                    };
                    depth += 1;
                    debug!(
                        source = %lane.name(),
                        target = %target_name,
                        depth,
                        "redirecting submission"
                    );
                    match target.try_enqueue(task) {
                        Ok(()) => {
                            lane.note_redirected();
                            return Ok(());
                        }
                        Err(LaneRejection {
                            task: returned,
                            reason: RejectReason::Full,
                        }) if target.config().backpressure == BackpressurePolicy::Redirect => {
                            task = returned;
                            current = target;
                        }
                        Err(_) => {
                            lane.note_rejected();
                            return Err(Error::LaneFull(lane.name().to_string()));
                        }
                    }
                }
            }
        }
    }

    /// Aggregate per-lane and total statistics
    pub fn stats(&self) -> ManagerStats {
        let lanes = self.lanes.read();
        let mut out = ManagerStats::default();
        for (name, lane) in lanes.iter() {
            let stats = lane.stats();
            out.totals.pending += stats.pending;
            out.totals.running += stats.running;
            out.totals.completed += stats.completed;
            out.totals.failed += stats.failed;
            out.totals.accepted += stats.accepted;
            out.totals.rejected += stats.rejected;
            out.totals.redirected += stats.redirected;
            out.totals.dropped += stats.dropped;
            out.lanes.insert(name.clone(), stats);
        }
        out
    }

    /// Close every lane concurrently, each bounded by `timeout`. Repeated
    /// close is a no-op; registration afterwards fails.
    pub async fn close(&self, timeout: Duration) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let lanes: Vec<Arc<Lane>> = self.lanes.read().values().cloned().collect();
        info!(count = lanes.len(), "closing lane manager");
        let closes = lanes.iter().map(|lane| lane.close(timeout));
        for result in futures::future::join_all(closes).await {
            result?;
        }
        Ok(())
    }
}
