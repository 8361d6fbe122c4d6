//! WAL and checkpoint retention
//!
//! Terminal sagas older than the retention window lose their WAL entries
//! and checkpoint. Deletions run in bounded batches on an interval.

use crate::wal::SagaLog;
use chrono::Utc;
use flowlane_common::config::SagaConfig;
use flowlane_common::error::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Delete expired terminal sagas once; returns how many were purged
pub async fn sweep_once(log: &SagaLog, config: &SagaConfig) -> Result<usize> {
    let cutoff = Utc::now() - chrono::Duration::milliseconds(config.retention_ms as i64);
    let mut purged = 0;
    for instance in log.scan_checkpoints().await? {
        if instance.state.is_terminal() && instance.last_updated < cutoff {
            log.purge(&instance.saga_id, config.sweep_batch).await?;
            purged += 1;
        }
    }
    if purged > 0 {
        info!(purged, "retention sweep removed expired sagas");
    }
    Ok(purged)
}

/// Run the retention sweep on an interval until shutdown
pub fn spawn_sweeper(
    log: Arc<SagaLog>,
    config: SagaConfig,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(config.sweep_interval_ms));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = sweep_once(&log, &config).await {
                        warn!(%err, "retention sweep failed");
                    }
                }
                () = shutdown.cancelled() => return,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::{SagaInstance, SagaState, WalEntryType};
    use flowlane_core::store::MemoryStore;
    use serde_json::json;

    fn config_with_retention(retention_ms: u64) -> SagaConfig {
        SagaConfig {
            retention_ms,
            ..SagaConfig::default()
        }
    }

    #[tokio::test]
    async fn purges_only_expired_terminal_sagas() {
        let log = SagaLog::new(Arc::new(MemoryStore::new()));

        // Terminal and old enough to expire with a zero retention window
        let mut old_done = SagaInstance::new("old-done", "d");
        old_done.state = SagaState::Completed;
        log.append(&mut old_done, "a", WalEntryType::StepCompleted, json!(1))
            .await
            .unwrap();
        log.checkpoint(&mut old_done).await.unwrap();

        // Non-terminal, must survive any retention window
        let mut live = SagaInstance::new("live", "d");
        live.state = SagaState::Running;
        log.checkpoint(&mut live).await.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let purged = sweep_once(&log, &config_with_retention(1)).await.unwrap();
        assert_eq!(purged, 1);
        assert!(log.read_checkpoint("old-done").await.unwrap().is_none());
        assert!(log.read_wal("old-done").await.unwrap().is_empty());
        assert!(log.read_checkpoint("live").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn fresh_terminal_sagas_survive_the_window() {
        let log = SagaLog::new(Arc::new(MemoryStore::new()));
        let mut done = SagaInstance::new("done", "d");
        done.state = SagaState::Compensated;
        log.checkpoint(&mut done).await.unwrap();

        let purged = sweep_once(&log, &config_with_retention(60_000))
            .await
            .unwrap();
        assert_eq!(purged, 0);
        assert!(log.read_checkpoint("done").await.unwrap().is_some());
    }
}
