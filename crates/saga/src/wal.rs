//! Write-ahead log and checkpoint persistence
//!
//! Every saga state change is logged before the checkpoint is overwritten.
//! WAL keys embed a zero-padded sequence so a prefix scan replays entries in
//! write order; the checkpoint plus the WAL is sufficient to reconstruct a
//! saga after a crash.

use crate::instance::{SagaInstance, WalEntry, WalEntryType};
use chrono::Utc;
use flowlane_common::error::{Error, Result};
use flowlane_core::store::{checkpoint_key, wal_key, wal_prefix, StateStore, CHECKPOINT_PREFIX};
use std::sync::Arc;
use tracing::debug;

/// Durability layer for sagas
pub struct SagaLog {
    store: Arc<dyn StateStore>,
}

impl SagaLog {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Append one WAL entry, advancing the instance's sequence
    pub async fn append(
        &self,
        instance: &mut SagaInstance,
        step_id: &str,
        entry_type: WalEntryType,
        data: serde_json::Value,
    ) -> Result<u64> {
        instance.last_sequence += 1;
        let entry = WalEntry {
            saga_id: instance.saga_id.clone(),
            step_id: step_id.to_string(),
            entry_type,
            data,
            timestamp: Utc::now(),
            sequence: instance.last_sequence,
        };
        let key = wal_key(&instance.saga_id, entry.sequence);
        let value = serde_json::to_value(&entry)?;
        self.store
            .put(&key, value)
            .await
            .map_err(|e| Error::WalIo(e.to_string()))?;
        Ok(entry.sequence)
    }

    /// Overwrite the saga's checkpoint with its current state
    pub async fn checkpoint(&self, instance: &mut SagaInstance) -> Result<()> {
        instance.last_updated = Utc::now();
        let value = serde_json::to_value(&*instance)?;
        self.store
            .put(&checkpoint_key(&instance.saga_id), value)
            .await
            .map_err(|e| Error::WalIo(e.to_string()))
    }

    pub async fn read_checkpoint(&self, saga_id: &str) -> Result<Option<SagaInstance>> {
        match self.store.get(&checkpoint_key(saga_id)).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Every checkpoint in the store, in key order
    pub async fn scan_checkpoints(&self) -> Result<Vec<SagaInstance>> {
        let mut instances = Vec::new();
        for (_, value) in self.store.scan_prefix(CHECKPOINT_PREFIX).await? {
            instances.push(serde_json::from_value(value)?);
        }
        Ok(instances)
    }

    /// The saga's WAL in sequence order
    pub async fn read_wal(&self, saga_id: &str) -> Result<Vec<WalEntry>> {
        let mut entries = Vec::new();
        for (_, value) in self.store.scan_prefix(&wal_prefix(saga_id)).await? {
            entries.push(serde_json::from_value(value)?);
        }
        Ok(entries)
    }

    /// Delete a saga's WAL and checkpoint, batching deletions
    pub async fn purge(&self, saga_id: &str, batch: usize) -> Result<usize> {
        let entries = self.store.scan_prefix(&wal_prefix(saga_id)).await?;
        let mut removed = 0;
        for chunk in entries.chunks(batch.max(1)) {
            for (key, _) in chunk {
                self.store.delete(key).await?;
                removed += 1;
            }
            tokio::task::yield_now().await;
        }
        self.store.delete(&checkpoint_key(saga_id)).await?;
        debug!(saga_id, removed, "purged saga records");
        Ok(removed)
    }
}
