//! Persisted state store
//!
//! Key-value seam for lifecycle state, WAL entries, and checkpoints. The
//! in-memory backend keeps keys ordered so prefix scans return entries in
//! ascending key order, which the WAL relies on for replay.

use async_trait::async_trait;
use flowlane_common::error::Result;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Key-value store for persisted lifecycle state
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn put(&self, key: &str, value: serde_json::Value) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// All entries whose key starts with `prefix`, in ascending key order
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, serde_json::Value)>>;
}

/// Key for a persisted workflow record
pub fn workflow_key(workflow_id: &str) -> String {
    format!("workflow:{workflow_id}")
}

/// Key for a persisted task result
pub fn task_key(workflow_id: &str, task_id: &str) -> String {
    format!("task:{workflow_id}:{task_id}")
}

/// Key for a WAL entry; the sequence is zero-padded so lexicographic scan
/// order equals sequence order
pub fn wal_key(saga_id: &str, sequence: u64) -> String {
    format!("wal:{saga_id}:{sequence:020}")
}

/// Prefix covering every WAL entry of one saga
pub fn wal_prefix(saga_id: &str) -> String {
    format!("wal:{saga_id}:")
}

/// Key for a saga checkpoint
pub fn checkpoint_key(saga_id: &str) -> String {
    format!("checkpoint:{saga_id}")
}

/// Prefix covering all checkpoints
pub const CHECKPOINT_PREFIX: &str = "checkpoint:";

/// In-memory store backend
///
/// Suitable for tests and single-process deployments; a durable backend
/// implements the same trait.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, serde_json::Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn put(&self, key: &str, value: serde_json::Value) -> Result<()> {
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, serde_json::Value)>> {
        let entries = self.entries.read();
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn put_get_delete_round_trip() {
        let store = MemoryStore::new();
        store.put("workflow:wf1", json!({"status": "pending"})).await.unwrap();
        assert_eq!(
            store.get("workflow:wf1").await.unwrap(),
            Some(json!({"status": "pending"}))
        );
        store.delete("workflow:wf1").await.unwrap();
        assert_eq!(store.get("workflow:wf1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn scan_returns_prefix_matches_in_key_order() {
        let store = MemoryStore::new();
        store.put(&wal_key("s1", 2), json!(2)).await.unwrap();
        store.put(&wal_key("s1", 1), json!(1)).await.unwrap();
        store.put(&wal_key("s1", 10), json!(10)).await.unwrap();
        store.put(&wal_key("s2", 1), json!(99)).await.unwrap();

        let entries = store.scan_prefix(&wal_prefix("s1")).await.unwrap();
        let values: Vec<i64> = entries.iter().map(|(_, v)| v.as_i64().unwrap()).collect();
        assert_eq!(values, vec![1, 2, 10]);
    }

    #[test]
    fn key_layout() {
        assert_eq!(workflow_key("wf1"), "workflow:wf1");
        assert_eq!(task_key("wf1", "a"), "task:wf1:a");
        assert_eq!(checkpoint_key("s1"), "checkpoint:s1");
        assert!(wal_key("s1", 5).starts_with("wal:s1:"));
    }
}
