//! Fallback snapshot persistence on top of the flat document.
//!
//! Snapshots always live in the flat file, even when the structured backend
//! is healthy, so a later session that cannot open LMDB still finds them.

use std::sync::Arc;

use solarflow_core::{SnapshotPersistence, SolarflowResult};

use crate::flat::FlatFileBackend;

/// Prefix for snapshot keys inside the flat document.
const SNAPSHOT_PREFIX: &str = "fallback-";

/// Stores last-known-good resource values under `fallback-<key>`.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    flat: Arc<FlatFileBackend>,
}

impl SnapshotStore {
    pub fn new(flat: Arc<FlatFileBackend>) -> Self {
        Self { flat }
    }

    fn snapshot_key(key: &str) -> String {
        format!("{SNAPSHOT_PREFIX}{key}")
    }

    /// Remove a stored snapshot. Returns whether one existed.
    pub fn remove_snapshot(&self, key: &str) -> SolarflowResult<bool> {
        self.flat.remove_value(&Self::snapshot_key(key))
    }
}

#[async_trait::async_trait]
impl SnapshotPersistence for SnapshotStore {
    async fn save_snapshot(&self, key: &str, value: &serde_json::Value) -> SolarflowResult<()> {
        self.flat.set_value(&Self::snapshot_key(key), value.clone())
    }

    async fn load_snapshot(&self, key: &str) -> SolarflowResult<Option<serde_json::Value>> {
        self.flat.get_value(&Self::snapshot_key(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn create_test_store() -> (SnapshotStore, TempDir) {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let flat = FlatFileBackend::open(temp_dir.path().join("flat-store.json"))
            .expect("failed to open flat backend");
        (SnapshotStore::new(Arc::new(flat)), temp_dir)
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let (store, _dir) = create_test_store();
        let value = json!({ "minions": [{ "name": "Aurora" }] });

        store
            .save_snapshot("minions", &value)
            .await
            .expect("save should succeed");
        let loaded = store
            .load_snapshot("minions")
            .await
            .expect("load should succeed");

        assert_eq!(loaded, Some(value));
    }

    #[tokio::test]
    async fn test_load_missing_returns_none() {
        let (store, _dir) = create_test_store();
        let loaded = store
            .load_snapshot("never-saved")
            .await
            .expect("load should succeed");
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn test_save_overwrites_previous_snapshot() {
        let (store, _dir) = create_test_store();
        store
            .save_snapshot("solar", &json!({ "output_kw": 10 }))
            .await
            .expect("save should succeed");
        store
            .save_snapshot("solar", &json!({ "output_kw": 55 }))
            .await
            .expect("save should succeed");

        let loaded = store
            .load_snapshot("solar")
            .await
            .expect("load should succeed");
        assert_eq!(loaded, Some(json!({ "output_kw": 55 })));
    }

    #[tokio::test]
    async fn test_remove_snapshot() {
        let (store, _dir) = create_test_store();
        store
            .save_snapshot("threats", &json!([]))
            .await
            .expect("save should succeed");

        assert!(store
            .remove_snapshot("threats")
            .expect("remove should succeed"));
        assert!(!store
            .remove_snapshot("threats")
            .expect("remove should succeed"));
    }
}
