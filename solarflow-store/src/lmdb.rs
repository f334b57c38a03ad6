//! LMDB-backed structured backend.
//!
//! Two named databases share one environment: `records` holds JSON-encoded
//! records under `<collection>\x1f<id>` keys, and `index` holds equality-index
//! entries under `<collection>\x1f<field>\x1f<token>\x1f<id>` keys. Tokens are
//! the JSON encoding of the indexed value, so raw separator bytes can never
//! appear inside them. Indexed fields come from the collection registry at
//! open time.

use std::collections::HashMap;
use std::path::Path;

use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use solarflow_core::{BackendKind, Record, SolarflowError, SolarflowResult, StoreError, COLLECTIONS};

use crate::StoreBackend;

/// Separator between key segments. Collection names, field names, and record
/// ids never contain this byte, and JSON-encoded tokens escape it.
const KEY_SEPARATOR: u8 = 0x1f;

/// Errors specific to the LMDB backend.
#[derive(Debug, thiserror::Error)]
pub enum LmdbError {
    /// Failed to open or create the LMDB environment.
    #[error("failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open a named database.
    #[error("failed to open LMDB database: {0}")]
    DbOpen(String),

    /// Transaction operation failed.
    #[error("LMDB transaction failed: {0}")]
    Transaction(String),

    /// Failed to serialize a record for storage.
    #[error("failed to serialize record: {0}")]
    Serialization(String),

    /// Failed to deserialize a stored record.
    #[error("failed to deserialize record: {0}")]
    Deserialization(String),

    /// Filesystem I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbError> for SolarflowError {
    fn from(err: LmdbError) -> Self {
        let store_err = match err {
            LmdbError::EnvOpen(reason) | LmdbError::DbOpen(reason) => {
                StoreError::BackendUnavailable { reason }
            }
            LmdbError::Transaction(reason) => StoreError::Transaction { reason },
            LmdbError::Serialization(reason) | LmdbError::Deserialization(reason) => {
                StoreError::Serialization { reason }
            }
            LmdbError::Io(e) => StoreError::Io {
                reason: e.to_string(),
            },
        };
        SolarflowError::Store(store_err)
    }
}

fn record_key(collection: &str, id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(collection.len() + id.len() + 1);
    key.extend_from_slice(collection.as_bytes());
    key.push(KEY_SEPARATOR);
    key.extend_from_slice(id.as_bytes());
    key
}

fn collection_prefix(collection: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(collection.len() + 1);
    prefix.extend_from_slice(collection.as_bytes());
    prefix.push(KEY_SEPARATOR);
    prefix
}

fn index_key(collection: &str, field: &str, token: &str, id: &str) -> Vec<u8> {
    let mut key = index_prefix(collection, field, token);
    key.extend_from_slice(id.as_bytes());
    key
}

fn index_prefix(collection: &str, field: &str, token: &str) -> Vec<u8> {
    let mut prefix =
        Vec::with_capacity(collection.len() + field.len() + token.len() + 3);
    prefix.extend_from_slice(collection.as_bytes());
    prefix.push(KEY_SEPARATOR);
    prefix.extend_from_slice(field.as_bytes());
    prefix.push(KEY_SEPARATOR);
    prefix.extend_from_slice(token.as_bytes());
    prefix.push(KEY_SEPARATOR);
    prefix
}

fn index_token(value: &serde_json::Value) -> Result<String, LmdbError> {
    serde_json::to_string(value).map_err(|e| LmdbError::Serialization(e.to_string()))
}

/// LMDB structured backend.
pub struct LmdbBackend {
    env: Env,
    records: Database<Bytes, Bytes>,
    index: Database<Bytes, Bytes>,
    indexed: HashMap<&'static str, &'static [&'static str]>,
}

impl LmdbBackend {
    /// Open (or create) the environment at `path` with the given map size.
    pub fn open(path: impl AsRef<Path>, max_size_mb: usize) -> Result<Self, LmdbError> {
        std::fs::create_dir_all(path.as_ref())?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(2)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbError::EnvOpen(e.to_string()))?;

        let mut wtxn = env
            .write_txn()
            .map_err(|e| LmdbError::Transaction(e.to_string()))?;
        let records = env
            .create_database(&mut wtxn, Some("records"))
            .map_err(|e| LmdbError::DbOpen(e.to_string()))?;
        let index = env
            .create_database(&mut wtxn, Some("index"))
            .map_err(|e| LmdbError::DbOpen(e.to_string()))?;
        wtxn.commit()
            .map_err(|e| LmdbError::Transaction(e.to_string()))?;

        let indexed = COLLECTIONS
            .iter()
            .map(|c| (c.name, c.indexed_fields))
            .collect();

        Ok(Self {
            env,
            records,
            index,
            indexed,
        })
    }

    fn indexed_fields_for(&self, collection: &str) -> &'static [&'static str] {
        self.indexed.get(collection).copied().unwrap_or(&[])
    }

    fn read_record(
        &self,
        rtxn: &heed::RoTxn<'_>,
        collection: &str,
        id: &str,
    ) -> Result<Option<Record>, LmdbError> {
        let key = record_key(collection, id);
        let bytes = self
            .records
            .get(rtxn, &key)
            .map_err(|e| LmdbError::Transaction(e.to_string()))?;
        match bytes {
            Some(bytes) => {
                let record = serde_json::from_slice(bytes)
                    .map_err(|e| LmdbError::Deserialization(e.to_string()))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn delete_index_entries(
        &self,
        wtxn: &mut heed::RwTxn<'_>,
        collection: &str,
        record: &Record,
    ) -> Result<(), LmdbError> {
        for field in self.indexed_fields_for(collection) {
            if let Some(value) = record.payload.get(*field) {
                let token = index_token(value)?;
                let key = index_key(collection, field, &token, &record.id);
                self.index
                    .delete(wtxn, &key)
                    .map_err(|e| LmdbError::Transaction(e.to_string()))?;
            }
        }
        Ok(())
    }

    fn write_index_entries(
        &self,
        wtxn: &mut heed::RwTxn<'_>,
        collection: &str,
        record: &Record,
    ) -> Result<(), LmdbError> {
        for field in self.indexed_fields_for(collection) {
            if let Some(value) = record.payload.get(*field) {
                let token = index_token(value)?;
                let key = index_key(collection, field, &token, &record.id);
                self.index
                    .put(wtxn, &key, record.id.as_bytes())
                    .map_err(|e| LmdbError::Transaction(e.to_string()))?;
            }
        }
        Ok(())
    }

    fn collect_keys_with_prefix(
        &self,
        db: &Database<Bytes, Bytes>,
        txn: &heed::RoTxn<'_>,
        prefix: &[u8],
    ) -> Result<Vec<Vec<u8>>, LmdbError> {
        let mut keys = Vec::new();
        let iter = db
            .iter(txn)
            .map_err(|e| LmdbError::Transaction(e.to_string()))?;
        for entry in iter {
            let (key, _) = entry.map_err(|e| LmdbError::Transaction(e.to_string()))?;
            if key.starts_with(prefix) {
                keys.push(key.to_vec());
            }
        }
        Ok(keys)
    }
}

#[async_trait::async_trait]
impl StoreBackend for LmdbBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Structured
    }

    async fn put(&self, collection: &str, record: &Record) -> SolarflowResult<()> {
        let bytes = serde_json::to_vec(record)
            .map_err(|e| LmdbError::Serialization(e.to_string()))?;
        let key = record_key(collection, &record.id);

        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| LmdbError::Transaction(e.to_string()))?;

        // Index entries for the previous version must go before the record
        // is overwritten.
        let previous = self.read_record(&wtxn, collection, &record.id)?;
        if let Some(previous) = previous {
            self.delete_index_entries(&mut wtxn, collection, &previous)?;
        }

        self.records
            .put(&mut wtxn, &key, &bytes)
            .map_err(|e| LmdbError::Transaction(e.to_string()))?;
        self.write_index_entries(&mut wtxn, collection, record)?;

        wtxn.commit()
            .map_err(|e| LmdbError::Transaction(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, collection: &str, id: &str) -> SolarflowResult<Option<Record>> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| LmdbError::Transaction(e.to_string()))?;
        Ok(self.read_record(&rtxn, collection, id)?)
    }

    async fn remove(&self, collection: &str, id: &str) -> SolarflowResult<bool> {
        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| LmdbError::Transaction(e.to_string()))?;

        let Some(existing) = self.read_record(&wtxn, collection, id)? else {
            return Ok(false);
        };

        let key = record_key(collection, id);
        self.records
            .delete(&mut wtxn, &key)
            .map_err(|e| LmdbError::Transaction(e.to_string()))?;
        self.delete_index_entries(&mut wtxn, collection, &existing)?;

        wtxn.commit()
            .map_err(|e| LmdbError::Transaction(e.to_string()))?;
        Ok(true)
    }

    async fn list(&self, collection: &str) -> SolarflowResult<Vec<Record>> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| LmdbError::Transaction(e.to_string()))?;
        let prefix = collection_prefix(collection);

        let mut records = Vec::new();
        let iter = self
            .records
            .iter(&rtxn)
            .map_err(|e| LmdbError::Transaction(e.to_string()))?;
        for entry in iter {
            let (key, value) = entry.map_err(|e| LmdbError::Transaction(e.to_string()))?;
            if key.starts_with(&prefix) {
                let record: Record = serde_json::from_slice(value)
                    .map_err(|e| LmdbError::Deserialization(e.to_string()))?;
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn find_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &serde_json::Value,
    ) -> SolarflowResult<Vec<Record>> {
        if !self.indexed_fields_for(collection).contains(&field) {
            return Err(StoreError::FieldNotIndexed {
                collection: collection.to_string(),
                field: field.to_string(),
            }
            .into());
        }

        let token = index_token(value)?;
        let prefix = index_prefix(collection, field, &token);

        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| LmdbError::Transaction(e.to_string()))?;

        let mut ids = Vec::new();
        let iter = self
            .index
            .iter(&rtxn)
            .map_err(|e| LmdbError::Transaction(e.to_string()))?;
        for entry in iter {
            let (key, id_bytes) = entry.map_err(|e| LmdbError::Transaction(e.to_string()))?;
            if key.starts_with(&prefix) {
                let id = String::from_utf8_lossy(id_bytes).into_owned();
                ids.push(id);
            }
        }

        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            // Stale index entries pointing at removed records are skipped.
            if let Some(record) = self.read_record(&rtxn, collection, &id)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn count(&self, collection: &str) -> SolarflowResult<usize> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| LmdbError::Transaction(e.to_string()))?;
        let keys = self.collect_keys_with_prefix(&self.records, &rtxn, &collection_prefix(collection))?;
        Ok(keys.len())
    }

    async fn replace_all(&self, collection: &str, records: &[Record]) -> SolarflowResult<()> {
        let prefix = collection_prefix(collection);
        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| LmdbError::Transaction(e.to_string()))?;

        let record_keys = self.collect_keys_with_prefix(&self.records, &wtxn, &prefix)?;
        for key in &record_keys {
            self.records
                .delete(&mut wtxn, key)
                .map_err(|e| LmdbError::Transaction(e.to_string()))?;
        }
        let index_keys = self.collect_keys_with_prefix(&self.index, &wtxn, &prefix)?;
        for key in &index_keys {
            self.index
                .delete(&mut wtxn, key)
                .map_err(|e| LmdbError::Transaction(e.to_string()))?;
        }

        for record in records {
            let bytes = serde_json::to_vec(record)
                .map_err(|e| LmdbError::Serialization(e.to_string()))?;
            let key = record_key(collection, &record.id);
            self.records
                .put(&mut wtxn, &key, &bytes)
                .map_err(|e| LmdbError::Transaction(e.to_string()))?;
            self.write_index_entries(&mut wtxn, collection, record)?;
        }

        wtxn.commit()
            .map_err(|e| LmdbError::Transaction(e.to_string()))?;
        Ok(())
    }
}

impl std::fmt::Debug for LmdbBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LmdbBackend")
            .field("path", &self.env.path())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn create_test_backend() -> (LmdbBackend, TempDir) {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let backend =
            LmdbBackend::open(temp_dir.path().join("lmdb"), 16).expect("failed to open backend");
        (backend, temp_dir)
    }

    fn make_minion(id: &str, name: &str, role: &str) -> Record {
        Record::new(id.to_string(), json!({ "name": name, "role": role }))
    }

    #[tokio::test]
    async fn test_put_and_get_round_trip() {
        let (backend, _dir) = create_test_backend();
        let record = make_minion("m1", "Aurora", "harvester");

        backend
            .put("minions", &record)
            .await
            .expect("put should succeed");
        let fetched = backend
            .get("minions", "m1")
            .await
            .expect("get should succeed");

        assert_eq!(fetched, Some(record));
    }

    #[tokio::test]
    async fn test_collections_are_isolated() {
        let (backend, _dir) = create_test_backend();
        backend
            .put("minions", &make_minion("x1", "Aurora", "harvester"))
            .await
            .expect("put should succeed");
        backend
            .put(
                "messages",
                &Record::new("x2".to_string(), json!({ "from": "a", "to": "b" })),
            )
            .await
            .expect("put should succeed");

        let minions = backend.list("minions").await.expect("list should succeed");
        let messages = backend
            .list("messages")
            .await
            .expect("list should succeed");
        assert_eq!(minions.len(), 1);
        assert_eq!(messages.len(), 1);
        assert_eq!(minions[0].id, "x1");
        assert_eq!(messages[0].id, "x2");
    }

    #[tokio::test]
    async fn test_find_by_field_uses_index() {
        let (backend, _dir) = create_test_backend();
        backend
            .put("minions", &make_minion("m1", "Aurora", "harvester"))
            .await
            .expect("put should succeed");
        backend
            .put("minions", &make_minion("m2", "Borealis", "scout"))
            .await
            .expect("put should succeed");
        backend
            .put("minions", &make_minion("m3", "Cirrus", "harvester"))
            .await
            .expect("put should succeed");

        let hits = backend
            .find_by_field("minions", "role", &json!("harvester"))
            .await
            .expect("query should succeed");
        let mut ids: Vec<&str> = hits.iter().map(|r| r.id.as_str()).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec!["m1", "m3"]);
    }

    #[tokio::test]
    async fn test_update_reindexes_changed_field() {
        let (backend, _dir) = create_test_backend();
        backend
            .put("minions", &make_minion("m1", "Aurora", "harvester"))
            .await
            .expect("put should succeed");

        backend
            .put("minions", &make_minion("m1", "Aurora", "scout"))
            .await
            .expect("update should succeed");

        let old_hits = backend
            .find_by_field("minions", "role", &json!("harvester"))
            .await
            .expect("query should succeed");
        assert!(old_hits.is_empty());

        let new_hits = backend
            .find_by_field("minions", "role", &json!("scout"))
            .await
            .expect("query should succeed");
        assert_eq!(new_hits.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_clears_index_entries() {
        let (backend, _dir) = create_test_backend();
        backend
            .put("minions", &make_minion("m1", "Aurora", "harvester"))
            .await
            .expect("put should succeed");

        let removed = backend
            .remove("minions", "m1")
            .await
            .expect("remove should succeed");
        assert!(removed);

        let hits = backend
            .find_by_field("minions", "role", &json!("harvester"))
            .await
            .expect("query should succeed");
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_remove_missing_returns_false() {
        let (backend, _dir) = create_test_backend();
        let removed = backend
            .remove("minions", "ghost")
            .await
            .expect("remove should succeed");
        assert!(!removed);
    }

    #[tokio::test]
    async fn test_find_by_field_rejects_unindexed() {
        let (backend, _dir) = create_test_backend();
        let err = backend
            .find_by_field("minions", "favourite_color", &json!("red"))
            .await
            .expect_err("unindexed field should be rejected");
        assert!(matches!(
            err,
            SolarflowError::Store(StoreError::FieldNotIndexed { .. })
        ));
    }

    #[tokio::test]
    async fn test_count_tracks_collection_size() {
        let (backend, _dir) = create_test_backend();
        assert_eq!(
            backend.count("minions").await.expect("count should succeed"),
            0
        );
        for i in 0..3 {
            backend
                .put(
                    "minions",
                    &make_minion(&format!("m{i}"), "Unit", "harvester"),
                )
                .await
                .expect("put should succeed");
        }
        assert_eq!(
            backend.count("minions").await.expect("count should succeed"),
            3
        );
    }

    #[tokio::test]
    async fn test_replace_all_swaps_contents_and_index() {
        let (backend, _dir) = create_test_backend();
        backend
            .put("minions", &make_minion("m1", "Aurora", "harvester"))
            .await
            .expect("put should succeed");

        backend
            .replace_all(
                "minions",
                &[
                    make_minion("m7", "Helios", "scout"),
                    make_minion("m8", "Selene", "scout"),
                ],
            )
            .await
            .expect("replace_all should succeed");

        assert_eq!(
            backend.count("minions").await.expect("count should succeed"),
            2
        );
        let old_hits = backend
            .find_by_field("minions", "role", &json!("harvester"))
            .await
            .expect("query should succeed");
        assert!(old_hits.is_empty());
        let new_hits = backend
            .find_by_field("minions", "role", &json!("scout"))
            .await
            .expect("query should succeed");
        assert_eq!(new_hits.len(), 2);
    }

    #[tokio::test]
    async fn test_data_survives_reopen() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let path = temp_dir.path().join("lmdb");

        {
            let backend = LmdbBackend::open(&path, 16).expect("failed to open backend");
            backend
                .put("minions", &make_minion("m1", "Aurora", "harvester"))
                .await
                .expect("put should succeed");
        }

        let reopened = LmdbBackend::open(&path, 16).expect("failed to reopen backend");
        let fetched = reopened
            .get("minions", "m1")
            .await
            .expect("get should succeed");
        assert!(fetched.is_some());
    }
}
