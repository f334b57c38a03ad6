//! In-memory backend for tests and ephemeral setups.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use solarflow_core::{is_indexed_field, BackendKind, Record, SolarflowResult, StoreError};

use crate::StoreBackend;

/// In-memory mock backend. Keeps records per collection in insertion order
/// and mirrors the flat backend's semantics without touching the filesystem.
#[derive(Debug, Default, Clone)]
pub struct MemoryBackend {
    collections: Arc<RwLock<HashMap<String, Vec<Record>>>>,
}

impl MemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop all stored records.
    pub fn clear(&self) {
        self.collections.write().unwrap().clear();
    }

    /// Total records across all collections.
    pub fn total_records(&self) -> usize {
        self.collections
            .read()
            .unwrap()
            .values()
            .map(Vec::len)
            .sum()
    }
}

#[async_trait::async_trait]
impl StoreBackend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Flat
    }

    async fn put(&self, collection: &str, record: &Record) -> SolarflowResult<()> {
        let mut collections = self.collections.write().unwrap();
        let records = collections.entry(collection.to_string()).or_default();
        match records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record.clone(),
            None => records.push(record.clone()),
        }
        Ok(())
    }

    async fn get(&self, collection: &str, id: &str) -> SolarflowResult<Option<Record>> {
        let collections = self.collections.read().unwrap();
        Ok(collections
            .get(collection)
            .and_then(|records| records.iter().find(|r| r.id == id).cloned()))
    }

    async fn remove(&self, collection: &str, id: &str) -> SolarflowResult<bool> {
        let mut collections = self.collections.write().unwrap();
        let Some(records) = collections.get_mut(collection) else {
            return Ok(false);
        };
        let before = records.len();
        records.retain(|r| r.id != id);
        Ok(records.len() != before)
    }

    async fn list(&self, collection: &str) -> SolarflowResult<Vec<Record>> {
        let collections = self.collections.read().unwrap();
        Ok(collections.get(collection).cloned().unwrap_or_default())
    }

    async fn find_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &serde_json::Value,
    ) -> SolarflowResult<Vec<Record>> {
        if !is_indexed_field(collection, field) {
            return Err(StoreError::FieldNotIndexed {
                collection: collection.to_string(),
                field: field.to_string(),
            }
            .into());
        }
        let collections = self.collections.read().unwrap();
        Ok(collections
            .get(collection)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| r.payload.get(field) == Some(value))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn count(&self, collection: &str) -> SolarflowResult<usize> {
        let collections = self.collections.read().unwrap();
        Ok(collections.get(collection).map_or(0, Vec::len))
    }

    async fn replace_all(&self, collection: &str, records: &[Record]) -> SolarflowResult<()> {
        let mut collections = self.collections.write().unwrap();
        collections.insert(collection.to_string(), records.to_vec());
        Ok(())
    }
}
