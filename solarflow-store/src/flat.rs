//! Flat-file backend: a single JSON document on disk.
//!
//! Records live as arrays under `solarflow_<collection>` keys, preserving
//! insertion order. Arbitrary values (fallback snapshots) share the same
//! document under their own keys. Every mutation rewrites the whole file,
//! which keeps the format trivially inspectable and recoverable by hand.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use solarflow_core::{
    is_indexed_field, BackendKind, Record, SolarflowError, SolarflowResult, StoreError,
};

use crate::StoreBackend;

/// Errors specific to the flat-file backend.
#[derive(Debug, thiserror::Error)]
pub enum FlatFileError {
    /// Filesystem operation failed.
    #[error("flat store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The document on disk (or a record inside it) is not valid JSON.
    #[error("flat store serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<FlatFileError> for SolarflowError {
    fn from(err: FlatFileError) -> Self {
        match err {
            FlatFileError::Io(e) => SolarflowError::Store(StoreError::Io {
                reason: e.to_string(),
            }),
            FlatFileError::Serde(e) => SolarflowError::Store(StoreError::Serialization {
                reason: e.to_string(),
            }),
        }
    }
}

/// Key under which a collection's record array is stored in the document.
fn collection_key(collection: &str) -> String {
    format!("solarflow_{collection}")
}

/// Flat JSON-file store.
///
/// The in-memory state is the source of truth; the file is rewritten after
/// every mutation. All operations serialize through one mutex, so concurrent
/// writers cannot interleave partial documents.
#[derive(Debug)]
pub struct FlatFileBackend {
    path: PathBuf,
    state: Mutex<BTreeMap<String, serde_json::Value>>,
}

impl FlatFileBackend {
    /// Open the document at `path`, creating empty state if it does not exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, FlatFileError> {
        let path = path.into();
        let state = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            if raw.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&raw)?
            }
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Path of the backing document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_state(&self) -> SolarflowResult<MutexGuard<'_, BTreeMap<String, serde_json::Value>>> {
        self.state.lock().map_err(|_| {
            SolarflowError::Store(StoreError::Transaction {
                reason: "flat store state lock poisoned".to_string(),
            })
        })
    }

    fn persist(&self, state: &BTreeMap<String, serde_json::Value>) -> Result<(), FlatFileError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(state)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }

    fn records_in(
        state: &BTreeMap<String, serde_json::Value>,
        collection: &str,
    ) -> SolarflowResult<Vec<Record>> {
        let Some(value) = state.get(&collection_key(collection)) else {
            return Ok(Vec::new());
        };
        let items = value.as_array().ok_or_else(|| {
            SolarflowError::Store(StoreError::Serialization {
                reason: format!("collection '{collection}' is not stored as an array"),
            })
        })?;
        items
            .iter()
            .map(|item| {
                serde_json::from_value(item.clone()).map_err(|e| {
                    SolarflowError::Store(StoreError::Serialization {
                        reason: format!("record in '{collection}' failed to decode: {e}"),
                    })
                })
            })
            .collect()
    }

    fn store_records(
        &self,
        state: &mut BTreeMap<String, serde_json::Value>,
        collection: &str,
        records: &[Record],
    ) -> SolarflowResult<()> {
        let items: Vec<serde_json::Value> = records
            .iter()
            .map(|r| {
                serde_json::to_value(r).map_err(|e| {
                    SolarflowError::Store(StoreError::Serialization {
                        reason: e.to_string(),
                    })
                })
            })
            .collect::<SolarflowResult<_>>()?;
        state.insert(collection_key(collection), serde_json::Value::Array(items));
        self.persist(state).map_err(SolarflowError::from)
    }

    /// Read a raw value stored under `key` (outside any collection).
    pub fn get_value(&self, key: &str) -> SolarflowResult<Option<serde_json::Value>> {
        let state = self.lock_state()?;
        Ok(state.get(key).cloned())
    }

    /// Write a raw value under `key` and persist the document.
    pub fn set_value(&self, key: &str, value: serde_json::Value) -> SolarflowResult<()> {
        let mut state = self.lock_state()?;
        state.insert(key.to_string(), value);
        self.persist(&state).map_err(SolarflowError::from)
    }

    /// Remove a raw value. Returns whether the key was present.
    pub fn remove_value(&self, key: &str) -> SolarflowResult<bool> {
        let mut state = self.lock_state()?;
        let removed = state.remove(key).is_some();
        if removed {
            self.persist(&state).map_err(SolarflowError::from)?;
        }
        Ok(removed)
    }
}

#[async_trait::async_trait]
impl StoreBackend for FlatFileBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Flat
    }

    async fn put(&self, collection: &str, record: &Record) -> SolarflowResult<()> {
        let mut state = self.lock_state()?;
        let mut records = Self::records_in(&state, collection)?;
        match records.iter_mut().find(|r| r.id == record.id) {
            // Updates keep the record's position in the array.
            Some(existing) => *existing = record.clone(),
            None => records.push(record.clone()),
        }
        self.store_records(&mut state, collection, &records)
    }

    async fn get(&self, collection: &str, id: &str) -> SolarflowResult<Option<Record>> {
        let state = self.lock_state()?;
        let records = Self::records_in(&state, collection)?;
        Ok(records.into_iter().find(|r| r.id == id))
    }

    async fn remove(&self, collection: &str, id: &str) -> SolarflowResult<bool> {
        let mut state = self.lock_state()?;
        let mut records = Self::records_in(&state, collection)?;
        let before = records.len();
        records.retain(|r| r.id != id);
        if records.len() == before {
            return Ok(false);
        }
        self.store_records(&mut state, collection, &records)?;
        Ok(true)
    }

    async fn list(&self, collection: &str) -> SolarflowResult<Vec<Record>> {
        let state = self.lock_state()?;
        Self::records_in(&state, collection)
    }

    async fn find_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &serde_json::Value,
    ) -> SolarflowResult<Vec<Record>> {
        if !is_indexed_field(collection, field) {
            return Err(SolarflowError::Store(StoreError::FieldNotIndexed {
                collection: collection.to_string(),
                field: field.to_string(),
            }));
        }
        let state = self.lock_state()?;
        let records = Self::records_in(&state, collection)?;
        Ok(records
            .into_iter()
            .filter(|r| r.payload.get(field) == Some(value))
            .collect())
    }

    async fn count(&self, collection: &str) -> SolarflowResult<usize> {
        let state = self.lock_state()?;
        Ok(Self::records_in(&state, collection)?.len())
    }

    async fn replace_all(&self, collection: &str, records: &[Record]) -> SolarflowResult<()> {
        let mut state = self.lock_state()?;
        self.store_records(&mut state, collection, records)
    }
}
