//! SOLARFLOW Store - Dual-Backend Record Persistence
//!
//! Collections of JSON records stored behind a common backend trait. The
//! structured backend (LMDB) is preferred; when it cannot be opened the store
//! falls back to the flat JSON-file backend for the rest of the session.
//! Fallback snapshots always live in the flat file regardless of which
//! backend serves records.

pub mod flat;
pub mod lmdb;
pub mod memory;
pub mod snapshot;

pub use flat::{FlatFileBackend, FlatFileError};
pub use lmdb::{LmdbBackend, LmdbError};
pub use memory::MemoryBackend;
pub use snapshot::SnapshotStore;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use solarflow_core::{
    new_record_id, BackendKind, ChangeEvent, ChangeOp, Collection, HealthCheck, Record,
    SolarflowError, SolarflowResult, StoreConfig, StoreError, Timestamp, COLLECTIONS,
};

/// Capacity of the change-event broadcast channel. Slow subscribers that lag
/// more than this many events behind start seeing `RecvError::Lagged`.
const EVENT_CHANNEL_CAPACITY: usize = 256;

// ============================================================================
// BACKEND TRAIT
// ============================================================================

/// Storage backend for record collections.
///
/// Implementations must serialize concurrent writes per collection themselves
/// or tolerate interleaving; [`DataStore`] additionally serializes writers per
/// collection so backends only ever see one writer at a time per collection.
#[async_trait::async_trait]
pub trait StoreBackend: Send + Sync {
    /// Which backend family this is.
    fn kind(&self) -> BackendKind;

    /// Insert or replace a record.
    async fn put(&self, collection: &str, record: &Record) -> SolarflowResult<()>;

    /// Fetch a record by id.
    async fn get(&self, collection: &str, id: &str) -> SolarflowResult<Option<Record>>;

    /// Remove a record. Returns whether it existed.
    async fn remove(&self, collection: &str, id: &str) -> SolarflowResult<bool>;

    /// All records in a collection. Order is backend-specific: insertion
    /// order on the flat backend, id order on LMDB.
    async fn list(&self, collection: &str) -> SolarflowResult<Vec<Record>>;

    /// Records whose payload field equals `value` exactly. The field must be
    /// declared as indexed in the collection registry.
    async fn find_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &serde_json::Value,
    ) -> SolarflowResult<Vec<Record>>;

    /// Number of records in a collection.
    async fn count(&self, collection: &str) -> SolarflowResult<usize>;

    /// Replace a collection's entire contents.
    async fn replace_all(&self, collection: &str, records: &[Record]) -> SolarflowResult<()>;
}

// ============================================================================
// EXPORT / IMPORT
// ============================================================================

/// Wholesale snapshot of every collection, for backup or migration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreExport {
    /// When the export was taken.
    pub exported_at: Timestamp,
    /// Records per collection, keyed by collection name.
    pub collections: BTreeMap<String, Vec<Record>>,
}

// ============================================================================
// DATA STORE
// ============================================================================

/// Facade over the active backend.
///
/// Validates collections against the registry, assigns ids and timestamps,
/// serializes writes per collection, and broadcasts a [`ChangeEvent`] for
/// every successful mutation.
pub struct DataStore {
    backend: Arc<dyn StoreBackend>,
    flat: Arc<FlatFileBackend>,
    kind: BackendKind,
    fallback_reason: Option<String>,
    write_locks: StdMutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    events_tx: broadcast::Sender<ChangeEvent>,
}

impl DataStore {
    /// Open both backends and pick the active one.
    ///
    /// The flat file must open; without it neither fallback records nor
    /// snapshots work. The structured backend is attempted once: if it fails
    /// here, the store runs on the flat backend until disposed, even if the
    /// underlying problem clears up later.
    pub fn init(config: &StoreConfig) -> SolarflowResult<Self> {
        config.validate()?;

        let flat = Arc::new(FlatFileBackend::open(config.flat_path())?);

        let (backend, kind, fallback_reason): (Arc<dyn StoreBackend>, BackendKind, Option<String>) =
            match LmdbBackend::open(config.lmdb_dir(), config.lmdb_max_size_mb) {
                Ok(structured) => {
                    info!(
                        path = %config.lmdb_dir().display(),
                        "Structured backend ready"
                    );
                    (Arc::new(structured), BackendKind::Structured, None)
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        "Structured backend unavailable; serving from flat store for this session"
                    );
                    (flat.clone(), BackendKind::Flat, Some(e.to_string()))
                }
            };

        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            backend,
            flat,
            kind,
            fallback_reason,
            write_locks: StdMutex::new(HashMap::new()),
            events_tx,
        })
    }

    /// Which backend is serving records.
    pub fn backend_kind(&self) -> BackendKind {
        self.kind
    }

    /// Why the structured backend was rejected at init, if it was.
    pub fn fallback_reason(&self) -> Option<&str> {
        self.fallback_reason.as_deref()
    }

    /// Snapshot persistence rooted in the flat document.
    pub fn snapshots(&self) -> SnapshotStore {
        SnapshotStore::new(self.flat.clone())
    }

    /// Subscribe to change events for all collections.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ChangeEvent> {
        self.events_tx.subscribe()
    }

    /// Release the store. Backends close when the last reference drops.
    pub fn dispose(self) {
        info!(backend = %self.kind, "Store disposed");
    }

    fn ensure_collection(collection: &str) -> SolarflowResult<&'static Collection> {
        solarflow_core::collection(collection).ok_or_else(|| {
            SolarflowError::Store(StoreError::UnknownCollection {
                collection: collection.to_string(),
            })
        })
    }

    fn collection_lock(&self, collection: &str) -> SolarflowResult<Arc<tokio::sync::Mutex<()>>> {
        let mut locks = self.write_locks.lock().map_err(|_| {
            SolarflowError::Store(StoreError::Transaction {
                reason: "write lock registry poisoned".to_string(),
            })
        })?;
        Ok(locks.entry(collection.to_string()).or_default().clone())
    }

    /// Caller-provided string ids win; anything else gets a generated id.
    fn assign_id(payload: &serde_json::Value) -> String {
        payload
            .get("id")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(new_record_id)
    }

    fn emit(&self, op: ChangeOp, collection: &str, record: &Record) {
        // Send fails only when nobody is subscribed.
        let _ = self
            .events_tx
            .send(ChangeEvent::new(op, collection, record.clone()));
    }

    /// Insert a new record. The payload's `id` field is honored when it is a
    /// string; otherwise an id is generated. Inserting an existing id fails.
    pub async fn create(
        &self,
        collection: &str,
        payload: serde_json::Value,
    ) -> SolarflowResult<Record> {
        Self::ensure_collection(collection)?;
        let lock = self.collection_lock(collection)?;
        let _guard = lock.lock().await;

        let id = Self::assign_id(&payload);
        if self.backend.get(collection, &id).await?.is_some() {
            return Err(StoreError::DuplicateId {
                collection: collection.to_string(),
                id,
            }
            .into());
        }

        let record = Record::new(id, payload);
        self.backend.put(collection, &record).await?;
        debug!(collection = %collection, id = %record.id, "Record created");
        self.emit(ChangeOp::Create, collection, &record);
        Ok(record)
    }

    /// Fetch a record by id. Missing records yield `None`, not an error.
    pub async fn read(&self, collection: &str, id: &str) -> SolarflowResult<Option<Record>> {
        Self::ensure_collection(collection)?;
        self.backend.get(collection, id).await
    }

    /// Replace a record's payload. `created_at` survives, `updated_at` is
    /// stamped now. Missing records are an error.
    pub async fn update(
        &self,
        collection: &str,
        id: &str,
        payload: serde_json::Value,
    ) -> SolarflowResult<Record> {
        Self::ensure_collection(collection)?;
        let lock = self.collection_lock(collection)?;
        let _guard = lock.lock().await;

        let existing = self.backend.get(collection, id).await?.ok_or_else(|| {
            SolarflowError::Store(StoreError::RecordNotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            })
        })?;

        let record = Record {
            id: id.to_string(),
            payload,
            created_at: existing.created_at,
            updated_at: Utc::now(),
        };
        self.backend.put(collection, &record).await?;
        debug!(collection = %collection, id = %record.id, "Record updated");
        self.emit(ChangeOp::Update, collection, &record);
        Ok(record)
    }

    /// Delete a record. Deleting a missing id is a no-op that returns `false`
    /// and emits no event.
    pub async fn delete(&self, collection: &str, id: &str) -> SolarflowResult<bool> {
        Self::ensure_collection(collection)?;
        let lock = self.collection_lock(collection)?;
        let _guard = lock.lock().await;

        let Some(existing) = self.backend.get(collection, id).await? else {
            return Ok(false);
        };
        self.backend.remove(collection, id).await?;
        debug!(collection = %collection, id = %id, "Record deleted");
        self.emit(ChangeOp::Delete, collection, &existing);
        Ok(true)
    }

    /// All records in a collection.
    pub async fn list(&self, collection: &str) -> SolarflowResult<Vec<Record>> {
        Self::ensure_collection(collection)?;
        self.backend.list(collection).await
    }

    /// Single-field equality query. The field must be indexed in the
    /// registry; both backends return the same set of records for the same
    /// data, though their ordering may differ.
    pub async fn query(
        &self,
        collection: &str,
        field: &str,
        value: &serde_json::Value,
    ) -> SolarflowResult<Vec<Record>> {
        Self::ensure_collection(collection)?;
        self.backend.find_by_field(collection, field, value).await
    }

    /// Insert initial payloads into an empty collection. If the collection
    /// already holds records the seed is skipped entirely and `0` is
    /// returned. Each inserted record emits a create event.
    pub async fn seed(
        &self,
        collection: &str,
        payloads: Vec<serde_json::Value>,
    ) -> SolarflowResult<usize> {
        Self::ensure_collection(collection)?;
        let lock = self.collection_lock(collection)?;
        let _guard = lock.lock().await;

        if self.backend.count(collection).await? > 0 {
            debug!(collection = %collection, "Seed skipped; collection already populated");
            return Ok(0);
        }

        let mut inserted = 0;
        for payload in payloads {
            let id = Self::assign_id(&payload);
            let record = Record::new(id, payload);
            self.backend.put(collection, &record).await?;
            self.emit(ChangeOp::Create, collection, &record);
            inserted += 1;
        }
        info!(collection = %collection, count = inserted, "Collection seeded");
        Ok(inserted)
    }

    /// Export every registered collection.
    pub async fn export_all(&self) -> SolarflowResult<StoreExport> {
        let mut collections = BTreeMap::new();
        for c in COLLECTIONS {
            collections.insert(c.name.to_string(), self.backend.list(c.name).await?);
        }
        Ok(StoreExport {
            exported_at: Utc::now(),
            collections,
        })
    }

    /// Replace collection contents from an export. All collection names are
    /// validated before anything is written, so an export naming an unknown
    /// collection changes nothing. Imports emit no change events.
    pub async fn import_all(&self, export: &StoreExport) -> SolarflowResult<()> {
        for name in export.collections.keys() {
            Self::ensure_collection(name)?;
        }
        for (name, records) in &export.collections {
            let lock = self.collection_lock(name)?;
            let _guard = lock.lock().await;
            self.backend.replace_all(name, records).await?;
        }
        info!(collections = export.collections.len(), "Import complete");
        Ok(())
    }

    /// Probe the active backend with a cheap read.
    pub async fn health(&self) -> HealthCheck {
        let started = std::time::Instant::now();
        let probe = self.backend.count("system_logs").await;
        let elapsed_ms = started.elapsed().as_millis() as i64;

        let check = match probe {
            Ok(_) => match self.kind {
                BackendKind::Structured => HealthCheck::healthy("store"),
                BackendKind::Flat => {
                    let reason = self
                        .fallback_reason
                        .clone()
                        .unwrap_or_else(|| "structured backend inactive".to_string());
                    HealthCheck::degraded("store", format!("flat fallback active: {reason}"))
                }
            },
            Err(e) => HealthCheck::unhealthy("store", e.to_string()),
        };
        check
            .with_response_time(elapsed_ms)
            .with_metadata("backend", serde_json::json!(self.kind.to_string()))
    }
}

impl std::fmt::Debug for DataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataStore")
            .field("kind", &self.kind)
            .field("fallback_reason", &self.fallback_reason)
            .finish_non_exhaustive()
    }
}
