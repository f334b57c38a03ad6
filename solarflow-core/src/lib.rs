//! SOLARFLOW Core - Shared Types
//!
//! Data types, error taxonomy, and configuration shared by every SOLARFLOW
//! crate. No storage engines or network clients live here; the store and
//! loader crates depend on this one, never the other way around.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Record identifier: `<unix_millis>_<hex suffix>`.
///
/// The millisecond prefix keeps ids sortable by creation time; the suffix is
/// the random tail of a UUIDv7, so two ids minted in the same millisecond
/// still never collide.
pub type RecordId = String;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Generate a new record id.
pub fn new_record_id() -> RecordId {
    let millis = Utc::now().timestamp_millis();
    let hex = Uuid::now_v7().simple().to_string();
    // The last 12 hex chars of a v7 UUID are random bits.
    format!("{}_{}", millis, &hex[hex.len() - 12..])
}

// ============================================================================
// RECORDS & CHANGE EVENTS
// ============================================================================

/// A persisted record within a named collection.
///
/// The payload is opaque structured data; the store stamps `created_at` on
/// insert and re-stamps `updated_at` on every full-replace update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub payload: serde_json::Value,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Record {
    /// Create a record stamped with the current time.
    pub fn new(id: RecordId, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id,
            payload,
            created_at: now,
            updated_at: now,
        }
    }

    /// Look up a top-level payload field.
    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.payload.get(name)
    }
}

/// Mutation kind carried on a store change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    Create,
    Update,
    Delete,
}

/// Notification emitted by the store after a committed mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub op: ChangeOp,
    pub collection: String,
    pub record: Record,
    pub timestamp: Timestamp,
}

impl ChangeEvent {
    pub fn new(op: ChangeOp, collection: impl Into<String>, record: Record) -> Self {
        Self {
            op,
            collection: collection.into(),
            record,
            timestamp: Utc::now(),
        }
    }
}

// ============================================================================
// RESOURCE VOCABULARY
// ============================================================================

/// Where a cached resource value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheOrigin {
    /// Fresh retrieval from the resource locator.
    Network,
    /// Last-known-good snapshot served after retrieval failed.
    Fallback,
    /// Caller-supplied override or seed data.
    Seed,
}

/// Which persistence strategy a store is running on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Indexed, schema-aware backend.
    Structured,
    /// Plain key-value backend with no native indexing.
    Flat,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Structured => write!(f, "structured"),
            BackendKind::Flat => write!(f, "flat"),
        }
    }
}

// ============================================================================
// COLLECTION REGISTRY
// ============================================================================

/// Schema entry for one named collection.
///
/// `indexed_fields` are top-level payload fields the structured backend
/// maintains equality indexes for; `query()` accepts only these fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Collection {
    pub name: &'static str,
    pub indexed_fields: &'static [&'static str],
}

/// The fixed set of collections both backends are built from.
pub const COLLECTIONS: &[Collection] = &[
    Collection {
        name: "minions",
        indexed_fields: &["name", "role"],
    },
    Collection {
        name: "messages",
        indexed_fields: &["from", "to"],
    },
    Collection {
        name: "tasks",
        indexed_fields: &["owner", "status"],
    },
    Collection {
        name: "shifts",
        indexed_fields: &[],
    },
    Collection {
        name: "economics",
        indexed_fields: &[],
    },
    Collection {
        name: "solar_metrics",
        indexed_fields: &[],
    },
    Collection {
        name: "threats",
        indexed_fields: &[],
    },
    Collection {
        name: "knowledge",
        indexed_fields: &[],
    },
    Collection {
        name: "ai_memory",
        indexed_fields: &[],
    },
    Collection {
        name: "system_logs",
        indexed_fields: &[],
    },
];

/// Look up a collection's schema entry by name.
pub fn collection(name: &str) -> Option<&'static Collection> {
    COLLECTIONS.iter().find(|c| c.name == name)
}

/// Whether `field` is a declared index on `collection_name`.
pub fn is_indexed_field(collection_name: &str, field: &str) -> bool {
    collection(collection_name).map_or(false, |c| c.indexed_fields.contains(&field))
}

// ============================================================================
// HEALTH
// ============================================================================

/// Health status for a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Component is fully operational
    Healthy,
    /// Component is operational but degraded
    Degraded,
    /// Component is not operational
    Unhealthy,
}

/// Detailed health check result for a component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub status: HealthStatus,
    pub component: String,
    pub message: Option<String>,
    pub response_time_ms: Option<i64>,
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

impl HealthCheck {
    /// Create a healthy check result.
    pub fn healthy(component: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Healthy,
            component: component.into(),
            message: None,
            response_time_ms: None,
            metadata: None,
        }
    }

    /// Create a degraded check result.
    pub fn degraded(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Degraded,
            component: component.into(),
            message: Some(message.into()),
            response_time_ms: None,
            metadata: None,
        }
    }

    /// Create an unhealthy check result.
    pub fn unhealthy(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            component: component.into(),
            message: Some(message.into()),
            response_time_ms: None,
            metadata: None,
        }
    }

    /// Set the response time.
    pub fn with_response_time(mut self, ms: i64) -> Self {
        self.response_time_ms = Some(ms);
        self
    }

    /// Add metadata.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value);
        self
    }
}

// ============================================================================
// SNAPSHOT PERSISTENCE
// ============================================================================

/// Persistence seam for last-known-good resource snapshots.
///
/// The loader writes a snapshot on every caller-supplied `update` and reads
/// one back when a retrieval exhausts its retries. Implementations namespace
/// keys so snapshots never collide with collection data.
#[async_trait::async_trait]
pub trait SnapshotPersistence: Send + Sync {
    /// Persist `value` as the snapshot for `key`, replacing any previous one.
    async fn save_snapshot(&self, key: &str, value: &serde_json::Value) -> SolarflowResult<()>;

    /// Load the snapshot for `key`, or `None` if none was ever saved.
    async fn load_snapshot(&self, key: &str) -> SolarflowResult<Option<serde_json::Value>>;
}

// ============================================================================
// ERRORS
// ============================================================================

/// Transport-level retrieval errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NetworkError {
    #[error("Request to {url} failed: {reason}")]
    RequestFailed { url: String, reason: String },

    #[error("Request to {url} returned status {status}")]
    BadStatus { url: String, status: u16 },

    #[error("Response from {url} could not be decoded: {reason}")]
    DecodeFailed { url: String, reason: String },

    #[error("HTTP client construction failed: {reason}")]
    ClientBuild { reason: String },
}

/// Payload validation errors. Never retried: the same payload would fail
/// the same check again.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Payload shape mismatch: expected {expected}")]
    ShapeMismatch { expected: String },
}

/// A single attempt exceeded its time bound.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TimeoutError {
    #[error("{operation} timed out after {timeout_ms}ms")]
    Elapsed { operation: String, timeout_ms: u64 },
}

/// Persistence layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Structured backend unavailable: {reason}")]
    BackendUnavailable { reason: String },

    #[error("Unknown collection: {collection}")]
    UnknownCollection { collection: String },

    #[error("Record {id} not found in {collection}")]
    RecordNotFound { collection: String, id: String },

    #[error("Record {id} already exists in {collection}")]
    DuplicateId { collection: String, id: String },

    #[error("Field {field} is not indexed on {collection}")]
    FieldNotIndexed { collection: String, field: String },

    #[error("Serialization failed: {reason}")]
    Serialization { reason: String },

    #[error("Transaction failed: {reason}")]
    Transaction { reason: String },

    #[error("Store I/O failed: {reason}")]
    Io { reason: String },
}

/// Aggregated failure after a bounded retry run.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RetryError {
    #[error("All {attempts} attempts of {operation} failed; last error: {last}")]
    Exhausted {
        operation: String,
        attempts: u32,
        last: Box<SolarflowError>,
    },
}

/// Loader coordination errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LoaderError {
    #[error("Load for {key} was interrupted: {reason}")]
    Interrupted { key: String, reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to read config file {path}: {reason}")]
    FileRead { path: String, reason: String },

    #[error("Failed to parse config: {reason}")]
    Parse { reason: String },
}

/// Master error type for all SOLARFLOW errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SolarflowError {
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Timeout: {0}")]
    Timeout(#[from] TimeoutError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Retry error: {0}")]
    Retry(#[from] RetryError),

    #[error("Loader error: {0}")]
    Loader(#[from] LoaderError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl SolarflowError {
    /// Whether another attempt could plausibly succeed.
    ///
    /// Transport and timeout failures are transient; everything else fails
    /// the same way on every attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout(_))
    }
}

/// Result type alias for SOLARFLOW operations.
pub type SolarflowResult<T> = Result<T, SolarflowError>;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Bounded retry with exponential backoff and a per-attempt timeout.
///
/// The delay after failed attempt `i` is `base_delay_ms * 2^i`, capped at
/// `max_delay_ms`, with up to `jitter_ms` of random extra delay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RetryConfig {
    pub attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub attempt_timeout_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 10_000,
            attempt_timeout_ms: 5_000,
            jitter_ms: 0,
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_base_delay_ms(mut self, ms: u64) -> Self {
        self.base_delay_ms = ms;
        self
    }

    pub fn with_max_delay_ms(mut self, ms: u64) -> Self {
        self.max_delay_ms = ms;
        self
    }

    pub fn with_attempt_timeout_ms(mut self, ms: u64) -> Self {
        self.attempt_timeout_ms = ms;
        self
    }

    pub fn with_jitter_ms(mut self, ms: u64) -> Self {
        self.jitter_ms = ms;
        self
    }

    /// Validate the retry parameters.
    pub fn validate(&self) -> SolarflowResult<()> {
        if self.attempts == 0 {
            return Err(SolarflowError::Config(ConfigError::InvalidValue {
                field: "attempts".to_string(),
                value: self.attempts.to_string(),
                reason: "attempts must be at least 1".to_string(),
            }));
        }

        if self.attempt_timeout_ms == 0 {
            return Err(SolarflowError::Config(ConfigError::InvalidValue {
                field: "attempt_timeout_ms".to_string(),
                value: self.attempt_timeout_ms.to_string(),
                reason: "attempt_timeout_ms must be positive".to_string(),
            }));
        }

        if self.max_delay_ms < self.base_delay_ms {
            return Err(SolarflowError::Config(ConfigError::InvalidValue {
                field: "max_delay_ms".to_string(),
                value: self.max_delay_ms.to_string(),
                reason: "max_delay_ms must be at least base_delay_ms".to_string(),
            }));
        }

        Ok(())
    }
}

/// Loader configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct LoaderConfig {
    pub retry: RetryConfig,
}

impl LoaderConfig {
    pub fn validate(&self) -> SolarflowResult<()> {
        self.retry.validate()
    }
}

/// Store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct StoreConfig {
    /// Directory holding both the structured environment and the flat file.
    pub data_dir: PathBuf,
    /// Maximum size of the structured backend's environment, in megabytes.
    pub lmdb_max_size_mb: usize,
    /// File name of the flat backend's state document, under `data_dir`.
    pub flat_file_name: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("solarflow-data"),
            lmdb_max_size_mb: 64,
            flat_file_name: "flat-store.json".to_string(),
        }
    }
}

impl StoreConfig {
    /// Directory the structured backend opens its environment in.
    pub fn lmdb_dir(&self) -> PathBuf {
        self.data_dir.join("lmdb")
    }

    /// Full path of the flat backend's state document.
    pub fn flat_path(&self) -> PathBuf {
        self.data_dir.join(&self.flat_file_name)
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    /// Validate the store parameters.
    pub fn validate(&self) -> SolarflowResult<()> {
        if self.lmdb_max_size_mb == 0 {
            return Err(SolarflowError::Config(ConfigError::InvalidValue {
                field: "lmdb_max_size_mb".to_string(),
                value: self.lmdb_max_size_mb.to_string(),
                reason: "lmdb_max_size_mb must be at least 1".to_string(),
            }));
        }

        if self.flat_file_name.is_empty() {
            return Err(SolarflowError::Config(ConfigError::InvalidValue {
                field: "flat_file_name".to_string(),
                value: self.flat_file_name.clone(),
                reason: "flat_file_name must not be empty".to_string(),
            }));
        }

        Ok(())
    }
}

/// Master configuration struct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct SolarflowConfig {
    pub loader: LoaderConfig,
    pub store: StoreConfig,
}

impl SolarflowConfig {
    /// Parse a configuration from TOML text and validate it.
    pub fn from_toml_str(text: &str) -> SolarflowResult<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| ConfigError::Parse {
                reason: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse, and validate a TOML configuration file.
    pub fn from_file(path: &Path) -> SolarflowResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&text)
    }

    /// Validate all sections.
    pub fn validate(&self) -> SolarflowResult<()> {
        self.loader.validate()?;
        self.store.validate()?;
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_record_id_format() {
        let id = new_record_id();
        let (millis, suffix) = id.split_once('_').expect("id should contain a separator");
        assert!(millis.parse::<i64>().unwrap() > 1_600_000_000_000);
        assert_eq!(suffix.len(), 12);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_record_ids_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(new_record_id()));
        }
    }

    #[test]
    fn test_record_ids_are_sortable() {
        let a = new_record_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = new_record_id();
        assert!(a < b);
    }

    #[test]
    fn test_record_new_stamps_timestamps() {
        let record = Record::new("r1".to_string(), json!({"name": "Aurora"}));
        assert_eq!(record.created_at, record.updated_at);
        assert_eq!(record.field("name"), Some(&json!("Aurora")));
        assert_eq!(record.field("missing"), None);
    }

    #[test]
    fn test_change_event_serializes_lowercase_op() {
        let record = Record::new("r1".to_string(), json!({}));
        let event = ChangeEvent::new(ChangeOp::Create, "minions", record);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["op"], json!("create"));
        assert_eq!(value["collection"], json!("minions"));
    }

    #[test]
    fn test_cache_origin_serde_round_trip() {
        let text = serde_json::to_string(&CacheOrigin::Fallback).unwrap();
        assert_eq!(text, "\"fallback\"");
        let back: CacheOrigin = serde_json::from_str(&text).unwrap();
        assert_eq!(back, CacheOrigin::Fallback);
    }

    #[test]
    fn test_backend_kind_display() {
        assert_eq!(BackendKind::Structured.to_string(), "structured");
        assert_eq!(BackendKind::Flat.to_string(), "flat");
    }

    #[test]
    fn test_collection_registry_contents() {
        assert_eq!(COLLECTIONS.len(), 10);

        let minions = collection("minions").unwrap();
        assert_eq!(minions.indexed_fields, &["name", "role"]);

        let tasks = collection("tasks").unwrap();
        assert_eq!(tasks.indexed_fields, &["owner", "status"]);

        assert!(collection("shifts").unwrap().indexed_fields.is_empty());
        assert!(collection("nonexistent").is_none());
    }

    #[test]
    fn test_is_indexed_field() {
        assert!(is_indexed_field("minions", "name"));
        assert!(is_indexed_field("messages", "from"));
        assert!(!is_indexed_field("minions", "tier"));
        assert!(!is_indexed_field("shifts", "name"));
        assert!(!is_indexed_field("nonexistent", "name"));
    }

    #[test]
    fn test_health_check_constructors() {
        let healthy = HealthCheck::healthy("store");
        assert_eq!(healthy.status, HealthStatus::Healthy);
        assert!(healthy.message.is_none());

        let degraded = HealthCheck::degraded("store", "running on flat backend")
            .with_response_time(5)
            .with_metadata("backend", json!("flat"));
        assert_eq!(degraded.status, HealthStatus::Degraded);
        assert_eq!(degraded.response_time_ms, Some(5));
        assert_eq!(degraded.metadata.unwrap()["backend"], json!("flat"));
    }

    #[test]
    fn test_network_error_display_bad_status() {
        let err = NetworkError::BadStatus {
            url: "data/minions.json".to_string(),
            status: 503,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("data/minions.json"));
        assert!(msg.contains("503"));
    }

    #[test]
    fn test_validation_error_display_shape_mismatch() {
        let err = ValidationError::ShapeMismatch {
            expected: "{ minions: [...] }".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("shape mismatch"));
        assert!(msg.contains("{ minions: [...] }"));
    }

    #[test]
    fn test_timeout_error_display() {
        let err = TimeoutError::Elapsed {
            operation: "load minions".to_string(),
            timeout_ms: 5000,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("load minions"));
        assert!(msg.contains("5000"));
    }

    #[test]
    fn test_store_error_display_record_not_found() {
        let err = StoreError::RecordNotFound {
            collection: "minions".to_string(),
            id: "m1".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("m1"));
        assert!(msg.contains("minions"));
    }

    #[test]
    fn test_retry_error_display_carries_last_error() {
        let last = SolarflowError::Timeout(TimeoutError::Elapsed {
            operation: "load minions".to_string(),
            timeout_ms: 100,
        });
        let err = RetryError::Exhausted {
            operation: "load minions".to_string(),
            attempts: 3,
            last: Box::new(last),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("All 3 attempts"));
        assert!(msg.contains("timed out after 100ms"));
    }

    #[test]
    fn test_solarflow_error_from_variants() {
        let network = SolarflowError::from(NetworkError::BadStatus {
            url: "x".to_string(),
            status: 500,
        });
        assert!(matches!(network, SolarflowError::Network(_)));

        let validation = SolarflowError::from(ValidationError::RequiredFieldMissing {
            field: "name".to_string(),
        });
        assert!(matches!(validation, SolarflowError::Validation(_)));

        let store = SolarflowError::from(StoreError::BackendUnavailable {
            reason: "corrupt".to_string(),
        });
        assert!(matches!(store, SolarflowError::Store(_)));

        let config = SolarflowError::from(ConfigError::MissingRequired {
            field: "data_dir".to_string(),
        });
        assert!(matches!(config, SolarflowError::Config(_)));

        let loader = SolarflowError::from(LoaderError::Interrupted {
            key: "minions".to_string(),
            reason: "disposed".to_string(),
        });
        assert!(matches!(loader, SolarflowError::Loader(_)));
    }

    #[test]
    fn test_is_retryable_classification() {
        let network: SolarflowError = NetworkError::BadStatus {
            url: "x".to_string(),
            status: 502,
        }
        .into();
        let timeout: SolarflowError = TimeoutError::Elapsed {
            operation: "x".to_string(),
            timeout_ms: 1,
        }
        .into();
        let validation: SolarflowError = ValidationError::ShapeMismatch {
            expected: "array".to_string(),
        }
        .into();
        let store: SolarflowError = StoreError::Transaction {
            reason: "x".to_string(),
        }
        .into();

        assert!(network.is_retryable());
        assert!(timeout.is_retryable());
        assert!(!validation.is_retryable());
        assert!(!store.is_retryable());
    }

    #[test]
    fn test_retry_config_defaults() {
        let config = RetryConfig::default();
        assert_eq!(config.attempts, 3);
        assert_eq!(config.base_delay_ms, 100);
        assert_eq!(config.max_delay_ms, 10_000);
        assert_eq!(config.attempt_timeout_ms, 5_000);
        assert_eq!(config.jitter_ms, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_retry_config_rejects_zero_attempts() {
        let config = RetryConfig::default().with_attempts(0);
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            SolarflowError::Config(ConfigError::InvalidValue { ref field, .. }) if field == "attempts"
        ));
    }

    #[test]
    fn test_retry_config_rejects_cap_below_base() {
        let mut config = RetryConfig::default();
        config.base_delay_ms = 500;
        config.max_delay_ms = 100;
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            SolarflowError::Config(ConfigError::InvalidValue { ref field, .. }) if field == "max_delay_ms"
        ));
    }

    #[test]
    fn test_store_config_paths() {
        let config = StoreConfig::default().with_data_dir("/tmp/sf");
        assert_eq!(config.lmdb_dir(), PathBuf::from("/tmp/sf/lmdb"));
        assert_eq!(config.flat_path(), PathBuf::from("/tmp/sf/flat-store.json"));
    }

    #[test]
    fn test_store_config_rejects_zero_map_size() {
        let mut config = StoreConfig::default();
        config.lmdb_max_size_mb = 0;
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            SolarflowError::Config(ConfigError::InvalidValue { ref field, .. })
                if field == "lmdb_max_size_mb"
        ));
    }

    #[test]
    fn test_config_from_toml_partial_fills_defaults() {
        let config = SolarflowConfig::from_toml_str(
            r#"
            [loader.retry]
            attempts = 5
            base_delay_ms = 50

            [store]
            lmdb_max_size_mb = 16
            "#,
        )
        .unwrap();

        assert_eq!(config.loader.retry.attempts, 5);
        assert_eq!(config.loader.retry.base_delay_ms, 50);
        assert_eq!(config.loader.retry.max_delay_ms, 10_000);
        assert_eq!(config.store.lmdb_max_size_mb, 16);
        assert_eq!(config.store.flat_file_name, "flat-store.json");
    }

    #[test]
    fn test_config_from_toml_rejects_unknown_field() {
        let err = SolarflowConfig::from_toml_str(
            r#"
            [store]
            map_size = 16
            "#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            SolarflowError::Config(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_config_from_toml_rejects_invalid_values() {
        let err = SolarflowConfig::from_toml_str(
            r#"
            [loader.retry]
            attempts = 0
            "#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            SolarflowError::Config(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_config_from_file_missing_path() {
        let err =
            SolarflowConfig::from_file(Path::new("/nonexistent/solarflow.toml")).unwrap_err();
        assert!(matches!(
            err,
            SolarflowError::Config(ConfigError::FileRead { .. })
        ));
    }
}

// ============================================================================
// PROPERTY-BASED TESTS
// ============================================================================
