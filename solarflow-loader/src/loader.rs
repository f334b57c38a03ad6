//! Coalescing resource loader.
//!
//! One retrieval per key at a time: the first load starts a driver task,
//! later loads attach to it, and everyone shares the single outcome. Results
//! commit to the cache with their origin, subscribers are notified in commit
//! order, and exhausted retrievals fall back to the last persisted snapshot
//! when one exists.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use solarflow_core::{
    CacheOrigin, LoaderConfig, LoaderError, SnapshotPersistence, SolarflowError, SolarflowResult,
};

use crate::cache::{CacheStats, ResourceCache};
use crate::fetch::ResourceFetcher;
use crate::retry::RetryTimeoutGuard;
use crate::transform::TransformFn;

// ============================================================================
// PUBLIC TYPES
// ============================================================================

/// A committed resource value, as delivered to load callers and subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceUpdate {
    pub key: String,
    pub value: serde_json::Value,
    pub origin: CacheOrigin,
}

/// Subscriber callback.
///
/// Runs synchronously on the committing task with the loader's internal lock
/// held, which is what guarantees commit-order delivery. The callback must
/// not call back into the loader; hand work to a channel or task instead.
/// Returned errors are recorded in the loader's notification diagnostics.
pub type SubscriberFn = Arc<dyn Fn(&ResourceUpdate) -> Result<(), String> + Send + Sync>;

/// Accumulated subscriber-callback failures for one key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotifyDiagnostics {
    pub failure_count: u64,
    pub last_error: Option<String>,
}

/// Point-in-time view of the loader's internals.
#[derive(Debug, Clone, PartialEq)]
pub struct LoaderStatus {
    pub cached_keys: Vec<String>,
    pub in_flight_keys: Vec<String>,
    pub subscriber_counts: HashMap<String, usize>,
    pub cache_stats: CacheStats,
}

/// Snapshot persistence that never stores anything. For loaders that run
/// without a backing store.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSnapshots;

#[async_trait::async_trait]
impl SnapshotPersistence for NoSnapshots {
    async fn save_snapshot(&self, _key: &str, _value: &serde_json::Value) -> SolarflowResult<()> {
        Ok(())
    }

    async fn load_snapshot(&self, _key: &str) -> SolarflowResult<Option<serde_json::Value>> {
        Ok(None)
    }
}

// ============================================================================
// INTERNALS
// ============================================================================

struct InFlight {
    generation: u64,
    waiters: Vec<oneshot::Sender<SolarflowResult<ResourceUpdate>>>,
}

struct Inner {
    cache: ResourceCache,
    in_flight: HashMap<String, InFlight>,
    subscribers: HashMap<String, Vec<(u64, SubscriberFn)>>,
    diagnostics: HashMap<String, NotifyDiagnostics>,
    next_token: u64,
}

impl Inner {
    fn new() -> Self {
        Self {
            cache: ResourceCache::new(),
            in_flight: HashMap::new(),
            subscribers: HashMap::new(),
            diagnostics: HashMap::new(),
            next_token: 0,
        }
    }
}

// ============================================================================
// LOADER
// ============================================================================

/// Read-through resource loader with request coalescing.
#[derive(Clone)]
pub struct CoalescingLoader {
    inner: Arc<StdMutex<Inner>>,
    fetcher: Arc<dyn ResourceFetcher>,
    snapshots: Arc<dyn SnapshotPersistence>,
    transforms: HashMap<String, TransformFn>,
    guard: RetryTimeoutGuard,
}

impl CoalescingLoader {
    pub fn new(
        config: LoaderConfig,
        fetcher: Arc<dyn ResourceFetcher>,
        snapshots: Arc<dyn SnapshotPersistence>,
    ) -> Self {
        Self {
            inner: Arc::new(StdMutex::new(Inner::new())),
            fetcher,
            snapshots,
            transforms: HashMap::new(),
            guard: RetryTimeoutGuard::new(config.retry),
        }
    }

    /// Register a transform for one key. Call before the loader is shared;
    /// transforms are fixed per instance.
    pub fn with_transform(mut self, key: impl Into<String>, transform: TransformFn) -> Self {
        self.transforms.insert(key.into(), transform);
        self
    }

    // A poisoned lock means a subscriber callback panicked mid-notify. The
    // state itself is still consistent, so recover it.
    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Load `key`, serving from cache when possible and otherwise sharing the
    /// single in-flight retrieval for the key.
    pub async fn load(&self, key: &str) -> SolarflowResult<ResourceUpdate> {
        let rx = {
            let mut inner = self.lock_inner();

            if let Some(entry) = inner.cache.lookup(key) {
                debug!(key = %key, origin = ?entry.origin, "Cache hit");
                return Ok(ResourceUpdate {
                    key: key.to_string(),
                    value: entry.value.clone(),
                    origin: entry.origin,
                });
            }

            let (tx, rx) = oneshot::channel();
            match inner.in_flight.get_mut(key) {
                Some(in_flight) => {
                    debug!(key = %key, "Joining in-flight retrieval");
                    in_flight.waiters.push(tx);
                }
                None => {
                    inner.next_token += 1;
                    let generation = inner.next_token;
                    inner.in_flight.insert(
                        key.to_string(),
                        InFlight {
                            generation,
                            waiters: vec![tx],
                        },
                    );
                    debug!(key = %key, "Starting retrieval");

                    let driver = self.clone();
                    let driver_key = key.to_string();
                    tokio::spawn(async move {
                        let outcome = driver.retrieve(&driver_key).await;
                        driver.complete(&driver_key, generation, outcome);
                    });
                }
            }
            rx
        };

        match rx.await {
            Ok(outcome) => outcome,
            // The loader was disposed while this retrieval was pending.
            Err(_) => Err(LoaderError::Interrupted {
                key: key.to_string(),
                reason: "retrieval abandoned before completion".to_string(),
            }
            .into()),
        }
    }

    /// Cached value for `key` without triggering a retrieval. Does not count
    /// toward the hit rate.
    pub fn cached(&self, key: &str) -> Option<ResourceUpdate> {
        let inner = self.lock_inner();
        inner.cache.peek(key).map(|entry| ResourceUpdate {
            key: key.to_string(),
            value: entry.value.clone(),
            origin: entry.origin,
        })
    }

    /// Replace `key`'s value directly. Commits with seed origin, persists a
    /// fallback snapshot, notifies subscribers, and resolves any waiters that
    /// were attached to a now-superseded retrieval.
    pub async fn update(
        &self,
        key: &str,
        value: serde_json::Value,
    ) -> SolarflowResult<ResourceUpdate> {
        let (update, superseded) = {
            let mut inner = self.lock_inner();
            let update = ResourceUpdate {
                key: key.to_string(),
                value: value.clone(),
                origin: CacheOrigin::Seed,
            };
            inner.cache.commit(key, value, CacheOrigin::Seed);
            let superseded = inner.in_flight.remove(key);
            info!(
                key = %key,
                superseded_retrieval = superseded.is_some(),
                "Resource updated in place"
            );
            Self::notify_locked(&mut inner, &update);
            (update, superseded)
        };

        if let Some(in_flight) = superseded {
            for waiter in in_flight.waiters {
                let _ = waiter.send(Ok(update.clone()));
            }
        }

        if let Err(e) = self.snapshots.save_snapshot(key, &update.value).await {
            warn!(key = %key, error = %e, "Failed to persist fallback snapshot");
        }

        Ok(update)
    }

    /// Register a subscriber for `key`. If a value is already cached the
    /// callback fires immediately with it.
    pub fn subscribe(&self, key: impl Into<String>, callback: SubscriberFn) -> SubscriptionHandle {
        let key = key.into();
        let mut inner = self.lock_inner();

        inner.next_token += 1;
        let token = inner.next_token;
        inner
            .subscribers
            .entry(key.clone())
            .or_default()
            .push((token, callback.clone()));
        debug!(key = %key, "Subscriber registered");

        if let Some(entry) = inner.cache.peek(&key) {
            let update = ResourceUpdate {
                key: key.clone(),
                value: entry.value.clone(),
                origin: entry.origin,
            };
            if let Err(reason) = callback(&update) {
                warn!(key = %key, error = %reason, "Subscriber callback failed");
                let diag = inner.diagnostics.entry(key.clone()).or_default();
                diag.failure_count += 1;
                diag.last_error = Some(reason);
            }
        }

        SubscriptionHandle {
            key,
            token,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Drop the cached entry for `key`. Snapshots and subscriptions survive;
    /// the next load goes back to the fetcher.
    pub fn clear(&self, key: &str) -> bool {
        let mut inner = self.lock_inner();
        let removed = inner.cache.remove(key);
        if removed {
            info!(key = %key, "Cache entry cleared");
        }
        removed
    }

    /// Drop every cached entry. Returns how many were removed.
    pub fn clear_all(&self) -> usize {
        let mut inner = self.lock_inner();
        let count = inner.cache.len();
        inner.cache.clear();
        info!(count, "Cache cleared");
        count
    }

    /// Cached keys, in-flight keys, subscriber counts, and cache counters.
    pub fn status(&self) -> LoaderStatus {
        let inner = self.lock_inner();
        let mut in_flight_keys: Vec<String> = inner.in_flight.keys().cloned().collect();
        in_flight_keys.sort_unstable();
        LoaderStatus {
            cached_keys: inner.cache.keys(),
            in_flight_keys,
            subscriber_counts: inner
                .subscribers
                .iter()
                .map(|(key, subs)| (key.clone(), subs.len()))
                .collect(),
            cache_stats: inner.cache.stats(),
        }
    }

    /// Subscriber-callback failure counters for `key`.
    pub fn notify_diagnostics(&self, key: &str) -> NotifyDiagnostics {
        self.lock_inner()
            .diagnostics
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    /// Drop cache, subscriptions, and pending waiters. Driver tasks still in
    /// flight find their generation gone and discard their results.
    pub fn dispose(&self) {
        let mut inner = self.lock_inner();
        let dropped_waiters: usize = inner.in_flight.values().map(|f| f.waiters.len()).sum();
        inner.cache.clear();
        inner.in_flight.clear();
        inner.subscribers.clear();
        inner.diagnostics.clear();
        info!(dropped_waiters, "Loader disposed");
    }

    // ------------------------------------------------------------------
    // Retrieval pipeline (driver task)
    // ------------------------------------------------------------------

    async fn retrieve(&self, key: &str) -> SolarflowResult<(serde_json::Value, CacheOrigin)> {
        let fetcher = self.fetcher.clone();
        let fetched = self
            .guard
            .run(key, || {
                let fetcher = fetcher.clone();
                let locator = key.to_string();
                async move { fetcher.fetch(&locator).await }
            })
            .await;

        match fetched {
            Ok(raw) => {
                let value = self.apply_transform(key, raw)?;
                Ok((value, CacheOrigin::Network))
            }
            // Only exhausted retries consult the snapshot; validation and
            // other terminal errors reject as-is.
            Err(error @ SolarflowError::Retry(_)) => self.fallback(key, error).await,
            Err(other) => Err(other),
        }
    }

    fn apply_transform(
        &self,
        key: &str,
        value: serde_json::Value,
    ) -> SolarflowResult<serde_json::Value> {
        match self.transforms.get(key) {
            Some(transform) => transform(value),
            None => Ok(value),
        }
    }

    async fn fallback(
        &self,
        key: &str,
        retrieval_error: SolarflowError,
    ) -> SolarflowResult<(serde_json::Value, CacheOrigin)> {
        match self.snapshots.load_snapshot(key).await {
            Ok(Some(snapshot)) => {
                warn!(
                    key = %key,
                    error = %retrieval_error,
                    "Retrieval exhausted; serving fallback snapshot"
                );
                Ok((snapshot, CacheOrigin::Fallback))
            }
            Ok(None) => Err(retrieval_error),
            Err(snapshot_error) => {
                warn!(key = %key, error = %snapshot_error, "Snapshot lookup failed");
                Err(retrieval_error)
            }
        }
    }

    /// Commit the driver's outcome, unless an update superseded it.
    fn complete(
        &self,
        key: &str,
        generation: u64,
        outcome: SolarflowResult<(serde_json::Value, CacheOrigin)>,
    ) {
        let (waiters, result) = {
            let mut inner = self.lock_inner();

            let in_flight = match inner.in_flight.remove(key) {
                Some(entry) if entry.generation == generation => entry,
                Some(newer) => {
                    // A newer retrieval owns this key; leave it untouched.
                    inner.in_flight.insert(key.to_string(), newer);
                    debug!(key = %key, "Discarding superseded retrieval result");
                    return;
                }
                None => {
                    debug!(key = %key, "Discarding superseded retrieval result");
                    return;
                }
            };

            match outcome {
                Ok((value, origin)) => {
                    let update = ResourceUpdate {
                        key: key.to_string(),
                        value: value.clone(),
                        origin,
                    };
                    inner.cache.commit(key, value, origin);
                    if origin == CacheOrigin::Fallback {
                        warn!(key = %key, "Operating on fallback data until the next successful load");
                    } else {
                        info!(key = %key, "Resource loaded");
                    }
                    Self::notify_locked(&mut inner, &update);
                    (in_flight.waiters, Ok(update))
                }
                Err(error) => {
                    warn!(key = %key, error = %error, "Retrieval failed for all waiters");
                    (in_flight.waiters, Err(error))
                }
            }
        };

        // Waiters resume outside the lock so they can immediately use the
        // loader again.
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }

    fn notify_locked(inner: &mut Inner, update: &ResourceUpdate) {
        let callbacks: Vec<SubscriberFn> = match inner.subscribers.get(&update.key) {
            Some(subscribers) => subscribers.iter().map(|(_, f)| f.clone()).collect(),
            None => return,
        };
        for callback in &callbacks {
            if let Err(reason) = callback(update) {
                warn!(key = %update.key, error = %reason, "Subscriber callback failed");
                let diag = inner.diagnostics.entry(update.key.clone()).or_default();
                diag.failure_count += 1;
                diag.last_error = Some(reason);
            }
        }
    }
}

impl std::fmt::Debug for CoalescingLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoalescingLoader")
            .field("transforms", &self.transforms.len())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// SUBSCRIPTION HANDLE
// ============================================================================

/// Handle for one subscription. Dropping it changes nothing; call
/// [`SubscriptionHandle::unsubscribe`] to stop deliveries.
pub struct SubscriptionHandle {
    key: String,
    token: u64,
    inner: Weak<StdMutex<Inner>>,
}

impl SubscriptionHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Remove this subscription. Returns whether it was still registered.
    pub fn unsubscribe(self) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return false;
        };
        let mut inner = inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(subscribers) = inner.subscribers.get_mut(&self.key) else {
            return false;
        };
        let before = subscribers.len();
        subscribers.retain(|(token, _)| *token != self.token);
        let removed = subscribers.len() != before;
        if subscribers.is_empty() {
            inner.subscribers.remove(&self.key);
        }
        if removed {
            debug!(key = %self.key, "Subscriber removed");
        }
        removed
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("key", &self.key)
            .field("token", &self.token)
            .finish()
    }
}
