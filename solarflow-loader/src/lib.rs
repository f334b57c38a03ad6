//! SOLARFLOW Loader - Coalescing Resource Acquisition
//!
//! Read-through loading for keyed JSON resources: an in-memory cache with
//! origin tagging, a retry guard with per-attempt timeouts, pluggable
//! fetchers, and fallback to persisted snapshots when retrieval is exhausted.
//! Concurrent loads of the same key share a single retrieval and a single
//! outcome.

pub mod cache;
pub mod fetch;
pub mod loader;
pub mod retry;
pub mod transform;

pub use cache::{CacheEntry, CacheStats, ResourceCache};
pub use fetch::{FetchScript, FileFetcher, HttpFetcher, ResourceFetcher, StaticFetcher};
pub use loader::{
    CoalescingLoader, LoaderStatus, NoSnapshots, NotifyDiagnostics, ResourceUpdate, SubscriberFn,
    SubscriptionHandle,
};
pub use retry::RetryTimeoutGuard;
pub use transform::TransformFn;
