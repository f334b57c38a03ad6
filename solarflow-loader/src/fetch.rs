//! Resource retrieval strategies.
//!
//! A [`ResourceFetcher`] turns a resource locator into a raw JSON value. The
//! loader never cares where the bytes came from; HTTP and file fetchers cover
//! production, [`StaticFetcher`] scripts exact sequences for tests.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use solarflow_core::{NetworkError, SolarflowError, SolarflowResult};

/// Connection establishment bound for the HTTP client. Per-request deadlines
/// belong to the retry guard, not the transport.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Retrieves the raw value behind a resource locator.
#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    async fn fetch(&self, locator: &str) -> SolarflowResult<serde_json::Value>;
}

// ============================================================================
// HTTP
// ============================================================================

/// Fetches JSON documents over HTTP.
pub struct HttpFetcher {
    client: reqwest::Client,
    base_url: Option<String>,
    cache_bust: bool,
}

impl HttpFetcher {
    pub fn new() -> SolarflowResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| NetworkError::ClientBuild {
                reason: e.to_string(),
            })?;
        Ok(Self {
            client,
            base_url: None,
            cache_bust: true,
        })
    }

    /// Prefix relative locators with `base`. Absolute `http(s)` locators are
    /// used as-is.
    pub fn with_base_url(mut self, base: impl Into<String>) -> Self {
        self.base_url = Some(base.into());
        self
    }

    /// Toggle the `t=<millis>` query parameter that defeats intermediary
    /// caches. On by default.
    pub fn with_cache_bust(mut self, enabled: bool) -> Self {
        self.cache_bust = enabled;
        self
    }

    fn request_url(&self, locator: &str) -> String {
        let absolute = locator.starts_with("http://") || locator.starts_with("https://");
        let mut url = match (&self.base_url, absolute) {
            (Some(base), false) => format!(
                "{}/{}",
                base.trim_end_matches('/'),
                locator.trim_start_matches('/')
            ),
            _ => locator.to_string(),
        };
        if self.cache_bust {
            let sep = if url.contains('?') { '&' } else { '?' };
            url.push(sep);
            url.push_str(&format!("t={}", chrono::Utc::now().timestamp_millis()));
        }
        url
    }
}

#[async_trait]
impl ResourceFetcher for HttpFetcher {
    async fn fetch(&self, locator: &str) -> SolarflowResult<serde_json::Value> {
        let url = self.request_url(locator);

        let response = self.client.get(&url).send().await.map_err(|e| {
            NetworkError::RequestFailed {
                url: url.clone(),
                reason: e.to_string(),
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(NetworkError::BadStatus {
                url,
                status: status.as_u16(),
            }
            .into());
        }

        response.json().await.map_err(|e| {
            NetworkError::DecodeFailed {
                url,
                reason: e.to_string(),
            }
            .into()
        })
    }
}

// ============================================================================
// FILE
// ============================================================================

/// Fetches JSON documents from files under a root directory. Useful for
/// seed bundles shipped alongside the binary.
#[derive(Debug, Clone)]
pub struct FileFetcher {
    root: PathBuf,
}

impl FileFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ResourceFetcher for FileFetcher {
    async fn fetch(&self, locator: &str) -> SolarflowResult<serde_json::Value> {
        let path = self.root.join(locator);
        let shown = path.display().to_string();

        let raw = tokio::fs::read_to_string(&path).await.map_err(|e| {
            NetworkError::RequestFailed {
                url: shown.clone(),
                reason: e.to_string(),
            }
        })?;

        serde_json::from_str(&raw).map_err(|e| {
            NetworkError::DecodeFailed {
                url: shown,
                reason: e.to_string(),
            }
            .into()
        })
    }
}

// ============================================================================
// SCRIPTED (TEST DOUBLE)
// ============================================================================

/// One scripted response step.
pub enum FetchScript {
    /// Resolve with this value.
    Respond(serde_json::Value),
    /// Fail with this error.
    Fail(SolarflowError),
    /// Never resolve; the attempt parks until its timeout fires.
    Stall,
}

/// Fetcher that replays scripted steps per locator, in order. An unscripted
/// call fails, which makes extra retrieval attempts visible in tests.
#[derive(Default)]
pub struct StaticFetcher {
    scripts: Mutex<HashMap<String, VecDeque<FetchScript>>>,
    calls: Mutex<HashMap<String, u32>>,
}

impl StaticFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step to `locator`'s script.
    pub fn script(&self, locator: &str, step: FetchScript) {
        self.scripts
            .lock()
            .unwrap()
            .entry(locator.to_string())
            .or_default()
            .push_back(step);
    }

    /// How many times `locator` was fetched.
    pub fn call_count(&self, locator: &str) -> u32 {
        self.calls
            .lock()
            .unwrap()
            .get(locator)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl ResourceFetcher for StaticFetcher {
    async fn fetch(&self, locator: &str) -> SolarflowResult<serde_json::Value> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(locator.to_string())
            .or_insert(0) += 1;

        let step = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(locator)
            .and_then(VecDeque::pop_front);

        match step {
            Some(FetchScript::Respond(value)) => Ok(value),
            Some(FetchScript::Fail(error)) => Err(error),
            Some(FetchScript::Stall) => std::future::pending().await,
            None => Err(NetworkError::RequestFailed {
                url: locator.to_string(),
                reason: "no scripted response".to_string(),
            }
            .into()),
        }
    }
}
