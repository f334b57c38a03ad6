//! Bounded retry with exponential backoff and a timeout per attempt.
//!
//! Each attempt races its future against the configured timeout. Failed
//! attempts back off with `base * 2^i` capped at the maximum, plus optional
//! jitter. Errors that cannot succeed on a retry (validation, configuration)
//! short-circuit immediately; only the final failure is wrapped in an
//! exhaustion error carrying the last underlying cause.

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use solarflow_core::{RetryConfig, RetryError, SolarflowError, SolarflowResult, TimeoutError};
use tracing::{debug, warn};

/// Wraps an async operation in retry and timeout policy.
#[derive(Debug, Clone)]
pub struct RetryTimeoutGuard {
    config: RetryConfig,
}

/// Sub-millisecond clock noise spread over `0..jitter_ms`.
fn jitter(jitter_ms: u64) -> Duration {
    if jitter_ms == 0 {
        return Duration::ZERO;
    }
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::from(d.subsec_nanos()))
        .unwrap_or(0);
    Duration::from_millis(nanos % jitter_ms)
}

impl RetryTimeoutGuard {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Backoff before the attempt after 0-based failure `attempt`.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponential = self
            .config
            .base_delay()
            .saturating_mul(2u32.saturating_pow(attempt));
        exponential.min(self.config.max_delay()) + jitter(self.config.jitter_ms)
    }

    /// Run `attempt_fn` until it succeeds, a non-retryable error occurs, or
    /// attempts are exhausted. `operation` names the work in logs and errors.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut attempt_fn: F) -> SolarflowResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SolarflowResult<T>>,
    {
        let attempts = self.config.attempts.max(1);
        let mut attempt = 0u32;

        let last_error = loop {
            let outcome =
                tokio::time::timeout(self.config.attempt_timeout(), attempt_fn()).await;
            let error = match outcome {
                Ok(Ok(value)) => {
                    if attempt > 0 {
                        debug!(
                            operation = %operation,
                            attempt = attempt + 1,
                            "Attempt succeeded after retries"
                        );
                    }
                    return Ok(value);
                }
                Ok(Err(e)) => e,
                Err(_) => TimeoutError::Elapsed {
                    operation: operation.to_string(),
                    timeout_ms: self.config.attempt_timeout_ms,
                }
                .into(),
            };

            if !error.is_retryable() {
                debug!(operation = %operation, error = %error, "Error is not retryable");
                return Err(error);
            }

            attempt += 1;
            if attempt >= attempts {
                break error;
            }

            let delay = self.backoff_delay(attempt - 1);
            warn!(
                operation = %operation,
                attempt,
                attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Attempt failed; backing off"
            );
            tokio::time::sleep(delay).await;
        };

        warn!(operation = %operation, attempts, error = %last_error, "All attempts exhausted");
        Err(RetryError::Exhausted {
            operation: operation.to_string(),
            attempts,
            last: Box::new(last_error),
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use solarflow_core::{NetworkError, ValidationError};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    fn test_config() -> RetryConfig {
        RetryConfig::default()
            .with_attempts(3)
            .with_base_delay_ms(100)
    }

    fn network_error() -> SolarflowError {
        NetworkError::RequestFailed {
            url: "test://solar".to_string(),
            reason: "connection refused".to_string(),
        }
        .into()
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let guard = RetryTimeoutGuard::new(test_config());
        let calls = Arc::new(AtomicU32::new(0));

        let calls_in = calls.clone();
        let result = guard
            .run("solar", move || {
                let calls = calls_in.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(42u32)
                }
            })
            .await;

        assert_eq!(result.expect("run should succeed"), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_success() {
        let guard = RetryTimeoutGuard::new(test_config());
        let calls = Arc::new(AtomicU32::new(0));

        let calls_in = calls.clone();
        let result = guard
            .run("solar", move || {
                let calls = calls_in.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(network_error())
                    } else {
                        Ok("recovered")
                    }
                }
            })
            .await;

        assert_eq!(result.expect("run should succeed"), "recovered");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_wraps_last_error() {
        let guard = RetryTimeoutGuard::new(test_config());
        let calls = Arc::new(AtomicU32::new(0));

        let calls_in = calls.clone();
        let result: SolarflowResult<()> = guard
            .run("solar", move || {
                let calls = calls_in.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(network_error())
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result.expect_err("run should fail") {
            SolarflowError::Retry(RetryError::Exhausted {
                operation,
                attempts,
                last,
            }) => {
                assert_eq!(operation, "solar");
                assert_eq!(attempts, 3);
                assert!(matches!(*last, SolarflowError::Network(_)));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_non_retryable_short_circuits() {
        let guard = RetryTimeoutGuard::new(test_config());
        let calls = Arc::new(AtomicU32::new(0));

        let calls_in = calls.clone();
        let result: SolarflowResult<()> = guard
            .run("solar", move || {
                let calls = calls_in.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(ValidationError::RequiredFieldMissing {
                        field: "minions".to_string(),
                    }
                    .into())
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            result.expect_err("run should fail"),
            SolarflowError::Validation(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_attempts_hit_timeout() {
        let config = test_config().with_attempts(2);
        let guard = RetryTimeoutGuard::new(config);

        let result: SolarflowResult<()> = guard
            .run("solar", || std::future::pending())
            .await;

        match result.expect_err("run should fail") {
            SolarflowError::Retry(RetryError::Exhausted { attempts, last, .. }) => {
                assert_eq!(attempts, 2);
                assert!(matches!(*last, SolarflowError::Timeout(_)));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_delays_double_between_attempts() {
        let guard = RetryTimeoutGuard::new(test_config());
        let starts: Arc<Mutex<Vec<tokio::time::Instant>>> = Arc::new(Mutex::new(Vec::new()));

        let starts_in = starts.clone();
        let _: SolarflowResult<()> = guard
            .run("solar", move || {
                let starts = starts_in.clone();
                async move {
                    starts.lock().unwrap().push(tokio::time::Instant::now());
                    Err(network_error())
                }
            })
            .await;

        let starts = starts.lock().unwrap();
        assert_eq!(starts.len(), 3);
        let first_gap = starts[1] - starts[0];
        let second_gap = starts[2] - starts[1];
        assert_eq!(first_gap, Duration::from_millis(100));
        assert_eq!(second_gap, Duration::from_millis(200));
        assert!(second_gap >= first_gap);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_respects_max_delay_cap() {
        let config = RetryConfig::default()
            .with_attempts(4)
            .with_base_delay_ms(100)
            .with_max_delay_ms(150);
        let guard = RetryTimeoutGuard::new(config);
        let starts: Arc<Mutex<Vec<tokio::time::Instant>>> = Arc::new(Mutex::new(Vec::new()));

        let starts_in = starts.clone();
        let _: SolarflowResult<()> = guard
            .run("solar", move || {
                let starts = starts_in.clone();
                async move {
                    starts.lock().unwrap().push(tokio::time::Instant::now());
                    Err(network_error())
                }
            })
            .await;

        let starts = starts.lock().unwrap();
        assert_eq!(starts.len(), 4);
        // 100ms, then capped at 150ms for every later gap.
        assert_eq!(starts[1] - starts[0], Duration::from_millis(100));
        assert_eq!(starts[2] - starts[1], Duration::from_millis(150));
        assert_eq!(starts[3] - starts[2], Duration::from_millis(150));
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Backoff never exceeds the cap plus jitter and never decreases
        /// below the base for later attempts.
        #[test]
        fn prop_backoff_within_bounds(
            base_ms in 1u64..500,
            max_ms in 500u64..5_000,
            attempt in 0u32..16,
        ) {
            let config = RetryConfig::default()
                .with_base_delay_ms(base_ms)
                .with_max_delay_ms(max_ms)
                .with_jitter_ms(0);
            let guard = RetryTimeoutGuard::new(config);

            let delay = guard.backoff_delay(attempt);
            prop_assert!(delay <= Duration::from_millis(max_ms));
            prop_assert!(delay >= Duration::from_millis(base_ms.min(max_ms)));
        }

        /// Delays are non-decreasing in the attempt number.
        #[test]
        fn prop_backoff_monotonic(
            base_ms in 1u64..500,
            attempt in 0u32..15,
        ) {
            let config = RetryConfig::default()
                .with_base_delay_ms(base_ms)
                .with_max_delay_ms(60_000)
                .with_jitter_ms(0);
            let guard = RetryTimeoutGuard::new(config);

            prop_assert!(guard.backoff_delay(attempt + 1) >= guard.backoff_delay(attempt));
        }
    }
}
