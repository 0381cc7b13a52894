//! Resilience / Retry Policy (C12): classify backend errors and apply
//! bounded retry with exponential backoff and jitter.

use std::future::Future;
use std::time::Duration;

use crate::error::BackendError;

/// A process-global extractor table mapping backend exceptions onto
/// [`BackendError`]; registered once per backend, idempotently.
///
/// This crate's own in-memory backends never need an extractor (they raise
/// [`BackendError`] directly), but a real network-backed implementation
/// would register one of these to translate its own exception type.
pub trait StatusCodeExtractor: Send + Sync {
    /// Maps a raw backend error (typically carrying an HTTP-style status
    /// code) to this crate's [`BackendError`] taxonomy.
    fn classify(&self, message: &str, status_code: Option<u16>) -> BackendError;
}

/// The conventional HTTP-style extractor: 409/412 -> Conflict, 404 -> NotFound,
/// 429/503 -> Throttled, other 5xx -> Transient, everything else -> Fatal.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpStatusCodeExtractor;

impl StatusCodeExtractor for HttpStatusCodeExtractor {
    fn classify(&self, message: &str, status_code: Option<u16>) -> BackendError {
        match status_code {
            Some(404) => BackendError::NotFound(message.to_owned()),
            Some(409) | Some(412) => BackendError::Conflict(message.to_owned()),
            Some(429) | Some(503) => BackendError::Throttled(message.to_owned()),
            Some(code) if (500..600).contains(&code) => BackendError::Transient(message.to_owned()),
            _ => BackendError::Fatal(message.to_owned()),
        }
    }
}

/// Exponential backoff with jitter, used between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    /// Delay before the first retry.
    pub base: Duration,
    /// Upper bound on any single delay.
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(50),
            max: Duration::from_secs(5),
        }
    }
}

impl Backoff {
    /// Computes the delay before retry attempt number `attempt` (1-based),
    /// with deterministic jitter derived from the attempt number so repeated
    /// calls with the same `attempt` are reproducible in tests.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
        let capped = exp.min(self.max);

        // Deterministic "jitter": vary by up to 25% based on the attempt
        // number, avoiding a dependency on a random number generator for
        // what is otherwise a pure function.
        let jitter_pct = 75 + (u64::from(attempt) * 7 % 25);
        capped.mul_f64(jitter_pct as f64 / 100.0)
    }
}

/// Decides, per [`BackendError`], whether and how long to wait before
/// retrying.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    backoff: Backoff,
    max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: Backoff::default(),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Builds a [`RetryPolicy`] with the given backoff and attempt budget.
    pub fn new(backoff: Backoff, max_attempts: u32) -> Self {
        Self { backoff, max_attempts }
    }

    /// Builds a [`RetryPolicy`] with the default [`Backoff`] and
    /// [`crate::config::EngineConfig::max_retry_attempts`] as its attempt
    /// budget.
    pub fn from_config(config: &crate::config::EngineConfig) -> Self {
        Self::new(Backoff::default(), config.max_retry_attempts)
    }

    /// Runs `operation`, retrying on [`BackendError::is_retryable`] failures
    /// up to `max_attempts` times, sleeping [`Backoff::delay_for`] between
    /// attempts. Non-retryable errors (`Conflict`, `NotFound`, `Fatal`)
    /// fail-fast on the first attempt. Exhausting the budget surfaces
    /// [`BackendError::Exhausted`].
    pub async fn run<F, Fut, T>(&self, mut operation: F) -> Result<T, BackendError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let mut attempt = 0u32;

        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    attempt += 1;
                    tokio::time::sleep(self.backoff.delay_for(attempt)).await;
                }
                Err(err) if err.is_retryable() => {
                    return Err(BackendError::Exhausted {
                        attempts: attempt,
                        last: Box::new(err),
                    });
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn http_extractor_classifies_conventional_codes() {
        let extractor = HttpStatusCodeExtractor;
        assert!(matches!(extractor.classify("x", Some(429)), BackendError::Throttled(_)));
        assert!(matches!(extractor.classify("x", Some(412)), BackendError::Conflict(_)));
        assert!(matches!(extractor.classify("x", Some(404)), BackendError::NotFound(_)));
        assert!(matches!(extractor.classify("x", Some(500)), BackendError::Transient(_)));
        assert!(matches!(extractor.classify("x", Some(400)), BackendError::Fatal(_)));
    }

    #[tokio::test]
    async fn retry_policy_retries_transient_errors_until_success() {
        let policy = RetryPolicy::new(Backoff { base: Duration::from_millis(1), max: Duration::from_millis(5) }, 3);
        let attempts = AtomicU32::new(0);

        let result = policy
            .run(|| async {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(BackendError::Transient("retry me".into()))
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_policy_fails_fast_on_conflict() {
        let policy = RetryPolicy::default();
        let attempts = AtomicU32::new(0);

        let result: Result<(), BackendError> = policy
            .run(|| async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(BackendError::Conflict("nope".into()))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn from_config_honors_max_retry_attempts() {
        let mut config = crate::config::EngineConfig::default();
        config.max_retry_attempts = 1;
        let policy = RetryPolicy::from_config(&config);
        let attempts = AtomicU32::new(0);

        let result: Result<(), BackendError> = policy
            .run(|| async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(BackendError::Throttled("busy".into()))
            })
            .await;

        assert!(matches!(result, Err(BackendError::Exhausted { attempts: 1, .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn retry_policy_surfaces_exhausted_after_budget() {
        let policy = RetryPolicy::new(Backoff { base: Duration::from_millis(1), max: Duration::from_millis(2) }, 2);

        let result: Result<(), BackendError> = policy
            .run(|| async { Err(BackendError::Throttled("busy".into())) })
            .await;

        assert!(matches!(result, Err(BackendError::Exhausted { attempts: 2, .. })));
    }
}
