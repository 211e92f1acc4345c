//! Retry logic with exponential backoff and jitter

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::RetryConfig;
use crate::metrics;
use crate::{Error, Result};

/// Largest relative perturbation applied by jitter (±25%)
pub const JITTER_FACTOR: f64 = 0.25;

type Classifier = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

/// Retry policy configuration
#[derive(Clone)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Ceiling applied before jitter
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f64,
    /// Whether delays are perturbed by ±25%
    pub jitter: bool,
    /// Overall budget for attempts and sleeps
    pub max_elapsed: Option<Duration>,
    retryable: Classifier,
}

impl RetryPolicy {
    /// Create from config. A disabled policy makes exactly one attempt.
    #[must_use]
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: if config.enabled {
                config.max_attempts.max(1)
            } else {
                1
            },
            initial_backoff: config.initial_backoff,
            max_backoff: config.max_backoff,
            multiplier: config.multiplier,
            jitter: config.jitter,
            max_elapsed: config.max_elapsed,
            retryable: Arc::new(Error::is_transient),
        }
    }

    /// Replace the retryable-error classifier
    #[must_use]
    pub fn with_classifier<F>(mut self, classifier: F) -> Self
    where
        F: Fn(&Error) -> bool + Send + Sync + 'static,
    {
        self.retryable = Arc::new(classifier);
        self
    }

    /// Whether `error` is worth another attempt
    #[must_use]
    pub fn is_retryable(&self, error: &Error) -> bool {
        (self.retryable)(error)
    }

    /// Delay before retry number `retry` (0-based), before jitter:
    /// `min(initial × multiplier^retry, max)`
    #[must_use]
    pub fn base_delay(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let scaled = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        let ceiling = self.max_backoff.as_secs_f64();
        if !scaled.is_finite() || scaled >= ceiling {
            self.max_backoff
        } else {
            Duration::from_secs_f64(scaled)
        }
    }

    /// Delay before retry number `retry`, with jitter applied when enabled
    #[must_use]
    pub fn delay(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry);
        if !self.jitter || base.is_zero() {
            return base;
        }
        let factor = rand::rng().random_range(1.0 - JITTER_FACTOR..=1.0 + JITTER_FACTOR);
        base.mul_f64(factor)
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("initial_backoff", &self.initial_backoff)
            .field("max_backoff", &self.max_backoff)
            .field("multiplier", &self.multiplier)
            .field("jitter", &self.jitter)
            .field("max_elapsed", &self.max_elapsed)
            .finish_non_exhaustive()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&RetryConfig::default())
    }
}

/// Execute a future with retry logic
///
/// Each attempt and each backoff sleep races `cancel`; cancellation wins
/// with [`Error::Cancelled`].
///
/// # Errors
///
/// - the error from `f` unchanged when it is not retryable
/// - [`Error::RetriesExhausted`] once `max_attempts` attempts have failed
/// - [`Error::DeadlineExceeded`] when the next sleep would overrun `max_elapsed`
/// - [`Error::Cancelled`] when `cancel` fires
pub async fn with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    name: &str,
    cancel: &CancellationToken,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let started = Instant::now();
    let mut attempts = 0u32;

    loop {
        attempts += 1;

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::Cancelled),
            outcome = f() => outcome,
        };

        let error = match outcome {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !policy.is_retryable(&error) {
            debug!(operation = name, attempt = attempts, error = %error, "Not retryable");
            return Err(error);
        }

        if attempts >= policy.max_attempts {
            debug!(
                operation = name,
                attempts = attempts,
                "Max retry attempts reached"
            );
            return Err(Error::RetriesExhausted {
                attempts,
                source: Box::new(error),
            });
        }

        let delay = policy.delay(attempts - 1);
        if let Some(budget) = policy.max_elapsed {
            if started.elapsed() + delay > budget {
                debug!(
                    operation = name,
                    attempts = attempts,
                    budget_ms = budget.as_millis(),
                    "Retry budget exhausted"
                );
                return Err(Error::DeadlineExceeded {
                    attempts,
                    source: Box::new(error),
                });
            }
        }

        debug!(
            operation = name,
            attempt = attempts,
            delay_ms = delay.as_millis(),
            error = %error,
            "Retrying after backoff"
        );
        metrics::record_retry(name);

        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::Cancelled),
            () = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(&RetryConfig {
            enabled: true,
            max_attempts,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: false,
            max_elapsed: None,
        })
    }

    #[test]
    fn base_delays_grow_exponentially_until_the_cap() {
        let p = policy(10);
        let delays: Vec<u128> = (0..8).map(|n| p.base_delay(n).as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1600, 3200, 5000, 5000]);
    }

    #[test]
    fn base_delay_survives_huge_exponents() {
        let p = policy(10);
        assert_eq!(p.base_delay(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn jitter_stays_within_a_quarter() {
        let p = RetryPolicy {
            jitter: true,
            ..policy(10)
        };
        for retry in 0..8 {
            let base = p.base_delay(retry).as_secs_f64();
            for _ in 0..50 {
                let d = p.delay(retry).as_secs_f64();
                assert!(d >= base * 0.75 - 1e-9, "{d} below {base}");
                assert!(d <= base * 1.25 + 1e-9, "{d} above {base}");
            }
        }
    }

    #[test]
    fn disabled_policy_makes_one_attempt() {
        let p = RetryPolicy::new(&RetryConfig {
            enabled: false,
            ..RetryConfig::default()
        });
        assert_eq!(p.max_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_error_short_circuits_without_sleeping() {
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let result: Result<()> = with_retry(&policy(5), "test", &CancellationToken::new(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::Permanent("401 unauthorized".into())) }
        })
        .await;

        assert!(matches!(result, Err(Error::Permanent(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let result = with_retry(&policy(5), "test", &CancellationToken::new(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Error::Transient("503".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        // 100ms + 200ms of backoff
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(300), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(320), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn exhausting_attempts_wraps_the_last_error() {
        let calls = AtomicU32::new(0);

        let result: Result<()> = with_retry(&policy(3), "test", &CancellationToken::new(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::Transient("connection refused".into())) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(Error::RetriesExhausted { attempts, source }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(*source, Error::Transient(_)));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_the_backoff_sleep() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let p = RetryPolicy {
            initial_backoff: Duration::from_secs(10),
            max_backoff: Duration::from_secs(10),
            ..policy(3)
        };
        let result: Result<()> = with_retry(&p, "test", &cancel, || async {
            Err(Error::Transient("timeout".into()))
        })
        .await;

        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_stops_retries_before_overrunning() {
        let calls = AtomicU32::new(0);
        let p = RetryPolicy {
            max_elapsed: Some(Duration::from_millis(250)),
            ..policy(10)
        };

        let result: Result<()> = with_retry(&p, "test", &CancellationToken::new(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::Transient("503".into())) }
        })
        .await;

        // attempt 1, sleep 100ms, attempt 2, next sleep (200ms) would overrun 250ms
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(matches!(
            result,
            Err(Error::DeadlineExceeded { attempts: 2, .. })
        ));
    }

    #[tokio::test]
    async fn custom_classifier_is_consulted() {
        let calls = AtomicU32::new(0);
        let p = policy(3).with_classifier(|_| false);

        let result: Result<()> = with_retry(&p, "test", &CancellationToken::new(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::Transient("503".into())) }
        })
        .await;

        assert!(matches!(result, Err(Error::Transient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
