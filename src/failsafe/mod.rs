//! Failsafe mechanisms: circuit breaker, retry, rate limiting

mod circuit_breaker;
mod rate_limiter;
mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitState, Counts, StateChange};
pub use rate_limiter::{Admission, RateLimiter, spawn_sweeper};
pub use retry::{JITTER_FACTOR, RetryPolicy, with_retry};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::FailsafeConfig;
use crate::{Error, Result};

/// Breaker + retry + per-call timeout around one upstream dependency
#[derive(Clone)]
pub struct Failsafe {
    /// Circuit breaker
    pub circuit_breaker: Arc<CircuitBreaker>,
    /// Retry policy
    pub retry_policy: RetryPolicy,
    /// Timeout applied to every single attempt
    pub call_timeout: Duration,
    cancel: CancellationToken,
}

impl Failsafe {
    /// Create a new failsafe from configuration
    #[must_use]
    pub fn new(
        name: &str,
        config: &FailsafeConfig,
        call_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            circuit_breaker: Arc::new(CircuitBreaker::new(name, &config.circuit_breaker)),
            retry_policy: RetryPolicy::new(&config.retry),
            call_timeout,
            cancel,
        }
    }

    /// Replace the retry policy
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Run `f` as `breaker(retry(timeout(f)))`
    ///
    /// The breaker sees one outcome per call, however many attempts the
    /// retry policy made underneath it.
    ///
    /// # Errors
    ///
    /// [`Error::CircuitOpen`] when the breaker rejects the call, otherwise
    /// whatever [`with_retry`] returns.
    pub async fn call<F, Fut, T>(&self, operation: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let timeout = self.call_timeout;
        let retried = with_retry(&self.retry_policy, operation, &self.cancel, move || {
            let attempt = f();
            async move {
                tokio::time::timeout(timeout, attempt)
                    .await
                    .unwrap_or_else(|_| {
                        Err(Error::Timeout(format!(
                            "{operation} exceeded {}ms",
                            timeout.as_millis()
                        )))
                    })
            }
        });
        self.circuit_breaker.execute(|| retried).await
    }

    /// Current breaker state
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.circuit_breaker.state()
    }
}
