//! Per-client rate limiting
//!
//! One token bucket per client identity, backed by `governor`'s keyed GCRA
//! limiter. GCRA stores a single "theoretical arrival time" per key, which is
//! equivalent to tracking `tokens` and `last_refill`: a key whose bucket has
//! refilled completely carries no information and can be dropped, which is
//! what [`RateLimiter::sweep`] does.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::clock::{Clock, DefaultClock};
use governor::{DefaultKeyedRateLimiter, Quota};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::LimitConfig;
use crate::metrics;
use crate::{Error, Result};

/// Outcome of an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A token was consumed
    Admitted,
    /// The bucket is empty; a token becomes available after `retry_after`
    Denied {
        /// Time until the next token
        retry_after: Duration,
    },
}

impl Admission {
    /// Whether the request may proceed
    #[must_use]
    pub fn is_admitted(self) -> bool {
        matches!(self, Self::Admitted)
    }
}

/// Token-bucket rate limiter keyed by client identity
pub struct RateLimiter {
    name: String,
    rate_per_second: f64,
    burst: u32,
    max_identities: Option<usize>,
    inner: DefaultKeyedRateLimiter<String>,
    clock: DefaultClock,
}

impl RateLimiter {
    /// Create a limiter refilling at `rate_per_second` with buckets of `burst`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the rate is not positive or the burst
    /// is zero.
    pub fn new(name: &str, rate_per_second: f64, burst: u32) -> Result<Self> {
        if !(rate_per_second.is_finite() && rate_per_second > 0.0) {
            return Err(Error::Config(format!(
                "rate limiter '{name}': rate must be positive, got {rate_per_second}"
            )));
        }
        let burst_nz = NonZeroU32::new(burst).ok_or_else(|| {
            Error::Config(format!("rate limiter '{name}': burst must be at least 1"))
        })?;
        let period = Duration::try_from_secs_f64(1.0 / rate_per_second).map_err(|_| {
            Error::Config(format!("rate limiter '{name}': rate {rate_per_second} too low"))
        })?;
        let quota = Quota::with_period(period)
            .ok_or_else(|| {
                Error::Config(format!("rate limiter '{name}': rate {rate_per_second} too high"))
            })?
            .allow_burst(burst_nz);

        Ok(Self {
            name: name.to_string(),
            rate_per_second,
            burst,
            max_identities: None,
            inner: governor::RateLimiter::keyed(quota),
            clock: DefaultClock::default(),
        })
    }

    /// Create a limiter from a per-class config
    ///
    /// # Errors
    ///
    /// See [`RateLimiter::new`].
    pub fn from_config(name: &str, config: &LimitConfig) -> Result<Self> {
        Self::new(name, config.rate_per_second, config.burst)
    }

    /// Force a sweep whenever more than `max` identities are tracked
    #[must_use]
    pub fn with_max_identities(mut self, max: Option<usize>) -> Self {
        self.max_identities = max;
        self
    }

    /// Limiter name (used in logs and metrics)
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sustained refill rate
    #[must_use]
    pub fn rate_per_second(&self) -> f64 {
        self.rate_per_second
    }

    /// Bucket capacity
    #[must_use]
    pub fn burst(&self) -> u32 {
        self.burst
    }

    /// Consume a token for `identity` if one is available
    pub fn admit(&self, identity: &str) -> bool {
        self.check(identity).is_admitted()
    }

    /// Like [`admit`](Self::admit), but reports how long a denied client
    /// should wait
    pub fn check(&self, identity: &str) -> Admission {
        if let Some(max) = self.max_identities {
            if self.inner.len() >= max {
                let evicted = self.sweep();
                if self.inner.len() >= max {
                    warn!(
                        limiter = %self.name,
                        tracked = self.inner.len(),
                        evicted,
                        "Identity cap reached with no idle buckets to evict"
                    );
                }
            }
        }

        match self.inner.check_key(&identity.to_string()) {
            Ok(()) => Admission::Admitted,
            Err(not_until) => {
                let retry_after = not_until.wait_time_from(self.clock.now());
                debug!(
                    limiter = %self.name,
                    identity,
                    retry_after_ms = retry_after.as_millis(),
                    "Rate limit exceeded"
                );
                metrics::record_rate_limited(&self.name);
                Admission::Denied { retry_after }
            }
        }
    }

    /// Evict buckets that have refilled completely; returns how many went
    pub fn sweep(&self) -> usize {
        let before = self.inner.len();
        self.inner.retain_recent();
        self.inner.shrink_to_fit();
        let evicted = before.saturating_sub(self.inner.len());
        if evicted > 0 {
            debug!(limiter = %self.name, evicted, "Evicted idle rate-limit buckets");
        }
        evicted
    }

    /// Number of identities currently tracked
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.inner.len()
    }
}

/// Spawn a task that sweeps `limiters` every `interval` until `shutdown`
/// is cancelled. Await the handle to join it.
pub fn spawn_sweeper(
    limiters: Vec<Arc<RateLimiter>>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    debug!("Rate limiter sweeper shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    for limiter in &limiters {
                        limiter.sweep();
                    }
                }
            }
        }
    })
}
