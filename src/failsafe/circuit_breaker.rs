//! Circuit breaker implementation
//!
//! Closed counts outcomes in a rolling window and opens once enough calls
//! have completed with a high enough failure ratio. Open rejects without
//! calling the upstream until `timeout` has passed, then half-opens and lets
//! up to `max_requests` trial calls through. One trial failure reopens;
//! `max_requests` trial successes close. Errors that say nothing about
//! upstream health (a missing record, a cancelled caller) are not counted
//! and give their slot back.
//!
//! Every transition starts a new generation. Outcomes reported for an older
//! generation are dropped, so a slow call that started before the breaker
//! tripped cannot close it again.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CircuitBreakerConfig;
use crate::metrics;
use crate::{Error, Result};

/// Capacity of the transition broadcast channel
const TRANSITION_CHANNEL_CAPACITY: usize = 64;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Circuit is closed (allowing requests)
    Closed,
    /// Circuit is open (blocking requests)
    Open,
    /// Circuit is half-open (allowing limited requests to test)
    HalfOpen,
}

impl CircuitState {
    /// Lowercase name used in logs and metric labels
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        }
    }
}

/// A state change, as delivered to [`CircuitBreaker::subscribe`] listeners
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    /// Breaker name
    pub name: String,
    /// Previous state
    pub from: CircuitState,
    /// New state
    pub to: CircuitState,
}

/// Outcome counts for the current generation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    /// Calls admitted
    pub requests: u32,
    /// Calls that succeeded
    pub successes: u32,
    /// Calls that failed
    pub failures: u32,
    /// Successes since the last failure
    pub consecutive_successes: u32,
}

impl Counts {
    fn completed(&self) -> u32 {
        self.successes + self.failures
    }
}

/// How a finished call is recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
    /// Says nothing about upstream health; only the slot is released
    Ignored,
}

impl Outcome {
    fn of<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => Self::Success,
            Err(e) if e.counts_as_failure() => Self::Failure,
            Err(_) => Self::Ignored,
        }
    }
}

struct Inner {
    state: CircuitState,
    generation: u64,
    counts: Counts,
    /// Closed: end of the counting window. Open: when trials may start.
    expiry: Option<Instant>,
    opened_at: Option<Instant>,
    /// Failures recorded when the breaker last tripped
    last_trip_failures: u32,
}

/// Circuit breaker for upstream protection
pub struct CircuitBreaker {
    name: String,
    enabled: bool,
    min_requests: u32,
    failure_ratio: f64,
    max_requests: u32,
    timeout: Duration,
    interval: Duration,
    inner: Mutex<Inner>,
    transitions: broadcast::Sender<StateChange>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    #[must_use]
    pub fn new(name: &str, config: &CircuitBreakerConfig) -> Self {
        let (transitions, _) = broadcast::channel(TRANSITION_CHANNEL_CAPACITY);
        let now = Instant::now();
        Self {
            name: name.to_string(),
            enabled: config.enabled,
            min_requests: config.min_requests.max(1),
            failure_ratio: config.failure_ratio,
            max_requests: config.max_requests.max(1),
            timeout: config.timeout,
            interval: config.interval,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                generation: 0,
                counts: Counts::default(),
                expiry: window_end(now, config.interval),
                opened_at: None,
                last_trip_failures: 0,
            }),
            transitions,
        }
    }

    /// Breaker name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `f` if the breaker permits it
    ///
    /// # Errors
    ///
    /// Returns [`Error::CircuitOpen`] without calling `f` when the breaker is
    /// open or its half-open trial slots are taken; otherwise `f`'s own error.
    pub async fn execute<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !self.enabled {
            return f().await;
        }

        let generation = self.before_call()?;
        let mut guard = CallGuard {
            breaker: self,
            generation,
            armed: true,
        };

        let result = f().await;

        guard.armed = false;
        self.after_call(generation, Outcome::of(&result));
        result
    }

    /// Like [`execute`](Self::execute), but answers with `fallback()` when
    /// the breaker rejects the call
    ///
    /// # Errors
    ///
    /// Returns `f`'s error when the call was made and failed, or the
    /// fallback's error when the breaker rejected it.
    pub async fn execute_with_fallback<F, Fut, T, FB>(&self, f: F, fallback: FB) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
        FB: FnOnce() -> Result<T>,
    {
        match self.execute(f).await {
            Err(Error::CircuitOpen(reason)) => {
                debug!(breaker = %self.name, reason = %reason, "Serving fallback");
                fallback()
            }
            other => other,
        }
    }

    /// Check if requests can proceed, without reserving a trial slot
    #[must_use]
    pub fn can_proceed(&self) -> bool {
        if !self.enabled {
            return true;
        }
        let mut inner = self.inner.lock();
        match self.current_state(&mut inner, Instant::now()) {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => inner.counts.requests < self.max_requests,
        }
    }

    /// Get current state
    #[must_use]
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.current_state(&mut inner, Instant::now())
    }

    /// Counts for the current generation
    #[must_use]
    pub fn counts(&self) -> Counts {
        let mut inner = self.inner.lock();
        self.current_state(&mut inner, Instant::now());
        inner.counts
    }

    /// Listen for state changes. Sending never blocks the breaker; slow
    /// listeners lose the oldest events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.transitions.subscribe()
    }

    /// Human-readable status, suitable for health endpoints
    #[must_use]
    pub fn status_message(&self) -> String {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        match self.current_state(&mut inner, now) {
            CircuitState::Closed => format!("Upstream '{}' is healthy (circuit closed)", self.name),
            CircuitState::Open => {
                let remaining = inner
                    .expiry
                    .map_or(Duration::ZERO, |at| at.saturating_duration_since(now));
                format!(
                    "Upstream '{}' circuit breaker is open after {} failures, retry in {} seconds",
                    self.name,
                    inner.last_trip_failures,
                    remaining.as_secs().max(1)
                )
            }
            CircuitState::HalfOpen => format!(
                "Upstream '{}' circuit breaker is half-open, testing recovery ({}/{} trial calls)",
                self.name, inner.counts.requests, self.max_requests
            ),
        }
    }

    /// How long the breaker has been open, if it is
    #[must_use]
    pub fn open_for(&self) -> Option<Duration> {
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Open => inner.opened_at.map(|at| at.elapsed()),
            _ => None,
        }
    }

    fn before_call(&self) -> Result<u64> {
        let mut inner = self.inner.lock();
        let state = self.current_state(&mut inner, Instant::now());

        match state {
            CircuitState::Open => {
                warn!(breaker = %self.name, "Circuit open, rejecting request");
                return Err(Error::CircuitOpen(self.name.clone()));
            }
            CircuitState::HalfOpen if inner.counts.requests >= self.max_requests => {
                debug!(breaker = %self.name, "Half-open trial slots taken, rejecting request");
                return Err(Error::CircuitOpen(format!(
                    "{}: trial calls in progress",
                    self.name
                )));
            }
            CircuitState::HalfOpen => {
                debug!(breaker = %self.name, "Circuit half-open, allowing trial request");
            }
            CircuitState::Closed => {}
        }

        inner.counts.requests += 1;
        Ok(inner.generation)
    }

    fn after_call(&self, generation: u64, outcome: Outcome) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let state = self.current_state(&mut inner, now);
        if inner.generation != generation {
            tracing::trace!(breaker = %self.name, "Outcome from a previous generation ignored");
            return;
        }

        match outcome {
            Outcome::Success => {
                inner.counts.successes += 1;
                inner.counts.consecutive_successes += 1;
            }
            Outcome::Failure => {
                inner.counts.failures += 1;
                inner.counts.consecutive_successes = 0;
            }
            Outcome::Ignored => {
                inner.counts.requests = inner.counts.requests.saturating_sub(1);
                return;
            }
        }

        match state {
            CircuitState::Closed => {
                if self.should_trip(&inner.counts) {
                    inner.last_trip_failures = inner.counts.failures;
                    self.transition_to(&mut inner, CircuitState::Open, now);
                }
            }
            CircuitState::HalfOpen => {
                if outcome == Outcome::Failure {
                    warn!(breaker = %self.name, "Trial call failed, reopening circuit");
                    inner.last_trip_failures = inner.counts.failures;
                    self.transition_to(&mut inner, CircuitState::Open, now);
                } else if inner.counts.consecutive_successes >= self.max_requests {
                    self.transition_to(&mut inner, CircuitState::Closed, now);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn should_trip(&self, counts: &Counts) -> bool {
        let completed = counts.completed();
        completed >= self.min_requests
            && f64::from(counts.failures) / f64::from(completed) >= self.failure_ratio
    }

    /// Apply time-based transitions and return the resulting state
    fn current_state(&self, inner: &mut Inner, now: Instant) -> CircuitState {
        match inner.state {
            CircuitState::Closed => {
                if inner.expiry.is_some_and(|end| end <= now) {
                    // Rolling window elapsed: forget old outcomes
                    inner.generation += 1;
                    inner.counts = Counts::default();
                    inner.expiry = window_end(now, self.interval);
                }
            }
            CircuitState::Open => {
                if inner.expiry.is_some_and(|at| at <= now) {
                    self.transition_to(inner, CircuitState::HalfOpen, now);
                }
            }
            CircuitState::HalfOpen => {}
        }
        inner.state
    }

    /// Transition to a new state
    fn transition_to(&self, inner: &mut Inner, new_state: CircuitState, now: Instant) {
        let old_state = inner.state;
        if old_state == new_state {
            return;
        }

        inner.state = new_state;
        inner.generation += 1;
        inner.counts = Counts::default();

        match new_state {
            CircuitState::Closed => {
                inner.expiry = window_end(now, self.interval);
                inner.opened_at = None;
                info!(breaker = %self.name, "Circuit breaker closed");
            }
            CircuitState::Open => {
                inner.expiry = Some(now + self.timeout);
                inner.opened_at = Some(now);
                warn!(
                    breaker = %self.name,
                    failures = inner.last_trip_failures,
                    timeout_secs = self.timeout.as_secs(),
                    "Circuit breaker opened"
                );
            }
            CircuitState::HalfOpen => {
                inner.expiry = None;
                debug!(breaker = %self.name, "Circuit breaker half-open");
            }
        }

        metrics::record_breaker_transition(&self.name, old_state.as_str(), new_state.as_str());
        // No receivers is fine
        let _ = self.transitions.send(StateChange {
            name: self.name.clone(),
            from: old_state,
            to: new_state,
        });
    }
}

fn window_end(now: Instant, interval: Duration) -> Option<Instant> {
    (!interval.is_zero()).then(|| now + interval)
}

/// Reports a failure if the call's future is dropped before completing,
/// so an abandoned trial call cannot hold a half-open slot forever.
struct CallGuard<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    armed: bool,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.after_call(self.generation, Outcome::Failure);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config(min_requests: u32, max_requests: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            enabled: true,
            min_requests,
            failure_ratio: 0.6,
            max_requests,
            timeout: Duration::from_secs(30),
            interval: Duration::from_secs(60),
        }
    }

    async fn fail(cb: &CircuitBreaker) -> Result<()> {
        cb.execute(|| async { Err(Error::Transient("boom".into())) })
            .await
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<u32> {
        cb.execute(|| async { Ok(1) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn trips_after_two_failures_in_three_calls() {
        let cb = CircuitBreaker::new("upstream", &config(3, 1));

        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_skips_the_upstream() {
        let cb = CircuitBreaker::new("upstream", &config(3, 1));
        for _ in 0..3 {
            let _ = fail(&cb).await;
        }

        let calls = AtomicU32::new(0);
        let result = cb
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(Error::CircuitOpen(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_hides_open_circuit() {
        let cb = CircuitBreaker::new("upstream", &config(1, 1));
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        let value = cb
            .execute_with_fallback(|| async { Ok(vec![1, 2, 3]) }, || Ok(Vec::new()))
            .await
            .unwrap();
        assert!(value.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_does_not_mask_real_failures() {
        let cb = CircuitBreaker::new("upstream", &config(3, 1));
        let result = cb
            .execute_with_fallback(
                || async { Err::<u32, _>(Error::Permanent("401".into())) },
                || Ok(0),
            )
            .await;
        assert!(matches!(result, Err(Error::Permanent(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_successful_trial() {
        let cb = CircuitBreaker::new("upstream", &config(1, 1));
        let _ = fail(&cb).await;
        assert!(!cb.can_proceed());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
        for _ in 0..5 {
            succeed(&cb).await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_trial_reopens_and_resets_the_clock() {
        let cb = CircuitBreaker::new("upstream", &config(1, 1));
        let _ = fail(&cb).await;

        tokio::time::advance(Duration::from_secs(30)).await;
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        // The timeout counts from the second opening
        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(cb.state(), CircuitState::Open);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_at_most_max_requests() {
        let cb = CircuitBreaker::new("upstream", &config(1, 2));
        let _ = fail(&cb).await;
        tokio::time::advance(Duration::from_secs(30)).await;

        // Two slow trials hold both slots
        let slow = || async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(())
        };
        let third = async {
            tokio::task::yield_now().await;
            cb.execute(|| async { Ok(()) }).await
        };
        let (a, b, c) = tokio::join!(cb.execute(slow), cb.execute(slow), third);

        a.unwrap();
        b.unwrap();
        assert!(matches!(c, Err(Error::CircuitOpen(_))));
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn rolling_interval_forgets_old_failures() {
        let cb = CircuitBreaker::new("upstream", &config(3, 1));
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        assert_eq!(cb.counts().failures, 2);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cb.counts(), Counts::default());

        // One more failure is not enough on its own
        let _ = fail(&cb).await;
        succeed(&cb).await.unwrap();
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn not_found_does_not_trip() {
        let cb = CircuitBreaker::new("upstream", &config(1, 1));
        for _ in 0..5 {
            let _ = cb
                .execute(|| async { Err::<(), _>(Error::NotFound("rec1".into())) })
                .await;
        }
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_trial_neither_closes_nor_reopens() {
        let cb = CircuitBreaker::new("upstream", &config(1, 1));
        let _ = fail(&cb).await;
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let result = cb.execute(|| async { Err::<(), _>(Error::Cancelled) }).await;
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.counts(), Counts::default());

        // The trial slot is free again
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn not_found_is_not_counted() {
        let cb = CircuitBreaker::new("upstream", &config(3, 1));
        let _ = cb
            .execute(|| async { Err::<(), _>(Error::NotFound("rec1".into())) })
            .await;
        assert_eq!(cb.counts(), Counts::default());
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_trial_reopens_the_circuit() {
        let cb = CircuitBreaker::new("upstream", &config(1, 1));
        let _ = fail(&cb).await;
        tokio::time::advance(Duration::from_secs(30)).await;

        let hung = cb.execute(|| async {
            std::future::pending::<()>().await;
            Ok(())
        });
        let timed_out = tokio::time::timeout(Duration::from_secs(1), hung).await;
        assert!(timed_out.is_err());

        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_generation_outcomes_are_ignored() {
        let cb = CircuitBreaker::new("upstream", &config(1, 1));

        // A slow call admitted while closed...
        let slow = cb.execute(|| async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        });
        // ...finishes after a fast failure has tripped the breaker
        let (slow_result, _) = tokio::join!(slow, fail(&cb));

        slow_result.unwrap();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn transitions_are_broadcast() {
        let cb = CircuitBreaker::new("upstream", &config(1, 1));
        let mut rx = cb.subscribe();

        let _ = fail(&cb).await;
        tokio::time::advance(Duration::from_secs(30)).await;
        succeed(&cb).await.unwrap();

        let seen: Vec<(CircuitState, CircuitState)> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|change| (change.from, change.to))
            .collect();
        assert_eq!(
            seen,
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen),
                (CircuitState::HalfOpen, CircuitState::Closed),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_breaker_never_opens() {
        let cb = CircuitBreaker::new(
            "upstream",
            &CircuitBreakerConfig {
                enabled: false,
                ..config(1, 1)
            },
        );
        for _ in 0..10 {
            let _ = fail(&cb).await;
        }
        assert!(cb.can_proceed());
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}
