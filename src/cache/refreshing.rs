//! Read-through TTL cache with at most one refresh in flight per key
//!
//! A caller that finds a key missing or expired claims the key's refresh
//! slot. Everyone else arriving while the slot is held either gets the
//! current (stale) value straight away or, when there is none yet, waits on
//! the owner's completion signal for at most `refresh_wait`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::stats::{CacheStats, CacheStatsSnapshot};
use crate::metrics;
use crate::{Error, Result};

struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_fresh(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

type InFlight = Mutex<HashMap<String, watch::Receiver<()>>>;

/// Holds a key's refresh slot. Dropping it frees the slot and, by dropping
/// the sender, wakes every waiter.
struct RefreshGuard<'a> {
    key: String,
    in_flight: &'a InFlight,
    _done: watch::Sender<()>,
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.key);
    }
}

enum Claim<'a> {
    Owner(RefreshGuard<'a>),
    Waiter(watch::Receiver<()>),
}

/// TTL cache whose misses are filled by a caller-supplied fetch
pub struct RefreshingCache<V> {
    name: String,
    ttl: Duration,
    refresh_wait: Duration,
    entries: RwLock<HashMap<String, CacheEntry<V>>>,
    in_flight: InFlight,
    ready: AtomicBool,
    stats: CacheStats,
}

impl<V: Clone + Send + Sync> RefreshingCache<V> {
    /// Create an empty cache
    #[must_use]
    pub fn new(name: &str, ttl: Duration, refresh_wait: Duration) -> Self {
        Self {
            name: name.to_string(),
            ttl,
            refresh_wait,
            entries: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            ready: AtomicBool::new(false),
            stats: CacheStats::default(),
        }
    }

    /// Cache name (used in logs and metrics)
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get `key`, running `fetch` when it is missing or expired
    ///
    /// `fetch` only runs if this caller wins the key's refresh slot. When the
    /// fetch fails and an older value exists, the older value is returned.
    ///
    /// # Errors
    ///
    /// - the fetch error when there is no older value to fall back on
    /// - [`Error::RefreshInProgress`] when another caller is refreshing, no
    ///   value exists, and that refresh did not land within `refresh_wait`
    pub async fn get<F, Fut>(&self, key: &str, fetch: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        if let Some(value) = self.peek(key) {
            CacheStats::incr(&self.stats.hits);
            metrics::record_cache_hit(&self.name);
            return Ok(value);
        }
        CacheStats::incr(&self.stats.misses);
        metrics::record_cache_miss(&self.name);

        match self.claim(key) {
            Claim::Owner(guard) => {
                // A refresh may have landed between the lookup and the claim
                if let Some(value) = self.peek(key) {
                    return Ok(value);
                }
                self.refresh(key, fetch, guard).await
            }
            Claim::Waiter(done) => self.wait_for_refresh(key, done).await,
        }
    }

    /// Refetch `key` regardless of freshness and of any refresh in flight
    ///
    /// # Errors
    ///
    /// The fetch error, always; the old value is kept but not served.
    pub async fn force_refresh<F, Fut>(&self, key: &str, fetch: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        debug!(cache = %self.name, key, "Forced refresh");
        match fetch().await {
            Ok(value) => {
                self.store(key, value.clone());
                self.record_refresh(true);
                Ok(value)
            }
            Err(error) => {
                self.record_refresh(false);
                warn!(cache = %self.name, key, error = %error, "Forced refresh failed");
                Err(error)
            }
        }
    }

    /// Refresh `key` unless another caller already is
    ///
    /// Returns `Ok(false)` when the refresh slot was taken. A failure leaves
    /// the existing entry in place.
    ///
    /// # Errors
    ///
    /// The fetch error.
    pub async fn refresh_if_idle<F, Fut>(&self, key: &str, fetch: F) -> Result<bool>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        let Claim::Owner(_guard) = self.claim(key) else {
            debug!(cache = %self.name, key, "Refresh already in flight, skipping");
            return Ok(false);
        };

        match fetch().await {
            Ok(value) => {
                self.store(key, value);
                self.record_refresh(true);
                Ok(true)
            }
            Err(error) => {
                self.record_refresh(false);
                Err(error)
            }
        }
    }

    /// Fresh value for `key`, without touching statistics
    #[must_use]
    pub fn peek(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        self.entries
            .read()
            .get(key)
            .filter(|entry| entry.is_fresh(now))
            .map(|entry| entry.value.clone())
    }

    /// Value for `key` whether or not it has expired
    #[must_use]
    pub fn peek_stale(&self, key: &str) -> Option<V> {
        self.entries.read().get(key).map(|entry| entry.value.clone())
    }

    /// Store `value` under `key` with a full TTL
    pub fn insert(&self, key: &str, value: V) {
        self.store(key, value);
    }

    /// Keys that expire within `ahead` (or already have)
    #[must_use]
    pub fn keys_due(&self, ahead: Duration) -> Vec<String> {
        let horizon = Instant::now() + ahead;
        self.entries
            .read()
            .iter()
            .filter(|(_, entry)| entry.expires_at <= horizon)
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Drop every entry. Readiness is kept.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Number of entries, fresh or not
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the cache holds no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// True once any fetch has succeeded
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Get cache statistics
    #[must_use]
    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot(self.len())
    }

    fn claim(&self, key: &str) -> Claim<'_> {
        let mut in_flight = self.in_flight.lock();
        if let Some(done) = in_flight.get(key) {
            return Claim::Waiter(done.clone());
        }
        let (tx, rx) = watch::channel(());
        in_flight.insert(key.to_string(), rx);
        Claim::Owner(RefreshGuard {
            key: key.to_string(),
            in_flight: &self.in_flight,
            _done: tx,
        })
    }

    async fn refresh<F, Fut>(&self, key: &str, fetch: F, guard: RefreshGuard<'_>) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        debug!(cache = %self.name, key, "Refreshing");
        let result = match fetch().await {
            Ok(value) => {
                self.store(key, value.clone());
                self.record_refresh(true);
                Ok(value)
            }
            Err(error) => {
                self.record_refresh(false);
                if let Some(stale) = self.peek_stale(key) {
                    warn!(
                        cache = %self.name,
                        key,
                        error = %error,
                        "Refresh failed, serving stale value"
                    );
                    CacheStats::incr(&self.stats.stale_served);
                    metrics::record_stale_served(&self.name);
                    Ok(stale)
                } else {
                    warn!(cache = %self.name, key, error = %error, "Refresh failed with no value to serve");
                    Err(error)
                }
            }
        };
        drop(guard);
        result
    }

    async fn wait_for_refresh(&self, key: &str, mut done: watch::Receiver<()>) -> Result<V> {
        CacheStats::incr(&self.stats.coalesced);
        if let Some(stale) = self.peek_stale(key) {
            debug!(cache = %self.name, key, "Refresh in flight, serving current value");
            return Ok(stale);
        }

        // Resolves with an error once the owner drops its guard
        let _ = tokio::time::timeout(self.refresh_wait, done.changed()).await;

        self.peek_stale(key).ok_or_else(|| {
            debug!(cache = %self.name, key, "Gave up waiting for refresh");
            Error::RefreshInProgress(key.to_string())
        })
    }

    fn store(&self, key: &str, value: V) {
        let entry = CacheEntry {
            value,
            expires_at: Instant::now() + self.ttl,
        };
        self.entries.write().insert(key.to_string(), entry);
        self.ready.store(true, Ordering::Release);
    }

    fn record_refresh(&self, success: bool) {
        let counter = if success {
            &self.stats.refreshes
        } else {
            &self.stats.refresh_failures
        };
        CacheStats::incr(counter);
        metrics::record_refresh(&self.name, success);
    }
}
