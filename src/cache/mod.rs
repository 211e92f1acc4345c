//! Mentor directory cache
//!
//! [`MentorCache`] fronts a [`DataSource`] with two refreshing caches: the
//! whole directory under [`DIRECTORY_KEY`] and individual profiles under
//! `mentor:<id>`. Every upstream call goes through the failsafe pipeline, so
//! callers see stale data rather than errors while the upstream is down.

mod refreshing;
mod stats;

pub use refreshing::RefreshingCache;
pub use stats::{CacheStats, CacheStatsSnapshot};

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{CacheConfig, Config};
use crate::failsafe::{CircuitState, Failsafe};
use crate::metrics;
use crate::source::{DataSource, Record};
use crate::{Error, Result};

/// Cache key holding the full directory
pub const DIRECTORY_KEY: &str = "all-mentors";

fn profile_key(id: &str) -> String {
    format!("mentor:{id}")
}

/// Statistics for both caches plus the breaker state
#[derive(Debug, Clone, Serialize)]
pub struct MentorCacheStats {
    /// Directory cache
    pub directory: CacheStatsSnapshot,
    /// Per-mentor cache
    pub profiles: CacheStatsSnapshot,
    /// Upstream breaker state
    pub breaker: CircuitState,
}

/// Cached, failure-tolerant view of the mentor directory
pub struct MentorCache {
    source: Arc<dyn DataSource>,
    failsafe: Failsafe,
    directory: RefreshingCache<Arc<Vec<Record>>>,
    profiles: RefreshingCache<Record>,
    config: CacheConfig,
    shutdown: CancellationToken,
    refresher: Mutex<Option<JoinHandle<()>>>,
}

impl MentorCache {
    /// Build the cache and its failsafe pipeline from configuration
    #[must_use]
    pub fn new(source: Arc<dyn DataSource>, config: &Config) -> Self {
        let shutdown = CancellationToken::new();
        let failsafe = Failsafe::new(
            "upstream",
            &config.failsafe,
            config.cache.call_timeout,
            shutdown.child_token(),
        );
        Self::with_failsafe(source, &config.cache, failsafe, shutdown)
    }

    /// Build the cache around an existing failsafe pipeline
    #[must_use]
    pub fn with_failsafe(
        source: Arc<dyn DataSource>,
        config: &CacheConfig,
        failsafe: Failsafe,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            source,
            failsafe,
            directory: RefreshingCache::new("directory", config.ttl, config.refresh_wait),
            profiles: RefreshingCache::new("profiles", config.ttl, config.refresh_wait),
            config: config.clone(),
            shutdown,
            refresher: Mutex::new(None),
        }
    }

    /// Populate the directory for the first time and start the background
    /// refresher (when enabled)
    ///
    /// # Errors
    ///
    /// Returns the upstream error if the first population fails; the cache
    /// is not ready in that case.
    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        match self.force_refresh().await {
            Ok(records) => {
                info!(records = records.len(), "Mentor cache initialized");
            }
            Err(e) => {
                error!(error = %e, "Initial population of mentor cache failed");
                return Err(e);
            }
        }

        if self.config.background_refresh {
            self.start_background_refresh();
        }
        Ok(())
    }

    /// True once the directory has been populated at least once
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.directory.is_ready()
    }

    /// All mentors, from cache when fresh
    ///
    /// # Errors
    ///
    /// Only when there is no cached directory to fall back on: the upstream
    /// error, or [`Error::RefreshInProgress`].
    pub async fn get(&self) -> Result<Arc<Vec<Record>>> {
        self.directory
            .get(DIRECTORY_KEY, || self.fetch_directory())
            .await
    }

    /// One mentor, from cache when fresh
    ///
    /// When the upstream cannot answer, the last known directory snapshot is
    /// searched instead.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for unknown ids, otherwise the upstream error when
    /// neither cache knows the mentor.
    pub async fn get_one(&self, id: &str) -> Result<Record> {
        let key = profile_key(id);
        match self.profiles.get(&key, || self.fetch_profile(id)).await {
            Ok(record) => Ok(record),
            Err(Error::NotFound(what)) => Err(Error::NotFound(what)),
            Err(e) => {
                let fallback = self
                    .directory
                    .peek_stale(DIRECTORY_KEY)
                    .and_then(|all| all.iter().find(|r| r.id == id).cloned());
                match fallback {
                    Some(record) => {
                        warn!(id, error = %e, "Serving mentor from directory snapshot");
                        metrics::record_stale_served(self.profiles.name());
                        Ok(record)
                    }
                    None => Err(e),
                }
            }
        }
    }

    /// Refetch the directory now
    ///
    /// # Errors
    ///
    /// The upstream error, even when an older directory is cached.
    pub async fn force_refresh(&self) -> Result<Arc<Vec<Record>>> {
        self.directory
            .force_refresh(DIRECTORY_KEY, || self.fetch_directory())
            .await
    }

    /// Cache and breaker statistics
    #[must_use]
    pub fn stats(&self) -> MentorCacheStats {
        MentorCacheStats {
            directory: self.directory.stats(),
            profiles: self.profiles.stats(),
            breaker: self.failsafe.state(),
        }
    }

    /// Upstream breaker state
    #[must_use]
    pub fn breaker_state(&self) -> CircuitState {
        self.failsafe.state()
    }

    /// Human-readable breaker status
    #[must_use]
    pub fn breaker_status(&self) -> String {
        self.failsafe.circuit_breaker.status_message()
    }

    /// Drop every cached entry
    pub fn clear(&self) {
        self.directory.clear();
        self.profiles.clear();
    }

    /// Start the periodic refresher. Does nothing if one is running.
    pub fn start_background_refresh(self: &Arc<Self>) {
        let mut slot = self.refresher.lock();
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let weak = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let interval = self.config.refresh_interval;
        let ahead = self.config.refresh_ahead;
        *slot = Some(tokio::spawn(run_refresher(weak, shutdown, interval, ahead)));
        debug!(interval_ms = interval.as_millis(), "Background refresher started");
    }

    /// Stop the background refresher and cancel in-flight retries
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self.refresher.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background refresher ended abnormally");
            }
        }
        info!("Mentor cache shut down");
    }

    async fn fetch_directory(&self) -> Result<Arc<Vec<Record>>> {
        self.failsafe
            .call("fetch_all", || self.source.fetch_all())
            .await
            .map(Arc::new)
    }

    async fn fetch_profile(&self, id: &str) -> Result<Record> {
        self.failsafe
            .call("fetch_one", || self.source.fetch_one(id))
            .await
    }

    async fn refresh_due(&self, ahead: Duration) {
        for key in self.directory.keys_due(ahead) {
            if let Err(e) = self
                .directory
                .refresh_if_idle(&key, || self.fetch_directory())
                .await
            {
                warn!(key = %key, error = %e, "Background refresh failed");
            }
        }

        for key in self.profiles.keys_due(ahead) {
            let Some(id) = key.strip_prefix("mentor:") else {
                continue;
            };
            if let Err(e) = self
                .profiles
                .refresh_if_idle(&key, || self.fetch_profile(id))
                .await
            {
                warn!(key = %key, error = %e, "Background refresh failed");
            }
        }
    }
}

async fn run_refresher(
    weak: Weak<MentorCache>,
    shutdown: CancellationToken,
    interval: Duration,
    ahead: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let Some(cache) = weak.upgrade() else { break };
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = cache.refresh_due(ahead) => {}
                }
            }
        }
    }
    debug!("Background refresher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CircuitBreakerConfig, FailsafeConfig, RetryConfig};
    use async_trait::async_trait;
    use serde_json::Map;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    #[derive(Default)]
    struct StubSource {
        failing: AtomicBool,
        list_calls: AtomicU32,
        one_calls: AtomicU32,
    }

    #[async_trait]
    impl DataSource for StubSource {
        async fn fetch_all(&self) -> Result<Vec<Record>> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(Error::Transient("503".into()));
            }
            Ok(vec![
                Record::new("rec1", Map::new()),
                Record::new("rec2", Map::new()),
            ])
        }

        async fn fetch_one(&self, id: &str) -> Result<Record> {
            self.one_calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(Error::Transient("503".into()));
            }
            if id.starts_with("rec") {
                Ok(Record::new(id, Map::new()))
            } else {
                Err(Error::NotFound(id.to_string()))
            }
        }
    }

    fn config() -> Config {
        Config {
            cache: CacheConfig {
                ttl: Duration::from_secs(60),
                background_refresh: false,
                ..CacheConfig::default()
            },
            failsafe: FailsafeConfig {
                circuit_breaker: CircuitBreakerConfig::default(),
                retry: RetryConfig {
                    max_attempts: 2,
                    initial_backoff: Duration::from_millis(10),
                    jitter: false,
                    ..RetryConfig::default()
                },
            },
            ..Config::default()
        }
    }

    fn cache_with(config: &Config) -> (Arc<StubSource>, Arc<MentorCache>) {
        let source = Arc::new(StubSource::default());
        let cache = Arc::new(MentorCache::new(source.clone(), config));
        (source, cache)
    }

    #[tokio::test(start_paused = true)]
    async fn initialize_populates_and_marks_ready() {
        let (source, cache) = cache_with(&config());
        assert!(!cache.is_ready());

        cache.initialize().await.unwrap();
        assert!(cache.is_ready());

        assert_eq!(cache.get().await.unwrap().len(), 2);
        assert_eq!(source.list_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn initialize_fails_loudly() {
        let (source, cache) = cache_with(&config());
        source.failing.store(true, Ordering::SeqCst);

        assert!(cache.initialize().await.is_err());
        assert!(!cache.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn get_one_caches_profiles() {
        let (source, cache) = cache_with(&config());

        assert_eq!(cache.get_one("rec1").await.unwrap().id, "rec1");
        assert_eq!(cache.get_one("rec1").await.unwrap().id, "rec1");
        assert_eq!(source.one_calls.load(Ordering::SeqCst), 1);

        assert!(matches!(
            cache.get_one("missing").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn get_one_falls_back_to_directory_snapshot() {
        let (source, cache) = cache_with(&config());
        cache.initialize().await.unwrap();
        source.failing.store(true, Ordering::SeqCst);

        let record = cache.get_one("rec2").await.unwrap();
        assert_eq!(record.id, "rec2");
        assert!(cache.get_one("rec9").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn background_refresher_renews_entries_before_expiry() {
        let mut config = config();
        config.cache.background_refresh = true;
        config.cache.refresh_interval = Duration::from_secs(10);
        config.cache.refresh_ahead = Duration::from_secs(15);
        let (source, cache) = cache_with(&config);

        cache.initialize().await.unwrap();
        assert_eq!(source.list_calls.load(Ordering::SeqCst), 1);

        // Entry expires at 60s; it becomes due at 45s and the 50s tick renews it
        tokio::time::sleep(Duration::from_secs(51)).await;
        assert_eq!(source.list_calls.load(Ordering::SeqCst), 2);
        assert!(cache.directory.peek(DIRECTORY_KEY).is_some());

        cache.shutdown().await;
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(source.list_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn background_failures_keep_stale_entry() {
        let mut config = config();
        config.cache.background_refresh = true;
        config.cache.refresh_interval = Duration::from_secs(10);
        let (source, cache) = cache_with(&config);

        cache.initialize().await.unwrap();
        source.failing.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(75)).await;

        assert_eq!(cache.directory.peek_stale(DIRECTORY_KEY).unwrap().len(), 2);
        cache.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stats_cover_both_caches() {
        let (_source, cache) = cache_with(&config());
        cache.initialize().await.unwrap();
        cache.get().await.unwrap();
        cache.get_one("rec1").await.unwrap();

        let stats = cache.stats();
        assert_eq!(stats.directory.hits, 1);
        assert_eq!(stats.directory.refreshes, 1);
        assert_eq!(stats.profiles.misses, 1);
        assert_eq!(stats.breaker, CircuitState::Closed);
    }
}
