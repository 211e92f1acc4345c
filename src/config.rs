//! Configuration management

use std::{env, path::Path, sync::LazyLock, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Matches `${VAR}` and `${VAR:-default}`
static ENV_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}").expect("env pattern is a valid regex")
});

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct Config {
    /// Upstream data source
    pub source: SourceConfig,
    /// Refreshing cache
    pub cache: CacheConfig,
    /// Failsafe configuration for upstream calls
    pub failsafe: FailsafeConfig,
    /// Inbound admission control
    pub rate_limit: RateLimitConfig,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or holds values that fail [`Config::validate`].
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // MENTOR_SHIELD_CACHE__TTL=10m etc.
        figment = figment.merge(Env::prefixed("MENTOR_SHIELD_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.expand_env_vars();
        config.validate()?;

        Ok(config)
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in source settings
    fn expand_env_vars(&mut self) {
        self.source.base_url = expand_string(&self.source.base_url);
        if let Some(key) = self.source.api_key.as_mut() {
            *key = expand_string(key);
        }
    }

    /// Reject settings the failsafe components cannot work with
    pub fn validate(&self) -> Result<()> {
        let cb = &self.failsafe.circuit_breaker;
        if !(cb.failure_ratio > 0.0 && cb.failure_ratio <= 1.0) {
            return Err(Error::Config(format!(
                "circuit_breaker.failure_ratio must be in (0, 1], got {}",
                cb.failure_ratio
            )));
        }
        if cb.min_requests == 0 || cb.max_requests == 0 {
            return Err(Error::Config(
                "circuit_breaker.min_requests and max_requests must be at least 1".to_string(),
            ));
        }

        let retry = &self.failsafe.retry;
        if retry.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be at least 1".to_string()));
        }
        if retry.multiplier < 1.0 {
            return Err(Error::Config(format!(
                "retry.multiplier must be >= 1.0, got {}",
                retry.multiplier
            )));
        }
        if retry.initial_backoff > retry.max_backoff {
            return Err(Error::Config(
                "retry.initial_backoff must not exceed retry.max_backoff".to_string(),
            ));
        }

        let periods = [
            ("cache.ttl", self.cache.ttl),
            ("cache.call_timeout", self.cache.call_timeout),
            ("cache.refresh_interval", self.cache.refresh_interval),
            ("rate_limit.sweep_interval", self.rate_limit.sweep_interval),
        ];
        for (name, period) in periods {
            if period.is_zero() {
                return Err(Error::Config(format!("{name} must be non-zero")));
            }
        }

        for (class, limit) in self.rate_limit.classes() {
            if !(limit.rate_per_second.is_finite() && limit.rate_per_second > 0.0) {
                return Err(Error::Config(format!(
                    "rate_limit.{class}.rate_per_second must be positive"
                )));
            }
            if limit.burst == 0 {
                return Err(Error::Config(format!(
                    "rate_limit.{class}.burst must be at least 1"
                )));
            }
        }

        Ok(())
    }
}

/// Expand environment variables in a string
fn expand_string(value: &str) -> String {
    ENV_PATTERN
        .replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
}

/// Upstream data source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Base URL of the records API (e.g. an Airtable table endpoint)
    pub base_url: String,
    /// Bearer token; supports `${VAR}` expansion
    pub api_key: Option<String>,
    /// HTTP client timeout for a single request
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Maximum pages followed when listing records
    pub max_pages: u32,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            api_key: None,
            request_timeout: Duration::from_secs(10),
            max_pages: 50,
        }
    }
}

/// Refreshing cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// How long a fetched value stays fresh
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// How long a caller waits on someone else's refresh before giving up
    #[serde(with = "humantime_serde")]
    pub refresh_wait: Duration,
    /// Timeout wrapped around every single upstream call
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,
    /// Enable the proactive background refresher
    pub background_refresh: bool,
    /// How often the background refresher looks for entries to renew
    #[serde(with = "humantime_serde")]
    pub refresh_interval: Duration,
    /// Entries expiring within this window are renewed ahead of time
    #[serde(with = "humantime_serde")]
    pub refresh_ahead: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            refresh_wait: Duration::from_secs(2),
            call_timeout: Duration::from_secs(30),
            background_refresh: true,
            refresh_interval: Duration::from_secs(30),
            refresh_ahead: Duration::from_secs(30),
        }
    }
}

/// Failsafe configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct FailsafeConfig {
    /// Circuit breaker configuration
    pub circuit_breaker: CircuitBreakerConfig,
    /// Retry configuration
    pub retry: RetryConfig,
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Enable circuit breaker
    pub enabled: bool,
    /// Completed calls in the window before the failure ratio is considered
    pub min_requests: u32,
    /// Failure ratio (0.0-1.0) that opens the circuit
    pub failure_ratio: f64,
    /// Trial calls allowed while half-open; this many successes close it
    pub max_requests: u32,
    /// Time to wait in the open state before allowing trial calls
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Rolling window after which closed-state counts are cleared (0 = never)
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_requests: 3,
            failure_ratio: 0.6,
            max_requests: 3,
            timeout: Duration::from_secs(30),
            interval: Duration::from_secs(60),
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Enable retries
    pub enabled: bool,
    /// Maximum attempts, including the first
    pub max_attempts: u32,
    /// Initial backoff duration
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    /// Maximum backoff duration (applied before jitter)
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f64,
    /// Perturb each delay by up to ±25%
    pub jitter: bool,
    /// Overall budget for all attempts and sleeps
    #[serde(with = "humantime_serde::option")]
    pub max_elapsed: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: true,
            max_elapsed: Some(Duration::from_secs(60)),
        }
    }
}

/// Token bucket limits for one endpoint class
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LimitConfig {
    /// Sustained refill rate
    pub rate_per_second: f64,
    /// Bucket capacity
    pub burst: u32,
}

impl LimitConfig {
    /// Limit of `requests` per `period`, with the bucket holding `burst`
    #[must_use]
    pub fn per_period(requests: u32, period: Duration, burst: u32) -> Self {
        Self {
            rate_per_second: f64::from(requests) / period.as_secs_f64(),
            burst,
        }
    }
}

/// Inbound rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable admission control
    pub enabled: bool,
    /// How often idle, fully refilled buckets are evicted
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
    /// Tracked identities per limiter before an early sweep is forced
    pub max_identities: Option<usize>,
    /// Use the first `X-Forwarded-For` hop as client identity
    pub trust_forwarded_for: bool,
    /// Read-heavy endpoints (listing, search)
    pub general: LimitConfig,
    /// Spam-prone forms (contact, mentorship requests)
    pub forms: LimitConfig,
    /// Expensive profile writes
    pub profile_writes: LimitConfig,
    /// Login-style endpoints
    pub login: LimitConfig,
}

impl RateLimitConfig {
    /// Every class with its config key
    #[must_use]
    pub fn classes(&self) -> [(&'static str, LimitConfig); 4] {
        [
            ("general", self.general),
            ("forms", self.forms),
            ("profile_writes", self.profile_writes),
            ("login", self.login),
        ]
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sweep_interval: Duration::from_secs(60),
            max_identities: Some(100_000),
            trust_forwarded_for: false,
            general: LimitConfig {
                rate_per_second: 100.0,
                burst: 200,
            },
            forms: LimitConfig {
                rate_per_second: 5.0,
                burst: 10,
            },
            profile_writes: LimitConfig {
                rate_per_second: 10.0,
                burst: 20,
            },
            login: LimitConfig::per_period(2, Duration::from_secs(300), 2),
        }
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s", "250ms")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format(*duration))
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    const NANOS_PER_SEC: u128 = 1_000_000_000;

    fn format(duration: Duration) -> String {
        if duration.subsec_nanos() == 0 {
            format!("{}s", duration.as_secs())
        } else if duration.subsec_nanos() % 1_000_000 == 0 {
            format!("{}ms", duration.as_millis())
        } else {
            format!("{}ns", duration.as_nanos())
        }
    }

    /// Parse "1500ns", "250ms", "30s", "5m", "1h" or a bare number of seconds
    pub(crate) fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let number = |n: &str| {
            n.trim()
                .parse::<u64>()
                .map_err(|e| format!("invalid duration '{s}': {e}"))
        };
        let scaled = |n: &str, unit: u64| {
            number(n)?
                .checked_mul(unit)
                .map(Duration::from_secs)
                .ok_or_else(|| format!("duration '{s}' is out of range"))
        };

        // "ns" and "ms" must be checked before "m" and "s"
        if let Some(ns) = s.strip_suffix("ns") {
            let nanos = ns
                .trim()
                .parse::<u128>()
                .map_err(|e| format!("invalid duration '{s}': {e}"))?;
            let secs = u64::try_from(nanos / NANOS_PER_SEC)
                .map_err(|_| format!("duration '{s}' is out of range"))?;
            let subsec = u32::try_from(nanos % NANOS_PER_SEC)
                .map_err(|_| format!("duration '{s}' is out of range"))?;
            Ok(Duration::new(secs, subsec))
        } else if let Some(ms) = s.strip_suffix("ms") {
            number(ms).map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            number(secs).map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            scaled(mins, 60)
        } else if let Some(hours) = s.strip_suffix('h') {
            scaled(hours, 3600)
        } else {
            number(s).map(Duration::from_secs)
        }
    }

    /// Same format for `Option<Duration>`; `null` or `"none"` means unset
    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        /// Serialize an optional duration
        ///
        /// # Errors
        ///
        /// Returns a serialization error if the serializer fails.
        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => super::serialize(d, serializer),
                None => serializer.serialize_none(),
            }
        }

        /// Deserialize an optional duration
        ///
        /// # Errors
        ///
        /// Returns a deserialization error if the string cannot be parsed as a duration.
        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            match Option::<String>::deserialize(deserializer)? {
                None => Ok(None),
                Some(s) if s.eq_ignore_ascii_case("none") => Ok(None),
                Some(s) => super::parse(&s)
                    .map(Some)
                    .map_err(serde::de::Error::custom),
            }
        }
    }
}
