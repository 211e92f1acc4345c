//! mentor-shield
//!
//! Resilience layer for a mentor-directory backend whose records live in a
//! slow, rate-limited upstream.
//!
//! # Features
//!
//! - **Refreshing cache**: TTL-bounded, one refresh in flight per key, stale
//!   values served while the upstream is failing
//! - **Failsafes**: circuit breaker around retries with exponential backoff,
//!   jitter and a per-call timeout
//! - **Admission control**: per-client token buckets per endpoint class, with
//!   an axum middleware
//!
//! # Lifecycle
//!
//! Build a [`cache::MentorCache`] over a [`source::DataSource`], call
//! `initialize`, serve reads with `get` / `get_one`, and `shutdown` to stop
//! the background refresher.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod admission;
pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod failsafe;
pub mod metrics;
pub mod source;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// # Errors
///
/// Returns [`Error::Internal`] if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    };

    installed.map_err(|e| Error::Internal(format!("tracing already initialized: {e}")))
}
