//! Inbound admission control
//!
//! One [`RateLimiter`] per endpoint class, plus an axum middleware that
//! answers 429 with `Retry-After` when a client's bucket is empty.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json,
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::Result;
use crate::config::{LimitConfig, RateLimitConfig};
use crate::failsafe::{Admission, RateLimiter, spawn_sweeper};

/// Identity used when a request carries no usable client address
pub const UNKNOWN_IDENTITY: &str = "unknown";

/// Endpoint classes with independent limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointClass {
    /// Directory reads and search
    General,
    /// Contact and application forms
    Forms,
    /// Profile edits
    ProfileWrites,
    /// Login attempts
    Login,
}

impl EndpointClass {
    /// Every class, in config order
    pub const ALL: [Self; 4] = [Self::General, Self::Forms, Self::ProfileWrites, Self::Login];

    /// Config/metric name of the class
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::General => "general",
            Self::Forms => "forms",
            Self::ProfileWrites => "profile_writes",
            Self::Login => "login",
        }
    }
}

impl fmt::Display for EndpointClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-class admission gate
pub struct AdmissionControl {
    enabled: bool,
    trust_forwarded_for: bool,
    sweep_interval: Duration,
    general: Arc<RateLimiter>,
    forms: Arc<RateLimiter>,
    profile_writes: Arc<RateLimiter>,
    login: Arc<RateLimiter>,
}

impl AdmissionControl {
    /// Build one limiter per class
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] when a class has a non-positive rate
    /// or a zero burst.
    pub fn new(config: &RateLimitConfig) -> Result<Self> {
        let build = |class: EndpointClass, limit: &LimitConfig| -> Result<Arc<RateLimiter>> {
            Ok(Arc::new(
                RateLimiter::from_config(class.as_str(), limit)?
                    .with_max_identities(config.max_identities),
            ))
        };

        Ok(Self {
            enabled: config.enabled,
            trust_forwarded_for: config.trust_forwarded_for,
            sweep_interval: config.sweep_interval,
            general: build(EndpointClass::General, &config.general)?,
            forms: build(EndpointClass::Forms, &config.forms)?,
            profile_writes: build(EndpointClass::ProfileWrites, &config.profile_writes)?,
            login: build(EndpointClass::Login, &config.login)?,
        })
    }

    /// Limiter backing `class`
    #[must_use]
    pub fn limiter(&self, class: EndpointClass) -> &Arc<RateLimiter> {
        match class {
            EndpointClass::General => &self.general,
            EndpointClass::Forms => &self.forms,
            EndpointClass::ProfileWrites => &self.profile_writes,
            EndpointClass::Login => &self.login,
        }
    }

    /// Consume a token from `identity`'s bucket for `class`
    pub fn admit(&self, class: EndpointClass, identity: &str) -> bool {
        self.check(class, identity).is_admitted()
    }

    /// Like [`admit`](Self::admit), with the wait time on denial
    pub fn check(&self, class: EndpointClass, identity: &str) -> Admission {
        if !self.enabled {
            return Admission::Admitted;
        }
        self.limiter(class).check(identity)
    }

    /// Whether `X-Forwarded-For` is used as the client identity
    #[must_use]
    pub fn trusts_forwarded_for(&self) -> bool {
        self.trust_forwarded_for
    }

    /// Spawn the idle-bucket sweeper for every class
    pub fn spawn_sweeper(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let limiters = EndpointClass::ALL
            .iter()
            .map(|class| Arc::clone(self.limiter(*class)))
            .collect();
        spawn_sweeper(limiters, self.sweep_interval, shutdown)
    }
}

/// Middleware state: the shared gate and the class of the routes it guards
#[derive(Clone)]
pub struct AdmissionState {
    /// Shared admission gate
    pub control: Arc<AdmissionControl>,
    /// Class charged for requests through this layer
    pub class: EndpointClass,
}

impl AdmissionState {
    /// State charging `class` against `control`
    #[must_use]
    pub fn new(control: Arc<AdmissionControl>, class: EndpointClass) -> Self {
        Self { control, class }
    }
}

/// Rate-limiting middleware
///
/// Use with `axum::middleware::from_fn_with_state`. The client identity is
/// the peer address from `ConnectInfo`, or the first `X-Forwarded-For` hop
/// when the config trusts it.
pub async fn enforce(
    State(state): State<AdmissionState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let identity = client_identity(&request, state.control.trusts_forwarded_for());

    match state.control.check(state.class, &identity) {
        Admission::Admitted => {
            debug!(class = %state.class, identity = %identity, "Admitted");
            next.run(request).await
        }
        Admission::Denied { retry_after } => {
            warn!(
                class = %state.class,
                identity = %identity,
                path = %request.uri().path(),
                "Rate limit exceeded"
            );
            rate_limited_response(retry_after)
        }
    }
}

fn client_identity(request: &Request<Body>, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for {
        let forwarded = request
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(ip) = forwarded {
            return ip.to_string();
        }
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map_or_else(|| UNKNOWN_IDENTITY.to_string(), |ConnectInfo(addr)| addr.ip().to_string())
}

/// Create a 429 response; `Retry-After` is rounded up to whole seconds
fn rate_limited_response(retry_after: Duration) -> Response {
    let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
    let secs = secs.max(1);
    (
        StatusCode::TOO_MANY_REQUESTS,
        [(header::RETRY_AFTER, secs.to_string())],
        Json(json!({
            "error": "Rate limit exceeded",
            "retry_after_secs": secs
        })),
    )
        .into_response()
}
