//! axum middleware applying a limiter in front of a router.
//!
//! ```ignore
//! let state = AdmissionState::new(tiers.authentication().clone());
//! let app = Router::new()
//!     .route("/login", post(login))
//!     .layer(axum::middleware::from_fn_with_state(state, admission_middleware));
//! ```
//!
//! Handlers behind a failures-only limiter take `Extension<OutcomeReporter>`
//! and report whether the guarded operation succeeded.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{debug, warn};

use super::response::apply_quota_headers;
use crate::error::AdmissionError;
use crate::ratelimit::{enforce, RateLimiter, RequestContext};

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// The authenticated principal, inserted as a request extension by the
/// upstream authentication layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedIdentity(pub String);

/// State for [`admission_middleware`].
#[derive(Clone)]
pub struct AdmissionState {
    limiter: Arc<RateLimiter>,
    trust_forwarded_for: bool,
}

impl AdmissionState {
    /// Guard with `limiter`, taking the client address from the connection.
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self {
            limiter,
            trust_forwarded_for: false,
        }
    }

    /// Take the client address from the first `X-Forwarded-For` hop when present.
    pub fn trust_forwarded_for(mut self, trust: bool) -> Self {
        self.trust_forwarded_for = trust;
        self
    }
}

/// Handle for reporting the outcome of a guarded operation.
///
/// Only the first report counts; later calls are ignored.
#[derive(Clone)]
pub struct OutcomeReporter {
    limiter: Arc<RateLimiter>,
    key: Option<String>,
    reported: Arc<AtomicBool>,
}

impl OutcomeReporter {
    /// Report whether the guarded operation succeeded.
    pub fn record(&self, succeeded: bool) {
        let Some(key) = self.key.as_deref() else {
            return;
        };
        if self.reported.swap(true, Ordering::SeqCst) {
            debug!(key = %key, "Outcome already reported");
            return;
        }
        self.limiter.record_outcome(key, succeeded);
    }
}

/// Check the request against the limiter, rejecting with 429 when denied and
/// attaching quota headers to the handler's response when admitted.
pub async fn admission_middleware(
    State(state): State<AdmissionState>,
    mut request: Request,
    next: Next,
) -> Response {
    let ctx = request_context(&request, state.trust_forwarded_for);
    let decision = state.limiter.check(&ctx);

    let quota = match enforce(state.limiter.policy(), &decision, state.limiter.now()) {
        Ok(quota) => quota,
        Err(e @ AdmissionError::StoreUnavailable(_)) => {
            warn!(
                policy = %state.limiter.policy().name(),
                error = %e,
                "Rejecting request while the window store is unavailable"
            );
            return e.into_response();
        }
        Err(e) => {
            warn!(
                policy = %state.limiter.policy().name(),
                key = ?decision.key,
                "Rejecting rate limited request"
            );
            return e.into_response();
        }
    };

    request.extensions_mut().insert(OutcomeReporter {
        limiter: state.limiter.clone(),
        key: decision.key,
        reported: Arc::new(AtomicBool::new(false)),
    });

    let mut response = next.run(request).await;
    apply_quota_headers(response.headers_mut(), &quota);
    response
}

fn request_context(request: &Request, trust_forwarded_for: bool) -> RequestContext {
    let connect = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    let identity = request
        .extensions()
        .get::<AuthenticatedIdentity>()
        .map(|AuthenticatedIdentity(id)| id.clone());

    RequestContext {
        remote_addr: client_addr(request.headers(), connect, trust_forwarded_for),
        identity,
    }
}

/// The client address for a request: the first `X-Forwarded-For` hop when
/// trusted and present, otherwise the peer address of the connection.
pub(crate) fn client_addr(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trust_forwarded_for: bool,
) -> Option<String> {
    let forwarded = if trust_forwarded_for {
        headers
            .get(X_FORWARDED_FOR)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    } else {
        None
    };

    forwarded.or_else(|| peer.map(|addr| addr.to_string()))
}
