//! Admission service: `Check` and `RecordOutcome` over HTTP/JSON.
//!
//! Lets a reverse proxy or another process consult the limiters without
//! embedding them.

use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use super::middleware::client_addr;
use super::response::apply_quota_headers;
use crate::error::AdmissionError;
use crate::ratelimit::{enforce, DecisionSource, RequestContext, Tiers};

/// Body of a check request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckRequest {
    /// Client address, in any form the key strategy understands. When
    /// absent, the caller's own address is used.
    #[serde(default)]
    pub remote_addr: Option<String>,
    /// Authenticated principal, if known
    #[serde(default)]
    pub identity: Option<String>,
}

/// Body of a successful check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResponse {
    /// Always true; denials are answered with 429 or 503
    pub allowed: bool,
    /// Key to send back with the outcome; absent when bypassed
    pub key: Option<String>,
    /// The policy's maximum events per window
    pub limit: u64,
    /// Events left in the current window
    pub remaining: u64,
    /// Seconds until the window resets
    pub reset: u64,
    /// How the decision was reached
    pub source: DecisionSource,
}

/// Body of an outcome report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeRequest {
    /// The key returned by the check
    pub key: String,
    /// Whether the guarded operation succeeded
    pub succeeded: bool,
}

#[derive(Clone)]
struct ServiceState {
    tiers: Tiers,
    trust_forwarded_for: bool,
}

/// Build the admission service router.
///
/// A check without a `remote_addr` is keyed on the caller's address: the
/// first `X-Forwarded-For` hop when `trust_forwarded_for` is set, otherwise
/// the connection's peer address.
pub fn router(tiers: Tiers, trust_forwarded_for: bool) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/check/:policy", post(check))
        .route("/v1/outcome/:policy", post(record_outcome))
        .with_state(ServiceState {
            tiers,
            trust_forwarded_for,
        })
}

async fn healthz() -> &'static str {
    "ok"
}

fn unknown_policy(policy: &str) -> Response {
    warn!(policy = %policy, "Request for unknown policy");
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": format!("unknown policy '{}'", policy) })),
    )
        .into_response()
}

#[instrument(skip(state, headers, peer, body))]
async fn check(
    State(state): State<ServiceState>,
    Path(policy): Path<String>,
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
    Json(body): Json<CheckRequest>,
) -> Response {
    let Some(limiter) = state.tiers.get(&policy) else {
        return unknown_policy(&policy);
    };

    let remote_addr = body.remote_addr.or_else(|| {
        client_addr(
            &headers,
            peer.map(|ConnectInfo(addr)| addr),
            state.trust_forwarded_for,
        )
    });
    let ctx = RequestContext {
        remote_addr,
        identity: body.identity,
    };
    let decision = limiter.check(&ctx);

    match enforce(limiter.policy(), &decision, limiter.now()) {
        Ok(quota) => {
            info!(
                key = ?decision.key,
                remaining = quota.remaining,
                source = ?decision.source,
                "Rate limit decision made"
            );
            let mut response = Json(CheckResponse {
                allowed: true,
                key: decision.key,
                limit: quota.limit,
                remaining: quota.remaining,
                reset: quota.reset,
                source: decision.source,
            })
            .into_response();
            apply_quota_headers(response.headers_mut(), &quota);
            response
        }
        Err(e @ AdmissionError::StoreUnavailable(_)) => {
            warn!(key = ?decision.key, error = %e, "Rate limit decision made: store unavailable");
            e.into_response()
        }
        Err(e) => {
            info!(
                key = ?decision.key,
                source = ?decision.source,
                "Rate limit decision made: over limit"
            );
            e.into_response()
        }
    }
}

#[instrument(skip(state, body))]
async fn record_outcome(
    State(state): State<ServiceState>,
    Path(policy): Path<String>,
    Json(body): Json<OutcomeRequest>,
) -> Response {
    let Some(limiter) = state.tiers.get(&policy) else {
        return unknown_policy(&policy);
    };

    if body.key.trim().is_empty() {
        warn!("Received outcome report with empty key");
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "key is required" })),
        )
            .into_response();
    }

    debug!(key = %body.key, succeeded = body.succeeded, "Recording outcome");
    limiter.record_outcome(&body.key, body.succeeded);
    StatusCode::NO_CONTENT.into_response()
}
