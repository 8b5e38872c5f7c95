//! Mapping of admission results onto HTTP responses.

use axum::{
    http::{header::RETRY_AFTER, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::error::AdmissionError;
use crate::ratelimit::QuotaHeaders;

/// Attach the `RateLimit-*` headers to a response.
pub fn apply_quota_headers(headers: &mut HeaderMap, quota: &QuotaHeaders) {
    for (name, value) in quota.pairs() {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            headers.insert(name, value);
        }
    }
}

impl IntoResponse for AdmissionError {
    fn into_response(self) -> Response {
        match self {
            AdmissionError::RateLimitExceeded { message, quota, .. } => {
                let mut response =
                    (StatusCode::TOO_MANY_REQUESTS, Json(json!({ "error": message }))).into_response();
                let headers = response.headers_mut();
                apply_quota_headers(headers, &quota);
                headers.insert(RETRY_AFTER, HeaderValue::from(quota.reset));
                response
            }
            AdmissionError::StoreUnavailable(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": "Service temporarily unavailable, please try again later." })),
            )
                .into_response(),
            AdmissionError::Config(_) | AdmissionError::Io(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Internal server error" })),
            )
                .into_response(),
        }
    }
}
