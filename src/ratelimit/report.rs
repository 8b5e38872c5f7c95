//! Translation of decisions into quota metadata and denial errors.
//!
//! Nothing here knows about HTTP status codes; the outer layer maps
//! [`AdmissionError::RateLimitExceeded`] to a rejection and
//! [`AdmissionError::StoreUnavailable`] to a temporary failure.

use chrono::{DateTime, Utc};
use super::clock::elapsed;
use super::limiter::{Decision, DecisionSource};
use super::policy::Policy;
use crate::error::{AdmissionError, Result};

/// Header carrying the policy's limit.
pub const HEADER_LIMIT: &str = "RateLimit-Limit";
/// Header carrying the quota left in the current window.
pub const HEADER_REMAINING: &str = "RateLimit-Remaining";
/// Header carrying the seconds until the window resets.
pub const HEADER_RESET: &str = "RateLimit-Reset";
/// Header attached to denials.
pub const HEADER_RETRY_AFTER: &str = "Retry-After";

/// Quota metadata for one decision, ready to render as response headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaHeaders {
    /// The policy's maximum events per window
    pub limit: u64,
    /// Events left in the current window
    pub remaining: u64,
    /// Whole seconds until the window resets, rounded up
    pub reset: u64,
}

impl QuotaHeaders {
    /// Build the metadata for `decision` as seen at `now`.
    pub fn from_decision(decision: &Decision, now: DateTime<Utc>) -> Self {
        let until_reset = elapsed(now, decision.reset_at);
        let mut reset = until_reset.as_secs();
        if until_reset.subsec_nanos() > 0 {
            reset += 1;
        }

        Self {
            limit: decision.limit,
            remaining: decision.remaining,
            reset,
        }
    }

    /// The standard `RateLimit-*` header pairs.
    pub fn pairs(&self) -> [(&'static str, String); 3] {
        [
            (HEADER_LIMIT, self.limit.to_string()),
            (HEADER_REMAINING, self.remaining.to_string()),
            (HEADER_RESET, self.reset.to_string()),
        ]
    }
}

/// Enforce a decision.
///
/// Returns the quota metadata when the request may proceed, or a
/// `RateLimitExceeded` error carrying the policy's message and the same
/// metadata when it may not. A denial caused by a failed store is a
/// `StoreUnavailable` error instead; the caller is not over any limit.
pub fn enforce(policy: &Policy, decision: &Decision, now: DateTime<Utc>) -> Result<QuotaHeaders> {
    if decision.source == DecisionSource::FailClosed {
        return Err(AdmissionError::StoreUnavailable(format!(
            "policy '{}' could not reach its window store",
            policy.name()
        )));
    }

    let quota = QuotaHeaders::from_decision(decision, now);
    if decision.allowed {
        Ok(quota)
    } else {
        Err(AdmissionError::RateLimitExceeded {
            policy: policy.name().to_string(),
            message: policy.message().to_string(),
            quota,
        })
    }
}
