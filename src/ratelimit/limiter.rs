//! Core rate limiter implementation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::clock::{add_duration, Clock, SystemClock};
use super::key::{RequestContext, StoreKey};
use super::policy::{CountingMode, Policy};
use super::store::{WindowEntry, WindowStore};

/// What the limiter does when its store cannot answer.
///
/// Has no default; every deployment picks one explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreFailureMode {
    /// Admit the request.
    FailOpen,
    /// Deny the request.
    FailClosed,
}

/// How a decision was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    /// Counted against the store.
    Store,
    /// The policy's bypass predicate matched; nothing was counted.
    Bypass,
    /// The store failed and the limiter is configured to admit.
    FailOpen,
    /// The store failed and the limiter is configured to deny.
    FailClosed,
}

/// The outcome of one admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Events still permitted in the current window
    pub remaining: u64,
    /// When the current window ends
    pub reset_at: DateTime<Utc>,
    /// The policy's `max_events`
    pub limit: u64,
    /// The derived identity, to pass back to `record_outcome`.
    /// `None` for bypassed requests.
    pub key: Option<String>,
    /// How the decision was reached
    pub source: DecisionSource,
}

impl Decision {
    /// Whether the request was denied.
    pub fn is_denied(&self) -> bool {
        !self.allowed
    }
}

/// A policy bound to a window store.
///
/// Cheap to share behind an `Arc`; all mutable state lives in the store.
pub struct RateLimiter {
    policy: Policy,
    store: Arc<dyn WindowStore>,
    clock: Arc<dyn Clock>,
    on_store_error: StoreFailureMode,
}

impl RateLimiter {
    /// Create a limiter using the system clock.
    pub fn new(policy: Policy, store: Arc<dyn WindowStore>, on_store_error: StoreFailureMode) -> Self {
        Self::with_clock(policy, store, Arc::new(SystemClock), on_store_error)
    }

    /// Create a limiter with an explicit clock.
    pub fn with_clock(
        policy: Policy,
        store: Arc<dyn WindowStore>,
        clock: Arc<dyn Clock>,
        on_store_error: StoreFailureMode,
    ) -> Self {
        Self {
            policy,
            store,
            clock,
            on_store_error,
        }
    }

    /// The policy this limiter enforces.
    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// The current time according to this limiter's clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Decide whether a request may proceed.
    ///
    /// For `AllRequests` policies this counts the request. For `FailuresOnly`
    /// policies it only reads the current count; the caller reports the
    /// outcome afterwards through [`record_outcome`](Self::record_outcome).
    pub fn check(&self, req: &RequestContext) -> Decision {
        let now = self.clock.now();
        let limit = self.policy.max_events();

        if self.policy.bypass().applies(req) {
            trace!(policy = %self.policy.name(), "Bypassing rate limit");
            return Decision {
                allowed: true,
                remaining: limit,
                reset_at: add_duration(now, self.policy.window()),
                limit,
                key: None,
                source: DecisionSource::Bypass,
            };
        }

        let identity = self.policy.key_strategy().derive(req);
        let store_key = StoreKey::new(self.policy.name(), &identity);
        let window = self.policy.window();

        trace!(key = %store_key, mode = ?self.policy.counting_mode(), "Checking rate limit");

        let result = match self.policy.counting_mode() {
            CountingMode::AllRequests => self
                .store
                .increment(&store_key.to_string(), now, window)
                .map(|entry| (entry, entry.count <= limit)),
            CountingMode::FailuresOnly => self
                .store
                .peek(&store_key.to_string(), now, window)
                .map(|entry| (entry, entry.count < limit)),
        };

        match result {
            Ok((entry, allowed)) => {
                if !allowed {
                    debug!(
                        key = %store_key,
                        count = entry.count,
                        limit = limit,
                        "Rate limit exceeded"
                    );
                }
                Decision {
                    allowed,
                    remaining: limit.saturating_sub(entry.count),
                    reset_at: add_duration(entry.window_start, window),
                    limit,
                    key: Some(identity),
                    source: DecisionSource::Store,
                }
            }
            Err(e) => {
                let allowed = self.on_store_error == StoreFailureMode::FailOpen;
                warn!(
                    key = %store_key,
                    error = %e,
                    fail_open = allowed,
                    "Window store failed during rate limit check"
                );
                Decision {
                    allowed,
                    remaining: if allowed { limit } else { 0 },
                    reset_at: add_duration(now, window),
                    limit,
                    key: Some(identity),
                    source: if allowed {
                        DecisionSource::FailOpen
                    } else {
                        DecisionSource::FailClosed
                    },
                }
            }
        }
    }

    /// Report the outcome of a guarded operation.
    ///
    /// Only failures count, and only for `FailuresOnly` policies; for any
    /// other policy this does nothing. `key` is the one returned in
    /// [`Decision::key`].
    pub fn record_outcome(&self, key: &str, succeeded: bool) {
        if self.policy.counting_mode() != CountingMode::FailuresOnly {
            debug!(policy = %self.policy.name(), "Ignoring outcome for a policy that counts all requests");
            return;
        }
        if succeeded {
            trace!(policy = %self.policy.name(), key = %key, "Successful outcome, not counted");
            return;
        }

        let store_key = StoreKey::new(self.policy.name(), key);
        match self
            .store
            .increment(&store_key.to_string(), self.clock.now(), self.policy.window())
        {
            Ok(entry) => trace!(key = %store_key, count = entry.count, "Counted failed outcome"),
            Err(e) => warn!(key = %store_key, error = %e, "Window store failed while recording outcome"),
        }
    }

    /// Clear the counter for a derived key under this policy.
    pub fn reset(&self, key: &str) -> crate::error::Result<()> {
        let store_key = StoreKey::new(self.policy.name(), key);
        debug!(key = %store_key, "Resetting rate limit window");
        self.store.reset(&store_key.to_string())
    }

    /// Read the current window for a derived key without counting.
    pub fn peek(&self, key: &str) -> crate::error::Result<WindowEntry> {
        let store_key = StoreKey::new(self.policy.name(), key);
        self.store
            .peek(&store_key.to_string(), self.clock.now(), self.policy.window())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AdmissionError, Result};
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::key::KeyStrategy;
    use crate::ratelimit::policy::Bypass;
    use crate::ratelimit::store::MemoryStore;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    struct UnavailableStore;

    impl WindowStore for UnavailableStore {
        fn increment(&self, _: &str, _: DateTime<Utc>, _: Duration) -> Result<WindowEntry> {
            Err(AdmissionError::StoreUnavailable("connection refused".to_string()))
        }

        fn peek(&self, _: &str, _: DateTime<Utc>, _: Duration) -> Result<WindowEntry> {
            Err(AdmissionError::StoreUnavailable("connection refused".to_string()))
        }

        fn reset(&self, _: &str) -> Result<()> {
            Err(AdmissionError::StoreUnavailable("connection refused".to_string()))
        }
    }

    fn limiter_with(policy: Policy) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let limiter = RateLimiter::with_clock(
            policy,
            Arc::new(MemoryStore::new()),
            clock.clone(),
            StoreFailureMode::FailClosed,
        );
        (limiter, clock)
    }

    fn small_policy(max: u64, mode: CountingMode) -> Policy {
        Policy::new(
            "test",
            Duration::from_secs(60),
            max,
            mode,
            KeyStrategy::ByRemoteAddress,
            "slow down",
        )
        .unwrap()
    }

    #[test]
    fn test_allows_up_to_max_then_denies() {
        let (limiter, _) = limiter_with(small_policy(5, CountingMode::AllRequests));
        let req = RequestContext::from_addr("10.0.0.1");

        for i in 1..=5 {
            let decision = limiter.check(&req);
            assert!(decision.allowed, "Request {} should be allowed", i);
            assert_eq!(decision.remaining, 5 - i);
            assert_eq!(decision.limit, 5);
        }

        let decision = limiter.check(&req);
        assert!(decision.is_denied());
        assert_eq!(decision.remaining, 0);
    }

    #[test]
    fn test_window_elapse_starts_fresh() {
        let (limiter, clock) = limiter_with(small_policy(2, CountingMode::AllRequests));
        let req = RequestContext::from_addr("10.0.0.1");

        for _ in 0..4 {
            limiter.check(&req);
        }
        assert!(limiter.check(&req).is_denied());

        clock.advance(Duration::from_secs(60));
        let decision = limiter.check(&req);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 1);
        assert_eq!(limiter.peek("ip:10.0.0.1").unwrap().count, 1);
    }

    #[test]
    fn test_reset_at_is_window_end() {
        let (limiter, clock) = limiter_with(small_policy(3, CountingMode::AllRequests));
        let req = RequestContext::from_addr("10.0.0.1");
        let start = clock.now();

        let first = limiter.check(&req);
        clock.advance(Duration::from_secs(20));
        let second = limiter.check(&req);

        let expected = add_duration(start, Duration::from_secs(60));
        assert_eq!(first.reset_at, expected);
        assert_eq!(second.reset_at, expected);
    }

    #[test]
    fn test_keys_are_isolated() {
        let (limiter, _) = limiter_with(small_policy(1, CountingMode::AllRequests));

        assert!(limiter.check(&RequestContext::from_addr("10.0.0.1")).allowed);
        assert!(limiter.check(&RequestContext::from_addr("10.0.0.1")).is_denied());
        assert!(limiter.check(&RequestContext::from_addr("10.0.0.2")).allowed);
    }

    #[test]
    fn test_policies_sharing_a_store_do_not_share_counters() {
        let store: Arc<dyn WindowStore> = Arc::new(MemoryStore::new());
        let general = RateLimiter::new(Policy::general(), store.clone(), StoreFailureMode::FailClosed);
        let upload = RateLimiter::new(Policy::upload(), store, StoreFailureMode::FailClosed);
        let req = RequestContext::from_addr("10.0.0.1");

        for _ in 0..15 {
            assert!(upload.check(&req).allowed);
        }
        assert!(upload.check(&req).is_denied());

        let decision = general.check(&req);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 149);
    }

    #[test]
    fn test_failures_only_successes_never_count() {
        let (limiter, _) = limiter_with(small_policy(3, CountingMode::FailuresOnly));
        let req = RequestContext::from_addr("10.0.0.1");

        for _ in 0..10 {
            let decision = limiter.check(&req);
            assert!(decision.allowed);
            assert_eq!(decision.remaining, 3);
            limiter.record_outcome(decision.key.as_deref().unwrap(), true);
        }
    }

    #[test]
    fn test_failures_only_denies_after_max_failures() {
        let (limiter, _) = limiter_with(small_policy(3, CountingMode::FailuresOnly));
        let req = RequestContext::from_addr("10.0.0.1");

        for i in 0..3 {
            let decision = limiter.check(&req);
            assert!(decision.allowed);
            assert_eq!(decision.remaining, 3 - i);
            limiter.record_outcome(decision.key.as_deref().unwrap(), false);
        }

        let decision = limiter.check(&req);
        assert!(decision.is_denied());
        assert_eq!(decision.remaining, 0);
    }

    #[test]
    fn test_failures_only_in_flight_attempts_are_admitted_until_recorded() {
        let (limiter, _) = limiter_with(small_policy(3, CountingMode::FailuresOnly));
        let req = RequestContext::from_addr("10.0.0.1");

        let in_flight: Vec<_> = (0..5).map(|_| limiter.check(&req)).collect();
        assert!(in_flight.iter().all(|d| d.allowed));

        for decision in &in_flight {
            limiter.record_outcome(decision.key.as_deref().unwrap(), false);
        }

        assert_eq!(limiter.peek("ip:10.0.0.1").unwrap().count, 5);
        let decision = limiter.check(&req);
        assert!(decision.is_denied());
        assert_eq!(decision.remaining, 0);
    }

    #[test]
    fn test_check_alone_does_not_count_in_failures_only_mode() {
        let (limiter, _) = limiter_with(small_policy(1, CountingMode::FailuresOnly));
        let req = RequestContext::from_addr("10.0.0.1");

        for _ in 0..5 {
            assert!(limiter.check(&req).allowed);
        }
        assert_eq!(limiter.peek("ip:10.0.0.1").unwrap().count, 0);
    }

    #[test]
    fn test_record_outcome_ignored_for_all_requests_policy() {
        let (limiter, _) = limiter_with(small_policy(5, CountingMode::AllRequests));
        let req = RequestContext::from_addr("10.0.0.1");

        let decision = limiter.check(&req);
        limiter.record_outcome(decision.key.as_deref().unwrap(), false);

        assert_eq!(limiter.peek("ip:10.0.0.1").unwrap().count, 1);
    }

    #[test]
    fn test_bypass_admits_without_counting() {
        let enabled = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&enabled);
        let policy = small_policy(1, CountingMode::AllRequests)
            .with_bypass(Bypass::from_fn(move |_| flag.load(Ordering::SeqCst)));
        let (limiter, _) = limiter_with(policy);
        let req = RequestContext::from_addr("10.0.0.1");

        for _ in 0..5 {
            let decision = limiter.check(&req);
            assert!(decision.allowed);
            assert_eq!(decision.source, DecisionSource::Bypass);
            assert_eq!(decision.key, None);
        }
        assert_eq!(limiter.peek("ip:10.0.0.1").unwrap().count, 0);

        enabled.store(false, Ordering::SeqCst);
        assert!(limiter.check(&req).allowed);
        assert!(limiter.check(&req).is_denied());
    }

    #[test]
    fn test_reset_clears_quota() {
        let (limiter, _) = limiter_with(small_policy(1, CountingMode::AllRequests));
        let req = RequestContext::from_addr("10.0.0.1");

        limiter.check(&req);
        assert!(limiter.check(&req).is_denied());

        limiter.reset("ip:10.0.0.1").unwrap();
        assert!(limiter.check(&req).allowed);
    }

    #[test]
    fn test_store_failure_fail_open() {
        let limiter = RateLimiter::new(
            Policy::general(),
            Arc::new(UnavailableStore),
            StoreFailureMode::FailOpen,
        );

        let decision = limiter.check(&RequestContext::from_addr("10.0.0.1"));
        assert!(decision.allowed);
        assert_eq!(decision.source, DecisionSource::FailOpen);
    }

    #[test]
    fn test_store_failure_fail_closed() {
        let limiter = RateLimiter::new(
            Policy::authentication(),
            Arc::new(UnavailableStore),
            StoreFailureMode::FailClosed,
        );

        let decision = limiter.check(&RequestContext::from_addr("10.0.0.1"));
        assert!(decision.is_denied());
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.source, DecisionSource::FailClosed);

        // Outcome reporting swallows the failure.
        limiter.record_outcome("ip:10.0.0.1", false);
    }

    #[test]
    fn test_authentication_scenario() {
        let (limiter, _) = limiter_with(Policy::authentication());
        let attacker = RequestContext::from_addr("198.51.100.7");

        for _ in 0..10 {
            let decision = limiter.check(&attacker);
            assert!(decision.allowed);
            limiter.record_outcome(decision.key.as_deref().unwrap(), false);
        }

        let eleventh = limiter.check(&attacker);
        assert!(eleventh.is_denied());

        let other = limiter.check(&RequestContext::from_addr("198.51.100.8"));
        assert!(other.allowed);
    }

    #[test]
    fn test_metered_scenario_isolates_users_behind_one_ip() {
        let (limiter, _) = limiter_with(Policy::metered());
        let user_a = RequestContext::from_addr("203.0.113.9").with_identity("alice");
        let user_b = RequestContext::from_addr("203.0.113.9").with_identity("bob");

        for _ in 0..20 {
            assert!(limiter.check(&user_a).allowed);
        }

        let denied = limiter.check(&user_a);
        assert!(denied.is_denied());
        assert_eq!(denied.remaining, 0);

        let other = limiter.check(&user_b);
        assert!(other.allowed);
        assert_eq!(other.remaining, 19);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_checks_are_linearizable() {
        let (limiter, _) = limiter_with(small_policy(20, CountingMode::AllRequests));
        let limiter = Arc::new(limiter);
        let total = 100;

        let handles: Vec<_> = (0..total)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move {
                    limiter.check(&RequestContext::from_addr("10.0.0.1")).allowed
                })
            })
            .collect();

        let results = futures::future::join_all(handles).await;
        let allowed = results
            .into_iter()
            .filter(|r| matches!(r, Ok(true)))
            .count();

        assert_eq!(allowed, 20);
        assert_eq!(limiter.peek("ip:10.0.0.1").unwrap().count, total as u64);
    }
}
