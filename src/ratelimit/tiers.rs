//! The four named limiters and the store they share.

use std::sync::Arc;

use tracing::info;

use super::clock::Clock;
use super::limiter::RateLimiter;
use super::policy::{Bypass, Policy};
use super::store::WindowStore;
use crate::config::RateLimitingConfig;
use crate::error::Result;

/// One limiter per product tier, all backed by the same window store.
#[derive(Clone)]
pub struct Tiers {
    general: Arc<RateLimiter>,
    authentication: Arc<RateLimiter>,
    metered: Arc<RateLimiter>,
    upload: Arc<RateLimiter>,
}

impl Tiers {
    /// Build the tiers from configuration. Every tier is bypassed while the
    /// configured development flag is set in the environment.
    pub fn from_config(
        config: &RateLimitingConfig,
        store: Arc<dyn WindowStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let bypass = Bypass::env_flag(config.bypass_env_var.clone());
        Self::with_bypass(config, store, clock, bypass)
    }

    /// Build the tiers with an explicit bypass predicate shared by all of them.
    pub fn with_bypass(
        config: &RateLimitingConfig,
        store: Arc<dyn WindowStore>,
        clock: Arc<dyn Clock>,
        bypass: Bypass,
    ) -> Result<Self> {
        let overrides = &config.policies;
        let build = |policy: Policy| -> Arc<RateLimiter> {
            info!(
                policy = %policy.name(),
                window_secs = policy.window().as_secs(),
                max_events = policy.max_events(),
                mode = ?policy.counting_mode(),
                key = ?policy.key_strategy(),
                "Configured rate limit tier"
            );
            Arc::new(RateLimiter::with_clock(
                policy.with_bypass(bypass.clone()),
                store.clone(),
                clock.clone(),
                config.on_store_error,
            ))
        };

        Ok(Self {
            general: build(overrides.general.apply(Policy::general())?),
            authentication: build(overrides.authentication.apply(Policy::authentication())?),
            metered: build(overrides.metered.apply(Policy::metered())?),
            upload: build(overrides.upload.apply(Policy::upload())?),
        })
    }

    /// The general traffic limiter.
    pub fn general(&self) -> &Arc<RateLimiter> {
        &self.general
    }

    /// The authentication attempt limiter.
    pub fn authentication(&self) -> &Arc<RateLimiter> {
        &self.authentication
    }

    /// The metered-operation limiter.
    pub fn metered(&self) -> &Arc<RateLimiter> {
        &self.metered
    }

    /// The upload limiter.
    pub fn upload(&self) -> &Arc<RateLimiter> {
        &self.upload
    }

    /// Look a limiter up by policy name.
    pub fn get(&self, name: &str) -> Option<&Arc<RateLimiter>> {
        match name {
            Policy::GENERAL => Some(&self.general),
            Policy::AUTHENTICATION => Some(&self.authentication),
            Policy::METERED => Some(&self.metered),
            Policy::UPLOAD => Some(&self.upload),
            _ => None,
        }
    }

    /// All limiters, in table order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<RateLimiter>> {
        [&self.general, &self.authentication, &self.metered, &self.upload].into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PolicyOverride, RateLimitingConfig};
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::key::RequestContext;
    use crate::ratelimit::limiter::{DecisionSource, StoreFailureMode};
    use crate::ratelimit::store::MemoryStore;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn tiers(config: &RateLimitingConfig, bypass: Bypass) -> Tiers {
        Tiers::with_bypass(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(ManualClock::default()),
            bypass,
        )
        .unwrap()
    }

    #[test]
    fn test_lookup_by_name() {
        let config = RateLimitingConfig::new(StoreFailureMode::FailOpen);
        let tiers = tiers(&config, Bypass::never());

        for name in ["general", "authentication", "metered", "upload"] {
            assert_eq!(tiers.get(name).unwrap().policy().name(), name);
        }
        assert!(tiers.get("unknown").is_none());
        assert_eq!(tiers.iter().count(), 4);
    }

    #[test]
    fn test_overrides_are_applied() {
        let mut config = RateLimitingConfig::new(StoreFailureMode::FailOpen);
        config.policies.upload = PolicyOverride {
            window_secs: Some(60),
            max_events: Some(2),
            message: None,
        };
        let tiers = tiers(&config, Bypass::never());

        assert_eq!(tiers.upload().policy().max_events(), 2);
        assert_eq!(tiers.general().policy().max_events(), 150);
    }

    #[test]
    fn test_invalid_override_fails_construction() {
        let mut config = RateLimitingConfig::new(StoreFailureMode::FailOpen);
        config.policies.general.max_events = Some(0);

        let result = Tiers::from_config(
            &config,
            Arc::new(MemoryStore::new()),
            Arc::new(ManualClock::default()),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_global_bypass_toggles_every_tier() {
        let enabled = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&enabled);
        let config = RateLimitingConfig::new(StoreFailureMode::FailClosed);
        let tiers = tiers(&config, Bypass::from_fn(move |_| flag.load(Ordering::SeqCst)));
        let req = RequestContext::from_addr("10.0.0.1");

        for limiter in tiers.iter() {
            assert_eq!(limiter.check(&req).source, DecisionSource::Bypass);
        }

        enabled.store(false, Ordering::SeqCst);
        for limiter in tiers.iter() {
            assert_eq!(limiter.check(&req).source, DecisionSource::Store);
        }
    }
}
