//! Rate limit policies.
//!
//! A policy is one named, immutable rate limit configuration: how long a
//! window lasts, how many events fit in it, which events count, how requests
//! map to keys, and which requests skip limiting entirely.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::key::{KeyStrategy, RequestContext};
use crate::error::{AdmissionError, Result};

/// Which events consume quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CountingMode {
    /// Every admitted request counts.
    AllRequests,
    /// Only requests whose guarded operation later reports failure count.
    /// The caller reports outcomes through `RateLimiter::record_outcome`.
    FailuresOnly,
}

type BypassFn = dyn Fn(&RequestContext) -> bool + Send + Sync;

/// Predicate deciding whether a request skips limiting altogether.
///
/// Bypassed requests are admitted and not counted. The predicate runs on
/// every check; nothing about it is cached.
#[derive(Clone)]
pub struct Bypass {
    predicate: Option<Arc<BypassFn>>,
    description: &'static str,
}

impl Bypass {
    /// Never bypass.
    pub fn never() -> Self {
        Self {
            predicate: None,
            description: "never",
        }
    }

    /// Bypass whenever `predicate` returns true.
    pub fn from_fn<F>(predicate: F) -> Self
    where
        F: Fn(&RequestContext) -> bool + Send + Sync + 'static,
    {
        Self {
            predicate: Some(Arc::new(predicate)),
            description: "custom",
        }
    }

    /// Bypass while the environment variable `var` holds a truthy value
    /// (`1`, `true`, `yes` or `on`). The variable is read on every call.
    pub fn env_flag(var: impl Into<String>) -> Self {
        let var = var.into();
        Self {
            predicate: Some(Arc::new(move |_: &RequestContext| {
                std::env::var(&var).map(|v| is_truthy(&v)).unwrap_or(false)
            })),
            description: "env_flag",
        }
    }

    /// Evaluate the predicate for a request.
    pub fn applies(&self, req: &RequestContext) -> bool {
        self.predicate.as_ref().is_some_and(|p| p(req))
    }
}

impl Default for Bypass {
    fn default() -> Self {
        Self::never()
    }
}

impl fmt::Debug for Bypass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Bypass").field(&self.description).finish()
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// An immutable rate limit configuration.
#[derive(Debug, Clone)]
pub struct Policy {
    name: String,
    window: Duration,
    max_events: u64,
    counting_mode: CountingMode,
    key_strategy: KeyStrategy,
    message: String,
    bypass: Bypass,
}

impl Policy {
    /// Name of the general traffic policy.
    pub const GENERAL: &'static str = "general";
    /// Name of the authentication policy.
    pub const AUTHENTICATION: &'static str = "authentication";
    /// Name of the metered-operation policy.
    pub const METERED: &'static str = "metered";
    /// Name of the upload policy.
    pub const UPLOAD: &'static str = "upload";

    /// Create a policy, validating that the window is non-zero and at least
    /// one event is permitted.
    pub fn new(
        name: impl Into<String>,
        window: Duration,
        max_events: u64,
        counting_mode: CountingMode,
        key_strategy: KeyStrategy,
        message: impl Into<String>,
    ) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(AdmissionError::Config("policy name must not be empty".to_string()));
        }
        if window.is_zero() {
            return Err(AdmissionError::Config(format!(
                "policy '{}': window must be greater than zero",
                name
            )));
        }
        if max_events == 0 {
            return Err(AdmissionError::Config(format!(
                "policy '{}': max_events must be at least 1",
                name
            )));
        }

        Ok(Self {
            name,
            window,
            max_events,
            counting_mode,
            key_strategy,
            message: message.into(),
            bypass: Bypass::never(),
        })
    }

    /// Replace the bypass predicate.
    pub fn with_bypass(mut self, bypass: Bypass) -> Self {
        self.bypass = bypass;
        self
    }

    /// General traffic: 150 requests per 15 minutes per client address.
    pub fn general() -> Self {
        Self::builtin(
            Self::GENERAL,
            Duration::from_secs(15 * 60),
            150,
            CountingMode::AllRequests,
            KeyStrategy::ByRemoteAddress,
            "Too many requests from this IP, please try again later.",
        )
    }

    /// Authentication attempts: 10 failed attempts per 15 minutes per client address.
    pub fn authentication() -> Self {
        Self::builtin(
            Self::AUTHENTICATION,
            Duration::from_secs(15 * 60),
            10,
            CountingMode::FailuresOnly,
            KeyStrategy::ByRemoteAddress,
            "Too many authentication attempts, please try again later.",
        )
    }

    /// Expensive generation calls: 20 per hour per authenticated user.
    pub fn metered() -> Self {
        Self::builtin(
            Self::METERED,
            Duration::from_secs(60 * 60),
            20,
            CountingMode::AllRequests,
            KeyStrategy::ByAuthenticatedIdentity,
            "Too many generation requests, please try again later.",
        )
    }

    /// Uploads: 15 per 15 minutes per client address.
    pub fn upload() -> Self {
        Self::builtin(
            Self::UPLOAD,
            Duration::from_secs(15 * 60),
            15,
            CountingMode::AllRequests,
            KeyStrategy::ByRemoteAddress,
            "Too many upload requests, please try again later.",
        )
    }

    // Built-in tunables already satisfy the invariants.
    fn builtin(
        name: &str,
        window: Duration,
        max_events: u64,
        counting_mode: CountingMode,
        key_strategy: KeyStrategy,
        message: &str,
    ) -> Self {
        Self {
            name: name.to_string(),
            window,
            max_events,
            counting_mode,
            key_strategy,
            message: message.to_string(),
            bypass: Bypass::never(),
        }
    }

    /// The policy name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Length of each window.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Events permitted per window.
    pub fn max_events(&self) -> u64 {
        self.max_events
    }

    /// Which events count.
    pub fn counting_mode(&self) -> CountingMode {
        self.counting_mode
    }

    /// How requests map to keys.
    pub fn key_strategy(&self) -> KeyStrategy {
        self.key_strategy
    }

    /// The denial message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The bypass predicate.
    pub fn bypass(&self) -> &Bypass {
        &self.bypass
    }
}
