//! Configuration management for Turnstile.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{AdmissionError, Result};
use crate::ratelimit::{Policy, StoreFailureMode};

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    pub rate_limiting: RateLimitingConfig,
}

impl AdmissionConfig {
    /// Defaults for everything except the store failure mode, which has none.
    pub fn new(on_store_error: StoreFailureMode) -> Self {
        Self {
            server: ServerConfig::default(),
            rate_limiting: RateLimitingConfig::new(on_store_error),
        }
    }

    /// Load configuration from a YAML file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| AdmissionError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Load configuration from an optional YAML file, then environment
    /// variables (`TURNSTILE_RATE_LIMITING__ON_STORE_ERROR=fail_open`), then
    /// explicit overrides given as dotted keys.
    pub fn load(path: Option<&Path>, overrides: &[(&str, String)]) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path).format(config::FileFormat::Yaml),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        for (key, value) in overrides {
            builder = builder
                .set_override(*key, value.clone())
                .map_err(|e| AdmissionError::Config(e.to_string()))?;
        }

        builder
            .build()
            .and_then(|c| c.try_deserialize::<AdmissionConfig>())
            .map_err(|e| AdmissionError::Config(e.to_string()))
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Take the client address from the first `X-Forwarded-For` hop.
    /// Only enable behind a proxy that overwrites the header.
    #[serde(default)]
    pub trust_forwarded_for: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            trust_forwarded_for: false,
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Behaviour when the window store fails. Required.
    pub on_store_error: StoreFailureMode,

    /// Environment variable that disables every limiter while truthy
    #[serde(default = "default_bypass_env_var")]
    pub bypass_env_var: String,

    /// How often expired windows are purged, in seconds
    #[serde(default = "default_gc_interval")]
    pub gc_interval_secs: u64,

    /// Per-tier tunables
    #[serde(default)]
    pub policies: PolicyOverrides,
}

impl RateLimitingConfig {
    /// Defaults for everything except the store failure mode.
    pub fn new(on_store_error: StoreFailureMode) -> Self {
        Self {
            on_store_error,
            bypass_env_var: default_bypass_env_var(),
            gc_interval_secs: default_gc_interval(),
            policies: PolicyOverrides::default(),
        }
    }

    /// The purge interval as a duration.
    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs.max(1))
    }
}

fn default_bypass_env_var() -> String {
    "TURNSTILE_DEV_BYPASS".to_string()
}

fn default_gc_interval() -> u64 {
    60
}

/// Overrides for the four built-in tiers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyOverrides {
    #[serde(default)]
    pub general: PolicyOverride,
    #[serde(default)]
    pub authentication: PolicyOverride,
    #[serde(default)]
    pub metered: PolicyOverride,
    #[serde(default)]
    pub upload: PolicyOverride,
}

/// Tunables for one tier. Unset fields keep the built-in value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyOverride {
    /// Window length in seconds
    #[serde(default)]
    pub window_secs: Option<u64>,
    /// Events permitted per window
    #[serde(default)]
    pub max_events: Option<u64>,
    /// Denial message
    #[serde(default)]
    pub message: Option<String>,
}

impl PolicyOverride {
    /// Apply these overrides on top of `base`, re-validating the result.
    pub fn apply(&self, base: Policy) -> Result<Policy> {
        if self.window_secs.is_none() && self.max_events.is_none() && self.message.is_none() {
            return Ok(base);
        }

        Policy::new(
            base.name(),
            self.window_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| base.window()),
            self.max_events.unwrap_or_else(|| base.max_events()),
            base.counting_mode(),
            base.key_strategy(),
            self.message.as_deref().unwrap_or_else(|| base.message()),
        )
        .map(|policy| policy.with_bypass(base.bypass().clone()))
    }
}
