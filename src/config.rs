//! Configuration management for Tollgate.
//!
//! Values are layered: built-in defaults, then an optional file (YAML, TOML
//! or JSON by extension), then `TOLLGATE__SECTION__KEY` environment variables.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{Result, TollgateError};
use crate::ratelimit::FailurePolicy;
use crate::tenancy::{CredentialEntry, TenantTier};

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Shared counter store
    #[serde(default)]
    pub store: StoreConfig,

    /// Rule evaluation
    #[serde(default)]
    pub engine: EngineConfig,

    /// Ingress self-protection
    #[serde(default)]
    pub api_guard: ApiGuardConfig,

    /// Path to the YAML rule file
    #[serde(default)]
    pub rules_path: Option<String>,

    /// Accepted API keys
    #[serde(default)]
    pub credentials: Vec<CredentialEntry>,

    /// Tier assignments; unlisted tenants are on the free tier
    #[serde(default)]
    pub tenants: Vec<TenantTier>,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    "127.0.0.1:8080".parse().unwrap()
}

/// Which store implementation backs the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// In-process keyspace; counters are not shared between instances
    #[default]
    Memory,
    /// Remote Redis over its REST interface
    Rest,
}

/// Shared store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// REST endpoint, required for the rest backend
    #[serde(default)]
    pub url: Option<String>,

    /// Bearer token for the REST endpoint
    #[serde(default)]
    pub token: Option<String>,

    /// Per-request timeout in milliseconds
    #[serde(default = "default_store_timeout")]
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: None,
            token: None,
            timeout_ms: default_store_timeout(),
        }
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_store_timeout() -> u64 {
    5000
}

/// Rate limit engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Allow requests when the store is unavailable
    #[serde(default = "default_true")]
    pub fail_open: bool,

    /// Consecutive store failures before the store is reported degraded
    #[serde(default = "default_engine_failure_threshold")]
    pub failure_threshold: u32,

    /// Monthly quota percentages that raise an alert
    #[serde(default = "default_alert_thresholds")]
    pub alert_thresholds: Vec<u8>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fail_open: true,
            failure_threshold: default_engine_failure_threshold(),
            alert_thresholds: default_alert_thresholds(),
        }
    }
}

impl EngineConfig {
    pub fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::from_fail_open(self.fail_open)
    }
}

fn default_true() -> bool {
    true
}

fn default_engine_failure_threshold() -> u32 {
    5
}

fn default_alert_thresholds() -> Vec<u8> {
    vec![80, 90]
}

/// Ingress guard configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiGuardConfig {
    /// Requests allowed per credential per window
    #[serde(default = "default_guard_max_requests")]
    pub max_requests: u64,

    #[serde(default = "default_guard_window")]
    pub window_seconds: u64,

    #[serde(default = "default_true")]
    pub fail_open: bool,

    #[serde(default = "default_guard_failure_threshold")]
    pub failure_threshold: u32,

    /// Negative cache size above which expired entries are pruned
    #[serde(default = "default_cache_prune_threshold")]
    pub cache_prune_threshold: usize,
}

impl Default for ApiGuardConfig {
    fn default() -> Self {
        Self {
            max_requests: default_guard_max_requests(),
            window_seconds: default_guard_window(),
            fail_open: true,
            failure_threshold: default_guard_failure_threshold(),
            cache_prune_threshold: default_cache_prune_threshold(),
        }
    }
}

impl ApiGuardConfig {
    pub fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::from_fail_open(self.fail_open)
    }
}

fn default_guard_max_requests() -> u64 {
    1000
}

fn default_guard_window() -> u64 {
    60
}

fn default_guard_failure_threshold() -> u32 {
    3
}

fn default_cache_prune_threshold() -> usize {
    1000
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TollgateConfig {
    /// Load configuration from an optional file plus the environment.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("TOLLGATE")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: TollgateConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| TollgateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file only.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TollgateConfig =
            serde_yaml::from_str(yaml).map_err(|e| TollgateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.store.backend == StoreBackend::Rest
            && (self.store.url.is_none() || self.store.token.is_none())
        {
            return Err(TollgateError::Config(
                "store.url and store.token are required for the rest backend".to_string(),
            ));
        }
        if self.api_guard.max_requests == 0 || self.api_guard.window_seconds == 0 {
            return Err(TollgateError::Config(
                "api_guard limits must be positive".to_string(),
            ));
        }
        if let Some(t) = self.engine.alert_thresholds.iter().find(|t| **t > 100) {
            return Err(TollgateError::Config(format!(
                "alert threshold {t} exceeds 100 percent"
            )));
        }
        Ok(())
    }
}
