use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::db::DatabaseConfig;
use crate::types::ServiceName;

/// Default lifetime of a signed assertion: 15 days.
pub const DEFAULT_ASSERTION_LIFETIME_SECS: u64 = 15 * 24 * 60 * 60;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Public gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// HTTP bind address
    pub bind: String,
    /// Shared HMAC secret; also used by every backend's guard
    #[serde(skip_serializing)]
    pub signing_secret: String,
    /// Lifetime of issued assertions in seconds
    pub assertion_lifetime_secs: u64,
    /// Upper bound on one inbound request, in milliseconds
    pub request_timeout_ms: u64,
    /// Base URL of the Consul agent
    pub registry_url: String,
    pub database: DatabaseConfig,
    pub dispatcher: DispatcherConfig,
    /// Logical services resolved through the registry
    pub services: Vec<ServiceSpec>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: env::var("GATEWAY_BIND").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            signing_secret: env::var("GATEWAY_JWT_SECRET").unwrap_or_default(),
            assertion_lifetime_secs: env_or(
                "GATEWAY_ASSERTION_LIFETIME_SECS",
                DEFAULT_ASSERTION_LIFETIME_SECS,
            ),
            request_timeout_ms: env_or("GATEWAY_REQUEST_TIMEOUT_MS", 30_000),
            registry_url: env::var("CONSUL_HTTP_ADDR")
                .unwrap_or_else(|_| "http://127.0.0.1:8500".to_string()),
            database: DatabaseConfig::default(),
            dispatcher: DispatcherConfig::default(),
            services: ServiceSpec::defaults(),
        }
    }
}

impl GatewayConfig {
    pub fn assertion_lifetime(&self) -> Duration {
        Duration::from_secs(self.assertion_lifetime_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Resolution, retry and admission settings for outbound calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Attempts per logical call, including the first one
    pub max_retries: usize,
    /// Budget for a single attempt, in milliseconds
    pub per_attempt_timeout_ms: u64,
    /// TCP connect timeout for new instance channels, in milliseconds
    pub connect_timeout_ms: u64,
    /// Cached instance clients unused for this long are rebuilt, in seconds
    pub idle_timeout_secs: u64,
    /// Long-poll wait passed to the registry, in seconds
    pub registry_wait_secs: u64,
    pub rate_limit: RateLimitConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_retries: env_or("DISPATCH_MAX_RETRY", 3),
            per_attempt_timeout_ms: env_or("DISPATCH_MAX_TIMEOUT_MS", 2_000),
            connect_timeout_ms: env_or("DISPATCH_CONNECT_TIMEOUT_MS", 1_000),
            idle_timeout_secs: env_or("DISPATCH_IDLE_TIMEOUT_SECS", 300),
            registry_wait_secs: env_or("DISPATCH_REGISTRY_WAIT_SECS", 30),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl DispatcherConfig {
    pub fn per_attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.per_attempt_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn registry_wait(&self) -> Duration {
        Duration::from_secs(self.registry_wait_secs)
    }
}

/// Token bucket applied to each instance client.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Tokens added per second
    pub refill_per_sec: f64,
    /// Bucket capacity
    pub burst: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            refill_per_sec: 1.0,
            burst: 100,
        }
    }
}

/// Registry lookup parameters for one logical service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: ServiceName,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_passing_only")]
    pub passing_only: bool,
}

fn default_passing_only() -> bool {
    true
}

impl ServiceSpec {
    pub fn new(name: impl Into<ServiceName>) -> Self {
        Self {
            name: name.into(),
            tags: Vec::new(),
            passing_only: true,
        }
    }

    /// The four backends the gateway fronts.
    pub fn defaults() -> Vec<Self> {
        ["auth", "user", "notifications", "support"]
            .into_iter()
            .map(Self::new)
            .collect()
    }
}
