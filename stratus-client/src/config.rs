use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::ratelimit::RateLimiter;
use crate::retry::RetryPolicy;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ClientConfig {
    pub gateway: GatewayConfig,
    pub socket: SocketConfig,
    pub retry: RetryConfig,
    pub rate_limit: RateLimitConfig,
    pub cache: CacheConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Query endpoint, receives JSON POSTs.
    pub endpoint: String,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    pub host: String,
    pub port: u16,
    pub path: String,
    /// Signing scope for the presigned handshake.
    pub region: String,
    pub service: String,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Requests admitted per window, per operation key.
    pub limit: u32,
    pub window_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// TTL for cached query results, in seconds.
    pub ttl_secs: u64,
    pub max_entries: usize,
    /// How far back the live rolling window reaches, in minutes.
    pub window_minutes: u64,
    /// When set, query results persist here across runs.
    pub persist_dir: Option<PathBuf>,
}

impl ClientConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: ClientConfig = toml::from_str(&content)?;
        Ok(config)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://localhost:8443/query".to_string(),
        }
    }
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8883,
            path: "/stream".to_string(),
            region: "us-east-1".to_string(),
            service: "iotdevicegateway".to_string(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            base_delay_ms: policy.base_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            multiplier: policy.multiplier,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            limit: 100,
            window_secs: 60,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            max_entries: 256,
            window_minutes: 60,
            persist_dir: None,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.base_delay_ms),
            multiplier: self.multiplier,
            max_delay: Duration::from_millis(self.max_delay_ms),
            max_attempts: self.max_attempts,
        }
    }
}

impl RateLimitConfig {
    pub fn limiter(&self) -> RateLimiter {
        RateLimiter::new(self.limit, Duration::from_secs(self.window_secs))
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_minutes * 60)
    }
}
