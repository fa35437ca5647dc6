//! Engine configuration.
//!
//! Resolved once at construction and held for the engine lifetime. All
//! subsystems receive their tuning from here; nothing reads the
//! environment after startup.

pub mod credentials;

pub use credentials::{Credentials, SecretString};

use std::time::Duration;

use crate::cache::EvictionPolicy;

/// Default Binance USDT-M futures REST endpoint.
pub const DEFAULT_REST_BASE_URL: &str = "https://fapi.binance.com";

/// Default Binance USDT-M futures WebSocket endpoint.
pub const DEFAULT_WS_BASE_URL: &str = "wss://fstream.binance.com";

/// Process-level engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Base URL for REST requests.
    pub rest_base_url: String,
    /// Base URL for push streams.
    pub ws_base_url: String,
    /// Deadline for every REST request.
    pub request_timeout: Duration,

    /// First reconnect delay after a lost push connection.
    pub initial_backoff: Duration,
    /// Cap on the reconnect delay.
    pub max_backoff: Duration,
    /// Multiplier applied to the delay after each failed attempt.
    pub backoff_factor: f64,
    /// Reconnect attempts before a session is marked failed.
    pub max_reconnect_attempts: u32,

    /// Interval between outbound pings on a push connection.
    pub heartbeat_interval: Duration,
    /// How long to wait for a ping response before forcing reconnection.
    pub heartbeat_timeout: Duration,

    /// Maximum number of cache entries before eviction.
    pub cache_max_size: usize,
    /// Cache entry time-to-live.
    pub cache_ttl: Duration,
    /// Eviction policy applied when the cache is full.
    pub cache_eviction: EvictionPolicy,

    /// Interval between REST pulls when a stream falls back to polling.
    pub poll_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rest_base_url: DEFAULT_REST_BASE_URL.to_string(),
            ws_base_url: DEFAULT_WS_BASE_URL.to_string(),
            request_timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_secs(3),
            max_backoff: Duration::from_secs(30),
            backoff_factor: 2.0,
            max_reconnect_attempts: 5,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(10),
            cache_max_size: 1000,
            cache_ttl: Duration::from_secs(30),
            cache_eviction: EvictionPolicy::Lru,
            poll_interval: Duration::from_secs(5),
        }
    }
}

impl EngineConfig {
    /// Loads configuration from the environment on top of the defaults.
    ///
    /// Recognized variables: `BINANCE_REST_URL`, `BINANCE_WS_URL`,
    /// `BINANCE_REQUEST_TIMEOUT_MS`. Everything else keeps its default;
    /// unparsable values are ignored rather than fatal.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("BINANCE_REST_URL") {
            if !url.trim().is_empty() {
                config.rest_base_url = url.trim().to_string();
            }
        }
        if let Ok(url) = std::env::var("BINANCE_WS_URL") {
            if !url.trim().is_empty() {
                config.ws_base_url = url.trim().to_string();
            }
        }
        if let Ok(timeout) = std::env::var("BINANCE_REQUEST_TIMEOUT_MS") {
            if let Ok(ms) = timeout.trim().parse::<u64>() {
                config.request_timeout = Duration::from_millis(ms);
            }
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_exchange_endpoints() {
        let config = EngineConfig::default();
        assert_eq!(config.rest_base_url, "https://fapi.binance.com");
        assert_eq!(config.ws_base_url, "wss://fstream.binance.com");
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(10));
        assert_eq!(config.cache_max_size, 1000);
        assert_eq!(config.cache_ttl, Duration::from_secs(30));
    }

    #[test]
    fn test_default_backoff_tuning() {
        let config = EngineConfig::default();
        assert_eq!(config.initial_backoff, Duration::from_secs(3));
        assert_eq!(config.max_backoff, Duration::from_secs(30));
        assert_eq!(config.max_reconnect_attempts, 5);
        assert!(config.backoff_factor >= 1.5 && config.backoff_factor <= 2.0);
    }
}
