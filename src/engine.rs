//! Engine composition root.
//!
//! Builds every subsystem from one `EngineConfig` and owns the
//! background jobs (rate-limit reset, cache sweep). Construction must
//! happen inside a tokio runtime.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;

use crate::cache::{CacheConfig, CacheStats, MarketCache};
use crate::clock::{Clock, SystemClock};
use crate::config::{Credentials, EngineConfig};
use crate::data::records::MarketRecord;
use crate::events::{SharedSink, TracingSink};
use crate::limiter::{BucketUsage, RateLimitConfig, RateLimiter};
use crate::poller::FallbackPoller;
use crate::rest::RestClient;
use crate::retry::{BreakerConfig, BreakerState};
use crate::service::MarketDataService;
use crate::stream::{
    SessionConfig, StreamMetricsSnapshot, StreamSupervisor, SupervisorStatus,
};

/// Aggregate engine status for introspection.
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub connection: SupervisorStatus,
    pub breaker: BreakerState,
    pub cache: CacheStats,
    pub limiter: Vec<BucketUsage>,
    pub streams: HashMap<String, StreamMetricsSnapshot>,
    pub decode_errors: u64,
}

/// The market data engine.
///
/// Owns the REST gateway, the stream supervisor, the cache, the fallback
/// poller, and the service facade. Dropping the engine aborts background
/// jobs; call [`disconnect_all`](Engine::disconnect_all) first for a
/// clean close.
pub struct Engine {
    limiter: Arc<RateLimiter>,
    cache: Arc<MarketCache<MarketRecord>>,
    supervisor: Arc<StreamSupervisor>,
    poller: Arc<FallbackPoller>,
    service: MarketDataService,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Engine without credentials: public market data only.
    pub fn new(config: EngineConfig) -> Self {
        Self::build(config, None, Arc::new(SystemClock), Arc::new(TracingSink))
    }

    /// Engine with credentials for the signed endpoints.
    pub fn with_credentials(config: EngineConfig, credentials: Credentials) -> Self {
        Self::build(
            config,
            Some(credentials),
            Arc::new(SystemClock),
            Arc::new(TracingSink),
        )
    }

    /// Full control over collaborators (tests inject clock and sink).
    pub fn with_collaborators(
        config: EngineConfig,
        credentials: Option<Credentials>,
        clock: Arc<dyn Clock>,
        sink: SharedSink,
    ) -> Self {
        Self::build(config, credentials, clock, sink)
    }

    fn build(
        config: EngineConfig,
        credentials: Option<Credentials>,
        clock: Arc<dyn Clock>,
        sink: SharedSink,
    ) -> Self {
        let limiter = Arc::new(RateLimiter::new(
            RateLimitConfig::default(),
            Arc::clone(&sink),
        ));
        let rest = Arc::new(RestClient::new(
            &config,
            credentials.clone(),
            Arc::clone(&limiter),
            Arc::clone(&clock),
        ));
        let cache = Arc::new(MarketCache::new(CacheConfig {
            max_size: config.cache_max_size,
            ttl: config.cache_ttl,
            policy: config.cache_eviction,
        }));
        let supervisor = StreamSupervisor::new(
            SessionConfig {
                ws_base_url: config.ws_base_url.clone(),
                initial_backoff: config.initial_backoff,
                max_backoff: config.max_backoff,
                backoff_factor: config.backoff_factor,
                max_reconnect_attempts: config.max_reconnect_attempts,
                heartbeat_interval: config.heartbeat_interval,
                heartbeat_timeout: config.heartbeat_timeout,
                api_key: credentials
                    .as_ref()
                    .map(|c| c.api_key().expose_secret().to_string()),
            },
            BreakerConfig::default(),
            Arc::clone(&sink),
        );
        let poller = Arc::new(FallbackPoller::new(config.poll_interval));
        let service = MarketDataService::new(
            Arc::clone(&rest),
            Arc::clone(&supervisor),
            Arc::clone(&poller),
            Arc::clone(&cache),
            Arc::clone(&clock),
            Arc::clone(&sink),
        );

        let background = vec![limiter.start_reset_task(), cache.start_sweeper()];

        Self {
            limiter,
            cache,
            supervisor,
            poller,
            service,
            background: Mutex::new(background),
        }
    }

    /// The public market data API.
    pub fn market_data(&self) -> &MarketDataService {
        &self.service
    }

    /// The stream supervisor, for connection-level control
    /// (`force_reconnect`, `reset_circuit_breaker`, metrics).
    pub fn supervisor(&self) -> &Arc<StreamSupervisor> {
        &self.supervisor
    }

    /// Aggregate status across subsystems.
    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            connection: self.supervisor.status(),
            breaker: self.supervisor.breaker_state(),
            cache: self.cache.stats(),
            limiter: self.limiter.usage(),
            streams: self.supervisor.metrics(),
            decode_errors: self.service.decode_error_count(),
        }
    }

    /// Close every session and stop every poller. Idempotent; a no-op on
    /// an idle engine.
    pub async fn disconnect_all(&self) {
        self.poller.stop_all();
        self.supervisor.disconnect_all().await;
    }

    /// Disconnect and stop all background jobs.
    pub async fn shutdown(&self) {
        self.disconnect_all().await;
        self.supervisor.shutdown();
        let mut background = self.background.lock().unwrap();
        for task in background.drain(..) {
            task.abort();
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let background = self.background.lock();
        if let Ok(mut background) = background {
            for task in background.drain(..) {
                task.abort();
            }
        }
        self.supervisor.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn offline_config() -> EngineConfig {
        EngineConfig {
            rest_base_url: "http://127.0.0.1:1".to_string(),
            ws_base_url: "ws://127.0.0.1:1".to_string(),
            request_timeout: Duration::from_millis(200),
            ..EngineConfig::default()
        }
    }

    #[tokio::test]
    async fn test_fresh_engine_status() {
        let engine = Engine::new(offline_config());
        let status = engine.status();
        assert_eq!(status.connection, SupervisorStatus::Disconnected);
        assert_eq!(status.breaker, BreakerState::Closed);
        assert_eq!(status.cache.size, 0);
        assert_eq!(status.decode_errors, 0);
        assert_eq!(status.limiter.len(), 3);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_disconnect_all_twice_is_idle() {
        let engine = Engine::new(offline_config());
        engine.disconnect_all().await;
        engine.disconnect_all().await;
        assert_eq!(engine.status().connection, SupervisorStatus::Disconnected);
        engine.shutdown().await;
    }
}
