//! Client-side market data streaming engine for Binance USDT-M futures.
//!
//! The engine is the subscriber's single source of truth: live data comes
//! from push streams when they are healthy, from the in-memory cache for
//! repeated reads, and from periodic REST polling when push is down.
//! Every value handed to a caller is wrapped in an [`Envelope`] tagging
//! where it came from.
//!
//! ```rust,no_run
//! use binance_feed::{Engine, EngineConfig, SubscribeOptions};
//!
//! # async fn example() {
//! let engine = Engine::new(EngineConfig::default());
//! let subscription = engine.market_data().subscribe_book_ticker(
//!     "btcusdt",
//!     SubscribeOptions::default(),
//!     |envelope| {
//!         if let Some(record) = envelope.data() {
//!             println!("{:?} via {:?}", record, envelope.source());
//!         }
//!     },
//! );
//! // ...
//! subscription.unsubscribe();
//! engine.disconnect_all().await;
//! # }
//! ```

pub mod cache;
pub mod clock;
pub mod config;
pub mod data;
pub mod engine;
pub mod error;
pub mod events;
pub mod limiter;
pub mod poller;
pub mod rest;
pub mod retry;
pub mod service;
pub mod stream;

pub use cache::{CacheConfig, CacheStats, EvictionPolicy, MarketCache};
pub use clock::{Backoff, Clock, SystemClock};
pub use config::{Credentials, EngineConfig, SecretString};
pub use data::{
    BookLevel, Envelope, Kline, MarketRecord, OrderBook, PriceTick, Source, StreamKey, Ticker24h,
    Topic, TradeRecord,
};
pub use engine::{Engine, EngineStatus};
pub use error::{MarketError, Severity};
pub use events::{EngineEvent, EventSink, TracingSink};
pub use limiter::{BucketKind, RateLimitConfig, RateLimiter};
pub use retry::{BreakerConfig, BreakerState, CircuitBreaker, RetryPolicy};
pub use service::{MarketDataService, SubscribeOptions, Subscription, SubscriptionCallback};
pub use stream::{StreamSupervisor, SupervisorStatus};
