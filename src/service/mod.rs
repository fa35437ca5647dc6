//! Public market data surface.
//!
//! One-shot reads consult the cache before the REST gateway and always
//! return envelopes. Subscriptions register with the supervisor, prime
//! with a one-shot REST fetch, decode and cache every push delivery, and
//! fall back to polling when push is unavailable. Trade and kline
//! subscriptions maintain rolling buffers and deliver snapshot copies.

pub mod buffers;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cache::{full_key, MarketCache};
use crate::clock::Clock;
use crate::data::decode::decode_stream_event;
use crate::data::envelope::{Envelope, Source};
use crate::data::key::{StreamKey, Topic};
use crate::data::records::{Kline, MarketRecord, OrderBook, PriceTick, Ticker24h, TradeRecord};
use crate::error::MarketError;
use crate::events::{EngineEvent, SharedSink};
use crate::poller::{fetch_for_key, FallbackPoller};
use crate::rest::{normalize_symbol, RestClient};
use crate::stream::session::RawStreamEvent;
use crate::stream::StreamSupervisor;
use buffers::{KlineBuffer, TradeRing};

/// Cache namespace for market data records.
const NAMESPACE: &str = "market";

/// Per-subscription options.
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// Deliver a one-shot REST refresh after a push decode/transport
    /// error.
    pub reconnect_on_transient_error: bool,
    /// Retries for the initial REST prime.
    pub max_retries: u32,
    /// Delay between prime retries.
    pub retry_interval: Duration,
    /// Trade/kline rolling buffer capacity.
    pub buffer_size: usize,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            reconnect_on_transient_error: true,
            max_retries: 3,
            retry_interval: Duration::from_secs(1),
            buffer_size: 100,
        }
    }
}

/// Callback receiving subscription envelopes. Must be non-blocking.
pub type SubscriptionCallback = Arc<dyn Fn(Envelope<MarketRecord>) + Send + Sync>;

/// Cache kind + params for a stream key. Trade-like topics share one
/// kind so push updates serve the one-shot reads.
fn cache_key_for(key: &StreamKey) -> String {
    let symbol = key.rest_symbol();
    match key.topic() {
        Topic::BookTicker => full_key(NAMESPACE, "bookTicker", &symbol, &[]),
        Topic::Depth => full_key(NAMESPACE, "depth", &symbol, &[]),
        Topic::Trade | Topic::AggTrade => full_key(NAMESPACE, "trades", &symbol, &[]),
        Topic::Kline => {
            let interval = key.param().unwrap_or("1m");
            full_key(NAMESPACE, "kline", &symbol, &[("interval", interval)])
        }
        Topic::Ticker => full_key(NAMESPACE, "ticker", &symbol, &[]),
    }
}

enum SubBuffer {
    None,
    Trades(Mutex<TradeRing>),
    Klines(Mutex<KlineBuffer>),
}

/// Shared tail of every delivery path (push, prime, refresh, poll):
/// buffer transform, cache update, then the subscriber callback.
struct SubscriptionCore {
    key: StreamKey,
    options: SubscribeOptions,
    buffer: SubBuffer,
    callback: SubscriptionCallback,
    cache: Arc<MarketCache<MarketRecord>>,
    clock: Arc<dyn Clock>,
    rest: Arc<RestClient>,
    sink: SharedSink,
    decode_errors: Arc<AtomicU64>,
    refresh_in_flight: AtomicBool,
}

impl SubscriptionCore {
    /// Deliver one record: run it through the rolling buffer if the
    /// topic has one, update the cache, then invoke the callback. The
    /// cache write always happens before the callback.
    fn deliver(&self, key: &StreamKey, record: MarketRecord, source: Source) {
        let outgoing = match (&self.buffer, record) {
            (SubBuffer::Trades(ring), MarketRecord::Trade(trade)) => {
                let mut ring = ring.lock().unwrap();
                ring.push(trade);
                MarketRecord::TradeHistory(ring.snapshot())
            }
            (SubBuffer::Trades(ring), MarketRecord::TradeHistory(trades)) => {
                let mut ring = ring.lock().unwrap();
                // REST returns oldest first; the last pushed ends newest.
                ring.extend(trades);
                MarketRecord::TradeHistory(ring.snapshot())
            }
            (SubBuffer::Klines(buffer), MarketRecord::Kline(kline)) => {
                let mut buffer = buffer.lock().unwrap();
                buffer.upsert(kline);
                MarketRecord::KlineSeries(buffer.snapshot())
            }
            (SubBuffer::Klines(buffer), MarketRecord::KlineSeries(klines)) => {
                let mut buffer = buffer.lock().unwrap();
                for kline in klines {
                    buffer.upsert(kline);
                }
                MarketRecord::KlineSeries(buffer.snapshot())
            }
            (_, record) => record,
        };
        self.cache.set(&cache_key_for(key), outgoing.clone());
        (self.callback)(Envelope::ok(outgoing, source, self.clock.now_ms()));
    }

    /// Deliver an error envelope, optionally following with a one-shot
    /// REST refresh.
    fn deliver_error(self: &Arc<Self>, error: MarketError, source: Source) {
        (self.callback)(Envelope::err(error, source, self.clock.now_ms()));
        if self.options.reconnect_on_transient_error {
            self.spawn_refresh();
        }
    }

    /// Push delivery entry point: decode, then hand off.
    fn on_raw_event(self: &Arc<Self>, event: RawStreamEvent) {
        // Combined sessions carry several keys; trust the event's own key
        // when it parses.
        let key = event
            .key
            .parse::<StreamKey>()
            .unwrap_or_else(|_| self.key.clone());
        match decode_stream_event(&key, &event.payload, self.clock.now_ms()) {
            Ok(record) => self.deliver(&key, record, Source::Push),
            Err(error) => {
                self.decode_errors.fetch_add(1, Ordering::Relaxed);
                self.sink.emit(EngineEvent::Error {
                    scope: "decode".to_string(),
                    message: error.to_string(),
                });
                self.deliver_error(error, Source::Push);
            }
        }
    }

    /// One-shot REST refresh after an error; at most one in flight.
    fn spawn_refresh(self: &Arc<Self>) {
        if self.refresh_in_flight.swap(true, Ordering::SeqCst) {
            return;
        }
        let core = Arc::clone(self);
        tokio::spawn(async move {
            match fetch_for_key(&core.rest, &core.key).await {
                Ok(record) => core.deliver(&core.key, record, Source::Rest),
                Err(error) => {
                    (core.callback)(Envelope::err(error, Source::Rest, core.clock.now_ms()));
                }
            }
            core.refresh_in_flight.store(false, Ordering::SeqCst);
        });
    }
}

/// Initial REST prime so the subscriber has data within one round trip.
fn spawn_prime(core: Arc<SubscriptionCore>, key: StreamKey) {
    tokio::spawn(async move {
        let mut attempt = 0;
        loop {
            match fetch_for_key(&core.rest, &key).await {
                Ok(record) => {
                    core.deliver(&key, record, Source::Rest);
                    return;
                }
                Err(error) => {
                    if attempt >= core.options.max_retries {
                        tracing::warn!(stream = %key, error = %error, "prime failed");
                        (core.callback)(Envelope::err(error, Source::Rest, core.clock.now_ms()));
                        return;
                    }
                    attempt += 1;
                    tokio::time::sleep(core.options.retry_interval).await;
                }
            }
        }
    });
}

/// Handle returned by every subscription.
pub struct Subscription {
    key: StreamKey,
    registration_id: u64,
    poll_ids: Vec<String>,
    supervisor: Arc<StreamSupervisor>,
    poller: Arc<FallbackPoller>,
    active: AtomicBool,
}

impl Subscription {
    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Remove the callback and stop the fallback poller. Idempotent; the
    /// underlying session closes asynchronously once its last callback is
    /// gone.
    pub fn unsubscribe(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            self.supervisor.unregister(self.registration_id);
            for poll_id in &self.poll_ids {
                self.poller.stop(poll_id);
            }
        }
    }
}

/// The engine's public market data API.
pub struct MarketDataService {
    rest: Arc<RestClient>,
    supervisor: Arc<StreamSupervisor>,
    poller: Arc<FallbackPoller>,
    cache: Arc<MarketCache<MarketRecord>>,
    clock: Arc<dyn Clock>,
    sink: SharedSink,
    decode_errors: Arc<AtomicU64>,
}

impl MarketDataService {
    pub fn new(
        rest: Arc<RestClient>,
        supervisor: Arc<StreamSupervisor>,
        poller: Arc<FallbackPoller>,
        cache: Arc<MarketCache<MarketRecord>>,
        clock: Arc<dyn Clock>,
        sink: SharedSink,
    ) -> Self {
        Self {
            rest,
            supervisor,
            poller,
            cache,
            clock,
            sink,
            decode_errors: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Total push decode failures across all subscriptions.
    pub fn decode_error_count(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }

    // ----- one-shot reads ---------------------------------------------

    /// Current best bid/ask, cache first.
    pub async fn get_current_price(&self, symbol: &str) -> Envelope<PriceTick> {
        let symbol = normalize_symbol(symbol);
        let key = full_key(NAMESPACE, "bookTicker", &symbol, &[]);
        if let Some(MarketRecord::PriceTick(tick)) = self.cache.get(&key) {
            return Envelope::ok(tick, Source::Cache, self.clock.now_ms());
        }
        match self.rest.get_current_price(&symbol).await {
            Ok(tick) => {
                self.cache.set(&key, MarketRecord::PriceTick(tick.clone()));
                Envelope::ok(tick, Source::Rest, self.clock.now_ms())
            }
            Err(error) => Envelope::err(error, Source::Rest, self.clock.now_ms()),
        }
    }

    /// Order book snapshot, cache first. Explicit limits get their own
    /// cache entries; the default shares the push-updated entry.
    pub async fn get_order_book(
        &self,
        symbol: &str,
        limit: Option<u32>,
    ) -> Envelope<OrderBook> {
        let symbol = normalize_symbol(symbol);
        let key = match limit {
            Some(limit) => full_key(
                NAMESPACE,
                "depth",
                &symbol,
                &[("limit", &limit.to_string())],
            ),
            None => full_key(NAMESPACE, "depth", &symbol, &[]),
        };
        if let Some(MarketRecord::OrderBook(book)) = self.cache.get(&key) {
            return Envelope::ok(book, Source::Cache, self.clock.now_ms());
        }
        match self.rest.get_order_book(&symbol, limit).await {
            Ok(book) => {
                self.cache.set(&key, MarketRecord::OrderBook(book.clone()));
                Envelope::ok(book, Source::Rest, self.clock.now_ms())
            }
            Err(error) => Envelope::err(error, Source::Rest, self.clock.now_ms()),
        }
    }

    /// Recent trades, cache first (served from the push-fed buffer when a
    /// trade subscription is live).
    pub async fn get_recent_trades(
        &self,
        symbol: &str,
        limit: Option<u32>,
    ) -> Envelope<Vec<TradeRecord>> {
        let symbol = normalize_symbol(symbol);
        let key = full_key(NAMESPACE, "trades", &symbol, &[]);
        if limit.is_none() {
            if let Some(MarketRecord::TradeHistory(trades)) = self.cache.get(&key) {
                return Envelope::ok(trades, Source::Cache, self.clock.now_ms());
            }
        }
        match self.rest.get_recent_trades(&symbol, limit).await {
            Ok(trades) => {
                self.cache
                    .set(&key, MarketRecord::TradeHistory(trades.clone()));
                Envelope::ok(trades, Source::Rest, self.clock.now_ms())
            }
            Err(error) => Envelope::err(error, Source::Rest, self.clock.now_ms()),
        }
    }

    /// Candlesticks, cache first.
    pub async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: Option<u32>,
    ) -> Envelope<Vec<Kline>> {
        let symbol = normalize_symbol(symbol);
        let key = full_key(NAMESPACE, "kline", &symbol, &[("interval", interval)]);
        if limit.is_none() {
            if let Some(MarketRecord::KlineSeries(klines)) = self.cache.get(&key) {
                return Envelope::ok(klines, Source::Cache, self.clock.now_ms());
            }
        }
        match self.rest.get_klines(&symbol, interval, limit).await {
            Ok(klines) => {
                self.cache
                    .set(&key, MarketRecord::KlineSeries(klines.clone()));
                Envelope::ok(klines, Source::Rest, self.clock.now_ms())
            }
            Err(error) => Envelope::err(error, Source::Rest, self.clock.now_ms()),
        }
    }

    /// 24-hour statistics, cache first.
    pub async fn get_24hr_ticker(&self, symbol: &str) -> Envelope<Ticker24h> {
        let symbol = normalize_symbol(symbol);
        let key = full_key(NAMESPACE, "ticker", &symbol, &[]);
        if let Some(MarketRecord::Ticker24h(ticker)) = self.cache.get(&key) {
            return Envelope::ok(ticker, Source::Cache, self.clock.now_ms());
        }
        match self.rest.get_24hr_ticker(&symbol).await {
            Ok(ticker) => {
                self.cache
                    .set(&key, MarketRecord::Ticker24h(ticker.clone()));
                Envelope::ok(ticker, Source::Rest, self.clock.now_ms())
            }
            Err(error) => Envelope::err(error, Source::Rest, self.clock.now_ms()),
        }
    }

    // ----- subscriptions ----------------------------------------------

    /// Best bid/ask stream.
    pub fn subscribe_book_ticker(
        &self,
        symbol: &str,
        options: SubscribeOptions,
        callback: impl Fn(Envelope<MarketRecord>) + Send + Sync + 'static,
    ) -> Subscription {
        self.subscribe_key(StreamKey::new(symbol, Topic::BookTicker), options, callback)
    }

    /// Order book depth stream.
    pub fn subscribe_depth(
        &self,
        symbol: &str,
        options: SubscribeOptions,
        callback: impl Fn(Envelope<MarketRecord>) + Send + Sync + 'static,
    ) -> Subscription {
        self.subscribe_key(StreamKey::new(symbol, Topic::Depth), options, callback)
    }

    /// Aggregate trade stream with a rolling buffer (newest first).
    pub fn subscribe_trades(
        &self,
        symbol: &str,
        options: SubscribeOptions,
        callback: impl Fn(Envelope<MarketRecord>) + Send + Sync + 'static,
    ) -> Subscription {
        self.subscribe_key(StreamKey::new(symbol, Topic::AggTrade), options, callback)
    }

    /// Candlestick stream for one interval, buffered by open time.
    pub fn subscribe_klines(
        &self,
        symbol: &str,
        interval: &str,
        options: SubscribeOptions,
        callback: impl Fn(Envelope<MarketRecord>) + Send + Sync + 'static,
    ) -> Subscription {
        self.subscribe_key(
            StreamKey::with_param(symbol, Topic::Kline, interval),
            options,
            callback,
        )
    }

    /// 24-hour ticker stream.
    pub fn subscribe_ticker(
        &self,
        symbol: &str,
        options: SubscribeOptions,
        callback: impl Fn(Envelope<MarketRecord>) + Send + Sync + 'static,
    ) -> Subscription {
        self.subscribe_key(StreamKey::new(symbol, Topic::Ticker), options, callback)
    }

    /// Subscribe to an arbitrary stream key.
    pub fn subscribe_stream(
        &self,
        key: StreamKey,
        options: SubscribeOptions,
        callback: impl Fn(Envelope<MarketRecord>) + Send + Sync + 'static,
    ) -> Subscription {
        self.subscribe_key(key, options, callback)
    }

    /// Subscribe to several keys over one combined session. Buffers do
    /// not apply; each delivery carries the record for its own key.
    pub fn subscribe_combined(
        &self,
        keys: Vec<StreamKey>,
        options: SubscribeOptions,
        callback: impl Fn(Envelope<MarketRecord>) + Send + Sync + 'static,
    ) -> Subscription {
        let callback: SubscriptionCallback = Arc::new(callback);
        let primary = keys.first().cloned().unwrap_or_else(|| {
            StreamKey::new("unknown", Topic::Ticker)
        });
        let core = Arc::new(SubscriptionCore {
            key: primary.clone(),
            options,
            buffer: SubBuffer::None,
            callback,
            cache: Arc::clone(&self.cache),
            clock: Arc::clone(&self.clock),
            rest: Arc::clone(&self.rest),
            sink: Arc::clone(&self.sink),
            decode_errors: Arc::clone(&self.decode_errors),
            refresh_in_flight: AtomicBool::new(false),
        });

        let raw_core = Arc::clone(&core);
        let registration_id = self.supervisor.connect_to_streams(
            &keys,
            Arc::new(move |event| raw_core.on_raw_event(event)),
        );

        let mut poll_ids = Vec::with_capacity(keys.len());
        for key in &keys {
            spawn_prime(Arc::clone(&core), key.clone());
            let poll_id = format!("{key}#{registration_id}");
            self.start_fallback(&poll_id, key.clone(), Arc::clone(&core));
            poll_ids.push(poll_id);
        }

        Subscription {
            key: primary,
            registration_id,
            poll_ids,
            supervisor: Arc::clone(&self.supervisor),
            poller: Arc::clone(&self.poller),
            active: AtomicBool::new(true),
        }
    }

    fn subscribe_key(
        &self,
        key: StreamKey,
        options: SubscribeOptions,
        callback: impl Fn(Envelope<MarketRecord>) + Send + Sync + 'static,
    ) -> Subscription {
        let callback: SubscriptionCallback = Arc::new(callback);
        let buffer = match key.topic() {
            Topic::Trade | Topic::AggTrade => {
                SubBuffer::Trades(Mutex::new(TradeRing::new(options.buffer_size)))
            }
            Topic::Kline => SubBuffer::Klines(Mutex::new(KlineBuffer::new(options.buffer_size))),
            _ => SubBuffer::None,
        };
        let core = Arc::new(SubscriptionCore {
            key: key.clone(),
            options,
            buffer,
            callback,
            cache: Arc::clone(&self.cache),
            clock: Arc::clone(&self.clock),
            rest: Arc::clone(&self.rest),
            sink: Arc::clone(&self.sink),
            decode_errors: Arc::clone(&self.decode_errors),
            refresh_in_flight: AtomicBool::new(false),
        });

        // 1. Register with the supervisor for the push key.
        let raw_core = Arc::clone(&core);
        let registration_id = self
            .supervisor
            .subscribe_to_stream(&key, Arc::new(move |event| raw_core.on_raw_event(event)));

        // 2. Prime with current state; runs concurrently with push setup.
        spawn_prime(Arc::clone(&core), key.clone());

        // 3. Fallback poller, active whenever push is unavailable.
        let poll_id = format!("{key}#{registration_id}");
        self.start_fallback(&poll_id, key.clone(), Arc::clone(&core));

        Subscription {
            key,
            registration_id,
            poll_ids: vec![poll_id],
            supervisor: Arc::clone(&self.supervisor),
            poller: Arc::clone(&self.poller),
            active: AtomicBool::new(true),
        }
    }

    fn start_fallback(&self, poll_id: &str, key: StreamKey, core: Arc<SubscriptionCore>) {
        let deliver_key = key.clone();
        self.poller.start(
            poll_id,
            key,
            Arc::clone(&self.rest),
            Arc::clone(&self.supervisor),
            Arc::new(move |result| match result {
                Ok(record) => core.deliver(&deliver_key, record, Source::Rest),
                Err(error) => {
                    (core.callback)(Envelope::err(error, Source::Rest, core.clock.now_ms()));
                }
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    use crate::cache::CacheConfig;
    use crate::clock::SystemClock;
    use crate::config::EngineConfig;
    use crate::events::TracingSink;
    use crate::limiter::{RateLimitConfig, RateLimiter};
    use crate::retry::BreakerConfig;
    use crate::stream::SessionConfig;

    fn service() -> MarketDataService {
        let config = EngineConfig {
            rest_base_url: "http://127.0.0.1:1".to_string(),
            ws_base_url: "ws://127.0.0.1:1".to_string(),
            request_timeout: Duration::from_millis(200),
            ..EngineConfig::default()
        };
        let sink: SharedSink = Arc::new(TracingSink);
        let limiter = Arc::new(RateLimiter::new(
            RateLimitConfig::default(),
            Arc::clone(&sink),
        ));
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let rest = Arc::new(RestClient::new(
            &config,
            None,
            limiter,
            Arc::clone(&clock),
        ));
        let supervisor = StreamSupervisor::new(
            SessionConfig {
                ws_base_url: config.ws_base_url.clone(),
                initial_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(20),
                backoff_factor: 2.0,
                max_reconnect_attempts: 0,
                heartbeat_interval: config.heartbeat_interval,
                heartbeat_timeout: config.heartbeat_timeout,
                api_key: None,
            },
            BreakerConfig::default(),
            Arc::clone(&sink),
        );
        let poller = Arc::new(FallbackPoller::new(Duration::from_secs(60)));
        let cache = Arc::new(MarketCache::new(CacheConfig::default()));
        MarketDataService::new(rest, supervisor, poller, cache, clock, sink)
    }

    fn price_tick(bid: rust_decimal::Decimal) -> PriceTick {
        PriceTick {
            symbol: "BTCUSDT".into(),
            bid,
            bid_qty: dec!(1),
            ask: bid + dec!(1),
            ask_qty: dec!(1),
            event_time: 0,
        }
    }

    #[tokio::test]
    async fn test_one_shot_prefers_cache() {
        let service = service();
        service.cache.set(
            "market:bookTicker:BTCUSDT",
            MarketRecord::PriceTick(price_tick(dec!(60005))),
        );
        let envelope = service.get_current_price("btcusdt").await;
        assert_eq!(envelope.source(), Source::Cache);
        assert_eq!(envelope.data().unwrap().bid, dec!(60005));
        service.supervisor.shutdown();
    }

    #[tokio::test]
    async fn test_one_shot_error_envelope_when_rest_down() {
        let service = service();
        let envelope = service.get_current_price("BTCUSDT").await;
        assert_eq!(envelope.source(), Source::Rest);
        assert!(envelope.error().is_some());
        assert!(envelope.data().is_none());
        service.supervisor.shutdown();
    }

    #[tokio::test]
    async fn test_push_delivery_updates_cache_before_callback() {
        let service = service();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let subscription = service.subscribe_book_ticker(
            "btcusdt",
            SubscribeOptions {
                reconnect_on_transient_error: false,
                max_retries: 0,
                ..SubscribeOptions::default()
            },
            move |envelope| {
                let _ = tx.send(envelope);
            },
        );

        // Simulate a push frame arriving through the supervisor's
        // dispatch path (the socket itself is down in this test).
        service.supervisor.dispatch(RawStreamEvent {
            key: "btcusdt@bookTicker".to_string(),
            payload: json!({
                "e": "bookTicker",
                "s": "BTCUSDT",
                "b": "60005.00",
                "B": "0.5",
                "a": "60006.00",
                "A": "0.3"
            }),
            received_at_ms: 0,
        });
        let delivered = loop {
            let envelope = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("delivery")
                .expect("channel open");
            if envelope.is_ok() && envelope.source() == Source::Push {
                break envelope;
            }
        };
        match delivered.data().unwrap() {
            MarketRecord::PriceTick(tick) => assert_eq!(tick.bid, dec!(60005.00)),
            other => panic!("unexpected record {other:?}"),
        }

        // Cache was updated before the callback ran.
        let cached = service.get_current_price("BTCUSDT").await;
        assert_eq!(cached.source(), Source::Cache);
        assert_eq!(cached.data().unwrap().bid, dec!(60005.00));

        subscription.unsubscribe();
        subscription.unsubscribe();
        assert!(!subscription.is_active());
        service.supervisor.shutdown();
    }

    #[tokio::test]
    async fn test_kline_buffer_replacement_through_push_path() {
        let service = service();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _subscription = service.subscribe_klines(
            "btcusdt",
            "1m",
            SubscribeOptions {
                reconnect_on_transient_error: false,
                max_retries: 0,
                ..SubscribeOptions::default()
            },
            move |envelope| {
                if envelope.source() == Source::Push {
                    let _ = tx.send(envelope);
                }
            },
        );

        let kline_frame = |open: i64, close: &str| {
            json!({
                "e": "kline",
                "E": open + 10,
                "s": "BTCUSDT",
                "k": {
                    "t": open,
                    "T": open + 59_999,
                    "s": "BTCUSDT",
                    "i": "1m",
                    "o": "100",
                    "h": "110",
                    "l": "90",
                    "c": close,
                    "v": "10",
                    "n": 5,
                    "x": false,
                    "q": "1000",
                    "V": "5",
                    "Q": "500"
                }
            })
        };
        let send = |payload: serde_json::Value| RawStreamEvent {
            key: "btcusdt@kline_1m".to_string(),
            payload,
            received_at_ms: 0,
        };

        service.supervisor.dispatch(send(kline_frame(60_000, "101")));
        service.supervisor.dispatch(send(kline_frame(60_000, "105")));
        service.supervisor.dispatch(send(kline_frame(120_000, "106")));

        let mut last = None;
        for _ in 0..3 {
            let envelope = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("delivery")
                .expect("open");
            last = Some(envelope);
        }
        match last.unwrap().data().unwrap() {
            MarketRecord::KlineSeries(series) => {
                assert_eq!(series.len(), 2);
                assert_eq!(series[0].open_time, 60_000);
                assert_eq!(series[0].close, dec!(105));
                assert_eq!(series[1].open_time, 120_000);
            }
            other => panic!("unexpected record {other:?}"),
        }
        service.supervisor.shutdown();
    }

    #[tokio::test]
    async fn test_decode_error_counted_and_delivered() {
        let service = service();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _subscription = service.subscribe_book_ticker(
            "btcusdt",
            SubscribeOptions {
                reconnect_on_transient_error: false,
                max_retries: 0,
                ..SubscribeOptions::default()
            },
            move |envelope| {
                if envelope.source() == Source::Push {
                    let _ = tx.send(envelope);
                }
            },
        );

        service.supervisor.dispatch(RawStreamEvent {
            key: "btcusdt@bookTicker".to_string(),
            payload: json!({
                "e": "bookTicker",
                "s": "BTCUSDT",
                "b": "garbage",
                "B": "1",
                "a": "2",
                "A": "1"
            }),
            received_at_ms: 0,
        });

        let envelope = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("delivery")
            .expect("open");
        assert!(envelope.error().is_some());
        assert_eq!(service.decode_error_count(), 1);
        service.supervisor.shutdown();
    }
}
