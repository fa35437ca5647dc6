//! REST polling fallback for streams without healthy push delivery.
//!
//! One task per routed stream key pulls the nearest REST equivalent of
//! the stream on a timer and hands the result to the subscription's
//! delivery path. While the supervisor reports push healthy for the key
//! the task stays on standby and issues no requests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::data::key::{StreamKey, Topic};
use crate::data::records::MarketRecord;
use crate::error::MarketError;
use crate::rest::RestClient;
use crate::stream::StreamSupervisor;

/// Depth levels requested on the polling path.
const POLL_DEPTH_LIMIT: u32 = 20;
/// Trades/klines fetched per poll.
const POLL_HISTORY_LIMIT: u32 = 100;

/// Sink for poll results; the service wraps these into envelopes with
/// `source = rest`.
pub type PollDeliver = Arc<dyn Fn(Result<MarketRecord, MarketError>) + Send + Sync>;

/// Fetch the REST equivalent of one stream key.
pub(crate) async fn fetch_for_key(
    rest: &RestClient,
    key: &StreamKey,
) -> Result<MarketRecord, MarketError> {
    let symbol = key.rest_symbol();
    match key.topic() {
        Topic::BookTicker => rest
            .get_current_price(&symbol)
            .await
            .map(MarketRecord::PriceTick),
        Topic::Ticker => rest
            .get_24hr_ticker(&symbol)
            .await
            .map(MarketRecord::Ticker24h),
        Topic::Depth => rest
            .get_order_book(&symbol, Some(POLL_DEPTH_LIMIT))
            .await
            .map(MarketRecord::OrderBook),
        Topic::Trade | Topic::AggTrade => rest
            .get_recent_trades(&symbol, Some(POLL_HISTORY_LIMIT))
            .await
            .map(MarketRecord::TradeHistory),
        Topic::Kline => {
            let interval = key.param().unwrap_or("1m");
            rest.get_klines(&symbol, interval, Some(POLL_HISTORY_LIMIT))
                .await
                .map(MarketRecord::KlineSeries)
        }
    }
}

/// Periodic REST pullers, one task per routed stream key.
pub struct FallbackPoller {
    interval: Duration,
    handles: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl FallbackPoller {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Start polling for a key under a caller-chosen id (one id per
    /// subscription). A second start under a live id is a no-op.
    pub fn start(
        &self,
        id: &str,
        key: StreamKey,
        rest: Arc<RestClient>,
        supervisor: Arc<StreamSupervisor>,
        deliver: PollDeliver,
    ) {
        let mut handles = self.handles.lock().unwrap();
        if let Some(existing) = handles.get(id) {
            if !existing.is_finished() {
                return;
            }
        }

        let interval = self.interval;
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await;
            loop {
                tick.tick().await;
                if supervisor.push_available(&key) {
                    tracing::debug!(stream = %key, "push healthy, poller on standby");
                    continue;
                }
                let result = fetch_for_key(&rest, &key).await;
                if let Err(err) = &result {
                    tracing::warn!(stream = %key, error = %err, "fallback poll failed");
                }
                deliver(result);
            }
        });
        handles.insert(id.to_string(), handle);
    }

    /// Stop the poller registered under an id. Unknown ids are ignored.
    pub fn stop(&self, id: &str) {
        if let Some(handle) = self.handles.lock().unwrap().remove(id) {
            handle.abort();
        }
    }

    /// Stop every poller.
    pub fn stop_all(&self) {
        let mut handles = self.handles.lock().unwrap();
        for (_, handle) in handles.drain() {
            handle.abort();
        }
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.handles
            .lock()
            .unwrap()
            .get(id)
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for FallbackPoller {
    fn drop(&mut self) {
        self.stop_all();
    }
}
