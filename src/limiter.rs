//! Client-side rate limiter for exchange REST requests.
//!
//! Three buckets mirror the exchange's documented limits: request weight
//! per minute, orders per 10 seconds, and raw requests per 5 minutes.
//! Each bucket keeps a log of timestamped charges and admits a new charge
//! only when the sum over the trailing window stays within the limit, so
//! the bound holds for any rolling window, not just windows aligned to a
//! reset boundary. `acquire` never fails a call; on overshoot it suspends
//! the caller until enough old charges age out, then charges.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::events::{EngineEvent, SharedSink};

/// Window for the request-weight bucket.
const WEIGHT_WINDOW: Duration = Duration::from_secs(60);
/// Window for the order-count bucket.
const ORDERS_WINDOW: Duration = Duration::from_secs(10);
/// Window for the raw-request bucket.
const RAW_WINDOW: Duration = Duration::from_secs(300);

/// Extra sleep after a computed wait, so a caller waking at the boundary
/// lands past the expiring charge.
const RESET_SLACK: Duration = Duration::from_millis(50);

/// Identifies one of the three limiter buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketKind {
    /// Request weight, 1-minute window.
    Weight,
    /// Order mutations, 10-second window.
    Orders,
    /// Raw request count, 5-minute window.
    Raw,
}

impl BucketKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BucketKind::Weight => "weight",
            BucketKind::Orders => "orders",
            BucketKind::Raw => "raw",
        }
    }
}

/// Bucket limits. Windows are fixed; limits are set at construction.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Request weight per minute.
    pub weight_limit: u32,
    /// Orders per 10 seconds.
    pub orders_limit: u32,
    /// Raw requests per 5 minutes.
    pub raw_limit: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        // Exchange defaults for USDT-M futures.
        Self {
            weight_limit: 2400,
            orders_limit: 300,
            raw_limit: 61_000,
        }
    }
}

/// Point-in-time view of one bucket, for introspection.
#[derive(Debug, Clone)]
pub struct BucketUsage {
    pub kind: BucketKind,
    pub limit: u32,
    /// Sum of charges in the trailing window.
    pub count: u32,
    /// Time until the oldest charge ages out (zero when idle).
    pub resets_in: Duration,
}

struct Bucket {
    kind: BucketKind,
    limit: u32,
    window: Duration,
    /// Admission-timestamped charges still inside the window.
    charges: VecDeque<(Instant, u32)>,
    /// Cached sum of `charges`.
    in_window: u32,
}

impl Bucket {
    fn new(kind: BucketKind, limit: u32, window: Duration) -> Self {
        Self {
            kind,
            limit,
            window,
            charges: VecDeque::new(),
            in_window: 0,
        }
    }

    /// Drop charges that have aged out of the trailing window.
    fn expire(&mut self, now: Instant) {
        while let Some((at, weight)) = self.charges.front().copied() {
            if now.duration_since(at) >= self.window {
                self.in_window -= weight;
                self.charges.pop_front();
            } else {
                break;
            }
        }
    }

    /// Admit a charge, or say how long until enough capacity frees.
    ///
    /// Admission only when the trailing-window sum plus `weight` stays
    /// within the limit; every admitted charge is timestamped, so the
    /// sum over any window of this bucket's length is bounded by the
    /// limit regardless of alignment.
    fn try_charge(&mut self, now: Instant, weight: u32) -> Result<(), Duration> {
        let weight = if weight > self.limit {
            tracing::warn!(
                bucket = self.kind.as_str(),
                weight,
                limit = self.limit,
                "charge exceeds the bucket limit, clamping"
            );
            self.limit
        } else {
            weight
        };

        self.expire(now);
        if self.in_window + weight <= self.limit {
            self.charges.push_back((now, weight));
            self.in_window += weight;
            return Ok(());
        }

        // Walk the oldest charges until enough capacity would be freed;
        // the wait ends when that charge leaves the window.
        let mut freed = 0u32;
        for (at, charged) in &self.charges {
            freed += charged;
            if self.in_window - freed + weight <= self.limit {
                let expires_at = *at + self.window;
                return Err(expires_at.saturating_duration_since(now));
            }
        }
        Err(self.window)
    }

    /// Time until the oldest charge ages out.
    fn next_expiry(&self, now: Instant) -> Duration {
        self.charges
            .front()
            .map(|(at, _)| (*at + self.window).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }
}

/// Multi-bucket token limiter with rolling-window accounting.
///
/// `acquire` is the only mutator of bucket state; the interior mutex
/// serializes accounting across concurrent callers. The critical section
/// never spans a suspension point.
pub struct RateLimiter {
    buckets: Mutex<[Bucket; 3]>,
    sink: SharedSink,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, sink: SharedSink) -> Self {
        Self {
            buckets: Mutex::new([
                Bucket::new(BucketKind::Weight, config.weight_limit, WEIGHT_WINDOW),
                Bucket::new(BucketKind::Orders, config.orders_limit, ORDERS_WINDOW),
                Bucket::new(BucketKind::Raw, config.raw_limit, RAW_WINDOW),
            ]),
            sink,
        }
    }

    fn index(kind: BucketKind) -> usize {
        match kind {
            BucketKind::Weight => 0,
            BucketKind::Orders => 1,
            BucketKind::Raw => 2,
        }
    }

    /// Charge `weight` against a bucket, suspending until capacity exists.
    ///
    /// Returns only once the charge has been admitted. Never fails: an
    /// overshoot delays the caller until enough older charges age out
    /// (plus a small slack) and emits a `rateLimit` event with the wait
    /// duration.
    pub async fn acquire(&self, kind: BucketKind, weight: u32) {
        loop {
            let wait = {
                let mut buckets = self.buckets.lock().unwrap();
                match buckets[Self::index(kind)].try_charge(Instant::now(), weight) {
                    Ok(()) => return,
                    Err(wait) => wait,
                }
            };

            self.sink.emit(EngineEvent::RateLimit {
                bucket: kind.as_str(),
                wait_ms: wait.as_millis() as u64,
            });
            tracing::debug!(
                bucket = kind.as_str(),
                wait_ms = wait.as_millis() as u64,
                "bucket exhausted, waiting for capacity"
            );
            tokio::time::sleep(wait + RESET_SLACK).await;
        }
    }

    /// Charge a read-only REST call: weight bucket only.
    pub async fn charge_read(&self, weight: u32) {
        self.acquire(BucketKind::Weight, weight).await;
    }

    /// Charge a state-mutating REST call: weight (1) plus one order token.
    pub async fn charge_order(&self) {
        self.acquire(BucketKind::Weight, 1).await;
        self.acquire(BucketKind::Orders, 1).await;
    }

    /// Snapshot of all bucket counters.
    pub fn usage(&self) -> Vec<BucketUsage> {
        let mut buckets = self.buckets.lock().unwrap();
        let now = Instant::now();
        buckets
            .iter_mut()
            .map(|bucket| {
                bucket.expire(now);
                BucketUsage {
                    kind: bucket.kind,
                    limit: bucket.limit,
                    count: bucket.in_window,
                    resets_in: bucket.next_expiry(now),
                }
            })
            .collect()
    }

    /// Background task expiring aged-out charges once per second.
    ///
    /// `acquire` also expires lazily; this keeps idle buckets from
    /// holding stale charge logs between calls.
    pub fn start_reset_task(self: &Arc<Self>) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            loop {
                tick.tick().await;
                let now = Instant::now();
                let mut buckets = limiter.buckets.lock().unwrap();
                for bucket in buckets.iter_mut() {
                    bucket.expire(now);
                }
            }
        })
    }
}
