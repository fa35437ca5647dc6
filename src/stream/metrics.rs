//! Per-stream connection metrics.
//!
//! Counters are atomics updated from the session event loop; snapshots
//! are assembled on demand by the supervisor's `metrics()`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Cap on the timestamp ring used for the 1-second message rate.
const RATE_WINDOW_CAP: usize = 4096;

/// Connection health score 0-100 derived from pong age.
///
/// 100 when the last pong is within 30 s, 75 within 60 s, 50 within
/// 120 s, 25 otherwise; 0 when disconnected; 20 when connected but never
/// ponged.
pub fn connection_health(connected: bool, last_pong_age: Option<Duration>) -> u8 {
    if !connected {
        return 0;
    }
    match last_pong_age {
        None => 20,
        Some(age) if age <= Duration::from_secs(30) => 100,
        Some(age) if age <= Duration::from_secs(60) => 75,
        Some(age) if age <= Duration::from_secs(120) => 50,
        Some(_) => 25,
    }
}

/// Live counters for one stream session.
#[derive(Default)]
pub struct StreamMetrics {
    message_count: AtomicU64,
    message_bytes: AtomicU64,
    error_count: AtomicU64,
    reconnect_count: AtomicU64,
    data_gap_count: AtomicU64,
    stale_count: AtomicU64,
    ping_latency_sum_ms: AtomicU64,
    ping_latency_samples: AtomicU64,
    state: Mutex<MetricsState>,
}

#[derive(Default)]
struct MetricsState {
    connected_at: Option<Instant>,
    last_pong_at: Option<Instant>,
    last_error: Option<String>,
    recent: VecDeque<Instant>,
}

impl StreamMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_connected(&self) {
        let mut state = self.state.lock().unwrap();
        state.connected_at = Some(Instant::now());
        state.last_pong_at = None;
    }

    pub fn mark_disconnected(&self) {
        self.state.lock().unwrap().connected_at = None;
    }

    pub fn record_message(&self, bytes: usize) {
        self.message_count.fetch_add(1, Ordering::Relaxed);
        self.message_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();
        state.recent.push_back(now);
        while state.recent.len() > RATE_WINDOW_CAP {
            state.recent.pop_front();
        }
        while state
            .recent
            .front()
            .map(|t| now.duration_since(*t) > Duration::from_secs(1))
            .unwrap_or(false)
        {
            state.recent.pop_front();
        }
    }

    pub fn record_error(&self, message: &str) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
        self.state.lock().unwrap().last_error = Some(message.to_string());
    }

    pub fn record_reconnect(&self) {
        self.reconnect_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_data_gap(&self) {
        self.data_gap_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale(&self) {
        self.stale_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pong(&self, latency: Duration) {
        self.ping_latency_sum_ms
            .fetch_add(latency.as_millis() as u64, Ordering::Relaxed);
        self.ping_latency_samples.fetch_add(1, Ordering::Relaxed);
        self.state.lock().unwrap().last_pong_at = Some(Instant::now());
    }

    /// Assemble a point-in-time snapshot.
    pub fn snapshot(&self) -> StreamMetricsSnapshot {
        let now = Instant::now();
        let state = self.state.lock().unwrap();
        let connected = state.connected_at.is_some();
        let uptime = state
            .connected_at
            .map(|at| now.duration_since(at))
            .unwrap_or(Duration::ZERO);
        let message_rate = state
            .recent
            .iter()
            .filter(|t| now.duration_since(**t) <= Duration::from_secs(1))
            .count() as f64;
        let samples = self.ping_latency_samples.load(Ordering::Relaxed);
        let avg_ping_latency_ms = if samples > 0 {
            self.ping_latency_sum_ms.load(Ordering::Relaxed) as f64 / samples as f64
        } else {
            0.0
        };
        let last_pong_age = state.last_pong_at.map(|at| now.duration_since(at));

        StreamMetricsSnapshot {
            connected,
            uptime,
            message_count: self.message_count.load(Ordering::Relaxed),
            message_rate,
            avg_ping_latency_ms,
            error_count: self.error_count.load(Ordering::Relaxed),
            last_error: state.last_error.clone(),
            reconnect_count: self.reconnect_count.load(Ordering::Relaxed),
            data_gap_count: self.data_gap_count.load(Ordering::Relaxed),
            stale_count: self.stale_count.load(Ordering::Relaxed),
            // Parsed JSON roughly doubles the wire footprint.
            estimated_memory_bytes: self.message_bytes.load(Ordering::Relaxed) * 2,
            health: connection_health(connected, last_pong_age),
        }
    }
}

/// Point-in-time view of one stream's metrics.
#[derive(Debug, Clone)]
pub struct StreamMetricsSnapshot {
    pub connected: bool,
    pub uptime: Duration,
    pub message_count: u64,
    /// Messages received in the trailing 1-second window.
    pub message_rate: f64,
    pub avg_ping_latency_ms: f64,
    pub error_count: u64,
    pub last_error: Option<String>,
    pub reconnect_count: u64,
    pub data_gap_count: u64,
    pub stale_count: u64,
    pub estimated_memory_bytes: u64,
    /// 0-100 health score from pong age.
    pub health: u8,
}
