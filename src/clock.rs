//! Time access and the reconnect backoff schedule.
//!
//! The `Clock` trait is the seam the engine uses for wall-clock reads so
//! tests can substitute deterministic time. Monotonic interval math uses
//! `std::time::Instant` directly.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

/// Wall-clock collaborator consumed by the engine.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current time in milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64;

    /// Suspend the calling task for the given duration.
    async fn sleep(&self, duration: Duration);
}

/// Production clock backed by the system time and the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Jittered exponential backoff schedule.
///
/// The n-th delay is `min(max, initial * factor^n) * jitter` with jitter
/// drawn uniformly from [0.9, 1.1]. The cap applies before the jitter, so
/// late delays land in `[0.9 * max, 1.1 * max]`.
#[derive(Debug)]
pub struct Backoff {
    initial: Duration,
    factor: f64,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, factor: f64, max: Duration) -> Self {
        Self {
            initial,
            factor,
            max,
            attempt: 0,
        }
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Next delay in the schedule, advancing the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let exponential =
            self.initial.as_millis() as f64 * self.factor.powi(self.attempt as i32);
        let capped = exponential.min(self.max.as_millis() as f64);
        let jitter = rand::thread_rng().gen_range(0.9..=1.1);
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis((capped * jitter).round() as u64)
    }

    /// Reset after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
