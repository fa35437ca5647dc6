//! Generic retry with backoff and a circuit breaker.
//!
//! The retry loop re-attempts an operation while a predicate approves the
//! error, sleeping a jittered exponential delay between attempts. A
//! `Retry-After` carried by a rate-limit error overrides a shorter
//! computed delay. The circuit breaker short-circuits calls to an
//! endpoint that keeps failing, probing it again after a reset timeout.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::clock::Backoff;
use crate::error::MarketError;

/// Tuning for the retry loop.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Re-attempts after the first failure.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Multiplier applied per attempt.
    pub backoff_factor: f64,
    /// Cap on the computed delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Outcome bookkeeping for one retried call, exposed for tests and
/// metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryStats {
    pub attempts: u32,
    pub retries: u32,
}

/// Run `op`, retrying while `should_retry` approves the error.
///
/// Errors rejected by the predicate propagate immediately; after
/// `max_retries` the last error propagates. A `RateLimited` error with a
/// `Retry-After` longer than the computed backoff delays the next attempt
/// until the header's deadline.
pub async fn retry<T, F, Fut, P>(
    policy: &RetryPolicy,
    should_retry: P,
    mut op: F,
) -> (Result<T, MarketError>, RetryStats)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, MarketError>>,
    P: Fn(&MarketError) -> bool,
{
    let mut backoff = Backoff::new(policy.initial_delay, policy.backoff_factor, policy.max_delay);
    let mut stats = RetryStats::default();

    loop {
        stats.attempts += 1;
        match op().await {
            Ok(value) => return (Ok(value), stats),
            Err(err) => {
                if stats.retries >= policy.max_retries || !should_retry(&err) {
                    return (Err(err), stats);
                }
                let mut delay = backoff.next_delay();
                if let MarketError::RateLimited {
                    retry_after: Some(after),
                    ..
                } = &err
                {
                    if *after > delay {
                        delay = *after;
                    }
                }
                tracing::warn!(
                    error = %err,
                    retry = stats.retries + 1,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
                stats.retries += 1;
            }
        }
    }
}

/// Circuit breaker status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Breaker tuning.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Failures within the window before the circuit opens.
    pub failure_threshold: u32,
    /// Window over which failures accumulate.
    pub failure_window: Duration,
    /// Time the circuit stays open before allowing a probe.
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(120),
            reset_timeout: Duration::from_secs(300),
        }
    }
}

struct BreakerInner {
    state: BreakerState,
    failure_count: u32,
    first_failure_at: Option<Instant>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Circuit breaker over a failing endpoint.
///
/// Closed: calls run, failures count. Open: calls are rejected without
/// being attempted until the reset timeout elapses. HalfOpen: exactly one
/// probe runs; its success closes the circuit, its failure reopens it.
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failure_count: 0,
                first_failure_at: None,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Ask permission to run a call.
    ///
    /// Transitions Open to HalfOpen once the reset timeout has elapsed and
    /// admits a single probe in HalfOpen.
    pub fn try_acquire(&self, scope: &str) -> Result<(), MarketError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.reset_timeout {
                    tracing::info!(scope, "circuit breaker reset timeout elapsed, probing");
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    Ok(())
                } else {
                    Err(MarketError::circuit_open(scope))
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(MarketError::circuit_open(scope))
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Record a successful call: closes the circuit, clears counters.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = BreakerState::Closed;
        inner.failure_count = 0;
        inner.first_failure_at = None;
        inner.opened_at = None;
        inner.probe_in_flight = false;
    }

    /// Record a failed call. Opens the circuit at the failure threshold,
    /// or immediately when a HalfOpen probe fails.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(now);
                inner.probe_in_flight = false;
                tracing::warn!("circuit breaker probe failed, reopening");
            }
            BreakerState::Open => {}
            BreakerState::Closed => {
                let window_expired = inner
                    .first_failure_at
                    .map(|at| now.duration_since(at) > self.config.failure_window)
                    .unwrap_or(true);
                if window_expired {
                    inner.failure_count = 1;
                    inner.first_failure_at = Some(now);
                } else {
                    inner.failure_count += 1;
                }
                if inner.failure_count >= self.config.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(now);
                    tracing::error!(
                        failures = inner.failure_count,
                        reset_timeout_secs = self.config.reset_timeout.as_secs(),
                        "circuit breaker opened"
                    );
                }
            }
        }
    }

    /// Force Open (or HalfOpen) back to Closed.
    pub fn force_close(&self) {
        self.record_success();
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().unwrap().state
    }
}

/// Run one operation through a breaker: acquire, execute, record.
pub async fn with_breaker<T, F, Fut>(
    breaker: &CircuitBreaker,
    scope: &str,
    op: F,
) -> Result<T, MarketError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, MarketError>>,
{
    breaker.try_acquire(scope)?;
    match op().await {
        Ok(value) => {
            breaker.record_success();
            Ok(value)
        }
        Err(err) => {
            breaker.record_failure();
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            initial_delay: Duration::from_millis(10),
            backoff_factor: 2.0,
            max_delay: Duration::from_millis(100),
        }
    }

    #[tokio::test]
    async fn test_success_needs_no_retry() {
        let (result, stats) = retry(&fast_policy(), |_| true, || async {
            Ok::<_, MarketError>(42)
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(stats.attempts, 1);
        assert_eq!(stats.retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);
        let (result, stats) = retry(&fast_policy(), MarketError::is_retryable, move || {
            let calls = Arc::clone(&calls_clone);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(MarketError::network("reset"))
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(stats.retries, 2);
    }

    #[tokio::test]
    async fn test_non_retryable_propagates_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);
        let (result, stats) = retry(&fast_policy(), MarketError::is_retryable, move || {
            let calls = Arc::clone(&calls_clone);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<u32, _>(MarketError::auth("denied"))
            }
        })
        .await;
        assert!(matches!(result, Err(MarketError::Auth { .. })));
        assert_eq!(stats.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_error_propagates_after_max_retries() {
        let (result, stats) = retry(&fast_policy(), MarketError::is_retryable, || async {
            Err::<u32, _>(MarketError::network("refused"))
        })
        .await;
        assert!(matches!(result, Err(MarketError::Network { .. })));
        assert_eq!(stats.attempts, 4);
        assert_eq!(stats.retries, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_is_honored() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);
        let start = Instant::now();
        let (result, stats) = retry(&fast_policy(), MarketError::is_retryable, move || {
            let calls = Arc::clone(&calls_clone);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(MarketError::RateLimited {
                        message: "429".into(),
                        retry_after: Some(Duration::from_secs(1)),
                    })
                } else {
                    Ok(1)
                }
            }
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(stats.retries, 1);
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    fn fast_breaker(threshold: u32, reset_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            failure_threshold: threshold,
            failure_window: Duration::from_secs(60),
            reset_timeout: Duration::from_millis(reset_ms),
        })
    }

    #[test]
    fn test_breaker_trips_at_threshold() {
        let breaker = fast_breaker(3, 1000);
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(breaker.try_acquire("test").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_half_open_probe_success_closes() {
        let breaker = fast_breaker(1, 100);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(breaker.try_acquire("test").is_ok());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        // Only one probe admitted.
        assert!(breaker.try_acquire("test").is_err());

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_probe_failure_reopens() {
        let breaker = fast_breaker(1, 100);
        breaker.record_failure();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(breaker.try_acquire("test").is_ok());
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn test_force_close_resets() {
        let breaker = fast_breaker(1, 60_000);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        breaker.force_close();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.try_acquire("test").is_ok());
    }

    #[tokio::test]
    async fn test_with_breaker_records_outcome() {
        let breaker = fast_breaker(1, 60_000);
        let result = with_breaker(&breaker, "test", || async {
            Err::<u32, _>(MarketError::network("down"))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(breaker.state(), BreakerState::Open);

        // Rejected without running the operation.
        let result = with_breaker(&breaker, "test", || async { Ok(1) }).await;
        assert!(result.is_err());
    }
}
