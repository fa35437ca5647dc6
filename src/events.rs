//! Structured engine events.
//!
//! Connection lifecycle, rate limiting, and data-quality signals are
//! emitted through an `EventSink` so embedding applications can observe
//! the engine without being on the hot path. The default sink logs via
//! `tracing`.

use std::sync::Arc;

/// A structured event emitted by the engine.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A push connection reached the open state.
    Connect { stream: String },
    /// A push connection closed (code present when the peer sent one).
    Disconnect { stream: String, code: Option<u16> },
    /// A reconnection attempt was scheduled.
    Reconnect {
        stream: String,
        attempt: u32,
        delay_ms: u64,
    },
    /// An error occurred; `scope` names the subsystem.
    Error { scope: String, message: String },
    /// A ping response arrived; latency measured from the outbound ping.
    Heartbeat { stream: String, latency_ms: u64 },
    /// A caller was delayed by a rate-limit bucket.
    RateLimit { bucket: &'static str, wait_ms: u64 },
    /// A delivered record carried an event time older than the staleness
    /// threshold. The record was still delivered.
    StaleData { stream: String, age_ms: i64 },
}

/// Observer for engine events. Implementations must be non-blocking.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: EngineEvent);
}

/// Default sink that forwards events to `tracing`.
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: EngineEvent) {
        match event {
            EngineEvent::Connect { stream } => {
                tracing::info!(stream = %stream, "stream connected");
            }
            EngineEvent::Disconnect { stream, code } => {
                tracing::info!(stream = %stream, code = ?code, "stream disconnected");
            }
            EngineEvent::Reconnect {
                stream,
                attempt,
                delay_ms,
            } => {
                tracing::warn!(
                    stream = %stream,
                    attempt,
                    delay_ms,
                    "reconnect scheduled"
                );
            }
            EngineEvent::Error { scope, message } => {
                tracing::error!(scope = %scope, message = %message, "engine error");
            }
            EngineEvent::Heartbeat { stream, latency_ms } => {
                tracing::debug!(stream = %stream, latency_ms, "heartbeat acknowledged");
            }
            EngineEvent::RateLimit { bucket, wait_ms } => {
                tracing::warn!(bucket, wait_ms, "rate limit reached, delaying caller");
            }
            EngineEvent::StaleData { stream, age_ms } => {
                tracing::warn!(stream = %stream, age_ms, "stale data delivered");
            }
        }
    }
}

/// Shared handle to an event sink.
pub type SharedSink = Arc<dyn EventSink>;
