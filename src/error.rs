//! Error taxonomy for the market data engine.
//!
//! One sum type tagged by kind. Transport failures from `reqwest` are
//! classified into the taxonomy at the boundary; everything downstream
//! matches on variants instead of status codes.

use std::time::Duration;
use thiserror::Error;

/// Severity of an error, used by event sinks to pick a log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Expected under load (rate limits, stale data).
    Warning,
    /// Degraded but recoverable (network, transport).
    Error,
    /// Requires operator attention (auth, order failures).
    Critical,
}

/// Engine error type.
///
/// Carries enough context to build subscriber-facing envelopes. All
/// variants are cloneable because errors travel inside envelopes and are
/// retained as `last_error` in per-stream metrics.
#[derive(Error, Debug, Clone)]
pub enum MarketError {
    /// DNS failure, connection refused/reset, or request timeout.
    #[error("network error: {message}")]
    Network { message: String },

    /// Non-2xx REST response with a decoded `{code, msg}` body.
    #[error("api error {code}: {message}")]
    Api { code: i64, message: String },

    /// HTTP 429. `retry_after` is taken from the `Retry-After` header
    /// when the server provides one.
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    /// HTTP 401/403 or missing credentials. Never retried.
    #[error("authentication failed: {message}")]
    Auth { message: String },

    /// A decoded record failed its invariants.
    #[error("validation failed: {message}")]
    Validation { message: String },

    /// Transport-level failure on a push connection.
    #[error("websocket error: {message}")]
    WebSocket { message: String },

    /// Failure on a signed order path, wrapping the root cause together
    /// with the order parameters.
    #[error("order execution failed ({symbol} {side} {quantity}): {message}")]
    OrderExecution {
        symbol: String,
        side: String,
        quantity: String,
        message: String,
    },
}

impl MarketError {
    pub fn network(message: impl Into<String>) -> Self {
        MarketError::Network {
            message: message.into(),
        }
    }

    pub fn websocket(message: impl Into<String>) -> Self {
        MarketError::WebSocket {
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        MarketError::Validation {
            message: message.into(),
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        MarketError::Auth {
            message: message.into(),
        }
    }

    /// Error returned when a circuit breaker rejects a call without
    /// attempting it.
    pub fn circuit_open(scope: &str) -> Self {
        MarketError::Network {
            message: format!("circuit_open: {} endpoint unavailable", scope),
        }
    }

    /// Stable tag for structured logging and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            MarketError::Network { .. } => "network",
            MarketError::Api { .. } => "api",
            MarketError::RateLimited { .. } => "rate_limit",
            MarketError::Auth { .. } => "auth",
            MarketError::Validation { .. } => "validation",
            MarketError::WebSocket { .. } => "websocket",
            MarketError::OrderExecution { .. } => "order_execution",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            MarketError::RateLimited { .. } | MarketError::Validation { .. } => Severity::Warning,
            MarketError::Network { .. }
            | MarketError::Api { .. }
            | MarketError::WebSocket { .. } => Severity::Error,
            MarketError::Auth { .. } | MarketError::OrderExecution { .. } => Severity::Critical,
        }
    }

    /// Whether the condition can clear on its own (worth reconnecting or
    /// falling back for).
    pub fn recoverable(&self) -> bool {
        matches!(
            self,
            MarketError::Network { .. }
                | MarketError::RateLimited { .. }
                | MarketError::WebSocket { .. }
        )
    }

    /// Whether the REST retry engine should re-attempt the call.
    /// Network errors and 429s only; 4xx and auth failures are final.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MarketError::Network { .. } | MarketError::RateLimited { .. }
        )
    }
}

impl From<reqwest::Error> for MarketError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return MarketError::network("request timeout");
        }
        if err.is_connect() {
            return MarketError::network(format!("failed to connect: {}", err));
        }
        if let Some(status) = err.status() {
            return match status.as_u16() {
                429 => MarketError::RateLimited {
                    message: "too many requests".to_string(),
                    retry_after: None,
                },
                401 | 403 => MarketError::auth(format!("HTTP {}", status.as_u16())),
                418 => MarketError::network("IP address banned by the exchange"),
                500..=599 => {
                    MarketError::network(format!("server error (HTTP {})", status.as_u16()))
                }
                code => MarketError::Api {
                    code: i64::from(code),
                    message: err.to_string(),
                },
            };
        }
        MarketError::network(err.to_string())
    }
}
