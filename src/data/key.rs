//! Canonical stream subscription keys.
//!
//! A stream key is the lowercase identifier `<symbol>@<topic>[_<param>]`
//! used on the combined WebSocket endpoint, e.g. `btcusdt@bookTicker` or
//! `btcusdt@kline_1m`.

use std::fmt;
use std::str::FromStr;

use crate::error::MarketError;

/// Push stream topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    BookTicker,
    Depth,
    AggTrade,
    Trade,
    Kline,
    Ticker,
}

impl Topic {
    /// Wire spelling used inside stream keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::BookTicker => "bookTicker",
            Topic::Depth => "depth",
            Topic::AggTrade => "aggTrade",
            Topic::Trade => "trade",
            Topic::Kline => "kline",
            Topic::Ticker => "ticker",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "bookTicker" => Some(Topic::BookTicker),
            "depth" => Some(Topic::Depth),
            "aggTrade" => Some(Topic::AggTrade),
            "trade" => Some(Topic::Trade),
            "kline" => Some(Topic::Kline),
            "ticker" => Some(Topic::Ticker),
            _ => None,
        }
    }

    /// Map an inbound event type (`e` field) to its topic.
    pub fn from_event_type(event_type: &str) -> Option<Self> {
        match event_type {
            "bookTicker" => Some(Topic::BookTicker),
            "depthUpdate" => Some(Topic::Depth),
            "aggTrade" => Some(Topic::AggTrade),
            "trade" => Some(Topic::Trade),
            "kline" => Some(Topic::Kline),
            "24hrTicker" => Some(Topic::Ticker),
            _ => None,
        }
    }
}

/// Parsed, canonical stream key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamKey {
    symbol: String,
    topic: Topic,
    param: Option<String>,
}

impl StreamKey {
    /// Build a key; the symbol is trimmed and lowercased.
    pub fn new(symbol: &str, topic: Topic) -> Self {
        Self {
            symbol: symbol.trim().to_lowercase(),
            topic,
            param: None,
        }
    }

    /// Build a parameterized key, e.g. `kline` with an interval.
    pub fn with_param(symbol: &str, topic: Topic, param: &str) -> Self {
        Self {
            symbol: symbol.trim().to_lowercase(),
            topic,
            param: Some(param.to_string()),
        }
    }

    /// Lowercase symbol as used in stream keys.
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Uppercase symbol as used in REST query strings.
    pub fn rest_symbol(&self) -> String {
        self.symbol.to_uppercase()
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }

    pub fn param(&self) -> Option<&str> {
        self.param.as_deref()
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.param {
            Some(param) => write!(f, "{}@{}_{}", self.symbol, self.topic.as_str(), param),
            None => write!(f, "{}@{}", self.symbol, self.topic.as_str()),
        }
    }
}

impl FromStr for StreamKey {
    type Err = MarketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (symbol, rest) = s
            .split_once('@')
            .ok_or_else(|| MarketError::validation(format!("malformed stream key: {s}")))?;
        if symbol.is_empty() {
            return Err(MarketError::validation(format!(
                "stream key missing symbol: {s}"
            )));
        }
        let (topic_str, param) = match rest.split_once('_') {
            Some((topic, param)) => (topic, Some(param.to_string())),
            None => (rest, None),
        };
        let topic = Topic::parse(topic_str)
            .ok_or_else(|| MarketError::validation(format!("unknown stream topic: {topic_str}")))?;
        Ok(Self {
            symbol: symbol.to_lowercase(),
            topic,
            param,
        })
    }
}
