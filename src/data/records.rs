//! Canonical market data records.
//!
//! Every wire frame, REST or push, decodes into one of these types before
//! it reaches a cache or a subscriber. Prices and quantities use
//! `rust_decimal::Decimal` to preserve exchange precision.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Best bid/ask snapshot for a symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTick {
    /// Uppercase trading pair symbol.
    pub symbol: String,
    pub bid: Decimal,
    pub bid_qty: Decimal,
    pub ask: Decimal,
    pub ask_qty: Decimal,
    /// Exchange event time, milliseconds since the Unix epoch (0 when the
    /// REST form does not carry one).
    pub event_time: i64,
}

impl PriceTick {
    pub fn mid_price(&self) -> Decimal {
        (self.bid + self.ask) / Decimal::TWO
    }
}

/// One price level of an order book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

/// Order book snapshot.
///
/// Bids sorted descending, asks ascending, so index 0 is the top of book
/// on both sides. Levels with non-positive price or quantity never make it
/// into this type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBook {
    pub symbol: String,
    pub last_update_id: i64,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    pub event_time: i64,
}

impl OrderBook {
    pub fn best_bid(&self) -> Option<&BookLevel> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&BookLevel> {
        self.asks.first()
    }

    pub fn mid_price(&self) -> Option<Decimal> {
        let bid = self.best_bid()?.price;
        let ask = self.best_ask()?.price;
        Some((bid + ask) / Decimal::TWO)
    }

    pub fn spread(&self) -> Option<Decimal> {
        let bid = self.best_bid()?.price;
        let ask = self.best_ask()?.price;
        Some(ask - bid)
    }
}

/// A single executed trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: u64,
    pub price: Decimal,
    pub quantity: Decimal,
    /// Trade time, milliseconds since the Unix epoch.
    pub time: i64,
    /// True when the buyer was the passive side.
    pub is_buyer_maker: bool,
}

/// One candlestick. `open_time` is the identity of the candle: a later
/// frame with the same `open_time` supersedes this one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    pub open_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub close_time: i64,
    pub quote_volume: Decimal,
    pub trades: u64,
    pub taker_buy_base_volume: Decimal,
    pub taker_buy_quote_volume: Decimal,
}

/// 24-hour rolling window statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker24h {
    pub symbol: String,
    pub price_change: Decimal,
    pub price_change_percent: Decimal,
    pub weighted_avg_price: Decimal,
    pub last_price: Decimal,
    pub open_price: Decimal,
    pub high_price: Decimal,
    pub low_price: Decimal,
    pub volume: Decimal,
    pub quote_volume: Decimal,
    pub open_time: i64,
    pub close_time: i64,
    pub count: u64,
}

/// Closed set of payloads a subscriber callback can receive.
///
/// Single-record variants come straight from the decoder; the history and
/// series variants are buffer snapshots assembled by the service for trade
/// and kline subscriptions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MarketRecord {
    PriceTick(PriceTick),
    OrderBook(OrderBook),
    Trade(TradeRecord),
    /// Rolling trade buffer snapshot, newest first.
    TradeHistory(Vec<TradeRecord>),
    Kline(Kline),
    /// Kline buffer snapshot, sorted ascending by `open_time`.
    KlineSeries(Vec<Kline>),
    Ticker24h(Ticker24h),
}

impl MarketRecord {
    /// Short tag for logging and cache keys.
    pub fn kind(&self) -> &'static str {
        match self {
            MarketRecord::PriceTick(_) => "priceTick",
            MarketRecord::OrderBook(_) => "orderBook",
            MarketRecord::Trade(_) => "trade",
            MarketRecord::TradeHistory(_) => "tradeHistory",
            MarketRecord::Kline(_) => "kline",
            MarketRecord::KlineSeries(_) => "klineSeries",
            MarketRecord::Ticker24h(_) => "ticker24h",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn level(price: Decimal, quantity: Decimal) -> BookLevel {
        BookLevel { price, quantity }
    }

    #[test]
    fn test_order_book_top_of_book() {
        let book = OrderBook {
            symbol: "BTCUSDT".into(),
            last_update_id: 42,
            bids: vec![level(dec!(100), dec!(1)), level(dec!(99), dec!(2))],
            asks: vec![level(dec!(101), dec!(1)), level(dec!(102), dec!(3))],
            event_time: 0,
        };
        assert_eq!(book.best_bid().unwrap().price, dec!(100));
        assert_eq!(book.best_ask().unwrap().price, dec!(101));
        assert_eq!(book.mid_price().unwrap(), dec!(100.5));
        assert_eq!(book.spread().unwrap(), dec!(1));
    }

    #[test]
    fn test_empty_book_has_no_top() {
        let book = OrderBook {
            symbol: "BTCUSDT".into(),
            last_update_id: 0,
            bids: vec![],
            asks: vec![],
            event_time: 0,
        };
        assert!(book.best_bid().is_none());
        assert!(book.mid_price().is_none());
        assert!(book.spread().is_none());
    }

    #[test]
    fn test_price_tick_mid() {
        let tick = PriceTick {
            symbol: "BTCUSDT".into(),
            bid: dec!(60000),
            bid_qty: dec!(1),
            ask: dec!(60001),
            ask_qty: dec!(1.2),
            event_time: 0,
        };
        assert_eq!(tick.mid_price(), dec!(60000.5));
    }
}
