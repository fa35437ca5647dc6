//! Canonical data model: stream keys, records, decoding, and the result
//! envelope.

pub mod decode;
pub mod envelope;
pub mod key;
pub mod records;

pub use envelope::{Envelope, Source};
pub use key::{StreamKey, Topic};
pub use records::{
    BookLevel, Kline, MarketRecord, OrderBook, PriceTick, Ticker24h, TradeRecord,
};
