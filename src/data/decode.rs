//! Wire payload decoding into canonical records.
//!
//! Pure functions, no I/O. Every canonical type accepts both the
//! array/object form returned by REST endpoints and the single-letter
//! object form pushed over WebSocket. A numeric field that fails to parse
//! rejects the whole record; it never degrades to zero. Order-book levels
//! with non-positive price or quantity are dropped individually.

use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;

use crate::data::key::{StreamKey, Topic};
use crate::data::records::{
    BookLevel, Kline, MarketRecord, OrderBook, PriceTick, Ticker24h, TradeRecord,
};
use crate::error::MarketError;

/// Accepted forward clock skew when validating trade times.
pub const CLOCK_SKEW_BOUND_MS: i64 = 5000;

fn parse_decimal(value: &Value, ctx: &str) -> Result<Decimal, MarketError> {
    match value {
        Value::String(s) => Decimal::from_str(s.trim())
            .map_err(|e| MarketError::validation(format!("{ctx}: bad decimal {s:?}: {e}"))),
        Value::Number(n) => Decimal::from_str(&n.to_string())
            .map_err(|e| MarketError::validation(format!("{ctx}: bad decimal {n}: {e}"))),
        other => Err(MarketError::validation(format!(
            "{ctx}: expected numeric, got {other}"
        ))),
    }
}

fn decimal_field(v: &Value, key: &str) -> Result<Decimal, MarketError> {
    let field = v
        .get(key)
        .ok_or_else(|| MarketError::validation(format!("missing field {key}")))?;
    parse_decimal(field, key)
}

fn i64_field(v: &Value, key: &str) -> Result<i64, MarketError> {
    v.get(key)
        .and_then(Value::as_i64)
        .ok_or_else(|| MarketError::validation(format!("missing integer field {key}")))
}

fn u64_field(v: &Value, key: &str) -> Result<u64, MarketError> {
    v.get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| MarketError::validation(format!("missing integer field {key}")))
}

fn bool_field(v: &Value, key: &str) -> Result<bool, MarketError> {
    v.get(key)
        .and_then(Value::as_bool)
        .ok_or_else(|| MarketError::validation(format!("missing boolean field {key}")))
}

fn str_field<'a>(v: &'a Value, key: &str) -> Result<&'a str, MarketError> {
    v.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| MarketError::validation(format!("missing string field {key}")))
}

/// Exchange event time of a push frame, when present.
pub fn event_time(v: &Value) -> Option<i64> {
    v.get("E").and_then(Value::as_i64)
}

/// Decode a best bid/ask tick.
///
/// Accepts the push form (`{e:"bookTicker", s, b, B, a, A}`) and the REST
/// form (`{symbol, bidPrice, bidQty, askPrice, askQty}`).
pub fn decode_price_tick(v: &Value) -> Result<PriceTick, MarketError> {
    if v.get("bidPrice").is_some() {
        Ok(PriceTick {
            symbol: str_field(v, "symbol")?.to_uppercase(),
            bid: decimal_field(v, "bidPrice")?,
            bid_qty: decimal_field(v, "bidQty")?,
            ask: decimal_field(v, "askPrice")?,
            ask_qty: decimal_field(v, "askQty")?,
            event_time: v
                .get("time")
                .and_then(Value::as_i64)
                .or_else(|| event_time(v))
                .unwrap_or(0),
        })
    } else {
        Ok(PriceTick {
            symbol: str_field(v, "s")?.to_uppercase(),
            bid: decimal_field(v, "b")?,
            bid_qty: decimal_field(v, "B")?,
            ask: decimal_field(v, "a")?,
            ask_qty: decimal_field(v, "A")?,
            event_time: event_time(v).unwrap_or(0),
        })
    }
}

/// Parse `[["price", "qty"], …]`, dropping non-positive levels.
///
/// A level that does not parse rejects the record; a level that parses to
/// a non-positive price or quantity is silently dropped.
fn decode_levels(v: &Value, ctx: &str) -> Result<Vec<BookLevel>, MarketError> {
    let rows = v
        .as_array()
        .ok_or_else(|| MarketError::validation(format!("{ctx}: expected level array")))?;
    let mut levels = Vec::with_capacity(rows.len());
    for row in rows {
        let pair = row
            .as_array()
            .filter(|p| p.len() >= 2)
            .ok_or_else(|| MarketError::validation(format!("{ctx}: malformed level {row}")))?;
        let price = parse_decimal(&pair[0], ctx)?;
        let quantity = parse_decimal(&pair[1], ctx)?;
        if price > Decimal::ZERO && quantity > Decimal::ZERO {
            levels.push(BookLevel { price, quantity });
        }
    }
    Ok(levels)
}

/// Decode an order book snapshot.
///
/// Accepts the REST form (`{lastUpdateId, bids, asks}`) and the push form
/// (`{e:"depthUpdate", s, u, b, a}`). `symbol_hint` supplies the symbol
/// for the REST form, which does not carry one.
pub fn decode_order_book(symbol_hint: &str, v: &Value) -> Result<OrderBook, MarketError> {
    let push = v.get("e").is_some();
    let (bids_key, asks_key) = if push { ("b", "a") } else { ("bids", "asks") };

    let mut bids = decode_levels(
        v.get(bids_key)
            .ok_or_else(|| MarketError::validation(format!("missing field {bids_key}")))?,
        "bids",
    )?;
    let mut asks = decode_levels(
        v.get(asks_key)
            .ok_or_else(|| MarketError::validation(format!("missing field {asks_key}")))?,
        "asks",
    )?;
    bids.sort_by(|x, y| y.price.cmp(&x.price));
    asks.sort_by(|x, y| x.price.cmp(&y.price));

    let symbol = v
        .get("s")
        .and_then(Value::as_str)
        .unwrap_or(symbol_hint)
        .to_uppercase();
    let last_update_id = if push {
        i64_field(v, "u")?
    } else {
        i64_field(v, "lastUpdateId")?
    };

    Ok(OrderBook {
        symbol,
        last_update_id,
        bids,
        asks,
        event_time: event_time(v).unwrap_or(0),
    })
}

/// Decode a trade.
///
/// Accepts the REST form (`{id, price, qty, time, isBuyerMaker}`) and the
/// push forms for `trade` (`{t, p, q, T, m}`) and `aggTrade`
/// (`{a, p, q, T, m}`). Rejects trades timestamped further than the clock
/// skew bound into the future, and non-positive prices or quantities.
pub fn decode_trade(v: &Value, now_ms: i64) -> Result<TradeRecord, MarketError> {
    let trade = if v.get("price").is_some() {
        TradeRecord {
            id: u64_field(v, "id")?,
            price: decimal_field(v, "price")?,
            quantity: decimal_field(v, "qty")?,
            time: i64_field(v, "time")?,
            is_buyer_maker: bool_field(v, "isBuyerMaker")?,
        }
    } else {
        let id = v
            .get("t")
            .or_else(|| v.get("a"))
            .and_then(Value::as_u64)
            .ok_or_else(|| MarketError::validation("trade missing id field"))?;
        TradeRecord {
            id,
            price: decimal_field(v, "p")?,
            quantity: decimal_field(v, "q")?,
            time: i64_field(v, "T")?,
            is_buyer_maker: bool_field(v, "m")?,
        }
    };

    if trade.price <= Decimal::ZERO || trade.quantity <= Decimal::ZERO {
        return Err(MarketError::validation(format!(
            "trade {} has non-positive price or quantity",
            trade.id
        )));
    }
    if trade.time > now_ms + CLOCK_SKEW_BOUND_MS {
        return Err(MarketError::validation(format!(
            "trade {} timestamped {}ms in the future",
            trade.id,
            trade.time - now_ms
        )));
    }
    Ok(trade)
}

/// Decode a candlestick.
///
/// Accepts the REST array row
/// `[openTime, open, high, low, close, volume, closeTime, quoteVolume,
/// trades, takerBuyBase, takerBuyQuote, …]` and the push form
/// (`{e:"kline", k:{t, o, h, l, c, v, T, q, n, V, Q}}`).
pub fn decode_kline(v: &Value) -> Result<Kline, MarketError> {
    let kline = if let Some(row) = v.as_array() {
        if row.len() < 11 {
            return Err(MarketError::validation(format!(
                "kline row has {} fields, expected 11",
                row.len()
            )));
        }
        Kline {
            open_time: row[0]
                .as_i64()
                .ok_or_else(|| MarketError::validation("kline open time not an integer"))?,
            open: parse_decimal(&row[1], "open")?,
            high: parse_decimal(&row[2], "high")?,
            low: parse_decimal(&row[3], "low")?,
            close: parse_decimal(&row[4], "close")?,
            volume: parse_decimal(&row[5], "volume")?,
            close_time: row[6]
                .as_i64()
                .ok_or_else(|| MarketError::validation("kline close time not an integer"))?,
            quote_volume: parse_decimal(&row[7], "quoteVolume")?,
            trades: row[8]
                .as_u64()
                .ok_or_else(|| MarketError::validation("kline trade count not an integer"))?,
            taker_buy_base_volume: parse_decimal(&row[9], "takerBuyBase")?,
            taker_buy_quote_volume: parse_decimal(&row[10], "takerBuyQuote")?,
        }
    } else {
        let k = v
            .get("k")
            .ok_or_else(|| MarketError::validation("kline event missing k object"))?;
        Kline {
            open_time: i64_field(k, "t")?,
            open: decimal_field(k, "o")?,
            high: decimal_field(k, "h")?,
            low: decimal_field(k, "l")?,
            close: decimal_field(k, "c")?,
            volume: decimal_field(k, "v")?,
            close_time: i64_field(k, "T")?,
            quote_volume: decimal_field(k, "q")?,
            trades: u64_field(k, "n")?,
            taker_buy_base_volume: decimal_field(k, "V")?,
            taker_buy_quote_volume: decimal_field(k, "Q")?,
        }
    };

    if kline.close_time < kline.open_time {
        return Err(MarketError::validation(format!(
            "kline close time {} precedes open time {}",
            kline.close_time, kline.open_time
        )));
    }
    Ok(kline)
}

/// Decode 24-hour ticker statistics.
///
/// Accepts the REST form (`{symbol, priceChange, …}`) and the push form
/// (`{e:"24hrTicker", s, p, P, w, c, o, h, l, v, q, O, C, n}`).
pub fn decode_ticker24h(v: &Value) -> Result<Ticker24h, MarketError> {
    let ticker = if v.get("priceChange").is_some() {
        Ticker24h {
            symbol: str_field(v, "symbol")?.to_uppercase(),
            price_change: decimal_field(v, "priceChange")?,
            price_change_percent: decimal_field(v, "priceChangePercent")?,
            weighted_avg_price: decimal_field(v, "weightedAvgPrice")?,
            last_price: decimal_field(v, "lastPrice")?,
            open_price: decimal_field(v, "openPrice")?,
            high_price: decimal_field(v, "highPrice")?,
            low_price: decimal_field(v, "lowPrice")?,
            volume: decimal_field(v, "volume")?,
            quote_volume: decimal_field(v, "quoteVolume")?,
            open_time: i64_field(v, "openTime")?,
            close_time: i64_field(v, "closeTime")?,
            count: u64_field(v, "count")?,
        }
    } else {
        Ticker24h {
            symbol: str_field(v, "s")?.to_uppercase(),
            price_change: decimal_field(v, "p")?,
            price_change_percent: decimal_field(v, "P")?,
            weighted_avg_price: decimal_field(v, "w")?,
            last_price: decimal_field(v, "c")?,
            open_price: decimal_field(v, "o")?,
            high_price: decimal_field(v, "h")?,
            low_price: decimal_field(v, "l")?,
            volume: decimal_field(v, "v")?,
            quote_volume: decimal_field(v, "q")?,
            open_time: i64_field(v, "O")?,
            close_time: i64_field(v, "C")?,
            count: u64_field(v, "n")?,
        }
    };

    if ticker.symbol.is_empty() {
        return Err(MarketError::validation("ticker has empty symbol"));
    }
    Ok(ticker)
}

/// Decode a push payload according to its stream key's topic.
///
/// The single place in the engine that branches on topic.
pub fn decode_stream_event(
    key: &StreamKey,
    payload: &Value,
    now_ms: i64,
) -> Result<MarketRecord, MarketError> {
    match key.topic() {
        Topic::BookTicker => decode_price_tick(payload).map(MarketRecord::PriceTick),
        Topic::Depth => {
            decode_order_book(&key.rest_symbol(), payload).map(MarketRecord::OrderBook)
        }
        Topic::Trade | Topic::AggTrade => {
            decode_trade(payload, now_ms).map(MarketRecord::Trade)
        }
        Topic::Kline => decode_kline(payload).map(MarketRecord::Kline),
        Topic::Ticker => decode_ticker24h(payload).map(MarketRecord::Ticker24h),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    const NOW: i64 = 1_700_000_000_000;

    #[test]
    fn test_price_tick_both_forms_agree() {
        let rest = json!({
            "symbol": "BTCUSDT",
            "bidPrice": "60000.00",
            "bidQty": "1.0",
            "askPrice": "60001.00",
            "askQty": "1.2",
            "time": 1_700_000_000_123i64
        });
        let push = json!({
            "e": "bookTicker",
            "E": 1_700_000_000_123i64,
            "s": "BTCUSDT",
            "b": "60000.00",
            "B": "1.0",
            "a": "60001.00",
            "A": "1.2"
        });
        let from_rest = decode_price_tick(&rest).unwrap();
        let from_push = decode_price_tick(&push).unwrap();
        assert_eq!(from_rest, from_push);
        assert_eq!(from_rest.bid, dec!(60000.00));
        assert_eq!(from_rest.ask_qty, dec!(1.2));
    }

    #[test]
    fn test_price_tick_rejects_unparsable_price() {
        let push = json!({
            "e": "bookTicker",
            "s": "BTCUSDT",
            "b": "not-a-number",
            "B": "1.0",
            "a": "60001.00",
            "A": "1.2"
        });
        assert!(matches!(
            decode_price_tick(&push),
            Err(MarketError::Validation { .. })
        ));
    }

    #[test]
    fn test_order_book_drops_bad_levels() {
        let push = json!({
            "e": "depthUpdate",
            "E": NOW,
            "s": "BTCUSDT",
            "u": 160,
            "b": [["0", "1"], ["100", "0"], ["99", "2"]],
            "a": [["101", "1"]]
        });
        let book = decode_order_book("BTCUSDT", &push).unwrap();
        assert_eq!(book.bids.len(), 1);
        assert_eq!(book.bids[0].price, dec!(99));
        assert_eq!(book.bids[0].quantity, dec!(2));
        assert_eq!(book.asks.len(), 1);
        assert_eq!(book.asks[0].price, dec!(101));
        assert_eq!(book.last_update_id, 160);
    }

    #[test]
    fn test_order_book_rest_form_sorted() {
        let rest = json!({
            "lastUpdateId": 1027024,
            "bids": [["99.0", "2"], ["100.0", "1"]],
            "asks": [["102.0", "3"], ["101.0", "1"]]
        });
        let book = decode_order_book("ethusdt", &rest).unwrap();
        assert_eq!(book.symbol, "ETHUSDT");
        assert_eq!(book.best_bid().unwrap().price, dec!(100.0));
        assert_eq!(book.best_ask().unwrap().price, dec!(101.0));
    }

    #[test]
    fn test_order_book_malformed_level_rejects_record() {
        let rest = json!({
            "lastUpdateId": 1,
            "bids": [["oops", "1"]],
            "asks": []
        });
        assert!(decode_order_book("BTCUSDT", &rest).is_err());
    }

    #[test]
    fn test_trade_both_forms_agree() {
        let rest = json!({
            "id": 28457,
            "price": "4.00000100",
            "qty": "12.00000000",
            "time": NOW - 1000,
            "isBuyerMaker": true
        });
        let push = json!({
            "e": "trade",
            "E": NOW,
            "s": "BTCUSDT",
            "t": 28457,
            "p": "4.00000100",
            "q": "12.00000000",
            "T": NOW - 1000,
            "m": true
        });
        assert_eq!(
            decode_trade(&rest, NOW).unwrap(),
            decode_trade(&push, NOW).unwrap()
        );
    }

    #[test]
    fn test_agg_trade_uses_aggregate_id() {
        let push = json!({
            "e": "aggTrade",
            "E": NOW,
            "s": "BTCUSDT",
            "a": 12345,
            "p": "16800.50",
            "q": "1.25",
            "T": NOW - 5,
            "m": false
        });
        let trade = decode_trade(&push, NOW).unwrap();
        assert_eq!(trade.id, 12345);
        assert!(!trade.is_buyer_maker);
    }

    #[test]
    fn test_trade_from_the_future_is_rejected() {
        let push = json!({
            "e": "trade",
            "s": "BTCUSDT",
            "t": 1,
            "p": "100",
            "q": "1",
            "T": NOW + CLOCK_SKEW_BOUND_MS + 1,
            "m": false
        });
        assert!(decode_trade(&push, NOW).is_err());
    }

    #[test]
    fn test_trade_non_positive_quantity_rejected() {
        let rest = json!({
            "id": 1,
            "price": "100",
            "qty": "0",
            "time": NOW,
            "isBuyerMaker": false
        });
        assert!(decode_trade(&rest, NOW).is_err());
    }

    #[test]
    fn test_kline_both_forms_agree() {
        let rest = json!([
            1_499_040_000_000i64,
            "0.01634790",
            "0.80000000",
            "0.01575800",
            "0.01577100",
            "148976.11427815",
            1_499_644_799_999i64,
            "2434.19055334",
            308,
            "1756.87402397",
            "28.46694368",
            "17928899.62484339"
        ]);
        let push = json!({
            "e": "kline",
            "E": NOW,
            "s": "ETHBTC",
            "k": {
                "t": 1_499_040_000_000i64,
                "T": 1_499_644_799_999i64,
                "s": "ETHBTC",
                "i": "1m",
                "o": "0.01634790",
                "h": "0.80000000",
                "l": "0.01575800",
                "c": "0.01577100",
                "v": "148976.11427815",
                "n": 308,
                "x": false,
                "q": "2434.19055334",
                "V": "1756.87402397",
                "Q": "28.46694368"
            }
        });
        assert_eq!(decode_kline(&rest).unwrap(), decode_kline(&push).unwrap());
    }

    #[test]
    fn test_kline_rejects_inverted_times() {
        let rest = json!([
            1_499_644_799_999i64,
            "1", "1", "1", "1", "1",
            1_499_040_000_000i64,
            "1", 0, "1", "1", "0"
        ]);
        assert!(decode_kline(&rest).is_err());
    }

    #[test]
    fn test_kline_rejects_missing_field() {
        let push = json!({"e": "kline", "k": {"t": 1, "T": 2, "o": "1"}});
        assert!(decode_kline(&push).is_err());
    }

    #[test]
    fn test_ticker_both_forms_agree() {
        let rest = json!({
            "symbol": "BTCUSDT",
            "priceChange": "-94.99999800",
            "priceChangePercent": "-95.960",
            "weightedAvgPrice": "0.29628482",
            "lastPrice": "4.00000200",
            "openPrice": "99.00000000",
            "highPrice": "100.00000000",
            "lowPrice": "0.10000000",
            "volume": "8913.30000000",
            "quoteVolume": "15.30000000",
            "openTime": 1_499_783_499_040i64,
            "closeTime": 1_499_869_899_040i64,
            "count": 76
        });
        let push = json!({
            "e": "24hrTicker",
            "E": NOW,
            "s": "BTCUSDT",
            "p": "-94.99999800",
            "P": "-95.960",
            "w": "0.29628482",
            "c": "4.00000200",
            "o": "99.00000000",
            "h": "100.00000000",
            "l": "0.10000000",
            "v": "8913.30000000",
            "q": "15.30000000",
            "O": 1_499_783_499_040i64,
            "C": 1_499_869_899_040i64,
            "n": 76
        });
        assert_eq!(
            decode_ticker24h(&rest).unwrap(),
            decode_ticker24h(&push).unwrap()
        );
    }

    #[test]
    fn test_stream_event_dispatches_on_topic() {
        let key: StreamKey = "btcusdt@bookTicker".parse().unwrap();
        let push = json!({
            "e": "bookTicker",
            "s": "BTCUSDT",
            "b": "60005.00",
            "B": "0.5",
            "a": "60006.00",
            "A": "0.3"
        });
        match decode_stream_event(&key, &push, NOW).unwrap() {
            MarketRecord::PriceTick(tick) => assert_eq!(tick.bid, dec!(60005.00)),
            other => panic!("unexpected record {other:?}"),
        }
    }
}
