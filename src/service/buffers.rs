//! Rolling buffers for trade and kline subscriptions.
//!
//! Subscribers receive a snapshot copy on every delivery; the buffers
//! themselves are owned by the subscription and never shared out.

use std::collections::VecDeque;

use crate::data::records::{Kline, TradeRecord};

/// Bounded trade buffer, newest first.
#[derive(Debug)]
pub struct TradeRing {
    capacity: usize,
    items: VecDeque<TradeRecord>,
}

impl TradeRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            items: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    /// Insert one trade as the newest entry, dropping the oldest past
    /// capacity.
    pub fn push(&mut self, trade: TradeRecord) {
        self.items.push_front(trade);
        self.items.truncate(self.capacity);
    }

    /// Insert a batch in the order received (oldest first, as REST
    /// returns them), so the last element ends up newest.
    pub fn extend(&mut self, trades: impl IntoIterator<Item = TradeRecord>) {
        for trade in trades {
            self.push(trade);
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Snapshot copy, newest first.
    pub fn snapshot(&self) -> Vec<TradeRecord> {
        self.items.iter().cloned().collect()
    }
}

/// Kline buffer keyed by `open_time`, kept sorted ascending.
///
/// An incoming kline with an existing `open_time` replaces that candle in
/// place; a new `open_time` is inserted in order. Past capacity the oldest
/// candle is dropped.
#[derive(Debug)]
pub struct KlineBuffer {
    capacity: usize,
    items: Vec<Kline>,
}

impl KlineBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            items: Vec::new(),
        }
    }

    pub fn upsert(&mut self, kline: Kline) {
        match self
            .items
            .binary_search_by_key(&kline.open_time, |k| k.open_time)
        {
            Ok(index) => self.items[index] = kline,
            Err(index) => {
                self.items.insert(index, kline);
                if self.items.len() > self.capacity {
                    self.items.remove(0);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Snapshot copy, ascending by `open_time`.
    pub fn snapshot(&self) -> Vec<Kline> {
        self.items.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn trade(id: u64, time: i64) -> TradeRecord {
        TradeRecord {
            id,
            price: dec!(100),
            quantity: dec!(1),
            time,
            is_buyer_maker: false,
        }
    }

    fn kline(open_time: i64, close: rust_decimal::Decimal) -> Kline {
        Kline {
            open_time,
            open: dec!(1),
            high: dec!(2),
            low: dec!(1),
            close,
            volume: dec!(10),
            close_time: open_time + 59_999,
            quote_volume: dec!(10),
            trades: 5,
            taker_buy_base_volume: dec!(5),
            taker_buy_quote_volume: dec!(5),
        }
    }

    #[test]
    fn test_trade_ring_newest_first() {
        let mut ring = TradeRing::new(3);
        ring.push(trade(1, 100));
        ring.push(trade(2, 200));
        ring.push(trade(3, 300));
        let snapshot = ring.snapshot();
        assert_eq!(
            snapshot.iter().map(|t| t.id).collect::<Vec<_>>(),
            vec![3, 2, 1]
        );
    }

    #[test]
    fn test_trade_ring_drops_oldest_past_capacity() {
        let mut ring = TradeRing::new(2);
        ring.extend([trade(1, 100), trade(2, 200), trade(3, 300)]);
        let snapshot = ring.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].id, 3);
        assert_eq!(snapshot[1].id, 2);
    }

    #[test]
    fn test_kline_buffer_appends_sorted() {
        let mut buffer = KlineBuffer::new(10);
        buffer.upsert(kline(60_000, dec!(2)));
        buffer.upsert(kline(0, dec!(1)));
        buffer.upsert(kline(120_000, dec!(3)));
        let snapshot = buffer.snapshot();
        assert_eq!(
            snapshot.iter().map(|k| k.open_time).collect::<Vec<_>>(),
            vec![0, 60_000, 120_000]
        );
    }

    #[test]
    fn test_kline_buffer_replaces_same_open_time() {
        let mut buffer = KlineBuffer::new(10);
        buffer.upsert(kline(60_000, dec!(2)));
        buffer.upsert(kline(60_000, dec!(9)));
        let snapshot = buffer.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].close, dec!(9));
    }

    #[test]
    fn test_kline_buffer_bounded() {
        let mut buffer = KlineBuffer::new(2);
        buffer.upsert(kline(0, dec!(1)));
        buffer.upsert(kline(60_000, dec!(2)));
        buffer.upsert(kline(120_000, dec!(3)));
        let snapshot = buffer.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].open_time, 60_000);
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let mut ring = TradeRing::new(3);
        ring.push(trade(1, 100));
        let snapshot = ring.snapshot();
        ring.push(trade(2, 200));
        assert_eq!(snapshot.len(), 1);
    }
}
