//! Shared order-book reconstruction, used by every
//! delta-family adapter (Binance, Binance-US, Bybit, Kucoin, OKX `update`).
//!
//! Bids and asks are kept as `BTreeMap<OrderedPrice, String>` so insertion,
//! deletion and descending/ascending iteration are all `O(log n)`; the
//! price is parsed to `f64` only as the sort/identity key, the size stays
//! untouched as the venue's original decimal string.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::record::{Level, OrderBookEventType, OrderBookSnapshot, now_timestamp_and_datetime};

/// A price wrapper giving `BTreeMap` a total order over decimal strings:
/// the comparator is numeric on the parsed price, never a string compare.
#[derive(Debug, Clone, PartialEq)]
struct OrderedPrice(f64, String);

impl Eq for OrderedPrice {}

impl PartialOrd for OrderedPrice {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedPrice {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.partial_cmp(&other.0).unwrap_or(Ordering::Equal)
    }
}

/// Mutable reconstruction state for one order-book stream. Bids are kept in
/// a map ordered ascending by price and reversed on read (so insert/remove
/// share the same comparator as asks); asks read back ascending directly.
#[derive(Debug, Default)]
pub struct OrderBook {
    bids: BTreeMap<OrderedPrice, String>,
    asks: BTreeMap<OrderedPrice, String>,
    pub last_update_id: i64,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole book from a REST snapshot.
    pub fn load_snapshot(&mut self, last_update_id: i64, bids: &[Level], asks: &[Level]) {
        self.bids.clear();
        self.asks.clear();
        for [price, size] in bids {
            if let Ok(p) = price.parse::<f64>() {
                self.bids.insert(OrderedPrice(p, price.clone()), size.clone());
            }
        }
        for [price, size] in asks {
            if let Ok(p) = price.parse::<f64>() {
                self.asks.insert(OrderedPrice(p, price.clone()), size.clone());
            }
        }
        self.last_update_id = last_update_id;
    }

    /// Applies one delta's bid/ask levels: `size == 0` deletes the price,
    /// otherwise the size is set.
    /// Does not touch `last_update_id`; callers update it per their venue's
    /// field (`u`, `seqId`, ...) after deciding snapshot vs update framing.
    pub fn apply_levels(&mut self, bids: &[Level], asks: &[Level]) {
        Self::apply_side(&mut self.bids, bids);
        Self::apply_side(&mut self.asks, asks);
    }

    fn apply_side(side: &mut BTreeMap<OrderedPrice, String>, levels: &[Level]) {
        for [price, size] in levels {
            let is_zero = size.parse::<f64>().map(|v| v == 0.0).unwrap_or(false);
            let Ok(p) = price.parse::<f64>() else { continue };
            let key = OrderedPrice(p, price.clone());
            if is_zero {
                side.remove(&key);
            } else {
                side.insert(key, size.clone());
            }
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.last_update_id != 0 || !self.bids.is_empty() || !self.asks.is_empty()
    }

    /// Bids strictly descending, asks strictly ascending, both truncated to
    /// `result_max_len`.
    pub fn to_canonical(
        &self,
        endpoint: crate::record::Endpoint,
        exchange: &str,
        symbol: &str,
        diff_update_id: i64,
        kind: OrderBookEventType,
        result_max_len: usize,
    ) -> OrderBookSnapshot {
        let bids: Vec<Level> = self
            .bids
            .iter()
            .rev()
            .take(result_max_len)
            .map(|(k, v)| [k.1.clone(), v.clone()])
            .collect();
        let asks: Vec<Level> = self
            .asks
            .iter()
            .take(result_max_len)
            .map(|(k, v)| [k.1.clone(), v.clone()])
            .collect();

        let (timestamp, datetime) = now_timestamp_and_datetime();

        OrderBookSnapshot {
            endpoint,
            exchange: exchange.to_string(),
            symbol: symbol.to_string(),
            last_update_id: self.last_update_id,
            diff_update_id,
            bids,
            asks,
            kind,
            timestamp,
            datetime,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Endpoint;

    fn lvl(price: &str, size: &str) -> Level {
        [price.to_string(), size.to_string()]
    }

    #[test]
    fn gap_then_delta_removes_zero_size_level_and_adds_new_ask() {
        let mut book = OrderBook::new();
        book.load_snapshot(100, &[lvl("30000", "1")], &[lvl("30001", "1")]);

        // delta {U:101, u:102, b:[["30000","0"]], a:[["30002","2"]]}
        book.apply_levels(&[lvl("30000", "0")], &[lvl("30002", "2")]);
        book.last_update_id = 102;

        let canon = book.to_canonical(Endpoint::OrderBook, "binance", "BTC/USDT", 1, OrderBookEventType::Update, 5);
        assert!(canon.bids.is_empty());
        assert_eq!(canon.asks, vec![lvl("30001", "1"), lvl("30002", "2")]);
        assert_eq!(canon.last_update_id, 102);
        assert_eq!(canon.diff_update_id, 1);
        assert!(matches!(canon.kind, OrderBookEventType::Update));
    }

    #[test]
    fn bids_descending_asks_ascending() {
        let mut book = OrderBook::new();
        book.load_snapshot(
            1,
            &[lvl("100", "1"), lvl("102", "1"), lvl("101", "1")],
            &[lvl("105", "1"), lvl("103", "1"), lvl("104", "1")],
        );
        let canon = book.to_canonical(Endpoint::OrderBook, "x", "BTC/USDT", 0, OrderBookEventType::Snapshot, 10);
        let bid_prices: Vec<f64> = canon.bids.iter().map(|l| l[0].parse().unwrap()).collect();
        let ask_prices: Vec<f64> = canon.asks.iter().map(|l| l[0].parse().unwrap()).collect();
        assert_eq!(bid_prices, vec![102.0, 101.0, 100.0]);
        assert_eq!(ask_prices, vec![103.0, 104.0, 105.0]);
    }

    #[test]
    fn zero_size_deletes_and_never_retains_as_zero() {
        let mut book = OrderBook::new();
        book.load_snapshot(1, &[lvl("100", "1")], &[]);
        book.apply_levels(&[lvl("100", "0")], &[]);
        assert!(book.bids.is_empty());
    }

    #[test]
    fn empty_book_after_application_is_still_emitted() {
        let mut book = OrderBook::new();
        book.load_snapshot(1, &[lvl("100", "1")], &[lvl("101", "1")]);
        book.apply_levels(&[lvl("100", "0")], &[lvl("101", "0")]);
        let canon = book.to_canonical(Endpoint::OrderBook, "x", "BTC/USDT", 0, OrderBookEventType::Update, 5);
        assert!(canon.bids.is_empty() && canon.asks.is_empty());
    }

    #[test]
    fn result_max_len_truncation_is_a_prefix_of_retained_state() {
        let mut book = OrderBook::new();
        book.load_snapshot(
            1,
            &[lvl("100", "1"), lvl("99", "1"), lvl("98", "1")],
            &[],
        );
        let full = book.to_canonical(Endpoint::OrderBook, "x", "s", 0, OrderBookEventType::Snapshot, 10);
        let truncated = book.to_canonical(Endpoint::OrderBook, "x", "s", 0, OrderBookEventType::Snapshot, 2);
        assert_eq!(&truncated.bids[..], &full.bids[..2]);
    }
}
