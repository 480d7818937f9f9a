//! Kline accumulation and trade-FIFO retention,
//! factored out once so every venue adapter shares the same bounded-state
//! machine instead of re-deriving it per exchange.

use std::collections::{BTreeMap, HashSet, VecDeque};

use crate::record::{KlineBar, Trade};

/// Bars keyed by `open_time`, capped at `data_max_len` with oldest-evicted
/// overflow.
#[derive(Debug, Default)]
pub struct KlineAccumulator {
    bars: BTreeMap<i64, KlineBar>,
    data_max_len: usize,
}

impl KlineAccumulator {
    pub fn new(data_max_len: usize) -> Self {
        Self {
            bars: BTreeMap::new(),
            data_max_len: data_max_len.max(1),
        }
    }

    /// Inserts or overwrites the bar at its `open_time`, then evicts the
    /// smallest `open_time` while over capacity.
    pub fn upsert(&mut self, bar: KlineBar) {
        self.bars.insert(bar.open_time, bar);
        while self.bars.len() > self.data_max_len {
            if let Some(&oldest) = self.bars.keys().next() {
                self.bars.remove(&oldest);
            } else {
                break;
            }
        }
    }

    /// Values in ascending `open_time` order, truncated to `result_max_len`.
    pub fn query(&self, result_max_len: usize) -> Vec<KlineBar> {
        self.bars.values().take(result_max_len).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }
}

/// Bounded FIFO of trades, capacity `data_max_len`, oldest evicted on
/// overflow. `dedup` supports Bingx's REST-polled variant,
/// which deduplicates by `trade_id` before eviction.
#[derive(Debug, Default)]
pub struct TradeFifo {
    trades: VecDeque<Trade>,
    seen_ids: Option<HashSet<String>>,
    data_max_len: usize,
}

impl TradeFifo {
    pub fn new(data_max_len: usize) -> Self {
        Self {
            trades: VecDeque::new(),
            seen_ids: None,
            data_max_len: data_max_len.max(1),
        }
    }

    /// Enables `trade_id` deduplication (Bingx's REST-polled trades).
    pub fn with_dedup(mut self) -> Self {
        self.seen_ids = Some(HashSet::new());
        self
    }

    pub fn push(&mut self, trade: Trade) {
        if let Some(seen) = &mut self.seen_ids {
            if !seen.insert(trade.trade_id.clone()) {
                return;
            }
        }

        if self.trades.len() >= self.data_max_len {
            if let Some(evicted) = self.trades.pop_front() {
                if let Some(seen) = &mut self.seen_ids {
                    seen.remove(&evicted.trade_id);
                }
            }
        }
        self.trades.push_back(trade);
    }

    pub fn len(&self) -> usize {
        self.trades.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trades.is_empty()
    }

    /// Most recent `result_max_len` entries, oldest first (FIFO/chronological
    /// order).
    pub fn query(&self, result_max_len: usize) -> Vec<Trade> {
        let skip = self.trades.len().saturating_sub(result_max_len);
        self.trades.iter().skip(skip).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Endpoint, TakerSide};

    fn bar(open_time: i64) -> KlineBar {
        KlineBar {
            endpoint: Endpoint::Kline,
            exchange: "x".into(),
            symbol: "BTC/USDT".into(),
            interval: crate::record::Interval::OneMinute,
            last_update_id: open_time,
            open_time,
            close_time: open_time + 59_999,
            open_time_date: String::new(),
            close_time_date: String::new(),
            open: "1".into(),
            close: "1".into(),
            hight: "1".into(),
            low: "1".into(),
            volume: "1".into(),
            is_closed: false,
            is_confirmed: None,
        }
    }

    fn trade(id: &str) -> Trade {
        Trade {
            endpoint: Endpoint::Trades,
            exchange: "x".into(),
            symbol: "BTC/USDT".into(),
            event_time: 0,
            trade_id: id.into(),
            price: "1".into(),
            quantity: "1".into(),
            trade_time: 0,
            trade_time_date: String::new(),
            side_of_taker: TakerSide::Buy,
        }
    }

    #[test]
    fn repeated_open_time_overwrites_instead_of_appending() {
        let mut acc = KlineAccumulator::new(10);
        acc.upsert(bar(1_700_000_000_000));
        acc.upsert(bar(1_700_000_060_000));

        let result = acc.query(10);
        assert_eq!(result.iter().map(|b| b.open_time).collect::<Vec<_>>(), vec![1_700_000_000_000, 1_700_000_060_000]);

        // Third frame reuses the first open_time: overwrites, does not append.
        acc.upsert(bar(1_700_000_000_000));
        assert_eq!(acc.len(), 2);
    }

    #[test]
    fn kline_open_time_strictly_increasing_and_evicts_oldest() {
        let mut acc = KlineAccumulator::new(2);
        acc.upsert(bar(1));
        acc.upsert(bar(2));
        acc.upsert(bar(3));
        let result = acc.query(10);
        assert_eq!(result.iter().map(|b| b.open_time).collect::<Vec<_>>(), vec![2, 3]);
        for w in result.windows(2) {
            assert!(w[0].open_time < w[1].open_time);
        }
    }

    #[test]
    fn query_returns_most_recent_entries_within_capacity() {
        let mut fifo = TradeFifo::new(3);
        fifo.push(trade("1"));
        fifo.push(trade("2"));
        fifo.push(trade("3"));
        fifo.push(trade("4"));

        assert_eq!(fifo.len(), 3);
        let result = fifo.query(2);
        assert_eq!(result.iter().map(|t| t.trade_id.clone()).collect::<Vec<_>>(), vec!["3", "4"]);
    }

    #[test]
    fn trade_fifo_never_exceeds_capacity() {
        let mut fifo = TradeFifo::new(5);
        for i in 0..100 {
            fifo.push(trade(&i.to_string()));
        }
        assert_eq!(fifo.len(), 5);
    }

    #[test]
    fn bingx_dedup_ignores_repeated_trade_ids() {
        let mut fifo = TradeFifo::new(5).with_dedup();
        fifo.push(trade("1"));
        fifo.push(trade("1"));
        fifo.push(trade("2"));
        assert_eq!(fifo.len(), 2);
    }
}
