//! The snapshot store: stream-key -> latest canonical record.
//!
//! Backed by [`dashmap::DashMap`], which shards its internal locking so
//! different stream keys never contend and a reader can never observe a
//! torn write — the write to the relevant canonical record types
//! (`Vec<KlineBar>`, `Vec<Trade>`, ...) swaps the whole value atomically
//! under the shard lock rather than mutating it in place.

use std::time::Instant;

use dashmap::DashMap;

use crate::record::CanonicalRecord;

/// Concurrent single-writer-per-key / many-reader cache of the latest
/// canonical record for each registered stream key.
#[derive(Default)]
pub struct SnapshotStore {
    inner: DashMap<String, CanonicalRecord>,
    last_seen: DashMap<String, Instant>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A declared key with no record yet and an undeclared key both read as
    /// `None`; declaration exists so the facade can enumerate the stream
    /// keys it owns (for `is_connections_ok`) without the store itself
    /// needing to hold a value. No map entry is created until the adapter
    /// decodes the first matching message.
    pub fn declare(&self, _stream_key: &str) {}

    pub fn get(&self, stream_key: &str) -> Option<CanonicalRecord> {
        self.inner.get(stream_key).map(|entry| entry.value().clone())
    }

    pub fn set(&self, stream_key: String, record: CanonicalRecord) {
        self.last_seen.insert(stream_key.clone(), Instant::now());
        self.inner.insert(stream_key, record);
    }

    /// Wall-clock time of the most recent write for this stream key, used
    /// by `Facade::is_connections_ok`.
    pub fn last_seen(&self, stream_key: &str) -> Option<Instant> {
        self.last_seen.get(stream_key).map(|entry| *entry.value())
    }

    pub fn clear(&self) {
        self.inner.clear();
        self.last_seen.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Endpoint, Ticker};

    fn sample_ticker() -> CanonicalRecord {
        CanonicalRecord::Ticker(Ticker {
            endpoint: Endpoint::Ticker,
            exchange: "binance".into(),
            symbol: "BTC/USDT".into(),
            event_time: 0,
            price_change: "0".into(),
            price_change_percent: "0".into(),
            weighted_average_price: "0".into(),
            last_price: "0".into(),
            last_quantity: "0".into(),
            best_bid_price: "0".into(),
            best_bid_quantity: "0".into(),
            best_ask_price: "0".into(),
            best_ask_quantity: "0".into(),
            open_price: "0".into(),
            high_price: "0".into(),
            low_price: "0".into(),
            total_traded_base_asset_volume: "0".into(),
            total_traded_quote_asset_volume: "0".into(),
            statistics_open_time: 0,
            statistics_close_time: 0,
            total_number_of_trades: 0,
        })
    }

    #[test]
    fn missing_key_and_absent_value_are_distinguishable() {
        let store = SnapshotStore::new();
        assert!(store.get("stream_ticker_btcusdt_none").is_none());

        store.set("stream_ticker_btcusdt_none".into(), sample_ticker());
        assert!(store.get("stream_ticker_btcusdt_none").is_some());
    }

    #[test]
    fn reads_never_observe_a_partially_written_record() {
        let store = SnapshotStore::new();
        store.set("k".into(), sample_ticker());
        let read = store.get("k").unwrap();
        match read {
            CanonicalRecord::Ticker(t) => assert_eq!(t.symbol, "BTC/USDT"),
            _ => panic!("unexpected record variant"),
        }
    }
}
