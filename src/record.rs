//! Canonical data model shared by every venue adapter.
//!
//! Prices and sizes stay as decimal strings end to end; they are parsed to
//! `f64` only transiently for zero-checks and sort comparisons, never stored
//! as floats (see `orderbook::price_key`).

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One of the four market-data domains a stream can belong to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endpoint {
    OrderBook,
    Kline,
    Trades,
    Ticker,
}

impl Endpoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Endpoint::OrderBook => "order_book",
            Endpoint::Kline => "kline",
            Endpoint::Trades => "trades",
            Endpoint::Ticker => "ticker",
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical kline interval. Venue adapters translate to/from their own
/// wire representation (`Adapter::canonicalize_interval` and its inverse).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Interval {
    OneMinute,
    ThreeMinutes,
    FiveMinutes,
    FifteenMinutes,
    ThirtyMinutes,
    OneHour,
    TwoHours,
    FourHours,
    SixHours,
    EightHours,
    TwelveHours,
    OneDay,
    ThreeDays,
    OneWeek,
    OneMonth,
}

impl Interval {
    /// The canonical wire token used in stream keys, e.g. `"1m"`, `"1h"`, `"1mo"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::OneMinute => "1m",
            Interval::ThreeMinutes => "3m",
            Interval::FiveMinutes => "5m",
            Interval::FifteenMinutes => "15m",
            Interval::ThirtyMinutes => "30m",
            Interval::OneHour => "1h",
            Interval::TwoHours => "2h",
            Interval::FourHours => "4h",
            Interval::SixHours => "6h",
            Interval::EightHours => "8h",
            Interval::TwelveHours => "12h",
            Interval::OneDay => "1d",
            Interval::ThreeDays => "3d",
            Interval::OneWeek => "1w",
            Interval::OneMonth => "1mo",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "1m" => Interval::OneMinute,
            "3m" => Interval::ThreeMinutes,
            "5m" => Interval::FiveMinutes,
            "15m" => Interval::FifteenMinutes,
            "30m" => Interval::ThirtyMinutes,
            "1h" => Interval::OneHour,
            "2h" => Interval::TwoHours,
            "4h" => Interval::FourHours,
            "6h" => Interval::SixHours,
            "8h" => Interval::EightHours,
            "12h" => Interval::TwelveHours,
            "1d" => Interval::OneDay,
            "3d" => Interval::ThreeDays,
            "1w" => Interval::OneWeek,
            "1mo" => Interval::OneMonth,
            _ => return None,
        })
    }

    /// Wall-clock length of one bar, used to derive kline staleness bounds.
    /// A month is approximated as 30 days.
    pub fn duration(&self) -> std::time::Duration {
        let secs = match self {
            Interval::OneMinute => 60,
            Interval::ThreeMinutes => 3 * 60,
            Interval::FiveMinutes => 5 * 60,
            Interval::FifteenMinutes => 15 * 60,
            Interval::ThirtyMinutes => 30 * 60,
            Interval::OneHour => 60 * 60,
            Interval::TwoHours => 2 * 60 * 60,
            Interval::FourHours => 4 * 60 * 60,
            Interval::SixHours => 6 * 60 * 60,
            Interval::EightHours => 8 * 60 * 60,
            Interval::TwelveHours => 12 * 60 * 60,
            Interval::OneDay => 24 * 60 * 60,
            Interval::ThreeDays => 3 * 24 * 60 * 60,
            Interval::OneWeek => 7 * 24 * 60 * 60,
            Interval::OneMonth => 30 * 24 * 60 * 60,
        };
        std::time::Duration::from_secs(secs)
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A logical subscription: `(endpoint, symbol, interval?)`.
///
/// `symbol` is always canonical `"BASE/QUOTE"` uppercase. `interval` is only
/// meaningful for `Endpoint::Kline`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub endpoint: Endpoint,
    pub symbol: String,
    pub interval: Option<Interval>,
}

impl StreamDescriptor {
    pub fn new(endpoint: Endpoint, symbol: impl Into<String>) -> Self {
        Self {
            endpoint,
            symbol: symbol.into(),
            interval: None,
        }
    }

    pub fn with_interval(mut self, interval: Interval) -> Self {
        self.interval = Some(interval);
        self
    }

    /// Deterministic key `"stream_<endpoint>_<symbolnoslashlower>_<intervalOrNone>"`.
    pub fn stream_key(&self) -> String {
        stream_key(self.endpoint, &self.symbol, self.interval)
    }
}

/// Canonical key function shared by every adapter (`Adapter::stream_key`).
pub fn stream_key(endpoint: Endpoint, symbol: &str, interval: Option<Interval>) -> String {
    let symbol_part = symbol.replace('/', "").to_lowercase();
    let interval_part = interval.map(|i| i.as_str().to_string()).unwrap_or_else(|| "none".to_string());
    format!("stream_{}_{}_{}", endpoint.as_str(), symbol_part, interval_part)
}

/// A single `[price, size]` level, both kept as the venue's original decimal
/// string so no precision is lost.
pub type Level = [String; 2];

/// `type` discriminant for `OrderBookSnapshot`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderBookEventType {
    Snapshot,
    Update,
}

/// Order-book canonical record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub endpoint: Endpoint,
    pub exchange: String,
    pub symbol: String,
    pub last_update_id: i64,
    pub diff_update_id: i64,
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
    #[serde(rename = "type")]
    pub kind: OrderBookEventType,
    pub timestamp: f64,
    pub datetime: String,
}

/// Kline canonical record. Field names, including the `hight`
/// typo, are kept verbatim from the source schema the consumer depends on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KlineBar {
    pub endpoint: Endpoint,
    pub exchange: String,
    pub symbol: String,
    pub interval: Interval,
    pub last_update_id: i64,
    pub open_time: i64,
    pub close_time: i64,
    pub open_time_date: String,
    pub close_time_date: String,
    pub open: String,
    pub close: String,
    pub hight: String,
    pub low: String,
    pub volume: String,
    pub is_closed: bool,
    /// OKX's opaque per-interval confirm flag, carried through without
    /// recomputation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_confirmed: Option<bool>,
}

/// Side of the trade's liquidity taker.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TakerSide {
    Buy,
    Sell,
}

/// Trade canonical record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub endpoint: Endpoint,
    pub exchange: String,
    pub symbol: String,
    pub event_time: i64,
    pub trade_id: String,
    pub price: String,
    pub quantity: String,
    pub trade_time: i64,
    pub trade_time_date: String,
    pub side_of_taker: TakerSide,
}

/// 24-hour ticker canonical record. Field names mirror the
/// Binance `24hrTicker` payload normalized across venues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub endpoint: Endpoint,
    pub exchange: String,
    pub symbol: String,
    pub event_time: i64,
    pub price_change: String,
    pub price_change_percent: String,
    pub weighted_average_price: String,
    pub last_price: String,
    pub last_quantity: String,
    pub best_bid_price: String,
    pub best_bid_quantity: String,
    pub best_ask_price: String,
    pub best_ask_quantity: String,
    pub open_price: String,
    pub high_price: String,
    pub low_price: String,
    pub total_traded_base_asset_volume: String,
    pub total_traded_quote_asset_volume: String,
    pub statistics_open_time: i64,
    pub statistics_close_time: i64,
    pub total_number_of_trades: i64,
}

/// The value held in the snapshot store for one stream key. Kline and trade
/// streams store the whole retained list so a reader gets an ordered,
/// already-truncated view without touching adapter-internal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CanonicalRecord {
    OrderBook(OrderBookSnapshot),
    Klines(Vec<KlineBar>),
    Trades(Vec<Trade>),
    Ticker(Ticker),
}

pub(crate) fn now_timestamp_and_datetime() -> (f64, String) {
    let now: DateTime<Utc> = Utc::now();
    let timestamp = now.timestamp() as f64 + (now.timestamp_subsec_micros() as f64) / 1_000_000.0;
    let datetime = now.format("%Y-%m-%d %H:%M:%S%.6f").to_string();
    (timestamp, datetime)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_key_is_deterministic_and_distinguishes_descriptors() {
        let a = StreamDescriptor::new(Endpoint::OrderBook, "BTC/USDT");
        let b = StreamDescriptor::new(Endpoint::Trades, "BTC/USDT");
        let c = StreamDescriptor::new(Endpoint::Kline, "BTC/USDT").with_interval(Interval::OneMinute);
        let d = StreamDescriptor::new(Endpoint::Kline, "BTC/USDT").with_interval(Interval::FiveMinutes);

        assert_eq!(a.stream_key(), "stream_order_book_btcusdt_none");
        assert_eq!(b.stream_key(), "stream_trades_btcusdt_none");
        assert_ne!(a.stream_key(), b.stream_key());
        assert_ne!(c.stream_key(), d.stream_key());
        assert_eq!(a.stream_key(), a.stream_key());
    }

    #[test]
    fn interval_round_trips_through_canonical_string() {
        for interval in [
            Interval::OneMinute,
            Interval::ThreeMinutes,
            Interval::FiveMinutes,
            Interval::FifteenMinutes,
            Interval::ThirtyMinutes,
            Interval::OneHour,
            Interval::TwoHours,
            Interval::FourHours,
            Interval::SixHours,
            Interval::EightHours,
            Interval::TwelveHours,
            Interval::OneDay,
            Interval::ThreeDays,
            Interval::OneWeek,
            Interval::OneMonth,
        ] {
            assert_eq!(Interval::from_str(interval.as_str()), Some(interval));
        }
    }
}
