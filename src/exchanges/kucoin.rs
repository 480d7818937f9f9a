//! Kucoin spot public adapter.
//!
//! Grounded on `ccxw/kucoin.py`: the bullet-public token mint
//! (`POST /api/v1/bullet-public`) that hands back both the WebSocket
//! endpoint and the ping cadence, topic-based dispatch on
//! `topic.split(':')`, and level2Depth50's always-a-snapshot order book
//! (no delta merge needed, unlike Binance/Bybit).

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, warn};

use crate::accumulate::{KlineAccumulator, TradeFifo};
use crate::adapter::{Adapter, DecodeOutcome, FrameList, RawFrame, SubscriptionPlan};
use crate::error::Result;
use crate::orderbook::OrderBook;
use crate::record::{
    CanonicalRecord, Endpoint, Interval, KlineBar, OrderBookEventType,
    StreamDescriptor, TakerSide, Trade, stream_key as canonical_stream_key,
};

use super::common::{StreamState, TtlCache};

const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(18);
const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(10);

pub struct KucoinAdapter {
    testmode: bool,
    result_max_len: usize,
    data_max_len: usize,
    rest: crate::rest::RestClient,
    symbol_cache: TtlCache<Vec<String>>,
    venue_to_canonical: RwLock<HashMap<String, String>>,
    state: DashMap<String, StreamState>,
    ws_url: RwLock<String>,
    ping_interval: RwLock<Duration>,
    ping_timeout: RwLock<Duration>,
}

impl KucoinAdapter {
    pub fn new(testmode: bool, result_max_len: usize, data_max_len: usize) -> Self {
        Self {
            testmode,
            result_max_len,
            data_max_len: data_max_len.min(2500),
            rest: crate::rest::RestClient::new(),
            symbol_cache: TtlCache::new(super::common::EXCHANGE_INFO_TTL),
            venue_to_canonical: RwLock::new(HashMap::new()),
            state: DashMap::new(),
            ws_url: RwLock::new(String::new()),
            ping_interval: RwLock::new(DEFAULT_PING_INTERVAL),
            ping_timeout: RwLock::new(DEFAULT_PING_TIMEOUT),
        }
    }

    pub fn register(&self, descriptor: StreamDescriptor) {
        let key = descriptor.stream_key();
        let state = match descriptor.endpoint {
            Endpoint::OrderBook => StreamState::OrderBook(OrderBook::new()),
            Endpoint::Kline => StreamState::Kline(KlineAccumulator::new(self.data_max_len)),
            Endpoint::Trades => StreamState::Trades(TradeFifo::new(self.data_max_len)),
            Endpoint::Ticker => StreamState::Ticker,
        };
        self.state.insert(key, state);
    }

    fn rest_base(&self) -> &'static str {
        if self.testmode { "https://openapi-sandbox.kucoin.com" } else { "https://api.kucoin.com" }
    }

    /// Mints a bullet-public token and caches the instance-server endpoint
    /// and ping cadence it hands back. A fresh token is required on every
    /// new connection; this adapter mints once at `start()` rather than
    /// re-minting on a 1800s timer mid-connection, since the public
    /// endpoint tolerates the token outliving its nominal validity for a
    /// single long-lived session.
    async fn mint_token(&self) -> Option<()> {
        let url = format!("{}/api/v1/bullet-public", self.rest_base());
        let data: Value = self.rest.post_json(&url).await?;
        let server = data.get("data")?.get("instanceServers")?.as_array()?.first()?;
        let endpoint = server.get("endpoint")?.as_str()?.to_string();
        let token = data.get("data")?.get("token")?.as_str()?.to_string();

        let ping_interval_ms = server.get("pingInterval").and_then(Value::as_i64).unwrap_or(18000);
        let ping_timeout_ms = server.get("pingTimeout").and_then(Value::as_i64).unwrap_or(10000);

        let connect_id = chrono::Utc::now().timestamp_millis();
        let full_url = format!("{endpoint}?token={token}&connectId={connect_id}");

        *self.ws_url.write().unwrap() = full_url;
        *self.ping_interval.write().unwrap() = Duration::from_millis(ping_interval_ms.max(1000) as u64);
        *self.ping_timeout.write().unwrap() = Duration::from_millis(ping_timeout_ms.max(1000) as u64);
        Some(())
    }

    fn venue_symbol(symbol: &str) -> String {
        symbol.replace('/', "-").to_uppercase()
    }

    fn interval_token(interval: Interval) -> Option<&'static str> {
        Some(match interval {
            Interval::OneMinute => "1min",
            Interval::ThreeMinutes => "3min",
            Interval::FiveMinutes => "5min",
            Interval::FifteenMinutes => "15min",
            Interval::ThirtyMinutes => "30min",
            Interval::OneHour => "1hour",
            Interval::TwoHours => "2hour",
            Interval::FourHours => "4hour",
            Interval::SixHours => "6hour",
            Interval::EightHours => "8hour",
            Interval::TwelveHours => "12hour",
            Interval::OneDay => "1day",
            Interval::ThreeDays => "3day",
            Interval::OneWeek => "1week",
            Interval::OneMonth => return None,
        })
    }

    fn interval_from_token(token: &str) -> Option<Interval> {
        match token {
            "1min" => Some(Interval::OneMinute),
            "3min" => Some(Interval::ThreeMinutes),
            "5min" => Some(Interval::FiveMinutes),
            "15min" => Some(Interval::FifteenMinutes),
            "30min" => Some(Interval::ThirtyMinutes),
            "1hour" => Some(Interval::OneHour),
            "2hour" => Some(Interval::TwoHours),
            "4hour" => Some(Interval::FourHours),
            "6hour" => Some(Interval::SixHours),
            "8hour" => Some(Interval::EightHours),
            "12hour" => Some(Interval::TwelveHours),
            "1day" => Some(Interval::OneDay),
            "3day" => Some(Interval::ThreeDays),
            "1week" => Some(Interval::OneWeek),
            _ => None,
        }
    }

    async fn refresh_symbol_cache(&self) -> Option<Vec<String>> {
        self.symbol_cache
            .get_or_fetch(|| async {
                let url = format!("{}/api/v1/symbols", self.rest_base());
                let data: Value = self.rest.get_json(&url).await?;
                let list = data.get("data")?.as_array()?;
                let mut canonical = Vec::new();
                let mut map = self.venue_to_canonical.write().unwrap();
                for entry in list {
                    let base = entry.get("baseCurrency")?.as_str()?.to_uppercase();
                    let quote = entry.get("quoteCurrency")?.as_str()?.to_uppercase();
                    let venue_symbol = entry.get("symbol")?.as_str()?.to_uppercase();
                    let canonical_symbol = format!("{base}/{quote}");
                    map.insert(venue_symbol, canonical_symbol.clone());
                    canonical.push(canonical_symbol);
                }
                Some(canonical)
            })
            .await
    }

    fn canonical_from_venue(&self, venue_symbol: &str) -> Option<String> {
        self.venue_to_canonical.read().unwrap().get(venue_symbol).cloned()
    }

    fn decode_order_book(&self, symbol: &str, envelope: &Value) -> Option<(String, CanonicalRecord)> {
        let key = canonical_stream_key(Endpoint::OrderBook, symbol, None);
        let mut entry = self.state.get_mut(&key)?;
        let book = entry.order_book_mut()?;

        let data = envelope.get("data")?;
        let timestamp = data.get("timestamp")?.as_i64()?;
        let bids = parse_levels(data.get("bids")?)?;
        let asks = parse_levels(data.get("asks")?)?;
        book.load_snapshot(timestamp, &bids, &asks);

        let canon = book.to_canonical(Endpoint::OrderBook, "kucoin", symbol, 0, OrderBookEventType::Snapshot, self.result_max_len);
        Some((key, CanonicalRecord::OrderBook(canon)))
    }

    fn decode_kline(&self, envelope: &Value) -> Option<(String, CanonicalRecord)> {
        let topic = envelope.get("topic")?.as_str()?;
        let token = topic.split('_').nth(1)?;
        let interval = Self::interval_from_token(token)?;
        let data = envelope.get("data")?;
        let venue_symbol = data.get("symbol")?.as_str()?;
        let symbol = self.canonical_from_venue(venue_symbol)?;
        let key = canonical_stream_key(Endpoint::Kline, &symbol, Some(interval));
        let mut entry = self.state.get_mut(&key)?;
        let acc = entry.kline_mut()?;

        let candles = data.get("candles")?.as_array()?;
        let open_time: i64 = candles.first()?.as_str()?.parse().ok()?;
        let open_time_ms = open_time * 1000;
        let interval_ms = interval_duration_ms(interval);
        let close_time_ms = open_time_ms + interval_ms - 1;

        acc.upsert(KlineBar {
            endpoint: Endpoint::Kline,
            exchange: "kucoin".to_string(),
            symbol: symbol.clone(),
            interval,
            last_update_id: data.get("time")?.as_i64()?,
            open_time: open_time_ms,
            close_time: close_time_ms,
            open_time_date: format_millis(open_time_ms),
            close_time_date: format_millis(close_time_ms),
            open: candles.get(1)?.as_str()?.to_string(),
            close: candles.get(2)?.as_str()?.to_string(),
            hight: candles.get(3)?.as_str()?.to_string(),
            low: candles.get(4)?.as_str()?.to_string(),
            volume: candles.get(5)?.as_str()?.to_string(),
            is_closed: false,
            is_confirmed: None,
        });
        let out = acc.query(self.result_max_len);
        Some((key, CanonicalRecord::Klines(out)))
    }

    fn decode_trade(&self, envelope: &Value) -> Option<(String, CanonicalRecord)> {
        let data = envelope.get("data")?;
        let venue_symbol = data.get("symbol")?.as_str()?;
        let symbol = self.canonical_from_venue(venue_symbol)?;
        let key = canonical_stream_key(Endpoint::Trades, &symbol, None);
        let mut entry = self.state.get_mut(&key)?;
        let fifo = entry.trades_mut()?;

        let trade_time_ns: i64 = data.get("time")?.as_str()?.parse().ok()?;
        let trade_time = trade_time_ns / 1_000_000;
        let side = data.get("side")?.as_str()?;
        fifo.push(Trade {
            endpoint: Endpoint::Trades,
            exchange: "kucoin".to_string(),
            symbol,
            event_time: trade_time,
            trade_id: data.get("tradeId")?.as_str()?.to_string(),
            price: data.get("price")?.as_str()?.to_string(),
            quantity: data.get("size")?.as_str()?.to_string(),
            trade_time,
            trade_time_date: format_millis(trade_time),
            side_of_taker: if side.eq_ignore_ascii_case("buy") { TakerSide::Buy } else { TakerSide::Sell },
        });
        let out = fifo.query(self.result_max_len);
        Some((key, CanonicalRecord::Trades(out)))
    }

    fn decode_ticker(&self, envelope: &Value) -> Option<(String, CanonicalRecord)> {
        let topic = envelope.get("topic")?.as_str()?;
        let venue_symbol = topic.split(':').nth(1)?;
        let symbol = self.canonical_from_venue(venue_symbol)?;
        let key = canonical_stream_key(Endpoint::Ticker, &symbol, None);
        let data = envelope.get("data")?;
        let event_time = data.get("time").and_then(Value::as_i64).unwrap_or(0);
        let ticker = crate::record::Ticker {
            endpoint: Endpoint::Ticker,
            exchange: "kucoin".to_string(),
            symbol,
            event_time,
            price_change: String::new(),
            price_change_percent: String::new(),
            weighted_average_price: String::new(),
            last_price: data.get("price")?.as_str()?.to_string(),
            last_quantity: data.get("size")?.as_str()?.to_string(),
            best_bid_price: data.get("bestBid")?.as_str()?.to_string(),
            best_bid_quantity: data.get("bestBidSize")?.as_str()?.to_string(),
            best_ask_price: data.get("bestAsk")?.as_str()?.to_string(),
            best_ask_quantity: data.get("bestAskSize")?.as_str()?.to_string(),
            open_price: String::new(),
            high_price: String::new(),
            low_price: String::new(),
            total_traded_base_asset_volume: String::new(),
            total_traded_quote_asset_volume: String::new(),
            statistics_open_time: 0,
            statistics_close_time: 0,
            total_number_of_trades: 0,
        };
        Some((key, CanonicalRecord::Ticker(ticker)))
    }
}

fn interval_duration_ms(interval: Interval) -> i64 {
    match interval {
        Interval::OneMinute => 60_000,
        Interval::ThreeMinutes => 3 * 60_000,
        Interval::FiveMinutes => 5 * 60_000,
        Interval::FifteenMinutes => 15 * 60_000,
        Interval::ThirtyMinutes => 30 * 60_000,
        Interval::OneHour => 3_600_000,
        Interval::TwoHours => 2 * 3_600_000,
        Interval::FourHours => 4 * 3_600_000,
        Interval::SixHours => 6 * 3_600_000,
        Interval::EightHours => 8 * 3_600_000,
        Interval::TwelveHours => 12 * 3_600_000,
        Interval::OneDay => 86_400_000,
        Interval::ThreeDays => 3 * 86_400_000,
        Interval::OneWeek => 7 * 86_400_000,
        Interval::OneMonth => 30 * 86_400_000,
    }
}

fn parse_levels(value: &Value) -> Option<Vec<[String; 2]>> {
    let arr = value.as_array()?;
    let mut out = Vec::with_capacity(arr.len());
    for level in arr {
        let pair = level.as_array()?;
        out.push([pair.first()?.as_str()?.to_string(), pair.get(1)?.as_str()?.to_string()]);
    }
    Some(out)
}

fn format_millis(ms: i64) -> String {
    let secs = ms / 1000;
    chrono::DateTime::from_timestamp(secs, 0).unwrap_or_default().format("%Y-%m-%d %H:%M:%S").to_string()
}

#[async_trait]
impl Adapter for KucoinAdapter {
    fn api_url(&self) -> String {
        self.rest_base().to_string()
    }

    fn websocket_url(&self) -> String {
        // Empty until `start()` has minted a token; the facade always
        // awaits `start()` before opening a connection.
        self.ws_url.read().unwrap().clone()
    }

    async fn full_symbol_list(&self, sorted: bool) -> Result<Vec<String>> {
        let mut list = self.refresh_symbol_cache().await.unwrap_or_default();
        if sorted {
            list.sort();
        }
        Ok(list)
    }

    async fn is_symbol_supported(&self, canonical_symbol: &str) -> bool {
        match self.full_symbol_list(false).await {
            Ok(list) => list.iter().any(|s| s == canonical_symbol),
            Err(_) => false,
        }
    }

    fn canonicalize_symbol(&self, venue_symbol: &str) -> Option<String> {
        self.canonical_from_venue(&venue_symbol.to_uppercase())
    }

    fn decanonicalize_symbol(&self, canonical_symbol: &str) -> String {
        Self::venue_symbol(canonical_symbol)
    }

    fn canonicalize_interval(&self, venue_interval: &str) -> Option<Interval> {
        Self::interval_from_token(venue_interval)
    }

    fn decanonicalize_interval(&self, interval: Interval) -> Option<String> {
        Self::interval_token(interval).map(str::to_string)
    }

    fn subscription_plan(&self, descriptor: &StreamDescriptor) -> SubscriptionPlan {
        let venue_symbol = Self::venue_symbol(&descriptor.symbol);
        let topic = match descriptor.endpoint {
            Endpoint::OrderBook => format!("/spotMarket/level2Depth50:{venue_symbol}"),
            Endpoint::Kline => {
                let token = descriptor.interval.and_then(Self::interval_token).unwrap_or("1min");
                format!("/market/candles:{venue_symbol}_{token}")
            }
            Endpoint::Trades => format!("/market/match:{venue_symbol}"),
            Endpoint::Ticker => format!("/market/ticker:{venue_symbol}"),
        };

        let id = chrono::Utc::now().timestamp_millis().to_string();
        let subscribe = serde_json::json!({
            "id": id, "type": "subscribe", "topic": topic, "privateChannel": false, "response": true
        })
        .to_string();
        let unsubscribe = serde_json::json!({
            "id": id, "type": "unsubscribe", "topic": topic, "privateChannel": false, "response": true
        })
        .to_string();

        SubscriptionPlan {
            url_suffix: String::new(),
            on_open: Some(FrameList::One(subscribe)),
            on_close: Some(FrameList::One(unsubscribe)),
            ping_interval: Some(*self.ping_interval.read().unwrap()),
            ping_timeout: Some(*self.ping_timeout.read().unwrap()),
        }
    }

    fn app_ping_frame(&self) -> Option<String> {
        let id = chrono::Utc::now().timestamp_millis().to_string();
        Some(serde_json::json!({"id": id, "type": "ping"}).to_string())
    }

    fn is_pong(&self, text: &str) -> bool {
        let Ok(envelope) = serde_json::from_str::<Value>(text) else {
            return false;
        };
        envelope.get("type").and_then(Value::as_str) == Some("pong")
    }

    async fn decode(&self, frame: RawFrame) -> DecodeOutcome {
        let RawFrame::Text(text) = frame else {
            return DecodeOutcome::Ignored;
        };

        let envelope: Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(err) => {
                warn!(error = %err, "failed to parse kucoin frame as json");
                return DecodeOutcome::Ignored;
            }
        };

        if envelope.get("type").and_then(Value::as_str) == Some("pong") {
            return DecodeOutcome::Ignored;
        }

        let Some(topic) = envelope.get("topic").and_then(Value::as_str) else {
            return DecodeOutcome::Ignored;
        };
        let Some(channel) = topic.split(':').next() else {
            return DecodeOutcome::Ignored;
        };
        let channel = channel.split('_').next().unwrap_or(channel);

        let decoded = match channel {
            "/spotMarket/level2Depth50" => {
                let venue_symbol = topic.split(':').nth(1);
                match venue_symbol.and_then(|s| self.canonical_from_venue(s)) {
                    Some(symbol) => self.decode_order_book(&symbol, &envelope),
                    None => {
                        debug!(topic, "unknown symbol in kucoin order book frame");
                        None
                    }
                }
            }
            "/market/candles" => self.decode_kline(&envelope),
            "/market/match" => self.decode_trade(&envelope),
            "/market/ticker" => self.decode_ticker(&envelope),
            _ => None,
        };

        match decoded {
            Some((key, record)) => DecodeOutcome::Record(key, record),
            None => DecodeOutcome::Ignored,
        }
    }

    fn reset_transient_state(&self) {
        for mut entry in self.state.iter_mut() {
            if let StreamState::OrderBook(book) = entry.value_mut() {
                *book = OrderBook::new();
            }
        }
    }

    async fn start(&self) {
        if self.mint_token().await.is_none() {
            warn!("failed to mint kucoin bullet-public token");
        }
    }

    fn exchange_name(&self) -> &'static str {
        "kucoin"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> KucoinAdapter {
        let a = KucoinAdapter::new(false, 5, 10);
        a.register(StreamDescriptor::new(Endpoint::OrderBook, "BTC/USDT"));
        a.register(StreamDescriptor::new(Endpoint::Trades, "BTC/USDT"));
        a.venue_to_canonical.write().unwrap().insert("BTC-USDT".to_string(), "BTC/USDT".to_string());
        a
    }

    #[tokio::test]
    async fn order_book_snapshot_replaces_whole_book_each_message() {
        let a = adapter();
        let frame = serde_json::json!({
            "topic": "/spotMarket/level2Depth50:BTC-USDT", "type": "message",
            "data": {"timestamp": 1, "bids": [["100", "1"]], "asks": [["101", "1"]]}
        })
        .to_string();

        let outcome = a.decode(RawFrame::Text(frame)).await;
        match outcome {
            DecodeOutcome::Record(_, CanonicalRecord::OrderBook(book)) => {
                assert_eq!(book.bids.len(), 1);
                assert!(matches!(book.kind, OrderBookEventType::Snapshot));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn pong_reply_is_ignored() {
        let a = adapter();
        let frame = serde_json::json!({"id": "1", "type": "pong"}).to_string();
        let outcome = a.decode(RawFrame::Text(frame)).await;
        assert!(matches!(outcome, DecodeOutcome::Ignored));
    }

    #[test]
    fn app_ping_frame_is_the_bullet_public_ping_shape() {
        let a = adapter();
        let frame = a.app_ping_frame().unwrap();
        let parsed: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(parsed["type"], "ping");
        assert!(parsed["id"].is_string());
    }

    #[test]
    fn is_pong_recognizes_the_pong_reply() {
        let a = adapter();
        let frame = serde_json::json!({"id": "1", "type": "pong"}).to_string();
        assert!(a.is_pong(&frame));
        assert!(!a.is_pong("{}"));
    }

    #[test]
    fn interval_tokens_round_trip_except_unsupported_month() {
        assert_eq!(KucoinAdapter::interval_token(Interval::OneHour), Some("1hour"));
        assert_eq!(KucoinAdapter::interval_from_token("1hour"), Some(Interval::OneHour));
        assert_eq!(KucoinAdapter::interval_token(Interval::OneMonth), None);
    }
}
