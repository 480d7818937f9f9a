//! Bybit v5 public WebSocket adapter.
//!
//! Grounded on `ccxw/bybit.py`: topic-based dispatch (`topic.split('.')`),
//! whole-book delta merge keyed by price with zero-size deletion, and the
//! `{"op":"ping"}` / `ret_msg == "pong"` application-level keepalive.

use std::collections::HashMap;
use std::sync::RwLock;

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

pub struct BybitAdapter {
    testmode: bool,
    result_max_len: usize,
    data_max_len: usize,
    rest: crate::rest::RestClient,
    symbol_cache: TtlCache<Vec<String>>,
    venue_to_canonical: RwLock<HashMap<String, String>>,
    state: DashMap<String, StreamState>,
}

impl BybitAdapter {
    pub fn new(testmode: bool, result_max_len: usize, data_max_len: usize) -> Self {
        Self {
            testmode,
            result_max_len,
            data_max_len: data_max_len.min(2500),
            rest: crate::rest::RestClient::new(),
            symbol_cache: TtlCache::new(super::common::EXCHANGE_INFO_TTL),
            venue_to_canonical: RwLock::new(HashMap::new()),
            state: DashMap::new(),
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

    fn venue_symbol(symbol: &str) -> String {
        symbol.replace('/', "").to_uppercase()
    }

    /// `None` for intervals Bybit's kline topic doesn't support (8h, 3d).
    fn interval_token(interval: Interval) -> Option<String> {
        let token = match interval {
            Interval::OneMinute => "1",
            Interval::ThreeMinutes => "3",
            Interval::FiveMinutes => "5",
            Interval::FifteenMinutes => "15",
            Interval::ThirtyMinutes => "30",
            Interval::OneHour => "60",
            Interval::TwoHours => "120",
            Interval::FourHours => "240",
            Interval::SixHours => "360",
            Interval::TwelveHours => "720",
            Interval::OneDay => "D",
            Interval::OneWeek => "W",
            Interval::OneMonth => "M",
            Interval::EightHours | Interval::ThreeDays => return None,
        };
        Some(token.to_string())
    }

    fn interval_from_token(token: &str) -> Option<Interval> {
        match token {
            "1" => Some(Interval::OneMinute),
            "3" => Some(Interval::ThreeMinutes),
            "5" => Some(Interval::FiveMinutes),
            "15" => Some(Interval::FifteenMinutes),
            "30" => Some(Interval::ThirtyMinutes),
            "60" => Some(Interval::OneHour),
            "120" => Some(Interval::TwoHours),
            "240" => Some(Interval::FourHours),
            "360" => Some(Interval::SixHours),
            "720" => Some(Interval::TwelveHours),
            "D" => Some(Interval::OneDay),
            "W" => Some(Interval::OneWeek),
            "M" => Some(Interval::OneMonth),
            _ => None,
        }
    }

    async fn refresh_symbol_cache(&self) -> Option<Vec<String>> {
        self.symbol_cache
            .get_or_fetch(|| async {
                let url = format!("{}/v5/market/instruments-info?category=spot", self.api_url());
                let data: Value = self.rest.get_json(&url).await?;
                let list = data.get("result")?.get("list")?.as_array()?;
                let mut canonical = Vec::new();
                let mut map = self.venue_to_canonical.write().unwrap();
                for entry in list {
                    let base = entry.get("baseCoin")?.as_str()?.to_uppercase();
                    let quote = entry.get("quoteCoin")?.as_str()?.to_uppercase();
                    let canonical_symbol = format!("{base}/{quote}");
                    map.insert(format!("{base}{quote}"), canonical_symbol.clone());
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
        let msg_type = envelope.get("type")?.as_str()?;
        let u = data.get("u")?.as_i64()?;
        let bids = parse_levels(data.get("b")?)?;
        let asks = parse_levels(data.get("a")?)?;

        let (kind, diff) = if msg_type == "snapshot" || !book.is_initialized() {
            book.load_snapshot(u, &bids, &asks);
            (OrderBookEventType::Snapshot, 0)
        } else {
            let before = book.last_update_id;
            book.apply_levels(&bids, &asks);
            book.last_update_id = u;
            (OrderBookEventType::Update, u - before)
        };

        let canon = book.to_canonical(Endpoint::OrderBook, "bybit", symbol, diff, kind, self.result_max_len);
        Some((key, CanonicalRecord::OrderBook(canon)))
    }

    fn decode_kline(&self, symbol: &str, envelope: &Value) -> Option<(String, CanonicalRecord)> {
        let topic = envelope.get("topic")?.as_str()?;
        let interval_token = topic.split('.').nth(1)?;
        let interval = Self::interval_from_token(interval_token)?;
        let key = canonical_stream_key(Endpoint::Kline, symbol, Some(interval));
        let mut entry = self.state.get_mut(&key)?;
        let acc = entry.kline_mut()?;

        let ts = envelope.get("ts")?.as_i64()?;
        let bars = envelope.get("data")?.as_array()?;
        for bar_data in bars {
            let open_time = bar_data.get("start")?.as_i64()?;
            let close_time = bar_data.get("end")?.as_i64()?;
            acc.upsert(KlineBar {
                endpoint: Endpoint::Kline,
                exchange: "bybit".to_string(),
                symbol: symbol.to_string(),
                interval,
                last_update_id: ts,
                open_time,
                close_time,
                open_time_date: format_millis(open_time),
                close_time_date: format_millis(close_time),
                open: bar_data.get("open")?.as_str()?.to_string(),
                close: bar_data.get("close")?.as_str()?.to_string(),
                hight: bar_data.get("high")?.as_str()?.to_string(),
                low: bar_data.get("low")?.as_str()?.to_string(),
                volume: bar_data.get("volume")?.as_str()?.to_string(),
                is_closed: bar_data.get("confirm")?.as_bool()?,
                is_confirmed: None,
            });
        }
        let out = acc.query(self.result_max_len);
        Some((key, CanonicalRecord::Klines(out)))
    }

    fn decode_trades(&self, symbol: &str, envelope: &Value) -> Option<(String, CanonicalRecord)> {
        let key = canonical_stream_key(Endpoint::Trades, symbol, None);
        let mut entry = self.state.get_mut(&key)?;
        let fifo = entry.trades_mut()?;

        let event_time = envelope.get("ts")?.as_i64()?;
        let items = envelope.get("data")?.as_array()?;
        for item in items {
            let trade_time = item.get("T")?.as_i64()?;
            let side = item.get("S")?.as_str()?;
            fifo.push(Trade {
                endpoint: Endpoint::Trades,
                exchange: "bybit".to_string(),
                symbol: symbol.to_string(),
                event_time,
                trade_id: item.get("i")?.as_str()?.to_string(),
                price: item.get("p")?.as_str()?.to_string(),
                quantity: item.get("v")?.as_str()?.to_string(),
                trade_time,
                trade_time_date: format_millis(trade_time),
                side_of_taker: if side.eq_ignore_ascii_case("buy") { TakerSide::Buy } else { TakerSide::Sell },
            });
        }
        let out = fifo.query(self.result_max_len);
        Some((key, CanonicalRecord::Trades(out)))
    }

    fn decode_ticker(&self, symbol: &str, envelope: &Value) -> Option<(String, CanonicalRecord)> {
        let key = canonical_stream_key(Endpoint::Ticker, symbol, None);
        let event_time = envelope.get("cs").and_then(Value::as_i64).unwrap_or(0);
        let data = envelope.get("data")?;
        let last_price: f64 = data.get("lastPrice")?.as_str()?.parse().ok()?;
        let pct: f64 = data.get("price24hPcnt")?.as_str()?.parse().ok()?;
        let ticker = crate::record::Ticker {
            endpoint: Endpoint::Ticker,
            exchange: "bybit".to_string(),
            symbol: symbol.to_string(),
            event_time,
            price_change: format!("{:.8}", pct * last_price),
            price_change_percent: data.get("price24hPcnt")?.as_str()?.to_string(),
            weighted_average_price: String::new(),
            last_price: data.get("lastPrice")?.as_str()?.to_string(),
            last_quantity: String::new(),
            best_bid_price: String::new(),
            best_bid_quantity: String::new(),
            best_ask_price: String::new(),
            best_ask_quantity: String::new(),
            open_price: data.get("prevPrice24h")?.as_str()?.to_string(),
            high_price: data.get("highPrice24h")?.as_str()?.to_string(),
            low_price: data.get("lowPrice24h")?.as_str()?.to_string(),
            total_traded_base_asset_volume: data.get("volume24h")?.as_str()?.to_string(),
            total_traded_quote_asset_volume: data.get("turnover24h")?.as_str()?.to_string(),
            statistics_open_time: 0,
            statistics_close_time: 0,
            total_number_of_trades: 0,
        };
        Some((key, CanonicalRecord::Ticker(ticker)))
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
impl Adapter for BybitAdapter {
    fn api_url(&self) -> String {
        if self.testmode { "https://api-testnet.bybit.com".into() } else { "https://api.bybit.com".into() }
    }

    fn websocket_url(&self) -> String {
        if self.testmode {
            "wss://stream-testnet.bybit.com/v5/public/spot".into()
        } else {
            "wss://stream.bybit.com/v5/public/spot".into()
        }
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
        Self::interval_token(interval)
    }

    fn subscription_plan(&self, descriptor: &StreamDescriptor) -> SubscriptionPlan {
        let venue_symbol = Self::venue_symbol(&descriptor.symbol);
        let topic = match descriptor.endpoint {
            Endpoint::OrderBook => format!("orderbook.50.{venue_symbol}"),
            Endpoint::Kline => {
                let token = descriptor
                    .interval
                    .and_then(Self::interval_token)
                    .unwrap_or_else(|| "1".into());
                format!("kline.{token}.{venue_symbol}")
            }
            Endpoint::Trades => format!("publicTrade.{venue_symbol}"),
            Endpoint::Ticker => format!("tickers.{venue_symbol}"),
        };

        let subscribe = serde_json::json!({"op": "subscribe", "args": [topic]}).to_string();
        let unsubscribe = serde_json::json!({"op": "unsubscribe", "args": [topic]}).to_string();

        SubscriptionPlan {
            url_suffix: String::new(),
            on_open: Some(FrameList::One(subscribe)),
            on_close: Some(FrameList::One(unsubscribe)),
            ping_interval: Some(std::time::Duration::from_secs(20)),
            ping_timeout: Some(std::time::Duration::from_secs(10)),
        }
    }

    async fn decode(&self, frame: RawFrame) -> DecodeOutcome {
        let RawFrame::Text(text) = frame else {
            return DecodeOutcome::Ignored;
        };

        let envelope: Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(err) => {
                warn!(error = %err, "failed to parse bybit frame as json");
                return DecodeOutcome::Ignored;
            }
        };

        if envelope.get("op").and_then(Value::as_str) == Some("ping")
            || (envelope.get("ret_msg").and_then(Value::as_str) == Some("pong")
                && envelope.get("op").and_then(Value::as_str) == Some("ping"))
        {
            return DecodeOutcome::Ignored;
        }

        let Some(topic) = envelope.get("topic").and_then(Value::as_str) else {
            return DecodeOutcome::Ignored;
        };
        let mut parts = topic.split('.');
        let Some(kind) = parts.next() else {
            return DecodeOutcome::Ignored;
        };

        let venue_symbol = match kind {
            "orderbook" | "kline" => topic.split('.').nth(2),
            "publicTrade" | "tickers" => topic.split('.').nth(1),
            _ => None,
        };
        let Some(venue_symbol) = venue_symbol else {
            return DecodeOutcome::Ignored;
        };
        let Some(symbol) = self.canonical_from_venue(venue_symbol) else {
            debug!(venue_symbol, "unknown symbol in bybit frame");
            return DecodeOutcome::Ignored;
        };

        let decoded = match kind {
            "orderbook" => self.decode_order_book(&symbol, &envelope),
            "kline" => self.decode_kline(&symbol, &envelope),
            "publicTrade" => self.decode_trades(&symbol, &envelope),
            "tickers" => self.decode_ticker(&symbol, &envelope),
            _ => None,
        };

        match decoded {
            Some((key, record)) => DecodeOutcome::Record(key, record),
            None => DecodeOutcome::Ignored,
        }
    }

    fn app_ping_frame(&self) -> Option<String> {
        Some(serde_json::json!({"op": "ping"}).to_string())
    }

    fn is_pong(&self, text: &str) -> bool {
        let Ok(envelope) = serde_json::from_str::<Value>(text) else {
            return false;
        };
        envelope.get("ret_msg").and_then(Value::as_str) == Some("pong")
    }

    fn reset_transient_state(&self) {
        for mut entry in self.state.iter_mut() {
            if let StreamState::OrderBook(book) = entry.value_mut() {
                *book = OrderBook::new();
            }
        }
    }

    fn exchange_name(&self) -> &'static str {
        "bybit"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> BybitAdapter {
        let a = BybitAdapter::new(false, 5, 10);
        a.register(StreamDescriptor::new(Endpoint::OrderBook, "BTC/USDT"));
        a.register(StreamDescriptor::new(Endpoint::Trades, "BTC/USDT"));
        a.register(StreamDescriptor::new(Endpoint::Ticker, "BTC/USDT"));
        a.venue_to_canonical.write().unwrap().insert("BTCUSDT".to_string(), "BTC/USDT".to_string());
        a
    }

    #[tokio::test]
    async fn snapshot_then_delta_removes_zero_size_bid() {
        let a = adapter();
        let snapshot = serde_json::json!({
            "topic": "orderbook.50.BTCUSDT", "type": "snapshot",
            "data": {"u": 1, "b": [["100", "1"]], "a": [["101", "1"]]}
        })
        .to_string();
        a.decode(RawFrame::Text(snapshot)).await;

        let delta = serde_json::json!({
            "topic": "orderbook.50.BTCUSDT", "type": "delta",
            "data": {"u": 2, "b": [["100", "0"]], "a": [["102", "1"]]}
        })
        .to_string();
        let outcome = a.decode(RawFrame::Text(delta)).await;

        match outcome {
            DecodeOutcome::Record(_, CanonicalRecord::OrderBook(book)) => {
                assert!(book.bids.is_empty());
                assert_eq!(book.asks.len(), 2);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn ping_control_message_is_ignored_not_stored() {
        let a = adapter();
        let ping = serde_json::json!({"req_id": "x", "op": "ping"}).to_string();
        let outcome = a.decode(RawFrame::Text(ping)).await;
        assert!(matches!(outcome, DecodeOutcome::Ignored));
    }

    #[test]
    fn is_pong_recognizes_the_pong_reply() {
        let a = adapter();
        let pong = serde_json::json!({"req_id": "x", "op": "ping", "ret_msg": "pong"}).to_string();
        assert!(a.is_pong(&pong));
        assert!(!a.is_pong("{}"));
    }
}
