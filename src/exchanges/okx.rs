//! OKX public adapter.
//!
//! Grounded on `ccxw/okx.py`: `books`/`trades`/`tickers` subscribe on the
//! `/public` WebSocket path, `candle*` channels subscribe on the separate
//! `/business` path (exposed here through [`crate::adapter::SubscriptionPlan::url_suffix`]
//! so the facade opens one connection per distinct suffix), literal text
//! `"ping"`/`"pong"` keepalive, and seqId-delta order-book merge.

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

pub struct OkxAdapter {
    testmode: bool,
    result_max_len: usize,
    data_max_len: usize,
    rest: crate::rest::RestClient,
    symbol_cache: TtlCache<Vec<String>>,
    venue_to_canonical: RwLock<HashMap<String, String>>,
    state: DashMap<String, StreamState>,
}

impl OkxAdapter {
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
        symbol.replace('/', "-").to_uppercase()
    }

    fn candle_channel(interval: Interval) -> String {
        let token = interval.as_str();
        if token.ends_with('m') {
            format!("candle{token}")
        } else if let Some(rest) = token.strip_suffix('h') {
            format!("candle{rest}Hutc")
        } else if let Some(rest) = token.strip_suffix("mo") {
            format!("candle{rest}Mutc")
        } else if let Some(rest) = token.strip_suffix('d') {
            format!("candle{rest}Dutc")
        } else if let Some(rest) = token.strip_suffix('w') {
            format!("candle{rest}Wutc")
        } else {
            format!("candle{token}")
        }
    }

    fn interval_from_channel(channel: &str) -> Option<Interval> {
        let raw = channel.strip_prefix("candle")?;
        let raw = raw.strip_suffix("utc").unwrap_or(raw);
        let normalized = if raw.contains('m') && !raw.contains('M') {
            raw.to_string()
        } else if raw.contains('H') {
            raw.to_lowercase()
        } else if raw.contains('D') {
            raw.to_lowercase()
        } else if raw.contains('W') {
            raw.to_lowercase()
        } else if raw.contains('M') {
            raw.replace('M', "mo").to_lowercase()
        } else {
            raw.to_string()
        };
        Interval::from_str(&normalized)
    }

    async fn refresh_symbol_cache(&self) -> Option<Vec<String>> {
        self.symbol_cache
            .get_or_fetch(|| async {
                let url = format!("{}/api/v5/public/instruments?instType=SPOT", self.api_url());
                let data: Value = self.rest.get_json(&url).await?;
                let list = data.get("data")?.as_array()?;
                let mut canonical = Vec::new();
                let mut map = self.venue_to_canonical.write().unwrap();
                for entry in list {
                    let base = entry.get("baseCcy")?.as_str()?.to_uppercase();
                    let quote = entry.get("quoteCcy")?.as_str()?.to_uppercase();
                    let venue_symbol = entry.get("instId")?.as_str()?.to_uppercase();
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

        let action = envelope.get("action")?.as_str()?;
        let level = envelope.get("data")?.as_array()?.first()?;
        let seq_id = level.get("seqId")?.as_i64()?;
        let bids = parse_levels(level.get("bids")?)?;
        let asks = parse_levels(level.get("asks")?)?;

        let (kind, diff) = if action == "snapshot" || !book.is_initialized() {
            book.load_snapshot(seq_id, &bids, &asks);
            (OrderBookEventType::Snapshot, 0)
        } else {
            let before = book.last_update_id;
            book.apply_levels(&bids, &asks);
            book.last_update_id = seq_id;
            (OrderBookEventType::Update, seq_id - before)
        };

        let canon = book.to_canonical(Endpoint::OrderBook, "okx", symbol, diff, kind, self.result_max_len);
        Some((key, CanonicalRecord::OrderBook(canon)))
    }

    fn decode_kline(&self, symbol: &str, channel: &str, envelope: &Value) -> Option<(String, CanonicalRecord)> {
        let interval = Self::interval_from_channel(channel)?;
        let key = canonical_stream_key(Endpoint::Kline, symbol, Some(interval));
        let mut entry = self.state.get_mut(&key)?;
        let acc = entry.kline_mut()?;

        let rows = envelope.get("data")?.as_array()?;
        let interval_ms = interval_duration_ms(interval);
        for row in rows {
            let row = row.as_array()?;
            if row.len() < 9 {
                continue;
            }
            let open_time: i64 = row[0].as_str()?.parse().ok()?;
            let confirmed = row[8].as_str()?.parse::<i64>().ok()? == 1;
            acc.upsert(KlineBar {
                endpoint: Endpoint::Kline,
                exchange: "okx".to_string(),
                symbol: symbol.to_string(),
                interval,
                last_update_id: open_time,
                open_time,
                close_time: open_time + interval_ms - 1,
                open_time_date: format_millis(open_time),
                close_time_date: format_millis(open_time + interval_ms - 1),
                open: row[1].as_str()?.to_string(),
                close: row[4].as_str()?.to_string(),
                hight: row[2].as_str()?.to_string(),
                low: row[3].as_str()?.to_string(),
                volume: row[5].as_str()?.to_string(),
                is_closed: confirmed,
                is_confirmed: Some(confirmed),
            });
        }
        let out = acc.query(self.result_max_len);
        Some((key, CanonicalRecord::Klines(out)))
    }

    fn decode_trades(&self, symbol: &str, envelope: &Value) -> Option<(String, CanonicalRecord)> {
        let key = canonical_stream_key(Endpoint::Trades, symbol, None);
        let mut entry = self.state.get_mut(&key)?;
        let fifo = entry.trades_mut()?;

        let items = envelope.get("data")?.as_array()?;
        for item in items {
            let trade_time: i64 = item.get("ts")?.as_str()?.parse().ok()?;
            let side = item.get("side")?.as_str()?;
            fifo.push(Trade {
                endpoint: Endpoint::Trades,
                exchange: "okx".to_string(),
                symbol: symbol.to_string(),
                event_time: trade_time,
                trade_id: item.get("tradeId")?.as_str()?.to_string(),
                price: item.get("px")?.as_str()?.to_string(),
                quantity: item.get("sz")?.as_str()?.to_string(),
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
        let data = envelope.get("data")?.as_array()?.first()?;
        let event_time: i64 = data.get("ts")?.as_str()?.parse().ok()?;
        let ticker = crate::record::Ticker {
            endpoint: Endpoint::Ticker,
            exchange: "okx".to_string(),
            symbol: symbol.to_string(),
            event_time,
            price_change: String::new(),
            price_change_percent: String::new(),
            weighted_average_price: String::new(),
            last_price: data.get("last")?.as_str()?.to_string(),
            last_quantity: data.get("lastSz")?.as_str()?.to_string(),
            best_bid_price: data.get("bidPx")?.as_str()?.to_string(),
            best_bid_quantity: data.get("bidSz")?.as_str()?.to_string(),
            best_ask_price: data.get("askPx")?.as_str()?.to_string(),
            best_ask_quantity: data.get("askSz")?.as_str()?.to_string(),
            open_price: data.get("open24h")?.as_str()?.to_string(),
            high_price: data.get("high24h")?.as_str()?.to_string(),
            low_price: data.get("low24h")?.as_str()?.to_string(),
            total_traded_base_asset_volume: data.get("vol24h")?.as_str()?.to_string(),
            total_traded_quote_asset_volume: data.get("volCcy24h")?.as_str()?.to_string(),
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
impl Adapter for OkxAdapter {
    fn api_url(&self) -> String {
        "https://www.okx.com".to_string()
    }

    fn websocket_url(&self) -> String {
        if self.testmode {
            "wss://wspap.okx.com:8443/ws/v5".to_string()
        } else {
            "wss://ws.okx.com:8443/ws/v5".to_string()
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
        Self::interval_from_channel(&format!("candle{venue_interval}"))
    }

    fn decanonicalize_interval(&self, interval: Interval) -> Option<String> {
        Some(Self::candle_channel(interval).trim_start_matches("candle").to_string())
    }

    fn subscription_plan(&self, descriptor: &StreamDescriptor) -> SubscriptionPlan {
        let venue_symbol = Self::venue_symbol(&descriptor.symbol);
        let (channel, suffix) = match descriptor.endpoint {
            Endpoint::OrderBook => ("books".to_string(), "/public"),
            Endpoint::Kline => {
                let interval = descriptor.interval.unwrap_or(Interval::OneMinute);
                (Self::candle_channel(interval), "/business")
            }
            Endpoint::Trades => ("trades".to_string(), "/public"),
            Endpoint::Ticker => ("tickers".to_string(), "/public"),
        };

        let subscribe = serde_json::json!({
            "op": "subscribe", "args": [{"channel": channel, "instId": venue_symbol}]
        })
        .to_string();
        let unsubscribe = serde_json::json!({
            "op": "unsubscribe", "args": [{"channel": channel, "instId": venue_symbol}]
        })
        .to_string();

        SubscriptionPlan {
            url_suffix: suffix.to_string(),
            on_open: Some(FrameList::One(subscribe)),
            on_close: Some(FrameList::One(unsubscribe)),
            ping_interval: Some(std::time::Duration::from_secs(25)),
            ping_timeout: Some(std::time::Duration::from_secs(30)),
        }
    }

    async fn decode(&self, frame: RawFrame) -> DecodeOutcome {
        let RawFrame::Text(text) = frame else {
            return DecodeOutcome::Ignored;
        };

        if text == "pong" {
            return DecodeOutcome::Ignored;
        }

        let envelope: Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(err) => {
                warn!(error = %err, "failed to parse okx frame as json");
                return DecodeOutcome::Ignored;
            }
        };

        let Some(arg) = envelope.get("arg") else {
            return DecodeOutcome::Ignored;
        };
        let Some(channel) = arg.get("channel").and_then(Value::as_str) else {
            return DecodeOutcome::Ignored;
        };
        let Some(venue_symbol) = arg.get("instId").and_then(Value::as_str) else {
            return DecodeOutcome::Ignored;
        };
        let Some(symbol) = self.canonical_from_venue(venue_symbol) else {
            debug!(venue_symbol, "unknown symbol in okx frame");
            return DecodeOutcome::Ignored;
        };

        let decoded = if channel == "books" {
            self.decode_order_book(&symbol, &envelope)
        } else if channel.starts_with("candle") {
            self.decode_kline(&symbol, channel, &envelope)
        } else if channel == "trades" {
            self.decode_trades(&symbol, &envelope)
        } else if channel == "tickers" {
            self.decode_ticker(&symbol, &envelope)
        } else {
            None
        };

        match decoded {
            Some((key, record)) => DecodeOutcome::Record(key, record),
            None => DecodeOutcome::Ignored,
        }
    }

    fn app_ping_frame(&self) -> Option<String> {
        Some("ping".to_string())
    }

    fn is_pong(&self, text: &str) -> bool {
        text == "pong"
    }

    fn reset_transient_state(&self) {
        for mut entry in self.state.iter_mut() {
            if let StreamState::OrderBook(book) = entry.value_mut() {
                *book = OrderBook::new();
            }
        }
    }

    fn exchange_name(&self) -> &'static str {
        "okx"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> OkxAdapter {
        let a = OkxAdapter::new(false, 5, 10);
        a.register(StreamDescriptor::new(Endpoint::OrderBook, "BTC/USDT"));
        a.register(StreamDescriptor::new(Endpoint::Kline, "BTC/USDT").with_interval(Interval::OneHour));
        a.venue_to_canonical.write().unwrap().insert("BTC-USDT".to_string(), "BTC/USDT".to_string());
        a
    }

    #[tokio::test]
    async fn literal_pong_text_frame_is_ignored() {
        let a = adapter();
        let outcome = a.decode(RawFrame::Text("pong".to_string())).await;
        assert!(matches!(outcome, DecodeOutcome::Ignored));
    }

    #[test]
    fn is_pong_recognizes_the_literal_pong_text() {
        let a = adapter();
        assert!(a.is_pong("pong"));
        assert!(!a.is_pong("ping"));
    }

    #[tokio::test]
    async fn snapshot_then_update_tracks_seq_id_delta() {
        let a = adapter();
        let snapshot = serde_json::json!({
            "arg": {"channel": "books", "instId": "BTC-USDT"}, "action": "snapshot",
            "data": [{"seqId": 100, "bids": [["100", "1"]], "asks": [["101", "1"]]}]
        })
        .to_string();
        a.decode(RawFrame::Text(snapshot)).await;

        let update = serde_json::json!({
            "arg": {"channel": "books", "instId": "BTC-USDT"}, "action": "update",
            "data": [{"seqId": 103, "bids": [["100", "0"]], "asks": [["102", "2"]]}]
        })
        .to_string();
        let outcome = a.decode(RawFrame::Text(update)).await;

        match outcome {
            DecodeOutcome::Record(_, CanonicalRecord::OrderBook(book)) => {
                assert_eq!(book.diff_update_id, 3);
                assert!(book.bids.is_empty());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn candle_channel_appends_utc_suffix_for_hour_intervals() {
        assert_eq!(OkxAdapter::candle_channel(Interval::OneHour), "candle1Hutc");
        assert_eq!(OkxAdapter::candle_channel(Interval::OneMinute), "candle1m");
        assert_eq!(OkxAdapter::interval_from_channel("candle1Hutc"), Some(Interval::OneHour));
    }
}
