//! Bingx spot adapter.
//!
//! Grounded on `ccxw/bingx.py`: order book and kline arrive over a gzip'd
//! binary WebSocket feed with no delta semantics at all (every order-book
//! push is a full replace), while trades and ticker have no WebSocket
//! channel and are instead polled over REST on a ~2req/s round robin and
//! fed into the same decode path through [`crate::relay::Relay`]. Keepalive
//! is receiver-driven: the server sends `{"ping":N,"time":T}` and the
//! client must echo it back as `{"pong":N,"time":T}`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use crate::accumulate::{KlineAccumulator, TradeFifo};
use crate::adapter::{Adapter, DecodeOutcome, FrameList, RawFrame, SubscriptionPlan};
use crate::error::Result;
use crate::orderbook::OrderBook;
use crate::record::{
    CanonicalRecord, Endpoint, Interval, KlineBar, OrderBookEventType,
    StreamDescriptor, TakerSide, Trade, stream_key as canonical_stream_key,
};
use crate::relay::Relay;

use super::common::{StreamState, TtlCache};

/// Minimum spacing between successive REST polls for one trades/ticker
/// stream, per the 500/min, 1500/5min venue rate limit.
const POLL_MIN_SPACING: std::time::Duration = std::time::Duration::from_millis(500);

struct Inner {
    testmode: bool,
    result_max_len: usize,
    data_max_len: usize,
    rest: crate::rest::RestClient,
    symbol_cache: TtlCache<Vec<String>>,
    venue_to_canonical: RwLock<HashMap<String, String>>,
    state: DashMap<String, StreamState>,
    poll_targets: RwLock<Vec<StreamDescriptor>>,
    relay: Relay,
}

pub struct BingxAdapter {
    inner: Arc<Inner>,
    poll_stop: Arc<AtomicBool>,
    poll_handle: AsyncMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl BingxAdapter {
    pub fn new(testmode: bool, result_max_len: usize, data_max_len: usize) -> Self {
        if testmode {
            warn!("bingx has no functional sandbox; falling back to production hosts");
        }

        Self {
            inner: Arc::new(Inner {
                testmode,
                result_max_len,
                data_max_len: data_max_len.min(400),
                rest: crate::rest::RestClient::new(),
                symbol_cache: TtlCache::new(super::common::EXCHANGE_INFO_TTL),
                venue_to_canonical: RwLock::new(HashMap::new()),
                state: DashMap::new(),
                poll_targets: RwLock::new(Vec::new()),
                relay: Relay::new(64),
            }),
            poll_stop: Arc::new(AtomicBool::new(false)),
            poll_handle: AsyncMutex::new(None),
        }
    }

    pub fn register(&self, descriptor: StreamDescriptor) {
        let key = descriptor.stream_key();
        let state = match descriptor.endpoint {
            Endpoint::OrderBook => StreamState::OrderBook(OrderBook::new()),
            Endpoint::Kline => StreamState::Kline(KlineAccumulator::new(self.inner.data_max_len)),
            Endpoint::Trades => StreamState::Trades(TradeFifo::new(self.inner.data_max_len).with_dedup()),
            Endpoint::Ticker => StreamState::Ticker,
        };
        self.inner.state.insert(key, state);

        if matches!(descriptor.endpoint, Endpoint::Trades | Endpoint::Ticker) {
            self.inner.poll_targets.write().unwrap().push(descriptor);
        }
    }

    fn venue_symbol(symbol: &str) -> String {
        symbol.replace('/', "-").to_uppercase()
    }

    /// Bingx only streams the 1-minute kline over WebSocket; every other
    /// interval is rejected at `FacadeConfig::validate`.
    fn interval_token(interval: Interval) -> Option<&'static str> {
        match interval {
            Interval::OneMinute => Some("1min"),
            _ => None,
        }
    }

    fn interval_from_token(token: &str) -> Option<Interval> {
        match token {
            "1min" => Some(Interval::OneMinute),
            _ => None,
        }
    }

    async fn refresh_symbol_cache(&self) -> Option<Vec<String>> {
        self.inner
            .symbol_cache
            .get_or_fetch(|| async {
                let url = format!("{}/openApi/spot/v1/common/symbols", self.api_url());
                let data: Value = self.inner.rest.get_json(&url).await?;
                let list = data.get("data")?.get("symbols")?.as_array()?;
                let mut canonical = Vec::new();
                let mut map = self.inner.venue_to_canonical.write().unwrap();
                for entry in list {
                    let venue_symbol = entry.get("symbol")?.as_str()?.to_uppercase();
                    let canonical_symbol = venue_symbol.replace('-', "/");
                    map.insert(venue_symbol, canonical_symbol.clone());
                    canonical.push(canonical_symbol);
                }
                Some(canonical)
            })
            .await
    }

    fn canonical_from_venue(&self, venue_symbol: &str) -> Option<String> {
        self.inner.venue_to_canonical.read().unwrap().get(venue_symbol).cloned()
    }

    fn decode_order_book(&self, symbol: &str, envelope: &Value) -> Option<(String, CanonicalRecord)> {
        let key = canonical_stream_key(Endpoint::OrderBook, symbol, None);
        let mut entry = self.inner.state.get_mut(&key)?;
        let book = entry.order_book_mut()?;

        let data = envelope.get("data")?;
        let bids = parse_levels(data.get("bids")?)?;
        let asks = parse_levels(data.get("asks")?)?;
        let last_update_id = chrono::Utc::now().timestamp_millis();
        book.load_snapshot(last_update_id, &bids, &asks);

        let canon = book.to_canonical(Endpoint::OrderBook, "bingx", symbol, 0, OrderBookEventType::Snapshot, self.inner.result_max_len);
        Some((key, CanonicalRecord::OrderBook(canon)))
    }

    fn decode_kline(&self, symbol: &str, envelope: &Value) -> Option<(String, CanonicalRecord)> {
        let key = canonical_stream_key(Endpoint::Kline, symbol, Some(Interval::OneMinute));
        let mut entry = self.inner.state.get_mut(&key)?;
        let acc = entry.kline_mut()?;

        let data = envelope.get("data")?;
        let last_update_id = data.get("E")?.as_i64()?;
        let bar = data.get("K")?;
        let open_time = bar.get("t")?.as_i64()?;
        let close_time = bar.get("T")?.as_i64()?;

        acc.upsert(KlineBar {
            endpoint: Endpoint::Kline,
            exchange: "bingx".to_string(),
            symbol: symbol.to_string(),
            interval: Interval::OneMinute,
            last_update_id,
            open_time,
            close_time,
            open_time_date: format_millis(open_time),
            close_time_date: format_millis(close_time),
            open: bar.get("o")?.as_str()?.to_string(),
            close: bar.get("c")?.as_str()?.to_string(),
            hight: bar.get("h")?.as_str()?.to_string(),
            low: bar.get("l")?.as_str()?.to_string(),
            volume: bar.get("v")?.as_str()?.to_string(),
            // Bingx's kline push carries no explicit closed/confirmed flag.
            is_closed: false,
            is_confirmed: None,
        });
        let out = acc.query(self.inner.result_max_len);
        Some((key, CanonicalRecord::Klines(out)))
    }

    fn decode_trades(&self, symbol: &str, envelope: &Value) -> Option<(String, CanonicalRecord)> {
        let key = canonical_stream_key(Endpoint::Trades, symbol, None);
        let mut entry = self.inner.state.get_mut(&key)?;
        let fifo = entry.trades_mut()?;

        let event_time = envelope.get("timestamp")?.as_i64()?;
        let items = envelope.get("data")?.as_array()?;
        for item in items.iter().rev() {
            let trade_time = item.get("time")?.as_i64()?;
            let buyer_maker = item.get("buyerMaker")?.as_bool()?;
            fifo.push(Trade {
                endpoint: Endpoint::Trades,
                exchange: "bingx".to_string(),
                symbol: symbol.to_string(),
                event_time,
                trade_id: item.get("id")?.to_string(),
                price: item.get("price")?.as_str()?.to_string(),
                quantity: item.get("qty")?.as_str()?.to_string(),
                trade_time,
                trade_time_date: format_millis(trade_time),
                side_of_taker: if buyer_maker { TakerSide::Sell } else { TakerSide::Buy },
            });
        }
        let out = fifo.query(self.inner.result_max_len);
        Some((key, CanonicalRecord::Trades(out)))
    }

    fn decode_ticker(&self, symbol: &str, envelope: &Value) -> Option<(String, CanonicalRecord)> {
        let key = canonical_stream_key(Endpoint::Ticker, symbol, None);
        let event_time = envelope.get("timestamp")?.as_i64()?;
        let data = envelope.get("data")?.as_array()?.first()?;
        let ticker = crate::record::Ticker {
            endpoint: Endpoint::Ticker,
            exchange: "bingx".to_string(),
            symbol: symbol.to_string(),
            event_time,
            price_change: String::new(),
            price_change_percent: String::new(),
            weighted_average_price: String::new(),
            last_price: data.get("lastPrice")?.as_str()?.to_string(),
            last_quantity: String::new(),
            best_bid_price: String::new(),
            best_bid_quantity: String::new(),
            best_ask_price: String::new(),
            best_ask_quantity: String::new(),
            open_price: data.get("openPrice")?.as_str()?.to_string(),
            high_price: data.get("highPrice")?.as_str()?.to_string(),
            low_price: data.get("lowPrice")?.as_str()?.to_string(),
            total_traded_base_asset_volume: data.get("volume")?.as_str()?.to_string(),
            total_traded_quote_asset_volume: data.get("quoteVolume")?.as_str()?.to_string(),
            statistics_open_time: data.get("openTime")?.as_i64()?,
            statistics_close_time: data.get("closeTime")?.as_i64()?,
            total_number_of_trades: 0,
        };
        Some((key, CanonicalRecord::Ticker(ticker)))
    }

    /// Background round robin over every registered trades/ticker stream,
    /// spaced at least [`POLL_MIN_SPACING`] apart, publishing synthetic
    /// frames into `inner.relay` in the same envelope shape the decode path
    /// expects from the WebSocket.
    async fn poll_loop(inner: Arc<Inner>, stop: Arc<AtomicBool>) {
        while !stop.load(Ordering::SeqCst) {
            let targets = inner.poll_targets.read().unwrap().clone();
            if targets.is_empty() {
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                continue;
            }

            for target in targets {
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                let started = tokio::time::Instant::now();
                let venue_symbol = urlencoding::encode(&Self::venue_symbol(&target.symbol)).into_owned();
                let url = match target.endpoint {
                    // Bingx has no functional sandbox (`Exchange::has_testmode`
                    // excludes it), so the poller always hits production.
                    Endpoint::Trades => format!(
                        "https://open-api.bingx.com/openApi/spot/v1/market/trades?symbol={venue_symbol}&limit=100"
                    ),
                    Endpoint::Ticker => {
                        let ts = chrono::Utc::now().timestamp_millis();
                        format!(
                            "https://open-api.bingx.com/openApi/spot/v1/ticker/24hr?timestamp={ts}&symbol={venue_symbol}"
                        )
                    }
                    _ => continue,
                };

                if let Some(envelope) = inner.rest.get_json::<Value>(&url).await {
                    if envelope.get("code").and_then(Value::as_i64) == Some(0) {
                        let data_type = format!(
                            "{venue_symbol}@{}",
                            if target.endpoint == Endpoint::Trades { "trades" } else { "ticker" }
                        );
                        let frame = serde_json::json!({
                            "code": 0,
                            "data": envelope.get("data"),
                            "timestamp": envelope.get("timestamp"),
                            "dataType": data_type,
                            "success": true,
                        })
                        .to_string();
                        inner.relay.publish(RawFrame::Text(frame));
                    }
                }

                let elapsed = started.elapsed();
                if elapsed < POLL_MIN_SPACING {
                    tokio::time::sleep(POLL_MIN_SPACING - elapsed).await;
                }
            }
        }
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
impl Adapter for BingxAdapter {
    fn api_url(&self) -> String {
        "https://open-api.bingx.com".to_string()
    }

    fn websocket_url(&self) -> String {
        "wss://open-api-ws.bingx.com/market".to_string()
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
        let on_open = match descriptor.endpoint {
            Endpoint::OrderBook => Some(format!("{venue_symbol}@depth100")),
            Endpoint::Kline => {
                let token = descriptor.interval.and_then(Self::interval_token).unwrap_or("1min");
                Some(format!("{venue_symbol}@kline_{token}"))
            }
            Endpoint::Trades | Endpoint::Ticker => None,
        };

        let id = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default().to_string();
        let (on_open, on_close) = match on_open {
            Some(data_type) => (
                Some(FrameList::One(
                    serde_json::json!({"id": id, "reqType": "sub", "dataType": data_type}).to_string(),
                )),
                Some(FrameList::One(
                    serde_json::json!({"id": id, "reqType": "unsub", "dataType": data_type}).to_string(),
                )),
            ),
            None => (None, None),
        };

        SubscriptionPlan {
            url_suffix: String::new(),
            on_open,
            on_close,
            ping_interval: None,
            ping_timeout: None,
        }
    }

    async fn decode(&self, frame: RawFrame) -> DecodeOutcome {
        let text = match frame {
            RawFrame::Text(text) => text,
            RawFrame::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(err) => {
                    warn!(error = %err, "bingx binary frame was not valid utf8 after inflate");
                    return DecodeOutcome::Ignored;
                }
            },
        };

        let envelope: Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(err) => {
                warn!(error = %err, "failed to parse bingx frame as json");
                return DecodeOutcome::Ignored;
            }
        };

        if let (Some(ping), Some(time)) = (envelope.get("ping"), envelope.get("time")) {
            let reply = serde_json::json!({"pong": ping, "time": time}).to_string();
            return DecodeOutcome::Reply(reply);
        }

        if envelope.get("success").and_then(Value::as_bool) != Some(true) {
            return DecodeOutcome::Ignored;
        }
        let Some(data_type) = envelope.get("dataType").and_then(Value::as_str) else {
            return DecodeOutcome::Ignored;
        };
        let Some((venue_symbol, suffix)) = data_type.split_once('@') else {
            return DecodeOutcome::Ignored;
        };
        let Some(symbol) = self.canonical_from_venue(venue_symbol) else {
            debug!(venue_symbol, "unknown symbol in bingx frame");
            return DecodeOutcome::Ignored;
        };

        let decoded = if suffix.starts_with("depth") {
            self.decode_order_book(&symbol, &envelope)
        } else if suffix.starts_with("kline") {
            self.decode_kline(&symbol, &envelope)
        } else if suffix.starts_with("trades") {
            self.decode_trades(&symbol, &envelope)
        } else if suffix.starts_with("ticker") {
            self.decode_ticker(&symbol, &envelope)
        } else {
            None
        };

        match decoded {
            Some((key, record)) => DecodeOutcome::Record(key, record),
            None => DecodeOutcome::Ignored,
        }
    }

    fn uses_gzip(&self) -> bool {
        true
    }

    fn reset_transient_state(&self) {
        for mut entry in self.inner.state.iter_mut() {
            if let StreamState::OrderBook(book) = entry.value_mut() {
                *book = OrderBook::new();
            }
        }
    }

    async fn start(&self) {
        self.poll_stop.store(false, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        let stop = Arc::clone(&self.poll_stop);
        let handle = tokio::spawn(Self::poll_loop(inner, stop));
        *self.poll_handle.lock().await = Some(handle);
    }

    fn relay_subscribe(&self) -> Option<tokio::sync::broadcast::Receiver<RawFrame>> {
        Some(self.inner.relay.subscribe())
    }

    async fn stop(&self) {
        self.poll_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.poll_handle.lock().await.take() {
            handle.abort();
        }
    }

    fn exchange_name(&self) -> &'static str {
        "bingx"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> BingxAdapter {
        let a = BingxAdapter::new(false, 5, 10);
        a.register(StreamDescriptor::new(Endpoint::OrderBook, "BTC/USDT"));
        a.register(StreamDescriptor::new(Endpoint::Trades, "BTC/USDT"));
        a.inner.venue_to_canonical.write().unwrap().insert("BTC-USDT".to_string(), "BTC/USDT".to_string());
        a
    }

    #[tokio::test]
    async fn receiver_driven_ping_gets_an_echoed_pong_reply() {
        let a = adapter();
        let ping = serde_json::json!({"ping": 7, "time": 123}).to_string();
        let outcome = a.decode(RawFrame::Text(ping)).await;
        match outcome {
            DecodeOutcome::Reply(reply) => {
                let v: Value = serde_json::from_str(&reply).unwrap();
                assert_eq!(v["pong"], 7);
                assert_eq!(v["time"], 123);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn order_book_push_is_always_a_full_snapshot() {
        let a = adapter();
        let frame = serde_json::json!({
            "code": 0, "success": true, "dataType": "BTC-USDT@depth100",
            "data": {"bids": [["100", "1"]], "asks": [["101", "1"]]}
        })
        .to_string();
        let outcome = a.decode(RawFrame::Text(frame)).await;
        match outcome {
            DecodeOutcome::Record(_, CanonicalRecord::OrderBook(book)) => {
                assert!(matches!(book.kind, OrderBookEventType::Snapshot));
                assert_eq!(book.diff_update_id, 0);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn relay_published_trade_frame_dedupes_by_trade_id() {
        let a = adapter();
        let frame = serde_json::json!({
            "code": 0, "success": true, "dataType": "BTC-USDT@trades", "timestamp": 1,
            "data": [{"id": 1, "price": "1", "qty": "1", "time": 1, "buyerMaker": false}]
        })
        .to_string();
        a.decode(RawFrame::Text(frame.clone())).await;
        let outcome = a.decode(RawFrame::Text(frame)).await;
        match outcome {
            DecodeOutcome::Record(_, CanonicalRecord::Trades(trades)) => assert_eq!(trades.len(), 1),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
