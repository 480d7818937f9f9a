//! Binance (and, via [`super::binanceus`], Binance-US) adapter.
//!
//! Grounded on `ccxw/binance.py`: `/ws` raw stream endpoint, `SUBSCRIBE`
//! control frames, dispatch by the `"e"` field, and the gap-detect +
//! snapshot-resync order-book algorithm.

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

use super::common::{split_by_known_quotes, StreamState, TtlCache};

const KNOWN_QUOTES: &[&str] = &[
    "USDT", "BUSD", "USDC", "FDUSD", "TUSD", "DAI", "BTC", "ETH", "BNB", "TRY", "EUR", "GBP", "USD",
];

/// Parameterizes [`BinanceAdapter`] for the two near-identical venues
/// so Binance-US reuses the same decode logic with different base URLs
/// and REST depth limit.
#[derive(Clone, Copy)]
pub struct BinanceFlavor {
    pub exchange_name: &'static str,
    pub ws_url: &'static str,
    pub ws_url_test: Option<&'static str>,
    pub api_url: &'static str,
    pub api_url_test: Option<&'static str>,
    pub depth_limit: u32,
}

pub const BINANCE: BinanceFlavor = BinanceFlavor {
    exchange_name: "binance",
    ws_url: "wss://stream.binance.com:9443/ws",
    ws_url_test: Some("wss://testnet.binance.vision/ws"),
    api_url: "https://api.binance.com/api/v3",
    api_url_test: Some("https://testnet.binance.vision/api/v3"),
    depth_limit: 500,
};

pub const BINANCE_US: BinanceFlavor = BinanceFlavor {
    exchange_name: "binanceus",
    ws_url: "wss://stream.binance.us:9443/ws",
    ws_url_test: None,
    api_url: "https://api.binance.us/api/v3",
    api_url_test: None,
    depth_limit: 1000,
};

pub struct BinanceAdapter {
    flavor: BinanceFlavor,
    testmode: bool,
    result_max_len: usize,
    data_max_len: usize,
    rest: crate::rest::RestClient,
    symbol_cache: TtlCache<Vec<String>>,
    venue_to_canonical: RwLock<HashMap<String, String>>,
    state: DashMap<String, StreamState>,
    descriptors: DashMap<String, StreamDescriptor>,
}

impl BinanceAdapter {
    pub fn new(flavor: BinanceFlavor, testmode: bool, result_max_len: usize, data_max_len: usize) -> Self {
        Self {
            flavor,
            testmode,
            result_max_len,
            data_max_len,
            rest: crate::rest::RestClient::new(),
            symbol_cache: TtlCache::new(super::common::EXCHANGE_INFO_TTL),
            venue_to_canonical: RwLock::new(HashMap::new()),
            state: DashMap::new(),
            descriptors: DashMap::new(),
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
        self.state.insert(key.clone(), state);
        self.descriptors.insert(key, descriptor);
    }

    fn venue_symbol(symbol: &str) -> String {
        symbol.replace('/', "").to_uppercase()
    }

    async fn fetch_exchange_info(&self) -> Option<Value> {
        let url = format!("{}/exchangeInfo", self.api_url());
        self.rest.get_json::<Value>(&url).await
    }

    async fn refresh_symbol_cache(&self) -> Option<Vec<String>> {
        self.symbol_cache
            .get_or_fetch(|| async {
                let info = self.fetch_exchange_info().await?;
                let symbols = info.get("symbols")?.as_array()?;
                let mut canonical = Vec::new();
                let mut map = self.venue_to_canonical.write().unwrap();
                for entry in symbols {
                    let base = entry.get("baseAsset")?.as_str()?.to_uppercase();
                    let quote = entry.get("quoteAsset")?.as_str()?.to_uppercase();
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
        if let Some(canonical) = self.venue_to_canonical.read().unwrap().get(venue_symbol) {
            return Some(canonical.clone());
        }
        split_by_known_quotes(venue_symbol, KNOWN_QUOTES)
            .map(|(base, quote)| format!("{base}/{quote}"))
    }

    async fn init_order_book(&self, symbol: &str) -> Option<(i64, Vec<[String; 2]>, Vec<[String; 2]>)> {
        let url = format!(
            "{}/depth?symbol={}&limit={}",
            self.api_url(),
            Self::venue_symbol(symbol),
            self.flavor.depth_limit
        );
        let data: Value = self.rest.get_json(&url).await?;
        let last_update_id = data.get("lastUpdateId")?.as_i64()?;
        let bids = parse_levels(data.get("bids")?)?;
        let asks = parse_levels(data.get("asks")?)?;
        Some((last_update_id, bids, asks))
    }

    async fn decode_order_book(&self, symbol: &str, event: &Value) -> Option<(String, CanonicalRecord)> {
        let key = canonical_stream_key(Endpoint::OrderBook, symbol, None);
        let mut entry = self.state.get_mut(&key)?;
        let book = entry.order_book_mut()?;

        let u = event.get("u")?.as_i64()?;
        let update_start = event.get("U")?.as_i64()?;
        let bids = parse_levels(event.get("b")?)?;
        let asks = parse_levels(event.get("a")?)?;

        let (kind, diff_update_id) = if !book.is_initialized() || (update_start - book.last_update_id) > 1 {
            drop(entry);
            let (snapshot_id, snap_bids, snap_asks) = self.init_order_book(symbol).await?;
            let mut entry = self.state.get_mut(&key)?;
            let book = entry.order_book_mut()?;
            book.load_snapshot(snapshot_id, &snap_bids, &snap_asks);
            book.apply_levels(&bids, &asks);
            book.last_update_id = u;
            drop(entry);
            (OrderBookEventType::Snapshot, 0)
        } else {
            book.apply_levels(&bids, &asks);
            let diff = update_start - book.last_update_id;
            book.last_update_id = u;
            drop(entry);
            (OrderBookEventType::Update, diff)
        };

        let entry = self.state.get(&key)?;
        let book = match entry.value() {
            StreamState::OrderBook(b) => b,
            _ => return None,
        };
        let canon = book.to_canonical(Endpoint::OrderBook, self.flavor.exchange_name, symbol, diff_update_id, kind, self.result_max_len);
        Some((key, CanonicalRecord::OrderBook(canon)))
    }

    fn decode_kline(&self, symbol: &str, event: &Value) -> Option<(String, CanonicalRecord)> {
        let k = event.get("k")?;
        let interval = Interval::from_str(k.get("i")?.as_str()?)?;
        let key = canonical_stream_key(Endpoint::Kline, symbol, Some(interval));
        let mut entry = self.state.get_mut(&key)?;
        let acc = entry.kline_mut()?;

        let open_time = k.get("t")?.as_i64()?;
        let close_time = k.get("T")?.as_i64()?;
        let bar = KlineBar {
            endpoint: Endpoint::Kline,
            exchange: self.flavor.exchange_name.to_string(),
            symbol: symbol.to_string(),
            interval,
            last_update_id: event.get("E")?.as_i64()?,
            open_time,
            close_time,
            open_time_date: format_millis(open_time),
            close_time_date: format_millis(close_time),
            open: k.get("o")?.as_str()?.to_string(),
            close: k.get("c")?.as_str()?.to_string(),
            hight: k.get("h")?.as_str()?.to_string(),
            low: k.get("l")?.as_str()?.to_string(),
            volume: k.get("v")?.as_str()?.to_string(),
            is_closed: k.get("x")?.as_bool()?,
            is_confirmed: None,
        };
        acc.upsert(bar);
        let bars = acc.query(self.result_max_len);
        Some((key, CanonicalRecord::Klines(bars)))
    }

    fn decode_trade(&self, symbol: &str, event: &Value) -> Option<(String, CanonicalRecord)> {
        let key = canonical_stream_key(Endpoint::Trades, symbol, None);
        let mut entry = self.state.get_mut(&key)?;
        let fifo = entry.trades_mut()?;

        let trade_time = event.get("T")?.as_i64()?;
        let is_buyer_maker = event.get("m")?.as_bool()?;
        let trade = Trade {
            endpoint: Endpoint::Trades,
            exchange: self.flavor.exchange_name.to_string(),
            symbol: symbol.to_string(),
            event_time: event.get("E")?.as_i64()?,
            trade_id: event.get("t")?.to_string(),
            price: event.get("p")?.as_str()?.to_string(),
            quantity: event.get("q")?.as_str()?.to_string(),
            trade_time,
            trade_time_date: format_millis(trade_time),
            side_of_taker: if is_buyer_maker { TakerSide::Buy } else { TakerSide::Sell },
        };
        fifo.push(trade);
        let trades = fifo.query(self.result_max_len);
        Some((key, CanonicalRecord::Trades(trades)))
    }

    fn decode_ticker(&self, symbol: &str, event: &Value) -> Option<(String, CanonicalRecord)> {
        let key = canonical_stream_key(Endpoint::Ticker, symbol, None);
        let ticker = crate::record::Ticker {
            endpoint: Endpoint::Ticker,
            exchange: self.flavor.exchange_name.to_string(),
            symbol: symbol.to_string(),
            event_time: event.get("E")?.as_i64()?,
            price_change: event.get("p")?.as_str()?.to_string(),
            price_change_percent: event.get("P")?.as_str()?.to_string(),
            weighted_average_price: event.get("w")?.as_str()?.to_string(),
            last_price: event.get("c")?.as_str()?.to_string(),
            last_quantity: event.get("Q")?.as_str()?.to_string(),
            best_bid_price: event.get("b")?.as_str()?.to_string(),
            best_bid_quantity: event.get("B")?.as_str()?.to_string(),
            best_ask_price: event.get("a")?.as_str()?.to_string(),
            best_ask_quantity: event.get("A")?.as_str()?.to_string(),
            open_price: event.get("o")?.as_str()?.to_string(),
            high_price: event.get("h")?.as_str()?.to_string(),
            low_price: event.get("l")?.as_str()?.to_string(),
            total_traded_base_asset_volume: event.get("v")?.as_str()?.to_string(),
            total_traded_quote_asset_volume: event.get("q")?.as_str()?.to_string(),
            statistics_open_time: event.get("O")?.as_i64()?,
            statistics_close_time: event.get("C")?.as_i64()?,
            total_number_of_trades: event.get("n")?.as_i64()?,
        };
        Some((key, CanonicalRecord::Ticker(ticker)))
    }
}

fn parse_levels(value: &Value) -> Option<Vec<[String; 2]>> {
    let arr = value.as_array()?;
    let mut out = Vec::with_capacity(arr.len());
    for level in arr {
        let pair = level.as_array()?;
        let price = pair.first()?.as_str()?.to_string();
        let size = pair.get(1)?.as_str()?.to_string();
        out.push([price, size]);
    }
    Some(out)
}

fn format_millis(ms: i64) -> String {
    let secs = ms / 1000;
    let naive = chrono::DateTime::from_timestamp(secs, 0).unwrap_or_default();
    naive.format("%Y-%m-%d %H:%M:%S").to_string()
}

#[async_trait]
impl Adapter for BinanceAdapter {
    fn api_url(&self) -> String {
        if self.testmode {
            self.flavor.api_url_test.unwrap_or(self.flavor.api_url).to_string()
        } else {
            self.flavor.api_url.to_string()
        }
    }

    fn websocket_url(&self) -> String {
        if self.testmode {
            self.flavor.ws_url_test.unwrap_or(self.flavor.ws_url).to_string()
        } else {
            self.flavor.ws_url.to_string()
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
        Interval::from_str(venue_interval)
    }

    fn decanonicalize_interval(&self, interval: Interval) -> Option<String> {
        Some(interval.as_str().to_string())
    }

    fn subscription_plan(&self, descriptor: &StreamDescriptor) -> SubscriptionPlan {
        let venue_symbol = Self::venue_symbol(&descriptor.symbol).to_lowercase();
        let param = match descriptor.endpoint {
            Endpoint::OrderBook => format!("{venue_symbol}@depth@100ms"),
            Endpoint::Kline => {
                let interval = descriptor.interval.and_then(|i| self.decanonicalize_interval(i)).unwrap_or_else(|| "1m".into());
                format!("{venue_symbol}@kline_{interval}")
            }
            Endpoint::Trades => format!("{venue_symbol}@trade"),
            Endpoint::Ticker => format!("{venue_symbol}@ticker"),
        };

        let id = chrono::Utc::now().timestamp_millis();
        let subscribe = serde_json::json!({"method": "SUBSCRIBE", "params": [param], "id": id}).to_string();
        let unsubscribe = serde_json::json!({"method": "UNSUBSCRIBE", "params": [param], "id": id}).to_string();

        SubscriptionPlan {
            url_suffix: String::new(),
            on_open: Some(FrameList::One(subscribe)),
            on_close: Some(FrameList::One(unsubscribe)),
            ping_interval: None,
            ping_timeout: None,
        }
    }

    async fn decode(&self, frame: RawFrame) -> DecodeOutcome {
        let text = match frame {
            RawFrame::Text(text) => text,
            RawFrame::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => return DecodeOutcome::Ignored,
            },
        };

        let event: Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(err) => {
                warn!(error = %err, "failed to parse binance frame as json");
                return DecodeOutcome::Ignored;
            }
        };

        let Some(event_type) = event.get("e").and_then(Value::as_str) else {
            return DecodeOutcome::Ignored;
        };
        let Some(venue_symbol) = event.get("s").and_then(Value::as_str) else {
            return DecodeOutcome::Ignored;
        };
        let Some(symbol) = self.canonical_from_venue(venue_symbol) else {
            debug!(venue_symbol, "unknown symbol in binance frame");
            return DecodeOutcome::Ignored;
        };

        let decoded = match event_type {
            "depthUpdate" => self.decode_order_book(&symbol, &event).await,
            "kline" => self.decode_kline(&symbol, &event),
            "trade" => self.decode_trade(&symbol, &event),
            "24hrTicker" => self.decode_ticker(&symbol, &event),
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

    fn exchange_name(&self) -> &'static str {
        self.flavor.exchange_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::StreamDescriptor;

    fn adapter() -> BinanceAdapter {
        let a = BinanceAdapter::new(BINANCE, false, 5, 10);
        a.register(StreamDescriptor::new(Endpoint::OrderBook, "BTC/USDT"));
        a.register(StreamDescriptor::new(Endpoint::Trades, "BTC/USDT"));
        a.register(StreamDescriptor::new(Endpoint::Kline, "BTC/USDT").with_interval(Interval::OneMinute));
        a.register(StreamDescriptor::new(Endpoint::Ticker, "BTC/USDT"));
        a.venue_to_canonical
            .write()
            .unwrap()
            .insert("BTCUSDT".to_string(), "BTC/USDT".to_string());
        a
    }

    #[tokio::test]
    async fn decodes_trade_event_into_fifo() {
        let a = adapter();
        let frame = serde_json::json!({
            "e": "trade", "s": "BTCUSDT", "E": 1, "t": 5, "p": "100.5", "q": "0.01",
            "T": 1700000000000i64, "m": true
        })
        .to_string();

        let outcome = a.decode(RawFrame::Text(frame)).await;
        match outcome {
            DecodeOutcome::Record(key, CanonicalRecord::Trades(trades)) => {
                assert_eq!(key, "stream_trades_btcusdt_none");
                assert_eq!(trades.len(), 1);
                assert_eq!(trades[0].side_of_taker, TakerSide::Buy);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn order_book_update_diff_update_id_is_gap_from_stored_last_update_id() {
        let a = adapter();
        let key = canonical_stream_key(Endpoint::OrderBook, "BTC/USDT", None);
        {
            let mut entry = a.state.get_mut(&key).unwrap();
            let book = entry.order_book_mut().unwrap();
            book.load_snapshot(100, &[["30000".to_string(), "1".to_string()]], &[["30001".to_string(), "1".to_string()]]);
        }

        let event = serde_json::json!({
            "U": 101, "u": 102,
            "b": [["30000", "0"]], "a": [["30002", "2"]]
        });
        let (_, record) = a.decode_order_book("BTC/USDT", &event).await.unwrap();
        match record {
            CanonicalRecord::OrderBook(book) => {
                assert!(book.bids.is_empty());
                assert_eq!(book.asks, vec![["30001".to_string(), "1".to_string()], ["30002".to_string(), "2".to_string()]]);
                assert_eq!(book.last_update_id, 102);
                assert_eq!(book.diff_update_id, 1);
                assert!(matches!(book.kind, OrderBookEventType::Update));
            }
            other => panic!("unexpected record: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_event_type_is_ignored() {
        let a = adapter();
        let frame = serde_json::json!({"e": "somethingElse", "s": "BTCUSDT"}).to_string();
        let outcome = a.decode(RawFrame::Text(frame)).await;
        assert!(matches!(outcome, DecodeOutcome::Ignored));
    }

    #[tokio::test]
    async fn decodes_kline_event_and_overwrites_same_open_time() {
        let a = adapter();
        let frame = |open_time: i64, close_price: &str| {
            serde_json::json!({
                "e": "kline", "s": "BTCUSDT", "E": 1,
                "k": {
                    "t": open_time, "T": open_time + 59_999, "i": "1m",
                    "o": "100", "c": close_price, "h": "105", "l": "99", "v": "10", "x": false
                }
            })
            .to_string()
        };

        a.decode(RawFrame::Text(frame(1_700_000_000_000, "101"))).await;
        let outcome = a.decode(RawFrame::Text(frame(1_700_000_000_000, "102"))).await;

        match outcome {
            DecodeOutcome::Record(_, CanonicalRecord::Klines(bars)) => {
                assert_eq!(bars.len(), 1);
                assert_eq!(bars[0].close, "102");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
