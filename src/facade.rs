//! The public entry point: one `Facade` per exchange connection, owning one
//! [`crate::adapter::Adapter`] and one [`SnapshotStore`].
//!
//! Most venues drive their whole stream list over a single WebSocket
//! connection. OKX is the exception: order book, trades and ticker live on
//! `/public` while kline lives on `/business`, two physically separate
//! connections. `Facade::new` groups the registered streams by
//! `subscription_plan().url_suffix` and opens one `Transport` per distinct
//! suffix, so every other venue gets exactly one connection for free.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::adapter::Adapter;
use crate::config::{Exchange, FacadeConfig};
use crate::error::{CcxwError, Result};
use crate::record::{CanonicalRecord, Endpoint, StreamDescriptor};
use crate::exchanges;
use crate::store::SnapshotStore;
use crate::transport::Transport;

/// Order-book staleness bound: 5 * 60s.
const ORDER_BOOK_STALENESS: Duration = Duration::from_secs(5 * 60);
/// Trades/ticker staleness bound: 9 * 5 * 60s.
const TRADE_TICKER_STALENESS: Duration = Duration::from_secs(9 * 5 * 60);

/// A running (or stopped) connection to one exchange, streaming zero or more
/// registered [`StreamDescriptor`]s into an in-process snapshot store.
pub struct Facade {
    exchange: Exchange,
    adapter: Arc<dyn Adapter>,
    store: Arc<SnapshotStore>,
    stop_flag: Arc<AtomicBool>,
    transport_handles: Vec<tokio::task::JoinHandle<()>>,
    streams: Vec<StreamDescriptor>,
    stream_keys: Vec<String>,
    debug: bool,
    start_time: Instant,
}

impl Facade {
    /// Validates `config`, builds the venue adapter, and registers every
    /// stream. Does not connect; call [`Facade::start`] for that.
    pub fn new(config: FacadeConfig) -> Result<Self> {
        let config = config.validate()?;

        if config.testmode && !config.exchange.has_testmode() {
            warn!(exchange = config.exchange.as_str(), "no functional sandbox for this venue; using production");
        }

        let adapter = exchanges::build(
            config.exchange,
            &config.streams,
            config.testmode,
            config.result_max_len,
            config.data_max_len,
        );

        let store = Arc::new(SnapshotStore::new());
        let stream_keys: Vec<String> = config.streams.iter().map(|s| s.stream_key()).collect();
        for key in &stream_keys {
            store.declare(key);
        }

        Ok(Self {
            exchange: config.exchange,
            adapter,
            store,
            stop_flag: Arc::new(AtomicBool::new(false)),
            transport_handles: Vec::new(),
            streams: config.streams,
            stream_keys,
            debug: config.debug,
            start_time: Instant::now(),
        })
    }

    /// Starts the adapter's background workers (if any) and opens one
    /// `Transport` per distinct `url_suffix` among the registered streams.
    pub async fn start(&mut self) -> Result<()> {
        self.adapter.start().await;

        let mut groups: HashMap<String, Vec<&StreamDescriptor>> = HashMap::new();
        for descriptor in &self.streams {
            let plan = self.adapter.subscription_plan(descriptor);
            groups.entry(plan.url_suffix).or_default().push(descriptor);
        }

        if groups.is_empty() {
            return Err(CcxwError::Config("no streams registered to start".into()));
        }

        for (suffix, descriptors) in groups {
            let mut on_open = Vec::new();
            let mut on_close = Vec::new();
            let mut ping_interval = None;
            let mut ping_timeout = None;

            for descriptor in &descriptors {
                let plan = self.adapter.subscription_plan(descriptor);
                if let Some(frames) = plan.on_open {
                    on_open.extend(frames.into_vec());
                }
                if let Some(frames) = plan.on_close {
                    on_close.extend(frames.into_vec());
                }
                ping_interval = ping_interval.or(plan.ping_interval);
                ping_timeout = ping_timeout.or(plan.ping_timeout);
            }

            let url = format!("{}{}", self.adapter.websocket_url(), suffix);
            info!(exchange = self.exchange.as_str(), %url, streams = descriptors.len(), "opening connection");

            let transport = Transport::new(
                Arc::clone(&self.adapter),
                Arc::clone(&self.store),
                url,
                on_open,
                on_close,
                ping_interval,
                ping_timeout,
                Arc::clone(&self.stop_flag),
                self.debug,
            );

            self.transport_handles.push(tokio::spawn(transport.run()));
        }

        Ok(())
    }

    /// Signals every transport to close and waits up to `grace` for them to
    /// join, then stops the adapter's background workers.
    pub async fn stop(&mut self, grace: Duration) -> Result<()> {
        self.stop_flag.store(true, Ordering::SeqCst);

        let deadline = tokio::time::Instant::now() + grace;
        for handle in self.transport_handles.drain(..) {
            match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(error = %err, "transport task panicked"),
                Err(_) => return Err(CcxwError::ShutdownTimeout(grace)),
            }
        }

        self.adapter.stop().await;
        Ok(())
    }

    /// Returns the latest canonical record for one stream, or `None` if
    /// nothing has arrived yet.
    pub fn get_current_data(&self, descriptor: &StreamDescriptor) -> Option<CanonicalRecord> {
        self.store.get(&descriptor.stream_key())
    }

    /// The exchange's full tradable symbol catalog, canonical `BASE/QUOTE`.
    pub async fn get_exchange_full_list_symbols(&self, sorted: bool) -> Result<Vec<String>> {
        self.adapter.full_symbol_list(sorted).await
    }

    pub async fn is_symbol_supported(&self, canonical_symbol: &str) -> bool {
        self.adapter.is_symbol_supported(canonical_symbol).await
    }

    /// `true` if every registered stream is within its endpoint-specific
    /// staleness bound: order book 5·60s, kline 5·interval, trades/ticker
    /// 9·5·60s. A stream that has never produced a record is measured
    /// against `start_time` instead of `last_seen`, so a connection still
    /// warming up isn't reported unhealthy before its first record is due.
    pub fn is_connections_ok(&self) -> bool {
        let now = Instant::now();
        self.streams.iter().all(|descriptor| {
            let bound = Self::staleness_bound(descriptor);
            let key = descriptor.stream_key();
            let since = self.store.last_seen(&key).unwrap_or(self.start_time);
            now.duration_since(since) <= bound
        })
    }

    fn staleness_bound(descriptor: &StreamDescriptor) -> Duration {
        match descriptor.endpoint {
            Endpoint::OrderBook => ORDER_BOOK_STALENESS,
            Endpoint::Kline => descriptor.interval.map(|i| i.duration() * 5).unwrap_or(TRADE_TICKER_STALENESS),
            Endpoint::Trades | Endpoint::Ticker => TRADE_TICKER_STALENESS,
        }
    }

    pub fn exchange(&self) -> Exchange {
        self.exchange
    }

    pub fn stream_keys(&self) -> &[String] {
        &self.stream_keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Endpoint, Interval};

    fn config() -> FacadeConfig {
        FacadeConfig::new(Exchange::Binance, vec![StreamDescriptor::new(Endpoint::Trades, "BTC/USDT")])
    }

    #[test]
    fn new_rejects_empty_stream_list() {
        let cfg = FacadeConfig::new(Exchange::Binance, vec![]);
        assert!(matches!(Facade::new(cfg), Err(CcxwError::Config(_))));
    }

    #[test]
    fn new_builds_a_facade_with_declared_stream_keys() {
        let facade = Facade::new(config()).unwrap();
        assert_eq!(facade.stream_keys(), &["stream_trades_btcusdt_none".to_string()]);
        assert_eq!(facade.exchange(), Exchange::Binance);
    }

    #[test]
    fn is_connections_ok_true_during_warmup_before_any_record_has_arrived() {
        let facade = Facade::new(config()).unwrap();
        assert!(facade.is_connections_ok());
    }

    #[test]
    fn staleness_bound_is_endpoint_specific() {
        let order_book = StreamDescriptor::new(Endpoint::OrderBook, "BTC/USDT");
        let trades = StreamDescriptor::new(Endpoint::Trades, "BTC/USDT");
        let ticker = StreamDescriptor::new(Endpoint::Ticker, "BTC/USDT");
        let kline = StreamDescriptor::new(Endpoint::Kline, "BTC/USDT").with_interval(Interval::OneMinute);

        assert_eq!(Facade::staleness_bound(&order_book), Duration::from_secs(5 * 60));
        assert_eq!(Facade::staleness_bound(&trades), Duration::from_secs(9 * 5 * 60));
        assert_eq!(Facade::staleness_bound(&ticker), Duration::from_secs(9 * 5 * 60));
        assert_eq!(Facade::staleness_bound(&kline), Interval::OneMinute.duration() * 5);
    }

    #[test]
    fn is_connections_ok_true_once_every_stream_has_a_fresh_record() {
        let facade = Facade::new(config()).unwrap();
        facade.store.set(
            "stream_trades_btcusdt_none".to_string(),
            CanonicalRecord::Trades(Vec::new()),
        );
        assert!(facade.is_connections_ok());
    }
}
