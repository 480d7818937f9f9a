//! Unified multi-venue WebSocket market-data aggregation for crypto spot
//! exchanges: order book, kline, trades and 24hr ticker, normalized to one
//! canonical schema across Binance, Binance-US, Bybit, Bingx, Kucoin and
//! OKX.
//!
//! ```no_run
//! use ccxw_rs::{Endpoint, Exchange, Facade, FacadeConfig, StreamDescriptor};
//!
//! # async fn run() -> ccxw_rs::Result<()> {
//! let streams = vec![StreamDescriptor::new(Endpoint::Trades, "BTC/USDT")];
//! let mut facade = Facade::new(FacadeConfig::new(Exchange::Binance, streams))?;
//! facade.start().await?;
//!
//! let descriptor = StreamDescriptor::new(Endpoint::Trades, "BTC/USDT");
//! if let Some(record) = facade.get_current_data(&descriptor) {
//!     println!("{record:?}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod accumulate;
pub mod adapter;
pub mod config;
pub mod error;
pub mod exchanges;
pub mod facade;
pub mod orderbook;
pub mod record;
pub mod relay;
pub mod rest;
pub mod store;
pub mod transport;

pub use adapter::{Adapter, DecodeOutcome, FrameList, RawFrame, SubscriptionPlan};
pub use config::{Exchange, FacadeConfig, TradingType};
pub use error::{CcxwError, Result};
pub use facade::Facade;
pub use record::{
    CanonicalRecord, Endpoint, Interval, KlineBar, Level, OrderBookEventType, OrderBookSnapshot,
    StreamDescriptor, TakerSide, Ticker, Trade,
};
