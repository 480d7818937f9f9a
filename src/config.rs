//! Constructor-only configuration: no environment variables
//! or files are read. [`FacadeConfig`] is validated entirely inside
//! [`crate::Facade::new`].

use crate::error::{CcxwError, Result};
use crate::record::StreamDescriptor;

/// Supported exchange identifiers.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Exchange {
    Binance,
    BinanceUs,
    Bybit,
    Bingx,
    Kucoin,
    Okx,
}

impl Exchange {
    pub fn as_str(&self) -> &'static str {
        match self {
            Exchange::Binance => "binance",
            Exchange::BinanceUs => "binanceus",
            Exchange::Bybit => "bybit",
            Exchange::Bingx => "bingx",
            Exchange::Kucoin => "kucoin",
            Exchange::Okx => "okx",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "binance" => Exchange::Binance,
            "binanceus" => Exchange::BinanceUs,
            "bybit" => Exchange::Bybit,
            "bingx" => Exchange::Bingx,
            "kucoin" => Exchange::Kucoin,
            "okx" => Exchange::Okx,
            _ => return None,
        })
    }

    /// Per-venue ceiling on the number of streams one facade instance may
    /// register.
    pub fn max_streams(&self) -> usize {
        match self {
            Exchange::Bybit => 10,
            Exchange::Kucoin => 100,
            Exchange::BinanceUs => 1024,
            Exchange::Okx => 480,
            Exchange::Bingx => 1024,
            Exchange::Binance => 1024,
        }
    }

    /// Hard ceiling on `data_max_len` for this venue.
    pub fn data_max_len_ceiling(&self) -> usize {
        match self {
            Exchange::Bingx => 400,
            _ => 2500,
        }
    }

    /// Whether this venue provides a functional sandbox.
    pub fn has_testmode(&self) -> bool {
        matches!(self, Exchange::Binance | Exchange::BinanceUs | Exchange::Bybit | Exchange::Kucoin)
    }
}

/// Trading type; only `"SPOT"` is currently supported.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TradingType {
    Spot,
}

/// The validated construction arguments for [`crate::Facade::new`].
#[derive(Debug, Clone)]
pub struct FacadeConfig {
    pub exchange: Exchange,
    pub streams: Vec<StreamDescriptor>,
    pub trading_type: TradingType,
    pub testmode: bool,
    pub result_max_len: usize,
    pub data_max_len: usize,
    pub debug: bool,
}

impl FacadeConfig {
    pub fn new(exchange: Exchange, streams: Vec<StreamDescriptor>) -> Self {
        Self {
            exchange,
            streams,
            trading_type: TradingType::Spot,
            testmode: false,
            result_max_len: 5,
            data_max_len: 2500,
            debug: false,
        }
    }

    pub fn testmode(mut self, testmode: bool) -> Self {
        self.testmode = testmode;
        self
    }

    pub fn result_max_len(mut self, result_max_len: usize) -> Self {
        self.result_max_len = result_max_len;
        self
    }

    pub fn data_max_len(mut self, data_max_len: usize) -> Self {
        self.data_max_len = data_max_len;
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Clamps `data_max_len`/`result_max_len` to the documented bounds and
    /// validates the stream list, returning `CcxwError::Config` on the
    /// first violation.
    pub(crate) fn validate(mut self) -> Result<Self> {
        if self.streams.is_empty() {
            return Err(CcxwError::Config("at least one stream must be registered".into()));
        }

        let ceiling = self.exchange.data_max_len_ceiling();
        self.data_max_len = self.data_max_len.clamp(1, ceiling);
        self.result_max_len = self.result_max_len.clamp(1, self.data_max_len);

        if self.streams.len() > self.exchange.max_streams() {
            return Err(CcxwError::Config(format!(
                "{} supports at most {} streams per facade, got {}",
                self.exchange.as_str(),
                self.exchange.max_streams(),
                self.streams.len()
            )));
        }

        for stream in &self.streams {
            if stream.symbol.is_empty() || !stream.symbol.contains('/') {
                return Err(CcxwError::Config(format!(
                    "bad symbol: {:?}, expected canonical BASE/QUOTE",
                    stream.symbol
                )));
            }

            use crate::record::Endpoint;
            if stream.endpoint == Endpoint::Kline && stream.interval.is_none() {
                return Err(CcxwError::Config(
                    "kline streams require an interval".into(),
                ));
            }

            // Bingx only streams the 1-minute kline over WebSocket; anything else must be rejected here rather
            // than silently downgraded.
            if self.exchange == Exchange::Bingx && stream.endpoint == Endpoint::Kline {
                if stream.interval != Some(crate::record::Interval::OneMinute) {
                    return Err(CcxwError::Config(
                        "bingx only streams the 1m kline interval over websocket".into(),
                    ));
                }
            }
        }

        if !self.testmode || self.exchange.has_testmode() {
            Ok(self)
        } else {
            // No functional sandbox: fall back to production and continue
            //, the caller is warned via tracing in `Facade::new`.
            Ok(self)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Endpoint, StreamDescriptor};

    #[test]
    fn rejects_too_many_streams_for_bybit() {
        let streams: Vec<_> = (0..11)
            .map(|i| StreamDescriptor::new(Endpoint::Trades, format!("SYM{i}/USDT")))
            .collect();
        let cfg = FacadeConfig::new(Exchange::Bybit, streams);
        assert!(matches!(cfg.validate(), Err(CcxwError::Config(_))));
    }

    #[test]
    fn clamps_data_max_len_to_venue_ceiling() {
        let streams = vec![StreamDescriptor::new(Endpoint::Trades, "BTC/USDT")];
        let cfg = FacadeConfig::new(Exchange::Bingx, streams).data_max_len(5000);
        let cfg = cfg.validate().unwrap();
        assert_eq!(cfg.data_max_len, 400);
    }

    #[test]
    fn rejects_kline_stream_without_interval() {
        let streams = vec![StreamDescriptor::new(Endpoint::Kline, "BTC/USDT")];
        let cfg = FacadeConfig::new(Exchange::Binance, streams);
        assert!(matches!(cfg.validate(), Err(CcxwError::Config(_))));
    }

    #[test]
    fn rejects_bingx_kline_above_one_minute() {
        let streams = vec![StreamDescriptor::new(Endpoint::Kline, "BTC/USDT")
            .with_interval(crate::record::Interval::FiveMinutes)];
        let cfg = FacadeConfig::new(Exchange::Bingx, streams);
        assert!(matches!(cfg.validate(), Err(CcxwError::Config(_))));
    }
}
