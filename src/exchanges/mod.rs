//! Per-venue adapter implementations and the factory that picks one for a
//! [`crate::config::Exchange`].

pub mod binance;
pub mod binanceus;
pub mod bingx;
pub mod bybit;
pub mod common;
pub mod kucoin;
pub mod okx;

use std::sync::Arc;

use crate::adapter::Adapter;
use crate::config::Exchange;
use crate::record::StreamDescriptor;

/// Builds the adapter for `exchange` and registers every descriptor on it.
pub fn build(exchange: Exchange, streams: &[StreamDescriptor], testmode: bool, result_max_len: usize, data_max_len: usize) -> Arc<dyn Adapter> {
    match exchange {
        Exchange::Binance => {
            let adapter = binance::BinanceAdapter::new(binance::BINANCE, testmode, result_max_len, data_max_len);
            for s in streams {
                adapter.register(s.clone());
            }
            Arc::new(adapter)
        }
        Exchange::BinanceUs => {
            let adapter = binanceus::new(testmode, result_max_len, data_max_len);
            for s in streams {
                adapter.register(s.clone());
            }
            Arc::new(adapter)
        }
        Exchange::Bybit => {
            let adapter = bybit::BybitAdapter::new(testmode, result_max_len, data_max_len);
            for s in streams {
                adapter.register(s.clone());
            }
            Arc::new(adapter)
        }
        Exchange::Bingx => {
            let adapter = bingx::BingxAdapter::new(testmode, result_max_len, data_max_len);
            for s in streams {
                adapter.register(s.clone());
            }
            Arc::new(adapter)
        }
        Exchange::Kucoin => {
            let adapter = kucoin::KucoinAdapter::new(testmode, result_max_len, data_max_len);
            for s in streams {
                adapter.register(s.clone());
            }
            Arc::new(adapter)
        }
        Exchange::Okx => {
            let adapter = okx::OkxAdapter::new(testmode, result_max_len, data_max_len);
            for s in streams {
                adapter.register(s.clone());
            }
            Arc::new(adapter)
        }
    }
}
