//! Binance-US adapter: same wire format as Binance, different base URLs and
//! no sandbox. Grounded on the observation in `ccxw/binance.py` that the
//! Binance-US integration only overrides connection parameters; decode
//! logic is shared verbatim with [`super::binance`].

use super::binance::{BinanceAdapter, BINANCE_US};

pub fn new(testmode: bool, result_max_len: usize, data_max_len: usize) -> BinanceAdapter {
    BinanceAdapter::new(BINANCE_US, testmode, result_max_len, data_max_len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::Adapter;

    #[test]
    fn uses_binance_us_hosts_not_binance_com() {
        let adapter = new(false, 5, 10);
        assert_eq!(adapter.websocket_url(), "wss://stream.binance.us:9443/ws");
        assert_eq!(adapter.api_url(), "https://api.binance.us/api/v3");
        assert_eq!(adapter.exchange_name(), "binanceus");
    }

    #[test]
    fn testmode_has_no_sandbox_and_falls_back_to_production_hosts() {
        let adapter = new(true, 5, 10);
        assert_eq!(adapter.websocket_url(), "wss://stream.binance.us:9443/ws");
        assert_eq!(adapter.api_url(), "https://api.binance.us/api/v3");
    }
}
