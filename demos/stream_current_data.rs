use std::time::Duration;

use ccxw_rs::{Endpoint, Exchange, Facade, FacadeConfig, Interval, StreamDescriptor};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let streams = vec![
        StreamDescriptor::new(Endpoint::OrderBook, "BTC/USDT"),
        StreamDescriptor::new(Endpoint::Trades, "BTC/USDT"),
        StreamDescriptor::new(Endpoint::Ticker, "BTC/USDT"),
        StreamDescriptor::new(Endpoint::Kline, "BTC/USDT").with_interval(Interval::OneMinute),
    ];

    let config = FacadeConfig::new(Exchange::Binance, streams.clone()).result_max_len(5);
    let mut facade = Facade::new(config)?;
    facade.start().await?;

    loop {
        tokio::time::sleep(Duration::from_secs(2)).await;

        for descriptor in &streams {
            match facade.get_current_data(descriptor) {
                Some(record) => tracing::info!(?descriptor, ?record, "current data"),
                None => tracing::debug!(?descriptor, "no data yet"),
            }
        }

        if !facade.is_connections_ok() {
            tracing::warn!("connections stale");
        }
    }
}
