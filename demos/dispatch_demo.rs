use tectonic_ingest::dispatch::{DispatcherConfig, ExchangeConfig};
use tectonic_ingest::Dispatcher;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let config = DispatcherConfig {
        tick_store_host: "127.0.0.1".to_string(),
        tick_store_port: 9001,
        exchanges: ExchangeConfig {
            poloniex_symbols: vec!["BTC_ETH".to_string()],
            bitmex_symbols: vec!["XBTUSD".to_string()],
            gdax_symbols: vec!["BTC-USD".to_string()],
        },
    };

    let dispatcher = Dispatcher::connect(config).await?;
    dispatcher.run().await?;
    Ok(())
}
