//! Fan-in dispatch from per-exchange ingests to a single TectonicDB client.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::exchanges::{bitmex, gdax, poloniex};
use crate::model::DeltaBatch;
use crate::tectonic;

/// Capacity of the bounded fan-in channel.
const CHANNEL_CAPACITY: usize = 1 << 16;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to connect to tick-store: {0}")]
    TickStoreConnect(#[source] tectonic::Error),

    #[error("Failed to ensure store {name:?} exists: {source}")]
    EnsureStore {
        name: String,
        #[source]
        source: tectonic::Error,
    },

    #[error("Bulk insert into {name:?} failed: {source}")]
    BulkInsert {
        name: String,
        #[source]
        source: tectonic::Error,
    },
}

/// One exchange's subscribed symbol list, keyed by the exchange identifier
/// used in the store name (`"poloniex"`, `"bitmex"`, `"gdax"`).
#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    pub poloniex_symbols: Vec<String>,
    pub bitmex_symbols: Vec<String>,
    pub gdax_symbols: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub tick_store_host: String,
    pub tick_store_port: u16,
    pub exchanges: ExchangeConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            tick_store_host: "127.0.0.1".to_string(),
            tick_store_port: 9001,
            exchanges: ExchangeConfig {
                poloniex_symbols: Vec::new(),
                bitmex_symbols: Vec::new(),
                gdax_symbols: Vec::new(),
            },
        }
    }
}

/// Owns the fan-in channel, the tick-store client, and the ingest task set.
/// Runs the startup sequence and the drain loop.
pub struct Dispatcher {
    config: DispatcherConfig,
    client: tectonic::Client,
}

impl Dispatcher {
    /// Connects the tick-store client. Fatal on failure.
    pub async fn connect(config: DispatcherConfig) -> Result<Self, Error> {
        let client = tectonic::Client::connect(&config.tick_store_host, config.tick_store_port)
            .await
            .map_err(Error::TickStoreConnect)?;
        Ok(Self { config, client })
    }

    /// Ensures an `exchange:symbol` store exists for every configured pair.
    async fn ensure_stores(&mut self) -> Result<(), Error> {
        let pairs = self
            .config
            .exchanges
            .poloniex_symbols
            .iter()
            .map(|s| (poloniex::EXCHANGE_NAME, s))
            .chain(self.config.exchanges.bitmex_symbols.iter().map(|s| (bitmex::EXCHANGE_NAME, s)))
            .chain(self.config.exchanges.gdax_symbols.iter().map(|s| (gdax::EXCHANGE_NAME, s)));

        for (exchange, symbol) in pairs {
            let name = format!("{exchange}:{symbol}");
            let exists = self
                .client
                .exists(&name)
                .await
                .map_err(|source| Error::EnsureStore { name: name.clone(), source })?;
            if !exists {
                self.client
                    .create(&name)
                    .await
                    .map_err(|source| Error::EnsureStore { name: name.clone(), source })?;
                info!(store = %name, "created tick-store");
            }
        }
        Ok(())
    }

    /// Spawns each configured ingest's receive loop as an independent task.
    /// Each task owns its own sending half of `tx`; an ingest's fatal error
    /// (bootstrap failure) ends only that task.
    fn spawn_ingests(&self, tx: mpsc::Sender<DeltaBatch>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        if !self.config.exchanges.poloniex_symbols.is_empty() {
            let symbols = self.config.exchanges.poloniex_symbols.clone();
            let tx = tx.clone();
            handles.push(tokio::spawn(async move {
                let mut ingest = poloniex::Ingest::new(poloniex::Config::default(), symbols);
                if let Err(e) = ingest.run(tx).await {
                    error!(error = %e, exchange = "poloniex", "ingest ended fatally");
                }
            }));
        }

        if !self.config.exchanges.bitmex_symbols.is_empty() {
            let symbols = self.config.exchanges.bitmex_symbols.clone();
            let tx = tx.clone();
            handles.push(tokio::spawn(async move {
                let mut ingest = bitmex::Ingest::new(bitmex::Config::default(), symbols);
                if let Err(e) = ingest.run(tx).await {
                    error!(error = %e, exchange = "bitmex", "ingest ended fatally");
                }
            }));
        }

        if !self.config.exchanges.gdax_symbols.is_empty() {
            let symbols = self.config.exchanges.gdax_symbols.clone();
            let tx = tx.clone();
            handles.push(tokio::spawn(async move {
                let mut ingest = gdax::Ingest::new(gdax::Config::default(), symbols);
                if let Err(e) = ingest.run(tx).await {
                    error!(error = %e, exchange = "gdax", "ingest ended fatally");
                }
            }));
        }

        handles
    }

    /// Runs the dispatcher forever: ensures stores exist, spawns every
    /// configured ingest, then drains the fan-in channel, issuing one
    /// `BULKADD INTO` per batch. Insertion failure is fatal.
    pub async fn run(mut self) -> Result<(), Error> {
        self.ensure_stores().await?;

        let (tx, mut rx) = mpsc::channel::<DeltaBatch>(CHANNEL_CAPACITY);
        let _ingests = self.spawn_ingests(tx);

        while let Some(batch) = rx.recv().await {
            let name = batch.store_name();
            if let Err(source) = self.client.bulk_add_into(&name, &batch.deltas).await {
                return Err(Error::BulkInsert { name, source });
            }
        }

        warn!("fan-in channel closed, dispatcher stopping");
        Ok(())
    }
}
