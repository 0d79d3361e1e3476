//! Normalizes real-time market data from Poloniex, BitMEX and GDAX into
//! canonical deltas and forwards them to TectonicDB.

pub mod dispatch;
pub mod exchanges;
pub mod model;
pub mod tectonic;

pub use dispatch::{Dispatcher, DispatcherConfig, ExchangeConfig};
pub use model::{Delta, DeltaBatch, Price, Snapshot};
