//! Per-exchange websocket ingest pipelines.

pub mod bitmex;
pub mod gdax;
pub mod poloniex;
