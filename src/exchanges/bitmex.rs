//! BitMEX websocket ingest.

use std::collections::HashMap;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::model::{Delta, DeltaBatch};

pub type Result<T> = std::result::Result<T, Error>;

pub const EXCHANGE_NAME: &str = "bitmex";

const ORDERBOOK_TABLE: &str = "orderBookL2";
const TRADE_TABLE: &str = "trade";

// No config-validation variant: `ORDERBOOK_TABLE`/`TRADE_TABLE` are fixed
// constants, not user-supplied channel names, so there is no malformed
// channel list to reject at construction time.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to connect: {0}")]
    Connect(#[from] tungstenite::Error),

    #[error("Bootstrap request failed: {0}")]
    Bootstrap(#[from] reqwest::Error),

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Malformed message: {0}")]
    Protocol(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub ws_url: String,
    pub instrument_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ws_url: "wss://www.bitmex.com/realtime".to_string(),
            instrument_url:
                "https://www.bitmex.com/api/v1/instrument?columns=symbol,tickSize&start=0&count=500"
                    .to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct AssetInfo {
    index: f64,
    tick_size: f64,
}

#[derive(Debug, Deserialize)]
struct Instrument {
    symbol: String,
    #[serde(rename = "tickSize")]
    tick_size: f64,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    table: Option<String>,
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    data: Vec<Update>,
}

#[derive(Debug, Deserialize)]
struct Update {
    symbol: String,
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    side: Option<String>,
    #[serde(default)]
    size: Option<f64>,
    #[serde(default)]
    price: Option<f64>,
}

/// The index in BitMEX's legacy tick-size table that is known to diverge from
/// the instrument endpoint's reported `tickSize`.
fn legacy_tick_size(symbol: &str) -> Option<f64> {
    match symbol {
        "XBTUSD" => Some(0.01),
        "XBTZ17" => Some(0.1),
        "XBJZ17" => Some(1.0),
        _ => None,
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct Ingest {
    config: Config,
    symbols: Vec<String>,
    asset_info: HashMap<String, AssetInfo>,
    seq: HashMap<String, u32>,
    stream: Option<WsStream>,
    /// 50-frame guard window before `increment_partial` latches false. Never
    /// gates any behavior here; partial frames are already dropped earlier by
    /// the action check, so this is preserved purely as a fidelity artifact.
    no_partial_ticks: u32,
    increment_partial: bool,
}

impl Ingest {
    pub fn new(config: Config, symbols: Vec<String>) -> Self {
        Self {
            config,
            symbols,
            asset_info: HashMap::new(),
            seq: HashMap::new(),
            stream: None,
            no_partial_ticks: 0,
            increment_partial: true,
        }
    }

    /// Fetches the full instrument list and records each subscribed symbol's
    /// position (its "index") and effective tick size, applying the legacy
    /// overrides where the instrument endpoint's value can't be trusted.
    /// Failure here is fatal to ingest startup.
    async fn bootstrap(&mut self) -> Result<()> {
        let instruments: Vec<Instrument> = reqwest::get(self.config.instrument_url.as_str())
            .await?
            .json()
            .await?;

        self.asset_info.clear();
        for symbol in &self.symbols {
            if let Some((index, instrument)) = instruments
                .iter()
                .enumerate()
                .find(|(_, inst)| &inst.symbol == symbol)
            {
                let tick_size = legacy_tick_size(symbol).unwrap_or(instrument.tick_size);
                self.asset_info.insert(
                    symbol.clone(),
                    AssetInfo {
                        index: index as f64,
                        tick_size,
                    },
                );
            }
        }
        Ok(())
    }

    async fn connect(&mut self) -> Result<()> {
        let (stream, _) = connect_async(self.config.ws_url.as_str()).await?;
        self.stream = Some(stream);
        Ok(())
    }

    async fn read_frame(&mut self) -> Result<Vec<u8>> {
        loop {
            let stream = self.stream.as_mut().expect("stream connected");
            match stream.next().await {
                Some(Ok(tungstenite::Message::Text(text))) => return Ok(text.into_bytes()),
                Some(Ok(tungstenite::Message::Binary(bytes))) => return Ok(bytes),
                Some(Ok(tungstenite::Message::Ping(payload))) => {
                    stream.send(tungstenite::Message::Pong(payload)).await.ok();
                }
                Some(Ok(tungstenite::Message::Pong(_) | tungstenite::Message::Frame(_))) => {}
                Some(Ok(tungstenite::Message::Close(frame))) => {
                    let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                    return Err(Error::ConnectionClosed(reason));
                }
                Some(Err(e)) => return Err(Error::Connect(e)),
                None => return Err(Error::ConnectionClosed("stream ended".to_string())),
            }
        }
    }

    /// Subscribes to `orderBookL2:<symbol>` and `trade:<symbol>` for every
    /// symbol, then discards the `symbols.len() + 1` acknowledgement frames
    /// that precede real data.
    async fn subscribe(&mut self) -> Result<()> {
        let mut args = Vec::with_capacity(self.symbols.len() * 2);
        for channel in [ORDERBOOK_TABLE, TRADE_TABLE] {
            for symbol in &self.symbols {
                args.push(format!("{channel}:{symbol}"));
            }
        }

        let message = serde_json::json!({ "op": "subscribe", "args": args });
        let text = serde_json::to_string(&message).map_err(|e| Error::Protocol(e.to_string()))?;
        self.stream
            .as_mut()
            .expect("stream connected before subscribe")
            .send(tungstenite::Message::Text(text))
            .await?;

        for _ in 0..=self.symbols.len() {
            self.read_frame().await?;
        }
        Ok(())
    }

    async fn initialize(&mut self) -> Result<()> {
        self.bootstrap().await?;
        self.connect().await?;
        self.subscribe().await?;
        Ok(())
    }

    /// Decodes one frame into per-symbol `DeltaBatch`es. Empty and `partial`
    /// actions are dropped outright: BitMEX's orderbook bootstrap image never
    /// reaches the canonical stream.
    fn decode_frame(&mut self, bytes: &[u8]) -> Result<Vec<DeltaBatch>> {
        let envelope: Envelope = serde_json::from_slice(bytes).map_err(|e| Error::Protocol(e.to_string()))?;

        let (table, action) = match (&envelope.table, &envelope.action) {
            (Some(table), Some(action)) if !action.is_empty() && action != "partial" => {
                (table.as_str(), action.as_str())
            }
            _ => return Ok(Vec::new()),
        };

        let timestamp = now_seconds();
        let mut per_symbol: HashMap<String, Vec<Delta>> = HashMap::new();

        if table == ORDERBOOK_TABLE {
            for update in &envelope.data {
                let info = match self.asset_info.get(&update.symbol) {
                    Some(info) => *info,
                    None => {
                        warn!(symbol = %update.symbol, "bitmex update for unknown symbol, skipping");
                        continue;
                    }
                };
                let id = update
                    .id
                    .ok_or_else(|| Error::Protocol("orderBookL2 update missing id".into()))?;
                let price = (1.0e8 * info.index - id as f64) * info.tick_size;
                let is_bid = update.side.as_deref() == Some("Buy");

                let next_seq = self.seq.entry(update.symbol.clone()).or_insert(0);
                per_symbol.entry(update.symbol.clone()).or_default().push(Delta::new(
                    timestamp,
                    *next_seq,
                    false,
                    is_bid,
                    price,
                    update.size.unwrap_or(0.0),
                ));
                *next_seq += 1;
            }

            if self.increment_partial {
                if self.no_partial_ticks > 50 {
                    self.increment_partial = false;
                }
                self.no_partial_ticks += 1;
            }
        } else if table == TRADE_TABLE {
            for trade in &envelope.data {
                let is_bid = trade.side.as_deref() == Some("Buy");
                let price = trade
                    .price
                    .ok_or_else(|| Error::Protocol("trade update missing price".into()))?;

                let next_seq = self.seq.entry(trade.symbol.clone()).or_insert(0);
                per_symbol.entry(trade.symbol.clone()).or_default().push(Delta::new(
                    timestamp,
                    *next_seq,
                    true,
                    is_bid,
                    price,
                    trade.size.unwrap_or(0.0),
                ));
                *next_seq += 1;
            }
        } else {
            return Ok(Vec::new());
        }

        let _ = action;
        Ok(per_symbol
            .into_iter()
            .map(|(symbol, deltas)| DeltaBatch::new(EXCHANGE_NAME, symbol, deltas))
            .collect())
    }

    pub async fn run(&mut self, tx: tokio::sync::mpsc::Sender<DeltaBatch>) -> Result<()> {
        loop {
            self.initialize().await?;
            debug!(symbols = ?self.symbols, "bitmex ingest (re)initialized");

            loop {
                let frame = match self.read_frame().await {
                    Ok(frame) => frame,
                    Err(Error::Connect(e)) => {
                        warn!(error = %e, "bitmex transport failure, reconnecting");
                        break;
                    }
                    Err(Error::ConnectionClosed(reason)) => {
                        warn!(%reason, "bitmex connection closed, reconnecting");
                        break;
                    }
                    Err(other) => return Err(other),
                };

                match self.decode_frame(&frame) {
                    Ok(batches) => {
                        for batch in batches {
                            if tx.send(batch).await.is_err() {
                                return Ok(());
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "dropping unparseable bitmex frame"),
                }
            }
        }
    }
}

fn now_seconds() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_ingest() -> Ingest {
        let mut ingest = Ingest::new(Config::default(), vec!["XBTUSD".to_string()]);
        ingest.asset_info.insert(
            "XBTUSD".to_string(),
            AssetInfo {
                index: 1.0,
                tick_size: 0.01,
            },
        );
        ingest
    }

    #[test]
    fn decodes_orderbook_insert() {
        let mut ingest = fresh_ingest();
        let frame = br#"{"table":"orderBookL2","action":"insert","data":[{"symbol":"XBTUSD","id":8799999999,"side":"Buy","size":100}]}"#;
        let batches = ingest.decode_frame(frame).unwrap();
        assert_eq!(batches.len(), 1);
        let delta = batches[0].deltas[0];
        assert!(!delta.is_trade);
        assert!(delta.is_bid);
        // price = (1e8 * 1.0 - 8799999999) * 0.01
        assert!((delta.price - ((1.0e8 * 1.0 - 8_799_999_999.0) * 0.01)).abs() < 1e-6);
        assert_eq!(delta.size, 100.0);
    }

    #[test]
    fn decodes_trade() {
        let mut ingest = fresh_ingest();
        let frame = br#"{"table":"trade","action":"insert","data":[{"symbol":"XBTUSD","side":"Sell","price":50000.5,"size":10}]}"#;
        let batches = ingest.decode_frame(frame).unwrap();
        let delta = batches[0].deltas[0];
        assert!(delta.is_trade);
        assert!(!delta.is_bid);
        assert_eq!(delta.price, 50000.5);
        assert_eq!(delta.size, 10.0);
    }

    #[test]
    fn partial_action_is_dropped() {
        let mut ingest = fresh_ingest();
        let frame = br#"{"table":"orderBookL2","action":"partial","data":[{"symbol":"XBTUSD","id":1,"side":"Buy","size":1}]}"#;
        assert!(ingest.decode_frame(frame).unwrap().is_empty());
    }

    #[test]
    fn empty_action_is_dropped() {
        let mut ingest = fresh_ingest();
        let frame = br#"{"info":"Welcome to the BitMEX Realtime API."}"#;
        assert!(ingest.decode_frame(frame).unwrap().is_empty());
    }

    #[test]
    fn legacy_tick_overrides_known_symbols() {
        assert_eq!(legacy_tick_size("XBTUSD"), Some(0.01));
        assert_eq!(legacy_tick_size("XBTZ17"), Some(0.1));
        assert_eq!(legacy_tick_size("XBJZ17"), Some(1.0));
        assert_eq!(legacy_tick_size("ETHUSD"), None);
    }

    #[test]
    fn seq_increments_independently_per_symbol() {
        let mut ingest = Ingest::new(Config::default(), vec!["XBTUSD".to_string(), "ETHUSD".to_string()]);
        ingest.asset_info.insert("XBTUSD".to_string(), AssetInfo { index: 1.0, tick_size: 0.01 });
        ingest.asset_info.insert("ETHUSD".to_string(), AssetInfo { index: 2.0, tick_size: 0.05 });

        let frame = br#"{"table":"trade","action":"insert","data":[{"symbol":"XBTUSD","side":"Buy","price":1.0,"size":1},{"symbol":"ETHUSD","side":"Buy","price":1.0,"size":1},{"symbol":"XBTUSD","side":"Buy","price":1.0,"size":1}]}"#;
        let batches = ingest.decode_frame(frame).unwrap();
        let xbt = batches.iter().find(|b| b.symbol == "XBTUSD").unwrap();
        let eth = batches.iter().find(|b| b.symbol == "ETHUSD").unwrap();
        assert_eq!(xbt.deltas.iter().map(|d| d.seq).collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(eth.deltas[0].seq, 0);
    }

    #[test]
    fn partial_guard_latches_after_fifty_frames() {
        let mut ingest = fresh_ingest();
        let frame = br#"{"table":"orderBookL2","action":"insert","data":[{"symbol":"XBTUSD","id":1,"side":"Buy","size":1}]}"#;

        assert!(ingest.increment_partial);
        for _ in 0..52 {
            ingest.decode_frame(frame).unwrap();
        }
        assert!(!ingest.increment_partial);
    }
}
