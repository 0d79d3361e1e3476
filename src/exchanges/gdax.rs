//! GDAX (Coinbase Pro) websocket ingest.

use std::collections::HashMap;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::model::{Delta, DeltaBatch};

pub type Result<T> = std::result::Result<T, Error>;

pub const EXCHANGE_NAME: &str = "gdax";

/// Byte offset of the JSON `"type"` field's first character within a raw
/// frame (the literal prefix `{"type":"` is exactly nine bytes long).
const TYPE_BYTE_OFFSET: usize = 9;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to connect: {0}")]
    Connect(#[from] tungstenite::Error),

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Malformed message: {0}")]
    Protocol(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub ws_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ws_url: "wss://ws-feed.gdax.com".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TickerMessage {
    product_id: String,
    price: String,
    size: String,
    side: String,
    sequence: u32,
}

#[derive(Debug, Deserialize)]
struct L2UpdateMessage {
    product_id: String,
    changes: Vec<(String, String, String)>,
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct Ingest {
    config: Config,
    symbols: Vec<String>,
    seq: HashMap<String, u32>,
    stream: Option<WsStream>,
}

impl Ingest {
    pub fn new(config: Config, symbols: Vec<String>) -> Self {
        Self {
            config,
            symbols,
            seq: HashMap::new(),
            stream: None,
        }
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

    /// Sends `{"type":"subscribe","product_ids":[…],"channels":["level2","matches"]}`.
    /// GDAX does not gate subscription on an acknowledgement handshake the
    /// way Poloniex and BitMEX do.
    async fn subscribe(&mut self) -> Result<()> {
        let message = serde_json::json!({
            "type": "subscribe",
            "product_ids": self.symbols,
            "channels": ["level2", "matches"],
        });
        let text = serde_json::to_string(&message).map_err(|e| Error::Protocol(e.to_string()))?;
        self.stream
            .as_mut()
            .expect("stream connected before subscribe")
            .send(tungstenite::Message::Text(text))
            .await?;
        Ok(())
    }

    async fn initialize(&mut self) -> Result<()> {
        self.connect().await?;
        self.subscribe().await?;
        Ok(())
    }

    /// Dispatches on the byte at offset 9 (the first character of the
    /// `"type"` value) instead of decoding the whole frame generically.
    fn decode_frame(&mut self, bytes: &[u8]) -> Result<Option<DeltaBatch>> {
        if bytes.len() <= TYPE_BYTE_OFFSET {
            return Ok(None);
        }

        match bytes[TYPE_BYTE_OFFSET] {
            b's' => Ok(None), // snapshot: bootstrap image, skipped in this core
            b't' => self.decode_ticker(bytes).map(Some),
            b'l' => self.decode_l2update(bytes),
            _ => Ok(None), // heartbeat, received, open, done, match, subscriptions, ...
        }
    }

    fn decode_ticker(&mut self, bytes: &[u8]) -> Result<DeltaBatch> {
        let msg: TickerMessage = serde_json::from_slice(bytes).map_err(|e| Error::Protocol(e.to_string()))?;
        let price: f64 = msg
            .price
            .parse()
            .map_err(|_| Error::Protocol(format!("non-numeric ticker price {:?}", msg.price)))?;
        let size: f64 = msg
            .size
            .parse()
            .map_err(|_| Error::Protocol(format!("non-numeric ticker size {:?}", msg.size)))?;

        let delta = Delta::new(now_seconds(), msg.sequence, true, msg.side == "buy", price, size);
        Ok(DeltaBatch::new(EXCHANGE_NAME, msg.product_id, vec![delta]))
    }

    fn decode_l2update(&mut self, bytes: &[u8]) -> Result<Option<DeltaBatch>> {
        let msg: L2UpdateMessage = serde_json::from_slice(bytes).map_err(|e| Error::Protocol(e.to_string()))?;
        if msg.changes.is_empty() {
            return Ok(None);
        }

        let timestamp = now_seconds();
        let next_seq = self.seq.entry(msg.product_id.clone()).or_insert(0);
        let mut deltas = Vec::with_capacity(msg.changes.len());

        for (side, price, size) in &msg.changes {
            let price: f64 = price
                .parse()
                .map_err(|_| Error::Protocol(format!("non-numeric l2update price {price:?}")))?;
            let size: f64 = size
                .parse()
                .map_err(|_| Error::Protocol(format!("non-numeric l2update size {size:?}")))?;

            deltas.push(Delta::new(timestamp, *next_seq, false, side == "buy", price, size));
            *next_seq += 1;
        }

        Ok(Some(DeltaBatch::new(EXCHANGE_NAME, msg.product_id, deltas)))
    }

    pub async fn run(&mut self, tx: tokio::sync::mpsc::Sender<DeltaBatch>) -> Result<()> {
        loop {
            self.initialize().await?;
            debug!(symbols = ?self.symbols, "gdax ingest (re)initialized");

            loop {
                let frame = match self.read_frame().await {
                    Ok(frame) => frame,
                    Err(Error::Connect(e)) => {
                        warn!(error = %e, "gdax transport failure, reconnecting");
                        break;
                    }
                    Err(Error::ConnectionClosed(reason)) => {
                        warn!(%reason, "gdax connection closed, reconnecting");
                        break;
                    }
                    Err(other) => return Err(other),
                };

                match self.decode_frame(&frame) {
                    Ok(Some(batch)) => {
                        if tx.send(batch).await.is_err() {
                            return Ok(());
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "dropping unparseable gdax frame"),
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
        Ingest::new(Config::default(), vec!["BTC-USD".to_string()])
    }

    fn with_type_prefix(body: &str) -> Vec<u8> {
        body.as_bytes().to_vec()
    }

    #[test]
    fn snapshot_is_skipped() {
        let mut ingest = fresh_ingest();
        let frame = with_type_prefix(r#"{"type":"snapshot","product_id":"BTC-USD","bids":[],"asks":[]}"#);
        assert!(ingest.decode_frame(&frame).unwrap().is_none());
    }

    #[test]
    fn l2update_emits_matching_delta_count() {
        let mut ingest = fresh_ingest();
        let frame = with_type_prefix(
            r#"{"type":"l2update","product_id":"BTC-USD","changes":[["buy","9500.00","0.5"],["sell","9501.00","0"]]}"#,
        );
        let batch = ingest.decode_frame(&frame).unwrap().unwrap();
        assert_eq!(batch.exchange, "gdax");
        assert_eq!(batch.symbol, "BTC-USD");
        assert_eq!(batch.deltas.len(), 2);

        let bid = batch.deltas[0];
        assert!(!bid.is_trade);
        assert!(bid.is_bid);
        assert_eq!(bid.price, 9500.0);
        assert_eq!(bid.size, 0.5);
        assert_eq!(bid.seq, 0);

        let ask = batch.deltas[1];
        assert!(!ask.is_bid);
        assert_eq!(ask.size, 0.0);
        assert_eq!(ask.seq, 1);
    }

    #[test]
    fn ticker_uses_frame_sequence_as_seq() {
        let mut ingest = fresh_ingest();
        let frame = with_type_prefix(
            r#"{"type":"ticker","product_id":"BTC-USD","price":"9500.50","size":"0.25","side":"buy","sequence":778910}"#,
        );
        let batch = ingest.decode_frame(&frame).unwrap().unwrap();
        let delta = batch.deltas[0];
        assert!(delta.is_trade);
        assert!(delta.is_bid);
        assert_eq!(delta.seq, 778910);
        assert_eq!(delta.price, 9500.50);
        assert_eq!(delta.size, 0.25);
    }

    #[test]
    fn unrecognized_type_byte_is_skipped() {
        let mut ingest = fresh_ingest();
        let frame = with_type_prefix(r#"{"type":"received","product_id":"BTC-USD"}"#);
        assert!(ingest.decode_frame(&frame).unwrap().is_none());

        let frame = with_type_prefix(r#"{"type":"heartbeat"}"#);
        assert!(ingest.decode_frame(&frame).unwrap().is_none());
    }

    #[test]
    fn l2update_seq_continues_across_frames() {
        let mut ingest = fresh_ingest();
        let frame1 =
            with_type_prefix(r#"{"type":"l2update","product_id":"BTC-USD","changes":[["buy","1.0","1.0"]]}"#);
        let frame2 =
            with_type_prefix(r#"{"type":"l2update","product_id":"BTC-USD","changes":[["buy","1.0","2.0"]]}"#);

        let b1 = ingest.decode_frame(&frame1).unwrap().unwrap();
        let b2 = ingest.decode_frame(&frame2).unwrap().unwrap();
        assert_eq!(b1.deltas[0].seq, 0);
        assert_eq!(b2.deltas[0].seq, 1);
    }
}
