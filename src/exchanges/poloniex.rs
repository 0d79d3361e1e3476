//! Poloniex websocket ingest.

use std::collections::HashMap;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::model::{Delta, DeltaBatch, Price, Snapshot};

pub type Result<T> = std::result::Result<T, Error>;

/// Exchange name as used in tick-store naming (`exchange:symbol`).
pub const EXCHANGE_NAME: &str = "poloniex";

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

/// Immutable per-ingest configuration, copied once at construction.
#[derive(Debug, Clone)]
pub struct Config {
    pub ws_url: String,
    pub ticker_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ws_url: "wss://api2.poloniex.com".to_string(),
            ticker_url: "https://poloniex.com/public?command=returnTicker".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TickerEntry {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct SnapshotMessage {
    #[serde(rename = "currencyPair")]
    currency_pair: String,
    #[serde(rename = "orderBook")]
    order_book: (HashMap<String, String>, HashMap<String, String>),
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A long-lived Poloniex subscriber/decoder. Owns the symbol list, the
/// per-symbol `seq` counters (keyed by Poloniex's numeric asset code) and the
/// asset-code → symbol table populated once at bootstrap.
pub struct Ingest {
    config: Config,
    symbols: Vec<String>,
    asset_table: HashMap<i64, String>,
    seq: HashMap<i64, u32>,
    snapshots: HashMap<String, Snapshot>,
    stream: Option<WsStream>,
}

impl Ingest {
    pub fn new(config: Config, symbols: Vec<String>) -> Self {
        Self {
            config,
            symbols,
            asset_table: HashMap::new(),
            seq: HashMap::new(),
            snapshots: HashMap::new(),
            stream: None,
        }
    }

    /// The initial book image for `symbol`, if bootstrap captured one. This
    /// is exposed purely for callers who want it, never pushed onto the
    /// canonical channel.
    pub fn snapshot(&self, symbol: &str) -> Option<&Snapshot> {
        self.snapshots.get(symbol)
    }

    /// HTTP `GET returnTicker`, populating `asset_table[id] = symbol`.
    /// Failure here is fatal to ingest startup.
    async fn bootstrap(&mut self) -> Result<()> {
        let body: HashMap<String, TickerEntry> =
            reqwest::get(self.config.ticker_url.as_str()).await?.json().await?;

        self.asset_table.clear();
        for (symbol, entry) in body {
            self.asset_table.insert(entry.id, symbol);
        }
        Ok(())
    }

    async fn connect(&mut self) -> Result<()> {
        let (stream, _) = connect_async(self.config.ws_url.as_str()).await?;
        self.stream = Some(stream);
        Ok(())
    }

    async fn send_json(&mut self, value: &serde_json::Value) -> Result<()> {
        let text = serde_json::to_string(value).map_err(|e| Error::Protocol(e.to_string()))?;
        self.stream
            .as_mut()
            .expect("stream connected before subscribe")
            .send(tungstenite::Message::Text(text))
            .await?;
        Ok(())
    }

    /// Reads the next data-bearing frame, transparently answering pings and
    /// skipping other control frames. Returns `Err` on close/disconnect.
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

    /// Sends a subscribe message per symbol, discards the `n` heartbeat acks,
    /// then decodes the `n` snapshot frames that follow.
    async fn subscribe(&mut self) -> Result<()> {
        for symbol in self.symbols.clone() {
            self.send_json(&serde_json::json!({
                "command": "subscribe",
                "channel": symbol,
            }))
            .await?;
        }

        for _ in 0..self.symbols.len() {
            self.read_frame().await?;
        }

        for _ in 0..self.symbols.len() {
            let raw = self.read_frame().await?;
            let snapshot = decode_snapshot_frame(&raw)?;
            self.snapshots.insert(snapshot.symbol.clone(), snapshot);
        }

        Ok(())
    }

    async fn initialize(&mut self) -> Result<()> {
        self.bootstrap().await?;
        self.connect().await?;
        self.subscribe().await?;
        Ok(())
    }

    /// Decodes one steady-state frame into a `DeltaBatch`, or `None` for a
    /// heartbeat frame (asset code `0`) or a frame with zero inner events.
    fn decode_frame(&mut self, bytes: &[u8]) -> Result<Option<DeltaBatch>> {
        let top = split_array_elements(bytes);
        if top.len() != 3 {
            return Err(Error::Protocol("top-level frame did not have 3 elements".into()));
        }

        let asset_code: i64 = parse_ascii_i64(top[0])
            .ok_or_else(|| Error::Protocol("non-numeric asset code".into()))?;
        if asset_code == 0 {
            return Ok(None);
        }

        let events = split_array_elements(top[2]);
        if events.len() == 1 && events[0].is_empty() {
            return Ok(None);
        }

        let timestamp = now_seconds();
        let mut deltas = Vec::with_capacity(events.len());

        for event in events {
            let fields = split_array_elements(event);
            if fields.is_empty() {
                continue;
            }
            match fields[0] {
                b"o" if fields.len() >= 4 => {
                    let side: u8 = parse_ascii_i64(fields[1])
                        .ok_or_else(|| Error::Protocol("non-numeric side".into()))? as u8;
                    let price = parse_ascii_f64(fields[2])
                        .ok_or_else(|| Error::Protocol("non-numeric price".into()))?;
                    let size = parse_ascii_f64(fields[3])
                        .ok_or_else(|| Error::Protocol("non-numeric size".into()))?;

                    let next_seq = self.seq.entry(asset_code).or_insert(0);
                    deltas.push(Delta::new(timestamp, *next_seq, false, side == 1, price, size));
                    *next_seq += 1;
                }
                b"t" if fields.len() >= 5 => {
                    let side: u8 = parse_ascii_i64(fields[2])
                        .ok_or_else(|| Error::Protocol("non-numeric side".into()))? as u8;
                    let price = parse_ascii_f64(fields[3])
                        .ok_or_else(|| Error::Protocol("non-numeric price".into()))?;
                    let size = parse_ascii_f64(fields[4])
                        .ok_or_else(|| Error::Protocol("non-numeric size".into()))?;

                    let next_seq = self.seq.entry(asset_code).or_insert(0);
                    deltas.push(Delta::new(timestamp, *next_seq, true, side == 1, price, size));
                    *next_seq += 1;
                }
                b"o" | b"t" => {
                    warn!(fields = fields.len(), "truncated poloniex event, skipping");
                }
                other => {
                    warn!(event = ?String::from_utf8_lossy(other), "unrecognized poloniex event discriminator, skipping");
                }
            }
        }

        if deltas.is_empty() {
            return Ok(None);
        }

        let symbol = self
            .asset_table
            .get(&asset_code)
            .cloned()
            .ok_or_else(|| Error::Protocol(format!("unknown asset code {asset_code}")))?;

        Ok(Some(DeltaBatch::new(EXCHANGE_NAME, symbol, deltas)))
    }

    /// Runs forever: initializes, then decodes frames and forwards batches
    /// to `tx` until the transport fails, at which point it reinitializes
    /// and resumes. Bootstrap failure on any attempt is fatal and ends the
    /// ingest.
    pub async fn run(&mut self, tx: tokio::sync::mpsc::Sender<DeltaBatch>) -> Result<()> {
        loop {
            self.initialize().await?;
            debug!(symbols = ?self.symbols, "poloniex ingest (re)initialized");

            loop {
                let frame = match self.read_frame().await {
                    Ok(frame) => frame,
                    Err(Error::Connect(e)) => {
                        warn!(error = %e, "poloniex transport failure, reconnecting");
                        break;
                    }
                    Err(Error::ConnectionClosed(reason)) => {
                        warn!(%reason, "poloniex connection closed, reconnecting");
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
                    Err(e) => warn!(error = %e, "dropping unparseable poloniex frame"),
                }
            }
        }
    }
}

/// Scans `bytes[0]` for `{`, truncates the trailing 3 bytes (the closing
/// array brackets Poloniex's snapshot envelope wraps the object in), then
/// JSON-decodes the remainder.
fn decode_snapshot_frame(bytes: &[u8]) -> Result<Snapshot> {
    let brace = bytes
        .iter()
        .position(|&b| b == b'{')
        .ok_or_else(|| Error::Protocol("no snapshot object found in frame".into()))?;
    let trimmed = &bytes[brace..bytes.len().saturating_sub(3)];

    let message: SnapshotMessage =
        serde_json::from_slice(trimmed).map_err(|e| Error::Protocol(e.to_string()))?;

    let mut snapshot = Snapshot::new_now(message.currency_pair);
    for (price, size) in message.order_book.0 {
        if let (Some(price), Some(size)) = (price.parse().ok(), size.parse().ok()) {
            snapshot.asks.insert(Price(price), size);
        }
    }
    for (price, size) in message.order_book.1 {
        if let (Some(price), Some(size)) = (price.parse().ok(), size.parse().ok()) {
            snapshot.bids.insert(Price(price), size);
        }
    }
    Ok(snapshot)
}

fn now_seconds() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Splits `bytes` (a well-formed JSON array including its enclosing `[`/`]`)
/// into its direct-child element slices, respecting nested arrays/objects
/// and quoted strings. This is the hand-rolled scanner the hot path uses
/// instead of a general JSON decoder: it never builds an intermediate
/// `serde_json::Value` tree.
fn split_array_elements(bytes: &[u8]) -> Vec<&[u8]> {
    if bytes.len() < 2 || bytes[0] != b'[' || bytes[bytes.len() - 1] != b']' {
        return vec![bytes];
    }
    let inner = &bytes[1..bytes.len() - 1];
    let mut elems = Vec::new();
    let mut depth = 0i32;
    let mut in_string = false;
    let mut start = 0usize;
    let mut i = 0usize;
    while i < inner.len() {
        let c = inner[i];
        if in_string {
            if c == b'\\' {
                i += 1;
            } else if c == b'"' {
                in_string = false;
            }
        } else {
            match c {
                b'"' => in_string = true,
                b'[' | b'{' => depth += 1,
                b']' | b'}' => depth -= 1,
                b',' if depth == 0 => {
                    elems.push(trim_token(&inner[start..i]));
                    start = i + 1;
                }
                _ => {}
            }
        }
        i += 1;
    }
    elems.push(trim_token(&inner[start..]));
    elems
}

fn trim_token(tok: &[u8]) -> &[u8] {
    let mut t = tok;
    while matches!(t.first(), Some(b' ' | b'\n' | b'\r' | b'\t')) {
        t = &t[1..];
    }
    while matches!(t.last(), Some(b' ' | b'\n' | b'\r' | b'\t')) {
        t = &t[..t.len() - 1];
    }
    if t.len() >= 2 && t.first() == Some(&b'"') && t.last() == Some(&b'"') {
        t = &t[1..t.len() - 1];
    }
    t
}

fn parse_ascii_i64(bytes: &[u8]) -> Option<i64> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

fn parse_ascii_f64(bytes: &[u8]) -> Option<f64> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn fresh_ingest() -> Ingest {
        let mut ingest = Ingest::new(Config::default(), vec!["BTC_ETH".to_string()]);
        ingest.asset_table.insert(148, "BTC_ETH".to_string());
        ingest
    }

    #[test]
    fn decodes_book_update() {
        let mut ingest = fresh_ingest();
        let frame = br#"[148,12345,[["o",1,"0.07036200","7.65064240"]]]"#;
        let batch = ingest.decode_frame(frame).unwrap().unwrap();

        assert_eq!(batch.exchange, "poloniex");
        assert_eq!(batch.symbol, "BTC_ETH");
        assert_eq!(batch.deltas.len(), 1);
        let delta = batch.deltas[0];
        assert_eq!(delta.seq, 0);
        assert!(!delta.is_trade);
        assert!(delta.is_bid);
        assert!((delta.price - 0.070362).abs() < 1e-9);
        assert!((delta.size - 7.6506424).abs() < 1e-9);
    }

    #[test]
    fn decodes_removal_as_zero_size() {
        let mut ingest = fresh_ingest();
        let frame = br#"[148,12346,[["o",0,"0.07040000","0.00000000"]]]"#;
        let batch = ingest.decode_frame(frame).unwrap().unwrap();

        let delta = batch.deltas[0];
        assert!(!delta.is_trade);
        assert!(!delta.is_bid);
        assert_eq!(delta.size, 0.0);
    }

    #[test]
    fn decodes_trade_event() {
        let mut ingest = fresh_ingest();
        let frame = br#"[148,12347,[["t","1234",1,"0.07036200","1.50000000",1690000000]]]"#;
        let batch = ingest.decode_frame(frame).unwrap().unwrap();

        let delta = batch.deltas[0];
        assert!(delta.is_trade);
        assert!(delta.is_bid);
        assert!((delta.price - 0.070362).abs() < 1e-9);
        assert!((delta.size - 1.5).abs() < 1e-9);
    }

    #[test]
    fn seq_increments_per_asset_code() {
        let mut ingest = fresh_ingest();
        let frame1 = br#"[148,1,[["o",1,"1.0","1.0"]]]"#;
        let frame2 = br#"[148,2,[["o",1,"1.0","2.0"],["o",0,"1.1","3.0"]]]"#;

        let b1 = ingest.decode_frame(frame1).unwrap().unwrap();
        let b2 = ingest.decode_frame(frame2).unwrap().unwrap();

        assert_eq!(b1.deltas[0].seq, 0);
        assert_eq!(b2.deltas[0].seq, 1);
        assert_eq!(b2.deltas[1].seq, 2);
    }

    #[test]
    fn heartbeat_frame_is_skipped() {
        let mut ingest = fresh_ingest();
        let frame = br#"[0,1,[]]"#;
        assert!(ingest.decode_frame(frame).unwrap().is_none());
    }

    #[test]
    fn multi_event_frame_emits_matching_delta_count() {
        let mut ingest = fresh_ingest();
        let frame = br#"[148,9,[["o",1,"1.0","1.0"],["o",0,"1.1","2.0"],["t","5",1,"1.0","0.1",123]]]"#;
        let batch = ingest.decode_frame(frame).unwrap().unwrap();
        assert_eq!(batch.deltas.len(), 3);
    }

    #[test]
    fn split_array_elements_respects_nesting_and_strings() {
        let elems = split_array_elements(br#"[148,12345,[["o",1,"0.07,2","7.0"]]]"#);
        assert_eq!(elems.len(), 3);
        assert_eq!(elems[0], b"148");
        assert_eq!(elems[1], b"12345");
    }

    #[traced_test]
    #[test]
    fn unrecognized_discriminator_logs_a_warning() {
        let mut ingest = fresh_ingest();
        let frame = br#"[148,1,[["x",1,"1.0","1.0"]]]"#;
        assert!(ingest.decode_frame(frame).unwrap().is_none());
        assert!(logs_contain("unrecognized poloniex event discriminator"));
    }

    #[test]
    fn truncated_book_event_is_skipped_not_panicked() {
        let mut ingest = fresh_ingest();
        let frame = br#"[148,1,[["o",1,"1.0"]]]"#;
        assert!(ingest.decode_frame(frame).unwrap().is_none());
    }

    #[test]
    fn truncated_trade_event_is_skipped_not_panicked() {
        let mut ingest = fresh_ingest();
        let frame = br#"[148,1,[["t","5",1,"1.0"]]]"#;
        assert!(ingest.decode_frame(frame).unwrap().is_none());
    }

    #[test]
    fn truncated_event_alongside_valid_event_still_emits_the_valid_one() {
        let mut ingest = fresh_ingest();
        let frame = br#"[148,1,[["o",1,"1.0"],["o",1,"2.0","1.0"]]]"#;
        let batch = ingest.decode_frame(frame).unwrap().unwrap();
        assert_eq!(batch.deltas.len(), 1);
        assert_eq!(batch.deltas[0].price, 2.0);
    }
}
