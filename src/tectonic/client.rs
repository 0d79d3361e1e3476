use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::models::{deltas_to_ticks, format_record, Tick};
use crate::model::Delta;

/// A helper Result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Size of the fixed read buffer a [`Client`] blocks on.
const READ_BUF_SIZE: usize = 32 * 1024;

/// Leading bytes TectonicDB prepends to `GET ... AS JSON` replies, including
/// the `\u{FFFE}` sentinel. Stripped before JSON-decoding the body.
const GET_REPLY_PREFIX_LEN: usize = 9;

/// The error that could happen while talking to TectonicDB.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// TCP connect/read/write failure.
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The server's reply didn't match the shape a parsing command expects.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Protocol(err.to_string())
    }
}

/// A text-framed TCP client for [TectonicDB](https://github.com/0b01/tectonicdb)'s
/// line protocol. Not safe for concurrent command issuance from multiple
/// callers; callers must serialize.
pub struct Client {
    stream: TcpStream,
    current_store: Option<String>,
}

impl Client {
    /// Connects to a TectonicDB instance at `host:port`.
    pub async fn connect(host: impl AsRef<str>, port: u16) -> Result<Self> {
        let stream = TcpStream::connect(format!("{}:{}", host.as_ref(), port)).await?;
        Ok(Self {
            stream,
            current_store: None,
        })
    }

    /// The store most recently selected via [`Client::use_store`], if any.
    pub fn current_store(&self) -> Option<&str> {
        self.current_store.as_deref()
    }

    /// Sends `message` terminated with `\n` and returns the raw reply bytes
    /// from a single blocking read of the fixed-size buffer.
    async fn send_message(&mut self, message: &str) -> Result<Vec<u8>> {
        self.stream.write_all(message.as_bytes()).await?;
        self.stream.write_all(b"\n").await?;

        let mut buf = vec![0u8; READ_BUF_SIZE];
        let n = self.stream.read(&mut buf).await?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Sends `message` and decodes the reply as (lossy) UTF-8, trimmed.
    async fn send_line(&mut self, message: &str) -> Result<String> {
        let reply = self.send_message(message).await?;
        Ok(String::from_utf8_lossy(&reply).trim().to_string())
    }

    /// `EXISTS <name>`: true iff the server's reply byte at offset 0 is `1`.
    ///
    /// Some TectonicDB builds instead reply with the ASCII character `'1'`;
    /// verify against the live server before relying on this in production.
    pub async fn exists(&mut self, name: &str) -> Result<bool> {
        let reply = self.send_message(&format!("EXISTS {name}")).await?;
        Ok(reply.first() == Some(&1u8))
    }

    /// `CREATE <name>`. Ignores the reply body, propagates transport errors.
    pub async fn create(&mut self, name: &str) -> Result<()> {
        self.send_message(&format!("CREATE {name}")).await?;
        Ok(())
    }

    /// `USE <name>`. Updates [`Client::current_store`] once the command is
    /// acknowledged without a transport error.
    pub async fn use_store(&mut self, name: &str) -> Result<()> {
        self.send_message(&format!("USE {name}")).await?;
        self.current_store = Some(name.to_string());
        Ok(())
    }

    /// `INSERT <record>;` against the currently selected store.
    pub async fn insert(&mut self, delta: &Delta) -> Result<()> {
        let record = format_record(&Tick::from(delta));
        self.send_message(&format!("INSERT {record};")).await?;
        Ok(())
    }

    /// `INSERT <record>; INTO <name>`.
    pub async fn insert_into(&mut self, name: &str, delta: &Delta) -> Result<()> {
        let record = format_record(&Tick::from(delta));
        self.send_message(&format!("INSERT {record}; INTO {name}")).await?;
        Ok(())
    }

    /// `BULKADD INTO <name>` followed by one `<record>;` per delta and the
    /// `DDAKLUB` terminator. Per-record replies are not read — the protocol
    /// streams records without per-line acks; only the terminator's reply
    /// error is surfaced. Emits exactly `deltas.len() + 2` writes.
    pub async fn bulk_add_into(&mut self, name: &str, deltas: &[Delta]) -> Result<()> {
        self.stream
            .write_all(format!("BULKADD INTO {name}\n").as_bytes())
            .await?;

        for tick in deltas_to_ticks(deltas) {
            let line = format!("{};\n", format_record(&tick));
            self.stream.write_all(line.as_bytes()).await?;
        }

        self.send_message("DDAKLUB").await?;
        Ok(())
    }

    /// `GET <n> AS JSON` against the current store.
    pub async fn get(&mut self, n: u64) -> Result<Vec<Tick>> {
        let reply = self.send_message(&format!("GET {n} AS JSON")).await?;
        Self::parse_json_reply(&reply)
    }

    /// `GET <n> FROM <name> AS JSON`.
    pub async fn get_from(&mut self, name: &str, n: u64) -> Result<Vec<Tick>> {
        let reply = self
            .send_message(&format!("GET {n} FROM {name} AS JSON"))
            .await?;
        Self::parse_json_reply(&reply)
    }

    fn parse_json_reply(reply: &[u8]) -> Result<Vec<Tick>> {
        if reply.len() < GET_REPLY_PREFIX_LEN {
            return Err(Error::Protocol("reply shorter than sentinel prefix".into()));
        }
        let body = &reply[GET_REPLY_PREFIX_LEN..];
        let trimmed_end = body.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
        let ticks: Vec<Tick> = serde_json::from_slice(&body[..trimmed_end])?;
        Ok(ticks)
    }

    /// `COUNT` against the current store.
    pub async fn count(&mut self) -> Result<u64> {
        let reply = self.send_line("COUNT").await?;
        reply
            .parse()
            .map_err(|_| Error::Protocol(format!("non-numeric COUNT reply: {reply:?}")))
    }

    /// `COUNT ALL`.
    pub async fn count_all(&mut self) -> Result<u64> {
        let reply = self.send_line("COUNT ALL").await?;
        reply
            .parse()
            .map_err(|_| Error::Protocol(format!("non-numeric COUNT ALL reply: {reply:?}")))
    }

    /// `CLEAR`. Deletes everything in the current store.
    pub async fn clear(&mut self) -> Result<String> {
        self.send_line("CLEAR").await
    }

    /// `CLEAR ALL`. Drops everything in memory.
    pub async fn clear_all(&mut self) -> Result<String> {
        self.send_line("CLEAR ALL").await
    }

    /// `FLUSH`. Flushes the current store to disk.
    pub async fn flush(&mut self) -> Result<String> {
        self.send_line("FLUSH").await
    }

    /// `FLUSH ALL`.
    pub async fn flush_all(&mut self) -> Result<String> {
        self.send_line("FLUSH ALL").await
    }

    /// `HELP`.
    pub async fn help(&mut self) -> Result<String> {
        self.send_line("HELP").await
    }

    /// `PING`.
    pub async fn ping(&mut self) -> Result<String> {
        self.send_line("PING").await
    }

    /// `INFO`. Returns info about table schemas.
    pub async fn info(&mut self) -> Result<String> {
        self.send_line("INFO").await
    }

    /// `PERF`. Returns answer count over time.
    pub async fn perf(&mut self) -> Result<String> {
        self.send_line("PERF").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncBufReadExt;
    use tokio::net::TcpListener;

    /// Spins up a minimal in-process TectonicDB stand-in: echoes a canned
    /// reply to every line it receives, and records the lines it saw.
    async fn mock_server(reply: &'static [u8]) -> (std::net::SocketAddr, tokio::sync::mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = tokio::io::BufReader::new(read_half);
            let mut line = String::new();
            loop {
                line.clear();
                let n = reader.read_line(&mut line).await.unwrap_or(0);
                if n == 0 {
                    break;
                }
                let _ = tx.send(line.trim_end().to_string());
                if write_half.write_all(reply).await.is_err() {
                    break;
                }
            }
        });

        (addr, rx)
    }

    #[tokio::test]
    async fn exists_true_on_sentinel_byte_one() {
        let (addr, mut lines) = mock_server(&[1u8]).await;
        let mut client = Client::connect(addr.ip().to_string(), addr.port()).await.unwrap();

        assert!(client.exists("bitmex:XBTUSD").await.unwrap());
        assert_eq!(lines.recv().await.unwrap(), "EXISTS bitmex:XBTUSD");
    }

    #[tokio::test]
    async fn exists_false_on_error_reply() {
        let (addr, _lines) = mock_server(b"ERR: no such store").await;
        let mut client = Client::connect(addr.ip().to_string(), addr.port()).await.unwrap();

        assert!(!client.exists("bitmex:XBTUSD").await.unwrap());
    }

    #[tokio::test]
    async fn bulk_add_into_emits_len_plus_two_writes() {
        let (addr, mut lines) = mock_server(b"OK").await;
        let mut client = Client::connect(addr.ip().to_string(), addr.port()).await.unwrap();

        let deltas = vec![
            Delta::new(1.0, 0, false, true, 100.0, 1.0),
            Delta::new(1.0, 1, true, false, 101.0, 2.0),
        ];
        client.bulk_add_into("bitmex:XBTUSD", &deltas).await.unwrap();

        let mut received = Vec::new();
        while let Ok(line) = tokio::time::timeout(std::time::Duration::from_millis(200), lines.recv()).await {
            match line {
                Some(l) => received.push(l),
                None => break,
            }
        }

        assert_eq!(received.len(), deltas.len() + 2);
        assert_eq!(received[0], "BULKADD INTO bitmex:XBTUSD");
        assert_eq!(received[1], format_record(&Tick::from(&deltas[0])) + ";");
        assert_eq!(received[2], format_record(&Tick::from(&deltas[1])) + ";");
        assert_eq!(received[3], "DDAKLUB");
    }

    #[tokio::test]
    async fn get_strips_prefix_and_nul_padding() {
        let mut reply = vec![0xEFu8, 0xBFu8, 0xBEu8]; // UTF-8 for U+FFFE
        reply.extend_from_slice(b"\0\0\0\0\0\0"); // pad remaining 6 of the 9-byte prefix
        reply.extend_from_slice(br#"[{"ts":1.0,"seq":0,"is_trade":false,"is_bid":true,"price":1.0,"size":2.0}]"#);
        reply.resize(READ_BUF_SIZE, 0);

        let (addr, _lines) = mock_server(Box::leak(reply.into_boxed_slice())).await;
        let mut client = Client::connect(addr.ip().to_string(), addr.port()).await.unwrap();

        let ticks = client.get(1).await.unwrap();
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].price, 1.0);
        assert_eq!(ticks[0].size, 2.0);
    }

    #[tokio::test]
    async fn count_parses_decimal_reply() {
        let (addr, _lines) = mock_server(b"42").await;
        let mut client = Client::connect(addr.ip().to_string(), addr.port()).await.unwrap();
        assert_eq!(client.count().await.unwrap(), 42);
    }
}
