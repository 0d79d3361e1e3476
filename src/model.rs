//! Canonical tick representation shared by every exchange ingest and by the
//! TectonicDB client.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Orderbook event flags. Packs two booleans into one byte of legacy-compatible
/// state; kept around so any on-disk `Delta` variant encoded this way can still
/// be interpreted. The canonical [`Delta`] itself uses `is_trade`/`is_bid`
/// directly and never constructs this byte on the hot path.
pub mod event {
    /// Level insertion (legacy, unused by the canonical model).
    pub const IS_INSERT: u8 = 1 << 0;
    /// Level removal (legacy, unused by the canonical model).
    pub const IS_REMOVE: u8 = 1 << 1;
    /// Level update (legacy, unused by the canonical model).
    pub const IS_UPDATE: u8 = 1 << 2;
    /// Trade / match event.
    pub const IS_TRADE: u8 = 1 << 3;
    /// Ask side.
    pub const IS_ASK: u8 = 1 << 4;
    /// Bid side.
    pub const IS_BID: u8 = 1 << 5;

    /// Packs `(is_trade, is_bid)` into the legacy event byte.
    pub fn encode(is_trade: bool, is_bid: bool) -> u8 {
        let mut flags = if is_bid { IS_BID } else { IS_ASK };
        flags |= if is_trade { IS_TRADE } else { IS_UPDATE };
        flags
    }

    /// Recovers `is_trade` from a legacy event byte.
    pub fn is_trade(flags: u8) -> bool {
        flags & IS_TRADE != 0
    }

    /// Recovers `is_bid` from a legacy event byte.
    pub fn is_bid(flags: u8) -> bool {
        flags & IS_BID != 0
    }
}

/// A single canonical event on a market data stream.
///
/// Invariants: for a given `(exchange, symbol)`, `seq` strictly increases by
/// 1 per emission, and `timestamp` is non-decreasing within a single
/// [`DeltaBatch`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    /// Seconds since epoch, microsecond precision.
    pub timestamp: f64,
    /// Monotonically increasing counter, namespaced per `(exchange, symbol)`.
    pub seq: u32,
    /// True iff this is a trade/match, false iff it is a book mutation.
    pub is_trade: bool,
    /// True iff this event applies to the bid side.
    pub is_bid: bool,
    pub price: f64,
    /// `size == 0` on a book mutation encodes level removal.
    pub size: f64,
}

impl Delta {
    /// Builds a `Delta` from primitives. Pure, no side effects, no error cases.
    pub fn new(timestamp: f64, seq: u32, is_trade: bool, is_bid: bool, price: f64, size: f64) -> Self {
        Self {
            timestamp,
            seq,
            is_trade,
            is_bid,
            price,
            size,
        }
    }

    /// Packs this delta's `(is_trade, is_bid)` into the legacy event byte.
    pub fn event_flags(&self) -> u8 {
        event::encode(self.is_trade, self.is_bid)
    }
}

/// A homogeneous group of deltas for one `(exchange, symbol)`, emitted as a
/// single fan-in unit.
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaBatch {
    pub exchange: String,
    pub symbol: String,
    pub deltas: Vec<Delta>,
}

impl DeltaBatch {
    /// Builds a batch from `(exchange, symbol, deltas)`. `deltas` must be
    /// non-empty; this is a caller invariant, not enforced with a `Result`
    /// since construction has no failure mode of its own.
    pub fn new(exchange: impl Into<String>, symbol: impl Into<String>, deltas: Vec<Delta>) -> Self {
        debug_assert!(!deltas.is_empty(), "DeltaBatch must carry at least one Delta");
        Self {
            exchange: exchange.into(),
            symbol: symbol.into(),
            deltas,
        }
    }

    /// The tick-store name this batch should be routed to (`exchange:symbol`).
    pub fn store_name(&self) -> String {
        format!("{}:{}", self.exchange, self.symbol)
    }
}

/// Total-ordered wrapper around `f64` so book prices can key a `BTreeMap`.
/// Book prices are always finite, so `total_cmp` gives a consistent order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Price(pub f64);

impl Eq for Price {}

impl PartialOrd for Price {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Price {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// An initial book image bound to `(symbol, timestamp)`, used only for
/// bootstrap. Downstream storage of snapshots is optional.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub symbol: String,
    /// Microseconds since epoch, matching the original wire format's snapshot
    /// timestamp resolution.
    pub timestamp: u64,
    pub bids: BTreeMap<Price, f64>,
    pub asks: BTreeMap<Price, f64>,
}

impl Snapshot {
    pub fn new(symbol: impl Into<String>, timestamp: u64) -> Self {
        Self {
            symbol: symbol.into(),
            timestamp,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
        }
    }

    /// Builds an empty snapshot stamped with the current wall-clock time.
    pub fn new_now(symbol: impl Into<String>) -> Self {
        Self::new(symbol, chrono::Utc::now().timestamp_micros().max(0) as u64)
    }
}
