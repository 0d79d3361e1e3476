use serde::{Deserialize, Serialize};

use crate::model::Delta;

/// A record as stored and returned by TectonicDB. Wire-compatible with
/// [`Delta`], modulo field naming.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub ts: f64,
    pub seq: u64,
    pub is_trade: bool,
    pub is_bid: bool,
    pub price: f64,
    pub size: f64,
}

impl From<&Delta> for Tick {
    fn from(delta: &Delta) -> Self {
        Self {
            ts: delta.timestamp,
            seq: delta.seq as u64,
            is_trade: delta.is_trade,
            is_bid: delta.is_bid,
            price: delta.price,
            size: delta.size,
        }
    }
}

impl From<Delta> for Tick {
    fn from(delta: Delta) -> Self {
        Self::from(&delta)
    }
}

/// Converts a batch of deltas to their tick-store representation, preserving
/// order.
pub fn deltas_to_ticks(deltas: &[Delta]) -> Vec<Tick> {
    deltas.iter().map(Tick::from).collect()
}

/// Formats a single tick as a TectonicDB wire record: `"%.3f, %d, %s, %s, %f, %f"`.
pub fn format_record(tick: &Tick) -> String {
    format!(
        "{:.3}, {}, {}, {}, {:.6}, {:.6}",
        tick.ts,
        tick.seq,
        if tick.is_trade { "t" } else { "f" },
        if tick.is_bid { "t" } else { "f" },
        tick.price,
        tick.size,
    )
}
