//! Client for [TectonicDB](https://github.com/0b01/tectonicdb)'s line-oriented
//! TCP protocol.

mod client;
mod models;

pub use client::{Client, Error, Result};
pub use models::{deltas_to_ticks, format_record, Tick};
