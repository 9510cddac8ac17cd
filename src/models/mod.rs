//! Data models for bars, signals, positions, trades and snapshots.

mod bar;
mod position;
mod signal;
mod snapshot;
mod trade;

pub use bar::{avg_volume, sma_close, Bar};
pub use position::Position;
pub use signal::{Signal, SizedPosition};
pub use snapshot::{DailySnapshot, EquityPoint};
pub use trade::{ExitReason, Trade};

#[cfg(test)]
pub(crate) use bar::test_support;
