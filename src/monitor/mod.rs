//! Live driver of the exit engine.
//!
//! `Scanner` opens positions from strategy signals and `LiveMonitor` polls
//! quotes for open ones. Both share a `PositionBook`.

mod book;
mod live;
mod scanner;

use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::trading::{CostConfig, RiskConfig};

pub use book::PositionBook;
pub use live::{LiveMonitor, PollReport};
pub use scanner::Scanner;

/// Live monitoring configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Seconds between poll cycles
    pub poll_interval_secs: u64,

    /// Deadline for a single quote request
    pub quote_timeout_ms: u64,

    /// Deadline for a single order request
    pub order_timeout_ms: u64,

    /// Log orders instead of sending them
    pub dry_run: bool,

    /// Capital base for sizing new entries
    pub capital: Decimal,

    pub risk: RiskConfig,
    pub costs: CostConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            quote_timeout_ms: 10_000,
            order_timeout_ms: 15_000,
            dry_run: true,
            capital: dec!(100000),
            risk: RiskConfig::default(),
            costs: CostConfig::default(),
        }
    }
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn quote_timeout(&self) -> Duration {
        Duration::from_millis(self.quote_timeout_ms)
    }

    pub fn order_timeout(&self) -> Duration {
        Duration::from_millis(self.order_timeout_ms)
    }
}
