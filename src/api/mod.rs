//! Market data and broker collaborators.

mod data_client;
mod file_source;
mod loader;
mod paper_broker;
mod types;

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::models::Bar;

pub use data_client::HttpDataSource;
pub use file_source::JsonFileSource;
pub use loader::load_universe;
pub use paper_broker::PaperBroker;
pub use types::*;

/// Daily bar provider.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Up to `count` most recent bars, ascending by time. May return fewer.
    async fn daily_bars(&self, symbol: &str, count: usize) -> Result<Vec<Bar>>;
}

/// Order routing and account queries. Only the live monitor uses this.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn quote(&self, symbol: &str) -> Result<Decimal>;

    async fn place_order(&self, order: &Order) -> Result<OrderResult>;

    async fn positions(&self) -> Result<Vec<BrokerPosition>>;
}

/// Sort ascending, drop duplicate timestamps and keep the last `count` bars.
pub(crate) fn normalize_bars(mut bars: Vec<Bar>, count: usize) -> Vec<Bar> {
    bars.sort_by_key(|b| b.time);
    bars.dedup_by_key(|b| b.time);
    if bars.len() > count {
        bars.drain(..bars.len() - count);
    }
    bars
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::test_support::flat_bars;
    use rust_decimal_macros::dec;

    #[test]
    fn test_normalize_bars() {
        let mut bars = flat_bars(5, dec!(10));
        bars.reverse();
        bars.push(bars[0].clone());

        let out = normalize_bars(bars, 3);
        assert_eq!(out.len(), 3);
        assert!(out.windows(2).all(|w| w[0].time < w[1].time));
    }
}
