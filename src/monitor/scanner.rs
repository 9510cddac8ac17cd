//! Scan-and-execute cycle: strategies to sized, registered positions.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use rust_decimal::Decimal;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::api::{Broker, Order};
use crate::db::PositionPlanStore;
use crate::models::{Position, Signal};
use crate::strategy::Strategy;
use crate::trading::{PositionSizer, Side};
use super::{LiveMonitor, MonitorConfig, PositionBook};

/// Runs strategies over a symbol list and opens what passes sizing.
pub struct Scanner {
    strategies: Vec<Arc<dyn Strategy>>,
    sizer: PositionSizer,
    broker: Arc<dyn Broker>,
    store: Arc<dyn PositionPlanStore>,
    book: Arc<PositionBook>,
    config: MonitorConfig,
}

impl Scanner {
    pub fn new(
        config: MonitorConfig,
        strategies: Vec<Arc<dyn Strategy>>,
        broker: Arc<dyn Broker>,
        store: Arc<dyn PositionPlanStore>,
        book: Arc<PositionBook>,
    ) -> Self {
        let sizer = PositionSizer::new(config.risk.clone(), config.costs.clone());
        Self { strategies, sizer, broker, store, book, config }
    }

    /// Open positions for the first signal found per unheld symbol.
    pub async fn scan_and_execute(&self, symbols: &[String]) -> Result<Vec<Position>> {
        let max_positions = self.config.risk.max_positions;
        let held: HashSet<String> = self.book.snapshot().await.into_iter().map(|p| p.symbol).collect();
        let mut opened = Vec::new();

        for symbol in symbols.iter().filter(|s| !held.contains(*s)) {
            if self.book.len().await >= max_positions {
                debug!(max_positions = max_positions, "Position limit reached, stopping scan");
                break;
            }

            let Some(signal) = self.first_signal(symbol).await else {
                continue;
            };

            let sized = match self.sizer.size(&signal, self.config.capital) {
                Ok(sized) => sized,
                Err(rejection) => {
                    info!(symbol = %symbol, reason = %rejection, "Signal rejected by sizer");
                    continue;
                }
            };

            let Some(fill) = self.buy(&signal, sized.quantity).await else {
                continue;
            };

            let position = Position::open(&sized, fill, Utc::now(), self.config.risk.max_hold_days);
            if let Err(e) = self.book.register(position.clone()).await {
                warn!(symbol = %symbol, error = %e, "Could not register position");
                continue;
            }
            LiveMonitor::save_plan(self.store.as_ref(), &position).await?;

            info!(
                symbol = %symbol,
                strategy = %position.strategy,
                qty = position.quantity,
                entry = %position.entry_price,
                stop = %position.stop_price,
                "Opened position"
            );
            opened.push(position);
        }

        Ok(opened)
    }

    async fn first_signal(&self, symbol: &str) -> Option<Signal> {
        for strategy in &self.strategies {
            match strategy.analyze(symbol).await {
                Ok(Some(signal)) => return Some(signal),
                Ok(None) => {}
                Err(e) => warn!(symbol = %symbol, strategy = strategy.name(), error = %e, "Strategy failed"),
            }
        }
        None
    }

    /// Entry fill price, or `None` if the order did not fill.
    async fn buy(&self, signal: &Signal, quantity: u64) -> Option<Decimal> {
        if self.config.dry_run {
            info!(
                symbol = %signal.symbol,
                quantity = quantity,
                price = %signal.entry_price,
                "[DRY RUN] Would buy"
            );
            return Some(self.config.costs.apply_slippage(signal.entry_price, Side::Buy));
        }

        let order = Order::market(&signal.symbol, Side::Buy, quantity, Some(signal.entry_price));
        match timeout(self.config.order_timeout(), self.broker.place_order(&order)).await {
            Ok(Ok(result)) if result.is_filled() => Some(result.avg_price.unwrap_or(signal.entry_price)),
            Ok(Ok(result)) => {
                warn!(symbol = %signal.symbol, message = ?result.message, "Buy order not filled");
                None
            }
            Ok(Err(e)) => {
                warn!(symbol = %signal.symbol, error = %e, "Buy order failed");
                None
            }
            Err(_) => {
                warn!(symbol = %signal.symbol, "Buy order timed out");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::PaperBroker;
    use crate::db::MemoryPlanStore;
    use crate::trading::{CostConfig, RiskConfig};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;

    /// Signals for a fixed set of symbols.
    struct FixedStrategy {
        symbols: Vec<&'static str>,
    }

    #[async_trait]
    impl Strategy for FixedStrategy {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn analyze(&self, symbol: &str) -> Result<Option<Signal>> {
            if symbol == "ERR" {
                anyhow::bail!("no data");
            }
            if !self.symbols.iter().any(|s| *s == symbol) {
                return Ok(None);
            }
            Ok(Some(Signal {
                symbol: symbol.to_string(),
                entry_price: dec!(100),
                stop_price: dec!(97),
                target1: dec!(106),
                target2: dec!(109),
                probability: 0.6,
                strategy: "fixed".into(),
            }))
        }
    }

    fn scanner(max_positions: usize, broker: Arc<PaperBroker>, store: Arc<MemoryPlanStore>) -> Scanner {
        let config = MonitorConfig {
            dry_run: false,
            costs: CostConfig::frictionless(),
            risk: RiskConfig { max_positions, ..Default::default() },
            ..Default::default()
        };
        let strategy: Arc<dyn Strategy> = Arc::new(FixedStrategy { symbols: vec!["AAA", "BBB"] });
        Scanner::new(config, vec![strategy], broker, store, Arc::new(PositionBook::new()))
    }

    fn symbols(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_opens_sized_position_and_saves_plan() {
        let broker = Arc::new(PaperBroker::new(CostConfig::frictionless()));
        let store = Arc::new(MemoryPlanStore::new());
        let scanner = scanner(5, broker.clone(), store.clone());

        let opened = scanner.scan_and_execute(&symbols(&["ERR", "AAA", "CCC"])).await.unwrap();
        assert_eq!(opened.len(), 1);
        // Allocation cap: 20% of 100k at 100
        assert_eq!(opened[0].quantity, 200);
        assert_eq!(broker.positions().await.unwrap()[0].quantity, 200);
        assert_eq!(store.get("AAA").await.unwrap().unwrap().quantity, 200);

        // Already held
        let again = scanner.scan_and_execute(&symbols(&["AAA"])).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_respects_position_limit() {
        let broker = Arc::new(PaperBroker::new(CostConfig::frictionless()));
        let store = Arc::new(MemoryPlanStore::new());
        let scanner = scanner(1, broker, store.clone());

        let opened = scanner.scan_and_execute(&symbols(&["AAA", "BBB"])).await.unwrap();
        assert_eq!(opened.len(), 1);
        assert_eq!(store.all().await.unwrap().len(), 1);
    }
}
