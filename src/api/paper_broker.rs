//! Simulated broker for dry runs and tests.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tracing::info;

use crate::trading::{CostConfig, Side};
use super::{Broker, BrokerPosition, DataSource, Order, OrderResult, OrderStatus};

/// Fills market orders immediately at the quote plus slippage.
pub struct PaperBroker {
    costs: CostConfig,
    quotes: RwLock<HashMap<String, Decimal>>,
    source: Option<Arc<dyn DataSource>>,
    positions: RwLock<HashMap<String, BrokerPosition>>,
    fills: RwLock<Vec<OrderResult>>,
}

impl PaperBroker {
    pub fn new(costs: CostConfig) -> Self {
        Self {
            costs,
            quotes: RwLock::new(HashMap::new()),
            source: None,
            positions: RwLock::new(HashMap::new()),
            fills: RwLock::new(Vec::new()),
        }
    }

    /// Quote symbols without a manual price from the latest close of `source`.
    pub fn with_source(mut self, source: Arc<dyn DataSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub async fn set_quote(&self, symbol: &str, price: Decimal) {
        self.quotes.write().await.insert(symbol.to_string(), price);
    }

    /// Seed a holding, e.g. when restoring state.
    pub async fn set_position(&self, symbol: &str, quantity: u64, avg_price: Decimal) {
        self.positions.write().await.insert(
            symbol.to_string(),
            BrokerPosition { symbol: symbol.to_string(), quantity, avg_price },
        );
    }

    pub async fn fills(&self) -> Vec<OrderResult> {
        self.fills.read().await.clone()
    }

    fn rejected(order: &Order, message: &str) -> OrderResult {
        OrderResult {
            order_id: order.client_order_id.clone(),
            status: OrderStatus::Rejected,
            filled_quantity: 0,
            avg_price: None,
            message: Some(message.to_string()),
        }
    }
}

#[async_trait]
impl Broker for PaperBroker {
    async fn quote(&self, symbol: &str) -> Result<Decimal> {
        if let Some(price) = self.quotes.read().await.get(symbol) {
            return Ok(*price);
        }
        let source = self
            .source
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("No quote for {}", symbol))?;
        let bars = source
            .daily_bars(symbol, 1)
            .await
            .with_context(|| format!("Failed to quote {}", symbol))?;
        bars.last()
            .map(|b| b.close)
            .ok_or_else(|| anyhow::anyhow!("No bars to quote {}", symbol))
    }

    async fn place_order(&self, order: &Order) -> Result<OrderResult> {
        if order.quantity == 0 {
            return Ok(Self::rejected(order, "zero quantity"));
        }
        let reference = match order.reference_price {
            Some(price) => price,
            None => self.quote(&order.symbol).await?,
        };
        let fill = self.costs.apply_slippage(reference, order.side);
        let qty = Decimal::from(order.quantity);

        let mut positions = self.positions.write().await;
        match order.side {
            Side::Buy => {
                let entry = positions.entry(order.symbol.clone()).or_insert(BrokerPosition {
                    symbol: order.symbol.clone(),
                    quantity: 0,
                    avg_price: Decimal::ZERO,
                });
                let held = Decimal::from(entry.quantity);
                entry.avg_price = (entry.avg_price * held + fill * qty) / (held + qty);
                entry.quantity += order.quantity;
            }
            Side::Sell => {
                let held = positions.get(&order.symbol).map(|p| p.quantity).unwrap_or(0);
                if held < order.quantity {
                    return Ok(Self::rejected(order, "insufficient position"));
                }
                if held == order.quantity {
                    positions.remove(&order.symbol);
                } else if let Some(p) = positions.get_mut(&order.symbol) {
                    p.quantity -= order.quantity;
                }
            }
        }
        drop(positions);

        info!(
            symbol = %order.symbol,
            side = ?order.side,
            quantity = order.quantity,
            price = %fill,
            "[PAPER] Order filled"
        );

        let result = OrderResult {
            order_id: order.client_order_id.clone(),
            status: OrderStatus::Filled,
            filled_quantity: order.quantity,
            avg_price: Some(fill),
            message: None,
        };
        self.fills.write().await.push(result.clone());
        Ok(result)
    }

    async fn positions(&self) -> Result<Vec<BrokerPosition>> {
        let mut out: Vec<_> = self.positions.read().await.values().cloned().collect();
        out.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(out)
    }
}
