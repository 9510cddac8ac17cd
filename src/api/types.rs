//! Broker order and position types.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::trading::Side;

/// Market order request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub client_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: u64,
    /// Reference price used for logging and paper fills
    pub reference_price: Option<Decimal>,
}

impl Order {
    pub fn market(symbol: &str, side: Side, quantity: u64, reference_price: Option<Decimal>) -> Self {
        Self {
            client_order_id: uuid::Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            side,
            quantity,
            reference_price,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Filled,
    Rejected,
}

/// Broker acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    pub order_id: String,
    pub status: OrderStatus,
    pub filled_quantity: u64,
    pub avg_price: Option<Decimal>,
    #[serde(default)]
    pub message: Option<String>,
}

impl OrderResult {
    pub fn is_filled(&self) -> bool {
        self.status == OrderStatus::Filled
    }
}

/// Holding reported by the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub symbol: String,
    pub quantity: u64,
    pub avg_price: Decimal,
}
