//! Trade signals and their sized form.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Candidate trade produced by a strategy. Immutable once issued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub entry_price: Decimal,
    pub stop_price: Decimal,
    pub target1: Decimal,
    pub target2: Decimal,
    /// Estimated probability of success (0.0 to 1.0), also used to rank candidates
    pub probability: f64,
    pub strategy: String,
}

impl Signal {
    /// Per-share capital at risk.
    pub fn stop_distance(&self) -> Decimal {
        self.entry_price - self.stop_price
    }

    /// Reward to target1 over risk to stop. Zero when the stop distance is not positive.
    pub fn risk_reward(&self) -> Decimal {
        let risk = self.stop_distance();
        if risk <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        (self.target1 - self.entry_price) / risk
    }

    /// Fractional gain from entry to target1.
    pub fn expected_return(&self) -> Decimal {
        if self.entry_price <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        (self.target1 - self.entry_price) / self.entry_price
    }
}

/// A signal that passed the sizing gates, with its share count and cost/risk breakdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizedPosition {
    pub signal: Signal,
    pub quantity: u64,
    /// quantity * entry
    pub invest_amount: Decimal,
    /// quantity * stop distance plus estimated round-trip costs
    pub risk_amount: Decimal,
    /// Round-trip commission, slippage and tax included in `risk_amount`
    pub cost_estimate: Decimal,
    /// invest_amount / capital
    pub allocation_pct: Decimal,
    /// risk_amount / capital
    pub risk_pct: Decimal,
}
