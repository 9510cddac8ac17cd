//! Risk and cost configuration.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Per-trade risk budget and entry gates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Fraction of capital risked per trade (0.0 to 1.0)
    pub risk_per_trade: Decimal,

    /// Maximum fraction of capital in a single symbol
    pub max_position_pct: Decimal,

    /// Minimum reward-to-risk, measured to target1
    pub min_risk_reward: Decimal,

    /// Minimum fractional gain from entry to target1
    pub min_expected_return: Decimal,

    /// Maximum concurrent open positions
    pub max_positions: usize,

    /// Time stop in trading days
    pub max_hold_days: u32,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            risk_per_trade: dec!(0.01),      // 1% of capital
            max_position_pct: dec!(0.20),    // 20% per symbol
            min_risk_reward: dec!(1.5),
            min_expected_return: dec!(0.02), // 2% to target1
            max_positions: 5,
            max_hold_days: 10,
        }
    }
}

impl RiskConfig {
    /// Check that the expected-return floor clears the round-trip cost drag.
    pub fn validate(&self, costs: &CostConfig) -> anyhow::Result<()> {
        if self.risk_per_trade <= Decimal::ZERO || self.risk_per_trade > Decimal::ONE {
            anyhow::bail!("risk_per_trade must be in (0, 1], got {}", self.risk_per_trade);
        }
        if self.max_position_pct <= Decimal::ZERO || self.max_position_pct > Decimal::ONE {
            anyhow::bail!("max_position_pct must be in (0, 1], got {}", self.max_position_pct);
        }
        let drag = costs.round_trip_rate();
        if self.min_expected_return <= drag {
            anyhow::bail!(
                "min_expected_return {} must exceed round-trip cost {}",
                self.min_expected_return,
                drag
            );
        }
        Ok(())
    }
}

/// Side of a fill, for slippage direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

/// Transaction cost model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostConfig {
    /// Commission per side (fraction of notional)
    pub commission_rate: Decimal,

    /// Slippage per side (fraction of price)
    pub slippage_rate: Decimal,

    /// Tax charged on sells only
    pub sell_tax_rate: Decimal,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            commission_rate: dec!(0.00015), // 0.015% per side
            slippage_rate: dec!(0.001),     // 0.1% per side
            sell_tax_rate: dec!(0.0023),    // 0.23% on sells
        }
    }
}

impl CostConfig {
    /// Zero-cost model.
    pub fn frictionless() -> Self {
        Self {
            commission_rate: Decimal::ZERO,
            slippage_rate: Decimal::ZERO,
            sell_tax_rate: Decimal::ZERO,
        }
    }

    /// Total fractional drag of a buy and a sell.
    pub fn round_trip_rate(&self) -> Decimal {
        dec!(2) * self.commission_rate + dec!(2) * self.slippage_rate + self.sell_tax_rate
    }

    /// Apply slippage to a price.
    pub fn apply_slippage(&self, price: Decimal, side: Side) -> Decimal {
        match side {
            Side::Buy => price * (Decimal::ONE + self.slippage_rate),
            Side::Sell => price * (Decimal::ONE - self.slippage_rate),
        }
    }

    /// Commission plus any tax on a fill of `notional`.
    pub fn fees(&self, notional: Decimal, side: Side) -> Decimal {
        match side {
            Side::Buy => notional * self.commission_rate,
            Side::Sell => notional * (self.commission_rate + self.sell_tax_rate),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_rate() {
        let costs = CostConfig::default();
        assert_eq!(costs.round_trip_rate(), dec!(0.0045));
    }

    #[test]
    fn test_validate_rejects_floor_below_costs() {
        let risk = RiskConfig {
            min_expected_return: dec!(0.004),
            ..Default::default()
        };
        assert!(risk.validate(&CostConfig::default()).is_err());
        assert!(RiskConfig::default().validate(&CostConfig::default()).is_ok());
    }

    #[test]
    fn test_slippage_direction() {
        let costs = CostConfig::default();
        assert_eq!(costs.apply_slippage(dec!(100), Side::Buy), dec!(100.1));
        assert_eq!(costs.apply_slippage(dec!(100), Side::Sell), dec!(99.9));
        assert_eq!(costs.fees(dec!(1000), Side::Sell), dec!(2.45));
    }
}
