//! Risk-based position sizing with allocation caps and cost-aware entry gates.

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use thiserror::Error;
use tracing::debug;

use crate::models::{Signal, SizedPosition};
use super::{CostConfig, RiskConfig};

/// Why a signal was not sized.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SizingRejection {
    #[error("capital ({0}) or entry price is not positive")]
    InvalidEntry(Decimal),

    #[error("stop {stop} is not below entry {entry}")]
    InvalidStop { entry: Decimal, stop: Decimal },

    #[error("risk/reward {actual} below minimum {minimum}")]
    RiskRewardTooLow { actual: Decimal, minimum: Decimal },

    #[error("expected return {actual} below minimum {minimum}")]
    ExpectedReturnTooLow { actual: Decimal, minimum: Decimal },

    #[error("expected return {actual} does not cover round-trip costs {costs}")]
    EdgeBelowCosts { actual: Decimal, costs: Decimal },

    #[error("entry {entry} exceeds maximum allocation {max_allocation}")]
    EntryExceedsAllocation { entry: Decimal, max_allocation: Decimal },
}

/// Converts signals into share counts under a per-trade risk budget.
#[derive(Debug, Clone)]
pub struct PositionSizer {
    risk: RiskConfig,
    costs: CostConfig,
}

impl PositionSizer {
    pub fn new(risk: RiskConfig, costs: CostConfig) -> Self {
        Self { risk, costs }
    }

    /// Size `signal` against `capital`.
    ///
    /// Gates run before any sizing: positive entry, positive stop distance,
    /// minimum risk/reward, minimum expected return (which must also clear
    /// round-trip costs), and an entry price that fits the allocation cap.
    pub fn size(&self, signal: &Signal, capital: Decimal) -> Result<SizedPosition, SizingRejection> {
        if capital <= Decimal::ZERO || signal.entry_price <= Decimal::ZERO {
            return Err(SizingRejection::InvalidEntry(capital));
        }

        let stop_distance = signal.stop_distance();
        if stop_distance <= Decimal::ZERO {
            return Err(SizingRejection::InvalidStop {
                entry: signal.entry_price,
                stop: signal.stop_price,
            });
        }

        let risk_reward = signal.risk_reward();
        if risk_reward < self.risk.min_risk_reward {
            return Err(SizingRejection::RiskRewardTooLow {
                actual: risk_reward,
                minimum: self.risk.min_risk_reward,
            });
        }

        let expected = signal.expected_return();
        if expected < self.risk.min_expected_return {
            return Err(SizingRejection::ExpectedReturnTooLow {
                actual: expected,
                minimum: self.risk.min_expected_return,
            });
        }
        let drag = self.costs.round_trip_rate();
        if expected <= drag {
            return Err(SizingRejection::EdgeBelowCosts { actual: expected, costs: drag });
        }

        let max_allocation = self.risk.max_position_pct * capital;
        if signal.entry_price > max_allocation {
            return Err(SizingRejection::EntryExceedsAllocation {
                entry: signal.entry_price,
                max_allocation,
            });
        }

        let by_risk = risk_quantity(capital, self.risk.risk_per_trade, stop_distance);
        let by_allocation = floor_quantity(max_allocation / signal.entry_price);
        let quantity = by_risk.min(by_allocation).max(1);

        let qty = Decimal::from(quantity);
        let invest_amount = qty * signal.entry_price;
        let per_side = self.costs.commission_rate + self.costs.slippage_rate;
        let cost_estimate = invest_amount * per_side
            + qty * signal.stop_price * (per_side + self.costs.sell_tax_rate);
        let risk_amount = qty * stop_distance + cost_estimate;

        debug!(
            symbol = %signal.symbol,
            by_risk = by_risk,
            by_allocation = by_allocation,
            quantity = quantity,
            "Sized signal"
        );

        Ok(SizedPosition {
            signal: signal.clone(),
            quantity,
            invest_amount,
            risk_amount,
            cost_estimate,
            allocation_pct: invest_amount / capital,
            risk_pct: risk_amount / capital,
        })
    }
}

/// `floor(capital * risk_fraction / stop_distance)`, zero when the distance is not positive.
pub fn risk_quantity(capital: Decimal, risk_fraction: Decimal, stop_distance: Decimal) -> u64 {
    if stop_distance <= Decimal::ZERO || capital <= Decimal::ZERO {
        return 0;
    }
    floor_quantity(capital * risk_fraction / stop_distance)
}

/// Whole shares in a non-negative decimal amount.
pub(crate) fn floor_quantity(shares: Decimal) -> u64 {
    if shares <= Decimal::ZERO {
        return 0;
    }
    shares.floor().to_u64().unwrap_or(0)
}
