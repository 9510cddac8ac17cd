//! Open position owned by a backtester or the live monitor.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::SizedPosition;

/// An open position.
///
/// Only `ExitEngine` transitions mutate it: the quantity only shrinks, the
/// stop only moves to breakeven, and `target1_hit` never reverts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub strategy: String,
    pub quantity: u64,
    pub entry_price: Decimal,
    /// Current stop (moves to entry after target1)
    pub stop_price: Decimal,
    /// Stop at entry time, used for R-multiples
    pub original_stop: Decimal,
    pub target1: Decimal,
    pub target2: Decimal,
    pub target1_hit: bool,
    pub entry_time: DateTime<Utc>,
    pub max_hold_days: u32,
}

impl Position {
    /// Open a position from a sized signal at the given fill.
    pub fn open(
        sized: &SizedPosition,
        fill_price: Decimal,
        entry_time: DateTime<Utc>,
        max_hold_days: u32,
    ) -> Self {
        let signal = &sized.signal;
        Self {
            symbol: signal.symbol.clone(),
            strategy: signal.strategy.clone(),
            quantity: sized.quantity,
            entry_price: fill_price,
            stop_price: signal.stop_price,
            original_stop: signal.stop_price,
            target1: signal.target1,
            target2: signal.target2,
            target1_hit: false,
            entry_time,
            max_hold_days,
        }
    }

    /// Market value at `price`.
    pub fn value_at(&self, price: Decimal) -> Decimal {
        Decimal::from(self.quantity) * price
    }

    /// Unrealized P&L at `price`, before costs.
    pub fn pnl_at(&self, price: Decimal) -> Decimal {
        (price - self.entry_price) * Decimal::from(self.quantity)
    }

    /// Initial per-share risk.
    pub fn risk_per_share(&self) -> Decimal {
        self.entry_price - self.original_stop
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Signal;
    use rust_decimal_macros::dec;

    #[test]
    fn test_open_from_sized() {
        let sized = SizedPosition {
            signal: Signal {
                symbol: "AAA".into(),
                entry_price: dec!(100),
                stop_price: dec!(98),
                target1: dec!(103),
                target2: dec!(106),
                probability: 0.6,
                strategy: "pullback".into(),
            },
            quantity: 100,
            invest_amount: dec!(10000),
            risk_amount: dec!(200),
            cost_estimate: Decimal::ZERO,
            allocation_pct: dec!(0.1),
            risk_pct: dec!(0.002),
        };

        let pos = Position::open(&sized, dec!(100.1), Utc::now(), 10);
        assert_eq!(pos.quantity, 100);
        assert_eq!(pos.original_stop, dec!(98));
        assert!(!pos.target1_hit);
        assert_eq!(pos.pnl_at(dec!(101.1)), dec!(100));
        assert_eq!(pos.value_at(dec!(2)), dec!(200));
    }
}
