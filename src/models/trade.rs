//! Closed trades and exit reasons.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};

use super::Position;

/// Why (part of) a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitReason {
    Stop,
    /// Full exit of a single-share position at target1
    Target,
    /// Partial exit at target1
    Target1,
    Target2,
    Timeout,
    /// Forced close at the end of a simulation
    End,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::Stop => "stop",
            ExitReason::Target => "target",
            ExitReason::Target1 => "target1",
            ExitReason::Target2 => "target2",
            ExitReason::Timeout => "timeout",
            ExitReason::End => "end",
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A closed trade (or the closed part of a position). Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub symbol: String,
    pub strategy: String,
    pub quantity: u64,
    pub entry_price: Decimal,
    pub original_stop: Decimal,
    pub target1: Decimal,
    pub target2: Decimal,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub exit_price: Decimal,
    pub exit_reason: ExitReason,
    /// Net of commission, slippage and tax
    pub pnl: Decimal,
    pub pnl_pct: f64,
    pub r_multiple: f64,
    pub is_win: bool,
}

impl Trade {
    /// Record the exit of `quantity` shares of `position`.
    ///
    /// `costs` is the total commission and tax paid on both legs for these shares.
    pub fn close(
        position: &Position,
        quantity: u64,
        exit_price: Decimal,
        exit_time: DateTime<Utc>,
        exit_reason: ExitReason,
        costs: Decimal,
    ) -> Self {
        let gross = (exit_price - position.entry_price) * Decimal::from(quantity);
        let pnl = gross - costs;
        let basis = position.entry_price * Decimal::from(quantity);

        let pnl_pct = if basis > Decimal::ZERO {
            (pnl / basis).to_f64().unwrap_or(0.0)
        } else {
            0.0
        };

        let risk = position.risk_per_share();
        let r_multiple = if risk > Decimal::ZERO {
            ((exit_price - position.entry_price) / risk).to_f64().unwrap_or(0.0)
        } else {
            0.0
        };

        Self {
            symbol: position.symbol.clone(),
            strategy: position.strategy.clone(),
            quantity,
            entry_price: position.entry_price,
            original_stop: position.original_stop,
            target1: position.target1,
            target2: position.target2,
            entry_time: position.entry_time,
            exit_time,
            exit_price,
            exit_reason,
            pnl,
            pnl_pct,
            r_multiple,
            is_win: pnl > Decimal::ZERO,
        }
    }
}
