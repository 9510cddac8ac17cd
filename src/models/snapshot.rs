//! Per-day portfolio snapshots and equity points.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// End-of-day state of a simulated portfolio. `cash + position_value == equity`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailySnapshot {
    pub date: NaiveDate,
    pub equity: Decimal,
    pub cash: Decimal,
    pub position_value: Decimal,
    pub open_positions: usize,
    pub day_pnl: Decimal,
    pub day_return: f64,
}

/// One point of an equity curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub time: DateTime<Utc>,
    pub equity: Decimal,
}
