//! Daily OHLCV bar.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One daily candle. Series are always ascending by `time`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    #[serde(default)]
    pub volume: u64,
}

impl Bar {
    /// Trading date of this bar (UTC).
    pub fn date(&self) -> NaiveDate {
        self.time.date_naive()
    }
}

/// Simple moving average of closes over the last `period` bars.
pub fn sma_close(bars: &[Bar], period: usize) -> Option<Decimal> {
    if period == 0 || bars.len() < period {
        return None;
    }
    let sum: Decimal = bars[bars.len() - period..].iter().map(|b| b.close).sum();
    Some(sum / Decimal::from(period as u64))
}

/// Average volume over the `period` bars preceding the last one.
pub fn avg_volume(bars: &[Bar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }
    let end = bars.len() - 1;
    let total: u64 = bars[end - period..end].iter().map(|b| b.volume).sum();
    Some(total as f64 / period as f64)
}
