//! Range breakout on expanding volume.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::models::{avg_volume, sma_close, Bar, Signal};
use super::SignalDetector;

#[derive(Debug, Clone)]
pub struct BreakoutDetector {
    pub range_period: usize,
    pub trend_period: usize,
    /// Required multiple of average volume on the breakout bar
    pub volume_surge: f64,
    /// Bars whose lowest low sets the stop
    pub stop_lookback: usize,
}

impl Default for BreakoutDetector {
    fn default() -> Self {
        Self {
            range_period: 20,
            trend_period: 50,
            volume_surge: 1.5,
            stop_lookback: 5,
        }
    }
}

impl SignalDetector for BreakoutDetector {
    fn name(&self) -> &str {
        "breakout"
    }

    /// The range window needs one bar beyond it for the breakout bar.
    fn min_bars(&self) -> usize {
        (self.range_period + 1)
            .max(self.trend_period)
            .max(self.stop_lookback)
            .max(60)
    }

    fn detect(&self, symbol: &str, bars: &[Bar]) -> Option<Signal> {
        if bars.len() < self.min_bars() {
            return None;
        }
        let (last, history) = bars.split_last()?;
        let range_start = history.len().checked_sub(self.range_period)?;
        let range_high = history[range_start..]
            .iter()
            .map(|b| b.high)
            .max()?;
        let trend = sma_close(bars, self.trend_period)?;
        let volume = avg_volume(bars, self.range_period)?;
        if volume <= 0.0 {
            return None;
        }
        let surge = last.volume as f64 / volume;

        if last.close <= range_high || last.close <= trend || surge < self.volume_surge {
            return None;
        }

        let stop_start = bars.len().checked_sub(self.stop_lookback)?;
        let stop = bars[stop_start..]
            .iter()
            .map(|b| b.low)
            .min()?;
        let entry = last.close;
        let risk = entry - stop;
        if risk <= Decimal::ZERO {
            return None;
        }

        Some(Signal {
            symbol: symbol.to_string(),
            entry_price: entry,
            stop_price: stop,
            target1: entry + risk * dec!(2),
            target2: entry + risk * dec!(3),
            probability: (0.4 + surge / 10.0).min(0.75),
            strategy: self.name().to_string(),
        })
    }
}
