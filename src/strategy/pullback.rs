//! Trend pullback: price above the 50-bar average, low touching the 20-bar
//! average, on below-average volume.

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal_macros::dec;

use crate::models::{avg_volume, sma_close, Bar, Signal};
use super::SignalDetector;

#[derive(Debug, Clone)]
pub struct PullbackDetector {
    pub trend_period: usize,
    pub pullback_period: usize,
    /// How close the low must come to the short average (fraction above it)
    pub touch_tolerance: Decimal,
    /// Stop placed this fraction below the short average
    pub stop_buffer: Decimal,
}

impl Default for PullbackDetector {
    fn default() -> Self {
        Self {
            trend_period: 50,
            pullback_period: 20,
            touch_tolerance: dec!(0.01),
            stop_buffer: dec!(0.03),
        }
    }
}

impl SignalDetector for PullbackDetector {
    fn name(&self) -> &str {
        "pullback"
    }

    fn min_bars(&self) -> usize {
        60
    }

    fn detect(&self, symbol: &str, bars: &[Bar]) -> Option<Signal> {
        if bars.len() < self.min_bars() {
            return None;
        }
        let last = bars.last()?;
        let trend = sma_close(bars, self.trend_period)?;
        let short = sma_close(bars, self.pullback_period)?;
        let volume = avg_volume(bars, self.pullback_period)?;

        let touched = last.low <= short * (Decimal::ONE + self.touch_tolerance);
        let held = last.close >= short;
        let quiet = volume > 0.0 && (last.volume as f64) < volume;
        if last.close <= trend || !touched || !held || !quiet {
            return None;
        }

        let entry = last.close;
        let stop = short * (Decimal::ONE - self.stop_buffer);
        let risk = entry - stop;
        if risk <= Decimal::ZERO {
            return None;
        }

        // Stronger trends rank higher
        let strength = ((entry / trend) - Decimal::ONE).to_f64().unwrap_or(0.0);

        Some(Signal {
            symbol: symbol.to_string(),
            entry_price: entry,
            stop_price: stop,
            target1: entry + risk * dec!(2),
            target2: entry + risk * dec!(3),
            probability: (0.5 + strength * 2.0).clamp(0.0, 0.8),
            strategy: self.name().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::test_support::bars_from;

    fn rising_then_dip() -> Vec<Bar> {
        let mut prices: Vec<_> = (0..59)
            .map(|i| {
                let c = Decimal::from(100 + i);
                (c, c + dec!(1), c - dec!(1), c)
            })
            .collect();
        prices.push((dec!(152), dec!(153), dec!(149), dec!(151)));
        let mut bars = bars_from(&prices);
        if let Some(last) = bars.last_mut() {
            last.volume = 500;
        }
        bars
    }

    #[test]
    fn test_detects_pullback() {
        let bars = rising_then_dip();
        let signal = PullbackDetector::default().detect("AAA", &bars).unwrap();
        assert_eq!(signal.entry_price, dec!(151));
        assert!(signal.stop_price < signal.entry_price);
        assert!(signal.target1 > signal.entry_price);
        assert!(signal.target2 > signal.target1);
        assert_eq!(signal.strategy, "pullback");
    }

    #[test]
    fn test_requires_quiet_volume() {
        let mut bars = rising_then_dip();
        if let Some(last) = bars.last_mut() {
            last.volume = 5_000;
        }
        assert!(PullbackDetector::default().detect("AAA", &bars).is_none());
    }

    #[test]
    fn test_abstains_on_short_history() {
        let bars = rising_then_dip();
        assert!(PullbackDetector::default().detect("AAA", &bars[1..]).is_none());
    }
}
