//! One symbol, one trade at a time.

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use tracing::{debug, info};

use crate::metrics::StatsEngine;
use crate::models::{Bar, EquityPoint, ExitReason, Position, Trade};
use crate::strategy::SignalDetector;
use crate::trading::{floor_quantity, risk_quantity, ExitAction, ExitEngine, Observation, Side};
use super::{realize_exit, BacktestConfig, BacktestResult};

/// Replays a detector over a symbol's daily bars.
pub struct SingleAssetBacktester {
    config: BacktestConfig,
}

struct TradeOutcome {
    exit_index: usize,
    trades: Vec<Trade>,
}

impl SingleAssetBacktester {
    pub fn new(config: BacktestConfig) -> Self {
        Self { config }
    }

    /// Run over `bars` (ascending). Returns `None` when history is too short.
    ///
    /// At bar `i` the detector sees `bars[..=i]`; an entry fills at the open
    /// of bar `i + 1`. Trades never overlap.
    pub fn run(&self, symbol: &str, bars: &[Bar], detector: &dyn SignalDetector) -> Option<BacktestResult> {
        let min_bars = self.config.min_bars.max(1);
        if bars.len() < min_bars {
            debug!(symbol = %symbol, bars = bars.len(), "Not enough history, abstaining");
            return None;
        }

        let costs = &self.config.costs;
        let max_hold = self.config.max_hold_days.max(1) as usize;
        let last_signal = bars.len().saturating_sub(max_hold);

        let mut cash = self.config.initial_capital;
        let mut equity: Vec<Decimal> = Vec::with_capacity(bars.len());
        let mut trades: Vec<Trade> = Vec::new();
        let mut total_fees = Decimal::ZERO;

        let mut i = min_bars;
        while i < last_signal {
            let Some(signal) = detector.detect(symbol, &bars[..=i]) else {
                i += 1;
                continue;
            };

            let entry_bar = &bars[i + 1];
            let entry_price = costs.apply_slippage(entry_bar.open, Side::Buy);
            let stop_distance = entry_price - signal.stop_price;
            if stop_distance <= Decimal::ZERO {
                debug!(symbol = %symbol, entry = %entry_price, stop = %signal.stop_price, "Gap through stop, skipping");
                i += 1;
                continue;
            }

            let by_risk = risk_quantity(cash, self.config.risk_per_trade, stop_distance);
            let affordable = floor_quantity(cash / (entry_price * (Decimal::ONE + costs.commission_rate)));
            let quantity = by_risk.min(affordable);
            if quantity == 0 {
                i += 1;
                continue;
            }

            let notional = entry_price * Decimal::from(quantity);
            let entry_fee = costs.fees(notional, Side::Buy);
            cash -= notional + entry_fee;
            total_fees += entry_fee;

            while equity.len() <= i {
                equity.push(cash + notional + entry_fee);
            }

            let position = Position {
                symbol: symbol.to_string(),
                strategy: signal.strategy.clone(),
                quantity,
                entry_price,
                stop_price: signal.stop_price,
                original_stop: signal.stop_price,
                target1: signal.target1,
                target2: signal.target2,
                target1_hit: false,
                entry_time: entry_bar.time,
                max_hold_days: max_hold as u32,
            };

            debug!(
                symbol = %symbol,
                date = %entry_bar.date(),
                quantity = quantity,
                price = %entry_price,
                "Entered"
            );

            let entry_fee_per_share = entry_fee / Decimal::from(quantity);
            let outcome = self.hold(bars, i, position, entry_fee_per_share, &mut cash, &mut equity, &mut total_fees);
            trades.extend(outcome.trades);
            i = outcome.exit_index + 1;
        }

        while equity.len() < bars.len() {
            equity.push(cash);
        }

        let initial = self.config.initial_capital;
        let total_return = if initial > Decimal::ZERO {
            ((cash - initial) / initial).to_f64().unwrap_or(0.0)
        } else {
            0.0
        };
        let stats = StatsEngine::calculate(&trades, &equity);
        let equity_curve = bars
            .iter()
            .zip(&equity)
            .map(|(bar, value)| EquityPoint { time: bar.time, equity: *value })
            .collect();

        info!(
            symbol = %symbol,
            trades = trades.len(),
            final_capital = %cash.round_dp(2),
            "Backtest complete"
        );

        Some(BacktestResult {
            symbol: symbol.to_string(),
            strategy: detector.name().to_string(),
            start_time: bars[0].time,
            end_time: bars[bars.len() - 1].time,
            initial_capital: initial,
            final_capital: cash,
            total_return,
            total_fees,
            trades,
            equity_curve,
            stats,
        })
    }

    /// Step the exit engine from bar `signal_index + 1` until the position closes.
    #[allow(clippy::too_many_arguments)]
    fn hold(
        &self,
        bars: &[Bar],
        signal_index: usize,
        mut position: Position,
        entry_fee_per_share: Decimal,
        cash: &mut Decimal,
        equity: &mut Vec<Decimal>,
        total_fees: &mut Decimal,
    ) -> TradeOutcome {
        let costs = &self.config.costs;
        let last = (signal_index + position.max_hold_days as usize).min(bars.len() - 1);
        let mut trades = Vec::new();

        for j in signal_index + 1..=last {
            let bar = &bars[j];
            let days_held = (j - signal_index) as u32;
            let obs = Observation::Bar { high: bar.high, low: bar.low, close: bar.close };
            let transition = ExitEngine::evaluate(&position, &obs, days_held);

            let exit = match transition.action {
                ExitAction::Hold => None,
                ExitAction::Partial { quantity, price } => Some((quantity, price, ExitReason::Target1)),
                ExitAction::Full { quantity, price, reason } => Some((quantity, price, reason)),
            };
            if let Some((quantity, price, reason)) = exit {
                let fill = realize_exit(&position, quantity, price, reason, bar.time, entry_fee_per_share, costs);
                *cash += fill.net_proceeds;
                *total_fees += fill.fees;
                debug!(symbol = %position.symbol, reason = %reason, quantity = quantity, pnl = %fill.trade.pnl, "Exit");
                trades.push(fill.trade);
            }

            match transition.remaining {
                Some(next) => {
                    equity.push(*cash + next.value_at(bar.close));
                    position = next;
                }
                None => {
                    equity.push(*cash);
                    return TradeOutcome { exit_index: j, trades };
                }
            }
        }

        // Data ran out before the time stop
        let bar = &bars[last];
        let fill = realize_exit(&position, position.quantity, bar.close, ExitReason::End, bar.time, entry_fee_per_share, costs);
        *cash += fill.net_proceeds;
        *total_fees += fill.fees;
        trades.push(fill.trade);
        if let Some(point) = equity.last_mut() {
            *point = *cash;
        }
        TradeOutcome { exit_index: last, trades }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::test_support::bars_from;
    use crate::models::Signal;
    use crate::strategy::PullbackDetector;
    use crate::trading::CostConfig;
    use rust_decimal_macros::dec;

    /// Signals once, at a fixed bar count.
    struct SignalAt {
        index: usize,
        stop: Decimal,
        target1: Decimal,
        target2: Decimal,
    }

    impl SignalDetector for SignalAt {
        fn name(&self) -> &str {
            "fixed"
        }

        fn min_bars(&self) -> usize {
            1
        }

        fn detect(&self, symbol: &str, bars: &[Bar]) -> Option<Signal> {
            if bars.len() != self.index + 1 {
                return None;
            }
            Some(Signal {
                symbol: symbol.to_string(),
                entry_price: bars[bars.len() - 1].close,
                stop_price: self.stop,
                target1: self.target1,
                target2: self.target2,
                probability: 0.5,
                strategy: "fixed".into(),
            })
        }
    }

    fn config() -> BacktestConfig {
        BacktestConfig {
            initial_capital: dec!(100000),
            costs: CostConfig::frictionless(),
            ..Default::default()
        }
    }

    fn series(tail: &[(Decimal, Decimal, Decimal, Decimal)], total: usize) -> Vec<Bar> {
        let flat = (dec!(100), dec!(100.5), dec!(99.5), dec!(100));
        let mut prices = vec![flat; 61];
        prices.extend_from_slice(tail);
        while prices.len() < total {
            prices.push(flat);
        }
        bars_from(&prices)
    }

    #[test]
    fn test_abstains_below_min_bars() {
        let bars = series(&[], 61);
        let short = &bars[..59];
        let bt = SingleAssetBacktester::new(config());
        assert!(bt.run("AAA", short, &PullbackDetector::default()).is_none());
    }

    #[test]
    fn test_stop_exit_wins_same_bar() {
        // Signal at bar 60, enter bar 61 open 100, bar 62 spans both stop and target
        let bars = series(
            &[(dec!(100), dec!(101), dec!(99.5), dec!(100)), (dec!(100), dec!(104), dec!(97), dec!(99))],
            90,
        );
        let detector = SignalAt { index: 60, stop: dec!(98), target1: dec!(103), target2: dec!(106) };
        let result = SingleAssetBacktester::new(config()).run("AAA", &bars, &detector).unwrap();

        assert_eq!(result.trades.len(), 1);
        let trade = &result.trades[0];
        assert_eq!(trade.exit_reason, ExitReason::Stop);
        assert_eq!(trade.exit_price, dec!(98));
        // 1% of 100k over a 2 stop distance
        assert_eq!(trade.quantity, 500);
        assert!((trade.r_multiple + 1.0).abs() < 1e-9);
        assert_eq!(result.final_capital, dec!(99000));
        assert_eq!(result.equity_curve.len(), bars.len());
    }

    #[test]
    fn test_partial_then_target2() {
        let bars = series(
            &[
                (dec!(100), dec!(101), dec!(99.5), dec!(100)),
                (dec!(101), dec!(103), dec!(100.5), dec!(102)),
                (dec!(102), dec!(106.5), dec!(101), dec!(106)),
            ],
            90,
        );
        let detector = SignalAt { index: 60, stop: dec!(98), target1: dec!(103), target2: dec!(106) };
        let result = SingleAssetBacktester::new(config()).run("AAA", &bars, &detector).unwrap();

        let reasons: Vec<ExitReason> = result.trades.iter().map(|t| t.exit_reason).collect();
        assert_eq!(reasons, vec![ExitReason::Target1, ExitReason::Target2]);
        assert_eq!(result.trades[0].quantity, 250);
        assert_eq!(result.trades[1].quantity, 250);
        // 250 * 3 + 250 * 6
        assert_eq!(result.final_capital, dec!(102250));
    }

    #[test]
    fn test_timeout_and_flat_equity() {
        let bars = series(&[], 90);
        let detector = SignalAt { index: 60, stop: dec!(95), target1: dec!(110), target2: dec!(120) };
        let result = SingleAssetBacktester::new(config()).run("AAA", &bars, &detector).unwrap();

        assert_eq!(result.trades.len(), 1);
        let trade = &result.trades[0];
        assert_eq!(trade.exit_reason, ExitReason::Timeout);
        assert_eq!(trade.exit_time, bars[70].time);
        assert!(result.equity_curve[..61].iter().all(|p| p.equity == dec!(100000)));
        assert_eq!(result.equity_curve.last().unwrap().equity, result.final_capital);
    }

    #[test]
    fn test_costs_reduce_capital() {
        let bars = series(&[], 90);
        let detector = SignalAt { index: 60, stop: dec!(95), target1: dec!(110), target2: dec!(120) };
        let cfg = BacktestConfig { costs: CostConfig::default(), ..config() };
        let result = SingleAssetBacktester::new(cfg).run("AAA", &bars, &detector).unwrap();

        assert!(result.final_capital < dec!(100000));
        assert!(result.total_fees > Decimal::ZERO);
        let pnl: Decimal = result.trades.iter().map(|t| t.pnl).sum();
        assert!((result.final_capital - dec!(100000) - pnl).abs() < dec!(0.0001));
    }

    /// Signals on every window and records where each one ended.
    struct EveryBar {
        seen: std::sync::Mutex<Vec<(usize, chrono::DateTime<chrono::Utc>)>>,
    }

    impl SignalDetector for EveryBar {
        fn name(&self) -> &str {
            "every"
        }

        fn min_bars(&self) -> usize {
            1
        }

        fn detect(&self, symbol: &str, bars: &[Bar]) -> Option<Signal> {
            let last = bars.last()?;
            self.seen.lock().unwrap().push((bars.len() - 1, last.time));
            Some(Signal {
                symbol: symbol.to_string(),
                entry_price: last.close,
                stop_price: last.close - dec!(5),
                target1: last.close + dec!(10),
                target2: last.close + dec!(20),
                probability: 0.5,
                strategy: "every".into(),
            })
        }
    }

    #[test]
    fn test_signals_while_held_are_ignored() {
        let bars = series(&[], 120);
        let detector = EveryBar { seen: std::sync::Mutex::new(Vec::new()) };
        let result = SingleAssetBacktester::new(config()).run("AAA", &bars, &detector).unwrap();
        let seen = detector.seen.into_inner().unwrap();

        assert!(result.trades.len() > 1);
        for (index, time) in &seen {
            assert_eq!(bars[*index].time, *time);
        }
        for pair in result.trades.windows(2) {
            assert!(pair[1].entry_time > pair[0].exit_time);
        }
        for trade in &result.trades {
            let entry = bars.iter().position(|b| b.time == trade.entry_time).unwrap();
            let exit = bars.iter().position(|b| b.time == trade.exit_time).unwrap();
            // Entered on the bar after the window it came from
            assert!(seen.iter().any(|(index, _)| index + 1 == entry));
            // Nothing was scanned while the position was open
            assert!(!seen.iter().any(|(index, _)| (entry..=exit).contains(index)));
        }
    }
}
