//! Multi-symbol simulation on a shared calendar.

use std::collections::{BTreeMap, HashMap};

use chrono::{NaiveDate, NaiveTime};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use tracing::{debug, info, warn};

use crate::metrics::StatsEngine;
use crate::models::{Bar, DailySnapshot, ExitReason, Position, Signal, Trade};
use crate::strategy::SignalDetector;
use crate::trading::{floor_quantity, risk_quantity, ExitAction, ExitEngine, Observation, Side};
use super::{build_calendar, realize_exit, BacktestError, PortfolioBacktestResult, PortfolioConfig};

/// A symbol's bars with a date index.
struct Series<'a> {
    bars: &'a [Bar],
    by_date: HashMap<NaiveDate, usize>,
}

impl<'a> Series<'a> {
    fn new(bars: &'a [Bar]) -> Self {
        let by_date = bars.iter().enumerate().map(|(i, b)| (b.date(), i)).collect();
        Self { bars, by_date }
    }

    fn index_of(&self, date: NaiveDate) -> Option<usize> {
        self.by_date.get(&date).copied()
    }
}

struct Holding {
    position: Position,
    held_days: u32,
    last_close: Decimal,
    entry_fee_per_share: Decimal,
}

/// Cash and open positions during a run.
struct Book {
    cash: Decimal,
    holdings: BTreeMap<String, Holding>,
    trades: Vec<Trade>,
    total_fees: Decimal,
}

impl Book {
    fn position_value(&self) -> Decimal {
        self.holdings.values().map(|h| h.position.value_at(h.last_close)).sum()
    }

    fn equity(&self) -> Decimal {
        self.cash + self.position_value()
    }
}

/// Simulates a detector across a universe under a concurrent-position cap.
pub struct PortfolioBacktester {
    config: PortfolioConfig,
}

impl PortfolioBacktester {
    pub fn new(config: PortfolioConfig) -> Self {
        Self { config }
    }

    /// Run over `universe`. Each day processes exits, then entries, then a snapshot.
    pub fn run(
        &self,
        universe: &HashMap<String, Vec<Bar>>,
        detector: &dyn SignalDetector,
    ) -> Result<PortfolioBacktestResult, BacktestError> {
        let cfg = &self.config;

        let series: BTreeMap<&str, Series<'_>> = universe
            .iter()
            .filter(|(symbol, bars)| {
                let ok = bars.len() >= cfg.min_history_bars;
                if !ok {
                    debug!(symbol = %symbol, bars = bars.len(), "Skipping symbol with short history");
                }
                ok
            })
            .map(|(symbol, bars)| (symbol.as_str(), Series::new(bars)))
            .collect();

        if series.is_empty() {
            return Err(BacktestError::NoSymbols);
        }

        let calendar = build_calendar(series.values().map(|s| s.bars), cfg.trading_days);
        if calendar.is_empty() || calendar.len() < cfg.min_calendar_days {
            return Err(BacktestError::InsufficientCalendar {
                found: calendar.len(),
                required: cfg.min_calendar_days,
            });
        }

        info!(
            symbols = series.len(),
            days = calendar.len(),
            strategy = detector.name(),
            "Starting portfolio backtest"
        );

        let mut book = Book {
            cash: cfg.initial_capital,
            holdings: BTreeMap::new(),
            trades: Vec::new(),
            total_fees: Decimal::ZERO,
        };
        let mut snapshots: Vec<DailySnapshot> = Vec::with_capacity(calendar.len());
        let mut signals_skipped = 0usize;
        let mut prev_equity = cfg.initial_capital;

        for &date in &calendar {
            self.exit_pass(&mut book, &series, date);

            if book.holdings.len() < cfg.max_positions {
                signals_skipped += self.entry_pass(&mut book, &series, detector, date);
            }

            let position_value = book.position_value();
            let equity = book.cash + position_value;
            let day_pnl = equity - prev_equity;
            let day_return = if prev_equity > Decimal::ZERO {
                (day_pnl / prev_equity).to_f64().unwrap_or(0.0)
            } else {
                0.0
            };
            snapshots.push(DailySnapshot {
                date,
                equity,
                cash: book.cash,
                position_value,
                open_positions: book.holdings.len(),
                day_pnl,
                day_return,
            });
            prev_equity = equity;
        }

        // Close what is left at each symbol's last seen close
        let end_date = calendar[calendar.len() - 1];
        let end_time = end_date.and_time(NaiveTime::MIN).and_utc();
        let leftovers: Vec<String> = book.holdings.keys().cloned().collect();
        let closed_at_end = !leftovers.is_empty();
        for symbol in leftovers {
            if let Some(h) = book.holdings.remove(&symbol) {
                let fill = realize_exit(
                    &h.position,
                    h.position.quantity,
                    h.last_close,
                    ExitReason::End,
                    end_time,
                    h.entry_fee_per_share,
                    &cfg.costs,
                );
                book.cash += fill.net_proceeds;
                book.total_fees += fill.fees;
                book.trades.push(fill.trade);
            }
        }

        // The last day's snapshot reflects the close, so it ends at final equity
        if closed_at_end {
            if let Some(last) = snapshots.last_mut() {
                let prev = last.equity - last.day_pnl;
                last.cash = book.cash;
                last.position_value = Decimal::ZERO;
                last.open_positions = 0;
                last.equity = book.cash;
                last.day_pnl = book.cash - prev;
                last.day_return = if prev > Decimal::ZERO {
                    (last.day_pnl / prev).to_f64().unwrap_or(0.0)
                } else {
                    0.0
                };
            }
        }

        let final_equity = book.cash;
        let total_return = if cfg.initial_capital > Decimal::ZERO {
            ((final_equity - cfg.initial_capital) / cfg.initial_capital).to_f64().unwrap_or(0.0)
        } else {
            0.0
        };
        let equity_series: Vec<Decimal> = snapshots.iter().map(|s| s.equity).collect();
        let returns: Vec<f64> = snapshots.iter().map(|s| s.day_return).collect();
        let stats = StatsEngine::calculate_with_returns(&book.trades, &equity_series, &returns);
        let cagr = StatsEngine::cagr(cfg.initial_capital, final_equity, calendar.len());

        info!(
            trades = book.trades.len(),
            final_equity = %final_equity.round_dp(2),
            skipped = signals_skipped,
            "Portfolio backtest complete"
        );

        Ok(PortfolioBacktestResult {
            strategy: detector.name().to_string(),
            start_date: calendar[0],
            end_date,
            trading_days: calendar.len(),
            symbols: series.len(),
            max_positions: cfg.max_positions,
            initial_capital: cfg.initial_capital,
            final_equity,
            total_return,
            cagr,
            total_fees: book.total_fees,
            signals_skipped,
            trades: book.trades,
            snapshots,
            stats,
        })
    }

    fn exit_pass(&self, book: &mut Book, series: &BTreeMap<&str, Series<'_>>, date: NaiveDate) {
        let costs = &self.config.costs;
        let symbols: Vec<String> = book.holdings.keys().cloned().collect();

        for symbol in symbols {
            let Some(holding) = book.holdings.get_mut(&symbol) else {
                continue;
            };
            holding.held_days += 1;

            // A gap day is skipped, never forced out
            let Some(bar) = series
                .get(symbol.as_str())
                .and_then(|s| s.index_of(date).map(|i| &s.bars[i]))
            else {
                continue;
            };
            holding.last_close = bar.close;

            let obs = Observation::Bar { high: bar.high, low: bar.low, close: bar.close };
            let transition = ExitEngine::evaluate(&holding.position, &obs, holding.held_days);
            let exit = match transition.action {
                ExitAction::Hold => None,
                ExitAction::Partial { quantity, price } => Some((quantity, price, ExitReason::Target1)),
                ExitAction::Full { quantity, price, reason } => Some((quantity, price, reason)),
            };
            let Some((quantity, price, reason)) = exit else {
                continue;
            };

            let fill = realize_exit(
                &holding.position,
                quantity,
                price,
                reason,
                bar.time,
                holding.entry_fee_per_share,
                costs,
            );
            book.cash += fill.net_proceeds;
            book.total_fees += fill.fees;
            debug!(symbol = %symbol, date = %date, reason = %reason, quantity = quantity, "Exit");
            book.trades.push(fill.trade);

            match transition.remaining {
                Some(next) => holding.position = next,
                None => {
                    book.holdings.remove(&symbol);
                }
            }
        }
    }

    /// Open the day's best candidates. Returns how many were passed over for lack of slots.
    fn entry_pass(
        &self,
        book: &mut Book,
        series: &BTreeMap<&str, Series<'_>>,
        detector: &dyn SignalDetector,
        date: NaiveDate,
    ) -> usize {
        let cfg = &self.config;
        let costs = &cfg.costs;

        let mut candidates: Vec<(Signal, &Bar)> = series
            .iter()
            .filter(|(symbol, _)| !book.holdings.contains_key(**symbol))
            .filter_map(|(symbol, s)| {
                let idx = s.index_of(date)?;
                if idx + 1 < cfg.min_history_bars {
                    return None;
                }
                let signal = detector.detect(symbol, &s.bars[..=idx])?;
                Some((signal, &s.bars[idx]))
            })
            .collect();

        candidates.sort_by(|(a, _), (b, _)| {
            b.probability
                .total_cmp(&a.probability)
                .then_with(|| a.symbol.cmp(&b.symbol))
        });

        let mut skipped = 0;
        for (signal, bar) in candidates {
            if book.holdings.len() >= cfg.max_positions {
                skipped += 1;
                continue;
            }

            let entry_price = costs.apply_slippage(bar.close, Side::Buy);
            let stop_distance = entry_price - signal.stop_price;
            if stop_distance <= Decimal::ZERO {
                debug!(symbol = %signal.symbol, "Stop at or above entry, rejected");
                continue;
            }

            let equity = book.equity();
            let unit_cost = entry_price * (Decimal::ONE + costs.commission_rate);
            let mut quantity = risk_quantity(equity, cfg.risk_per_trade, stop_distance);
            if Decimal::from(quantity) * unit_cost > book.cash {
                let spendable = book.cash - equity * cfg.cash_buffer;
                quantity = if spendable > Decimal::ZERO {
                    floor_quantity(spendable / unit_cost).min(quantity)
                } else {
                    0
                };
            }
            if quantity == 0 {
                warn!(symbol = %signal.symbol, cash = %book.cash.round_dp(2), "Cannot afford entry");
                continue;
            }

            let notional = entry_price * Decimal::from(quantity);
            let entry_fee = costs.fees(notional, Side::Buy);
            book.cash -= notional + entry_fee;
            book.total_fees += entry_fee;

            debug!(
                symbol = %signal.symbol,
                date = %date,
                quantity = quantity,
                price = %entry_price,
                "Entered"
            );

            let position = Position {
                symbol: signal.symbol.clone(),
                strategy: signal.strategy.clone(),
                quantity,
                entry_price,
                stop_price: signal.stop_price,
                original_stop: signal.stop_price,
                target1: signal.target1,
                target2: signal.target2,
                target1_hit: false,
                entry_time: bar.time,
                max_hold_days: cfg.max_hold_days,
            };
            book.holdings.insert(
                signal.symbol.clone(),
                Holding {
                    position,
                    held_days: 0,
                    last_close: bar.close,
                    entry_fee_per_share: entry_fee / Decimal::from(quantity),
                },
            );
        }
        skipped
    }
}
