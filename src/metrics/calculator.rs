//! Performance statistics over closed trades and equity series.

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

use crate::models::Trade;

const TRADING_DAYS_PER_YEAR: f64 = 252.0;
const MIN_STD_DEV: f64 = 1e-12;

/// Every statistic derived from a run. Divisions by zero report 0.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceStats {
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,

    pub total_pnl: Decimal,
    pub gross_profit: Decimal,
    /// Positive magnitude
    pub gross_loss: Decimal,
    pub avg_win: Decimal,
    /// Positive magnitude
    pub avg_loss: Decimal,
    pub avg_win_pct: f64,
    pub avg_loss_pct: f64,
    pub largest_win: Decimal,
    /// Most negative trade P&L
    pub largest_loss: Decimal,

    pub risk_reward: f64,
    pub profit_factor: f64,
    pub expectancy: Decimal,
    pub expectancy_r: f64,
    pub kelly: f64,
    pub half_kelly: f64,

    /// Largest peak-to-trough decline (0.0 to 1.0)
    pub max_drawdown: f64,
    /// Snapshots between the peak and the trough of the largest drawdown
    pub max_drawdown_days: usize,
    pub sharpe: f64,
    pub sortino: f64,
}

/// Stateless statistics functions.
pub struct StatsEngine;

impl StatsEngine {
    /// Trade statistics plus drawdown and risk ratios from `equity`.
    ///
    /// Daily returns are derived from consecutive equity values.
    pub fn calculate(trades: &[Trade], equity: &[Decimal]) -> PerformanceStats {
        let returns = Self::returns_from_equity(equity);
        Self::calculate_with_returns(trades, equity, &returns)
    }

    /// Same as [`calculate`](Self::calculate) with explicit daily returns.
    pub fn calculate_with_returns(trades: &[Trade], equity: &[Decimal], returns: &[f64]) -> PerformanceStats {
        let mut stats = Self::trade_stats(trades);
        let (dd, dd_days) = Self::max_drawdown(equity);
        stats.max_drawdown = dd;
        stats.max_drawdown_days = dd_days;
        stats.sharpe = Self::sharpe(returns);
        stats.sortino = Self::sortino(returns);
        stats
    }

    /// Win/loss, expectancy and Kelly statistics.
    pub fn trade_stats(trades: &[Trade]) -> PerformanceStats {
        let mut stats = PerformanceStats::default();
        if trades.is_empty() {
            return stats;
        }

        let (wins, losses): (Vec<&Trade>, Vec<&Trade>) = trades
            .iter()
            .filter(|t| !t.pnl.is_zero())
            .partition(|t| t.pnl > Decimal::ZERO);

        stats.total_trades = trades.len();
        stats.winning_trades = wins.len();
        stats.losing_trades = losses.len();
        stats.win_rate = wins.len() as f64 / trades.len() as f64;

        stats.total_pnl = trades.iter().map(|t| t.pnl).sum();
        stats.gross_profit = wins.iter().map(|t| t.pnl).sum();
        stats.gross_loss = losses.iter().map(|t| t.pnl.abs()).sum();

        if !wins.is_empty() {
            stats.avg_win = stats.gross_profit / Decimal::from(wins.len() as u64);
            stats.avg_win_pct = wins.iter().map(|t| t.pnl_pct).sum::<f64>() / wins.len() as f64;
            stats.largest_win = wins.iter().map(|t| t.pnl).max().unwrap_or_default();
        }
        if !losses.is_empty() {
            stats.avg_loss = stats.gross_loss / Decimal::from(losses.len() as u64);
            stats.avg_loss_pct = losses.iter().map(|t| t.pnl_pct.abs()).sum::<f64>() / losses.len() as f64;
            stats.largest_loss = losses.iter().map(|t| t.pnl).min().unwrap_or_default();
        }

        let avg_win = stats.avg_win.to_f64().unwrap_or(0.0);
        let avg_loss = stats.avg_loss.to_f64().unwrap_or(0.0);
        stats.risk_reward = if avg_loss > 0.0 { avg_win / avg_loss } else { 0.0 };

        stats.profit_factor = if stats.gross_loss > Decimal::ZERO {
            (stats.gross_profit / stats.gross_loss).to_f64().unwrap_or(0.0)
        } else {
            0.0
        };

        let w = Decimal::try_from(stats.win_rate).unwrap_or_default();
        stats.expectancy = w * stats.avg_win - (Decimal::ONE - w) * stats.avg_loss;
        stats.expectancy_r = trades.iter().map(|t| t.r_multiple).sum::<f64>() / trades.len() as f64;

        stats.kelly = Self::kelly(stats.win_rate, stats.risk_reward);
        stats.half_kelly = stats.kelly / 2.0;

        stats
    }

    /// Kelly fraction `(W*B - (1-W)) / B`, clamped to `[0, 1]`.
    pub fn kelly(win_rate: f64, payoff: f64) -> f64 {
        if !win_rate.is_finite() || !payoff.is_finite() || payoff <= 0.0 {
            return 0.0;
        }
        let kelly = (win_rate * payoff - (1.0 - win_rate)) / payoff;
        if kelly.is_finite() {
            kelly.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    /// Largest peak-to-trough decline and the snapshot distance between them.
    pub fn max_drawdown(equity: &[Decimal]) -> (f64, usize) {
        let mut peak = match equity.first() {
            Some(first) => *first,
            None => return (0.0, 0),
        };
        let mut peak_idx = 0;
        let mut max_dd = 0.0f64;
        let mut max_days = 0;

        for (i, value) in equity.iter().enumerate() {
            if *value > peak {
                peak = *value;
                peak_idx = i;
            }
            if peak > Decimal::ZERO {
                let dd = ((peak - *value) / peak).to_f64().unwrap_or(0.0);
                if dd > max_dd {
                    max_dd = dd;
                    max_days = i - peak_idx;
                }
            }
        }

        (max_dd, max_days)
    }

    /// Simple returns between consecutive positive equity values.
    pub fn returns_from_equity(equity: &[Decimal]) -> Vec<f64> {
        equity
            .windows(2)
            .filter_map(|w| {
                if w[0] <= Decimal::ZERO {
                    return None;
                }
                ((w[1] - w[0]) / w[0]).to_f64()
            })
            .collect()
    }

    /// Annualized Sharpe ratio of daily returns (zero risk-free rate).
    pub fn sharpe(returns: &[f64]) -> f64 {
        if returns.len() < 2 {
            return 0.0;
        }
        let mean = returns.iter().mean();
        let std_dev = returns.iter().std_dev();
        annualize(mean, std_dev)
    }

    /// Annualized Sortino ratio, using the deviation of negative days only.
    pub fn sortino(returns: &[f64]) -> f64 {
        if returns.len() < 2 {
            return 0.0;
        }
        let negative: Vec<f64> = returns.iter().copied().filter(|r| *r < 0.0).collect();
        if negative.len() < 2 {
            return 0.0;
        }
        let mean = returns.iter().mean();
        let downside = negative.iter().std_dev();
        annualize(mean, downside)
    }

    /// `(final/initial)^(252/days) - 1`.
    pub fn cagr(initial: Decimal, final_equity: Decimal, trading_days: usize) -> f64 {
        let (Some(initial), Some(final_equity)) = (initial.to_f64(), final_equity.to_f64()) else {
            return 0.0;
        };
        if initial <= 0.0 || final_equity <= 0.0 || trading_days == 0 {
            return 0.0;
        }
        (final_equity / initial).powf(TRADING_DAYS_PER_YEAR / trading_days as f64) - 1.0
    }
}

fn annualize(mean: f64, std_dev: f64) -> f64 {
    if !std_dev.is_finite() || std_dev <= MIN_STD_DEV || !mean.is_finite() {
        return 0.0;
    }
    mean / std_dev * TRADING_DAYS_PER_YEAR.sqrt()
}
