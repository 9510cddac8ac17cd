//! Historical simulation of the sizing and exit discipline.
//!
//! - `SingleAssetBacktester` replays one symbol, one trade at a time
//! - `PortfolioBacktester` runs many symbols on a shared calendar under a
//!   concurrent-position cap
//!
//! Both are synchronous and never look past the bar being processed.

mod calendar;
mod portfolio;
mod single;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::metrics::PerformanceStats;
use crate::models::{DailySnapshot, EquityPoint, ExitReason, Position, Trade};
use crate::trading::{CostConfig, Side};

pub use calendar::build_calendar;
pub use portfolio::PortfolioBacktester;
pub use single::SingleAssetBacktester;

/// Fatal portfolio-run errors. Missing data for a symbol is never one of these.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BacktestError {
    #[error("only {found} common trading days across symbols, need at least {required}")]
    InsufficientCalendar { found: usize, required: usize },

    #[error("no symbol has enough history to simulate")]
    NoSymbols,
}

/// Single-asset backtest configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestConfig {
    /// Starting capital
    pub initial_capital: Decimal,

    /// Fraction of running capital risked per trade
    pub risk_per_trade: Decimal,

    /// Time stop in bars
    pub max_hold_days: u32,

    /// Bars required before the first signal check
    pub min_bars: usize,

    pub costs: CostConfig,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            initial_capital: dec!(10000),
            risk_per_trade: dec!(0.01), // 1% of running capital
            max_hold_days: 10,
            min_bars: 60,
            costs: CostConfig::default(),
        }
    }
}

/// Portfolio backtest configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioConfig {
    /// Starting capital
    pub initial_capital: Decimal,

    /// Maximum concurrent open positions
    pub max_positions: usize,

    /// Fraction of marked equity risked per trade
    pub risk_per_trade: Decimal,

    /// Time stop in trading days
    pub max_hold_days: u32,

    /// Requested simulation length
    pub trading_days: usize,

    /// History a symbol needs before it can signal
    pub min_history_bars: usize,

    /// Fewer shared calendar days than this aborts the run
    pub min_calendar_days: usize,

    /// Fraction of equity kept as cash when an entry is scaled down to fit
    pub cash_buffer: Decimal,

    pub costs: CostConfig,
}

impl Default for PortfolioConfig {
    fn default() -> Self {
        Self {
            initial_capital: dec!(100000),
            max_positions: 5,
            risk_per_trade: dec!(0.01),
            max_hold_days: 10,
            trading_days: 120,
            min_history_bars: 60,
            min_calendar_days: 20,
            cash_buffer: dec!(0.01), // keep 1% of equity
            costs: CostConfig::default(),
        }
    }
}

impl PortfolioConfig {
    /// Bars to request per symbol so the first simulated day has full history.
    pub fn bars_to_load(&self) -> usize {
        self.trading_days + self.min_history_bars
    }
}

/// Single-asset backtest output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestResult {
    pub symbol: String,
    pub strategy: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub initial_capital: Decimal,
    pub final_capital: Decimal,
    pub total_return: f64,
    pub total_fees: Decimal,
    pub trades: Vec<Trade>,
    /// One point per input bar
    pub equity_curve: Vec<EquityPoint>,
    pub stats: PerformanceStats,
}

impl std::fmt::Display for BacktestResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "\n{:=^60}", " BACKTEST RESULTS ")?;
        writeln!(f)?;
        writeln!(f, "Symbol:      {} ({})", self.symbol, self.strategy)?;
        writeln!(f, "Period:      {} to {}",
            self.start_time.format("%Y-%m-%d"),
            self.end_time.format("%Y-%m-%d"))?;
        writeln!(f)?;
        writeln!(f, "--- Capital ---")?;
        writeln!(f, "Initial:     ${:.2}", self.initial_capital)?;
        writeln!(f, "Final:       ${:.2}", self.final_capital)?;
        writeln!(f, "Return:      {:.2}%", self.total_return * 100.0)?;
        writeln!(f, "Fees Paid:   ${:.2}", self.total_fees)?;
        write_stats(f, &self.stats)?;
        writeln!(f, "{:=^60}", "")?;
        Ok(())
    }
}

/// Portfolio backtest output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioBacktestResult {
    pub strategy: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub trading_days: usize,
    pub symbols: usize,
    pub max_positions: usize,
    pub initial_capital: Decimal,
    pub final_equity: Decimal,
    pub total_return: f64,
    pub cagr: f64,
    pub total_fees: Decimal,
    /// Candidates passed over because every slot was taken
    pub signals_skipped: usize,
    pub trades: Vec<Trade>,
    /// One per calendar day. The last one is taken after positions still
    /// open at the end are closed, so its equity equals `final_equity`.
    pub snapshots: Vec<DailySnapshot>,
    pub stats: PerformanceStats,
}

impl std::fmt::Display for PortfolioBacktestResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "\n{:=^60}", " PORTFOLIO BACKTEST ")?;
        writeln!(f)?;
        writeln!(f, "Strategy:    {}", self.strategy)?;
        writeln!(f, "Period:      {} to {} ({} days)", self.start_date, self.end_date, self.trading_days)?;
        writeln!(f, "Universe:    {} symbols, max {} positions", self.symbols, self.max_positions)?;
        writeln!(f)?;
        writeln!(f, "--- Capital ---")?;
        writeln!(f, "Initial:     ${:.2}", self.initial_capital)?;
        writeln!(f, "Final:       ${:.2}", self.final_equity)?;
        writeln!(f, "Return:      {:.2}%", self.total_return * 100.0)?;
        writeln!(f, "CAGR:        {:.2}%", self.cagr * 100.0)?;
        writeln!(f, "Fees Paid:   ${:.2}", self.total_fees)?;
        writeln!(f, "Skipped:     {} signals (positions full)", self.signals_skipped)?;
        write_stats(f, &self.stats)?;
        writeln!(f, "{:=^60}", "")?;
        Ok(())
    }
}

fn write_stats(f: &mut std::fmt::Formatter<'_>, s: &PerformanceStats) -> std::fmt::Result {
    writeln!(f)?;
    writeln!(f, "--- Trades ---")?;
    writeln!(f, "Total:       {}", s.total_trades)?;
    writeln!(f, "Winners:     {} ({:.1}%)", s.winning_trades, s.win_rate * 100.0)?;
    writeln!(f, "Losers:      {}", s.losing_trades)?;
    writeln!(f, "Avg Win:     ${:.2} ({:.2}%)", s.avg_win, s.avg_win_pct * 100.0)?;
    writeln!(f, "Avg Loss:    ${:.2} ({:.2}%)", s.avg_loss, s.avg_loss_pct * 100.0)?;
    writeln!(f, "Largest:     ${:.2} / ${:.2}", s.largest_win, s.largest_loss)?;
    writeln!(f, "Profit Factor: {:.2}", s.profit_factor)?;
    writeln!(f, "Expectancy:  ${:.2} ({:.2}R)", s.expectancy, s.expectancy_r)?;
    writeln!(f, "Kelly:       {:.1}% (half: {:.1}%)", s.kelly * 100.0, s.half_kelly * 100.0)?;
    writeln!(f)?;
    writeln!(f, "--- Risk Metrics ---")?;
    writeln!(f, "Max Drawdown: {:.2}% over {} days", s.max_drawdown * 100.0, s.max_drawdown_days)?;
    writeln!(f, "Sharpe Ratio: {:.2}", s.sharpe)?;
    writeln!(f, "Sortino Ratio: {:.2}", s.sortino)?;
    Ok(())
}

/// Proceeds and trade record for selling `quantity` shares of `position` at `price`.
pub(crate) struct Fill {
    /// Cash credited after slippage, commission and tax
    pub net_proceeds: Decimal,
    pub fees: Decimal,
    pub trade: Trade,
}

pub(crate) fn realize_exit(
    position: &Position,
    quantity: u64,
    price: Decimal,
    reason: ExitReason,
    time: DateTime<Utc>,
    entry_fee_per_share: Decimal,
    costs: &CostConfig,
) -> Fill {
    let fill_price = costs.apply_slippage(price, Side::Sell);
    let gross = fill_price * Decimal::from(quantity);
    let fees = costs.fees(gross, Side::Sell);
    let allocated_entry_fee = entry_fee_per_share * Decimal::from(quantity);
    let trade = Trade::close(position, quantity, fill_price, time, reason, fees + allocated_entry_fee);

    Fill {
        net_proceeds: gross - fees,
        fees,
        trade,
    }
}
