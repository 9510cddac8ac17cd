//! Swing-trading position lifecycle: risk-based sizing, a shared exit state
//! machine, single-asset and portfolio backtesting, performance statistics
//! and a live exit monitor.

pub mod api;
pub mod backtest;
pub mod db;
pub mod metrics;
pub mod models;
pub mod monitor;
pub mod strategy;
pub mod trading;
