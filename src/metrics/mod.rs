//! Performance statistics and Monte Carlo robustness testing.

mod calculator;
mod monte_carlo;

pub use calculator::{PerformanceStats, StatsEngine};
pub use monte_carlo::{MonteCarloConfig, MonteCarloEngine, MonteCarloResult};
