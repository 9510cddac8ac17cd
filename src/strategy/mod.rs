//! Strategy interfaces and the built-in signal detectors.
//!
//! A `SignalDetector` is a pure predicate over a trailing bar window and is
//! what the backtesters replay. A `Strategy` is the async form the scanner
//! calls with only a symbol; `BarStrategy` adapts one to the other through a
//! `DataSource`.

mod breakout;
mod pullback;

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::api::DataSource;
use crate::models::{Bar, Signal};

pub use breakout::BreakoutDetector;
pub use pullback::PullbackDetector;

/// Entry predicate evaluated on bars up to and including the current one.
pub trait SignalDetector: Send + Sync {
    fn name(&self) -> &str;

    /// Bars needed before `detect` can return a signal.
    fn min_bars(&self) -> usize;

    /// `None` when there is no setup or not enough history.
    fn detect(&self, symbol: &str, bars: &[Bar]) -> Option<Signal>;
}

/// Produces a signal for a symbol, fetching whatever data it needs.
#[async_trait]
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;

    async fn analyze(&self, symbol: &str) -> Result<Option<Signal>>;
}

/// Runs a detector over the latest bars from a data source.
pub struct BarStrategy {
    detector: Arc<dyn SignalDetector>,
    source: Arc<dyn DataSource>,
    lookback: usize,
}

impl BarStrategy {
    pub fn new(detector: Arc<dyn SignalDetector>, source: Arc<dyn DataSource>, lookback: usize) -> Self {
        let lookback = lookback.max(detector.min_bars());
        Self { detector, source, lookback }
    }
}

#[async_trait]
impl Strategy for BarStrategy {
    fn name(&self) -> &str {
        self.detector.name()
    }

    async fn analyze(&self, symbol: &str) -> Result<Option<Signal>> {
        let bars = self
            .source
            .daily_bars(symbol, self.lookback)
            .await
            .with_context(|| format!("Failed to load bars for {}", symbol))?;
        Ok(self.detector.detect(symbol, &bars))
    }
}

type DetectorFactory = fn() -> Arc<dyn SignalDetector>;

/// Explicit name to detector table.
pub struct StrategyTable {
    entries: Vec<(&'static str, DetectorFactory)>,
}

impl Default for StrategyTable {
    fn default() -> Self {
        Self {
            entries: vec![
                ("pullback", || Arc::new(PullbackDetector::default())),
                ("breakout", || Arc::new(BreakoutDetector::default())),
            ],
        }
    }
}

impl StrategyTable {
    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|(name, _)| *name).collect()
    }

    pub fn detector(&self, name: &str) -> Option<Arc<dyn SignalDetector>> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, make)| make())
    }

    /// Resolve a list of names, failing on the first unknown one.
    pub fn resolve(&self, names: &[String]) -> Result<Vec<Arc<dyn SignalDetector>>> {
        names
            .iter()
            .map(|name| {
                self.detector(name).ok_or_else(|| {
                    anyhow::anyhow!("Unknown strategy '{}' (available: {})", name, self.names().join(", "))
                })
            })
            .collect()
    }
}
