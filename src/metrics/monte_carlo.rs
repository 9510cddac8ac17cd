//! Monte Carlo robustness testing by permuting realized R-multiples.
//!
//! Each simulation replays a random ordering of the same trades. Risk per
//! trade is fixed to the initial capital, so the terminal return of an
//! unruined path is order-independent and the spread shows up in drawdowns
//! and ruin.

use chrono::Utc;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonteCarloConfig {
    /// Number of permutations to replay
    pub simulations: usize,

    /// Fraction of initial capital risked per 1R
    pub risk_fraction: f64,

    /// Fixed seed; `None` derives one from the clock
    pub seed: Option<u64>,
}

impl Default for MonteCarloConfig {
    fn default() -> Self {
        Self {
            simulations: 1000,
            risk_fraction: 0.01, // 1% of initial capital per R
            seed: None,
        }
    }
}

/// Distribution of outcomes across simulations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonteCarloResult {
    pub simulations: usize,
    pub trades_per_simulation: usize,
    pub seed: u64,
    pub median_return: f64,
    pub p5_return: f64,
    pub p95_return: f64,
    pub mean_return: f64,
    /// Fraction of simulations whose capital reached zero
    pub ruin_probability: f64,
    /// Max drawdown of each simulation, in simulation order
    pub max_drawdowns: Vec<f64>,
    pub mean_max_drawdown: f64,
    pub worst_max_drawdown: f64,
}

impl std::fmt::Display for MonteCarloResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "\n{:=^60}", " MONTE CARLO ")?;
        writeln!(f, "Simulations: {} x {} trades (seed {})",
            self.simulations, self.trades_per_simulation, self.seed)?;
        writeln!(f)?;
        writeln!(f, "Median Return:  {:.2}%", self.median_return * 100.0)?;
        writeln!(f, "5th Pct:        {:.2}%", self.p5_return * 100.0)?;
        writeln!(f, "95th Pct:       {:.2}%", self.p95_return * 100.0)?;
        writeln!(f, "Ruin Prob:      {:.2}%", self.ruin_probability * 100.0)?;
        writeln!(f, "Mean Max DD:    {:.2}%", self.mean_max_drawdown * 100.0)?;
        writeln!(f, "Worst Max DD:   {:.2}%", self.worst_max_drawdown * 100.0)?;
        writeln!(f, "{:=^60}", "")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct PathOutcome {
    terminal_return: f64,
    max_drawdown: f64,
    ruined: bool,
}

pub struct MonteCarloEngine {
    config: MonteCarloConfig,
}

impl MonteCarloEngine {
    pub fn new(config: MonteCarloConfig) -> Self {
        Self { config }
    }

    /// Replay `simulations` permutations of `r_multiples` against `initial_capital`.
    pub fn run(&self, r_multiples: &[f64], initial_capital: f64) -> MonteCarloResult {
        let seed = self.config.seed.unwrap_or_else(clock_seed);
        let simulations = self.config.simulations;

        if r_multiples.is_empty() || simulations == 0 || initial_capital <= 0.0 {
            return MonteCarloResult {
                seed,
                ..Default::default()
            };
        }

        let risk_per_r = initial_capital * self.config.risk_fraction;
        let outcomes: Vec<PathOutcome> = (0..simulations)
            .into_par_iter()
            .map(|i| {
                let mut rng = StdRng::seed_from_u64(mix_seed(seed, i as u64));
                let mut order = r_multiples.to_vec();
                order.shuffle(&mut rng);
                replay(&order, initial_capital, risk_per_r)
            })
            .collect();

        let mut returns: Vec<f64> = outcomes.iter().map(|o| o.terminal_return).collect();
        returns.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let max_drawdowns: Vec<f64> = outcomes.iter().map(|o| o.max_drawdown).collect();
        let ruined = outcomes.iter().filter(|o| o.ruined).count();
        let n = simulations as f64;

        let result = MonteCarloResult {
            simulations,
            trades_per_simulation: r_multiples.len(),
            seed,
            median_return: percentile_sorted(&returns, 50.0),
            p5_return: percentile_sorted(&returns, 5.0),
            p95_return: percentile_sorted(&returns, 95.0),
            mean_return: returns.iter().sum::<f64>() / n,
            ruin_probability: ruined as f64 / n,
            mean_max_drawdown: max_drawdowns.iter().sum::<f64>() / n,
            worst_max_drawdown: max_drawdowns.iter().copied().fold(0.0, f64::max),
            max_drawdowns,
        };

        info!(
            simulations = simulations,
            seed = seed,
            median = result.median_return,
            ruin = result.ruin_probability,
            "Monte Carlo complete"
        );
        result
    }
}

/// Replay one ordering. Stops at the first trade that takes capital to zero.
fn replay(order: &[f64], initial_capital: f64, risk_per_r: f64) -> PathOutcome {
    let mut capital = initial_capital;
    let mut peak = initial_capital;
    let mut max_drawdown = 0.0f64;
    let mut ruined = false;

    for r in order {
        capital += risk_per_r * r;
        if capital > peak {
            peak = capital;
        }
        let dd = ((peak - capital) / peak).min(1.0);
        max_drawdown = max_drawdown.max(dd);
        if capital <= 0.0 {
            ruined = true;
            debug!(capital = capital, "Simulation ruined");
            break;
        }
    }

    PathOutcome {
        terminal_return: capital / initial_capital - 1.0,
        max_drawdown,
        ruined,
    }
}

/// Linear-interpolated percentile of an ascending slice.
fn percentile_sorted(sorted: &[f64], p: f64) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return 0.0;
    }
    if n == 1 {
        return sorted[0];
    }
    let rank = (p / 100.0) * (n - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = (lo + 1).min(n - 1);
    let frac = rank - lo as f64;
    sorted[lo] * (1.0 - frac) + sorted[hi] * frac
}

fn clock_seed() -> u64 {
    Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64
}

/// SplitMix64 step so neighbouring simulation indexes get unrelated streams.
fn mix_seed(seed: u64, index: u64) -> u64 {
    let mut z = seed.wrapping_add(index.wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
