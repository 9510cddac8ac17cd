//! swingdesk command line.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use swingdesk::api::{load_universe, DataSource, HttpDataSource, JsonFileSource, PaperBroker};
use swingdesk::backtest::{BacktestConfig, PortfolioBacktester, PortfolioConfig, SingleAssetBacktester};
use swingdesk::db::{PositionPlanStore, SqlitePlanStore};
use swingdesk::metrics::{MonteCarloConfig, MonteCarloEngine};
use swingdesk::models::Signal;
use swingdesk::monitor::{LiveMonitor, MonitorConfig, PositionBook, Scanner};
use swingdesk::strategy::{BarStrategy, Strategy, StrategyTable};
use swingdesk::trading::{CostConfig, PositionSizer, RiskConfig};

/// Swing-trading sizing, backtesting and exit monitoring.
#[derive(Parser)]
#[command(name = "swingdesk")]
#[command(about = "Size, backtest and monitor swing trades", long_about = None)]
struct Cli {
    /// Position-plan database
    #[arg(short, long, env = "SWINGDESK_DATABASE", default_value = "sqlite:./swingdesk.db?mode=rwc")]
    database: String,

    /// Directory of <SYMBOL>.json bar files
    #[arg(long, env = "SWINGDESK_DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,

    /// HTTP bar service; overrides --data-dir when set
    #[arg(long, env = "SWINGDESK_DATA_URL")]
    data_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Also write the result as JSON
    #[arg(long, global = true)]
    json: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Size a single signal
    Size {
        symbol: String,

        #[arg(long)]
        entry: f64,

        #[arg(long)]
        stop: f64,

        #[arg(long)]
        target1: f64,

        /// Defaults to entry + 3R
        #[arg(long)]
        target2: Option<f64>,

        #[arg(short, long, default_value = "100000")]
        capital: f64,
    },

    /// Backtest one symbol
    Backtest {
        symbol: String,

        #[arg(short, long, default_value = "pullback")]
        strategy: String,

        #[arg(short, long, default_value = "10000")]
        capital: f64,

        /// Bars of history to load
        #[arg(short, long, default_value = "500")]
        bars: usize,

        #[arg(long, default_value = "10")]
        max_hold: u32,
    },

    /// Backtest a universe under a position cap
    Portfolio {
        /// Comma-separated symbols
        #[arg(value_delimiter = ',', required = true)]
        symbols: Vec<String>,

        #[arg(short, long, default_value = "pullback")]
        strategy: String,

        #[arg(short, long, default_value = "100000")]
        capital: f64,

        #[arg(short, long, default_value = "5")]
        max_positions: usize,

        /// Trading days to simulate
        #[arg(long, default_value = "120")]
        days: usize,

        /// Concurrent data requests
        #[arg(long, default_value = "8")]
        concurrency: usize,

        /// Monte Carlo simulations over the resulting trades
        #[arg(long)]
        monte_carlo: Option<usize>,

        /// Monte Carlo seed (clock-derived when absent)
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Scan for entries and monitor exits with the paper broker
    Monitor {
        #[arg(value_delimiter = ',', required = true)]
        symbols: Vec<String>,

        /// Strategies in priority order
        #[arg(short, long, value_delimiter = ',', default_value = "pullback,breakout")]
        strategies: Vec<String>,

        #[arg(short, long, default_value = "100000")]
        capital: f64,

        /// Poll interval in seconds
        #[arg(short, long, default_value = "60")]
        interval: u64,

        /// Send orders to the paper broker instead of only logging them
        #[arg(long)]
        live: bool,
    },

    /// List stored position plans
    Plans,

    /// List available strategies
    Strategies,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    init_logging(&cli.log_level)?;

    match cli.command {
        Commands::Size { ref symbol, entry, stop, target1, target2, capital } => {
            let entry = Decimal::try_from(entry)?;
            let stop = Decimal::try_from(stop)?;
            let target2 = match target2 {
                Some(t) => Decimal::try_from(t)?,
                None => entry + (entry - stop) * Decimal::from(3),
            };
            let signal = Signal {
                symbol: symbol.to_uppercase(),
                entry_price: entry,
                stop_price: stop,
                target1: Decimal::try_from(target1)?,
                target2,
                probability: 0.0,
                strategy: "manual".into(),
            };

            let sizer = PositionSizer::new(RiskConfig::default(), CostConfig::default());
            match sizer.size(&signal, Decimal::try_from(capital)?) {
                Ok(sized) => {
                    println!("\n=== {} ===", signal.symbol);
                    println!("Quantity:     {}", sized.quantity);
                    println!("Invest:       ${:.2} ({:.1}%)", sized.invest_amount, sized.allocation_pct * Decimal::from(100));
                    println!("Risk:         ${:.2} ({:.2}%)", sized.risk_amount, sized.risk_pct * Decimal::from(100));
                    println!("Est. Costs:   ${:.2}", sized.cost_estimate);
                    write_json(&cli.json, &sized)?;
                }
                Err(rejection) => println!("Rejected: {}", rejection),
            }
        }

        Commands::Backtest { ref symbol, ref strategy, capital, bars, max_hold } => {
            let detector = StrategyTable::default()
                .detector(strategy)
                .ok_or_else(|| anyhow::anyhow!("Unknown strategy '{}'", strategy))?;
            let source = data_source(&cli)?;
            let series = source
                .daily_bars(symbol, bars)
                .await
                .with_context(|| format!("Failed to load bars for {}", symbol))?;

            let config = BacktestConfig {
                initial_capital: Decimal::try_from(capital)?,
                max_hold_days: max_hold,
                ..Default::default()
            };
            match SingleAssetBacktester::new(config).run(symbol, &series, detector.as_ref()) {
                Some(result) => {
                    println!("{}", result);
                    write_json(&cli.json, &result)?;
                }
                None => println!("Not enough history for {} ({} bars)", symbol, series.len()),
            }
        }

        Commands::Portfolio {
            ref symbols,
            ref strategy,
            capital,
            max_positions,
            days,
            concurrency,
            monte_carlo,
            seed,
        } => {
            let detector = StrategyTable::default()
                .detector(strategy)
                .ok_or_else(|| anyhow::anyhow!("Unknown strategy '{}'", strategy))?;
            let config = PortfolioConfig {
                initial_capital: Decimal::try_from(capital)?,
                max_positions,
                trading_days: days,
                ..Default::default()
            };

            let source = data_source(&cli)?;
            let universe = load_universe(source.as_ref(), symbols, config.bars_to_load(), concurrency).await;
            info!(loaded = universe.len(), requested = symbols.len(), "Universe loaded");

            let result = PortfolioBacktester::new(config).run(&universe, detector.as_ref())?;
            println!("{}", result);

            match monte_carlo {
                Some(simulations) => {
                    let r_multiples: Vec<f64> = result.trades.iter().map(|t| t.r_multiple).collect();
                    let engine = MonteCarloEngine::new(MonteCarloConfig {
                        simulations,
                        seed,
                        ..Default::default()
                    });
                    let mc = engine.run(&r_multiples, capital);
                    println!("{}", mc);
                    write_json(&cli.json, &serde_json::json!({ "portfolio": result, "monte_carlo": mc }))?;
                }
                None => write_json(&cli.json, &result)?,
            }
        }

        Commands::Monitor { ref symbols, ref strategies, capital, interval, live } => {
            let config = MonitorConfig {
                poll_interval_secs: interval,
                dry_run: !live,
                capital: Decimal::try_from(capital)?,
                ..Default::default()
            };
            config.risk.validate(&config.costs)?;

            let source = data_source(&cli)?;
            let table = StrategyTable::default();
            let strategies: Vec<Arc<dyn Strategy>> = table
                .resolve(strategies)?
                .into_iter()
                .map(|detector| {
                    Arc::new(BarStrategy::new(detector, source.clone(), 120)) as Arc<dyn Strategy>
                })
                .collect();

            let broker = Arc::new(PaperBroker::new(config.costs.clone()).with_source(source.clone()));
            let store: Arc<dyn PositionPlanStore> = Arc::new(SqlitePlanStore::new(&cli.database).await?);
            let book = Arc::new(PositionBook::new());

            let monitor = LiveMonitor::new(config.clone(), broker.clone(), store.clone(), book.clone());
            monitor.restore().await?;
            for position in book.snapshot().await {
                broker.set_position(&position.symbol, position.quantity, position.entry_price).await;
            }

            let scanner = Scanner::new(config.clone(), strategies, broker, store, book.clone());
            let opened = scanner.scan_and_execute(symbols).await?;

            println!("\n=== swingdesk monitor ===");
            println!("Mode:          {}", if config.dry_run { "DRY RUN (orders logged only)" } else { "PAPER" });
            println!("Poll interval: {}s", config.poll_interval_secs);
            println!("Open:          {} ({} new)", book.len().await, opened.len());
            println!("\nPress Ctrl+C to stop.\n");

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Shutdown signal received");
                shutdown_tx.send(true).ok();
            });

            monitor.run(shutdown_rx).await?;
        }

        Commands::Plans => {
            let store = SqlitePlanStore::new(&cli.database).await?;
            let mut plans: Vec<_> = store.all().await?.into_values().collect();
            if plans.is_empty() {
                println!("No open position plans.");
                return Ok(());
            }
            plans.sort_by(|a, b| a.symbol.cmp(&b.symbol));

            println!(
                "\n{:<10} {:<10} {:>8} {:>10} {:>10} {:>10} {:>10} {:>8}",
                "SYMBOL", "STRATEGY", "QTY", "ENTRY", "STOP", "TARGET1", "TARGET2", "PARTIAL"
            );
            println!("{}", "-".repeat(84));
            for p in &plans {
                println!(
                    "{:<10} {:<10} {:>8} {:>10.2} {:>10.2} {:>10.2} {:>10.2} {:>8}",
                    p.symbol,
                    truncate(&p.strategy, 10),
                    p.quantity,
                    p.entry_price,
                    p.stop_price,
                    p.target1,
                    p.target2,
                    if p.partial_exit_done { "yes" } else { "no" }
                );
            }
            write_json(&cli.json, &plans)?;
        }

        Commands::Strategies => {
            let table = StrategyTable::default();
            for name in table.names() {
                if let Some(detector) = table.detector(name) {
                    println!("{:<12} (needs {} bars)", name, detector.min_bars());
                }
            }
        }
    }

    Ok(())
}

fn init_logging(level: &str) -> Result<()> {
    let log_level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // RUST_LOG wins over --log-level
    if std::env::var_os("RUST_LOG").is_some() {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(EnvFilter::from_default_env())
            .with_target(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_target(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }
    Ok(())
}

fn data_source(cli: &Cli) -> Result<Arc<dyn DataSource>> {
    match &cli.data_url {
        Some(url) => Ok(Arc::new(HttpDataSource::new(url.clone())?)),
        None => {
            if !cli.data_dir.is_dir() {
                warn!(dir = %cli.data_dir.display(), "Data directory does not exist");
            }
            Ok(Arc::new(JsonFileSource::new(&cli.data_dir)))
        }
    }
}

fn write_json<T: Serialize>(path: &Option<PathBuf>, value: &T) -> Result<()> {
    let Some(path) = path else {
        return Ok(());
    };
    let body = serde_json::to_vec_pretty(value)?;
    std::fs::write(path, body).with_context(|| format!("Failed to write {}", path.display()))?;
    info!(path = %path.display(), "Wrote JSON report");
    Ok(())
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        format!("{}...", &s[..max_len.saturating_sub(3)])
    }
}
