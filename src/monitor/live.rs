//! Quote polling loop for open positions.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use tokio::sync::{watch, Mutex};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::api::{Broker, Order};
use crate::db::{PositionPlan, PositionPlanStore};
use crate::models::{ExitReason, Position, Trade};
use crate::trading::{trading_days_held, ExitAction, ExitEngine, Observation, Side, Transition};
use super::{MonitorConfig, PositionBook};

/// Outcome of one poll cycle.
#[derive(Debug, Default)]
pub struct PollReport {
    /// Positions a quote was requested for
    pub checked: usize,
    /// Exits that were executed and applied
    pub exits: Vec<Trade>,
    /// The cycle stopped early on shutdown
    pub cancelled: bool,
    /// Plan writes still waiting for a retry after this cycle
    pub pending_plans: usize,
}

enum QuoteOutcome {
    Price(Decimal),
    Unavailable,
    Cancelled,
}

/// Drives `ExitEngine` from live quotes.
pub struct LiveMonitor {
    config: MonitorConfig,
    broker: Arc<dyn Broker>,
    store: Arc<dyn PositionPlanStore>,
    book: Arc<PositionBook>,
    /// Plan state owed to the store after a failed write. `None` means delete.
    pending_plans: Mutex<HashMap<String, Option<PositionPlan>>>,
}

impl LiveMonitor {
    pub fn new(
        config: MonitorConfig,
        broker: Arc<dyn Broker>,
        store: Arc<dyn PositionPlanStore>,
        book: Arc<PositionBook>,
    ) -> Self {
        Self { config, broker, store, book, pending_plans: Mutex::new(HashMap::new()) }
    }

    pub fn book(&self) -> Arc<PositionBook> {
        self.book.clone()
    }

    /// Reload open positions from the plan store.
    pub async fn restore(&self) -> Result<usize> {
        let plans = self.store.all().await.context("Failed to load position plans")?;
        let mut restored = 0;
        for plan in plans.values() {
            match self.book.register(plan.to_position()).await {
                Ok(()) => restored += 1,
                Err(e) => warn!(symbol = %plan.symbol, error = %e, "Skipping plan"),
            }
        }
        info!(positions = restored, "Restored open positions");
        Ok(restored)
    }

    /// Poll until `shutdown` turns true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            dry_run = self.config.dry_run,
            poll_interval = self.config.poll_interval_secs,
            "Starting monitor loop"
        );

        let mut ticker = interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancelled(&mut shutdown) => break,
            }

            match self.poll_once(&mut shutdown).await {
                Ok(report) if report.cancelled => break,
                Ok(report) => debug!(checked = report.checked, exits = report.exits.len(), "Poll complete"),
                Err(e) => error!(error = %e, "Error in poll cycle"),
            }
        }

        info!(open = self.book.len().await, "Monitor stopped");
        Ok(())
    }

    /// One pass over the open set using today's date.
    pub async fn poll_once(&self, cancel: &mut watch::Receiver<bool>) -> Result<PollReport> {
        self.poll_at(Utc::now().date_naive(), cancel).await
    }

    /// One pass over the open set, counting holding days up to `today`.
    ///
    /// Cancellation is checked before each position and interrupts an
    /// in-flight quote. A position whose order was already sent is finished.
    pub async fn poll_at(&self, today: NaiveDate, cancel: &mut watch::Receiver<bool>) -> Result<PollReport> {
        let mut report = PollReport::default();
        self.flush_pending_plans().await;

        for position in self.book.snapshot().await {
            if *cancel.borrow() {
                report.cancelled = true;
                break;
            }
            report.checked += 1;

            let price = match self.quote(&position.symbol, cancel).await {
                QuoteOutcome::Price(price) => price,
                QuoteOutcome::Unavailable => continue,
                QuoteOutcome::Cancelled => {
                    report.cancelled = true;
                    break;
                }
            };

            let days = trading_days_held(position.entry_time.date_naive(), today);
            let transition = ExitEngine::evaluate(&position, &Observation::Quote(price), days);
            let (quantity, reason) = match transition.action {
                ExitAction::Hold => continue,
                ExitAction::Partial { quantity, .. } => (quantity, ExitReason::Target1),
                ExitAction::Full { quantity, reason, .. } => (quantity, reason),
            };

            if let Some(trade) = self.execute_exit(&position, &transition, quantity, price, reason).await {
                report.exits.push(trade);
            }
        }

        report.pending_plans = self.pending_plans.lock().await.len();
        Ok(report)
    }

    /// Retry plan writes that failed after an exit was already applied.
    async fn flush_pending_plans(&self) {
        let mut pending = self.pending_plans.lock().await;
        if pending.is_empty() {
            return;
        }

        let mut written = Vec::new();
        for (symbol, plan) in pending.iter() {
            let result = match plan {
                Some(plan) => self.store.save(plan).await,
                None => self.store.delete(symbol).await,
            };
            match result {
                Ok(()) => {
                    info!(symbol = %symbol, "Pending plan write applied");
                    written.push(symbol.clone());
                }
                Err(e) => warn!(symbol = %symbol, error = %e, "Plan write still failing"),
            }
        }
        for symbol in written {
            pending.remove(&symbol);
        }
    }

    async fn quote(&self, symbol: &str, cancel: &mut watch::Receiver<bool>) -> QuoteOutcome {
        tokio::select! {
            result = timeout(self.config.quote_timeout(), self.broker.quote(symbol)) => match result {
                Ok(Ok(price)) => QuoteOutcome::Price(price),
                Ok(Err(e)) => {
                    warn!(symbol = %symbol, error = %e, "Quote failed");
                    QuoteOutcome::Unavailable
                }
                Err(_) => {
                    warn!(symbol = %symbol, "Quote timed out");
                    QuoteOutcome::Unavailable
                }
            },
            _ = cancelled(cancel) => QuoteOutcome::Cancelled,
        }
    }

    /// Send the sell, then update the book and the plan.
    ///
    /// Once the sell fills the exit is reported even if the plan write fails.
    /// The write is queued and retried at the start of the next poll.
    async fn execute_exit(
        &self,
        position: &Position,
        transition: &Transition,
        quantity: u64,
        price: Decimal,
        reason: ExitReason,
    ) -> Option<Trade> {
        let symbol = &position.symbol;
        let fill_price = if self.config.dry_run {
            info!(
                symbol = %symbol,
                quantity = quantity,
                price = %price,
                reason = %reason,
                "[DRY RUN] Would sell"
            );
            price
        } else {
            let order = Order::market(symbol, Side::Sell, quantity, Some(price));
            let result = match timeout(self.config.order_timeout(), self.broker.place_order(&order)).await {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => {
                    warn!(symbol = %symbol, error = %e, "Sell order failed");
                    return None;
                }
                Err(_) => {
                    warn!(symbol = %symbol, "Sell order timed out");
                    return None;
                }
            };
            if !result.is_filled() {
                warn!(symbol = %symbol, message = ?result.message, "Sell order not filled");
                return None;
            }
            result.avg_price.unwrap_or(price)
        };

        if !self.book.apply_transition(symbol, position.quantity, transition).await {
            warn!(symbol = %symbol, "Position changed during poll, exit not applied");
            return None;
        }

        let written = match &transition.remaining {
            Some(next) => self.store.update_partial_exit(symbol, next.quantity, next.stop_price).await,
            None => self.store.delete(symbol).await,
        };
        let mut pending = self.pending_plans.lock().await;
        match written {
            Ok(()) => {
                pending.remove(symbol);
            }
            Err(e) => {
                error!(symbol = %symbol, error = %e, "Failed to update plan after exit, will retry");
                pending.insert(symbol.clone(), transition.remaining.as_ref().map(PositionPlan::from));
            }
        }
        drop(pending);

        let costs = &self.config.costs;
        let fees = costs.fees(fill_price * Decimal::from(quantity), Side::Sell)
            + costs.fees(position.entry_price * Decimal::from(quantity), Side::Buy);
        let trade = Trade::close(position, quantity, fill_price, Utc::now(), reason, fees);

        info!(
            symbol = %symbol,
            reason = %reason,
            quantity = quantity,
            price = %fill_price,
            pnl = %trade.pnl.round_dp(2),
            "Exit executed"
        );
        Some(trade)
    }

    /// Persist a freshly opened position.
    pub(crate) async fn save_plan(store: &dyn PositionPlanStore, position: &Position) -> Result<()> {
        store
            .save(&PositionPlan::from(position))
            .await
            .with_context(|| format!("Failed to save plan for {}", position.symbol))
    }
}

/// Resolves once the flag is true. Never resolves if the sender is gone.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{BrokerPosition, OrderResult, PaperBroker};
    use crate::db::MemoryPlanStore;
    use crate::trading::CostConfig;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn position() -> Position {
        Position {
            symbol: "AAA".into(),
            strategy: "pullback".into(),
            quantity: 100,
            entry_price: dec!(100),
            stop_price: dec!(98),
            original_stop: dec!(98),
            target1: dec!(103),
            target2: dec!(106),
            target1_hit: false,
            // Monday
            entry_time: Utc.with_ymd_and_hms(2024, 3, 4, 15, 0, 0).unwrap(),
            max_hold_days: 10,
        }
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    async fn setup(dry_run: bool) -> (LiveMonitor, Arc<PaperBroker>, Arc<MemoryPlanStore>) {
        let broker = Arc::new(PaperBroker::new(CostConfig::frictionless()));
        broker.set_position("AAA", 100, dec!(100)).await;
        let store = Arc::new(MemoryPlanStore::new());
        LiveMonitor::save_plan(store.as_ref(), &position()).await.unwrap();

        let config = MonitorConfig { dry_run, costs: CostConfig::frictionless(), ..Default::default() };
        let monitor = LiveMonitor::new(config, broker.clone(), store.clone(), Arc::new(PositionBook::new()));
        assert_eq!(monitor.restore().await.unwrap(), 1);
        (monitor, broker, store)
    }

    #[tokio::test]
    async fn test_partial_then_breakeven_stop() {
        let (monitor, broker, store) = setup(false).await;
        let (_tx, mut rx) = watch::channel(false);

        broker.set_quote("AAA", dec!(101)).await;
        let report = monitor.poll_at(day(5), &mut rx).await.unwrap();
        assert_eq!(report.checked, 1);
        assert!(report.exits.is_empty());

        broker.set_quote("AAA", dec!(103.5)).await;
        let report = monitor.poll_at(day(6), &mut rx).await.unwrap();
        assert_eq!(report.exits.len(), 1);
        assert_eq!(report.exits[0].exit_reason, ExitReason::Target1);
        assert_eq!(report.exits[0].quantity, 50);

        let plan = store.get("AAA").await.unwrap().unwrap();
        assert!(plan.partial_exit_done);
        assert_eq!(plan.quantity, 50);
        assert_eq!(plan.stop_price, dec!(100));
        assert_eq!(
            broker.positions().await.unwrap(),
            vec![BrokerPosition { symbol: "AAA".into(), quantity: 50, avg_price: dec!(100) }]
        );

        broker.set_quote("AAA", dec!(100)).await;
        let report = monitor.poll_at(day(7), &mut rx).await.unwrap();
        assert_eq!(report.exits[0].exit_reason, ExitReason::Stop);
        assert!(monitor.book().is_empty().await);
        assert!(store.get("AAA").await.unwrap().is_none());
        assert_eq!(broker.fills().await.len(), 2);
    }

    #[tokio::test]
    async fn test_timeout_after_max_hold() {
        let (monitor, broker, store) = setup(true).await;
        let (_tx, mut rx) = watch::channel(false);
        broker.set_quote("AAA", dec!(101)).await;

        // Ten weekdays after Monday the 4th
        let report = monitor.poll_at(day(15), &mut rx).await.unwrap();
        assert!(report.exits.is_empty());
        let report = monitor.poll_at(day(18), &mut rx).await.unwrap();
        assert_eq!(report.exits[0].exit_reason, ExitReason::Timeout);
        assert!(store.all().await.unwrap().is_empty());
        // Dry run sends nothing
        assert!(broker.fills().await.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_start_leaves_book() {
        let (monitor, broker, _store) = setup(false).await;
        broker.set_quote("AAA", dec!(90)).await;
        let (tx, mut rx) = watch::channel(false);
        tx.send(true).unwrap();

        let report = monitor.poll_at(day(5), &mut rx).await.unwrap();
        assert!(report.cancelled);
        assert_eq!(report.checked, 0);
        assert_eq!(monitor.book().len().await, 1);
    }

    struct StalledBroker;

    #[async_trait]
    impl Broker for StalledBroker {
        async fn quote(&self, _symbol: &str) -> Result<Decimal> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(dec!(1))
        }

        async fn place_order(&self, _order: &Order) -> Result<OrderResult> {
            anyhow::bail!("unreachable")
        }

        async fn positions(&self) -> Result<Vec<BrokerPosition>> {
            Ok(Vec::new())
        }
    }

    async fn stalled(quote_timeout_ms: u64) -> LiveMonitor {
        let book = Arc::new(PositionBook::new());
        book.register(position()).await.unwrap();
        let config = MonitorConfig { quote_timeout_ms, ..Default::default() };
        LiveMonitor::new(config, Arc::new(StalledBroker), Arc::new(MemoryPlanStore::new()), book)
    }

    #[tokio::test]
    async fn test_quote_deadline() {
        let monitor = stalled(20).await;
        let (_tx, mut rx) = watch::channel(false);

        let report = monitor.poll_at(day(5), &mut rx).await.unwrap();
        assert!(!report.cancelled);
        assert!(report.exits.is_empty());
        assert_eq!(monitor.book().len().await, 1);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_quote() {
        let monitor = stalled(60_000).await;
        let (tx, mut rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            tx.send(true).ok();
        });

        let report = timeout(Duration::from_secs(5), monitor.poll_at(day(5), &mut rx))
            .await
            .unwrap()
            .unwrap();
        assert!(report.cancelled);
        assert_eq!(monitor.book().len().await, 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let monitor = stalled(20).await;
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tx.send(true).ok();
        });

        timeout(Duration::from_secs(5), monitor.run(rx)).await.unwrap().unwrap();
    }

    /// Memory store whose writes other than delete can be switched off.
    struct FlakyStore {
        inner: MemoryPlanStore,
        failing: AtomicBool,
    }

    impl FlakyStore {
        fn check(&self) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                anyhow::bail!("database is locked");
            }
            Ok(())
        }
    }

    #[async_trait]
    impl PositionPlanStore for FlakyStore {
        async fn save(&self, plan: &PositionPlan) -> Result<()> {
            self.check()?;
            self.inner.save(plan).await
        }

        async fn get(&self, symbol: &str) -> Result<Option<PositionPlan>> {
            self.inner.get(symbol).await
        }

        async fn delete(&self, symbol: &str) -> Result<()> {
            self.inner.delete(symbol).await
        }

        async fn update_partial_exit(&self, symbol: &str, remaining_qty: u64, new_stop: Decimal) -> Result<()> {
            self.check()?;
            self.inner.update_partial_exit(symbol, remaining_qty, new_stop).await
        }

        async fn all(&self) -> Result<HashMap<String, PositionPlan>> {
            self.inner.all().await
        }
    }

    #[tokio::test]
    async fn test_plan_write_failure_keeps_polling() {
        let broker = Arc::new(PaperBroker::new(CostConfig::frictionless()));
        broker.set_position("AAA", 100, dec!(100)).await;
        broker.set_position("BBB", 100, dec!(100)).await;
        let store = Arc::new(FlakyStore { inner: MemoryPlanStore::new(), failing: AtomicBool::new(false) });
        let other = Position { symbol: "BBB".into(), ..position() };
        LiveMonitor::save_plan(store.as_ref(), &position()).await.unwrap();
        LiveMonitor::save_plan(store.as_ref(), &other).await.unwrap();

        let config = MonitorConfig { dry_run: false, costs: CostConfig::frictionless(), ..Default::default() };
        let monitor = LiveMonitor::new(config, broker.clone(), store.clone(), Arc::new(PositionBook::new()));
        assert_eq!(monitor.restore().await.unwrap(), 2);
        let (_tx, mut rx) = watch::channel(false);

        store.failing.store(true, Ordering::SeqCst);
        broker.set_quote("AAA", dec!(104)).await;
        broker.set_quote("BBB", dec!(90)).await;
        let report = monitor.poll_at(day(5), &mut rx).await.unwrap();

        // The AAA partial sold even though its plan write failed, and BBB was still checked
        assert_eq!(report.checked, 2);
        assert_eq!(report.exits.len(), 2);
        assert_eq!(report.pending_plans, 1);
        let reasons: Vec<_> = report.exits.iter().map(|t| (t.symbol.as_str(), t.exit_reason)).collect();
        assert!(reasons.contains(&("AAA", ExitReason::Target1)));
        assert!(reasons.contains(&("BBB", ExitReason::Stop)));

        let open = monitor.book().snapshot().await;
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].symbol, "AAA");
        assert_eq!(open[0].quantity, 50);
        assert_eq!(
            broker.positions().await.unwrap(),
            vec![BrokerPosition { symbol: "AAA".into(), quantity: 50, avg_price: dec!(100) }]
        );
        assert!(store.get("BBB").await.unwrap().is_none());
        // Stale until the retry lands
        assert_eq!(store.get("AAA").await.unwrap().unwrap().quantity, 100);

        store.failing.store(false, Ordering::SeqCst);
        broker.set_quote("AAA", dec!(101)).await;
        let report = monitor.poll_at(day(6), &mut rx).await.unwrap();
        assert!(report.exits.is_empty());
        assert_eq!(report.pending_plans, 0);

        let plan = store.get("AAA").await.unwrap().unwrap();
        assert_eq!(plan.quantity, 50);
        assert!(plan.partial_exit_done);
        assert_eq!(plan.stop_price, dec!(100));
        assert_eq!(broker.fills().await.len(), 2);
    }
}
