//! Position-plan persistence for restart durability.
//!
//! A plan mirrors an open `Position` field for field, so the live monitor
//! can rebuild its book after a restart and keep partial-exit state.

use std::collections::HashMap;
use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::models::Position;

/// Persisted exit plan for one open position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionPlan {
    pub symbol: String,
    pub strategy: String,
    pub quantity: u64,
    pub entry_price: Decimal,
    pub stop_price: Decimal,
    pub original_stop: Decimal,
    pub target1: Decimal,
    pub target2: Decimal,
    pub partial_exit_done: bool,
    pub entry_time: DateTime<Utc>,
    pub max_hold_days: u32,
}

impl From<&Position> for PositionPlan {
    fn from(p: &Position) -> Self {
        Self {
            symbol: p.symbol.clone(),
            strategy: p.strategy.clone(),
            quantity: p.quantity,
            entry_price: p.entry_price,
            stop_price: p.stop_price,
            original_stop: p.original_stop,
            target1: p.target1,
            target2: p.target2,
            partial_exit_done: p.target1_hit,
            entry_time: p.entry_time,
            max_hold_days: p.max_hold_days,
        }
    }
}

impl PositionPlan {
    pub fn to_position(&self) -> Position {
        Position {
            symbol: self.symbol.clone(),
            strategy: self.strategy.clone(),
            quantity: self.quantity,
            entry_price: self.entry_price,
            stop_price: self.stop_price,
            original_stop: self.original_stop,
            target1: self.target1,
            target2: self.target2,
            target1_hit: self.partial_exit_done,
            entry_time: self.entry_time,
            max_hold_days: self.max_hold_days,
        }
    }
}

/// Checkpoint store keyed by symbol.
#[async_trait]
pub trait PositionPlanStore: Send + Sync {
    /// Insert or replace the plan for `plan.symbol`.
    async fn save(&self, plan: &PositionPlan) -> Result<()>;

    async fn get(&self, symbol: &str) -> Result<Option<PositionPlan>>;

    async fn delete(&self, symbol: &str) -> Result<()>;

    /// Record a target1 partial exit.
    async fn update_partial_exit(&self, symbol: &str, remaining_qty: u64, new_stop: Decimal) -> Result<()>;

    async fn all(&self) -> Result<HashMap<String, PositionPlan>>;
}

/// SQLite-backed plan store.
pub struct SqlitePlanStore {
    pool: SqlitePool,
}

/// Row as stored. Decimals and timestamps are TEXT.
#[derive(Debug, Clone, sqlx::FromRow)]
struct StoredPlan {
    symbol: String,
    strategy: String,
    quantity: i64,
    entry_price: String,
    stop_price: String,
    original_stop: String,
    target1: String,
    target2: String,
    partial_exit_done: bool,
    entry_time: String,
    max_hold_days: i64,
}

impl StoredPlan {
    fn into_plan(self) -> Result<PositionPlan> {
        let dec = |field: &str, raw: &str| {
            Decimal::from_str(raw).with_context(|| format!("Bad {} '{}' for {}", field, raw, self.symbol))
        };
        Ok(PositionPlan {
            entry_price: dec("entry_price", &self.entry_price)?,
            stop_price: dec("stop_price", &self.stop_price)?,
            original_stop: dec("original_stop", &self.original_stop)?,
            target1: dec("target1", &self.target1)?,
            target2: dec("target2", &self.target2)?,
            quantity: u64::try_from(self.quantity).context("Negative quantity in plan")?,
            partial_exit_done: self.partial_exit_done,
            entry_time: DateTime::parse_from_rfc3339(&self.entry_time)
                .with_context(|| format!("Bad entry_time for {}", self.symbol))?
                .with_timezone(&Utc),
            max_hold_days: u32::try_from(self.max_hold_days).context("Bad max_hold_days in plan")?,
            strategy: self.strategy.clone(),
            symbol: self.symbol.clone(),
        })
    }
}

impl SqlitePlanStore {
    /// Connect and create the schema if needed.
    pub async fn new(database_url: &str) -> Result<Self> {
        // Each in-memory connection is a separate database
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let store = Self { pool };
        store.run_migrations().await?;

        info!(url = %database_url, "Plan store ready");
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS position_plans (
                symbol TEXT PRIMARY KEY,
                strategy TEXT NOT NULL,
                quantity INTEGER NOT NULL,
                entry_price TEXT NOT NULL,
                stop_price TEXT NOT NULL,
                original_stop TEXT NOT NULL,
                target1 TEXT NOT NULL,
                target2 TEXT NOT NULL,
                partial_exit_done INTEGER NOT NULL DEFAULT 0,
                entry_time TEXT NOT NULL,
                max_hold_days INTEGER NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

const SELECT_PLAN: &str = r#"
    SELECT symbol, strategy, quantity, entry_price, stop_price, original_stop,
           target1, target2, partial_exit_done, entry_time, max_hold_days
    FROM position_plans
"#;

#[async_trait]
impl PositionPlanStore for SqlitePlanStore {
    async fn save(&self, plan: &PositionPlan) -> Result<()> {
        let quantity = i64::try_from(plan.quantity).context("Quantity out of range")?;
        sqlx::query(
            r#"
            INSERT INTO position_plans (
                symbol, strategy, quantity, entry_price, stop_price, original_stop,
                target1, target2, partial_exit_done, entry_time, max_hold_days
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(symbol) DO UPDATE SET
                strategy = excluded.strategy,
                quantity = excluded.quantity,
                entry_price = excluded.entry_price,
                stop_price = excluded.stop_price,
                original_stop = excluded.original_stop,
                target1 = excluded.target1,
                target2 = excluded.target2,
                partial_exit_done = excluded.partial_exit_done,
                entry_time = excluded.entry_time,
                max_hold_days = excluded.max_hold_days,
                updated_at = datetime('now')
            "#,
        )
        .bind(&plan.symbol)
        .bind(&plan.strategy)
        .bind(quantity)
        .bind(plan.entry_price.to_string())
        .bind(plan.stop_price.to_string())
        .bind(plan.original_stop.to_string())
        .bind(plan.target1.to_string())
        .bind(plan.target2.to_string())
        .bind(plan.partial_exit_done)
        .bind(plan.entry_time.to_rfc3339())
        .bind(i64::from(plan.max_hold_days))
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to save plan for {}", plan.symbol))?;

        debug!(symbol = %plan.symbol, qty = plan.quantity, "Saved plan");
        Ok(())
    }

    async fn get(&self, symbol: &str) -> Result<Option<PositionPlan>> {
        let row = sqlx::query_as::<_, StoredPlan>(&format!("{} WHERE symbol = ?", SELECT_PLAN))
            .bind(symbol)
            .fetch_optional(&self.pool)
            .await?;

        row.map(StoredPlan::into_plan).transpose()
    }

    async fn delete(&self, symbol: &str) -> Result<()> {
        sqlx::query("DELETE FROM position_plans WHERE symbol = ?")
            .bind(symbol)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_partial_exit(&self, symbol: &str, remaining_qty: u64, new_stop: Decimal) -> Result<()> {
        let quantity = i64::try_from(remaining_qty).context("Quantity out of range")?;
        let result = sqlx::query(
            r#"
            UPDATE position_plans SET
                quantity = ?,
                stop_price = ?,
                partial_exit_done = 1,
                updated_at = datetime('now')
            WHERE symbol = ?
            "#,
        )
        .bind(quantity)
        .bind(new_stop.to_string())
        .bind(symbol)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            anyhow::bail!("No plan stored for {}", symbol);
        }
        Ok(())
    }

    async fn all(&self) -> Result<HashMap<String, PositionPlan>> {
        let rows = sqlx::query_as::<_, StoredPlan>(SELECT_PLAN)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| row.into_plan().map(|plan| (plan.symbol.clone(), plan)))
            .collect()
    }
}

/// In-process store for dry runs and tests.
#[derive(Default)]
pub struct MemoryPlanStore {
    plans: RwLock<HashMap<String, PositionPlan>>,
}

impl MemoryPlanStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PositionPlanStore for MemoryPlanStore {
    async fn save(&self, plan: &PositionPlan) -> Result<()> {
        self.plans.write().await.insert(plan.symbol.clone(), plan.clone());
        Ok(())
    }

    async fn get(&self, symbol: &str) -> Result<Option<PositionPlan>> {
        Ok(self.plans.read().await.get(symbol).cloned())
    }

    async fn delete(&self, symbol: &str) -> Result<()> {
        self.plans.write().await.remove(symbol);
        Ok(())
    }

    async fn update_partial_exit(&self, symbol: &str, remaining_qty: u64, new_stop: Decimal) -> Result<()> {
        let mut plans = self.plans.write().await;
        let plan = plans
            .get_mut(symbol)
            .with_context(|| format!("No plan stored for {}", symbol))?;
        plan.quantity = remaining_qty;
        plan.stop_price = new_stop;
        plan.partial_exit_done = true;
        Ok(())
    }

    async fn all(&self) -> Result<HashMap<String, PositionPlan>> {
        Ok(self.plans.read().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn plan(symbol: &str) -> PositionPlan {
        PositionPlan {
            symbol: symbol.into(),
            strategy: "pullback".into(),
            quantity: 100,
            entry_price: dec!(100.25),
            stop_price: dec!(98),
            original_stop: dec!(98),
            target1: dec!(103),
            target2: dec!(106),
            partial_exit_done: false,
            entry_time: Utc.with_ymd_and_hms(2024, 3, 4, 14, 30, 0).unwrap(),
            max_hold_days: 10,
        }
    }

    async fn exercise(store: &dyn PositionPlanStore) {
        store.save(&plan("AAA")).await.unwrap();
        store.save(&plan("BBB")).await.unwrap();
        assert_eq!(store.get("AAA").await.unwrap(), Some(plan("AAA")));
        assert!(store.get("ZZZ").await.unwrap().is_none());

        store.update_partial_exit("AAA", 50, dec!(100.25)).await.unwrap();
        let updated = store.get("AAA").await.unwrap().unwrap();
        assert_eq!(updated.quantity, 50);
        assert_eq!(updated.stop_price, dec!(100.25));
        assert!(updated.partial_exit_done);
        assert_eq!(updated.original_stop, dec!(98));
        assert!(store.update_partial_exit("ZZZ", 1, dec!(1)).await.is_err());

        store.delete("BBB").await.unwrap();
        let all = store.all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(all.contains_key("AAA"));
    }

    #[tokio::test]
    async fn test_sqlite_store() {
        let store = SqlitePlanStore::new("sqlite::memory:").await.unwrap();
        exercise(&store).await;
    }

    #[test]
    fn test_memory_store() {
        tokio_test::block_on(exercise(&MemoryPlanStore::new()));
    }

    #[test]
    fn test_position_round_trip() {
        let mut p = plan("AAA");
        p.partial_exit_done = true;
        let position = p.to_position();
        assert!(position.target1_hit);
        assert_eq!(PositionPlan::from(&position), p);
    }
}
