//! Shared open-position set.

use std::collections::HashMap;

use anyhow::Result;
use tokio::sync::Mutex;

use crate::models::Position;
use crate::trading::Transition;

/// Open positions keyed by symbol.
///
/// Every method holds the lock only for in-memory work, never across I/O.
#[derive(Debug, Default)]
pub struct PositionBook {
    positions: Mutex<HashMap<String, Position>>,
}

impl PositionBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a position. Fails if the symbol is already held.
    pub async fn register(&self, position: Position) -> Result<()> {
        let mut positions = self.positions.lock().await;
        if positions.contains_key(&position.symbol) {
            anyhow::bail!("{} is already held", position.symbol);
        }
        positions.insert(position.symbol.clone(), position);
        Ok(())
    }

    pub async fn unregister(&self, symbol: &str) -> Option<Position> {
        self.positions.lock().await.remove(symbol)
    }

    /// Copy of the open set, ordered by symbol.
    pub async fn snapshot(&self) -> Vec<Position> {
        let positions = self.positions.lock().await;
        let mut out: Vec<Position> = positions.values().cloned().collect();
        out.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        out
    }

    /// Apply an exit transition in one step.
    ///
    /// Returns `false` and changes nothing if the symbol is gone or its
    /// quantity no longer equals `expected_qty`.
    pub async fn apply_transition(&self, symbol: &str, expected_qty: u64, transition: &Transition) -> bool {
        let mut positions = self.positions.lock().await;
        match positions.get(symbol) {
            Some(current) if current.quantity == expected_qty => {}
            _ => return false,
        }
        match &transition.remaining {
            Some(next) => {
                positions.insert(symbol.to_string(), next.clone());
            }
            None => {
                positions.remove(symbol);
            }
        }
        true
    }

    pub async fn len(&self) -> usize {
        self.positions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
