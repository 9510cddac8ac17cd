//! Bars from `<dir>/<SYMBOL>.json` files.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;

use crate::models::Bar;
use super::{normalize_bars, DataSource};

/// Reads one JSON array of bars per symbol.
#[derive(Debug, Clone)]
pub struct JsonFileSource {
    dir: PathBuf,
}

impl JsonFileSource {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self { dir: dir.as_ref().to_path_buf() }
    }

    fn path_for(&self, symbol: &str) -> PathBuf {
        self.dir.join(format!("{}.json", symbol))
    }
}

#[async_trait]
impl DataSource for JsonFileSource {
    async fn daily_bars(&self, symbol: &str, count: usize) -> Result<Vec<Bar>> {
        let path = self.path_for(symbol);
        debug!(path = %path.display(), "Reading bars");

        let raw = tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let bars: Vec<Bar> = serde_json::from_slice(&raw)
            .with_context(|| format!("Failed to parse bars in {}", path.display()))?;

        Ok(normalize_bars(bars, count))
    }
}
