//! Concurrent history loading for a symbol universe.

use std::collections::HashMap;

use futures::stream::{self, StreamExt};
use tracing::{info, warn};

use crate::models::Bar;
use super::DataSource;

/// Fetch `count` bars for every symbol with at most `concurrency` requests in flight.
///
/// Symbols that fail to load or come back empty are logged and left out.
pub async fn load_universe(
    source: &dyn DataSource,
    symbols: &[String],
    count: usize,
    concurrency: usize,
) -> HashMap<String, Vec<Bar>> {
    let results: Vec<_> = stream::iter(symbols.iter().cloned())
        .map(|symbol| async move {
            let bars = source.daily_bars(&symbol, count).await;
            (symbol, bars)
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let mut universe = HashMap::with_capacity(results.len());
    for (symbol, bars) in results {
        match bars {
            Ok(bars) if !bars.is_empty() => {
                universe.insert(symbol, bars);
            }
            Ok(_) => warn!(symbol = %symbol, "No bars returned"),
            Err(e) => warn!(symbol = %symbol, error = %e, "Failed to load bars"),
        }
    }

    info!(requested = symbols.len(), loaded = universe.len(), "Loaded universe");
    universe
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::JsonFileSource;
    use crate::models::test_support::flat_bars;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_skips_failed_symbols() {
        let dir = tempfile::tempdir().unwrap();
        for symbol in ["AAA", "BBB"] {
            let bars = flat_bars(20, dec!(10));
            std::fs::write(dir.path().join(format!("{}.json", symbol)), serde_json::to_vec(&bars).unwrap())
                .unwrap();
        }
        std::fs::write(dir.path().join("EMPTY.json"), b"[]").unwrap();

        let source = JsonFileSource::new(dir.path());
        let symbols: Vec<String> = ["AAA", "BBB", "EMPTY", "MISSING"].iter().map(|s| s.to_string()).collect();
        let universe = load_universe(&source, &symbols, 15, 2).await;

        assert_eq!(universe.len(), 2);
        assert_eq!(universe["AAA"].len(), 15);
    }
}
