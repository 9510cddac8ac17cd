//! HTTP bar provider with retry on transient failures.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use backoff::ExponentialBackoff;
use reqwest::{Client, StatusCode};
use tracing::{debug, warn};

use crate::models::Bar;
use super::{normalize_bars, DataSource};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_RETRY_ELAPSED: Duration = Duration::from_secs(60);

/// Client for a bars endpoint of the form `GET {base}/bars/{symbol}?count=N`.
pub struct HttpDataSource {
    client: Client,
    base_url: String,
}

impl HttpDataSource {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn retry_policy() -> ExponentialBackoff {
        ExponentialBackoff {
            max_elapsed_time: Some(MAX_RETRY_ELAPSED),
            ..Default::default()
        }
    }

    async fn fetch_once(&self, url: &str) -> Result<Vec<Bar>, backoff::Error<anyhow::Error>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| backoff::Error::transient(anyhow::Error::new(e).context("Failed to fetch bars")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let err = anyhow::anyhow!("Bars request failed: {} - {}", status, body);
            // Rate limits and server errors are worth retrying
            return if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                warn!(status = %status, "Retrying bars request");
                Err(backoff::Error::transient(err))
            } else {
                Err(backoff::Error::permanent(err))
            };
        }

        response
            .json()
            .await
            .context("Failed to parse bars response")
            .map_err(backoff::Error::permanent)
    }
}

#[async_trait]
impl DataSource for HttpDataSource {
    async fn daily_bars(&self, symbol: &str, count: usize) -> Result<Vec<Bar>> {
        let url = format!("{}/bars/{}?count={}", self.base_url, symbol, count);
        debug!(url = %url, "Fetching bars");

        let bars = backoff::future::retry(Self::retry_policy(), || self.fetch_once(&url)).await?;
        Ok(normalize_bars(bars, count))
    }
}
