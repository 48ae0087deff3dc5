use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::{interval, timeout, Duration};

use crate::api::{DexScreenerClient, JupiterPriceClient};
use crate::Result;

/// Used until the first successful reconciliation ever. Once a real rate has
/// been observed the oracle never falls back to this again.
pub const DEFAULT_SOL_RATE: f64 = 150.0;

pub const SOL_MINT: &str = "So11111111111111111111111111111111111111112";

const REFRESH_INTERVAL_SECS: u64 = 300;
const SOURCE_TIMEOUT_SECS: u64 = 10;

/// One independent SOL/USD quote source.
#[async_trait]
pub trait QuoteSource: Send + Sync {
    fn name(&self) -> &'static str;
    async fn fetch_sol_usd(&self) -> Result<f64>;
}

/// Direct quote source for the SOL mint.
pub struct DirectQuoteSource {
    client: JupiterPriceClient,
}

impl DirectQuoteSource {
    pub fn new(client: JupiterPriceClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl QuoteSource for DirectQuoteSource {
    fn name(&self) -> &'static str {
        "direct-quote"
    }

    async fn fetch_sol_usd(&self) -> Result<f64> {
        self.client.get_usd_price(SOL_MINT).await
    }
}

/// Aggregator source for the SOL pair listing.
pub struct AggregatorQuoteSource {
    client: DexScreenerClient,
}

impl AggregatorQuoteSource {
    pub fn new(client: DexScreenerClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl QuoteSource for AggregatorQuoteSource {
    fn name(&self) -> &'static str {
        "aggregator"
    }

    async fn fetch_sol_usd(&self) -> Result<f64> {
        let quote = self.client.get_quote(SOL_MINT).await?;
        quote
            .price_usd
            .ok_or_else(|| "aggregator listed no SOL price".into())
    }
}

#[derive(Debug, Default)]
struct RateState {
    last_good: Option<f64>,
    refreshed_at: Option<DateTime<Utc>>,
}

/// SOL/USD reference rate reconciled across independent quote sources.
///
/// `rate()` always returns a usable number: the mean of the sources that
/// answered on the last refresh, the last good value across total failures,
/// or [`DEFAULT_SOL_RATE`] before any source ever succeeded.
pub struct PriceOracle {
    sources: Vec<Arc<dyn QuoteSource>>,
    state: RwLock<RateState>,
}

impl PriceOracle {
    pub fn new(sources: Vec<Arc<dyn QuoteSource>>) -> Self {
        Self {
            sources,
            state: RwLock::new(RateState::default()),
        }
    }

    pub fn with_default_sources() -> Self {
        Self::new(vec![
            Arc::new(DirectQuoteSource::new(JupiterPriceClient::new())),
            Arc::new(AggregatorQuoteSource::new(DexScreenerClient::new())),
        ])
    }

    /// Current settlement rate. Never fails, never blocks on the network.
    pub fn rate(&self) -> f64 {
        self.state
            .read()
            .expect("oracle state lock poisoned")
            .last_good
            .unwrap_or(DEFAULT_SOL_RATE)
    }

    /// True once at least one refresh has succeeded.
    pub fn has_live_rate(&self) -> bool {
        self.state
            .read()
            .expect("oracle state lock poisoned")
            .last_good
            .is_some()
    }

    pub fn refreshed_at(&self) -> Option<DateTime<Utc>> {
        self.state
            .read()
            .expect("oracle state lock poisoned")
            .refreshed_at
    }

    /// Query all sources concurrently and reconcile. A source timing out or
    /// erroring is logged and skipped; it never propagates to callers.
    pub async fn refresh(&self) {
        let mut handles = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            let source = source.clone();
            handles.push(tokio::spawn(async move {
                let name = source.name();
                match timeout(
                    Duration::from_secs(SOURCE_TIMEOUT_SECS),
                    source.fetch_sol_usd(),
                )
                .await
                {
                    Ok(Ok(value)) if value.is_finite() && value > 0.0 => Some(value),
                    Ok(Ok(value)) => {
                        tracing::warn!(source = name, value, "quote source returned unusable value");
                        None
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(source = name, error = %e, "quote source failed");
                        None
                    }
                    Err(_) => {
                        tracing::warn!(source = name, "quote source timed out");
                        None
                    }
                }
            }));
        }

        let mut values = Vec::new();
        for handle in handles {
            if let Ok(Some(value)) = handle.await {
                values.push(value);
            }
        }

        if values.is_empty() {
            tracing::warn!("all quote sources failed, keeping last good rate");
            return;
        }

        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let mut state = self.state.write().expect("oracle state lock poisoned");
        state.last_good = Some(mean);
        state.refreshed_at = Some(Utc::now());
        tracing::info!(rate = mean, sources = values.len(), "settlement rate refreshed");
    }
}

/// Refresh once at startup, then on the fixed interval.
pub fn spawn_refresh_loop(oracle: Arc<PriceOracle>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(REFRESH_INTERVAL_SECS));
        loop {
            ticker.tick().await;
            oracle.refresh().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticSource(f64);

    #[async_trait]
    impl QuoteSource for StaticSource {
        fn name(&self) -> &'static str {
            "static"
        }

        async fn fetch_sol_usd(&self) -> Result<f64> {
            Ok(self.0)
        }
    }

    struct FailingSource;

    #[async_trait]
    impl QuoteSource for FailingSource {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn fetch_sol_usd(&self) -> Result<f64> {
            Err("connection refused".into())
        }
    }

    #[tokio::test]
    async fn test_mean_of_successful_sources() {
        let oracle = PriceOracle::new(vec![
            Arc::new(StaticSource(100.0)),
            Arc::new(StaticSource(110.0)),
            Arc::new(FailingSource),
        ]);

        oracle.refresh().await;
        assert_eq!(oracle.rate(), 105.0);
        assert!(oracle.has_live_rate());
        assert!(oracle.refreshed_at().is_some());
    }

    #[tokio::test]
    async fn test_default_before_first_success() {
        let oracle = PriceOracle::new(vec![Arc::new(FailingSource)]);
        assert_eq!(oracle.rate(), DEFAULT_SOL_RATE);
        assert!(!oracle.has_live_rate());

        oracle.refresh().await;
        assert_eq!(oracle.rate(), DEFAULT_SOL_RATE);
        assert!(!oracle.has_live_rate());
    }

    #[tokio::test]
    async fn test_total_failure_keeps_last_good() {
        let oracle = PriceOracle::new(vec![
            Arc::new(StaticSource(200.0)),
            Arc::new(FailingSource),
        ]);
        oracle.refresh().await;
        assert_eq!(oracle.rate(), 200.0);

        // Second refresh with every source down: rate survives.
        let oracle_down = PriceOracle {
            sources: vec![Arc::new(FailingSource)],
            state: RwLock::new(RateState {
                last_good: Some(200.0),
                refreshed_at: Some(Utc::now()),
            }),
        };
        oracle_down.refresh().await;
        assert_eq!(oracle_down.rate(), 200.0);
    }

    #[tokio::test]
    async fn test_non_finite_values_rejected() {
        let oracle = PriceOracle::new(vec![
            Arc::new(StaticSource(f64::NAN)),
            Arc::new(StaticSource(-5.0)),
            Arc::new(StaticSource(120.0)),
        ]);
        oracle.refresh().await;
        assert_eq!(oracle.rate(), 120.0);
    }
}
