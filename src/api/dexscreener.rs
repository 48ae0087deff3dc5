use std::num::NonZeroU32;
use std::sync::Arc;

use governor::{Quota, RateLimiter};
use reqwest::Client;
use serde::Deserialize;
use tokio::time::{sleep, Duration};

use crate::models::{TickSource, TickUpdate};
use crate::Result;

const DEXSCREENER_API_BASE: &str = "https://api.dexscreener.com/latest/dex";
const RATE_LIMIT_RPM: u32 = 60;
const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 2000;

type AggregatorRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Client for the aggregator quote API (DexScreener-shaped).
///
/// All clones share the same rate limiter.
#[derive(Clone)]
pub struct DexScreenerClient {
    client: Client,
    base_url: String,
    rate_limiter: Arc<AggregatorRateLimiter>,
}

// ============== Response Types ==============

#[derive(Debug, Deserialize)]
pub(crate) struct AggregatorResponse {
    // Some responses carry `pairs: null` for unknown tokens.
    #[serde(default)]
    pub(crate) pairs: Option<Vec<PairData>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PairData {
    #[serde(default)]
    pub(crate) base_token: Option<TokenInfo>,
    /// Quoted as a string by the upstream.
    #[serde(default)]
    pub(crate) price_usd: Option<String>,
    #[serde(default)]
    pub(crate) market_cap: Option<f64>,
    #[serde(default)]
    pub(crate) fdv: Option<f64>,
    #[serde(default)]
    pub(crate) liquidity: Option<LiquidityData>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TokenInfo {
    #[serde(default)]
    pub(crate) symbol: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LiquidityData {
    #[serde(default)]
    pub(crate) usd: Option<f64>,
}

// ============== Public Types ==============

/// Best pair for an asset, as reported by the aggregator.
#[derive(Debug, Clone, Default)]
pub struct PairQuote {
    pub price_usd: Option<f64>,
    /// `marketCap` when present, otherwise `fdv`.
    pub market_cap: Option<f64>,
    pub liquidity_usd: Option<f64>,
    pub symbol: Option<String>,
}

impl From<PairData> for PairQuote {
    fn from(pair: PairData) -> Self {
        PairQuote {
            price_usd: pair
                .price_usd
                .as_deref()
                .and_then(|s| s.parse::<f64>().ok())
                .filter(|p| p.is_finite() && *p > 0.0),
            market_cap: pair.market_cap.or(pair.fdv).filter(|v| *v > 0.0),
            liquidity_usd: pair.liquidity.and_then(|l| l.usd),
            symbol: pair.base_token.and_then(|t| t.symbol),
        }
    }
}

/// Picks the deepest pair out of an aggregator response. Pairs arrive
/// liquidity-sorted, but the sort is re-derived rather than trusted.
pub(crate) fn best_pair(pairs: Vec<PairData>) -> Option<PairQuote> {
    pairs
        .into_iter()
        .max_by(|a, b| {
            let la = a.liquidity.as_ref().and_then(|l| l.usd).unwrap_or(0.0);
            let lb = b.liquidity.as_ref().and_then(|l| l.usd).unwrap_or(0.0);
            la.total_cmp(&lb)
        })
        .map(PairQuote::from)
}

impl DexScreenerClient {
    pub fn new() -> Self {
        Self::with_base_url(DEXSCREENER_API_BASE)
    }

    /// Point the client at a different base URL (tests use a local mock).
    pub fn with_base_url(base_url: &str) -> Self {
        let quota = Quota::per_minute(NonZeroU32::new(RATE_LIMIT_RPM).unwrap());
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
        }
    }

    /// Get the best-liquidity quote for an asset, with retry and backoff
    /// for transient failures.
    pub async fn get_quote(&self, asset_id: &str) -> Result<PairQuote> {
        let mut last_error = None;

        for attempt in 1..=MAX_RETRIES {
            match self.fetch_quote_once(asset_id).await {
                Ok(quote) => {
                    if attempt > 1 {
                        tracing::info!("Fetched {} after {} attempts", asset_id, attempt);
                    }
                    return Ok(quote);
                }
                Err(e) => {
                    last_error = Some(e);

                    if attempt < MAX_RETRIES {
                        let backoff_ms = INITIAL_BACKOFF_MS * 2_u64.pow(attempt - 1);
                        tracing::warn!(
                            "Attempt {}/{} failed for {}: {}. Retrying in {}ms...",
                            attempt,
                            MAX_RETRIES,
                            asset_id,
                            last_error.as_ref().unwrap(),
                            backoff_ms
                        );
                        sleep(Duration::from_millis(backoff_ms)).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| "All retry attempts failed".into()))
    }

    async fn fetch_quote_once(&self, asset_id: &str) -> Result<PairQuote> {
        self.rate_limiter.until_ready().await;

        let url = format!("{}/tokens/{}", self.base_url, asset_id);
        let response: AggregatorResponse = self.client.get(&url).send().await?.json().await?;

        let pairs = response.pairs.unwrap_or_default();
        best_pair(pairs).ok_or_else(|| format!("No pairs listed for {}", asset_id).into())
    }

    /// Fetch a quote and shape it into a market tick for the synchronizer.
    pub async fn get_tick(&self, asset_id: &str) -> Result<TickUpdate> {
        let quote = self.get_quote(asset_id).await?;
        Ok(TickUpdate {
            asset_id: asset_id.to_string(),
            price: quote.price_usd,
            valuation: quote.market_cap,
            liquidity: quote.liquidity_usd,
            symbol: quote.symbol,
            ts: chrono::Utc::now(),
            source: TickSource::Aggregator,
        })
    }
}

impl Default for DexScreenerClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_best_pair_prefers_liquidity() {
        let parsed: AggregatorResponse = serde_json::from_str(
            r#"{"pairs":[
                {"baseToken":{"symbol":"WIF"},"priceUsd":"1.91","marketCap":1900000000.0,"liquidity":{"usd":50000.0}},
                {"baseToken":{"symbol":"WIF"},"priceUsd":"1.93","marketCap":1910000000.0,"liquidity":{"usd":9000000.0}}
            ]}"#,
        )
        .unwrap();

        let quote = best_pair(parsed.pairs.unwrap()).unwrap();
        assert_eq!(quote.price_usd, Some(1.93));
        assert_eq!(quote.market_cap, Some(1_910_000_000.0));
        assert_eq!(quote.symbol.as_deref(), Some("WIF"));
    }

    #[test]
    fn test_missing_optional_fields_tolerated() {
        // fdv only, no marketCap, no liquidity, no symbol.
        let parsed: AggregatorResponse =
            serde_json::from_str(r#"{"pairs":[{"priceUsd":"0.004","fdv":400000.0}]}"#).unwrap();

        let quote = best_pair(parsed.pairs.unwrap()).unwrap();
        assert_eq!(quote.price_usd, Some(0.004));
        assert_eq!(quote.market_cap, Some(400_000.0));
        assert!(quote.liquidity_usd.is_none());
        assert!(quote.symbol.is_none());
    }

    #[test]
    fn test_null_pairs_tolerated() {
        let parsed: AggregatorResponse = serde_json::from_str(r#"{"pairs":null}"#).unwrap();
        assert!(best_pair(parsed.pairs.unwrap_or_default()).is_none());
    }

    #[test]
    fn test_unparseable_price_dropped_not_fatal() {
        let parsed: AggregatorResponse = serde_json::from_str(
            r#"{"pairs":[{"priceUsd":"n/a","marketCap":1000.0,"liquidity":{"usd":1.0}}]}"#,
        )
        .unwrap();
        let quote = best_pair(parsed.pairs.unwrap()).unwrap();
        assert!(quote.price_usd.is_none());
        assert_eq!(quote.market_cap, Some(1000.0));
    }

    #[tokio::test]
    async fn test_get_quote_mocked() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/tokens/mint-a")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"pairs":[{"baseToken":{"symbol":"BONK"},"priceUsd":"0.000021","marketCap":1500000000.0,"liquidity":{"usd":4000000.0}}]}"#,
            )
            .create_async()
            .await;

        let client = DexScreenerClient::with_base_url(&server.url());
        let quote = client.get_quote("mint-a").await.unwrap();

        mock.assert_async().await;
        assert_eq!(quote.symbol.as_deref(), Some("BONK"));
        assert_eq!(quote.price_usd, Some(0.000021));
    }

    #[tokio::test]
    #[ignore] // Requires live API
    async fn test_get_quote_live() {
        let client = DexScreenerClient::new();
        let sol_mint = "So11111111111111111111111111111111111111112";

        let quote = client.get_quote(sol_mint).await.unwrap();
        assert!(quote.price_usd.unwrap_or(0.0) > 0.0);
    }
}
