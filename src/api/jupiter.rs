use std::collections::HashMap;

use reqwest::Client;
use serde::Deserialize;

use crate::models::{TickSource, TickUpdate};
use crate::Result;

const JUPITER_API_BASE: &str = "https://lite-api.jup.ag";

/// Client for the direct quote API (Jupiter-shaped).
///
/// The response is a map keyed by asset id:
/// `{ "<mint>": { "usdPrice": 178.42 } }`.
#[derive(Clone)]
pub struct JupiterPriceClient {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UsdPriceEntry {
    #[serde(default)]
    pub(crate) usd_price: Option<f64>,
}

pub(crate) type DirectQuoteResponse = HashMap<String, UsdPriceEntry>;

impl JupiterPriceClient {
    pub fn new() -> Self {
        Self::with_base_url(JUPITER_API_BASE)
    }

    /// Point the client at a different base URL (tests use a local mock).
    pub fn with_base_url(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// USD price for one asset. Absent or non-positive entries are an error
    /// so callers can fall back to another source.
    pub async fn get_usd_price(&self, asset_id: &str) -> Result<f64> {
        let url = format!("{}/price/v3?ids={}", self.base_url, asset_id);

        let response: DirectQuoteResponse = self.client.get(&url).send().await?.json().await?;

        response
            .get(asset_id)
            .and_then(|entry| entry.usd_price)
            .filter(|p| p.is_finite() && *p > 0.0)
            .ok_or_else(|| format!("No usable price for {}", asset_id).into())
    }

    /// Fetch a price and shape it into a market tick for the synchronizer.
    pub async fn get_tick(&self, asset_id: &str) -> Result<TickUpdate> {
        let price = self.get_usd_price(asset_id).await?;
        Ok(TickUpdate {
            asset_id: asset_id.to_string(),
            price: Some(price),
            valuation: None,
            liquidity: None,
            symbol: None,
            ts: chrono::Utc::now(),
            source: TickSource::DirectQuote,
        })
    }
}

impl Default for JupiterPriceClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_usd_price_mocked() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/price/v3?ids=mint-a")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"mint-a":{"usdPrice":178.42}}"#)
            .create_async()
            .await;

        let client = JupiterPriceClient::with_base_url(&server.url());
        let price = client.get_usd_price("mint-a").await.unwrap();

        mock.assert_async().await;
        assert_eq!(price, 178.42);
    }

    #[tokio::test]
    async fn test_missing_asset_is_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/price/v3?ids=mint-a")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"other-mint":{"usdPrice":1.0}}"#)
            .create_async()
            .await;

        let client = JupiterPriceClient::with_base_url(&server.url());
        assert!(client.get_usd_price("mint-a").await.is_err());
    }

    #[tokio::test]
    async fn test_zero_price_is_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/price/v3?ids=mint-a")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"mint-a":{"usdPrice":0.0}}"#)
            .create_async()
            .await;

        let client = JupiterPriceClient::with_base_url(&server.url());
        assert!(client.get_usd_price("mint-a").await.is_err());
    }

    #[tokio::test]
    #[ignore] // Requires live API
    async fn test_get_usd_price_live() {
        let client = JupiterPriceClient::new();
        let sol_mint = "So11111111111111111111111111111111111111112";

        let price = client.get_usd_price(sol_mint).await.unwrap();
        assert!(price > 0.0);
    }
}
