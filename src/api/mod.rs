// Upstream quote API clients
pub mod dexscreener;
pub mod jupiter;

pub use dexscreener::{DexScreenerClient, PairQuote};
pub use jupiter::JupiterPriceClient;

use chrono::Utc;

use crate::models::{TickSource, TickUpdate};

/// A quote response classified into one of the known upstream shapes.
///
/// Responses are parsed against each known shape explicitly; anything that
/// matches neither lands in `Unrecognized` and is ignored by callers rather
/// than partially trusted.
#[derive(Debug)]
pub enum UpstreamQuote {
    /// Aggregator listing: `pairs[]` with priceUsd/marketCap/liquidity.
    Aggregator(PairQuote),
    /// Direct quote map: `{ "<asset>": { "usdPrice": ... } }`.
    DirectQuote { usd_price: f64 },
    /// Neither known shape.
    Unrecognized,
}

impl UpstreamQuote {
    /// Classify a raw response body for the given asset.
    pub fn parse(body: &str, asset_id: &str) -> UpstreamQuote {
        if let Ok(response) = serde_json::from_str::<dexscreener::AggregatorResponse>(body) {
            if let Some(pairs) = response.pairs {
                if !pairs.is_empty() {
                    if let Some(quote) = dexscreener::best_pair(pairs) {
                        return UpstreamQuote::Aggregator(quote);
                    }
                }
            }
        }

        if let Ok(response) = serde_json::from_str::<jupiter::DirectQuoteResponse>(body) {
            if let Some(price) = response
                .get(asset_id)
                .and_then(|entry| entry.usd_price)
                .filter(|p| p.is_finite() && *p > 0.0)
            {
                return UpstreamQuote::DirectQuote { usd_price: price };
            }
        }

        UpstreamQuote::Unrecognized
    }

    /// Shape the parsed quote into a market tick; `Unrecognized` yields
    /// nothing.
    pub fn into_tick(self, asset_id: &str) -> Option<TickUpdate> {
        match self {
            UpstreamQuote::Aggregator(quote) => Some(TickUpdate {
                asset_id: asset_id.to_string(),
                price: quote.price_usd,
                valuation: quote.market_cap,
                liquidity: quote.liquidity_usd,
                symbol: quote.symbol,
                ts: Utc::now(),
                source: TickSource::Aggregator,
            }),
            UpstreamQuote::DirectQuote { usd_price } => Some(TickUpdate {
                asset_id: asset_id.to_string(),
                price: Some(usd_price),
                valuation: None,
                liquidity: None,
                symbol: None,
                ts: Utc::now(),
                source: TickSource::DirectQuote,
            }),
            UpstreamQuote::Unrecognized => None,
        }
    }
}
