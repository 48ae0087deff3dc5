use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identifier of a tradable asset (Solana mint address).
pub type AssetId = String;

/// Confidence rank at or above which a source may override the outlier guard.
pub const TRUSTED_CONFIDENCE: u8 = 80;

/// A snapshot older than this reports as stale.
pub const STALE_AFTER_SECS: i64 = 10;

/// Active asset as resolved by the external discovery collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedAsset {
    #[serde(rename = "assetId")]
    pub asset_id: AssetId,
    pub symbol: String,
}

/// Channel a market tick arrived through.
///
/// The rank ordering is what the synchronizer's acceptance rule compares:
/// a page-embedded API response outranks scraped text even when both carry
/// the same timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TickSource {
    /// Direct quote endpoint response embedded in the page.
    DirectQuote,
    /// Aggregator pair listing (liquidity-sorted).
    Aggregator,
    /// Series exported from an on-page chart.
    ChartSeries,
    /// Text scraped off the DOM.
    ScrapedText,
}

impl TickSource {
    pub fn confidence(&self) -> u8 {
        match self {
            TickSource::DirectQuote => 90,
            TickSource::Aggregator => 80,
            TickSource::ChartSeries => 60,
            TickSource::ScrapedText => 40,
        }
    }
}

/// One observed price and/or valuation update for an asset.
///
/// `price` and `valuation` are independent: many sources report only one,
/// and a missing field must never blank out the other on merge.
#[derive(Debug, Clone)]
pub struct TickUpdate {
    pub asset_id: AssetId,
    pub price: Option<f64>,
    pub valuation: Option<f64>,
    pub liquidity: Option<f64>,
    pub symbol: Option<String>,
    pub ts: DateTime<Utc>,
    pub source: TickSource,
}

impl TickUpdate {
    pub fn confidence(&self) -> u8 {
        self.source.confidence()
    }
}

/// Best-known market view for the active asset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub price: Option<f64>,
    pub valuation: Option<f64>,
    pub liquidity: Option<f64>,
    pub symbol: Option<String>,
    pub last_tick_ts: Option<DateTime<Utc>>,
    pub last_source: Option<TickSource>,
    pub confidence: u8,
}

impl MarketSnapshot {
    /// Staleness is derived on every read, never cached on write.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        match self.last_tick_ts {
            Some(ts) => now - ts > Duration::seconds(STALE_AFTER_SECS),
            None => true,
        }
    }

    /// Price usable for pricing a fill: present, finite, positive.
    pub fn usable_price(&self) -> Option<f64> {
        self.price.filter(|p| p.is_finite() && *p > 0.0)
    }
}

/// Broadcast payload emitted to subscribers on every accepted tick.
#[derive(Debug, Clone)]
pub struct TickEvent {
    pub asset_id: AssetId,
    pub symbol: Option<String>,
    pub price: Option<f64>,
    pub valuation: Option<f64>,
}

/// Most recent trusted market mark applied to a position.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Mark {
    pub price: f64,
    pub valuation: Option<f64>,
    pub ts: DateTime<Utc>,
}

/// Open position under weighted-average-cost accounting.
///
/// `cost_basis` is the total quote-currency (USD) cost attributed to
/// `quantity`, not a per-unit figure. It only ever moves by
/// `+ qty * price` on a buy or `- qty * avg_cost` on a sell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub quantity: f64,
    pub cost_basis: f64,
    pub realized_pnl: f64,
    /// Market-wide valuation captured at the first buy of the current open
    /// cycle; anchor for the valuation-ratio PnL method. Never recomputed
    /// while the position stays open.
    pub reference_valuation_at_open: Option<f64>,
    pub last_mark: Option<Mark>,
    pub opened_at: Option<DateTime<Utc>>,
    pub fill_count: u32,
}

impl Default for Position {
    fn default() -> Self {
        Self {
            quantity: 0.0,
            cost_basis: 0.0,
            realized_pnl: 0.0,
            reference_valuation_at_open: None,
            last_mark: None,
            opened_at: None,
            fill_count: 0,
        }
    }
}

impl Position {
    pub fn avg_cost(&self) -> f64 {
        if self.quantity > 0.0 {
            self.cost_basis / self.quantity
        } else {
            0.0
        }
    }

    pub fn is_flat(&self) -> bool {
        self.quantity == 0.0
    }

    /// Full close resets cost state; a later buy re-anchors it.
    pub fn reset_to_flat(&mut self) {
        self.quantity = 0.0;
        self.cost_basis = 0.0;
        self.reference_valuation_at_open = None;
        self.opened_at = None;
    }

    /// Checks the flat-implies-zero-cost invariant chain.
    pub fn invariants_hold(&self) -> bool {
        if self.quantity < 0.0 || self.cost_basis < 0.0 {
            return false;
        }
        if self.quantity == 0.0 {
            self.cost_basis == 0.0 && self.reference_valuation_at_open.is_none()
        } else {
            true
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FillSide {
    Buy,
    Sell,
}

/// Immutable record of one simulated execution.
///
/// Fills are only ever derived from successful buy/sell calls; nothing in
/// the public API accepts an externally constructed fill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub id: Uuid,
    pub ts: DateTime<Utc>,
    pub side: FillSide,
    pub asset_id: AssetId,
    /// Signed: positive on buy, negative on sell.
    pub quantity_delta: f64,
    pub fill_price: f64,
    pub valuation_at_fill: Option<f64>,
    /// USD notional of the fill.
    pub quote_notional: f64,
    /// Realized USD PnL locked in by this fill; sells only.
    pub realized_pnl_delta: Option<f64>,
    pub price_confidence: u8,
}
