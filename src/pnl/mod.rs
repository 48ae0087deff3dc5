use crate::ledger::PositionLedger;
use crate::models::{MarketSnapshot, Position};

/// Plausibility band for the valuation ratio. A ratio outside this band is
/// treated as a corrupted anchor and the mark-price method is used instead.
pub const RATIO_MIN: f64 = 1e-5;
pub const RATIO_MAX: f64 = 1e5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PnlMethod {
    /// Scales total quote spent by current/entry aggregate valuation.
    /// Less sensitive to per-unit precision loss on low-denomination assets.
    ValuationRatio,
    /// `quantity * mark_price - cost_basis`.
    MarkPrice,
}

#[derive(Debug, Clone, Copy)]
pub struct PnlFigure {
    pub usd: f64,
    pub method: PnlMethod,
}

/// Unrealized PnL for one position, in USD.
///
/// Tries the valuation-ratio method first, falling back to mark price when
/// the anchor or current valuation is missing or the ratio is implausible.
/// The two methods are never mixed within a single call: whichever resolves
/// is used for the whole figure. Returns `None` when neither method has the
/// data it needs.
pub fn position_unrealized(position: &Position, snapshot: &MarketSnapshot) -> Option<PnlFigure> {
    if position.is_flat() {
        return None;
    }

    if let Some(figure) = ratio_method(position, snapshot) {
        return Some(figure);
    }
    mark_price_method(position, snapshot)
}

fn ratio_method(position: &Position, snapshot: &MarketSnapshot) -> Option<PnlFigure> {
    let anchor = position.reference_valuation_at_open?;
    let current = snapshot
        .valuation
        .or_else(|| position.last_mark.and_then(|m| m.valuation))?;

    if anchor <= 0.0 || current <= 0.0 {
        return None;
    }

    let ratio = current / anchor;
    if !ratio.is_finite() || !(RATIO_MIN..=RATIO_MAX).contains(&ratio) {
        tracing::debug!(ratio, "valuation ratio outside plausibility band, falling back to mark price");
        return None;
    }

    let spent = position.cost_basis;
    Some(PnlFigure {
        usd: spent * ratio - spent,
        method: PnlMethod::ValuationRatio,
    })
}

fn mark_price_method(position: &Position, snapshot: &MarketSnapshot) -> Option<PnlFigure> {
    let price = snapshot
        .usable_price()
        .or(position.last_mark.map(|m| m.price).filter(|p| *p > 0.0))?;

    Some(PnlFigure {
        usd: position.quantity * price - position.cost_basis,
        method: PnlMethod::MarkPrice,
    })
}

/// Sum of per-position unrealized PnL across all open positions, in USD.
///
/// Each position resolves its own method independently; positions with no
/// usable data contribute zero.
pub fn aggregate_unrealized<F>(ledger: &PositionLedger, snapshot_for: F) -> f64
where
    F: Fn(&str) -> MarketSnapshot,
{
    ledger
        .open_positions()
        .filter_map(|(asset_id, position)| {
            position_unrealized(position, &snapshot_for(asset_id)).map(|f| f.usd)
        })
        .sum()
}

/// USD figure converted into settlement (SOL) units at the oracle rate.
pub fn usd_to_sol(usd: f64, sol_rate: f64) -> f64 {
    if sol_rate > 0.0 {
        usd / sol_rate
    } else {
        0.0
    }
}
