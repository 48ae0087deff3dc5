use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use crate::context::AppContext;
use crate::models::{Fill, FillSide, Mark};

/// Remaining quantity below this after a sell snaps the position to flat,
/// so floating-point residue never masquerades as an open position.
pub const QTY_EPSILON: f64 = 1e-9;

#[derive(Debug, Error)]
pub enum TradeError {
    #[error("amount must be a positive number, got {0}")]
    InvalidAmount(f64),
    #[error("no active asset resolved")]
    NoActiveAsset,
    #[error("no usable market price for {0}")]
    PriceUnavailable(String),
    #[error("no open position for {0}")]
    NoPosition(String),
    #[error("sell resolves to zero quantity")]
    ZeroQuantityExit,
}

/// The only component permitted to mutate the ledger. Buys and sells are
/// atomic transitions: every precondition is checked before the first
/// mutation, and a failed call leaves no partial effect. Neither operation
/// retries on its own; resubmission is the caller's decision.
#[derive(Clone)]
pub struct ExecutionEngine {
    ctx: AppContext,
}

impl ExecutionEngine {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx }
    }

    /// Buy into the active asset with `sol_amount` of settlement currency.
    ///
    /// The amount converts to USD notional at the oracle rate; the position
    /// merges under weighted-average cost. The first buy from flat anchors
    /// `reference_valuation_at_open` from the current snapshot.
    pub fn buy(&self, sol_amount: f64) -> Result<Fill, TradeError> {
        if !sol_amount.is_finite() || sol_amount <= 0.0 {
            return Err(TradeError::InvalidAmount(sol_amount));
        }

        let active = self
            .ctx
            .market
            .active_asset()
            .ok_or(TradeError::NoActiveAsset)?;
        let snapshot = self.ctx.market.snapshot();
        let price = snapshot
            .usable_price()
            .ok_or_else(|| TradeError::PriceUnavailable(active.asset_id.clone()))?;

        let rate = self.ctx.oracle.rate();
        let notional = sol_amount * rate;
        let quantity_delta = notional / price;
        let now = Utc::now();

        let mut ledger = self.ctx.ledger.lock().expect("ledger lock poisoned");
        ledger.upsert(&active.asset_id, |position| {
            if position.is_flat() {
                position.reference_valuation_at_open = snapshot.valuation;
                position.opened_at = Some(now);
            }
            position.cost_basis += notional;
            position.quantity += quantity_delta;
            position.fill_count += 1;
            position.last_mark = Some(Mark {
                price,
                valuation: snapshot.valuation,
                ts: now,
            });
        });
        drop(ledger);

        let fill = Fill {
            id: Uuid::new_v4(),
            ts: now,
            side: FillSide::Buy,
            asset_id: active.asset_id.clone(),
            quantity_delta,
            fill_price: price,
            valuation_at_fill: snapshot.valuation,
            quote_notional: notional,
            realized_pnl_delta: None,
            price_confidence: snapshot.confidence,
        };

        self.record_fill(&fill);
        self.ctx
            .session
            .lock()
            .expect("session lock poisoned")
            .apply_buy(&fill, sol_amount);
        self.ctx.persist.immediate();

        tracing::info!(
            asset = %active.asset_id,
            sol = sol_amount,
            quantity = quantity_delta,
            price,
            "buy filled"
        );
        Ok(fill)
    }

    /// Sell `percent` of the active asset's position (default 100).
    pub fn sell(&self, percent: Option<f64>) -> Result<Fill, TradeError> {
        let active = self
            .ctx
            .market
            .active_asset()
            .ok_or(TradeError::NoActiveAsset)?;

        let percent = percent.unwrap_or(100.0);
        if !percent.is_finite() {
            return Err(TradeError::InvalidAmount(percent));
        }
        let percent = percent.clamp(0.0, 100.0);

        let (quantity, avg_cost) = {
            let ledger = self.ctx.ledger.lock().expect("ledger lock poisoned");
            let position = ledger
                .get(&active.asset_id)
                .filter(|p| !p.is_flat())
                .ok_or_else(|| TradeError::NoPosition(active.asset_id.clone()))?;
            (position.quantity, position.avg_cost())
        };

        // Never exceed held quantity, even under floating rounding.
        let quantity_delta = (quantity * percent / 100.0).min(quantity);
        if quantity_delta <= 0.0 {
            return Err(TradeError::ZeroQuantityExit);
        }

        let snapshot = self.ctx.market.snapshot();
        let price = snapshot
            .usable_price()
            .ok_or_else(|| TradeError::PriceUnavailable(active.asset_id.clone()))?;

        let proceeds = quantity_delta * price;
        let cost_removed = quantity_delta * avg_cost;
        let realized_pnl_delta = proceeds - cost_removed;
        let now = Utc::now();

        let mut ledger = self.ctx.ledger.lock().expect("ledger lock poisoned");
        ledger.upsert(&active.asset_id, |position| {
            position.quantity -= quantity_delta;
            position.cost_basis = (position.cost_basis - cost_removed).max(0.0);
            position.realized_pnl += realized_pnl_delta;
            position.fill_count += 1;
            position.last_mark = Some(Mark {
                price,
                valuation: snapshot.valuation,
                ts: now,
            });
            if position.quantity < QTY_EPSILON {
                position.reset_to_flat();
            }
        });
        drop(ledger);

        let fill = Fill {
            id: Uuid::new_v4(),
            ts: now,
            side: FillSide::Sell,
            asset_id: active.asset_id.clone(),
            quantity_delta: -quantity_delta,
            fill_price: price,
            valuation_at_fill: snapshot.valuation,
            quote_notional: proceeds,
            realized_pnl_delta: Some(realized_pnl_delta),
            price_confidence: snapshot.confidence,
        };

        let rate = self.ctx.oracle.rate();
        self.record_fill(&fill);
        self.ctx
            .session
            .lock()
            .expect("session lock poisoned")
            .apply_sell(&fill, proceeds / rate, realized_pnl_delta / rate, cost_removed);
        self.ctx.persist.immediate();

        tracing::info!(
            asset = %active.asset_id,
            percent,
            quantity = quantity_delta,
            price,
            realized = realized_pnl_delta,
            "sell filled"
        );
        Ok(fill)
    }

    /// Record an accepted market tick as the open position's latest mark.
    ///
    /// Ticks arrive after awaits, so the position is re-validated here: a
    /// mark for an asset with no open position is dropped, not applied.
    pub fn apply_mark(&self, asset_id: &str, price: Option<f64>, valuation: Option<f64>) {
        let Some(price) = price.filter(|p| p.is_finite() && *p > 0.0) else {
            return;
        };

        let mut ledger = self.ctx.ledger.lock().expect("ledger lock poisoned");
        if !ledger.has_open_position(asset_id) {
            return;
        }
        ledger.upsert(asset_id, |position| {
            position.last_mark = Some(Mark {
                price,
                valuation,
                ts: Utc::now(),
            });
        });
        drop(ledger);

        self.ctx.persist.debounced();
    }

    fn record_fill(&self, fill: &Fill) {
        self.ctx
            .trades
            .lock()
            .expect("trades lock poisoned")
            .insert(fill.id, fill.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::DexScreenerClient;
    use crate::market::MarketSynchronizer;
    use crate::models::{ResolvedAsset, TickSource, TickUpdate};
    use crate::oracle::{PriceOracle, QuoteSource};
    use crate::persistence::PersistHandle;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct FixedRate(f64);

    #[async_trait]
    impl QuoteSource for FixedRate {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn fetch_sol_usd(&self) -> crate::Result<f64> {
            Ok(self.0)
        }
    }

    async fn engine_with_market(rate: f64) -> (ExecutionEngine, AppContext) {
        let market =
            MarketSynchronizer::new(DexScreenerClient::with_base_url("http://127.0.0.1:9"));
        market.set_active_asset(Some(ResolvedAsset {
            asset_id: "mint-x".to_string(),
            symbol: "X".to_string(),
        }));

        let oracle = Arc::new(PriceOracle::new(vec![Arc::new(FixedRate(rate))]));
        oracle.refresh().await;

        let ctx = AppContext::new(market, oracle, PersistHandle::disconnected(), 10.0);
        (ExecutionEngine::new(ctx.clone()), ctx)
    }

    fn push_price(ctx: &AppContext, price: f64, valuation: Option<f64>) {
        assert!(ctx.market.apply_tick(TickUpdate {
            asset_id: "mint-x".to_string(),
            price: Some(price),
            valuation,
            liquidity: None,
            symbol: None,
            ts: Utc::now(),
            source: TickSource::DirectQuote,
        }));
    }

    #[tokio::test]
    async fn test_buy_scenario() {
        // 1 SOL at $10 token price, $200/SOL: 20 units, $200 basis.
        let (engine, ctx) = engine_with_market(200.0).await;
        push_price(&ctx, 10.0, Some(1_000_000.0));

        let fill = engine.buy(1.0).unwrap();
        assert!((fill.quantity_delta - 20.0).abs() < 1e-9);
        assert!((fill.quote_notional - 200.0).abs() < 1e-9);

        let ledger = ctx.ledger.lock().unwrap();
        let pos = ledger.get("mint-x").unwrap();
        assert!((pos.quantity - 20.0).abs() < 1e-9);
        assert!((pos.cost_basis - 200.0).abs() < 1e-9);
        assert!((pos.avg_cost() - 10.0).abs() < 1e-9);
        assert_eq!(pos.reference_valuation_at_open, Some(1_000_000.0));
        drop(ledger);

        assert!((ctx.session_stats().balance - 9.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_wac_across_buys() {
        let (engine, ctx) = engine_with_market(100.0).await;

        push_price(&ctx, 10.0, None);
        engine.buy(1.0).unwrap(); // 10 units @ $10
        push_price(&ctx, 20.0, None);
        engine.buy(1.0).unwrap(); // 5 units @ $20

        let ledger = ctx.ledger.lock().unwrap();
        let pos = ledger.get("mint-x").unwrap();
        // (10*10 + 5*20) / 15
        assert!((pos.avg_cost() - 200.0 / 15.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_partial_sell_scenario() {
        let (engine, ctx) = engine_with_market(200.0).await;
        push_price(&ctx, 10.0, None);
        engine.buy(1.0).unwrap();

        push_price(&ctx, 15.0, None);
        let fill = engine.sell(Some(50.0)).unwrap();

        // 10 units out, $150 proceeds, $100 cost removed, $50 realized.
        assert!((fill.quantity_delta + 10.0).abs() < 1e-9);
        assert!((fill.realized_pnl_delta.unwrap() - 50.0).abs() < 1e-9);

        let ledger = ctx.ledger.lock().unwrap();
        let pos = ledger.get("mint-x").unwrap();
        assert!((pos.quantity - 10.0).abs() < 1e-9);
        assert!((pos.cost_basis - 100.0).abs() < 1e-9);
        assert!((pos.avg_cost() - 10.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_full_close_resets_to_flat() {
        let (engine, ctx) = engine_with_market(200.0).await;
        push_price(&ctx, 10.0, Some(500_000.0));
        engine.buy(1.0).unwrap();
        push_price(&ctx, 15.0, None);
        engine.sell(Some(50.0)).unwrap();
        engine.sell(None).unwrap();

        let ledger = ctx.ledger.lock().unwrap();
        let pos = ledger.get("mint-x").unwrap();
        assert!(pos.is_flat());
        assert_eq!(pos.cost_basis, 0.0);
        assert_eq!(pos.avg_cost(), 0.0);
        assert!(pos.reference_valuation_at_open.is_none());
    }

    #[tokio::test]
    async fn test_round_trip_realizes_zero() {
        let (engine, ctx) = engine_with_market(150.0).await;
        push_price(&ctx, 4.0, None);
        engine.buy(2.0).unwrap();
        let fill = engine.sell(None).unwrap();

        assert!(fill.realized_pnl_delta.unwrap().abs() < 1e-9);
        let session = ctx.session_stats();
        assert!((session.balance - 10.0).abs() < 1e-9);
        assert!(session.realized_sol.abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_buy_rejections() {
        let (engine, ctx) = engine_with_market(200.0).await;

        assert!(matches!(engine.buy(0.0), Err(TradeError::InvalidAmount(_))));
        assert!(matches!(engine.buy(-1.0), Err(TradeError::InvalidAmount(_))));
        assert!(matches!(
            engine.buy(f64::NAN),
            Err(TradeError::InvalidAmount(_))
        ));
        // Active asset but no price observed yet.
        assert!(matches!(
            engine.buy(1.0),
            Err(TradeError::PriceUnavailable(_))
        ));

        ctx.market.set_active_asset(None);
        assert!(matches!(engine.buy(1.0), Err(TradeError::NoActiveAsset)));

        // Nothing mutated along the way.
        assert!(ctx.ledger.lock().unwrap().is_empty());
        assert_eq!(ctx.session_stats().balance, 10.0);
        assert!(ctx.trades.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sell_rejections() {
        let (engine, ctx) = engine_with_market(200.0).await;
        push_price(&ctx, 10.0, None);

        assert!(matches!(engine.sell(None), Err(TradeError::NoPosition(_))));

        engine.buy(1.0).unwrap();
        assert!(matches!(
            engine.sell(Some(0.0)),
            Err(TradeError::ZeroQuantityExit)
        ));
        // Out-of-range percent clamps rather than erroring.
        let fill = engine.sell(Some(250.0)).unwrap();
        assert!((fill.quantity_delta + 20.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_fills_are_engine_derived_only() {
        let (engine, ctx) = engine_with_market(200.0).await;
        push_price(&ctx, 10.0, None);
        engine.buy(1.0).unwrap();
        engine.sell(None).unwrap();

        // Every recorded trade id came out of a successful call; the ids
        // are engine-generated and the map rejects nothing else because
        // nothing else can reach it.
        let trades = ctx.trades.lock().unwrap();
        assert_eq!(trades.len(), 2);
        let session = ctx.session_stats();
        assert_eq!(session.fill_ids.len(), 2);
        for id in &session.fill_ids {
            assert!(trades.contains_key(id));
        }
    }

    #[tokio::test]
    async fn test_apply_mark_only_touches_open_positions() {
        let (engine, ctx) = engine_with_market(200.0).await;

        // No position yet: the mark is dropped, nothing is created.
        engine.apply_mark("mint-x", Some(5.0), None);
        assert!(ctx.ledger.lock().unwrap().get("mint-x").is_none());

        push_price(&ctx, 10.0, None);
        engine.buy(1.0).unwrap();
        engine.apply_mark("mint-x", Some(12.0), Some(2_000_000.0));

        let ledger = ctx.ledger.lock().unwrap();
        let mark = ledger.get("mint-x").unwrap().last_mark.unwrap();
        assert_eq!(mark.price, 12.0);
        assert_eq!(mark.valuation, Some(2_000_000.0));
    }

    #[tokio::test]
    async fn test_streak_scenario_via_engine() {
        let (engine, ctx) = engine_with_market(100.0).await;

        for _ in 0..2 {
            push_price(&ctx, 10.0, None);
            engine.buy(1.0).unwrap();
            push_price(&ctx, 8.0, None);
            engine.sell(None).unwrap();
        }
        let session = ctx.session_stats();
        assert_eq!(session.loss_streak, 2);
        assert_eq!(session.win_streak, 0);

        push_price(&ctx, 10.0, None);
        engine.buy(1.0).unwrap();
        push_price(&ctx, 12.0, None);
        engine.sell(None).unwrap();

        let session = ctx.session_stats();
        assert_eq!(session.loss_streak, 0);
        assert_eq!(session.win_streak, 1);
    }
}
