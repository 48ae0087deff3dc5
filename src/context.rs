use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::ledger::PositionLedger;
use crate::market::MarketSynchronizer;
use crate::models::{AssetId, Fill, MarketSnapshot, Position};
use crate::oracle::PriceOracle;
use crate::persistence::{PersistHandle, StateDocument};
use crate::pnl;
use crate::session::Session;

/// Explicit shared-state object owning the ledger, trade log, and session.
///
/// Every component takes the context (or a piece of it) as a parameter;
/// nothing reaches for module-level state. Cloning is cheap and shares.
#[derive(Clone)]
pub struct AppContext {
    pub ledger: Arc<Mutex<PositionLedger>>,
    pub trades: Arc<Mutex<HashMap<Uuid, Fill>>>,
    pub session: Arc<Mutex<Session>>,
    pub session_history: Arc<Mutex<Vec<Session>>>,
    pub market: MarketSynchronizer,
    pub oracle: Arc<PriceOracle>,
    pub persist: PersistHandle,
}

impl AppContext {
    pub fn new(
        market: MarketSynchronizer,
        oracle: Arc<PriceOracle>,
        persist: PersistHandle,
        starting_balance: f64,
    ) -> Self {
        Self {
            ledger: Arc::new(Mutex::new(PositionLedger::new())),
            trades: Arc::new(Mutex::new(HashMap::new())),
            session: Arc::new(Mutex::new(Session::new(starting_balance))),
            session_history: Arc::new(Mutex::new(Vec::new())),
            market,
            oracle,
            persist,
        }
    }

    /// Rebuild from a persisted (already migrated) document.
    pub fn from_document(
        doc: StateDocument,
        market: MarketSynchronizer,
        oracle: Arc<PriceOracle>,
        persist: PersistHandle,
    ) -> Self {
        Self {
            ledger: Arc::new(Mutex::new(PositionLedger::with_positions(doc.positions))),
            trades: Arc::new(Mutex::new(doc.trades)),
            session: Arc::new(Mutex::new(doc.session)),
            session_history: Arc::new(Mutex::new(doc.session_history)),
            market,
            oracle,
            persist,
        }
    }

    /// Capture the current state as one persistable document.
    pub fn snapshot_document(&self) -> StateDocument {
        StateDocument {
            schema_version: crate::persistence::SCHEMA_VERSION,
            positions: self.ledger.lock().expect("ledger lock poisoned").all().clone(),
            trades: self.trades.lock().expect("trades lock poisoned").clone(),
            session: self.session.lock().expect("session lock poisoned").clone(),
            session_history: self
                .session_history
                .lock()
                .expect("session history lock poisoned")
                .clone(),
        }
    }

    // ---- Read-only surface for the UI collaborator ----

    pub fn positions(&self) -> Vec<(AssetId, Position)> {
        self.ledger
            .lock()
            .expect("ledger lock poisoned")
            .all()
            .iter()
            .map(|(id, p)| (id.clone(), p.clone()))
            .collect()
    }

    pub fn session_stats(&self) -> Session {
        self.session.lock().expect("session lock poisoned").clone()
    }

    /// Snapshot used to value a given asset: the live market view for the
    /// active asset, an empty one otherwise (the position's own last mark
    /// then carries the fallback).
    pub fn snapshot_for(&self, asset_id: &str) -> MarketSnapshot {
        match self.market.active_asset() {
            Some(active) if active.asset_id == asset_id => self.market.snapshot(),
            _ => MarketSnapshot::default(),
        }
    }

    /// Aggregate unrealized PnL across open positions, in USD.
    pub fn unrealized_usd(&self) -> f64 {
        let ledger = self.ledger.lock().expect("ledger lock poisoned");
        pnl::aggregate_unrealized(&ledger, |asset_id| self.snapshot_for(asset_id))
    }

    /// Balance plus the marked value of open positions, in SOL.
    pub fn equity_sol(&self) -> f64 {
        let balance = self.session.lock().expect("session lock poisoned").balance;
        let ledger = self.ledger.lock().expect("ledger lock poisoned");
        let invested: f64 = ledger.open_positions().map(|(_, p)| p.cost_basis).sum();
        let unrealized = pnl::aggregate_unrealized(&ledger, |asset_id| self.snapshot_for(asset_id));
        balance + pnl::usd_to_sol(invested + unrealized, self.oracle.rate())
    }

    /// Reset the session; one that saw trades is archived first.
    pub fn reset_session(&self, starting_balance: f64) {
        let archived = self
            .session
            .lock()
            .expect("session lock poisoned")
            .reset(starting_balance);
        if let Some(old) = archived {
            tracing::info!(fills = old.fill_ids.len(), "archiving traded session");
            self.session_history
                .lock()
                .expect("session history lock poisoned")
                .push(old);
        }
        self.persist.debounced();
    }
}
