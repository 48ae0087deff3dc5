pub mod source;

pub use source::{ActiveAssetSource, FileAssetSource, StaticAssetSource};

use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

use crate::api::DexScreenerClient;
use crate::models::{
    MarketSnapshot, ResolvedAsset, TickEvent, TickUpdate, TRUSTED_CONFIDENCE,
};

/// How often the externally-resolved active asset is re-checked.
pub const ASSET_POLL_MS: u64 = 250;

/// How often the valuation source is polled for the active asset.
const VALUATION_POLL_SECS: u64 = 2;

/// A price tick deviating more than this (relative) from the held price is
/// rejected unless its source is trusted.
const OUTLIER_MAX_REL_DEVIATION: f64 = 0.80;

/// Reference points are emitted at most once per this interval...
const REF_MIN_INTERVAL_MS: i64 = 150;

/// ...and only when the price moved at least this much since the last one.
const REF_MIN_REL_DELTA: f64 = 0.005;

/// A simultaneous (price, valuation) observation for downstream consumers.
#[derive(Debug, Clone)]
pub struct ReferencePoint {
    pub asset_id: String,
    pub price: f64,
    pub valuation: f64,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct SyncState {
    active: Option<ResolvedAsset>,
    snapshot: MarketSnapshot,
    last_ref: Option<(DateTime<Utc>, f64)>,
}

/// Maintains the best-known market view for the active asset by merging
/// ticks from heterogeneous sources under explicit precedence, staleness,
/// and outlier rules.
///
/// Cloneable; all clones share state.
#[derive(Clone)]
pub struct MarketSynchronizer {
    state: Arc<RwLock<SyncState>>,
    events: broadcast::Sender<TickEvent>,
    refs: broadcast::Sender<ReferencePoint>,
    poll_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
    aggregator: DexScreenerClient,
}

impl MarketSynchronizer {
    pub fn new(aggregator: DexScreenerClient) -> Self {
        let (events, _) = broadcast::channel(64);
        let (refs, _) = broadcast::channel(64);
        Self {
            state: Arc::new(RwLock::new(SyncState::default())),
            events,
            refs,
            poll_handle: Arc::new(Mutex::new(None)),
            aggregator,
        }
    }

    pub fn active_asset(&self) -> Option<ResolvedAsset> {
        self.state.read().expect("market state lock poisoned").active.clone()
    }

    pub fn snapshot(&self) -> MarketSnapshot {
        self.state
            .read()
            .expect("market state lock poisoned")
            .snapshot
            .clone()
    }

    /// Accepted-tick stream for the UI collaborator.
    pub fn subscribe(&self) -> broadcast::Receiver<TickEvent> {
        self.events.subscribe()
    }

    /// Throttled (price, valuation) pair stream.
    pub fn subscribe_reference_points(&self) -> broadcast::Receiver<ReferencePoint> {
        self.refs.subscribe()
    }

    /// Switch the active asset. On every change the snapshot resets and the
    /// per-asset valuation poll loop restarts scoped to the new id; the old
    /// loop is aborted first so it can never tick the wrong asset.
    pub fn set_active_asset(&self, resolved: Option<ResolvedAsset>) {
        {
            let state = self.state.read().expect("market state lock poisoned");
            if state.active == resolved {
                return;
            }
        }

        if let Some(handle) = self
            .poll_handle
            .lock()
            .expect("poll handle lock poisoned")
            .take()
        {
            handle.abort();
        }

        {
            let mut state = self.state.write().expect("market state lock poisoned");
            match &resolved {
                Some(asset) => tracing::info!(asset = %asset.asset_id, symbol = %asset.symbol, "active asset changed"),
                None => tracing::info!("active asset cleared"),
            }
            state.snapshot = MarketSnapshot {
                symbol: resolved.as_ref().map(|a| a.symbol.clone()),
                ..Default::default()
            };
            state.last_ref = None;
            state.active = resolved.clone();
        }

        if let Some(asset) = resolved {
            let handle = self.spawn_valuation_loop(asset.asset_id);
            *self.poll_handle.lock().expect("poll handle lock poisoned") = Some(handle);
        }
    }

    fn spawn_valuation_loop(&self, asset_id: String) -> JoinHandle<()> {
        let sync = self.clone();
        let client = self.aggregator.clone();
        tokio::spawn(async move {
            loop {
                match client.get_tick(&asset_id).await {
                    Ok(tick) => {
                        // The active asset may have changed while the fetch
                        // was in flight; a stale result is dropped, not
                        // applied.
                        let still_active = sync
                            .active_asset()
                            .is_some_and(|a| a.asset_id == asset_id);
                        if !still_active {
                            tracing::debug!(asset = %asset_id, "dropping tick for inactive asset");
                            return;
                        }
                        sync.apply_tick(tick);
                    }
                    Err(e) => {
                        tracing::warn!(asset = %asset_id, error = %e, "valuation poll failed");
                    }
                }
                sleep(Duration::from_secs(VALUATION_POLL_SECS)).await;
            }
        })
    }

    /// Reconcile one tick into the snapshot. Returns whether it was
    /// accepted. This is the single merge point for every source channel.
    pub fn apply_tick(&self, tick: TickUpdate) -> bool {
        let now = Utc::now();
        let mut state = self.state.write().expect("market state lock poisoned");

        let Some(active) = state.active.clone() else {
            tracing::debug!(asset = %tick.asset_id, "tick with no active asset dropped");
            return false;
        };
        if active.asset_id != tick.asset_id {
            tracing::debug!(asset = %tick.asset_id, "tick for non-active asset dropped");
            return false;
        }

        // Not older than the held mark, or strictly more confident.
        if let Some(held_ts) = state.snapshot.last_tick_ts {
            if tick.ts < held_ts && tick.confidence() <= state.snapshot.confidence {
                tracing::debug!(asset = %tick.asset_id, source = ?tick.source, "stale tick dropped");
                return false;
            }
        }

        // Outlier guard: an implausible jump from an untrusted source must
        // not collapse PnL; the price component is dropped, the rest of the
        // tick still merges.
        let mut price = tick.price;
        if let (Some(new_price), Some(held_price)) = (tick.price, state.snapshot.price) {
            if held_price > 0.0 {
                let deviation = ((new_price - held_price) / held_price).abs();
                if deviation > OUTLIER_MAX_REL_DEVIATION && tick.confidence() < TRUSTED_CONFIDENCE {
                    tracing::warn!(
                        asset = %tick.asset_id,
                        held = held_price,
                        offered = new_price,
                        source = ?tick.source,
                        "outlier price rejected"
                    );
                    price = None;
                }
            }
        }

        if price.is_none() && tick.valuation.is_none() && tick.liquidity.is_none() {
            return false;
        }

        // Price and valuation merge independently: a valuation-only tick
        // never blanks a known price, and vice versa.
        state.snapshot.price = price.or(state.snapshot.price);
        state.snapshot.valuation = tick.valuation.or(state.snapshot.valuation);
        state.snapshot.liquidity = tick.liquidity.or(state.snapshot.liquidity);
        if tick.symbol.is_some() {
            state.snapshot.symbol = tick.symbol.clone();
        }
        state.snapshot.last_tick_ts = Some(match state.snapshot.last_tick_ts {
            Some(held_ts) => held_ts.max(tick.ts),
            None => tick.ts,
        });
        state.snapshot.last_source = Some(tick.source);
        state.snapshot.confidence = tick.confidence();

        let event = TickEvent {
            asset_id: tick.asset_id.clone(),
            symbol: state.snapshot.symbol.clone(),
            price: state.snapshot.price,
            valuation: state.snapshot.valuation,
        };

        let fresh = !state.snapshot.is_stale(now);
        let reference = match (state.snapshot.price, state.snapshot.valuation) {
            (Some(price), Some(valuation)) if fresh => {
                let due = match state.last_ref {
                    None => true,
                    Some((last_ts, last_price)) => {
                        let elapsed_ms = (now - last_ts).num_milliseconds();
                        let moved = last_price > 0.0
                            && ((price - last_price) / last_price).abs() >= REF_MIN_REL_DELTA;
                        elapsed_ms >= REF_MIN_INTERVAL_MS && moved
                    }
                };
                if due {
                    state.last_ref = Some((now, price));
                    Some(ReferencePoint {
                        asset_id: tick.asset_id.clone(),
                        price,
                        valuation,
                        ts: now,
                    })
                } else {
                    None
                }
            }
            _ => None,
        };

        drop(state);

        let _ = self.events.send(event);
        if let Some(reference) = reference {
            let _ = self.refs.send(reference);
        }
        true
    }
}

/// Poll the discovery collaborator and push active-asset changes into the
/// synchronizer.
pub fn spawn_asset_watch_loop(
    sync: MarketSynchronizer,
    source: Arc<dyn ActiveAssetSource>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match source.resolve().await {
                Ok(resolved) => sync.set_active_asset(resolved),
                Err(e) => tracing::warn!(error = %e, "active asset resolution failed"),
            }
            sleep(Duration::from_millis(ASSET_POLL_MS)).await;
        }
    })
}
