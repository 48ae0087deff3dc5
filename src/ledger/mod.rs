use std::collections::HashMap;

use crate::models::{AssetId, Position};

/// Store of per-asset positions under weighted-average-cost accounting.
///
/// Pure data component: the execution engine is the only caller of
/// [`PositionLedger::upsert`], and `upsert` is the only way to mutate a
/// position. Invariants are re-checked after every mutation.
#[derive(Debug, Default)]
pub struct PositionLedger {
    positions: HashMap<AssetId, Position>,
}

impl PositionLedger {
    pub fn new() -> Self {
        Self {
            positions: HashMap::new(),
        }
    }

    /// Restore from persisted positions (boot path).
    pub fn with_positions(positions: HashMap<AssetId, Position>) -> Self {
        let open = positions.values().filter(|p| !p.is_flat()).count();
        tracing::info!("Restored {} positions ({} open) from persistence", positions.len(), open);
        Self { positions }
    }

    pub fn get(&self, asset_id: &str) -> Option<&Position> {
        self.positions.get(asset_id)
    }

    /// Sole mutation entry point. Creates the position on first touch and
    /// validates the cost-basis invariants after the mutator ran.
    pub fn upsert<F>(&mut self, asset_id: &str, mutate: F)
    where
        F: FnOnce(&mut Position),
    {
        let position = self.positions.entry(asset_id.to_string()).or_default();
        mutate(position);

        if !position.invariants_hold() {
            tracing::error!(
                asset = %asset_id,
                quantity = position.quantity,
                cost_basis = position.cost_basis,
                "position invariant violated after mutation"
            );
            debug_assert!(
                position.invariants_hold(),
                "position invariant violated for {}",
                asset_id
            );
        }
    }

    /// Positions with quantity > 0.
    pub fn open_positions(&self) -> impl Iterator<Item = (&AssetId, &Position)> {
        self.positions.iter().filter(|(_, p)| !p.is_flat())
    }

    pub fn has_open_position(&self, asset_id: &str) -> bool {
        self.positions.get(asset_id).is_some_and(|p| !p.is_flat())
    }

    /// Snapshot of the whole map for persistence.
    pub fn all(&self) -> &HashMap<AssetId, Position> {
        &self.positions
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}
