// Order execution module: the ledger's single write path
pub mod engine;

pub use engine::{ExecutionEngine, TradeError, QTY_EPSILON};
