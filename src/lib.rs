// Core modules
pub mod api;
pub mod config;
pub mod context;
pub mod execution;
pub mod ledger;
pub mod market;
pub mod models;
pub mod oracle;
pub mod persistence;
pub mod pnl;
pub mod session;

// Re-export commonly used types
pub use context::AppContext;
pub use execution::{ExecutionEngine, TradeError};
pub use models::*;

// Error handling
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;
