//! Repository implementations for database operations

pub mod optimization;
pub mod paper_trades;

pub use optimization::*;
pub use paper_trades::*;
