//! Repository implementations for database operations

pub mod backtests;
pub mod candles;
pub mod sync_history;

pub use backtests::*;
pub use candles::*;
pub use sync_history::*;
