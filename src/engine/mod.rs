pub mod backtest;
pub mod error;
pub mod ledger;
pub mod orders;
pub mod types;

pub use backtest::Backtester;
pub use error::BacktestError;
pub use types::BacktestResult;
