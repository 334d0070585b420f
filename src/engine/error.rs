/// The run-terminal error taxonomy, one variant per user-visible category.
///
/// Every failure aborts the run; the caller never observes a partially
/// committed ledger. The `Display` rendering is the contract with the
/// guardrail layer that feeds diagnostics back to strategy authors, so the
/// category prefixes are load-bearing.
#[derive(Debug, thiserror::Error)]
pub enum BacktestError {
    #[error("Date range validation error: {0}")]
    DateRange(String),
    #[error("Strategy code validation error: {0}")]
    CodeValidation(String),
    #[error("Strategy execution error (stack trace follows):\n{0}")]
    StrategyExecution(String),
    #[error("Order error: {0}")]
    Order(String),
    #[error("Unexpected backtest error (stack trace follows):\n{0}")]
    Unexpected(String),
}
