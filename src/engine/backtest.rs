use rhai::Array;
use serde_json::Value;

use crate::data::prices::{parse_date, Bar, PriceTable};
use crate::exec::{ExecError, LoadedScript, SandboxExecutor};

use super::error::BacktestError;
use super::ledger::Ledger;
use super::orders::parse_orders;
use super::types::{BacktestResult, INITIAL_PORTFOLIO_USD};

/// Day-stepped strategy evaluation over a single price table.
///
/// The table is read-only and can back any number of runs; all mutable
/// state (the ledger, the script scope) is created per run inside
/// [`test_strategy`](Backtester::test_strategy), so two identical runs
/// produce identical results and nothing leaks between them.
pub struct Backtester {
    prices: PriceTable,
    executor: SandboxExecutor,
}

impl Backtester {
    pub fn new(prices: PriceTable) -> Self {
        Self {
            prices,
            executor: SandboxExecutor::new(),
        }
    }

    pub fn with_executor(prices: PriceTable, executor: SandboxExecutor) -> Self {
        Self { prices, executor }
    }

    pub fn prices(&self) -> &PriceTable {
        &self.prices
    }

    /// Run `source` over every trading day in `[start ..= end]`.
    ///
    /// For each trading day D the strategy sees prices up to D-1 inclusive
    /// and the book valued at the last close it can know; its orders
    /// execute at D's open, then stop-loss / take-profit thresholds are
    /// enforced against D's low and high. The final book is valued at the
    /// last day's close.
    ///
    /// The first execution day must have at least one prior candle, so the
    /// strategy never starts from an empty view.
    pub fn test_strategy(
        &self,
        start: &str,
        end: &str,
        source: &str,
    ) -> Result<BacktestResult, BacktestError> {
        let start_date = parse_date(start)
            .map_err(|e| BacktestError::DateRange(format!("Invalid start date: {e}")))?;
        let end_date = parse_date(end)
            .map_err(|e| BacktestError::DateRange(format!("Invalid end date: {e}")))?;

        let dates = self
            .prices
            .trading_dates(start_date, end_date)
            .map_err(|e| BacktestError::DateRange(e.to_string()))?;

        let first_day = *dates
            .first()
            .ok_or_else(|| BacktestError::DateRange("empty trading date range".to_string()))?;
        let warmup_ok = first_day
            .pred_opt()
            .is_some_and(|as_of| !self.prices.prefix_until(as_of).is_empty());
        if !warmup_ok {
            return Err(BacktestError::DateRange(
                "start_date requires at least 1 prior candle (warm-up). \
                 Choose a later start_date."
                    .to_string(),
            ));
        }

        let mut ledger = Ledger::new();
        let mut script = self.load_strategy(source)?;

        tracing::info!(
            start = %start_date,
            end = %end_date,
            days = dates.len(),
            "Running strategy backtest"
        );

        for day in dates.iter().copied() {
            let as_of = day.pred_opt().ok_or_else(|| {
                BacktestError::DateRange(format!("not enough history before {day} (warm-up)."))
            })?;
            let view = self.prices.prefix_until(as_of);
            let Some(last_known) = view.last() else {
                return Err(BacktestError::DateRange(format!(
                    "not enough history before {day} (warm-up)."
                )));
            };
            let last_known_close = last_known.close;

            // Simulation-only bar; the strategy never observes it.
            let bar = self.prices.bar_on(day).ok_or_else(|| {
                BacktestError::Unexpected(format!("no bar recorded for trading date {day}"))
            })?;

            let view_payload = bars_payload(view)?;
            let holdings_payload = to_array(&ledger.snapshot(last_known_close))?;

            let raw = match script.call("run", (view_payload, holdings_payload)) {
                Ok(raw) => raw,
                Err(err) => return Err(BacktestError::StrategyExecution(err.to_string())),
            };
            let raw: Value = rhai::serde::from_dynamic(&raw)
                .map_err(|e| BacktestError::Order(format!("invalid order payload(s): {e}")))?;

            let orders = parse_orders(&raw).map_err(BacktestError::Order)?;

            ledger
                .apply(&orders, bar.open)
                .map_err(|e| BacktestError::Order(e.to_string()))?;
            ledger
                .enforce_exit_thresholds(bar.low, bar.high)
                .map_err(|e| BacktestError::Order(e.to_string()))?;
        }

        let last_day = *dates
            .last()
            .ok_or_else(|| BacktestError::Unexpected("empty trading date range".to_string()))?;
        let last_bar = self.prices.bar_on(last_day).ok_or_else(|| {
            BacktestError::Unexpected(format!("no bar recorded for trading date {last_day}"))
        })?;

        let holdings = ledger.snapshot(last_bar.close);
        let total_portfolio_usd: f64 = holdings.iter().map(|s| s.total_value_usd).sum();
        let revenue_percent = (total_portfolio_usd / INITIAL_PORTFOLIO_USD - 1.0) * 100.0;

        Ok(BacktestResult {
            holdings,
            total_portfolio_usd,
            revenue_percent,
        })
    }

    /// Run an ad-hoc analysis script over the full table. The script must
    /// define `run_on_data(df)`; its return value is handed back as plain
    /// JSON.
    pub fn run_analysis(&self, source: &str) -> Result<Value, BacktestError> {
        let mut script = self
            .executor
            .compile(source)
            .map_err(|e| BacktestError::CodeValidation(e.to_string()))?;
        script
            .require_fn("run_on_data", 1, "run_on_data(df)")
            .map_err(|e| BacktestError::CodeValidation(e.to_string()))?;
        script
            .run_module_body()
            .map_err(|e| BacktestError::CodeValidation(e.to_string()))?;

        let rows = bars_payload(self.prices.all())?;
        let out = match script.call("run_on_data", (rows,)) {
            Ok(out) => out,
            Err(err) => return Err(BacktestError::StrategyExecution(err.to_string())),
        };
        rhai::serde::from_dynamic(&out).map_err(|e| {
            BacktestError::Unexpected(format!("analysis result is not serializable: {e}"))
        })
    }

    fn load_strategy(&self, source: &str) -> Result<LoadedScript, BacktestError> {
        let code_validation = |e: ExecError| BacktestError::CodeValidation(e.to_string());
        let mut script = self.executor.compile(source).map_err(code_validation)?;
        script
            .require_fn("run", 2, "run(df, holdings)")
            .map_err(code_validation)?;
        script.run_module_body().map_err(code_validation)?;
        Ok(script)
    }
}

fn bars_payload(bars: &[Bar]) -> Result<Array, BacktestError> {
    to_array(&bars)
}

/// Serialize a payload into a fresh Rhai array. The strategy always works
/// on this copy; mutating it cannot touch engine state.
fn to_array<T: serde::Serialize>(payload: &T) -> Result<Array, BacktestError> {
    let dynamic = rhai::serde::to_dynamic(payload)
        .map_err(|e| BacktestError::Unexpected(format!("failed to build strategy payload: {e}")))?;
    dynamic.try_cast::<Array>().ok_or_else(|| {
        BacktestError::Unexpected("strategy payload did not serialize to an array".to_string())
    })
}
