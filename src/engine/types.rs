use serde::{Deserialize, Serialize};

/// Cash the ledger starts every run with.
pub const INITIAL_PORTFOLIO_USD: f64 = 10_000.0;

/// The id of the single cash holding. Fixed for the lifetime of a run.
pub const USD_HOLDING_ID: &str = "USD";

/// Absolute tolerance for all accounting comparisons. Floating-point drift
/// must never fail an exact-amount sell or flag a phantom overdraft.
pub const AMOUNT_EPSILON: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Asset {
    #[serde(rename = "USD")]
    Usd,
    #[serde(rename = "BTC")]
    Btc,
}

impl std::fmt::Display for Asset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Asset::Usd => write!(f, "USD"),
            Asset::Btc => write!(f, "BTC"),
        }
    }
}

/// A live row in the book. `stop_loss` / `take_profit` are BTC unit prices
/// in USD and only meaningful for BTC holdings.
#[derive(Debug, Clone, PartialEq)]
pub struct HoldingState {
    pub holding_id: String,
    pub asset: Asset,
    pub amount: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
}

impl HoldingState {
    /// Value this holding at the given BTC unit price. USD is always 1.0.
    pub fn snapshot_at(&self, btc_price: f64) -> HoldingSnapshot {
        let unit_value_usd = match self.asset {
            Asset::Usd => 1.0,
            Asset::Btc => btc_price,
        };
        HoldingSnapshot {
            holding_id: self.holding_id.clone(),
            asset: self.asset,
            amount: self.amount,
            unit_value_usd,
            total_value_usd: self.amount * unit_value_usd,
            stop_loss: self.stop_loss,
            take_profit: self.take_profit,
        }
    }
}

/// Read-only valuation of a holding at a given BTC price. This is both the
/// payload handed to strategies each day and the final result rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HoldingSnapshot {
    pub holding_id: String,
    pub asset: Asset,
    pub amount: f64,
    pub unit_value_usd: f64,
    pub total_value_usd: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestResult {
    pub holdings: Vec<HoldingSnapshot>,
    pub total_portfolio_usd: f64,
    pub revenue_percent: f64,
}
