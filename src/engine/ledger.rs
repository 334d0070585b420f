use anyhow::{bail, Result};

use super::orders::{BuyOrder, Order, SellOrder};
use super::types::{
    Asset, HoldingSnapshot, HoldingState, AMOUNT_EPSILON, INITIAL_PORTFOLIO_USD, USD_HOLDING_ID,
};

/// The live book of holdings for a single run.
///
/// Invariants: exactly one USD holding exists at all times under the fixed
/// id `"USD"`; BTC holdings keep strictly positive amounts (anything at or
/// below tolerance is removed); ids are minted `H1, H2, ...` and never
/// reused within a run.
///
/// A ledger is owned by its run. Constructing a fresh one *is* the reset:
/// nothing survives from a previous run.
#[derive(Debug, Clone)]
pub struct Ledger {
    holdings: Vec<HoldingState>,
    next_id: u64,
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

impl Ledger {
    pub fn new() -> Self {
        Self {
            holdings: vec![HoldingState {
                holding_id: USD_HOLDING_ID.to_string(),
                asset: Asset::Usd,
                amount: INITIAL_PORTFOLIO_USD,
                stop_loss: None,
                take_profit: None,
            }],
            next_id: 1,
        }
    }

    pub fn holdings(&self) -> &[HoldingState] {
        &self.holdings
    }

    pub fn find(&self, holding_id: &str) -> Option<&HoldingState> {
        self.holdings.iter().find(|h| h.holding_id == holding_id)
    }

    fn mint_holding_id(&mut self) -> String {
        let id = format!("H{}", self.next_id);
        self.next_id += 1;
        id
    }

    fn usd_index(&self) -> Result<usize> {
        match self.holdings.iter().position(|h| h.asset == Asset::Usd) {
            Some(i) => Ok(i),
            None => bail!("USD holding missing from portfolio state."),
        }
    }

    /// Apply the orders in list order at a single execution price. Stops at
    /// the first failure; the caller treats the whole run as failed, so no
    /// rollback is attempted.
    pub fn apply(&mut self, orders: &[Order], execution_price: f64) -> Result<()> {
        for order in orders {
            match order {
                Order::Buy(o) => self.apply_buy(o, execution_price)?,
                Order::Sell(o) => self.apply_sell(o, execution_price)?,
            }
        }
        Ok(())
    }

    pub fn apply_buy(&mut self, order: &BuyOrder, execution_price: f64) -> Result<()> {
        if order.amount <= 0.0 {
            bail!("BUY amount must be > 0.");
        }

        let usd_index = self.usd_index()?;
        let cost = order.amount * execution_price;
        let available = self.holdings[usd_index].amount;
        if cost > available + AMOUNT_EPSILON {
            bail!("Insufficient USD for BUY: required {cost:.8}, available {available:.8}.");
        }

        self.holdings[usd_index].amount -= cost;
        let holding_id = self.mint_holding_id();
        self.holdings.push(HoldingState {
            holding_id,
            asset: Asset::Btc,
            amount: order.amount,
            stop_loss: order.stop_loss,
            take_profit: order.take_profit,
        });
        Ok(())
    }

    pub fn apply_sell(&mut self, order: &SellOrder, execution_price: f64) -> Result<()> {
        if order.amount <= 0.0 {
            bail!("SELL amount must be > 0.");
        }
        if order.holding_id == USD_HOLDING_ID {
            bail!("Cannot SELL the USD holding via SELL order.");
        }

        let Some(target_index) = self
            .holdings
            .iter()
            .position(|h| h.holding_id == order.holding_id)
        else {
            bail!("SELL refers to non-existing holding_id={:?}.", order.holding_id);
        };

        let target = &self.holdings[target_index];
        if target.asset != Asset::Btc {
            bail!("SELL holding must be BTC; got {:?}.", target.asset.to_string());
        }
        if order.amount > target.amount + AMOUNT_EPSILON {
            bail!(
                "Cannot SELL more than holding contains: requested {:.8}, available {:.8}.",
                order.amount,
                target.amount
            );
        }

        let proceeds = order.amount * execution_price;
        self.holdings[target_index].amount -= order.amount;

        let usd_index = self.usd_index()?;
        self.holdings[usd_index].amount += proceeds;

        if self.holdings[target_index].amount <= AMOUNT_EPSILON {
            self.holdings.remove(target_index);
        }
        Ok(())
    }

    /// Intraday stop-loss / take-profit enforcement, run after the day's
    /// orders executed at the open.
    ///
    /// For each BTC holding: a stop-loss fires when `low <= stop_loss`,
    /// selling the full amount at the stop-loss price; otherwise a
    /// take-profit fires when `high >= take_profit`, selling the full
    /// amount at the take-profit price. When both could fire on the same
    /// day the stop-loss wins, and a holding closed by its stop-loss never
    /// reaches the take-profit check.
    pub fn enforce_exit_thresholds(&mut self, low: f64, high: f64) -> Result<()> {
        let open_positions: Vec<(String, f64, Option<f64>, Option<f64>)> = self
            .holdings
            .iter()
            .filter(|h| h.asset == Asset::Btc && h.amount > AMOUNT_EPSILON)
            .map(|h| (h.holding_id.clone(), h.amount, h.stop_loss, h.take_profit))
            .collect();

        for (holding_id, amount, stop_loss, take_profit) in open_positions {
            if self.find(&holding_id).is_none() {
                continue;
            }

            if let Some(stop_loss) = stop_loss {
                if low <= stop_loss {
                    self.apply_sell(
                        &SellOrder {
                            holding_id: holding_id.clone(),
                            amount,
                        },
                        stop_loss,
                    )?;
                    continue;
                }
            }

            if let Some(take_profit) = take_profit {
                if high >= take_profit {
                    self.apply_sell(
                        &SellOrder {
                            holding_id: holding_id.clone(),
                            amount,
                        },
                        take_profit,
                    )?;
                }
            }
        }
        Ok(())
    }

    /// Value every holding at the given BTC unit price.
    pub fn snapshot(&self, btc_price: f64) -> Vec<HoldingSnapshot> {
        self.holdings.iter().map(|h| h.snapshot_at(btc_price)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buy(amount: f64) -> BuyOrder {
        BuyOrder {
            amount,
            stop_loss: None,
            take_profit: None,
        }
    }

    fn buy_with(amount: f64, stop_loss: Option<f64>, take_profit: Option<f64>) -> BuyOrder {
        BuyOrder {
            amount,
            stop_loss,
            take_profit,
        }
    }

    fn sell(holding_id: &str, amount: f64) -> SellOrder {
        SellOrder {
            holding_id: holding_id.to_string(),
            amount,
        }
    }

    fn usd_amount(ledger: &Ledger) -> f64 {
        ledger.find(USD_HOLDING_ID).unwrap().amount
    }

    #[test]
    fn new_ledger_has_only_initial_cash() {
        let ledger = Ledger::new();
        assert_eq!(ledger.holdings().len(), 1);
        let usd = &ledger.holdings()[0];
        assert_eq!(usd.holding_id, USD_HOLDING_ID);
        assert_eq!(usd.asset, Asset::Usd);
        assert!((usd.amount - INITIAL_PORTFOLIO_USD).abs() < 1e-10);
    }

    #[test]
    fn buy_debits_cash_and_mints_sequential_ids() {
        let mut ledger = Ledger::new();
        ledger.apply_buy(&buy(1.0), 100.0).unwrap();
        ledger.apply_buy(&buy(2.0), 100.0).unwrap();

        assert!((usd_amount(&ledger) - 9700.0).abs() < 1e-10);
        let ids: Vec<&str> = ledger
            .holdings()
            .iter()
            .filter(|h| h.asset == Asset::Btc)
            .map(|h| h.holding_id.as_str())
            .collect();
        assert_eq!(ids, vec!["H1", "H2"]);
    }

    #[test]
    fn buy_attaches_thresholds() {
        let mut ledger = Ledger::new();
        ledger
            .apply_buy(&buy_with(1.0, Some(90.0), Some(120.0)), 100.0)
            .unwrap();
        let h = ledger.find("H1").unwrap();
        assert_eq!(h.stop_loss, Some(90.0));
        assert_eq!(h.take_profit, Some(120.0));
    }

    #[test]
    fn overspend_is_rejected() {
        let mut ledger = Ledger::new();
        let err = ledger.apply_buy(&buy(10_000.0), 100.0).unwrap_err().to_string();
        assert!(err.contains("Insufficient USD for BUY"), "got: {err}");
        // Nothing was booked.
        assert_eq!(ledger.holdings().len(), 1);
        assert!((usd_amount(&ledger) - INITIAL_PORTFOLIO_USD).abs() < 1e-10);
    }

    #[test]
    fn exact_affordable_buy_succeeds() {
        let mut ledger = Ledger::new();
        ledger.apply_buy(&buy(100.0), 100.0).unwrap();
        assert!(usd_amount(&ledger).abs() < 1e-10);
    }

    #[test]
    fn round_trip_at_same_price_preserves_cash() {
        let mut ledger = Ledger::new();
        ledger.apply_buy(&buy(1.2345), 101.5).unwrap();
        ledger.apply_sell(&sell("H1", 1.2345), 101.5).unwrap();
        assert!((usd_amount(&ledger) - INITIAL_PORTFOLIO_USD).abs() < 1e-9);
        assert!(ledger.find("H1").is_none());
    }

    #[test]
    fn partial_sell_keeps_the_holding() {
        let mut ledger = Ledger::new();
        ledger.apply_buy(&buy(2.0), 100.0).unwrap();
        ledger.apply_sell(&sell("H1", 0.5), 110.0).unwrap();
        let h = ledger.find("H1").unwrap();
        assert!((h.amount - 1.5).abs() < 1e-12);
        // 10000 - 200 + 55
        assert!((usd_amount(&ledger) - 9855.0).abs() < 1e-10);
    }

    #[test]
    fn full_sell_removes_the_holding() {
        let mut ledger = Ledger::new();
        ledger.apply_buy(&buy(1.0), 100.0).unwrap();
        ledger.apply_sell(&sell("H1", 1.0), 100.0).unwrap();
        assert_eq!(ledger.holdings().len(), 1);
    }

    #[test]
    fn dust_after_sell_is_swept() {
        let mut ledger = Ledger::new();
        ledger.apply_buy(&buy(1.0), 100.0).unwrap();
        // Leaves 1e-13 BTC, below tolerance.
        ledger.apply_sell(&sell("H1", 1.0 - 1e-13), 100.0).unwrap();
        assert!(ledger.find("H1").is_none());
    }

    #[test]
    fn oversell_is_rejected() {
        let mut ledger = Ledger::new();
        ledger.apply_buy(&buy(1.0), 100.0).unwrap();
        let err = ledger.apply_sell(&sell("H1", 1.1), 100.0).unwrap_err().to_string();
        assert!(err.contains("Cannot SELL more than holding contains"), "got: {err}");
    }

    #[test]
    fn selling_usd_is_rejected() {
        let mut ledger = Ledger::new();
        let err = ledger
            .apply_sell(&sell(USD_HOLDING_ID, 100.0), 1.0)
            .unwrap_err()
            .to_string();
        assert!(err.contains("Cannot SELL the USD holding"), "got: {err}");
    }

    #[test]
    fn selling_unknown_id_is_rejected() {
        let mut ledger = Ledger::new();
        let err = ledger.apply_sell(&sell("H999", 1.0), 100.0).unwrap_err().to_string();
        assert!(err.contains("non-existing holding_id"), "got: {err}");
        assert!(err.contains("H999"), "got: {err}");
    }

    #[test]
    fn ids_are_not_reused_after_a_close() {
        let mut ledger = Ledger::new();
        ledger.apply_buy(&buy(1.0), 100.0).unwrap();
        ledger.apply_sell(&sell("H1", 1.0), 100.0).unwrap();
        ledger.apply_buy(&buy(1.0), 100.0).unwrap();
        assert!(ledger.find("H1").is_none());
        assert!(ledger.find("H2").is_some());
    }

    #[test]
    fn stop_loss_fires_on_low() {
        let mut ledger = Ledger::new();
        ledger.apply_buy(&buy_with(1.0, Some(98.0), None), 100.0).unwrap();
        ledger.enforce_exit_thresholds(95.0, 101.0).unwrap();
        assert!(ledger.find("H1").is_none());
        // 10000 - 100 + 98
        assert!((usd_amount(&ledger) - 9998.0).abs() < 1e-10);
    }

    #[test]
    fn take_profit_fires_on_high() {
        let mut ledger = Ledger::new();
        ledger.apply_buy(&buy_with(1.0, None, Some(120.0)), 100.0).unwrap();
        ledger.enforce_exit_thresholds(99.0, 125.0).unwrap();
        assert!(ledger.find("H1").is_none());
        // 10000 - 100 + 120
        assert!((usd_amount(&ledger) - 10_020.0).abs() < 1e-10);
    }

    #[test]
    fn stop_loss_wins_when_both_could_fire() {
        let mut ledger = Ledger::new();
        ledger
            .apply_buy(&buy_with(1.0, Some(98.0), Some(102.0)), 100.0)
            .unwrap();
        ledger.enforce_exit_thresholds(97.0, 103.0).unwrap();
        // Sold at 98 (stop-loss), not 102.
        assert!((usd_amount(&ledger) - 9998.0).abs() < 1e-10);
    }

    #[test]
    fn thresholds_do_not_fire_inside_the_band() {
        let mut ledger = Ledger::new();
        ledger
            .apply_buy(&buy_with(1.0, Some(90.0), Some(120.0)), 100.0)
            .unwrap();
        ledger.enforce_exit_thresholds(95.0, 110.0).unwrap();
        assert!(ledger.find("H1").is_some());
    }

    #[test]
    fn enforcement_checks_every_open_holding() {
        let mut ledger = Ledger::new();
        ledger.apply_buy(&buy_with(1.0, Some(98.0), None), 100.0).unwrap();
        ledger.apply_buy(&buy_with(1.0, None, Some(104.0)), 100.0).unwrap();
        ledger.apply_buy(&buy_with(1.0, Some(50.0), None), 100.0).unwrap();
        ledger.enforce_exit_thresholds(97.0, 105.0).unwrap();

        assert!(ledger.find("H1").is_none());
        assert!(ledger.find("H2").is_none());
        assert!(ledger.find("H3").is_some());
        // 10000 - 300 + 98 + 104
        assert!((usd_amount(&ledger) - 9902.0).abs() < 1e-10);
    }

    #[test]
    fn snapshot_values_all_holdings() {
        let mut ledger = Ledger::new();
        ledger.apply_buy(&buy(2.0), 100.0).unwrap();
        let snaps = ledger.snapshot(150.0);
        assert_eq!(snaps.len(), 2);
        let total: f64 = snaps.iter().map(|s| s.total_value_usd).sum();
        // 9800 cash + 2 * 150
        assert!((total - 10_100.0).abs() < 1e-10);
    }
}
