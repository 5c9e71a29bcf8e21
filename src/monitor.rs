//! Periodic inventory-imbalance check. Runs on its own `tokio::time::interval`, independent of
//! the engine's tick; its only job is to seed a fresh [`RebalanceJob`] when the BTC/smart-chain
//! split drifts past the configured threshold and no job is already in flight.

use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::adapters::{BitcoinBackend, InventoryOracle, LightningBackend, SwapContract};
use crate::amount::Amount;
use crate::error::EngineError;
use crate::state::{Phase, RebalanceJob};
use crate::token::Token;

pub struct BalanceMonitor<SC, BTC, LN, IO> {
    swap_contract: SC,
    bitcoin: BTC,
    lightning: LN,
    inventory: IO,
    job: Arc<Mutex<Option<RebalanceJob>>>,
    rebalance_threshold_ppm: u64,
    rebalance_amount_ppm: u64,
}

/// 10^6, the denominator `rebalanceThresholdPPM`/`rebalanceAmountPPM` are expressed over.
const PPM_SCALE: u64 = 1_000_000;

impl<SC, BTC, LN, IO> BalanceMonitor<SC, BTC, LN, IO>
where
    SC: SwapContract,
    BTC: BitcoinBackend,
    LN: LightningBackend,
    IO: InventoryOracle,
{
    pub fn new(
        swap_contract: SC,
        bitcoin: BTC,
        lightning: LN,
        inventory: IO,
        job: Arc<Mutex<Option<RebalanceJob>>>,
        rebalance_threshold_ppm: u64,
        rebalance_amount_ppm: u64,
    ) -> Self {
        BalanceMonitor {
            swap_contract,
            bitcoin,
            lightning,
            inventory,
            job,
            rebalance_threshold_ppm,
            rebalance_amount_ppm,
        }
    }

    fn job_in_flight(&self) -> bool {
        matches!(
            self.job.lock().expect("job mutex poisoned").as_ref(),
            Some(job) if job.phase != Phase::Idle
        )
    }

    /// Reads balances and seeds a fresh job if the imbalance exceeds the configured threshold.
    /// Returns the seeded job, if any, for the caller (the Supervisor) to hand to the engine.
    pub async fn tick(&self) -> Result<Option<RebalanceJob>, EngineError> {
        if self.job_in_flight() {
            return Ok(None);
        }

        let usable_balance_sc = self.swap_contract.get_balance(Token::Usdc, true).await?;
        let balance_btc_onchain = self.bitcoin.get_chain_balance().await?;

        // Read for operator visibility only; intentionally excluded from `sum`/`diff` below, per
        // §4.1 step 1 and §9 — Lightning liquidity isn't part of the BTC/smart-chain split this
        // monitor corrects.
        let channel_balance = self.lightning.get_channel_balance().await?;
        debug!(channel_balance, "lightning channel balance (excluded from rebalance comparison)");

        let open = self.inventory.open_swap_inventory().await?;
        let mut balance_sc = usable_balance_sc.clone();
        for (token, amount) in open.locked.iter().chain(open.returning.iter()) {
            if *token == Token::Usdc {
                balance_sc = balance_sc.checked_add(amount);
            }
        }

        let btc_value_of_sc = self.inventory.to_btc(&balance_sc, Token::Usdc).await?;
        let sum = btc_value_of_sc.checked_add(&balance_btc_onchain);

        if sum.is_zero() {
            debug!("balance monitor: zero total inventory, nothing to rebalance");
            return Ok(None);
        }

        let ppm_sc = ppm_share(&btc_value_of_sc, &sum);
        let ppm_btc = ppm_share(&balance_btc_onchain, &sum);
        let diff = ppm_sc as i64 - ppm_btc as i64;

        debug!(ppm_sc, ppm_btc, diff, "balance monitor tick");

        if diff.unsigned_abs() <= self.rebalance_threshold_ppm {
            return Ok(None);
        }

        let notional = scale_ppm(&sum, diff.unsigned_abs(), self.rebalance_amount_ppm);

        let job = if diff < 0 {
            info!(src = %Token::Btc, dst = %Token::Usdc, amount_out = %notional, "seeding rebalance job");
            RebalanceJob::new_triggered(Token::Btc, None, Token::Usdc, None, notional)
        } else {
            let usdc_amount = self
                .inventory
                .from_btc(&notional, Token::Usdc, crate::adapters::RoundingMode::Floor)
                .await?;
            if usdc_amount > usable_balance_sc {
                info!(
                    usdc_amount = %usdc_amount,
                    usable_balance_sc = %usable_balance_sc,
                    "skipping rebalance: insufficient usable smart-chain balance"
                );
                return Ok(None);
            }
            info!(src = %Token::Usdc, dst = %Token::Btc, amount_out = %usdc_amount, "seeding rebalance job");
            RebalanceJob::new_triggered(Token::Usdc, None, Token::Btc, None, usdc_amount)
        };

        Ok(Some(job))
    }
}

fn ppm_share(part: &Amount, total: &Amount) -> u64 {
    if total.is_zero() {
        return 0;
    }
    // `part * PPM_SCALE / total`, computed in decimal space since `Amount` has no native
    // multiply/divide; both operands are first expressed as whole-unit strings (decimals = 0) and
    // parsed into u128 — acceptable at this scale since PPM shares never approach the BTC supply.
    let part: u128 = part.to_decimal(0).parse().unwrap_or(0);
    let total: u128 = total.to_decimal(0).parse().unwrap_or(1).max(1);
    ((part.saturating_mul(PPM_SCALE as u128)) / total) as u64
}

/// `sum * diff_ppm * amount_ppm / 10^12`, per §4.1 step 5.
fn scale_ppm(amount: &Amount, diff_ppm: u64, amount_ppm: u64) -> Amount {
    let base: u128 = amount.to_decimal(0).parse().unwrap_or(0);
    let scaled = base
        .saturating_mul(diff_ppm as u128)
        .saturating_mul(amount_ppm as u128)
        / (PPM_SCALE as u128 * PPM_SCALE as u128);
    Amount::from_decimal(&scaled.to_string(), 0).unwrap_or_else(|_| Amount::zero())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::mocks::{
        MockBitcoinBackend, MockInventoryOracle, MockLightningBackend, MockSwapContract,
    };
    use std::sync::Mutex as StdMutex;

    fn build_monitor(
        threshold_ppm: u64,
        amount_ppm: u64,
    ) -> (
        BalanceMonitor<MockSwapContract, MockBitcoinBackend, MockLightningBackend, MockInventoryOracle>,
        MockSwapContract,
        MockBitcoinBackend,
    ) {
        let sc = MockSwapContract::new();
        let btc = MockBitcoinBackend::new();
        let ln = MockLightningBackend::new();
        let io = MockInventoryOracle::new();
        let job = Arc::new(StdMutex::new(None));
        let monitor = BalanceMonitor::new(sc.clone(), btc.clone(), ln, io, job, threshold_ppm, amount_ppm);
        (monitor, sc, btc)
    }

    // BTC-heavy inventory: the smart-chain side is starved, so the monitor should seed a
    // BTC -> USDC job.
    #[tokio::test]
    async fn btc_heavy_imbalance_seeds_btc_to_usdc_job() {
        let (monitor, sc, btc) = build_monitor(50_000, 500_000);
        // MockInventoryOracle pegs 1 USDC base unit -> 1/100 sat, so 1_000_000 USDC base units
        // (1 USDC) is worth 10_000 sats; BTC side holds 990_000 sats -> overwhelmingly BTC-heavy.
        sc.set_balance(Token::Usdc, Amount::from_u64(1_000_000));
        btc.set_balance(Amount::from_u64(990_000));

        let job = monitor.tick().await.unwrap().expect("expected a seeded job");
        assert_eq!(job.phase, Phase::Triggered);
        assert_eq!(job.src_token, Some(Token::Btc));
        assert_eq!(job.dst_token, Some(Token::Usdc));
        assert!(job.amount_out.unwrap() > Amount::zero());
    }

    // USDC-heavy inventory within the usable balance seeds a USDC -> BTC job.
    #[tokio::test]
    async fn usdc_heavy_imbalance_within_usable_balance_seeds_usdc_to_btc_job() {
        let (monitor, sc, btc) = build_monitor(50_000, 500_000);
        sc.set_balance(Token::Usdc, Amount::from_u64(99_000_000));
        btc.set_balance(Amount::from_u64(10_000));

        let job = monitor.tick().await.unwrap().expect("expected a seeded job");
        assert_eq!(job.src_token, Some(Token::Usdc));
        assert_eq!(job.dst_token, Some(Token::Btc));
    }

    // USDC-heavy where most of the smart-chain balance is locked in open swaps: the comparison
    // still counts it toward the imbalance (per step 2), but the corrective notional exceeds the
    // *usable* balance, so the monitor must abort rather than seed an unfundable job.
    #[tokio::test]
    async fn usdc_heavy_imbalance_exceeding_usable_balance_aborts() {
        let sc = MockSwapContract::new();
        let btc = MockBitcoinBackend::new();
        sc.set_balance(Token::Usdc, Amount::from_u64(100));
        btc.set_balance(Amount::from_u64(1));

        let oracle = MockInventoryOracle::new();
        oracle.set_open_swap_inventory(crate::adapters::OpenSwapInventory {
            locked: vec![(Token::Usdc, Amount::from_u64(50_000_000))],
            returning: vec![],
        });
        let job_handle = Arc::new(StdMutex::new(None));
        let monitor = BalanceMonitor::new(
            sc,
            btc,
            MockLightningBackend::new(),
            oracle,
            job_handle,
            1,
            1_000_000,
        );

        assert!(monitor.tick().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn balanced_inventory_within_threshold_seeds_nothing() {
        let (monitor, sc, btc) = build_monitor(1, 500_000);
        // MockInventoryOracle values 100 USDC base units at 1 sat; 50_000 USDC base units is then
        // exactly on par with 500 sats of on-chain BTC, a perfect 50/50 split.
        sc.set_balance(Token::Usdc, Amount::from_u64(50_000));
        btc.set_balance(Amount::from_u64(500));
        assert!(monitor.tick().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn zero_total_inventory_seeds_nothing() {
        let (monitor, _sc, _btc) = build_monitor(1, 1_000_000);
        assert!(monitor.tick().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn job_in_flight_short_circuits_without_reading_balances() {
        let sc = MockSwapContract::new();
        let btc = MockBitcoinBackend::new();
        let io = MockInventoryOracle::new();
        let job = Arc::new(StdMutex::new(Some(RebalanceJob::new_triggered(
            Token::Btc,
            None,
            Token::Usdc,
            None,
            Amount::from_u64(1),
        ))));
        let monitor = BalanceMonitor::new(sc, btc, MockLightningBackend::new(), io, job, 1, 1_000_000);
        assert!(monitor.tick().await.unwrap().is_none());
    }

    #[test]
    fn scale_ppm_applies_both_diff_and_amount_factors() {
        // sum=1_000_000, diff=200_000ppm (20%), amount_ppm=500_000 (50%) -> 1_000_000 * 0.2 * 0.5
        let sum = Amount::from_u64(1_000_000);
        let scaled = scale_ppm(&sum, 200_000, 500_000);
        assert_eq!(scaled, Amount::from_u64(100_000));
    }

    #[test]
    fn ppm_share_of_zero_total_is_zero() {
        assert_eq!(ppm_share(&Amount::from_u64(5), &Amount::zero()), 0);
    }
}
