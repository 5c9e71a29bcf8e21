//! Bootstraps adapters from [`Config`], loads any persisted job, registers the tx-replacement
//! callback, and drives `BalanceMonitor` and `RebalanceEngine` on their respective timers.

use std::sync::Arc;

use tokio::time::interval;
use tracing::{error, info};

use crate::adapters::bitcoind_rpc::BitcoindRpcBackend;
use crate::adapters::okx_exchange::OkxExchange;
use crate::config::Config;
use crate::engine::{handle_tx_replace, RebalanceEngine};
use crate::error::EngineError;
use crate::monitor::BalanceMonitor;
use crate::store::StateStore;

/// Wires together the concrete, network-backed adapters and runs the rebalancer until the process
/// is terminated. `lightning`/`swap_contract` are left to the caller since this crate does not
/// ship a production-grade implementation of either (see SPEC_FULL.md §2) — pass in whatever
/// `LightningBackend`/`SwapContract` implementation the deployment provides.
pub async fn run<LN, SC, IO>(
    config: Config,
    lightning: LN,
    swap_contract: SC,
    inventory: IO,
) -> Result<(), EngineError>
where
    LN: crate::adapters::LightningBackend + Clone + 'static,
    SC: crate::adapters::SwapContract + Clone + 'static,
    IO: crate::adapters::InventoryOracle + 'static,
{
    let store = StateStore::new(config.state_file_path.clone(), config.archive_dir_path.clone());
    let initial_job = store.load().await?;

    let bitcoin = BitcoindRpcBackend::new(config.bitcoind_url.clone(), config.bitcoind_auth.clone())?;
    let exchange = OkxExchange::new(
        config.cex_base_url.clone(),
        config.api_key.clone(),
        config.api_secret.clone(),
        config.api_passphrase.clone(),
    );

    let bitcoin_for_monitor = BitcoindRpcBackend::new(config.bitcoind_url.clone(), config.bitcoind_auth.clone())?;

    let engine = Arc::new(RebalanceEngine::new(
        swap_contract.clone(),
        bitcoin,
        lightning.clone(),
        exchange,
        store,
        initial_job,
        config.retry_time,
        config.cooldown,
        config.sc_chain_name.clone(),
        config.token_addresses.clone(),
    ));

    let job_handle = engine.job_handle();
    let cooldown = config.cooldown;
    let replace_job_handle = job_handle.clone();
    swap_contract.on_before_tx_replace(Arc::new(move |_old_tx, old_tx_id, new_tx, new_tx_id| {
        handle_tx_replace(&replace_job_handle, cooldown, old_tx_id, new_tx_id, new_tx);
    }));

    let monitor = BalanceMonitor::new(
        swap_contract,
        bitcoin_for_monitor,
        lightning,
        inventory,
        job_handle,
        config.rebalance_threshold_ppm,
        config.rebalance_amount_ppm,
    );

    let monitor_interval = config.monitor_interval;
    let check_interval = config.check_interval;

    let monitor_engine = engine.clone();
    let monitor_task = tokio::spawn(async move {
        let mut ticker = interval(monitor_interval);
        loop {
            ticker.tick().await;
            match monitor.tick().await {
                Ok(Some(job)) => {
                    if let Err(e) = monitor_engine.seed(job).await {
                        error!(error = %e, "failed to seed rebalance job");
                    }
                }
                Ok(None) => {}
                Err(e) => error!(error = %e, "balance monitor tick failed"),
            }
        }
    });

    let engine_task = tokio::spawn(async move {
        let mut ticker = interval(check_interval);
        loop {
            ticker.tick().await;
            if let Err(e) = engine.tick().await {
                error!(error = %e, "engine tick failed");
            }
        }
    });

    info!("supervisor started");
    let _ = tokio::join!(monitor_task, engine_task);
    Ok(())
}
