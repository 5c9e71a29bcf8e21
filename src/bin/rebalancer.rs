//! Process entrypoint: loads [`Config`] from the environment, initializes structured logging, and
//! hands off to the supervisor.

use btc_sc_rebalancer::adapters::mocks::{MockInventoryOracle, MockLightningBackend, MockSwapContract};
use btc_sc_rebalancer::config::Config;
use btc_sc_rebalancer::supervisor;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::from_env()?;

    // This crate ships a production-grade `BitcoinBackend` and `Exchange`; `LightningBackend` and
    // `SwapContract` are specified as traits with in-memory doubles only (SPEC_FULL.md §2).
    // A deployment wires its own Lightning node client and smart-chain wallet here.
    let lightning = MockLightningBackend::new();
    let swap_contract = MockSwapContract::new();
    let inventory = MockInventoryOracle::new();

    supervisor::run(config, lightning, swap_contract, inventory).await?;
    Ok(())
}
