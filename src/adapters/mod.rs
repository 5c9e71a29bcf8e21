//! External collaborators the engine drives. Traits live directly in this module's sibling
//! files; reference implementations live alongside them (`bitcoind_rpc`, `okx_exchange`). `mocks`
//! holds in-memory doubles for every rail, used both by tests and as the binary's stand-in for
//! the two rails this crate ships as traits only (`LightningBackend`, `SwapContract`).

pub mod bitcoin_backend;
pub mod bitcoind_rpc;
pub mod exchange;
pub mod inventory_oracle;
pub mod lightning;
pub mod mocks;
pub mod okx_exchange;
pub mod swap_contract;

pub use bitcoin_backend::{BitcoinBackend, ChainTransaction, FundedPsbt, SignedPsbt, UtxoLock};
pub use exchange::{
    Deposit, DepositState, Exchange, FundsTransfer, FundsTransferState, SubAccount, Trade,
    TradeState, Withdrawal, WithdrawalState,
};
pub use inventory_oracle::{InventoryOracle, OpenSwapInventory, RoundingMode};
pub use lightning::{Invoice, LightningBackend, Payment};
pub use swap_contract::{SwapContract, TxBroadcastCallback, TxReplaceCallback, TxStatus};
