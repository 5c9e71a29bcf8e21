//! Current BTC-equivalent value of each held token, plus locked and pending-refund balances
//! derived from open customer swaps.

use std::future::Future;

use crate::amount::Amount;
use crate::error::EngineError;
use crate::token::Token;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoundingMode {
    Floor,
    Ceil,
}

/// Inventory committed or in flight for open customer swaps, as a read-only snapshot. The core
/// never couples to swap-handler internals; this is the only seam.
#[derive(Clone, Debug, Default)]
pub struct OpenSwapInventory {
    /// Commitments covering outbound claims, keyed by token.
    pub locked: Vec<(Token, Amount)>,
    /// Funds en route back to the intermediary, keyed by token.
    pub returning: Vec<(Token, Amount)>,
}

pub trait InventoryOracle: Send + Sync {
    /// Converts `amount` of `token` into BTC base units (satoshis) at the current price.
    fn to_btc(
        &self,
        amount: &Amount,
        token: Token,
    ) -> impl Future<Output = Result<Amount, EngineError>> + Send;

    /// Converts `amount_btc` satoshis into `token` base units at the current price.
    fn from_btc(
        &self,
        amount_btc: &Amount,
        token: Token,
        rounding: RoundingMode,
    ) -> impl Future<Output = Result<Amount, EngineError>> + Send;

    /// Snapshot of locked/returning inventory across all open customer swaps.
    fn open_swap_inventory(
        &self,
    ) -> impl Future<Output = Result<OpenSwapInventory, EngineError>> + Send;
}
