//! The smart-chain wallet + escrow contract the intermediary holds its token balances in.

use std::future::Future;
use std::sync::Arc;

use crate::amount::Amount;
use crate::error::EngineError;
use crate::token::Token;

/// Confirmation state of a smart-chain transaction, keyed either by the raw transaction or by a
/// previously observed transaction id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxStatus {
    NotFound,
    Pending,
    Reverted,
    Success,
}

/// Fired by [`SwapContract::send_and_confirm`] before a transaction is broadcast, and again
/// whenever a pending transaction is replaced (e.g. a fee bump). The engine's
/// [`crate::engine::RebalanceEngine`] registers this as the signal to checkpoint the candidate
/// (or, on replacement, to extend the candidate map and the job's cooldown).
pub type TxBroadcastCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Registered once at startup by the Supervisor; fired whenever the underlying wallet publishes a
/// replacement for a transaction it previously broadcast (e.g. a fee bump keeping the same nonce).
pub type TxReplaceCallback = Arc<dyn Fn(&str, &str, &str, &str) + Send + Sync>;

/// Smart-chain wallet + escrow contract the intermediary custodies token balances inside.
///
/// Builds, signs, broadcasts, and observes transactions for withdraw/transfer/deposit of fungible
/// tokens to/from the intermediary's own contract-held balance.
pub trait SwapContract: Send + Sync {
    /// Returns the current balance of `token` held by the contract. When `usable` is `true`,
    /// excludes any balance already committed elsewhere (locked collateral, pending claims).
    fn get_balance(
        &self,
        token: Token,
        usable: bool,
    ) -> impl Future<Output = Result<Amount, EngineError>> + Send;

    /// Builds one or more candidate withdrawal transactions moving `amount` of `token` out of the
    /// contract to `to`.
    fn txs_withdraw(
        &self,
        token: Token,
        amount: &Amount,
        to: &str,
    ) -> impl Future<Output = Result<Vec<(String, String)>, EngineError>> + Send;

    /// Builds one or more candidate transactions transferring `amount` of `token` from the
    /// intermediary's own wallet to `to` (used after a smart-chain-side withdrawal has confirmed,
    /// to move funds on to the CEX deposit address).
    fn txs_transfer(
        &self,
        token: Token,
        amount: &Amount,
        to: &str,
    ) -> impl Future<Output = Result<Vec<(String, String)>, EngineError>> + Send;

    /// Builds one or more candidate deposit-to-contract transactions moving `amount` of `token`
    /// back into the contract's custody.
    fn txs_deposit(
        &self,
        token: Token,
        amount: &Amount,
    ) -> impl Future<Output = Result<Vec<(String, String)>, EngineError>> + Send;

    /// Signs and broadcasts `txs` in order, invoking `on_broadcast` for each just before the
    /// broadcast is acknowledged (the engine's checkpoint signal), and returns the first
    /// successfully submitted `(txid, raw_tx)` pair.
    fn send_and_confirm(
        &self,
        txs: Vec<(String, String)>,
        on_broadcast: TxBroadcastCallback,
    ) -> impl Future<Output = Result<(String, String), EngineError>> + Send;

    /// Looks up confirmation state for a raw, not-yet-identified candidate transaction.
    fn get_tx_status(
        &self,
        raw_tx: &str,
    ) -> impl Future<Output = Result<TxStatus, EngineError>> + Send;

    /// Looks up confirmation state for a previously confirmed transaction id.
    fn get_tx_id_status(
        &self,
        tx_id: &str,
    ) -> impl Future<Output = Result<TxStatus, EngineError>> + Send;

    /// Registers a callback fired when a previously broadcast transaction is replaced.
    fn on_before_tx_replace(&self, cb: TxReplaceCallback);

    /// Returns the contract's own address (used as the deposit-to-contract destination).
    fn get_address(&self) -> impl Future<Output = Result<String, EngineError>> + Send;

    /// Normalizes a string into this chain's address representation.
    fn to_token_address(&self, s: &str) -> Result<String, EngineError>;
}
