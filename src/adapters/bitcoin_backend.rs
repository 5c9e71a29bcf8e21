//! On-chain Bitcoin UTXO wallet: PSBT fund/sign/broadcast, transaction lookup by txid.

use std::future::Future;

use crate::amount::Amount;
use crate::error::EngineError;

/// A locked UTXO reserved by [`BitcoinBackend::fund_psbt`]; must be unlocked on any failure path
/// that does not end in a broadcast, so the wallet does not starve of spendable inputs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UtxoLock {
    pub lock_id: String,
    pub transaction_id: String,
    pub transaction_vout: u32,
}

/// Result of funding a PSBT: the envelope itself plus the inputs it reserved.
#[derive(Clone, Debug)]
pub struct FundedPsbt {
    pub psbt: String,
    pub inputs: Vec<UtxoLock>,
}

/// Result of signing a funded PSBT.
#[derive(Clone, Debug)]
pub struct SignedPsbt {
    pub transaction: String,
}

/// An on-chain transaction as observed by the backend.
#[derive(Clone, Debug)]
pub struct ChainTransaction {
    pub confirmations: u32,
}

pub trait BitcoinBackend: Send + Sync {
    /// Looks up a wallet transaction by id. `None` if the wallet has no record of it.
    fn get_transaction(
        &self,
        tx_id: &str,
    ) -> impl Future<Output = Result<Option<ChainTransaction>, EngineError>> + Send;

    /// Funds a PSBT paying `outputs` (address, amount-in-sats pairs), honoring the given
    /// confirmation constraints on coin selection.
    fn fund_psbt(
        &self,
        outputs: &[(String, Amount)],
        min_confirmations: u32,
        target_confirmations: u32,
    ) -> impl Future<Output = Result<FundedPsbt, EngineError>> + Send;

    /// Signs a previously funded PSBT.
    fn sign_psbt(&self, psbt: &str) -> impl Future<Output = Result<SignedPsbt, EngineError>> + Send;

    /// Broadcasts a fully signed raw transaction, returning its txid.
    fn broadcast_chain_transaction(
        &self,
        raw_tx: &str,
    ) -> impl Future<Output = Result<String, EngineError>> + Send;

    /// Releases a UTXO lock taken by `fund_psbt` when the funded PSBT is abandoned.
    fn unlock_utxo(&self, lock: &UtxoLock) -> impl Future<Output = Result<(), EngineError>> + Send;

    /// Returns the next non-change receiving address, used as a rebalance payout destination.
    fn get_chain_addresses(&self) -> impl Future<Output = Result<Vec<String>, EngineError>> + Send;

    /// Total on-chain wallet balance, in satoshis.
    fn get_chain_balance(&self) -> impl Future<Output = Result<Amount, EngineError>> + Send;
}
