//! The CEX: spot trading, deposit-address issuance, deposit history, intra-account transfer,
//! withdrawal, withdrawal history, balance, withdrawal-fee lookup. Every mutating operation
//! accepts a client-chosen idempotency key so retries can be deduplicated by the venue.

use std::future::Future;

use crate::amount::Amount;
use crate::error::ExchangeError;
use crate::token::Token;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DepositState {
    /// Confirmed on-chain but not yet withdrawable per venue policy.
    CreditedNotWithdrawable,
    Success,
    Pending,
}

#[derive(Clone, Debug)]
pub struct Deposit {
    pub deposit_id: String,
    pub state: DepositState,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TradeState {
    Live,
    PartiallyFilled,
    Filled,
    Canceled,
    MmpCanceled,
}

#[derive(Clone, Debug)]
pub struct Trade {
    pub order_id: String,
    pub average_price: String,
    pub state: TradeState,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FundsTransferState {
    Success,
    Pending,
    Failed,
}

#[derive(Clone, Debug)]
pub struct FundsTransfer {
    pub transfer_id: String,
    pub state: FundsTransferState,
}

/// Mirrors the venue's raw withdrawal status codes: `2` completed, `1`/`0` in progress,
/// `-1`/`-2`/`-3` distinct terminal-failure reasons.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WithdrawalState {
    Completed,
    Pending,
    Submitted,
    FailedInsufficientBalance,
    FailedRiskControl,
    FailedOther,
}

#[derive(Clone, Debug)]
pub struct Withdrawal {
    pub tx_id: Option<String>,
    pub state: WithdrawalState,
}

/// Isolated CEX balance pool: withdrawals originate from `Funding`, trades settle in `Trading`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SubAccount {
    Funding,
    Trading,
}

pub trait Exchange: Send + Sync {
    /// Requests a deposit address for `coin` (optionally on `chain`). For the Lightning leg,
    /// `amount` must be supplied and the returned string is a BOLT-11 invoice rather than an
    /// address.
    fn get_deposit_address(
        &self,
        coin: Token,
        chain: Option<&str>,
        amount: Option<&Amount>,
    ) -> impl Future<Output = Result<String, ExchangeError>> + Send;

    /// Looks up a deposit by the rail-side transaction id that funded it. `None` if not yet seen.
    fn get_deposit(
        &self,
        tx_id: &str,
    ) -> impl Future<Output = Result<Option<Deposit>, ExchangeError>> + Send;

    /// Submits a market order converting `src` into `dst`, idempotent on `client_order_id`.
    /// Returns the venue order id.
    fn market_trade(
        &self,
        src: Token,
        dst: Token,
        amount: &Amount,
        client_order_id: &str,
    ) -> impl Future<Output = Result<String, ExchangeError>> + Send;

    /// Looks up a trade by its client-chosen order id.
    fn get_trade(
        &self,
        src: Token,
        dst: Token,
        client_order_id: &str,
    ) -> impl Future<Output = Result<Option<Trade>, ExchangeError>> + Send;

    /// Transfers `amount` of `ccy` between sub-accounts, idempotent on `client_id`.
    fn funds_transfer(
        &self,
        ccy: Token,
        from: SubAccount,
        to: SubAccount,
        amount: &Amount,
        client_id: &str,
    ) -> impl Future<Output = Result<String, ExchangeError>> + Send;

    /// Looks up a funds transfer by its client-chosen id.
    fn get_funds_transfer(
        &self,
        client_id: &str,
    ) -> impl Future<Output = Result<Option<FundsTransfer>, ExchangeError>> + Send;

    /// Looks up the venue's current withdrawal fee for `coin` on `chain`.
    fn get_withdrawal_fee(
        &self,
        coin: Token,
        chain: &str,
        amount: Option<&Amount>,
    ) -> impl Future<Output = Result<Amount, ExchangeError>> + Send;

    /// Submits a withdrawal of `amount` (net of `fee`) to `address`, idempotent on
    /// `client_withdrawal_id`. For Lightning, `address` is the BOLT-11 invoice and amount is
    /// derived from it by the venue.
    fn withdraw(
        &self,
        coin: Token,
        chain: &str,
        address: &str,
        client_withdrawal_id: &str,
        fee: &Amount,
        amount: &Amount,
    ) -> impl Future<Output = Result<String, ExchangeError>> + Send;

    /// Looks up a withdrawal by its client-chosen id.
    fn get_withdrawal(
        &self,
        client_withdrawal_id: &str,
    ) -> impl Future<Output = Result<Option<Withdrawal>, ExchangeError>> + Send;

    /// Current balance of `ccy` in `account`.
    fn get_balance(
        &self,
        ccy: Token,
        account: SubAccount,
    ) -> impl Future<Output = Result<Amount, ExchangeError>> + Send;
}
