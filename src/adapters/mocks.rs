//! In-memory scripted doubles for the two rails this crate specifies only as traits
//! (`LightningBackend`, `SwapContract`), plus doubles for `BitcoinBackend`, `Exchange`, and
//! `InventoryOracle` used by the engine's own test suite to drive the S1-S6 scenarios without a
//! network. Every mock confirms transactions/payments/trades immediately on the tick after they
//! are submitted, which is sufficient to exercise every transition in the phase table.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::adapters::{
    BitcoinBackend, ChainTransaction, Deposit, DepositState, Exchange, FundedPsbt, FundsTransfer,
    FundsTransferState, InventoryOracle, Invoice, LightningBackend, OpenSwapInventory, Payment,
    RoundingMode, SignedPsbt, SubAccount, Trade, TradeState, TxBroadcastCallback, TxReplaceCallback,
    TxStatus, UtxoLock, Withdrawal, WithdrawalState,
};
use crate::amount::Amount;
use crate::error::{EngineError, ExchangeError};
use crate::idempotency::new_idempotency_key;
use crate::token::Token;

#[derive(Default)]
struct SwapContractState {
    balances: HashMap<Token, Amount>,
    confirmed: HashMap<String, TxStatus>,
    replace_cb: Option<TxReplaceCallback>,
    /// When set, `get_tx_id_status` reports `Success` for any tx id it has no script for — models
    /// a chain-wide indexer that can see transactions the engine itself never broadcast (e.g. a
    /// withdrawal the CEX submitted on our behalf).
    default_confirmed: bool,
}

#[derive(Clone)]
pub struct MockSwapContract {
    state: Arc<Mutex<SwapContractState>>,
}

impl MockSwapContract {
    pub fn new() -> Self {
        MockSwapContract {
            state: Arc::new(Mutex::new(SwapContractState::default())),
        }
    }

    pub fn set_balance(&self, token: Token, amount: Amount) {
        self.state.lock().unwrap().balances.insert(token, amount);
    }

    pub fn set_default_confirmed(&self, confirmed: bool) {
        self.state.lock().unwrap().default_confirmed = confirmed;
    }

    pub fn set_tx_status(&self, tx_id: &str, status: TxStatus) {
        self.state.lock().unwrap().confirmed.insert(tx_id.to_string(), status);
    }

    pub fn revert(&self, tx_id: &str) {
        self.set_tx_status(tx_id, TxStatus::Reverted);
    }
}

impl Default for MockSwapContract {
    fn default() -> Self {
        Self::new()
    }
}

impl SwapContract for MockSwapContract {
    async fn get_balance(&self, token: Token, _usable: bool) -> Result<Amount, EngineError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .balances
            .get(&token)
            .cloned()
            .unwrap_or_else(Amount::zero))
    }

    async fn txs_withdraw(
        &self,
        _token: Token,
        _amount: &Amount,
        to: &str,
    ) -> Result<Vec<(String, String)>, EngineError> {
        Ok(vec![(new_idempotency_key(), format!("withdraw-to-{to}"))])
    }

    async fn txs_transfer(
        &self,
        _token: Token,
        _amount: &Amount,
        to: &str,
    ) -> Result<Vec<(String, String)>, EngineError> {
        Ok(vec![(new_idempotency_key(), format!("transfer-to-{to}"))])
    }

    async fn txs_deposit(&self, _token: Token, _amount: &Amount) -> Result<Vec<(String, String)>, EngineError> {
        Ok(vec![(new_idempotency_key(), "deposit-to-contract".to_string())])
    }

    async fn send_and_confirm(
        &self,
        txs: Vec<(String, String)>,
        on_broadcast: TxBroadcastCallback,
    ) -> Result<(String, String), EngineError> {
        let (tx_id, raw_tx) = txs
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::SwapContract("no candidate transactions".to_string()))?;
        on_broadcast(&tx_id, &raw_tx);
        self.state
            .lock()
            .unwrap()
            .confirmed
            .insert(tx_id.clone(), TxStatus::Success);
        Ok((tx_id, raw_tx))
    }

    async fn get_tx_status(&self, _raw_tx: &str) -> Result<TxStatus, EngineError> {
        Ok(TxStatus::Success)
    }

    async fn get_tx_id_status(&self, tx_id: &str) -> Result<TxStatus, EngineError> {
        let state = self.state.lock().unwrap();
        if let Some(status) = state.confirmed.get(tx_id).copied() {
            return Ok(status);
        }
        Ok(if state.default_confirmed {
            TxStatus::Success
        } else {
            TxStatus::NotFound
        })
    }

    fn on_before_tx_replace(&self, cb: TxReplaceCallback) {
        self.state.lock().unwrap().replace_cb = Some(cb);
    }

    async fn get_address(&self) -> Result<String, EngineError> {
        Ok("0xcontract".to_string())
    }

    fn to_token_address(&self, s: &str) -> Result<String, EngineError> {
        Ok(s.to_string())
    }
}

#[derive(Default)]
struct BitcoinState {
    transactions: HashMap<String, ChainTransaction>,
    balance: Amount,
    /// See `SwapContractState::default_confirmed`; same rationale for inbound withdrawals.
    default_confirmed: bool,
}

#[derive(Clone)]
pub struct MockBitcoinBackend {
    state: Arc<Mutex<BitcoinState>>,
}

impl MockBitcoinBackend {
    pub fn new() -> Self {
        MockBitcoinBackend {
            state: Arc::new(Mutex::new(BitcoinState {
                transactions: HashMap::new(),
                balance: Amount::zero(),
                default_confirmed: false,
            })),
        }
    }

    pub fn confirm(&self, tx_id: &str, confirmations: u32) {
        self.state
            .lock()
            .unwrap()
            .transactions
            .insert(tx_id.to_string(), ChainTransaction { confirmations });
    }

    pub fn set_balance(&self, balance: Amount) {
        self.state.lock().unwrap().balance = balance;
    }

    pub fn set_default_confirmed(&self, confirmed: bool) {
        self.state.lock().unwrap().default_confirmed = confirmed;
    }
}

impl Default for MockBitcoinBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl BitcoinBackend for MockBitcoinBackend {
    async fn get_transaction(&self, tx_id: &str) -> Result<Option<ChainTransaction>, EngineError> {
        let state = self.state.lock().unwrap();
        if let Some(tx) = state.transactions.get(tx_id) {
            return Ok(Some(tx.clone()));
        }
        Ok(if state.default_confirmed {
            Some(ChainTransaction { confirmations: 6 })
        } else {
            None
        })
    }

    async fn fund_psbt(
        &self,
        _outputs: &[(String, Amount)],
        _min_confirmations: u32,
        _target_confirmations: u32,
    ) -> Result<FundedPsbt, EngineError> {
        Ok(FundedPsbt {
            psbt: "unsigned-psbt".to_string(),
            inputs: vec![UtxoLock {
                lock_id: new_idempotency_key(),
                transaction_id: new_idempotency_key(),
                transaction_vout: 0,
            }],
        })
    }

    async fn sign_psbt(&self, _psbt: &str) -> Result<SignedPsbt, EngineError> {
        Ok(SignedPsbt {
            transaction: new_idempotency_key(),
        })
    }

    async fn broadcast_chain_transaction(&self, raw_tx: &str) -> Result<String, EngineError> {
        let tx_id = raw_tx.to_string();
        self.confirm(&tx_id, 6);
        Ok(tx_id)
    }

    async fn unlock_utxo(&self, _lock: &UtxoLock) -> Result<(), EngineError> {
        Ok(())
    }

    async fn get_chain_addresses(&self) -> Result<Vec<String>, EngineError> {
        Ok(vec!["bc1qmock".to_string()])
    }

    async fn get_chain_balance(&self) -> Result<Amount, EngineError> {
        Ok(self.state.lock().unwrap().balance.clone())
    }
}

#[derive(Default)]
struct LightningState {
    payments: HashMap<String, Payment>,
    invoices: HashMap<String, Invoice>,
}

#[derive(Clone)]
pub struct MockLightningBackend {
    state: Arc<Mutex<LightningState>>,
}

impl MockLightningBackend {
    pub fn new() -> Self {
        MockLightningBackend {
            state: Arc::new(Mutex::new(LightningState::default())),
        }
    }
}

impl Default for MockLightningBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl LightningBackend for MockLightningBackend {
    async fn pay(&self, request: &str) -> Result<String, EngineError> {
        let hash = new_idempotency_key();
        self.state.lock().unwrap().payments.insert(
            hash.clone(),
            Payment {
                is_confirmed: true,
                is_failed: false,
            },
        );
        let _ = request;
        Ok(hash)
    }

    async fn get_payment(&self, id: &str) -> Result<Option<Payment>, EngineError> {
        Ok(self.state.lock().unwrap().payments.get(id).cloned())
    }

    async fn create_invoice(&self, _mtokens: u64) -> Result<Invoice, EngineError> {
        let id = new_idempotency_key();
        let invoice = Invoice {
            request: format!("lnbc-mock-{id}"),
            id: id.clone(),
            is_confirmed: true,
            is_canceled: false,
        };
        self.state.lock().unwrap().invoices.insert(id, invoice.clone());
        Ok(invoice)
    }

    async fn get_invoice(&self, id: &str) -> Result<Invoice, EngineError> {
        self.state
            .lock()
            .unwrap()
            .invoices
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::Lightning(format!("unknown invoice {id}")))
    }

    async fn get_channel_balance(&self) -> Result<u64, EngineError> {
        Ok(0)
    }
}

#[derive(Default)]
struct ExchangeState {
    deposits: HashMap<String, Deposit>,
    trades: HashMap<String, Trade>,
    transfers: HashMap<String, FundsTransfer>,
    withdrawals: HashMap<String, Withdrawal>,
    balances: HashMap<(Token, SubAccount), Amount>,
    /// Consumed by the next `market_trade` call: scripts a one-shot cancellation instead of the
    /// default immediate fill, to exercise the DEPOSIT_RECEIVED retry path.
    cancel_next_trade: bool,
}

#[derive(Clone)]
pub struct MockExchange {
    state: Arc<Mutex<ExchangeState>>,
}

impl MockExchange {
    pub fn new() -> Self {
        MockExchange {
            state: Arc::new(Mutex::new(ExchangeState::default())),
        }
    }

    pub fn set_balance(&self, ccy: Token, account: SubAccount, amount: Amount) {
        self.state.lock().unwrap().balances.insert((ccy, account), amount);
    }

    pub fn cancel_next_trade(&self) {
        self.state.lock().unwrap().cancel_next_trade = true;
    }

    pub fn set_withdrawal(&self, client_withdrawal_id: &str, withdrawal: Withdrawal) {
        self.state
            .lock()
            .unwrap()
            .withdrawals
            .insert(client_withdrawal_id.to_string(), withdrawal);
    }
}

impl Default for MockExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl Exchange for MockExchange {
    async fn get_deposit_address(
        &self,
        coin: Token,
        _chain: Option<&str>,
        amount: Option<&Amount>,
    ) -> Result<String, ExchangeError> {
        if coin == Token::BtcLn {
            let sats: u64 = amount
                .map(|a| a.to_decimal(0))
                .unwrap_or_default()
                .parse()
                .unwrap_or(0);
            // Fabricates a BOLT-11-shaped invoice string encoding `sats` via the `n` (nano-BTC)
            // multiplier, matching `parse_bolt11_amount_sats`'s HRP parsing: amount_n = sats * 10.
            return Ok(format!("lnbc{}n1mockinvoice", sats.saturating_mul(10)));
        }
        Ok(format!("deposit-address-{coin}"))
    }

    async fn get_deposit(&self, tx_id: &str) -> Result<Option<Deposit>, ExchangeError> {
        let mut state = self.state.lock().unwrap();
        Ok(Some(
            state
                .deposits
                .entry(tx_id.to_string())
                .or_insert_with(|| Deposit {
                    deposit_id: new_idempotency_key(),
                    state: DepositState::Success,
                })
                .clone(),
        ))
    }

    async fn market_trade(
        &self,
        _src: Token,
        _dst: Token,
        _amount: &Amount,
        client_order_id: &str,
    ) -> Result<String, ExchangeError> {
        let mut state = self.state.lock().unwrap();
        let trade_state = if std::mem::take(&mut state.cancel_next_trade) {
            TradeState::Canceled
        } else {
            TradeState::Filled
        };
        state.trades.insert(
            client_order_id.to_string(),
            Trade {
                order_id: new_idempotency_key(),
                average_price: "1.0".to_string(),
                state: trade_state,
            },
        );
        Ok(client_order_id.to_string())
    }

    async fn get_trade(
        &self,
        _src: Token,
        _dst: Token,
        client_order_id: &str,
    ) -> Result<Option<Trade>, ExchangeError> {
        Ok(self.state.lock().unwrap().trades.get(client_order_id).cloned())
    }

    async fn funds_transfer(
        &self,
        _ccy: Token,
        _from: SubAccount,
        _to: SubAccount,
        _amount: &Amount,
        client_id: &str,
    ) -> Result<String, ExchangeError> {
        let mut state = self.state.lock().unwrap();
        state.transfers.insert(
            client_id.to_string(),
            FundsTransfer {
                transfer_id: new_idempotency_key(),
                state: FundsTransferState::Success,
            },
        );
        Ok(client_id.to_string())
    }

    async fn get_funds_transfer(&self, client_id: &str) -> Result<Option<FundsTransfer>, ExchangeError> {
        Ok(self.state.lock().unwrap().transfers.get(client_id).cloned())
    }

    async fn get_withdrawal_fee(
        &self,
        _coin: Token,
        _chain: &str,
        _amount: Option<&Amount>,
    ) -> Result<Amount, ExchangeError> {
        Ok(Amount::from_u64(1000))
    }

    async fn withdraw(
        &self,
        _coin: Token,
        _chain: &str,
        _address: &str,
        client_withdrawal_id: &str,
        _fee: &Amount,
        _amount: &Amount,
    ) -> Result<String, ExchangeError> {
        let mut state = self.state.lock().unwrap();
        state.withdrawals.insert(
            client_withdrawal_id.to_string(),
            Withdrawal {
                tx_id: Some(new_idempotency_key()),
                state: WithdrawalState::Completed,
            },
        );
        Ok(client_withdrawal_id.to_string())
    }

    async fn get_withdrawal(&self, client_withdrawal_id: &str) -> Result<Option<Withdrawal>, ExchangeError> {
        Ok(self.state.lock().unwrap().withdrawals.get(client_withdrawal_id).cloned())
    }

    async fn get_balance(&self, ccy: Token, account: SubAccount) -> Result<Amount, ExchangeError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .balances
            .get(&(ccy, account))
            .cloned()
            .unwrap_or_else(Amount::zero))
    }
}

#[derive(Clone)]
pub struct MockInventoryOracle {
    price_btc_per_unit: Arc<Mutex<HashMap<Token, (u64, u64)>>>,
    open_inventory: Arc<Mutex<OpenSwapInventory>>,
}

impl MockInventoryOracle {
    pub fn new() -> Self {
        let mut prices = HashMap::new();
        // 1 USDC (1e6 base units) = 0.00001 BTC (1,000 sats): illustrative, arbitrary peg.
        prices.insert(Token::Usdc, (1, 100));
        MockInventoryOracle {
            price_btc_per_unit: Arc::new(Mutex::new(prices)),
            open_inventory: Arc::new(Mutex::new(OpenSwapInventory::default())),
        }
    }

    pub fn set_open_swap_inventory(&self, inventory: OpenSwapInventory) {
        *self.open_inventory.lock().unwrap() = inventory;
    }
}

impl Default for MockInventoryOracle {
    fn default() -> Self {
        Self::new()
    }
}

impl InventoryOracle for MockInventoryOracle {
    async fn to_btc(&self, amount: &Amount, token: Token) -> Result<Amount, EngineError> {
        let (num, den) = *self
            .price_btc_per_unit
            .lock()
            .unwrap()
            .get(&token)
            .unwrap_or(&(1, 1));
        let base: u128 = amount.to_decimal(0).parse().unwrap_or(0);
        let sats = base.saturating_mul(num as u128) / den as u128;
        Ok(Amount::from_decimal(&sats.to_string(), 0).unwrap_or_else(|_| Amount::zero()))
    }

    async fn from_btc(&self, amount_btc: &Amount, token: Token, _rounding: RoundingMode) -> Result<Amount, EngineError> {
        let (num, den) = *self
            .price_btc_per_unit
            .lock()
            .unwrap()
            .get(&token)
            .unwrap_or(&(1, 1));
        let sats: u128 = amount_btc.to_decimal(0).parse().unwrap_or(0);
        let base = sats.saturating_mul(den as u128) / num.max(1) as u128;
        Ok(Amount::from_decimal(&base.to_string(), 0).unwrap_or_else(|_| Amount::zero()))
    }

    async fn open_swap_inventory(&self) -> Result<OpenSwapInventory, EngineError> {
        Ok(self.open_inventory.lock().unwrap().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn swap_contract_confirms_on_first_candidate() {
        let sc = MockSwapContract::new();
        let txs = sc.txs_withdraw(Token::Usdc, &Amount::from_u64(1), "0xdest").await.unwrap();
        let cb: TxBroadcastCallback = Arc::new(|_, _| {});
        let (tx_id, _) = sc.send_and_confirm(txs, cb).await.unwrap();
        assert_eq!(sc.get_tx_id_status(&tx_id).await.unwrap(), TxStatus::Success);
    }

    #[tokio::test]
    async fn swap_contract_invokes_on_broadcast_before_resolving() {
        let sc = MockSwapContract::new();
        let txs = sc.txs_withdraw(Token::Usdc, &Amount::from_u64(1), "0xdest").await.unwrap();
        let seen = Arc::new(Mutex::new(None));
        let seen_for_cb = seen.clone();
        let cb: TxBroadcastCallback = Arc::new(move |tx_id, raw_tx| {
            *seen_for_cb.lock().unwrap() = Some((tx_id.to_string(), raw_tx.to_string()));
        });
        let (tx_id, raw_tx) = sc.send_and_confirm(txs, cb).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), Some((tx_id, raw_tx)));
    }

    #[tokio::test]
    async fn lightning_payment_is_confirmed_immediately() {
        let ln = MockLightningBackend::new();
        let hash = ln.pay("lnbc-invoice").await.unwrap();
        let payment = ln.get_payment(&hash).await.unwrap().unwrap();
        assert!(payment.is_confirmed);
    }

    #[tokio::test]
    async fn exchange_trade_round_trips_to_filled() {
        let ex = MockExchange::new();
        let client_order_id = "order-1";
        ex.market_trade(Token::Btc, Token::Usdc, &Amount::from_u64(1), client_order_id)
            .await
            .unwrap();
        let trade = ex.get_trade(Token::Btc, Token::Usdc, client_order_id).await.unwrap().unwrap();
        assert_eq!(trade.state, TradeState::Filled);
    }

    #[tokio::test]
    async fn cancel_next_trade_is_one_shot() {
        let ex = MockExchange::new();
        ex.cancel_next_trade();
        ex.market_trade(Token::Btc, Token::Usdc, &Amount::from_u64(1), "order-a")
            .await
            .unwrap();
        ex.market_trade(Token::Btc, Token::Usdc, &Amount::from_u64(1), "order-b")
            .await
            .unwrap();
        let a = ex.get_trade(Token::Btc, Token::Usdc, "order-a").await.unwrap().unwrap();
        let b = ex.get_trade(Token::Btc, Token::Usdc, "order-b").await.unwrap().unwrap();
        assert_eq!(a.state, TradeState::Canceled);
        assert_eq!(b.state, TradeState::Filled);
    }

    #[tokio::test]
    async fn bitcoin_backend_reports_untracked_tx_only_when_default_confirmed() {
        let btc = MockBitcoinBackend::new();
        assert!(btc.get_transaction("unknown").await.unwrap().is_none());
        btc.set_default_confirmed(true);
        let tx = btc.get_transaction("unknown").await.unwrap().unwrap();
        assert!(tx.confirmations >= 1);
    }
}
