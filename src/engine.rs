//! The rebalancing state machine: the core of the crate.
//!
//! One `tick` dispatches on the live job's [`Phase`] and, on every successful transition,
//! re-enters the dispatch loop immediately rather than waiting for the next timer — implemented as
//! a bounded loop (not recursion) since the phase DAG has a small fixed depth. Adapter calls are
//! the only suspension points; the job itself lives behind a synchronous [`std::sync::Mutex`] so
//! the tx-replacement callback (invoked from arbitrary adapter-internal contexts, not necessarily
//! from inside a tick) can cheaply append a replacement candidate without an async rendezvous.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::adapters::{
    BitcoinBackend, Exchange, LightningBackend, SwapContract, TxBroadcastCallback, TxStatus,
};
use crate::error::{EngineError, ExchangeError};
use crate::idempotency::new_idempotency_key;
use crate::state::{now_unix_ms, Phase, RebalanceJob};
use crate::store::StateStore;
use crate::token::Token;

/// Hard ceiling on the number of transitions a single tick will walk before yielding back to the
/// timer. The phase DAG's longest path is 16 edges; this leaves headroom without risking runaway
/// looping on a transition bug.
const MAX_TRANSITIONS_PER_TICK: usize = 32;

/// CEX codes meaning "no such order", which the engine treats as grounds to retry from
/// `DEPOSIT_RECEIVED` rather than treating as a transport failure.
const ORDER_NOT_FOUND_CODES: [&str; 2] = ["52907", "51603"];

/// Which of a job's three candidate-transaction maps a pre-broadcast checkpoint writes into.
#[derive(Clone, Copy)]
enum CandidateSlot {
    ScWithdraw,
    Out,
    ScDeposit,
}

pub struct RebalanceEngine<SC, BTC, LN, EX> {
    swap_contract: SC,
    bitcoin: BTC,
    lightning: LN,
    exchange: EX,
    store: StateStore,
    job: Arc<Mutex<Option<RebalanceJob>>>,
    tick_lock: tokio::sync::Mutex<()>,
    retry_time: Duration,
    cooldown: Duration,
    sc_chain_name: String,
    token_addresses: HashMap<String, String>,
}

impl<SC, BTC, LN, EX> RebalanceEngine<SC, BTC, LN, EX>
where
    SC: SwapContract,
    BTC: BitcoinBackend,
    LN: LightningBackend,
    EX: Exchange,
{
    pub fn new(
        swap_contract: SC,
        bitcoin: BTC,
        lightning: LN,
        exchange: EX,
        store: StateStore,
        initial_job: Option<RebalanceJob>,
        retry_time: Duration,
        cooldown: Duration,
        sc_chain_name: String,
        token_addresses: HashMap<String, String>,
    ) -> Self {
        RebalanceEngine {
            swap_contract,
            bitcoin,
            lightning,
            exchange,
            store,
            job: Arc::new(Mutex::new(initial_job)),
            tick_lock: tokio::sync::Mutex::new(()),
            retry_time,
            cooldown,
            sc_chain_name,
            token_addresses,
        }
    }

    /// A clone of the shared job handle, for the Supervisor to wire into the tx-replace callback
    /// and for `BalanceMonitor` to inspect before seeding a new job.
    pub fn job_handle(&self) -> Arc<Mutex<Option<RebalanceJob>>> {
        self.job.clone()
    }

    fn snapshot(&self) -> Option<RebalanceJob> {
        self.job.lock().expect("job mutex poisoned").clone()
    }

    fn replace(&self, job: RebalanceJob) {
        *self.job.lock().expect("job mutex poisoned") = Some(job);
    }

    fn clear(&self) {
        *self.job.lock().expect("job mutex poisoned") = None;
    }

    /// Runs one tick: dispatches on the current phase, persisting and looping on every
    /// transition, until the job is absent, in cooldown, or no transition fires.
    pub async fn tick(&self) -> Result<(), EngineError> {
        let _guard = self.tick_lock.lock().await;

        let mut job = match self.snapshot() {
            Some(job) => job,
            None => return Ok(()),
        };

        if now_unix_ms() < job.cooldown_until_ms {
            return Ok(());
        }

        for _ in 0..MAX_TRANSITIONS_PER_TICK {
            job.check_required_fields().unwrap_or_else(|e| {
                error!(phase = job.phase.name(), error = %e, "required-field invariant violated");
                panic!("{e}");
            });

            let phase = job.phase;
            let outcome = self.step(job.clone()).await?;

            match outcome {
                Some(next) => {
                    self.persist(&next).await?;
                    let transitioned = next.phase != phase;
                    job = next;
                    if job.phase == Phase::Finished {
                        self.store.archive(&job).await?;
                        self.clear();
                        return Ok(());
                    }
                    if !transitioned {
                        self.replace(job);
                        return Ok(());
                    }
                }
                None => {
                    self.replace(job);
                    return Ok(());
                }
            }
        }

        warn!(phase = job.phase.name(), "hit max transitions in a single tick");
        self.replace(job);
        Ok(())
    }

    async fn persist(&self, job: &RebalanceJob) -> Result<(), EngineError> {
        self.store.save(job).await?;
        Ok(())
    }

    /// Dispatches a single phase. Returns `Ok(Some(job))` with a (possibly unchanged) job on a
    /// normal tick, or `Ok(None)` if the job was cleared (IDLE via an implicit abandon) this tick.
    async fn step(&self, job: RebalanceJob) -> Result<Option<RebalanceJob>, EngineError> {
        match job.phase {
            Phase::Idle => Ok(None),
            Phase::Triggered => self.enter_triggered(job).await,
            Phase::ScWithdrawing => self.poll_sc_withdrawing(job).await,
            Phase::ScWithdrawalConfirmed => self.enter_sc_withdrawal_confirmed(job).await,
            Phase::OutTx => self.poll_out_tx(job).await,
            Phase::OutTxConfirmed => self.poll_out_tx_confirmed(job).await,
            Phase::DepositReceived => self.enter_deposit_received(job).await,
            Phase::TradeExecuting => self.poll_trade_executing(job).await,
            Phase::TradeExecuted => self.enter_trade_executed(job).await,
            Phase::FundsTransfering => self.poll_funds_transfering(job).await,
            Phase::FundsTransfered => self.enter_funds_transfered(job).await,
            Phase::Withdrawing => self.poll_withdrawing(job).await,
            Phase::WithdrawalSent => self.poll_withdrawal_sent(job).await,
            Phase::InTxConfirmed => self.enter_in_tx_confirmed(job).await,
            Phase::ScDepositing => self.poll_sc_depositing(job).await,
            Phase::ScDeposited => self.enter_sc_deposited(job).await,
            Phase::Finished => Ok(Some(job)),
            Phase::Retrying => self.poll_retrying(job).await,
        }
    }

    fn retry(&self, mut job: RebalanceJob, target: Phase) -> RebalanceJob {
        job.retry_at_ms = Some(now_unix_ms() + self.retry_time.as_millis() as u64);
        job.retry_phase = Some(target);
        job.phase = Phase::Retrying;
        job
    }

    fn to_idle(&self, mut job: RebalanceJob) -> RebalanceJob {
        job.retry_at_ms = None;
        job.retry_phase = None;
        job.phase = Phase::Idle;
        job
    }

    fn with_cooldown(&self, mut job: RebalanceJob) -> RebalanceJob {
        job.cooldown_until_ms = now_unix_ms() + self.cooldown.as_millis() as u64;
        job
    }

    /// Builds the pre-broadcast checkpoint callback handed to `SwapContract::send_and_confirm`:
    /// on each invocation it records the candidate into the live job's `slot` map, advances the
    /// job to `next_phase`, and persists synchronously via `StateStore::save_sync` before
    /// returning — so a crash during a broadcast that per spec can take "seconds to hours" still
    /// leaves a durable record of the in-flight candidate, per §8 Testable Property #3.
    fn checkpoint_callback(&self, slot: CandidateSlot, next_phase: Phase) -> TxBroadcastCallback {
        let job = self.job.clone();
        let store = self.store.clone();
        let cooldown = self.cooldown;
        Arc::new(move |tx_id: &str, raw_tx: &str| {
            let mut guard = job.lock().expect("job mutex poisoned");
            let Some(job) = guard.as_mut() else { return };
            let map = match slot {
                CandidateSlot::ScWithdraw => &mut job.sc_withdraw_txs,
                CandidateSlot::Out => &mut job.out_txs,
                CandidateSlot::ScDeposit => &mut job.sc_deposit_txs,
            };
            map.insert(tx_id.to_string(), raw_tx.to_string());
            job.phase = next_phase;
            job.cooldown_until_ms = now_unix_ms() + cooldown.as_millis() as u64;
            let snapshot = job.clone();
            drop(guard);
            if let Err(e) = store.save_sync(&snapshot) {
                error!(error = %e, "failed to checkpoint broadcast candidate before it resolves");
            }
        })
    }

    fn token_address(&self, token: Token) -> Option<String> {
        self.token_addresses.get(token.as_str()).cloned()
    }

    // TRIGGERED -> OUT_TX | SC_WITHDRAWING
    async fn enter_triggered(&self, mut job: RebalanceJob) -> Result<Option<RebalanceJob>, EngineError> {
        let src = job.src_token.expect("checked by check_required_fields");
        let amount_out = job.amount_out.clone().expect("checked");

        if src.is_btc_like() {
            let deposit_address = self
                .exchange
                .get_deposit_address(src, None, if src == Token::BtcLn { Some(&amount_out) } else { None })
                .await?;

            job = self.with_cooldown(job);
            job.phase = Phase::OutTx;

            match src {
                Token::BtcLn => {
                    info!(amount = %amount_out, "entering OUT_TX via lightning payment");
                    if let Err(e) = validate_invoice_amount(&deposit_address, &amount_out) {
                        warn!(error = %e, "CEX lightning invoice amount mismatch; aborting to IDLE");
                        return Ok(Some(self.to_idle(job)));
                    }
                    match self.lightning.pay(&deposit_address).await {
                        Ok(payment_hash) => {
                            job.out_txs.insert(payment_hash, deposit_address);
                        }
                        Err(e) => {
                            warn!(error = %e, "lightning payment attempt failed; OUT_TX will reconcile to IDLE");
                        }
                    }
                }
                _ => {
                    let funded = self
                        .bitcoin
                        .fund_psbt(&[(deposit_address, amount_out.clone())], 1, 6)
                        .await;
                    let funded = match funded {
                        Ok(f) => f,
                        Err(e) => {
                            warn!(error = %e, "psbt funding failed");
                            return Ok(Some(self.to_idle(job)));
                        }
                    };
                    let signed = match self.bitcoin.sign_psbt(&funded.psbt).await {
                        Ok(s) => s,
                        Err(e) => {
                            warn!(error = %e, "psbt signing failed");
                            for lock in &funded.inputs {
                                let _ = self.bitcoin.unlock_utxo(lock).await;
                            }
                            return Ok(Some(self.to_idle(job)));
                        }
                    };
                    match self.bitcoin.broadcast_chain_transaction(&signed.transaction).await {
                        Ok(txid) => {
                            job.out_txs.insert(txid, signed.transaction);
                        }
                        Err(e) => {
                            warn!(error = %e, "broadcast failed; OUT_TX will reconcile to IDLE");
                            for lock in &funded.inputs {
                                let _ = self.bitcoin.unlock_utxo(lock).await;
                            }
                        }
                    }
                }
            }
            return Ok(Some(job));
        }

        // Smart-chain source: withdraw from the contract first.
        let to = self.swap_contract.get_address().await?;
        let txs = self.swap_contract.txs_withdraw(src, &amount_out, &to).await?;
        if txs.is_empty() {
            return Ok(Some(self.to_idle(job)));
        }
        let cb = self.checkpoint_callback(CandidateSlot::ScWithdraw, Phase::ScWithdrawing);
        match self.swap_contract.send_and_confirm(txs, cb).await {
            Ok((txid, raw_tx)) => {
                job.sc_withdraw_txs.insert(txid, raw_tx);
                job.phase = Phase::ScWithdrawing;
                job = self.with_cooldown(job);
                Ok(Some(job))
            }
            Err(e) => {
                warn!(error = %e, "smart-chain withdrawal broadcast failed");
                Ok(Some(self.to_idle(job)))
            }
        }
    }

    /// Shared "poll each candidate, first success wins, all-dead means give up" loop used by
    /// SC_WITHDRAWING and SC_DEPOSITING.
    async fn poll_sc_candidates(
        &self,
        candidates: &std::collections::BTreeMap<String, String>,
    ) -> Result<Option<String>, bool> {
        let mut any_pending = false;
        for (tx_id, _raw_tx) in candidates {
            let status = self.swap_contract.get_tx_id_status(tx_id).await;
            match status {
                Ok(TxStatus::Success) => return Ok(Some(tx_id.clone())),
                Ok(TxStatus::Pending) => any_pending = true,
                Ok(TxStatus::NotFound) | Ok(TxStatus::Reverted) | Err(_) => {}
            }
        }
        Err(!any_pending)
    }

    async fn poll_sc_withdrawing(&self, mut job: RebalanceJob) -> Result<Option<RebalanceJob>, EngineError> {
        match self.poll_sc_candidates(&job.sc_withdraw_txs).await {
            Ok(Some(tx_id)) => {
                job.sc_withdraw_tx_id = Some(tx_id);
                job.phase = Phase::ScWithdrawalConfirmed;
                Ok(Some(job))
            }
            Ok(None) => Ok(Some(job)),
            Err(all_dead) => {
                if all_dead {
                    job.sc_withdraw_txs.clear();
                    Ok(Some(self.to_idle(job)))
                } else {
                    Ok(Some(job))
                }
            }
        }
    }

    async fn enter_sc_withdrawal_confirmed(&self, mut job: RebalanceJob) -> Result<Option<RebalanceJob>, EngineError> {
        let src = job.src_token.expect("checked");
        let deposit_address = self
            .exchange
            .get_deposit_address(src, Some(&self.sc_chain_name), None)
            .await?;
        let amount_out = job.amount_out.clone().expect("checked");
        let txs = self.swap_contract.txs_transfer(src, &amount_out, &deposit_address).await?;
        if txs.is_empty() {
            return Ok(Some(job));
        }
        let cb = self.checkpoint_callback(CandidateSlot::Out, Phase::OutTx);
        match self.swap_contract.send_and_confirm(txs, cb).await {
            Ok((txid, raw_tx)) => {
                job.out_txs.insert(txid, raw_tx);
                job.phase = Phase::OutTx;
                job = self.with_cooldown(job);
            }
            Err(e) => warn!(error = %e, "smart-chain transfer broadcast failed"),
        }
        Ok(Some(job))
    }

    async fn poll_out_tx(&self, mut job: RebalanceJob) -> Result<Option<RebalanceJob>, EngineError> {
        let src = job.src_token.expect("checked");
        match src {
            Token::Btc => {
                let Some((txid, _raw)) = job.out_txs.iter().next().map(|(k, v)| (k.clone(), v.clone())) else {
                    return Ok(Some(self.to_idle(job)));
                };
                match self.bitcoin.get_transaction(&txid).await? {
                    Some(tx) if tx.confirmations >= 1 => {
                        job.out_tx_id = Some(txid);
                        job.phase = Phase::OutTxConfirmed;
                    }
                    Some(_) => {}
                    None => return Ok(Some(self.to_idle(job))),
                }
                Ok(Some(job))
            }
            Token::BtcLn => {
                let Some(payment_hash) = job.out_txs.keys().next().cloned() else {
                    return Ok(Some(self.to_idle(job)));
                };
                match self.lightning.get_payment(&payment_hash).await? {
                    Some(p) if p.is_failed => Ok(Some(self.to_idle(job))),
                    Some(p) if p.is_confirmed => {
                        job.out_tx_id = Some(payment_hash);
                        job.phase = Phase::OutTxConfirmed;
                        Ok(Some(job))
                    }
                    _ => Ok(Some(job)),
                }
            }
            _ => match self.poll_sc_candidates(&job.out_txs).await {
                Ok(Some(tx_id)) => {
                    job.out_tx_id = Some(tx_id);
                    job.phase = Phase::OutTxConfirmed;
                    Ok(Some(job))
                }
                Ok(None) => Ok(Some(job)),
                Err(all_dead) => {
                    if all_dead {
                        Ok(Some(self.retry(job, Phase::ScWithdrawalConfirmed)))
                    } else {
                        Ok(Some(job))
                    }
                }
            },
        }
    }

    async fn poll_out_tx_confirmed(&self, mut job: RebalanceJob) -> Result<Option<RebalanceJob>, EngineError> {
        let out_tx_id = job.out_tx_id.clone().expect("checked");
        if let Some(deposit) = self.exchange.get_deposit(&out_tx_id).await? {
            use crate::adapters::DepositState::*;
            if matches!(deposit.state, CreditedNotWithdrawable | Success) {
                job.deposit_id = Some(deposit.deposit_id);
                job.phase = Phase::DepositReceived;
            }
        }
        Ok(Some(job))
    }

    async fn enter_deposit_received(&self, mut job: RebalanceJob) -> Result<Option<RebalanceJob>, EngineError> {
        let src = job.src_token.expect("checked");
        let dst = job.dst_token.expect("checked");
        let amount_out = job.amount_out.clone().expect("checked");

        let client_order_id = new_idempotency_key();
        job.client_order_id = Some(client_order_id.clone());
        job.phase = Phase::TradeExecuting;
        job = self.with_cooldown(job);

        if let Err(e) = self
            .exchange
            .market_trade(src, dst, &amount_out, &client_order_id)
            .await
        {
            warn!(error = %e, "market order submission failed; reconciled on next tick");
        }
        Ok(Some(job))
    }

    async fn poll_trade_executing(&self, mut job: RebalanceJob) -> Result<Option<RebalanceJob>, EngineError> {
        let src = job.src_token.expect("checked");
        let dst = job.dst_token.expect("checked");
        let client_order_id = job.client_order_id.clone().expect("checked");

        let trade = self.exchange.get_trade(src, dst, &client_order_id).await;
        let trade = match trade {
            Ok(t) => t,
            Err(ExchangeError::Venue { code, .. }) if ORDER_NOT_FOUND_CODES.contains(&code.as_str()) => {
                return Ok(Some(self.retry(job, Phase::DepositReceived)));
            }
            Err(e) => return Err(e.into()),
        };

        use crate::adapters::TradeState::*;
        match trade {
            Some(t) if matches!(t.state, Canceled | MmpCanceled) => {
                Ok(Some(self.retry(job, Phase::DepositReceived)))
            }
            Some(t) if t.state == Filled => {
                job.order_id = Some(t.order_id);
                job.price = Some(t.average_price);
                job.amount_in = Some(
                    self.exchange
                        .get_balance(dst, crate::adapters::SubAccount::Trading)
                        .await?,
                );
                job.phase = Phase::TradeExecuted;
                Ok(Some(job))
            }
            _ => Ok(Some(job)),
        }
    }

    async fn enter_trade_executed(&self, mut job: RebalanceJob) -> Result<Option<RebalanceJob>, EngineError> {
        let dst = job.dst_token.expect("checked");
        let amount_in = job.amount_in.clone().expect("checked");

        let client_transfer_id = new_idempotency_key();
        job.client_transfer_id = Some(client_transfer_id.clone());
        job.phase = Phase::FundsTransfering;
        job = self.with_cooldown(job);

        if let Err(e) = self
            .exchange
            .funds_transfer(
                dst,
                crate::adapters::SubAccount::Trading,
                crate::adapters::SubAccount::Funding,
                &amount_in,
                &client_transfer_id,
            )
            .await
        {
            warn!(error = %e, "funds transfer submission failed; reconciled on next tick");
        }
        Ok(Some(job))
    }

    async fn poll_funds_transfering(&self, mut job: RebalanceJob) -> Result<Option<RebalanceJob>, EngineError> {
        let client_transfer_id = job.client_transfer_id.clone().expect("checked");
        let transfer = self.exchange.get_funds_transfer(&client_transfer_id).await?;

        use crate::adapters::FundsTransferState::*;
        match transfer {
            None => Ok(Some(self.retry(job, Phase::TradeExecuted))),
            Some(t) if t.state == Failed => Ok(Some(self.retry(job, Phase::TradeExecuted))),
            Some(t) if t.state == Success => {
                job.transfer_id = Some(t.transfer_id);
                job.phase = Phase::FundsTransfered;
                Ok(Some(job))
            }
            _ => Ok(Some(job)),
        }
    }

    async fn enter_funds_transfered(&self, mut job: RebalanceJob) -> Result<Option<RebalanceJob>, EngineError> {
        let dst = job.dst_token.expect("checked");
        let amount_in = job.amount_in.clone().expect("checked");

        let withdrawal_fee = self
            .exchange
            .get_withdrawal_fee(dst, &self.sc_chain_name, Some(&amount_in))
            .await?;

        let receiving_address = match dst {
            Token::Btc => self
                .bitcoin
                .get_chain_addresses()
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| EngineError::Bitcoin("wallet returned no address".to_string()))?,
            Token::BtcLn => {
                let net = amount_in
                    .checked_sub(&withdrawal_fee)
                    .ok_or(EngineError::Underflow("amount_in - withdrawal_fee"))?;
                let sats: u64 = net
                    .to_decimal(0)
                    .parse()
                    .map_err(|_| EngineError::Lightning("invalid satoshi amount".to_string()))?;
                let mtokens = sats.saturating_mul(1000);
                let invoice = self.lightning.create_invoice(mtokens).await?;
                invoice.request
            }
            other => self.token_address(other).unwrap_or_default(),
        };

        let withdrawal_id = new_idempotency_key();
        let net = amount_in
            .checked_sub(&withdrawal_fee)
            .ok_or(EngineError::Underflow("amount_in - withdrawal_fee"))?;

        job.receiving_address = Some(receiving_address.clone());
        job.withdrawal_fee = Some(withdrawal_fee.clone());
        job.withdrawal_id = Some(withdrawal_id.clone());
        job.phase = Phase::Withdrawing;
        job = self.with_cooldown(job);

        if let Err(e) = self
            .exchange
            .withdraw(dst, &self.sc_chain_name, &receiving_address, &withdrawal_id, &withdrawal_fee, &net)
            .await
        {
            warn!(error = %e, "withdrawal submission failed; reconciled on next tick");
        }
        Ok(Some(job))
    }

    async fn poll_withdrawing(&self, mut job: RebalanceJob) -> Result<Option<RebalanceJob>, EngineError> {
        let withdrawal_id = job.withdrawal_id.clone().expect("checked");
        let withdrawal = self.exchange.get_withdrawal(&withdrawal_id).await?;

        use crate::adapters::WithdrawalState::*;
        match withdrawal {
            None => Ok(Some(self.retry(job, Phase::FundsTransfered))),
            Some(w) if matches!(w.state, FailedInsufficientBalance | FailedRiskControl | FailedOther) => {
                Ok(Some(self.retry(job, Phase::FundsTransfered)))
            }
            Some(w) if w.state == Completed => {
                job.in_tx_id = w.tx_id;
                job.phase = Phase::WithdrawalSent;
                Ok(Some(job))
            }
            _ => Ok(Some(job)),
        }
    }

    async fn poll_withdrawal_sent(&self, mut job: RebalanceJob) -> Result<Option<RebalanceJob>, EngineError> {
        let dst = job.dst_token.expect("checked");
        let Some(in_tx_id) = job.in_tx_id.clone() else {
            return Ok(Some(self.retry(job, Phase::Withdrawing)));
        };

        match dst {
            Token::Btc => match self.bitcoin.get_transaction(&in_tx_id).await? {
                None => Ok(Some(self.retry(job, Phase::Withdrawing))),
                Some(tx) if tx.confirmations >= 1 => {
                    job.phase = Phase::InTxConfirmed;
                    Ok(Some(job))
                }
                Some(_) => Ok(Some(job)),
            },
            Token::BtcLn => {
                let invoice = self.lightning.get_invoice(&in_tx_id).await?;
                if invoice.is_confirmed {
                    job.phase = Phase::InTxConfirmed;
                    Ok(Some(job))
                } else if invoice.is_canceled {
                    Ok(Some(self.retry(job, Phase::Withdrawing)))
                } else {
                    Ok(Some(job))
                }
            }
            _ => match self.swap_contract.get_tx_id_status(&in_tx_id).await? {
                TxStatus::Success => {
                    job.phase = Phase::InTxConfirmed;
                    Ok(Some(job))
                }
                TxStatus::Reverted => Ok(Some(self.retry(job, Phase::Withdrawing))),
                TxStatus::Pending | TxStatus::NotFound => Ok(Some(job)),
            },
        }
    }

    async fn enter_in_tx_confirmed(&self, mut job: RebalanceJob) -> Result<Option<RebalanceJob>, EngineError> {
        let dst = job.dst_token.expect("checked");
        if dst.is_btc_like() {
            job.phase = Phase::Finished;
            return Ok(Some(job));
        }

        let amount_in = job.amount_in.clone().expect("checked");
        let withdrawal_fee = job.withdrawal_fee.clone().expect("checked");
        let net = amount_in
            .checked_sub(&withdrawal_fee)
            .ok_or(EngineError::Underflow("amount_in - withdrawal_fee"))?;

        let txs = self.swap_contract.txs_deposit(dst, &net).await?;
        if txs.is_empty() {
            return Ok(Some(job));
        }
        let cb = self.checkpoint_callback(CandidateSlot::ScDeposit, Phase::ScDepositing);
        match self.swap_contract.send_and_confirm(txs, cb).await {
            Ok((txid, raw_tx)) => {
                job.sc_deposit_txs.insert(txid, raw_tx);
                job.phase = Phase::ScDepositing;
                job = self.with_cooldown(job);
            }
            Err(e) => warn!(error = %e, "smart-chain deposit broadcast failed"),
        }
        Ok(Some(job))
    }

    async fn poll_sc_depositing(&self, mut job: RebalanceJob) -> Result<Option<RebalanceJob>, EngineError> {
        match self.poll_sc_candidates(&job.sc_deposit_txs).await {
            Ok(Some(tx_id)) => {
                job.sc_deposit_tx_id = Some(tx_id);
                job.phase = Phase::ScDeposited;
                Ok(Some(job))
            }
            Ok(None) => Ok(Some(job)),
            Err(all_dead) => {
                if all_dead {
                    Ok(Some(self.retry(job, Phase::InTxConfirmed)))
                } else {
                    Ok(Some(job))
                }
            }
        }
    }

    async fn enter_sc_deposited(&self, mut job: RebalanceJob) -> Result<Option<RebalanceJob>, EngineError> {
        job.phase = Phase::Finished;
        Ok(Some(job))
    }

    async fn poll_retrying(&self, job: RebalanceJob) -> Result<Option<RebalanceJob>, EngineError> {
        let Some(retry_at) = job.retry_at_ms else {
            return Ok(Some(job));
        };
        if now_unix_ms() >= retry_at {
            let mut job = job;
            job.phase = job.retry_phase.expect("checked");
            job.retry_at_ms = None;
            job.retry_phase = None;
            Ok(Some(job))
        } else {
            Ok(Some(job))
        }
    }

    /// Seeds a fresh job. Only valid when no job is currently in flight (BalanceMonitor's
    /// responsibility to check before calling this).
    pub async fn seed(&self, job: RebalanceJob) -> Result<(), EngineError> {
        debug!(
            src = ?job.src_token,
            dst = ?job.dst_token,
            amount_out = ?job.amount_out,
            "seeding rebalance job"
        );
        self.store.save(&job).await?;
        self.replace(job);
        Ok(())
    }
}

/// Verifies a CEX-issued BOLT-11 invoice actually encodes `expected` satoshis before the engine
/// pays it, closing the distilled spec's noted gap around unchecked LN deposit-address amounts.
fn validate_invoice_amount(invoice: &str, expected: &crate::amount::Amount) -> Result<(), EngineError> {
    let expected_sats: u64 = expected
        .to_decimal(0)
        .parse()
        .map_err(|_| EngineError::Lightning("invalid expected amount".to_string()))?;
    let got_sats = parse_bolt11_amount_sats(invoice).ok_or_else(|| EngineError::InvoiceAmountMismatch {
        invoice: invoice.to_string(),
        requested: expected_sats.to_string(),
    })?;
    if got_sats != expected_sats {
        return Err(EngineError::InvoiceAmountMismatch {
            invoice: invoice.to_string(),
            requested: expected_sats.to_string(),
        });
    }
    Ok(())
}

/// Extracts the amount, in satoshis, encoded in a BOLT-11 invoice's human-readable part
/// (`lnbc<amount><multiplier>1...`). The bech32 data part never contains the digit-free
/// character `1`, so the last `1` in the string is always the HRP/data separator.
fn parse_bolt11_amount_sats(invoice: &str) -> Option<u64> {
    let sep = invoice.rfind('1')?;
    let hrp = &invoice[..sep];
    let rest = hrp.strip_prefix("ln")?;
    let digits_start = rest.find(|c: char| c.is_ascii_digit())?;
    let (_prefix, amount_part) = rest.split_at(digits_start);
    let multiplier = amount_part.chars().last().filter(|c| c.is_alphabetic());
    let digits: String = amount_part.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    let amount: u64 = digits.parse().ok()?;
    // BOLT-11 §"Requirements": amount is denominated in whole bitcoin absent a multiplier; each
    // multiplier scales a millisatoshi value, which this function then converts down to satoshis.
    let msat = match multiplier {
        None => amount.checked_mul(100_000_000_000)?,
        Some('m') => amount.checked_mul(100_000_000)?,
        Some('u') => amount.checked_mul(100_000)?,
        Some('n') => amount.checked_mul(100)?,
        Some('p') => amount.checked_div(10)?,
        Some(_) => return None,
    };
    Some(msat / 1000)
}

/// Inserts a replacement candidate into whichever candidate map currently holds `old_tx_id` and
/// extends the job's cooldown. Registered with `SwapContract::on_before_tx_replace` by the
/// Supervisor at startup; per §4.3, the engine itself — not the caller — determines the target map
/// by checking membership, since a real `SwapContract` only knows about raw transactions and
/// txids, never engine-internal phase labels.
pub fn handle_tx_replace(
    job: &Arc<Mutex<Option<RebalanceJob>>>,
    cooldown: Duration,
    old_tx_id: &str,
    new_tx_id: &str,
    new_raw_tx: &str,
) {
    let mut guard = job.lock().expect("job mutex poisoned");
    let Some(job) = guard.as_mut() else { return };
    let map = [
        &mut job.sc_withdraw_txs,
        &mut job.out_txs,
        &mut job.sc_deposit_txs,
    ]
    .into_iter()
    .find(|map| map.contains_key(old_tx_id));
    let Some(map) = map else { return };
    map.remove(old_tx_id);
    map.insert(new_tx_id.to_string(), new_raw_tx.to_string());
    job.cooldown_until_ms = now_unix_ms() + cooldown.as_millis() as u64;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::mocks::{MockBitcoinBackend, MockExchange, MockLightningBackend, MockSwapContract};
    use crate::adapters::{SubAccount, WithdrawalState};

    type TestEngine = RebalanceEngine<MockSwapContract, MockBitcoinBackend, MockLightningBackend, MockExchange>;

    fn build_engine(
        token_addresses: HashMap<String, String>,
    ) -> (TestEngine, tempfile::TempDir, MockSwapContract, MockBitcoinBackend, MockLightningBackend, MockExchange) {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"), dir.path().join("archive"));
        let sc = MockSwapContract::new();
        let btc = MockBitcoinBackend::new();
        let ln = MockLightningBackend::new();
        let ex = MockExchange::new();
        let engine = RebalanceEngine::new(
            sc.clone(),
            btc.clone(),
            ln.clone(),
            ex.clone(),
            store,
            None,
            Duration::from_secs(15),
            Duration::ZERO,
            "smartchain".to_string(),
            token_addresses,
        );
        (engine, dir, sc, btc, ln, ex)
    }

    fn snapshot(engine: &TestEngine) -> Option<RebalanceJob> {
        engine.job_handle().lock().unwrap().clone()
    }

    // S1: BTC -> USDC happy path, start to finish, in one tick given every rail auto-confirms.
    #[tokio::test]
    async fn s1_btc_to_usdc_happy_path_reaches_finished_and_archives() {
        let mut token_addresses = HashMap::new();
        token_addresses.insert("USDC".to_string(), "0xusdc-dest".to_string());
        let (engine, dir, sc, _btc, _ln, ex) = build_engine(token_addresses);

        sc.set_default_confirmed(true);
        ex.set_balance(Token::Usdc, SubAccount::Trading, Amount::from_u64(99_000_000));

        let job = RebalanceJob::new_triggered(Token::Btc, None, Token::Usdc, None, Amount::from_u64(100_000));
        engine.seed(job).await.unwrap();

        for _ in 0..5 {
            engine.tick().await.unwrap();
            if snapshot(&engine).is_none() {
                break;
            }
        }

        assert!(snapshot(&engine).is_none(), "job should have reached FINISHED and been cleared");
        let archived = std::fs::read_dir(dir.path().join("archive")).unwrap().count();
        assert_eq!(archived, 1, "expected exactly one archived document");
    }

    // S2: a CEX-canceled trade retries from DEPOSIT_RECEIVED with a fresh client order id.
    #[tokio::test]
    async fn s2_ln_trade_cancellation_retries_with_a_fresh_client_order_id() {
        let (engine, _dir, _sc, _btc, _ln, ex) = build_engine(HashMap::new());

        let job = RebalanceJob {
            phase: Phase::DepositReceived,
            src_token: Some(Token::BtcLn),
            dst_token: Some(Token::Usdc),
            amount_out: Some(Amount::from_u64(50_000)),
            deposit_id: Some("deposit-1".to_string()),
            ..Default::default()
        };
        engine.seed(job).await.unwrap();

        ex.cancel_next_trade();
        engine.tick().await.unwrap();

        let after_cancel = snapshot(&engine).unwrap();
        assert_eq!(after_cancel.phase, Phase::Retrying);
        assert_eq!(after_cancel.retry_phase, Some(Phase::DepositReceived));

        let first_order_ids = ex.trade_keys();
        assert_eq!(first_order_ids.len(), 1);
        let first_order_id = first_order_ids[0].clone();
        let canceled = ex
            .get_trade(Token::BtcLn, Token::Usdc, &first_order_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(canceled.state, crate::adapters::TradeState::Canceled);

        // Let the retry fall due and avoid an unrelated underflow a few phases downstream.
        ex.set_balance(Token::Usdc, SubAccount::Trading, Amount::from_u64(10_000));
        engine.job_handle().lock().unwrap().as_mut().unwrap().retry_at_ms = Some(0);
        engine.tick().await.unwrap();

        let order_ids = ex.trade_keys();
        assert_eq!(order_ids.len(), 2, "expected a second, freshly-keyed trade attempt");
        let second_order_id = order_ids.into_iter().find(|id| *id != first_order_id).unwrap();
        assert_ne!(first_order_id, second_order_id);
        let filled = ex
            .get_trade(Token::BtcLn, Token::Usdc, &second_order_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(filled.state, crate::adapters::TradeState::Filled);
    }

    // S3: a smart-chain withdrawal that reverts before reaching the CEX returns to IDLE and
    // clears its stale candidates.
    #[tokio::test]
    async fn s3_reverted_sc_withdrawal_returns_to_idle() {
        let (engine, _dir, sc, _btc, _ln, _ex) = build_engine(HashMap::new());

        let mut sc_withdraw_txs = std::collections::BTreeMap::new();
        sc_withdraw_txs.insert("tx1".to_string(), "raw1".to_string());
        let job = RebalanceJob {
            phase: Phase::ScWithdrawing,
            src_token: Some(Token::Usdc),
            dst_token: Some(Token::Btc),
            amount_out: Some(Amount::from_u64(1)),
            sc_withdraw_txs,
            ..Default::default()
        };
        engine.seed(job).await.unwrap();

        sc.revert("tx1");
        engine.tick().await.unwrap();

        let after = snapshot(&engine).unwrap();
        assert_eq!(after.phase, Phase::Idle);
        assert!(after.sc_withdraw_txs.is_empty());
    }

    // S4: a replacement transaction injected mid-OUT_TX is picked up on the next tick, and the
    // confirmed replacement (not the original) becomes `out_tx_id`.
    #[tokio::test]
    async fn s4_tx_replacement_during_out_tx_resolves_to_the_replacement() {
        let (engine, _dir, sc, _btc, _ln, ex) = build_engine(HashMap::new());

        let mut out_txs = std::collections::BTreeMap::new();
        out_txs.insert("t1".to_string(), "raw1".to_string());
        let job = RebalanceJob {
            phase: Phase::OutTx,
            src_token: Some(Token::Usdc),
            dst_token: Some(Token::Eth),
            amount_out: Some(Amount::from_u64(1)),
            out_txs,
            ..Default::default()
        };
        engine.seed(job).await.unwrap();
        ex.set_balance(Token::Eth, SubAccount::Trading, Amount::from_u64(10_000));

        sc.set_tx_status("t1", TxStatus::Pending);
        engine.tick().await.unwrap();
        assert_eq!(snapshot(&engine).unwrap().phase, Phase::OutTx, "t1 still pending, no transition yet");

        handle_tx_replace(&engine.job_handle(), Duration::ZERO, "t1", "t2", "raw2");
        let after_replace = snapshot(&engine).unwrap();
        assert!(!after_replace.out_txs.contains_key("t1"));
        assert!(after_replace.out_txs.contains_key("t2"));

        sc.set_tx_status("t2", TxStatus::Success);
        engine.tick().await.unwrap();

        let after = snapshot(&engine).unwrap();
        assert_eq!(after.out_tx_id, Some("t2".to_string()));
    }

    // S5: a withdrawal the venue fails outright retries from FUNDS_TRANSFERED and eventually
    // mints a new withdrawal id distinct from the failed one.
    #[tokio::test]
    async fn s5_failed_withdrawal_retries_and_mints_a_new_withdrawal_id() {
        let mut token_addresses = HashMap::new();
        token_addresses.insert("USDC".to_string(), "0xusdc-dest".to_string());
        let (engine, _dir, _sc, _btc, _ln, ex) = build_engine(token_addresses);

        let job = RebalanceJob {
            phase: Phase::Withdrawing,
            src_token: Some(Token::Eth),
            dst_token: Some(Token::Usdc),
            amount_out: Some(Amount::from_u64(1)),
            amount_in: Some(Amount::from_u64(50_000)),
            transfer_id: Some("transfer-1".to_string()),
            receiving_address: Some("0xusdc-dest".to_string()),
            withdrawal_fee: Some(Amount::from_u64(1000)),
            withdrawal_id: Some("wid1".to_string()),
            ..Default::default()
        };
        engine.seed(job).await.unwrap();

        ex.set_withdrawal(
            "wid1",
            crate::adapters::Withdrawal { tx_id: None, state: WithdrawalState::FailedOther },
        );
        engine.tick().await.unwrap();

        let after_fail = snapshot(&engine).unwrap();
        assert_eq!(after_fail.phase, Phase::Retrying);
        assert_eq!(after_fail.retry_phase, Some(Phase::FundsTransfered));

        engine.job_handle().lock().unwrap().as_mut().unwrap().retry_at_ms = Some(0);
        engine.tick().await.unwrap();

        let after_retry = snapshot(&engine).unwrap();
        let new_withdrawal_id = after_retry.withdrawal_id.expect("a withdrawal id should have been minted");
        assert_ne!(new_withdrawal_id, "wid1");
    }

    // S6: the decimal round-trip boundary, exercised where the engine actually uses it - the
    // fee-equals-principal edge case must net to zero, not underflow.
    #[tokio::test]
    async fn s6_withdrawal_fee_equal_to_amount_in_nets_to_zero_without_underflow() {
        let mut token_addresses = HashMap::new();
        token_addresses.insert("USDC".to_string(), "0xusdc-dest".to_string());
        let (engine, _dir, _sc, _btc, _ln, _ex) = build_engine(token_addresses);

        let job = RebalanceJob {
            phase: Phase::FundsTransfered,
            src_token: Some(Token::Btc),
            dst_token: Some(Token::Usdc),
            amount_out: Some(Amount::from_u64(1)),
            amount_in: Some(Amount::from_u64(1000)),
            transfer_id: Some("transfer-1".to_string()),
            ..Default::default()
        };
        engine.seed(job).await.unwrap();

        engine.tick().await.unwrap();

        let after = snapshot(&engine).unwrap();
        assert_ne!(after.phase, Phase::FundsTransfered, "should have advanced without erroring");
    }

    #[tokio::test]
    async fn idempotency_key_is_stable_while_a_trade_is_still_pending() {
        let (engine, _dir, _sc, _btc, _ln, _ex) = build_engine(HashMap::new());

        let job = RebalanceJob {
            phase: Phase::TradeExecuting,
            src_token: Some(Token::Btc),
            dst_token: Some(Token::Usdc),
            amount_out: Some(Amount::from_u64(1)),
            client_order_id: Some("fixed-client-order-id".to_string()),
            ..Default::default()
        };
        engine.seed(job).await.unwrap();

        engine.tick().await.unwrap();

        let after = snapshot(&engine).unwrap();
        assert_eq!(after.phase, Phase::TradeExecuting);
        assert_eq!(after.client_order_id.as_deref(), Some("fixed-client-order-id"));
    }

    #[tokio::test]
    async fn persisted_job_survives_a_simulated_process_restart() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"), dir.path().join("archive"));
        let sc = MockSwapContract::new();
        let btc = MockBitcoinBackend::new();
        let ln = MockLightningBackend::new();
        let ex = MockExchange::new();
        let engine: TestEngine = RebalanceEngine::new(
            sc,
            btc,
            ln,
            ex,
            store,
            None,
            Duration::from_secs(15),
            Duration::ZERO,
            "smartchain".to_string(),
            HashMap::new(),
        );

        let job = RebalanceJob {
            phase: Phase::TradeExecuting,
            src_token: Some(Token::Btc),
            dst_token: Some(Token::Usdc),
            amount_out: Some(Amount::from_u64(1)),
            client_order_id: Some("order-xyz".to_string()),
            ..Default::default()
        };
        engine.seed(job).await.unwrap();
        drop(engine);

        let resumed_store = StateStore::new(dir.path().join("state.json"), dir.path().join("archive"));
        let resumed = resumed_store.load().await.unwrap().expect("job persisted across restart");
        assert_eq!(resumed.phase, Phase::TradeExecuting);
        assert_eq!(resumed.client_order_id.as_deref(), Some("order-xyz"));
    }

    #[test]
    fn bolt11_amount_parsing_handles_every_multiplier() {
        assert_eq!(parse_bolt11_amount_sats("lnbc2500u1p3xnhl2pp5"), Some(250_000));
        assert_eq!(parse_bolt11_amount_sats("lnbc1m1p3xnhl2pp5"), Some(100_000));
        assert_eq!(parse_bolt11_amount_sats("lnbc10n1mockinvoice"), Some(1));
        assert_eq!(parse_bolt11_amount_sats("lnbc1231p1xnhl2pp5"), Some(0));
        assert_eq!(parse_bolt11_amount_sats("not-an-invoice"), None);
    }

    // `handle_tx_replace` must determine the target map itself by scanning for `old_tx_id`,
    // never from a caller-supplied label — a real `SwapContract` has no notion of engine phases.
    #[test]
    fn handle_tx_replace_finds_the_candidate_regardless_of_which_map_holds_it() {
        let mut sc_deposit_txs = std::collections::BTreeMap::new();
        sc_deposit_txs.insert("d1".to_string(), "rawd1".to_string());
        let job = Arc::new(Mutex::new(Some(RebalanceJob {
            phase: Phase::ScDepositing,
            sc_deposit_txs,
            ..Default::default()
        })));

        handle_tx_replace(&job, Duration::ZERO, "d1", "d2", "rawd2");

        let after = job.lock().unwrap().clone().unwrap();
        assert!(!after.sc_deposit_txs.contains_key("d1"));
        assert_eq!(after.sc_deposit_txs.get("d2"), Some(&"rawd2".to_string()));
    }

    #[test]
    fn handle_tx_replace_is_a_no_op_when_old_tx_id_is_unknown() {
        let job = Arc::new(Mutex::new(Some(RebalanceJob {
            phase: Phase::OutTx,
            ..Default::default()
        })));

        handle_tx_replace(&job, Duration::ZERO, "nonexistent", "new", "rawnew");

        let after = job.lock().unwrap().clone().unwrap();
        assert!(after.out_txs.is_empty());
    }
}
