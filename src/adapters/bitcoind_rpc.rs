//! [`BitcoinBackend`] implementation against a `bitcoind`-style JSON-RPC wallet endpoint.
//!
//! The request/response/retry shape here is carried over from this crate's `bitcoind` RPC
//! heritage: a monotonically increasing request id, a bounded-retry loop that distinguishes
//! transient transport failure (connection/timeout/decode errors) from unrecoverable failure
//! (body/status/builder/redirect errors, or a structured RPC error payload), and a thin envelope
//! type matching `bitcoind`'s `{result, error, id}` JSON-RPC response shape.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose, Engine};
use reqwest::header::{HeaderMap, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client as ReqwestClient;
use serde::{de, Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::sleep;
use tracing::{trace, warn};

use crate::amount::Amount;
use crate::config::BitcoinAuth;
use crate::error::EngineError;

use super::bitcoin_backend::{BitcoinBackend, ChainTransaction, FundedPsbt, SignedPsbt, UtxoLock};

const DEFAULT_MAX_RETRIES: u8 = 3;
const DEFAULT_RETRY_INTERVAL_MS: u64 = 1_000;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
struct Response<R> {
    pub result: Option<R>,
    pub error: Option<RpcError>,
    pub id: u64,
}

fn to_value<T: Serialize>(value: T) -> Result<Value, EngineError> {
    serde_json::to_value(value)
        .map_err(|e| EngineError::Bitcoin(format!("error creating rpc value: {e}")))
}

pub struct BitcoindRpcBackend {
    url: String,
    client: ReqwestClient,
    id: Arc<AtomicUsize>,
    max_retries: u8,
    retry_interval: u64,
}

impl BitcoindRpcBackend {
    pub fn new(url: String, auth: BitcoinAuth) -> Result<Self, EngineError> {
        let content_type = "application/json"
            .parse()
            .map_err(|_| EngineError::Bitcoin("error parsing header".to_string()))?;
        let mut headers = HeaderMap::from_iter([(CONTENT_TYPE, content_type)]);

        let user_pass = match auth {
            BitcoinAuth::None => None,
            BitcoinAuth::UserPass(u, p) => Some((u, p)),
            BitcoinAuth::CookieFile(path) => {
                use std::io::BufRead;
                let line = std::io::BufReader::new(
                    std::fs::File::open(&path)
                        .map_err(|e| EngineError::Bitcoin(format!("cookie file: {e}")))?,
                )
                .lines()
                .next()
                .ok_or_else(|| EngineError::Bitcoin("invalid cookie file".to_string()))?
                .map_err(|e| EngineError::Bitcoin(e.to_string()))?;
                let colon = line
                    .find(':')
                    .ok_or_else(|| EngineError::Bitcoin("invalid cookie file".to_string()))?;
                Some((line[..colon].to_string(), line[colon + 1..].to_string()))
            }
        };

        if let Some((user, pass)) = user_pass {
            let encoded = general_purpose::STANDARD.encode(format!("{user}:{pass}"));
            let authorization = format!("Basic {encoded}")
                .parse()
                .map_err(|_| EngineError::Bitcoin("error parsing header".to_string()))?;
            headers.insert(AUTHORIZATION, authorization);
        }

        let client = ReqwestClient::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| EngineError::Bitcoin(format!("could not create client: {e}")))?;

        Ok(BitcoindRpcBackend {
            url,
            client,
            id: Arc::new(AtomicUsize::new(0)),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_interval: DEFAULT_RETRY_INTERVAL_MS,
        })
    }

    fn next_id(&self) -> usize {
        self.id.fetch_add(1, Ordering::AcqRel)
    }

    async fn call<T: de::DeserializeOwned + fmt::Debug>(
        &self,
        method: &str,
        params: &[Value],
    ) -> Result<T, EngineError> {
        let mut retries = 0;
        loop {
            let id = self.next_id();
            trace!(%method, ?params, %retries, "calling bitcoind");

            let response = self
                .client
                .post(&self.url)
                .json(&json!({
                    "jsonrpc": "1.0",
                    "id": id,
                    "method": method,
                    "params": params,
                }))
                .send()
                .await;

            match response {
                Ok(resp) => {
                    let resp = match resp.error_for_status() {
                        Ok(resp) => resp,
                        Err(e) if e.is_status() => {
                            let status = e.status().map(|s| s.as_u16()).unwrap_or(0);
                            return Err(EngineError::Bitcoin(format!("http status {status}")));
                        }
                        Err(e) => return Err(EngineError::Bitcoin(e.to_string())),
                    };
                    let raw = resp
                        .text()
                        .await
                        .map_err(|e| EngineError::Bitcoin(format!("read body: {e}")))?;
                    let data: Response<T> = serde_json::from_str(&raw)
                        .map_err(|e| EngineError::Bitcoin(format!("parse response: {e}")))?;
                    if let Some(err) = data.error {
                        return Err(EngineError::Bitcoin(format!(
                            "rpc error {}: {}",
                            err.code, err.message
                        )));
                    }
                    return data
                        .result
                        .ok_or_else(|| EngineError::Bitcoin("empty rpc result".to_string()));
                }
                Err(err) => {
                    if err.is_body() || err.is_builder() || err.is_redirect() {
                        return Err(EngineError::Bitcoin(err.to_string()));
                    }
                    // Connection, timeout, decode, and generic request errors are all treated as
                    // possibly transient; the retry loop below re-attempts with backoff.
                    warn!(error = %err, retries, "bitcoind rpc call failed, retrying");
                }
            }

            retries += 1;
            if retries >= self.max_retries {
                return Err(EngineError::Bitcoin(format!(
                    "max retries ({}) exceeded calling {method}",
                    self.max_retries
                )));
            }
            sleep(Duration::from_millis(self.retry_interval)).await;
        }
    }
}

#[derive(Deserialize)]
struct GetTransactionResult {
    confirmations: i64,
}

#[derive(Deserialize)]
struct WalletCreateFundedPsbtResult {
    psbt: String,
}

#[derive(Deserialize)]
struct WalletProcessPsbtResult {
    hex: Option<String>,
    psbt: String,
    complete: bool,
}

#[derive(Deserialize)]
struct DecodePsbtResult {
    tx: DecodePsbtTx,
}

#[derive(Deserialize)]
struct DecodePsbtTx {
    vin: Vec<DecodePsbtVin>,
}

#[derive(Deserialize)]
struct DecodePsbtVin {
    txid: String,
    vout: u32,
}

impl BitcoinBackend for BitcoindRpcBackend {
    async fn get_transaction(&self, tx_id: &str) -> Result<Option<ChainTransaction>, EngineError> {
        match self
            .call::<GetTransactionResult>("gettransaction", &[to_value(tx_id)?])
            .await
        {
            Ok(r) => Ok(Some(ChainTransaction {
                confirmations: r.confirmations.max(0) as u32,
            })),
            Err(EngineError::Bitcoin(msg)) if msg.contains("rpc error") => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn fund_psbt(
        &self,
        outputs: &[(String, Amount)],
        min_confirmations: u32,
        target_confirmations: u32,
    ) -> Result<FundedPsbt, EngineError> {
        let mut address_amount = std::collections::BTreeMap::new();
        for (address, amount) in outputs {
            let btc: f64 = amount
                .to_decimal(8)
                .parse()
                .map_err(|_| EngineError::Bitcoin("invalid output amount".to_string()))?;
            address_amount.insert(address.clone(), btc);
        }

        let options = json!({
            "minconf": min_confirmations,
            "conf_target": target_confirmations,
            "lockUnspents": true,
        });

        let result = self
            .call::<WalletCreateFundedPsbtResult>(
                "walletcreatefundedpsbt",
                &[
                    to_value(Vec::<Value>::new())?,
                    to_value(address_amount)?,
                    to_value(0)?,
                    options,
                ],
            )
            .await?;

        // `walletcreatefundedpsbt` itself never echoes back which inputs it selected and locked
        // (`lockUnspents: true` above), so the selected outpoints are recovered by decoding the
        // PSBT's own unsigned transaction via `decodepsbt` rather than left for the caller to
        // reconstruct — `unlock_utxo` needs every one of these populated to actually release the
        // lock on a failed funding/signing/broadcast.
        let decoded = self
            .call::<DecodePsbtResult>("decodepsbt", &[to_value(&result.psbt)?])
            .await?;
        let inputs = decoded
            .tx
            .vin
            .into_iter()
            .map(|vin| UtxoLock {
                lock_id: format!("{}:{}", vin.txid, vin.vout),
                transaction_id: vin.txid,
                transaction_vout: vin.vout,
            })
            .collect();

        Ok(FundedPsbt {
            psbt: result.psbt,
            inputs,
        })
    }

    async fn sign_psbt(&self, psbt: &str) -> Result<SignedPsbt, EngineError> {
        let result = self
            .call::<WalletProcessPsbtResult>(
                "walletprocesspsbt",
                &[to_value(psbt)?, to_value(true)?],
            )
            .await?;
        if !result.complete {
            return Err(EngineError::Bitcoin(
                "psbt signing incomplete: additional signatures required".to_string(),
            ));
        }
        let transaction = result
            .hex
            .ok_or_else(|| EngineError::Bitcoin("signed psbt missing finalized hex".to_string()))?;
        let _ = result.psbt;
        Ok(SignedPsbt { transaction })
    }

    async fn broadcast_chain_transaction(&self, raw_tx: &str) -> Result<String, EngineError> {
        match self
            .call::<String>("sendrawtransaction", &[to_value(raw_tx)?])
            .await
        {
            Ok(txid) => Ok(txid),
            Err(e) => Err(e),
        }
    }

    async fn unlock_utxo(&self, lock: &UtxoLock) -> Result<(), EngineError> {
        let outpoint = json!({
            "txid": lock.transaction_id,
            "vout": lock.transaction_vout,
        });
        self.call::<bool>("lockunspent", &[to_value(true)?, to_value([outpoint])?])
            .await?;
        Ok(())
    }

    async fn get_chain_addresses(&self) -> Result<Vec<String>, EngineError> {
        let address = self
            .call::<String>("getnewaddress", &[])
            .await?;
        Ok(vec![address])
    }

    async fn get_chain_balance(&self) -> Result<Amount, EngineError> {
        let balance_btc = self.call::<f64>("getbalance", &[]).await?;
        Amount::from_decimal(&format!("{balance_btc:.8}"), 8)
            .map_err(|e| EngineError::Bitcoin(format!("invalid balance: {e}")))
    }
}
