//! [`Exchange`] implementation against OKX's REST API.
//!
//! Every request is signed per OKX's scheme: `base64(hmac_sha256(secret,
//! timestamp + method + request_path + body))`, carried in the `OK-ACCESS-SIGN` header alongside
//! `OK-ACCESS-KEY`, `OK-ACCESS-PASSPHRASE`, and an ISO-8601 millisecond `OK-ACCESS-TIMESTAMP`. A
//! non-zero top-level `code` in the response body is a venue-level failure even when the HTTP
//! status is 200, mirrored here as [`ExchangeError::Venue`].

use std::time::{SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose, Engine};
use hmac::{Hmac, Mac};
use reqwest::{Client as ReqwestClient, Method};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::trace;

use crate::amount::Amount;
use crate::error::{ClientError, ExchangeError};
use crate::token::Token;

use super::exchange::{
    Deposit, DepositState, Exchange, FundsTransfer, FundsTransferState, SubAccount, Trade,
    TradeState, Withdrawal, WithdrawalState,
};

type HmacSha256 = Hmac<Sha256>;

#[derive(Deserialize)]
struct Envelope<T> {
    code: String,
    msg: String,
    data: Vec<T>,
}

pub struct OkxExchange {
    base_url: String,
    api_key: String,
    api_secret: String,
    api_passphrase: String,
    client: ReqwestClient,
}

impl OkxExchange {
    pub fn new(base_url: String, api_key: String, api_secret: String, api_passphrase: String) -> Self {
        OkxExchange {
            base_url,
            api_key,
            api_secret,
            api_passphrase,
            client: ReqwestClient::new(),
        }
    }

    fn sign(&self, timestamp: &str, method: &str, request_path: &str, body: &str) -> Result<String, ExchangeError> {
        let prehash = format!("{timestamp}{method}{request_path}{body}");
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|_| ExchangeError::Transport(ClientError::Other("invalid api secret".to_string())))?;
        mac.update(prehash.as_bytes());
        Ok(general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
    }

    fn timestamp(&self) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let millis = now.as_millis();
        let secs = now.as_secs();
        let dt = chrono_like_iso8601(secs, (millis % 1000) as u32);
        dt
    }

    async fn request<T: for<'de> Deserialize<'de>>(
        &self,
        method: Method,
        request_path: &str,
        body: Option<Value>,
    ) -> Result<Vec<T>, ExchangeError> {
        let timestamp = self.timestamp();
        let body_str = body
            .as_ref()
            .map(|b| b.to_string())
            .unwrap_or_default();
        let signature = self.sign(&timestamp, method.as_str(), request_path, &body_str)?;

        let url = format!("{}{}", self.base_url, request_path);
        let mut req = self
            .client
            .request(method, &url)
            .header("OK-ACCESS-KEY", &self.api_key)
            .header("OK-ACCESS-SIGN", signature)
            .header("OK-ACCESS-TIMESTAMP", timestamp)
            .header("OK-ACCESS-PASSPHRASE", &self.api_passphrase)
            .header("Content-Type", "application/json");

        if let Some(body) = body {
            req = req.json(&body);
        }

        trace!(%request_path, "calling okx");

        let resp = req
            .send()
            .await
            .map_err(|e| ExchangeError::Transport(ClientError::Connection(e.to_string())))?;

        let raw = resp
            .text()
            .await
            .map_err(|e| ExchangeError::Transport(ClientError::Body(e.to_string())))?;

        let envelope: Envelope<T> = serde_json::from_str(&raw)
            .map_err(|e| ExchangeError::Transport(ClientError::Parse(e.to_string())))?;

        if envelope.code != "0" {
            return Err(ExchangeError::Venue {
                code: envelope.code,
                message: envelope.msg,
            });
        }

        Ok(envelope.data)
    }
}

/// Minimal ISO-8601 `YYYY-MM-DDTHH:MM:SS.sssZ` formatter over a Unix timestamp, avoiding a
/// `chrono`/`time` dependency the teacher's stack does not otherwise need.
fn chrono_like_iso8601(secs: u64, millis: u32) -> String {
    const DAYS_PER_400_YEARS: i64 = 146_097;
    let days_since_epoch = (secs / 86_400) as i64;
    let secs_of_day = secs % 86_400;

    let mut z = days_since_epoch + 719_468;
    let era = if z >= 0 { z } else { z - DAYS_PER_400_YEARS + 1 } / DAYS_PER_400_YEARS;
    z -= era * DAYS_PER_400_YEARS;
    let doe = z;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };

    let hour = secs_of_day / 3600;
    let minute = (secs_of_day % 3600) / 60;
    let second = secs_of_day % 60;

    format!("{y:04}-{m:02}-{d:02}T{hour:02}:{minute:02}:{second:02}.{millis:03}Z")
}

#[derive(Deserialize)]
struct DepositAddressResp {
    addr: String,
}

#[derive(Deserialize)]
struct DepositHistoryResp {
    dep_id: Option<String>,
    state: String,
    tx_id: String,
}

fn parse_deposit_state(s: &str) -> DepositState {
    match s {
        "2" => DepositState::Success,
        "1" | "0" => DepositState::Pending,
        _ => DepositState::CreditedNotWithdrawable,
    }
}

#[derive(Deserialize)]
struct OrderResp {
    ord_id: String,
    avg_px: String,
    state: String,
}

fn parse_trade_state(s: &str) -> TradeState {
    match s {
        "live" => TradeState::Live,
        "partially_filled" => TradeState::PartiallyFilled,
        "filled" => TradeState::Filled,
        "mmp_canceled" => TradeState::MmpCanceled,
        _ => TradeState::Canceled,
    }
}

#[derive(Deserialize)]
struct TransferResp {
    trans_id: String,
}

#[derive(Deserialize)]
struct TransferStateResp {
    trans_id: String,
    state: String,
}

fn parse_transfer_state(s: &str) -> FundsTransferState {
    match s {
        "success" => FundsTransferState::Success,
        "pending" => FundsTransferState::Pending,
        _ => FundsTransferState::Failed,
    }
}

#[derive(Deserialize)]
struct WithdrawalFeeResp {
    min_fee: String,
}

#[derive(Deserialize)]
struct WithdrawalResp {
    wd_id: String,
}

#[derive(Deserialize)]
struct WithdrawalHistoryResp {
    tx_id: String,
    state: String,
}

fn parse_withdrawal_state(s: &str) -> WithdrawalState {
    match s {
        "2" => WithdrawalState::Completed,
        "1" => WithdrawalState::Pending,
        "0" => WithdrawalState::Submitted,
        "-3" => WithdrawalState::FailedInsufficientBalance,
        "-2" => WithdrawalState::FailedRiskControl,
        _ => WithdrawalState::FailedOther,
    }
}

#[derive(Deserialize)]
struct TradingBalanceResp {
    details: Vec<BalanceDetail>,
}

#[derive(Deserialize)]
struct BalanceDetail {
    ccy: String,
    avail_bal: String,
}

#[derive(Deserialize)]
struct FundingBalanceResp {
    ccy: String,
    avail_bal: String,
}

fn sub_account_type(account: SubAccount) -> &'static str {
    match account {
        SubAccount::Funding => "6",
        SubAccount::Trading => "18",
    }
}

impl Exchange for OkxExchange {
    async fn get_deposit_address(
        &self,
        coin: Token,
        chain: Option<&str>,
        amount: Option<&Amount>,
    ) -> Result<String, ExchangeError> {
        if coin == Token::BtcLn {
            let amount = amount.ok_or(ExchangeError::MissingAmount("lightning deposit address"))?;
            let path = format!(
                "/api/v5/asset/deposit-lightning?ccy=BTC&amt={}",
                amount.to_decimal(8)
            );
            let resp: Vec<DepositAddressResp> = self.request(Method::GET, &path, None).await?;
            return resp
                .into_iter()
                .next()
                .map(|d| d.addr)
                .ok_or_else(|| ExchangeError::Venue {
                    code: "empty".to_string(),
                    message: "no lightning invoice returned".to_string(),
                });
        }

        let mut path = format!("/api/v5/asset/deposit-address?ccy={}", coin.as_str());
        if let Some(chain) = chain {
            path.push_str(&format!("&chain={}-{}", coin.as_str(), chain));
        }
        let resp: Vec<DepositAddressResp> = self.request(Method::GET, &path, None).await?;
        resp.into_iter()
            .next()
            .map(|d| d.addr)
            .ok_or_else(|| ExchangeError::Venue {
                code: "empty".to_string(),
                message: "no deposit address returned".to_string(),
            })
    }

    async fn get_deposit(&self, tx_id: &str) -> Result<Option<Deposit>, ExchangeError> {
        let path = format!("/api/v5/asset/deposit-history?txId={tx_id}");
        let resp: Vec<DepositHistoryResp> = self.request(Method::GET, &path, None).await?;
        Ok(resp.into_iter().find(|d| d.tx_id == tx_id).map(|d| Deposit {
            deposit_id: d.dep_id.unwrap_or_default(),
            state: parse_deposit_state(&d.state),
        }))
    }

    async fn market_trade(
        &self,
        src: Token,
        dst: Token,
        amount: &Amount,
        client_order_id: &str,
    ) -> Result<String, ExchangeError> {
        let pair = crate::token::get_trading_pair(src, dst)
            .map_err(|_| ExchangeError::InvalidPair {
                src: src.as_str().to_string(),
                dst: dst.as_str().to_string(),
            })?;
        let body = json!({
            "instId": pair.pair,
            "tdMode": "cash",
            "side": match pair.side {
                crate::token::Side::Buy => "buy",
                crate::token::Side::Sell => "sell",
            },
            "ordType": "market",
            "sz": amount.to_decimal(src.decimals()),
            "clOrdId": client_order_id,
        });
        let resp: Vec<OrderResp> = self
            .request(Method::POST, "/api/v5/trade/order", Some(body))
            .await?;
        resp.into_iter()
            .next()
            .map(|o| o.ord_id)
            .ok_or_else(|| ExchangeError::Venue {
                code: "empty".to_string(),
                message: "no order id returned".to_string(),
            })
    }

    async fn get_trade(
        &self,
        _src: Token,
        _dst: Token,
        client_order_id: &str,
    ) -> Result<Option<Trade>, ExchangeError> {
        let path = format!("/api/v5/trade/order?clOrdId={client_order_id}");
        let resp: Vec<OrderResp> = self.request(Method::GET, &path, None).await?;
        Ok(resp.into_iter().next().map(|o| Trade {
            order_id: o.ord_id,
            average_price: o.avg_px,
            state: parse_trade_state(&o.state),
        }))
    }

    async fn funds_transfer(
        &self,
        ccy: Token,
        from: SubAccount,
        to: SubAccount,
        amount: &Amount,
        client_id: &str,
    ) -> Result<String, ExchangeError> {
        let body = json!({
            "ccy": ccy.as_str(),
            "amt": amount.to_decimal(ccy.decimals()),
            "from": sub_account_type(from),
            "to": sub_account_type(to),
            "clientId": client_id,
        });
        let resp: Vec<TransferResp> = self
            .request(Method::POST, "/api/v5/asset/transfer", Some(body))
            .await?;
        resp.into_iter()
            .next()
            .map(|t| t.trans_id)
            .ok_or_else(|| ExchangeError::Venue {
                code: "empty".to_string(),
                message: "no transfer id returned".to_string(),
            })
    }

    async fn get_funds_transfer(&self, client_id: &str) -> Result<Option<FundsTransfer>, ExchangeError> {
        let path = format!("/api/v5/asset/transfer-state?clientId={client_id}");
        let resp: Vec<TransferStateResp> = self.request(Method::GET, &path, None).await?;
        Ok(resp.into_iter().next().map(|t| FundsTransfer {
            transfer_id: t.trans_id,
            state: parse_transfer_state(&t.state),
        }))
    }

    async fn get_withdrawal_fee(
        &self,
        coin: Token,
        chain: &str,
        _amount: Option<&Amount>,
    ) -> Result<Amount, ExchangeError> {
        let path = format!(
            "/api/v5/asset/currencies?ccy={}&chain={}-{}",
            coin.as_str(),
            coin.as_str(),
            chain
        );
        let resp: Vec<WithdrawalFeeResp> = self.request(Method::GET, &path, None).await?;
        let fee = resp
            .into_iter()
            .next()
            .map(|r| r.min_fee)
            .ok_or_else(|| ExchangeError::Venue {
                code: "empty".to_string(),
                message: "no withdrawal fee returned".to_string(),
            })?;
        Amount::from_decimal(&fee, coin.decimals()).map_err(|e| {
            ExchangeError::Venue {
                code: "decode".to_string(),
                message: e,
            }
        })
    }

    async fn withdraw(
        &self,
        coin: Token,
        chain: &str,
        address: &str,
        client_withdrawal_id: &str,
        fee: &Amount,
        amount: &Amount,
    ) -> Result<String, ExchangeError> {
        let body = if coin == Token::BtcLn {
            json!({
                "ccy": "BTC",
                "amt": amount.to_decimal(8),
                "dest": "3",
                "toAddr": address,
                "fee": fee.to_decimal(8),
                "clientId": client_withdrawal_id,
            })
        } else {
            json!({
                "ccy": coin.as_str(),
                "amt": amount.to_decimal(coin.decimals()),
                "dest": "4",
                "toAddr": address,
                "chain": format!("{}-{}", coin.as_str(), chain),
                "fee": fee.to_decimal(coin.decimals()),
                "clientId": client_withdrawal_id,
            })
        };
        let resp: Vec<WithdrawalResp> = self
            .request(Method::POST, "/api/v5/asset/withdrawal", Some(body))
            .await?;
        resp.into_iter()
            .next()
            .map(|w| w.wd_id)
            .ok_or_else(|| ExchangeError::Venue {
                code: "empty".to_string(),
                message: "no withdrawal id returned".to_string(),
            })
    }

    async fn get_withdrawal(&self, client_withdrawal_id: &str) -> Result<Option<Withdrawal>, ExchangeError> {
        let path = format!("/api/v5/asset/withdrawal-history?clientId={client_withdrawal_id}");
        let resp: Vec<WithdrawalHistoryResp> = self.request(Method::GET, &path, None).await?;
        Ok(resp.into_iter().next().map(|w| Withdrawal {
            tx_id: if w.tx_id.is_empty() { None } else { Some(w.tx_id) },
            state: parse_withdrawal_state(&w.state),
        }))
    }

    async fn get_balance(&self, ccy: Token, account: SubAccount) -> Result<Amount, ExchangeError> {
        let avail = match account {
            SubAccount::Trading => {
                let path = format!("/api/v5/account/balance?ccy={}", ccy.as_str());
                let resp: Vec<TradingBalanceResp> = self.request(Method::GET, &path, None).await?;
                resp.into_iter()
                    .next()
                    .and_then(|b| b.details.into_iter().next())
                    .map(|d| d.avail_bal)
            }
            SubAccount::Funding => {
                let path = format!("/api/v5/asset/balances?ccy={}", ccy.as_str());
                let resp: Vec<FundingBalanceResp> = self.request(Method::GET, &path, None).await?;
                resp.into_iter().next().map(|d| d.avail_bal)
            }
        };
        let avail = avail.unwrap_or_else(|| "0".to_string());
        Amount::from_decimal(&avail, ccy.decimals()).map_err(|e| ExchangeError::Venue {
            code: "decode".to_string(),
            message: e,
        })
    }
}
