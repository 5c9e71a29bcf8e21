//! Typed configuration, loaded from the process environment.

use std::collections::HashMap;
use std::env::{self, VarError};
use std::path::PathBuf;
use std::time::Duration;

/// Authentication for the `bitcoind` JSON-RPC endpoint.
///
/// Mirrors the common `bitcoind` client patterns: no auth (already-trusted local socket),
/// username/password, or a cookie file written by `bitcoind` itself at startup.
#[derive(Clone, Debug)]
pub enum BitcoinAuth {
    None,
    UserPass(String, String),
    CookieFile(PathBuf),
}

/// Runtime configuration for the rebalancer.
#[derive(Clone, Debug)]
pub struct Config {
    // CEX credentials.
    pub api_key: String,
    pub api_secret: String,
    pub api_passphrase: String,
    pub cex_base_url: String,

    /// On-chain contract addresses per smart-chain token, keyed by token symbol.
    pub token_addresses: HashMap<String, String>,

    /// The CEX's own name for the smart chain (used in deposit/withdrawal chain selectors).
    pub sc_chain_name: String,

    /// Trigger a rebalance when the inventory split differs from parity by more than this many
    /// parts-per-million.
    pub rebalance_threshold_ppm: u64,

    /// Fraction (in PPM) of the notional imbalance to correct per cycle.
    pub rebalance_amount_ppm: u64,

    pub retry_time: Duration,
    pub check_interval: Duration,
    pub monitor_interval: Duration,
    pub cooldown: Duration,

    pub state_file_path: PathBuf,
    pub archive_dir_path: PathBuf,

    pub bitcoind_url: String,
    pub bitcoind_auth: BitcoinAuth,
}

fn env_var(key: &str) -> Result<String, String> {
    env::var(key).map_err(|e| match e {
        VarError::NotPresent => format!("missing required env var {key}"),
        VarError::NotUnicode(_) => format!("env var {key} is not valid unicode"),
    })
}

fn env_var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_var_u64_or(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Loads configuration from the process environment. Timer fields fall back to the spec's
    /// fixed defaults (`retry_time = 15s`, `check_interval = 5s`, `monitor_interval = 120s`,
    /// `cooldown = 5s`) when the corresponding env var is absent.
    pub fn from_env() -> Result<Self, String> {
        let mut token_addresses = HashMap::new();
        for token in ["WBTC", "USDC", "USDT", "ETH"] {
            let addr = env::var(format!("TOKEN_ADDRESS_{token}")).unwrap_or_else(|_| {
                if token == "ETH" {
                    "0x0000000000000000000000000000000000000000".to_string()
                } else {
                    String::new()
                }
            });
            if !addr.is_empty() {
                token_addresses.insert(token.to_string(), addr);
            }
        }

        let bitcoind_auth = match (env::var("BITCOIND_COOKIE_FILE"), env::var("BITCOIND_USER")) {
            (Ok(path), _) => BitcoinAuth::CookieFile(PathBuf::from(path)),
            (_, Ok(user)) => {
                let pass = env_var("BITCOIND_PASSWORD")?;
                BitcoinAuth::UserPass(user, pass)
            }
            _ => BitcoinAuth::None,
        };

        Ok(Config {
            api_key: env_var("CEX_API_KEY")?,
            api_secret: env_var("CEX_API_SECRET")?,
            api_passphrase: env_var("CEX_API_PASSPHRASE")?,
            cex_base_url: env_var_or("CEX_BASE_URL", "https://www.okx.com"),
            token_addresses,
            sc_chain_name: env_var_or("SC_CHAIN_NAME", "ERC20"),
            rebalance_threshold_ppm: env_var_u64_or("REBALANCE_THRESHOLD_PPM", 50_000),
            rebalance_amount_ppm: env_var_u64_or("REBALANCE_AMOUNT_PPM", 500_000),
            retry_time: Duration::from_secs(env_var_u64_or("RETRY_TIME_SECS", 15)),
            check_interval: Duration::from_secs(env_var_u64_or("CHECK_INTERVAL_SECS", 5)),
            monitor_interval: Duration::from_secs(env_var_u64_or("MONITOR_INTERVAL_SECS", 120)),
            cooldown: Duration::from_secs(env_var_u64_or("COOLDOWN_SECS", 5)),
            state_file_path: PathBuf::from(env_var_or(
                "STATE_FILE_PATH",
                "storage/rebalance_state.json",
            )),
            archive_dir_path: PathBuf::from(env_var_or("ARCHIVE_DIR_PATH", "storage/archive")),
            bitcoind_url: env_var_or("BITCOIND_URL", "http://127.0.0.1:8332"),
            bitcoind_auth,
        })
    }
}
