//! Application configuration loaded from environment variables.
//!
//! Required: `ORACLE_SECRET`
//! Optional: `ENTRANCE_FEE`, `INTERVAL_SECS`, `VRF_KEY_HASH`,
//!           `SUBSCRIPTION_FUND`, `ORACLE_FEE_PER_WORD`, `MAX_NUM_WORDS`,
//!           `REQUEST_CONFIRMATIONS`, `CONFIRMATION_DELAY_MS`,
//!           `CALLBACK_GAS_LIMIT`, `NUM_WORDS`, `PAYOUT_MODE`, `RPC_URL`,
//!           `TREASURY_KEYPAIR_PATH`, `PRIORITY_FEE_MICRO_LAMPORTS`,
//!           `PAYOUT_COMPUTE_UNIT_LIMIT`, `CLUSTER`, `HTTP_PORT`,
//!           `MAX_RETRIES`, `INITIAL_RETRY_DELAY_MS`,
//!           `FULFILLMENT_CONCURRENCY`, `KEEPER_POLL_MS`,
//!           `REQUEST_TIMEOUT_SECS`, `ADMIN_TOKEN`

use anyhow::{Context, Result};
use solana_sdk::signature::{read_keypair_file, Keypair};
use std::str::FromStr;
use std::sync::Arc;

use crate::coordinator::OracleParams;

/// Where prizes are paid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayoutMode {
    /// In-memory ledger.
    Ledger,
    /// System Program transfer from the treasury keypair.
    Rpc,
}

impl FromStr for PayoutMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ledger" => Ok(PayoutMode::Ledger),
            "rpc" => Ok(PayoutMode::Rpc),
            other => anyhow::bail!("unknown PAYOUT_MODE: {other}"),
        }
    }
}

/// Application configuration for the raffle backend.
#[derive(Clone)]
pub struct AppConfig {
    /// Lamports required per entry.
    pub entrance_fee: u64,
    /// Minimum seconds between settlements.
    pub interval_secs: u64,
    /// Secret key for HMAC-SHA256 randomness generation.
    pub oracle_secret: Vec<u8>,
    /// Key hash ("gas lane") forwarded with every randomness request.
    pub key_hash: [u8; 32],
    /// Initial funding of the local coordinator subscription.
    pub subscription_fund: u64,
    /// Coordinator fee per requested word.
    pub oracle_fee_per_word: u64,
    /// Coordinator limit on words per request.
    pub max_num_words: u32,
    /// Confirmations the oracle waits before fulfilling.
    pub request_confirmations: u16,
    /// Delay simulated per confirmation, in milliseconds.
    pub confirmation_delay_ms: u64,
    /// Resource budget forwarded for the delivery callback.
    pub callback_gas_limit: u32,
    /// Random words requested per settlement.
    pub num_words: u32,
    pub payout_mode: PayoutMode,
    /// Solana JSON-RPC endpoint used by the rpc payout.
    pub rpc_url: String,
    /// Treasury keypair paying prizes; only loaded in rpc payout mode.
    pub treasury_keypair: Option<Arc<Keypair>>,
    /// Priority fee in micro-lamports per compute unit for payouts.
    pub priority_fee_micro_lamports: u64,
    /// Compute unit limit for payouts; 0 leaves the runtime default.
    pub payout_compute_unit_limit: u32,
    /// Cluster name for explorer URLs.
    pub cluster: String,
    pub http_port: u16,
    /// Maximum attempts per delivery and per payout transaction.
    pub max_retries: u32,
    /// Initial retry delay in milliseconds.
    pub initial_retry_delay_ms: u64,
    /// Maximum concurrent fulfillment tasks.
    pub fulfillment_concurrency: usize,
    /// Keeper polling period in milliseconds.
    pub keeper_poll_ms: u64,
    /// Seconds after which a pending request may be re-requested.
    pub request_timeout_secs: u64,
    /// Token required by the administrative endpoints; `None` disables them.
    pub admin_token: Option<String>,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let parse_or = |key: &str, default: &str| -> String {
            lookup(key).unwrap_or_else(|| default.to_string())
        };

        let oracle_secret = lookup("ORACLE_SECRET")
            .filter(|s| !s.is_empty())
            .context("ORACLE_SECRET env var must be set")?
            .into_bytes();

        let entrance_fee: u64 = parse(&lookup, "ENTRANCE_FEE", 10_000_000)?;
        anyhow::ensure!(entrance_fee > 0, "ENTRANCE_FEE must be positive");
        let interval_secs: u64 = parse(&lookup, "INTERVAL_SECS", 30)?;
        anyhow::ensure!(interval_secs > 0, "INTERVAL_SECS must be positive");

        let key_hash = match lookup("VRF_KEY_HASH") {
            Some(encoded) => decode_key_hash(&encoded)?,
            None => [0u8; 32],
        };

        let payout_mode: PayoutMode = parse_or("PAYOUT_MODE", "ledger").parse()?;
        let rpc_url = parse_or("RPC_URL", "http://127.0.0.1:8899");

        let treasury_keypair = match payout_mode {
            PayoutMode::Ledger => None,
            PayoutMode::Rpc => {
                let keypair_path = parse_or("TREASURY_KEYPAIR_PATH", "~/.config/solana/id.json");
                let keypair_path = shellexpand::tilde(&keypair_path).to_string();
                let keypair = read_keypair_file(&keypair_path)
                    .map_err(|e| anyhow::anyhow!("{e}"))
                    .with_context(|| format!("failed to read keypair from {keypair_path}"))?;
                Some(Arc::new(keypair))
            }
        };

        Ok(Self {
            entrance_fee,
            interval_secs,
            oracle_secret,
            key_hash,
            subscription_fund: parse(&lookup, "SUBSCRIPTION_FUND", 1_000_000_000)?,
            oracle_fee_per_word: parse(&lookup, "ORACLE_FEE_PER_WORD", 0)?,
            max_num_words: parse(&lookup, "MAX_NUM_WORDS", 10)?,
            request_confirmations: parse(&lookup, "REQUEST_CONFIRMATIONS", 3)?,
            confirmation_delay_ms: parse(&lookup, "CONFIRMATION_DELAY_MS", 400)?,
            callback_gas_limit: parse(&lookup, "CALLBACK_GAS_LIMIT", 500_000)?,
            num_words: parse(&lookup, "NUM_WORDS", 1)?,
            payout_mode,
            rpc_url,
            treasury_keypair,
            priority_fee_micro_lamports: parse(&lookup, "PRIORITY_FEE_MICRO_LAMPORTS", 0)?,
            payout_compute_unit_limit: parse(&lookup, "PAYOUT_COMPUTE_UNIT_LIMIT", 0)?,
            cluster: parse_or("CLUSTER", "devnet"),
            http_port: parse(&lookup, "HTTP_PORT", 8080)?,
            max_retries: parse(&lookup, "MAX_RETRIES", 5)?,
            initial_retry_delay_ms: parse(&lookup, "INITIAL_RETRY_DELAY_MS", 500)?,
            fulfillment_concurrency: parse(&lookup, "FULFILLMENT_CONCURRENCY", 4)?,
            keeper_poll_ms: parse(&lookup, "KEEPER_POLL_MS", 1_000)?,
            request_timeout_secs: parse(&lookup, "REQUEST_TIMEOUT_SECS", 600)?,
            admin_token: lookup("ADMIN_TOKEN").filter(|t| !t.is_empty()),
        })
    }

    /// Oracle parameters forwarded with every randomness request.
    pub fn oracle_params(&self, subscription_id: u64) -> OracleParams {
        OracleParams {
            key_hash: self.key_hash,
            subscription_id,
            request_confirmations: self.request_confirmations,
            callback_gas_limit: self.callback_gas_limit,
            num_words: self.num_words,
        }
    }

    /// Return the Solscan explorer URL for a given transaction signature.
    pub fn explorer_url(&self, signature: &str) -> String {
        match self.cluster.as_str() {
            "mainnet-beta" => format!("https://solscan.io/tx/{signature}"),
            cluster => format!("https://solscan.io/tx/{signature}?cluster={cluster}"),
        }
    }
}

/// Parse an optional variable, falling back to `default` when unset.
fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {key}={raw}: {e}")),
        None => Ok(default),
    }
}

/// Decode a base58 key hash into exactly 32 bytes.
fn decode_key_hash(encoded: &str) -> Result<[u8; 32]> {
    let bytes = bs58::decode(encoded.trim())
        .into_vec()
        .with_context(|| format!("invalid VRF_KEY_HASH: {encoded}"))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| anyhow::anyhow!("VRF_KEY_HASH must be 32 bytes, got {}", b.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<AppConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply() {
        let config = load(&[("ORACLE_SECRET", "s3cret")]).unwrap();
        assert_eq!(config.oracle_secret, b"s3cret");
        assert_eq!(config.entrance_fee, 10_000_000);
        assert_eq!(config.interval_secs, 30);
        assert_eq!(config.key_hash, [0u8; 32]);
        assert_eq!(config.request_confirmations, 3);
        assert_eq!(config.callback_gas_limit, 500_000);
        assert_eq!(config.num_words, 1);
        assert_eq!(config.payout_mode, PayoutMode::Ledger);
        assert!(config.treasury_keypair.is_none());
        assert_eq!(config.http_port, 8080);
        assert_eq!(config.request_timeout_secs, 600);
        assert!(config.admin_token.is_none());
    }

    #[test]
    fn overrides_apply() {
        let key_hash = bs58::encode([7u8; 32]).into_string();
        let config = load(&[
            ("ORACLE_SECRET", "s3cret"),
            ("ENTRANCE_FEE", "1"),
            ("INTERVAL_SECS", "60"),
            ("VRF_KEY_HASH", &key_hash),
            ("NUM_WORDS", "2"),
            ("ADMIN_TOKEN", "letmein"),
        ])
        .unwrap();
        assert_eq!(config.entrance_fee, 1);
        assert_eq!(config.interval_secs, 60);
        assert_eq!(config.key_hash, [7u8; 32]);
        assert_eq!(config.num_words, 2);
        assert_eq!(config.admin_token.as_deref(), Some("letmein"));

        let params = config.oracle_params(4);
        assert_eq!(params.subscription_id, 4);
        assert_eq!(params.key_hash, [7u8; 32]);
        assert_eq!(params.num_words, 2);
    }

    #[test]
    fn missing_secret_is_an_error() {
        assert!(load(&[]).is_err());
        assert!(load(&[("ORACLE_SECRET", "")]).is_err());
    }

    #[test]
    fn invalid_values_are_errors() {
        assert!(load(&[("ORACLE_SECRET", "s"), ("ENTRANCE_FEE", "abc")]).is_err());
        assert!(load(&[("ORACLE_SECRET", "s"), ("INTERVAL_SECS", "0")]).is_err());
        assert!(load(&[("ORACLE_SECRET", "s"), ("PAYOUT_MODE", "carrier-pigeon")]).is_err());
        assert!(load(&[("ORACLE_SECRET", "s"), ("VRF_KEY_HASH", "abc")]).is_err());
    }

    #[test]
    fn explorer_url_includes_cluster() {
        let mut config = load(&[("ORACLE_SECRET", "s")]).unwrap();
        assert_eq!(
            config.explorer_url("sig"),
            "https://solscan.io/tx/sig?cluster=devnet"
        );
        config.cluster = "mainnet-beta".into();
        assert_eq!(config.explorer_url("sig"), "https://solscan.io/tx/sig");
    }
}
