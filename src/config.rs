//! Configuration for the custody core.
//!
//! A single immutable [`Config`] is constructed at startup from a JSON file
//! (`--config`, default `config.json`) with serde defaults that fall back to
//! environment variables. No component reads the environment after startup;
//! everything is passed in through constructors.

use alloy_primitives::B256;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use url::Url;

use crate::units::NativeAmount;

/// CLI arguments for the custody daemon.
#[derive(Parser, Debug)]
#[command(name = "custodian-rs")]
#[command(about = "Custodial EVM wallet and strategy execution core")]
struct CliArgs {
    /// Path to the JSON configuration file
    #[arg(long, short, env = "CONFIG", default_value = "config.json")]
    config: PathBuf,
}

/// Top-level configuration.
///
/// Fields use serde defaults that fall back to environment variables,
/// then to hardcoded defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    chain: ChainConfig,
    #[serde(default)]
    custody: CustodyConfig,
    #[serde(default)]
    policy: PolicyConfig,
    #[serde(default)]
    scheduler: SchedulerConfig,
    #[serde(default = "config_defaults::default_data_dir")]
    data_dir: PathBuf,
    /// Test-network faucet endpoint for the `request_faucet` helper.
    #[serde(default)]
    faucet_url: Option<Url>,
}

impl Config {
    pub fn chain(&self) -> &ChainConfig {
        &self.chain
    }
    pub fn custody(&self) -> &CustodyConfig {
        &self.custody
    }
    pub fn policy(&self) -> &PolicyConfig {
        &self.policy
    }
    pub fn scheduler(&self) -> &SchedulerConfig {
        &self.scheduler
    }
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
    pub fn faucet_url(&self) -> Option<&Url> {
        self.faucet_url.as_ref()
    }

    /// Load configuration from CLI arguments and the JSON file.
    pub fn load() -> Result<Self, ConfigError> {
        let cli_args = CliArgs::parse();
        Self::load_from_path(&cli_args.config)
    }

    /// Load configuration from a specific path.
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let content =
            fs::read_to_string(path).map_err(|e| ConfigError::FileRead(path.to_path_buf(), e))?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.chain.rpc.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one RPC endpoint must be configured".into(),
            ));
        }
        let percentile = self.chain.priority_fee_percentile;
        if !(0.0..=100.0).contains(&percentile) {
            return Err(ConfigError::Invalid(format!(
                "priority_fee_percentile {percentile} outside 0..=100"
            )));
        }
        Ok(())
    }
}

/// Chain endpoint and fee-construction settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    /// Numeric chain id the deployment operates on. Wallet records created
    /// under a different chain id refuse to sign.
    #[serde(default = "chain_defaults::default_chain_id")]
    pub chain_id: u64,
    /// Ordered RPC endpoints; failover walks this list.
    #[serde(default = "chain_defaults::default_rpc")]
    pub rpc: Vec<RpcConfig>,
    /// Per-call timeout. Expiry surfaces as `chain_unreachable`.
    #[serde(default = "chain_defaults::default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Polling cadence for receipt waits.
    #[serde(default = "chain_defaults::default_receipt_poll_interval_ms")]
    pub receipt_poll_interval_ms: u64,
    /// How many recent blocks feed the priority-fee suggestion.
    #[serde(default = "chain_defaults::default_fee_history_blocks")]
    pub fee_history_blocks: u64,
    /// Reward percentile sampled from those blocks. Stable per release;
    /// see `ChainClient::fee_suggestion`.
    #[serde(default = "chain_defaults::default_priority_fee_percentile")]
    pub priority_fee_percentile: f64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            chain_id: chain_defaults::default_chain_id(),
            rpc: chain_defaults::default_rpc(),
            request_timeout_secs: chain_defaults::default_request_timeout_secs(),
            receipt_poll_interval_ms: chain_defaults::default_receipt_poll_interval_ms(),
            fee_history_blocks: chain_defaults::default_fee_history_blocks(),
            priority_fee_percentile: chain_defaults::default_priority_fee_percentile(),
        }
    }
}

mod chain_defaults {
    use super::RpcConfig;
    use std::env;

    pub fn default_chain_id() -> u64 {
        env::var("CHAIN_ID")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(31337)
    }

    pub fn default_rpc() -> Vec<RpcConfig> {
        let url = env::var("RPC_URL").unwrap_or_else(|_| "http://127.0.0.1:8545".to_string());
        url.parse()
            .map(|http| vec![RpcConfig { http }])
            .unwrap_or_default()
    }

    pub fn default_request_timeout_secs() -> u64 {
        10
    }

    pub fn default_receipt_poll_interval_ms() -> u64 {
        2_000
    }

    pub fn default_fee_history_blocks() -> u64 {
        10
    }

    pub fn default_priority_fee_percentile() -> f64 {
        50.0
    }
}

/// A single RPC endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcConfig {
    /// HTTP URL for the endpoint.
    pub http: Url,
}

/// Key-at-rest settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CustodyConfig {
    /// 32-byte hex deployment secret sealing every stored key. When absent,
    /// a sidecar secret is generated under the data dir on first start.
    #[serde(default)]
    pub secret: Option<LiteralOrEnv<DeploymentSecret>>,
}

/// Policy-engine settings: spend gating, export gates, rate rules.
#[derive(Debug, Clone, Deserialize)]
pub struct PolicyConfig {
    /// Transfers above this amount require the confirmation code. Absent
    /// means no high-value gate.
    #[serde(default)]
    pub spend_threshold: Option<NativeAmount>,
    /// Code compared against the caller's `confirmation_code`.
    #[serde(default)]
    pub confirmation_code: Option<LiteralOrEnv<SecretString>>,
    /// First gate for plaintext key export.
    #[serde(default)]
    pub plaintext_export_enabled: bool,
    /// Second gate for plaintext key export.
    #[serde(default)]
    pub plaintext_export_code: Option<LiteralOrEnv<SecretString>>,
    /// Fallback rate rule applied to every tool without an override.
    #[serde(default = "policy_defaults::default_rule")]
    pub default_rule: RateQuota,
    /// Per-tool and per-tool-and-agent overrides; most specific wins.
    #[serde(default)]
    pub rules: Vec<RateRuleConfig>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            spend_threshold: None,
            confirmation_code: None,
            plaintext_export_enabled: false,
            plaintext_export_code: None,
            default_rule: policy_defaults::default_rule(),
            rules: Vec::new(),
        }
    }
}

mod policy_defaults {
    use super::RateQuota;

    pub fn default_rule() -> RateQuota {
        RateQuota {
            max_calls: 60,
            window_seconds: 60,
        }
    }
}

/// Calls permitted within a sliding window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateQuota {
    pub max_calls: u32,
    pub window_seconds: u64,
}

/// A rate-rule override for one tool, optionally narrowed to one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateRuleConfig {
    pub tool: String,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(flatten)]
    pub quota: RateQuota,
}

/// Strategy scheduler cadence.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "scheduler_defaults::default_tick_interval_secs")]
    pub tick_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: scheduler_defaults::default_tick_interval_secs(),
        }
    }
}

mod scheduler_defaults {
    pub fn default_tick_interval_secs() -> u64 {
        15
    }
}

pub mod config_defaults {
    use std::env;
    use std::path::PathBuf;

    /// Default persistence location: `$DATA_DIR` env var, then `./data`.
    pub fn default_data_dir() -> PathBuf {
        env::var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data"))
    }
}

// ============================================================================
// Environment Variable Resolution
// ============================================================================

/// A transparent wrapper that resolves environment variables during
/// deserialization.
///
/// Supports both literal values and environment variable references:
/// - Literal: `"0xcafe..."`
/// - Simple env var: `"$CUSTODY_SECRET"`
/// - Braced env var: `"${CUSTODY_SECRET}"`
///
/// The wrapper implements `Deref` to provide transparent access to the
/// inner type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiteralOrEnv<T>(T);

impl<T> LiteralOrEnv<T> {
    /// Get a reference to the inner value.
    pub fn inner(&self) -> &T {
        &self.0
    }

    /// Consume the wrapper and return the inner value.
    pub fn into_inner(self) -> T {
        self.0
    }

    /// Parse environment variable syntax from a string.
    /// Returns the variable name if the string matches `$VAR` or `${VAR}`
    /// syntax.
    fn parse_env_var_syntax(s: &str) -> Option<String> {
        if s.starts_with("${") && s.ends_with('}') {
            Some(s[2..s.len() - 1].to_string())
        } else if s.starts_with('$') && s.len() > 1 {
            let var_name = &s[1..];
            if var_name.chars().all(|c| c.is_alphanumeric() || c == '_') {
                Some(var_name.to_string())
            } else {
                None
            }
        } else {
            None
        }
    }
}

impl<T> Deref for LiteralOrEnv<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> DerefMut for LiteralOrEnv<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl<'de, T> Deserialize<'de> for LiteralOrEnv<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;

        let value = if let Some(var_name) = Self::parse_env_var_syntax(&s) {
            std::env::var(&var_name).map_err(|_| {
                serde::de::Error::custom(format!(
                    "Environment variable '{}' not found (referenced as '{}')",
                    var_name, s
                ))
            })?
        } else {
            s
        };

        let parsed = value
            .parse::<T>()
            .map_err(|e| serde::de::Error::custom(format!("Failed to parse value: {}", e)))?;

        Ok(LiteralOrEnv(parsed))
    }
}

// ============================================================================
// Secret newtypes
// ============================================================================

/// The 32-byte symmetric secret sealing every stored key.
///
/// Parsed from hex (with or without `0x`). Debug output never shows the
/// bytes.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct DeploymentSecret(B256);

impl DeploymentSecret {
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_ref()
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(B256::from(bytes))
    }
}

impl FromStr for DeploymentSecret {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        B256::from_str(s)
            .map(Self)
            .map_err(|e| format!("Invalid deployment secret: {}", e))
    }
}

impl fmt::Debug for DeploymentSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DeploymentSecret([redacted])")
    }
}

/// A short shared secret (confirmation code) compared against caller input.
///
/// Debug output never shows the value.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Compares against caller-supplied input without leaking length via
    /// early exit.
    pub fn matches(&self, candidate: &str) -> bool {
        let a = self.0.as_bytes();
        let b = candidate.as_bytes();
        if a.len() != b.len() {
            return false;
        }
        a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
    }
}

impl FromStr for SecretString {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretString([redacted])")
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {0}: {1}")]
    FileRead(PathBuf, std::io::Error),
    #[error("Failed to parse config file: {0}")]
    JsonParse(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
