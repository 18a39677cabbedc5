//! The fixed tool surface.
//!
//! Every capability of the core is one named operation with a structured
//! argument map and a structured result. [`AgentCore::dispatch`] routes a
//! call through the policy gate, runs it, and journals the outcome; this
//! is the seam transports (stdio framing, CLI, HTTP) adapt to.
//!
//! Each tool carries a static idempotency tag. Transports that retry on
//! transient failures must refuse to retry a non-idempotent tool without
//! caller consent.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use url::Url;

use crate::chain::{ChainClient, ChainOps};
use crate::error::CoreError;
use crate::journal::EventStatus;
use crate::policy::PolicyEngine;
use crate::strategy::{CreateStrategyParams, StrategyManager};
use crate::timestamp::UnixTimestamp;
use crate::units::NativeAmount;
use crate::wallet::{TransferOutcome, WalletManager, parse_address};

/// Every operation the core exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolName {
    CreateWallet,
    ImportWalletPrivkey,
    ImportWalletMnemonic,
    ListWallets,
    QueryBalance,
    ProviderStatus,
    InspectContract,
    SimulateTransfer,
    ExecuteTransfer,
    SignMessage,
    ExportKeystore,
    ExportPrivateKey,
    CreateStrategy,
    StartStrategy,
    StopStrategy,
    DeleteStrategy,
    TickStrategy,
    ListStrategies,
    StrategyStatus,
    RequestFaucet,
}

impl ToolName {
    pub const ALL: [ToolName; 20] = [
        Self::CreateWallet,
        Self::ImportWalletPrivkey,
        Self::ImportWalletMnemonic,
        Self::ListWallets,
        Self::QueryBalance,
        Self::ProviderStatus,
        Self::InspectContract,
        Self::SimulateTransfer,
        Self::ExecuteTransfer,
        Self::SignMessage,
        Self::ExportKeystore,
        Self::ExportPrivateKey,
        Self::CreateStrategy,
        Self::StartStrategy,
        Self::StopStrategy,
        Self::DeleteStrategy,
        Self::TickStrategy,
        Self::ListStrategies,
        Self::StrategyStatus,
        Self::RequestFaucet,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateWallet => "create_wallet",
            Self::ImportWalletPrivkey => "import_wallet_privkey",
            Self::ImportWalletMnemonic => "import_wallet_mnemonic",
            Self::ListWallets => "list_wallets",
            Self::QueryBalance => "query_balance",
            Self::ProviderStatus => "provider_status",
            Self::InspectContract => "inspect_contract",
            Self::SimulateTransfer => "simulate_transfer",
            Self::ExecuteTransfer => "execute_transfer",
            Self::SignMessage => "sign_message",
            Self::ExportKeystore => "export_keystore",
            Self::ExportPrivateKey => "export_private_key",
            Self::CreateStrategy => "create_strategy",
            Self::StartStrategy => "start_strategy",
            Self::StopStrategy => "stop_strategy",
            Self::DeleteStrategy => "delete_strategy",
            Self::TickStrategy => "tick_strategy",
            Self::ListStrategies => "list_strategies",
            Self::StrategyStatus => "strategy_status",
            Self::RequestFaucet => "request_faucet",
        }
    }

    /// Whether a transport may retry this tool without caller consent.
    ///
    /// `execute_transfer` is tagged non-idempotent even though
    /// `dry_run=true` degrades it to read-only, and `tick_strategy` even
    /// though most ticks skip: the tag is static and must cover the
    /// broadcasting case.
    pub fn is_idempotent(&self) -> bool {
        !matches!(
            self,
            Self::CreateWallet
                | Self::ImportWalletPrivkey
                | Self::ImportWalletMnemonic
                | Self::ExecuteTransfer
                | Self::TickStrategy
                | Self::CreateStrategy
                | Self::StartStrategy
                | Self::StopStrategy
                | Self::DeleteStrategy
                | Self::RequestFaucet
        )
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolName {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|tool| tool.as_str() == s)
            .ok_or_else(|| CoreError::InvalidParams(format!("unknown tool: {s}")))
    }
}

#[derive(Deserialize)]
struct AgentArgs {
    agent_id: String,
}

#[derive(Deserialize)]
struct ImportPrivkeyArgs {
    agent_id: String,
    private_key: String,
}

#[derive(Deserialize)]
struct ImportMnemonicArgs {
    agent_id: String,
    mnemonic: String,
}

#[derive(Deserialize)]
struct InspectContractArgs {
    address: String,
}

#[derive(Deserialize)]
struct TransferArgs {
    agent_id: String,
    to: String,
    amount: NativeAmount,
    #[serde(default)]
    confirmation_code: Option<String>,
    #[serde(default)]
    dry_run: bool,
}

#[derive(Deserialize)]
struct SimulateArgs {
    agent_id: String,
    to: String,
    amount: NativeAmount,
}

#[derive(Deserialize)]
struct SignMessageArgs {
    agent_id: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    typed_data: Option<Value>,
}

#[derive(Deserialize)]
struct ExportKeystoreArgs {
    agent_id: String,
    passphrase: String,
}

#[derive(Deserialize)]
struct ExportPrivateKeyArgs {
    agent_id: String,
    #[serde(default)]
    confirmation_code: Option<String>,
}

#[derive(Deserialize)]
struct LabelArgs {
    label: String,
}

/// The wired-together core behind the tool surface.
pub struct AgentCore {
    wallet: Arc<WalletManager>,
    strategies: Arc<StrategyManager>,
    policy: Arc<PolicyEngine>,
    chain: Arc<dyn ChainOps>,
    /// Endpoint bookkeeping for `provider_status`; absent under test
    /// chains.
    client: Option<Arc<ChainClient>>,
    faucet_url: Option<Url>,
    http: reqwest::Client,
}

impl AgentCore {
    pub fn new(
        wallet: Arc<WalletManager>,
        strategies: Arc<StrategyManager>,
        policy: Arc<PolicyEngine>,
        chain: Arc<dyn ChainOps>,
        client: Option<Arc<ChainClient>>,
        faucet_url: Option<Url>,
    ) -> Self {
        Self {
            wallet,
            strategies,
            policy,
            chain,
            client,
            faucet_url,
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(15))
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn strategies(&self) -> &Arc<StrategyManager> {
        &self.strategies
    }

    /// Runs one tool invocation through the policy gate.
    ///
    /// Order: rate-limit check, guarded call, audit append. The audit
    /// write happens on every path (ok, domain error, denial) and its own
    /// failure never changes what the caller sees.
    pub async fn dispatch(&self, tool: ToolName, args: Value) -> Result<Value, CoreError> {
        let agent_id = args
            .get("agent_id")
            .and_then(|v| v.as_str())
            .map(String::from);
        let now = UnixTimestamp::try_now()
            .map_err(|e| CoreError::Storage(format!("system clock: {e}")))?;

        if let Err(denied) = self.policy.check(tool.as_str(), agent_id.as_deref(), now) {
            self.policy.record(
                tool.as_str(),
                agent_id.as_deref(),
                EventStatus::Denied,
                &args,
                &Value::Null,
                Some(denied.kind()),
                now,
            );
            return Err(denied);
        }

        let result = self.execute(tool, &args).await;

        let finished = UnixTimestamp::try_now().unwrap_or(now);
        match &result {
            Ok(response) => self.policy.record(
                tool.as_str(),
                agent_id.as_deref(),
                EventStatus::Ok,
                &args,
                response,
                None,
                finished,
            ),
            Err(e) => self.policy.record(
                tool.as_str(),
                agent_id.as_deref(),
                EventStatus::Error,
                &args,
                &Value::Null,
                Some(e.kind()),
                finished,
            ),
        }
        result
    }

    async fn execute(&self, tool: ToolName, args: &Value) -> Result<Value, CoreError> {
        match tool {
            ToolName::CreateWallet => {
                let args: AgentArgs = parse_args(args)?;
                let address = self.wallet.create_wallet(&args.agent_id)?;
                Ok(json!({"agent_id": args.agent_id, "address": address}))
            }
            ToolName::ImportWalletPrivkey => {
                let args: ImportPrivkeyArgs = parse_args(args)?;
                let address = self.wallet.import_privkey(&args.agent_id, &args.private_key)?;
                Ok(json!({"agent_id": args.agent_id, "address": address}))
            }
            ToolName::ImportWalletMnemonic => {
                let args: ImportMnemonicArgs = parse_args(args)?;
                let address = self.wallet.import_mnemonic(&args.agent_id, &args.mnemonic)?;
                Ok(json!({"agent_id": args.agent_id, "address": address}))
            }
            ToolName::ListWallets => {
                let wallets: Vec<Value> = self
                    .wallet
                    .list_wallets()
                    .into_iter()
                    .map(|(agent_id, address)| json!({"agent_id": agent_id, "address": address}))
                    .collect();
                Ok(json!({"wallets": wallets}))
            }
            ToolName::QueryBalance => {
                let args: AgentArgs = parse_args(args)?;
                let record = self.wallet.keystore().get(&args.agent_id)?;
                let balance = self.wallet.query_balance(&args.agent_id).await?;
                Ok(json!({
                    "agent_id": args.agent_id,
                    "address": record.address,
                    "balance": balance,
                }))
            }
            ToolName::ProviderStatus => {
                let status = self.chain.connected().await?;
                let mut response = json!({
                    "chain_id": status.chain_id,
                    "latest_block": status.latest_block,
                    "base_fee_gwei": format_gwei(status.base_fee_per_gas),
                });
                if let Some(client) = &self.client {
                    response["endpoints"] = json!(client.endpoint_count());
                    response["active_endpoint"] = json!(client.active_endpoint());
                }
                Ok(response)
            }
            ToolName::InspectContract => {
                let args: InspectContractArgs = parse_args(args)?;
                let address = parse_address(&args.address)?;
                let code = self.chain.code_at(address).await?;
                let balance = self.chain.balance(address).await?;
                Ok(json!({
                    "address": address,
                    "is_contract": !code.is_empty(),
                    "code_size": code.len(),
                    "balance": NativeAmount::from_wei(balance),
                }))
            }
            ToolName::SimulateTransfer => {
                let args: SimulateArgs = parse_args(args)?;
                let simulation = self
                    .wallet
                    .simulate_transfer(&args.agent_id, &args.to, args.amount)
                    .await?;
                to_value(&simulation)
            }
            ToolName::ExecuteTransfer => {
                let args: TransferArgs = parse_args(args)?;
                let outcome = self
                    .wallet
                    .execute_transfer(
                        &args.agent_id,
                        &args.to,
                        args.amount,
                        args.confirmation_code.as_deref(),
                        args.dry_run,
                    )
                    .await?;
                match outcome {
                    TransferOutcome::Sent { tx_hash, nonce } => {
                        Ok(json!({"status": "sent", "tx_hash": tx_hash, "nonce": nonce}))
                    }
                    TransferOutcome::DryRun(simulation) => {
                        Ok(json!({"status": "dry_run", "simulation": to_value(&simulation)?}))
                    }
                }
            }
            ToolName::SignMessage => {
                let args: SignMessageArgs = parse_args(args)?;
                let signature = match (args.message, args.typed_data) {
                    (Some(message), None) => self.wallet.sign_message(&args.agent_id, &message)?,
                    (None, Some(typed_data)) => {
                        self.wallet.sign_typed_data(&args.agent_id, typed_data)?
                    }
                    _ => {
                        return Err(CoreError::InvalidParams(
                            "provide exactly one of message or typed_data".into(),
                        ));
                    }
                };
                Ok(json!({"agent_id": args.agent_id, "signature": signature}))
            }
            ToolName::ExportKeystore => {
                let args: ExportKeystoreArgs = parse_args(args)?;
                let keystore = self.wallet.export_keystore(&args.agent_id, &args.passphrase)?;
                Ok(json!({"agent_id": args.agent_id, "keystore": keystore}))
            }
            ToolName::ExportPrivateKey => {
                let args: ExportPrivateKeyArgs = parse_args(args)?;
                let private_key = self
                    .wallet
                    .export_private_key(&args.agent_id, args.confirmation_code.as_deref())?;
                // The field name matters: journaling redacts by key.
                Ok(json!({"agent_id": args.agent_id, "private_key": private_key}))
            }
            ToolName::CreateStrategy => {
                let params: CreateStrategyParams = parse_args(args)?;
                let record = self.strategies.create(params)?;
                to_value(&record)
            }
            ToolName::StartStrategy => {
                let args: LabelArgs = parse_args(args)?;
                let now = UnixTimestamp::try_now()
                    .map_err(|e| CoreError::Storage(format!("system clock: {e}")))?;
                let record = self.strategies.start(&args.label, now)?;
                to_value(&record)
            }
            ToolName::StopStrategy => {
                let args: LabelArgs = parse_args(args)?;
                let now = UnixTimestamp::try_now()
                    .map_err(|e| CoreError::Storage(format!("system clock: {e}")))?;
                let record = self.strategies.stop(&args.label, now)?;
                to_value(&record)
            }
            ToolName::DeleteStrategy => {
                let args: LabelArgs = parse_args(args)?;
                self.strategies.delete(&args.label)?;
                Ok(json!({"label": args.label, "deleted": true}))
            }
            ToolName::TickStrategy => {
                let args: LabelArgs = parse_args(args)?;
                let now = UnixTimestamp::try_now()
                    .map_err(|e| CoreError::Storage(format!("system clock: {e}")))?;
                let result = self.strategies.tick(&args.label, now).await?;
                to_value(&result)
            }
            ToolName::ListStrategies => {
                let strategies: Vec<Value> = self
                    .strategies
                    .list()
                    .iter()
                    .map(to_value)
                    .collect::<Result<_, _>>()?;
                Ok(json!({"strategies": strategies}))
            }
            ToolName::StrategyStatus => {
                let args: LabelArgs = parse_args(args)?;
                let record = self.strategies.get(&args.label)?;
                let runs: Vec<Value> = self
                    .strategies
                    .recent_runs(&args.label, 20)
                    .iter()
                    .map(to_value)
                    .collect::<Result<_, _>>()?;
                Ok(json!({"strategy": to_value(&record)?, "recent_runs": runs}))
            }
            ToolName::RequestFaucet => {
                let args: AgentArgs = parse_args(args)?;
                let Some(faucet_url) = &self.faucet_url else {
                    return Err(CoreError::InvalidParams(
                        "no faucet endpoint configured".into(),
                    ));
                };
                let record = self.wallet.keystore().get(&args.agent_id)?;
                let response = self
                    .http
                    .post(faucet_url.clone())
                    .json(&json!({"address": record.address}))
                    .send()
                    .await
                    .map_err(|e| CoreError::ChainUnreachable(format!("faucet: {e}")))?;
                if !response.status().is_success() {
                    return Err(CoreError::RpcRejected(format!(
                        "faucet returned {}",
                        response.status()
                    )));
                }
                let body: Value = response
                    .json()
                    .await
                    .unwrap_or_else(|_| json!({"funded": true}));
                Ok(json!({"agent_id": args.agent_id, "address": record.address, "faucet": body}))
            }
        }
    }
}

fn parse_args<T: serde::de::DeserializeOwned>(args: &Value) -> Result<T, CoreError> {
    serde_json::from_value(args.clone()).map_err(|e| CoreError::InvalidParams(e.to_string()))
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, CoreError> {
    serde_json::to_value(value).map_err(|e| CoreError::Storage(e.to_string()))
}

/// Renders a wei figure as a decimal gwei string.
fn format_gwei(wei: u128) -> String {
    let whole = wei / 1_000_000_000;
    let frac = wei % 1_000_000_000;
    if frac == 0 {
        return whole.to_string();
    }
    format!("{whole}.{}", format!("{frac:09}").trim_end_matches('0'))
}
