//! Custody daemon entrypoint.
//!
//! Boots the core from configuration, starts the strategy scheduler, and
//! serves the tool surface over stdio JSON lines: one request object per
//! line (`{"id"?, "tool", "args"}`), one response per line
//! (`{"id"?, "ok": ...}` or `{"id"?, "error": {"kind", "message"}}`).
//! Richer transports adapt [`custodian_rs::tools::AgentCore`] directly.
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `CONFIG` selects the JSON config file (default `config.json`)
//! - `RUST_LOG` controls tracing verbosity

use dotenvy::dotenv;
use serde::Deserialize;
use serde_json::{Value, json};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use custodian_rs::chain::{ChainClient, ChainOps};
use custodian_rs::config::Config;
use custodian_rs::journal::EventJournal;
use custodian_rs::keystore::KeyStore;
use custodian_rs::policy::PolicyEngine;
use custodian_rs::shutdown::Shutdown;
use custodian_rs::strategy::StrategyManager;
use custodian_rs::telemetry::Telemetry;
use custodian_rs::tools::{AgentCore, ToolName};
use custodian_rs::wallet::{SpendPolicy, WalletManager};

#[derive(Debug, Deserialize)]
struct ToolRequest {
    #[serde(default)]
    id: Option<Value>,
    tool: String,
    #[serde(default)]
    args: Value,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    Telemetry::new()
        .with_name(env!("CARGO_PKG_NAME"))
        .with_version(env!("CARGO_PKG_VERSION"))
        .register();

    let config = Config::load()?;
    std::fs::create_dir_all(config.data_dir())?;

    let chain_client = Arc::new(ChainClient::from_config(config.chain())?);
    match chain_client.connected().await {
        Ok(status) => {
            if status.chain_id != config.chain().chain_id {
                tracing::warn!(
                    configured = config.chain().chain_id,
                    reported = status.chain_id,
                    "endpoint reports a different chain id than configured"
                );
            }
            tracing::info!(
                chain_id = status.chain_id,
                latest_block = status.latest_block,
                "chain reachable"
            );
        }
        Err(e) => {
            tracing::warn!(error = %e, "chain unreachable at startup, continuing");
        }
    }

    let keystore = Arc::new(KeyStore::open(
        config.data_dir(),
        config
            .custody()
            .secret
            .clone()
            .map(|secret| secret.into_inner()),
    )?);
    let journal = Arc::new(EventJournal::open(&config.data_dir().join("events.jsonl"))?);
    let policy = Arc::new(PolicyEngine::new(journal, config.policy()));

    let chain: Arc<dyn ChainOps> = chain_client.clone();
    let wallet = Arc::new(WalletManager::new(
        config.chain().chain_id,
        chain.clone(),
        keystore,
        SpendPolicy::from_config(config.policy()),
    ));
    let strategies = Arc::new(StrategyManager::open(
        config.data_dir(),
        wallet.clone(),
        chain.clone(),
        config
            .policy()
            .confirmation_code
            .as_ref()
            .map(|code| code.inner().clone()),
    )?);
    let core = Arc::new(AgentCore::new(
        wallet,
        strategies.clone(),
        policy,
        chain,
        Some(chain_client),
        config.faucet_url().cloned(),
    ));

    let shutdown = Shutdown::try_new()?;
    let scheduler = tokio::spawn(strategies.run_scheduler(
        Duration::from_secs(config.scheduler().tick_interval_secs),
        shutdown.cancellation_token(),
    ));

    serve_stdio(core, shutdown.cancellation_token()).await;
    scheduler.await?;
    Ok(())
}

/// Line-oriented JSON adapter over stdin/stdout. EOF or a shutdown signal
/// ends the loop; the scheduler is cancelled alongside it.
async fn serve_stdio(core: Arc<AgentCore>, cancel: CancellationToken) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    tracing::info!("tool adapter listening on stdio");
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => return,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                tracing::info!("stdin closed, shutting down");
                cancel.cancel();
                return;
            }
            Err(e) => {
                tracing::error!(error = %e, "stdin read failed, shutting down");
                cancel.cancel();
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let response = handle_line(&core, &line).await;
        println!("{response}");
    }
}

async fn handle_line(core: &AgentCore, line: &str) -> Value {
    let request: ToolRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            return json!({
                "error": {"kind": "invalid_params", "message": format!("unparseable request: {e}")}
            });
        }
    };
    let id = request.id.clone().unwrap_or(Value::Null);
    let tool = match ToolName::from_str(&request.tool) {
        Ok(tool) => tool,
        Err(e) => {
            return json!({
                "id": id,
                "error": {"kind": e.kind(), "message": e.to_string()}
            });
        }
    };
    match core.dispatch(tool, request.args).await {
        Ok(result) => json!({"id": id, "ok": result}),
        Err(e) => json!({
            "id": id,
            "error": {"kind": e.kind(), "message": e.to_string()}
        }),
    }
}
