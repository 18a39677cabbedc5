//! EVM JSON-RPC access with ordered-endpoint failover.
//!
//! [`ChainOps`] is the seam every higher component talks through; the
//! production [`ChainClient`] walks a configured endpoint list, rotating on
//! transport failure and keeping the first healthy endpoint sticky for
//! subsequent calls. A node-level rejection (the endpoint responded and
//! refused) never rotates: the node is reachable and a second node would
//! refuse for the same reason.
//!
//! Broadcast is at-most-once across endpoints: `send_raw` stops retrying
//! the moment any endpoint has returned a transaction hash.

use alloy_network::TransactionBuilder;
use alloy_primitives::{Address, B256, Bytes, U256};
use alloy_provider::{Provider, RootProvider};
use alloy_rpc_client::RpcClient;
use alloy_rpc_types_eth::{BlockNumberOrTag, TransactionRequest};
use alloy_transport::{RpcError, TransportErrorKind};
use alloy_transport_http::Http;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use url::Url;

use crate::config::{ChainConfig, ConfigError};
use crate::error::CoreError;

type TransportResult<T> = Result<T, RpcError<TransportErrorKind>>;

/// Snapshot of chain reachability and fee state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainStatus {
    pub chain_id: u64,
    pub latest_block: u64,
    /// Base fee of the next block, in wei.
    pub base_fee_per_gas: u128,
}

/// An EIP-1559 fee pair suggested for immediate inclusion.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FeeSuggestion {
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
    /// Base fee the suggestion was derived from, in wei.
    pub base_fee_per_gas: u128,
}

/// The subset of a transaction receipt the core exposes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiptInfo {
    pub tx_hash: B256,
    pub block_number: Option<u64>,
    pub gas_used: u64,
    pub success: bool,
}

/// Behavioral seam over EVM JSON-RPC.
///
/// The wallet and strategy layers depend on this trait only; tests drive
/// them with an in-memory implementation.
#[async_trait::async_trait]
pub trait ChainOps: Send + Sync {
    /// Chain id, latest block, and next base fee. Fails with
    /// `chain_unreachable` when no endpoint responds.
    async fn connected(&self) -> Result<ChainStatus, CoreError>;

    /// Native balance at the latest block, in wei.
    async fn balance(&self, address: Address) -> Result<U256, CoreError>;

    /// The chain's next usable nonce, pending-inclusive.
    async fn pending_nonce(&self, address: Address) -> Result<u64, CoreError>;

    /// Gas estimate for the exact call.
    async fn estimate_gas(
        &self,
        from: Address,
        to: Address,
        value: U256,
        data: Option<Bytes>,
    ) -> Result<u64, CoreError>;

    /// Fee pair for immediate inclusion; see [`ChainClient::fee_suggestion`]
    /// for the derivation.
    async fn fee_suggestion(&self) -> Result<FeeSuggestion, CoreError>;

    /// Broadcasts a signed raw transaction, returning its hash. At-most-once
    /// across endpoints.
    async fn send_raw(&self, tx_bytes: Vec<u8>) -> Result<B256, CoreError>;

    /// Polls for the receipt until `timeout`; `Ok(None)` means the timeout
    /// elapsed with the transaction still pending.
    async fn wait_receipt(
        &self,
        tx_hash: B256,
        timeout: Duration,
    ) -> Result<Option<ReceiptInfo>, CoreError>;

    /// Deployed bytecode at an address (empty for EOAs).
    async fn code_at(&self, address: Address) -> Result<Bytes, CoreError>;
}

struct Endpoint {
    url: Url,
    provider: RootProvider,
}

/// Production [`ChainOps`] over an ordered HTTP endpoint list.
pub struct ChainClient {
    chain_id: u64,
    endpoints: Vec<Endpoint>,
    /// Index of the endpoint that last answered; rotation starts here.
    cursor: AtomicUsize,
    request_timeout: Duration,
    receipt_poll_interval: Duration,
    fee_history_blocks: u64,
    priority_fee_percentile: f64,
}

impl ChainClient {
    pub fn from_config(config: &ChainConfig) -> Result<Self, ConfigError> {
        let endpoints = config
            .rpc
            .iter()
            .map(|rpc| {
                let scheme = rpc.http.scheme();
                if scheme != "http" && scheme != "https" {
                    return Err(ConfigError::Invalid(format!(
                        "unsupported RPC scheme: {}",
                        rpc.http
                    )));
                }
                tracing::info!(chain_id = config.chain_id, rpc_url = %rpc.http, "using HTTP transport");
                let transport = Http::new(rpc.http.clone());
                let client = RpcClient::new(transport, false);
                Ok(Endpoint {
                    url: rpc.http.clone(),
                    provider: RootProvider::new(client),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        if endpoints.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one RPC endpoint must be configured".into(),
            ));
        }
        Ok(Self {
            chain_id: config.chain_id,
            endpoints,
            cursor: AtomicUsize::new(0),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            receipt_poll_interval: Duration::from_millis(config.receipt_poll_interval_ms),
            fee_history_blocks: config.fee_history_blocks,
            priority_fee_percentile: config.priority_fee_percentile,
        })
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    pub fn active_endpoint(&self) -> usize {
        self.cursor.load(Ordering::Relaxed) % self.endpoints.len()
    }

    /// Runs `op` against the endpoint list, starting at the sticky cursor.
    ///
    /// Transport-layer failures and timeouts rotate to the next endpoint;
    /// an RPC-level error response ends the call immediately since the node
    /// was reachable and answered.
    async fn with_failover<T>(
        &self,
        op: &'static str,
        f: impl for<'a> Fn(
            &'a RootProvider,
        ) -> Pin<Box<dyn Future<Output = TransportResult<T>> + Send + 'a>>,
    ) -> Result<T, CoreError> {
        let total = self.endpoints.len();
        let start = self.cursor.load(Ordering::Relaxed);
        let mut last_failure = String::from("no endpoints configured");
        for attempt in 0..total {
            let index = (start + attempt) % total;
            let endpoint = &self.endpoints[index];
            match tokio::time::timeout(self.request_timeout, f(&endpoint.provider)).await {
                Ok(Ok(value)) => {
                    self.cursor.store(index, Ordering::Relaxed);
                    return Ok(value);
                }
                Ok(Err(RpcError::ErrorResp(payload))) => {
                    tracing::debug!(op, endpoint = %endpoint.url, code = payload.code, "rpc rejected");
                    return Err(CoreError::RpcRejected(format!(
                        "{} (code {})",
                        payload.message, payload.code
                    )));
                }
                Ok(Err(e)) => {
                    tracing::warn!(op, endpoint = %endpoint.url, error = %e, "endpoint failed, rotating");
                    last_failure = e.to_string();
                }
                Err(_) => {
                    tracing::warn!(op, endpoint = %endpoint.url, timeout = ?self.request_timeout, "endpoint timed out, rotating");
                    last_failure = format!("timeout after {:?}", self.request_timeout);
                }
            }
        }
        Err(CoreError::ChainUnreachable(format!(
            "{op}: all {total} endpoints failed, last: {last_failure}"
        )))
    }
}

#[async_trait::async_trait]
impl ChainOps for ChainClient {
    async fn connected(&self) -> Result<ChainStatus, CoreError> {
        let chain_id = self
            .with_failover("chain_id", |p| Box::pin(async move { p.get_chain_id().await }))
            .await?;
        let latest_block = self
            .with_failover("block_number", |p| {
                Box::pin(async move { p.get_block_number().await })
            })
            .await?;
        let history = self
            .with_failover("fee_history", |p| {
                Box::pin(async move {
                    p.get_fee_history(1, BlockNumberOrTag::Latest, &[]).await
                })
            })
            .await?;
        Ok(ChainStatus {
            chain_id,
            latest_block,
            base_fee_per_gas: history.latest_block_base_fee().unwrap_or_default(),
        })
    }

    async fn balance(&self, address: Address) -> Result<U256, CoreError> {
        self.with_failover("balance", move |p| {
            Box::pin(async move { p.get_balance(address).await })
        })
        .await
    }

    async fn pending_nonce(&self, address: Address) -> Result<u64, CoreError> {
        self.with_failover("pending_nonce", move |p| {
            Box::pin(async move { p.get_transaction_count(address).pending().await })
        })
        .await
    }

    async fn estimate_gas(
        &self,
        from: Address,
        to: Address,
        value: U256,
        data: Option<Bytes>,
    ) -> Result<u64, CoreError> {
        let request = TransactionRequest::default()
            .with_from(from)
            .with_to(to)
            .with_value(value)
            .with_input(data.unwrap_or_default());
        self.with_failover("estimate_gas", move |p| {
            let request = request.clone();
            Box::pin(async move { p.estimate_gas(request).await })
        })
        .await
    }

    /// Suggests an EIP-1559 fee pair.
    ///
    /// The priority fee is the configured percentile (default 50.0) of the
    /// rewards paid over the last `fee_history_blocks` blocks (default 10),
    /// taken as the median across blocks; both knobs are deployment
    /// configuration and stable within a release. When the history carries
    /// no reward samples the node's own `eth_maxPriorityFeePerGas` answer
    /// is used. `max_fee_per_gas` is `2 * base_fee + tip`, leaving headroom
    /// for one full base-fee increase before the cap binds.
    async fn fee_suggestion(&self) -> Result<FeeSuggestion, CoreError> {
        let blocks = self.fee_history_blocks;
        let percentile = self.priority_fee_percentile;
        let history = self
            .with_failover("fee_history", move |p| {
                Box::pin(async move {
                    p.get_fee_history(blocks, BlockNumberOrTag::Latest, &[percentile])
                        .await
                })
            })
            .await?;
        let base_fee = history.latest_block_base_fee().unwrap_or_default();

        let mut tips: Vec<u128> = history
            .reward
            .unwrap_or_default()
            .iter()
            .filter_map(|per_block| per_block.first().copied())
            .filter(|tip| *tip > 0)
            .collect();
        let tip = if tips.is_empty() {
            self.with_failover("max_priority_fee", |p| {
                Box::pin(async move { p.get_max_priority_fee_per_gas().await })
            })
            .await?
        } else {
            tips.sort_unstable();
            tips[tips.len() / 2]
        };

        Ok(FeeSuggestion {
            max_fee_per_gas: base_fee.saturating_mul(2).saturating_add(tip),
            max_priority_fee_per_gas: tip,
            base_fee_per_gas: base_fee,
        })
    }

    async fn send_raw(&self, tx_bytes: Vec<u8>) -> Result<B256, CoreError> {
        // Identical bytes re-broadcast to another endpoint hash identically,
        // so rotation before acceptance cannot double-spend; after any
        // endpoint returns a hash this call is over.
        self.with_failover("send_raw", move |p| {
            let tx_bytes = tx_bytes.clone();
            Box::pin(async move {
                let pending = p.send_raw_transaction(&tx_bytes).await?;
                Ok(*pending.tx_hash())
            })
        })
        .await
    }

    async fn wait_receipt(
        &self,
        tx_hash: B256,
        timeout: Duration,
    ) -> Result<Option<ReceiptInfo>, CoreError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let receipt = self
                .with_failover("receipt", move |p| {
                    Box::pin(async move { p.get_transaction_receipt(tx_hash).await })
                })
                .await?;
            if let Some(receipt) = receipt {
                return Ok(Some(ReceiptInfo {
                    tx_hash,
                    block_number: receipt.block_number,
                    gas_used: receipt.gas_used,
                    success: receipt.status(),
                }));
            }
            if tokio::time::Instant::now() + self.receipt_poll_interval > deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.receipt_poll_interval).await;
        }
    }

    async fn code_at(&self, address: Address) -> Result<Bytes, CoreError> {
        self.with_failover("code_at", move |p| {
            Box::pin(async move { p.get_code_at(address).await })
        })
        .await
    }
}

#[cfg(test)]
pub mod testing {
    //! Deterministic in-memory chain for wallet and strategy tests.

    use super::*;
    use alloy_consensus::TxEnvelope;
    use alloy_consensus::transaction::SignerRecoverable;
    use alloy_eips::eip2718::Decodable2718;
    use alloy_primitives::keccak256;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// A transaction the mock accepted, decoded for assertions.
    #[derive(Debug, Clone)]
    pub struct SentTx {
        pub hash: B256,
        pub from: Address,
        pub to: Option<Address>,
        pub nonce: u64,
        pub value: U256,
    }

    pub struct MockChain {
        pub chain_id: u64,
        pub balances: Mutex<HashMap<Address, U256>>,
        pub nonces: Mutex<HashMap<Address, u64>>,
        /// Base fee in wei; tests move it to exercise gas gates.
        pub base_fee: Mutex<u128>,
        pub priority_fee: u128,
        pub gas_estimate: u64,
        pub sent: Mutex<Vec<SentTx>>,
        /// When set, `send_raw` fails with `rpc_rejected`.
        pub reject_sends: Mutex<Option<String>>,
        /// When true, every call fails with `chain_unreachable`.
        pub unreachable: Mutex<bool>,
    }

    impl MockChain {
        pub fn new(chain_id: u64) -> Self {
            Self {
                chain_id,
                balances: Mutex::new(HashMap::new()),
                nonces: Mutex::new(HashMap::new()),
                base_fee: Mutex::new(1_000_000_000),
                priority_fee: 1_000_000_000,
                gas_estimate: 21_000,
                sent: Mutex::new(Vec::new()),
                reject_sends: Mutex::new(None),
                unreachable: Mutex::new(false),
            }
        }

        pub fn fund(&self, address: Address, wei: U256) {
            self.balances.lock().unwrap().insert(address, wei);
        }

        pub fn set_base_fee_gwei(&self, gwei: u128) {
            *self.base_fee.lock().unwrap() = gwei * 1_000_000_000;
        }

        pub fn sent_nonces(&self) -> Vec<u64> {
            self.sent.lock().unwrap().iter().map(|tx| tx.nonce).collect()
        }

        fn check_reachable(&self) -> Result<(), CoreError> {
            if *self.unreachable.lock().unwrap() {
                return Err(CoreError::ChainUnreachable("mock offline".into()));
            }
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl ChainOps for MockChain {
        async fn connected(&self) -> Result<ChainStatus, CoreError> {
            self.check_reachable()?;
            Ok(ChainStatus {
                chain_id: self.chain_id,
                latest_block: 1,
                base_fee_per_gas: *self.base_fee.lock().unwrap(),
            })
        }

        async fn balance(&self, address: Address) -> Result<U256, CoreError> {
            self.check_reachable()?;
            Ok(self
                .balances
                .lock()
                .unwrap()
                .get(&address)
                .copied()
                .unwrap_or_default())
        }

        async fn pending_nonce(&self, address: Address) -> Result<u64, CoreError> {
            self.check_reachable()?;
            Ok(self
                .nonces
                .lock()
                .unwrap()
                .get(&address)
                .copied()
                .unwrap_or_default())
        }

        async fn estimate_gas(
            &self,
            _from: Address,
            _to: Address,
            _value: U256,
            _data: Option<Bytes>,
        ) -> Result<u64, CoreError> {
            self.check_reachable()?;
            Ok(self.gas_estimate)
        }

        async fn fee_suggestion(&self) -> Result<FeeSuggestion, CoreError> {
            self.check_reachable()?;
            let base_fee = *self.base_fee.lock().unwrap();
            Ok(FeeSuggestion {
                max_fee_per_gas: base_fee * 2 + self.priority_fee,
                max_priority_fee_per_gas: self.priority_fee,
                base_fee_per_gas: base_fee,
            })
        }

        async fn send_raw(&self, tx_bytes: Vec<u8>) -> Result<B256, CoreError> {
            self.check_reachable()?;
            if let Some(reason) = self.reject_sends.lock().unwrap().clone() {
                return Err(CoreError::RpcRejected(reason));
            }
            let envelope = TxEnvelope::decode_2718(&mut tx_bytes.as_slice())
                .map_err(|e| CoreError::RpcRejected(format!("undecodable tx: {e}")))?;
            let from = envelope
                .recover_signer()
                .map_err(|e| CoreError::RpcRejected(format!("unrecoverable signer: {e}")))?;
            let (nonce, to, value) = match &envelope {
                TxEnvelope::Eip1559(signed) => {
                    let tx = signed.tx();
                    (tx.nonce, tx.to.to(), tx.value)
                }
                _ => return Err(CoreError::RpcRejected("unexpected tx type".into())),
            };
            let expected = self
                .nonces
                .lock()
                .unwrap()
                .get(&from)
                .copied()
                .unwrap_or_default();
            if nonce < expected {
                return Err(CoreError::RpcRejected(format!(
                    "nonce too low: got {nonce}, expected {expected}"
                )));
            }
            let hash = keccak256(&tx_bytes);
            self.nonces.lock().unwrap().insert(from, nonce + 1);
            self.sent.lock().unwrap().push(SentTx {
                hash,
                from,
                to: to.copied(),
                nonce,
                value,
            });
            Ok(hash)
        }

        async fn wait_receipt(
            &self,
            tx_hash: B256,
            _timeout: Duration,
        ) -> Result<Option<ReceiptInfo>, CoreError> {
            self.check_reachable()?;
            let known = self.sent.lock().unwrap().iter().any(|tx| tx.hash == tx_hash);
            Ok(known.then(|| ReceiptInfo {
                tx_hash,
                block_number: Some(1),
                gas_used: 21_000,
                success: true,
            }))
        }

        async fn code_at(&self, _address: Address) -> Result<Bytes, CoreError> {
            self.check_reachable()?;
            Ok(Bytes::new())
        }
    }
}
