//! Wallet lifecycle and the transfer pipeline.
//!
//! Transfers from one address are strictly serialized: a per-address token
//! (one `tokio::sync::Mutex` per sender, registry in a `DashMap`) is held
//! from before the nonce fetch until the nonce-advance write commits.
//! Transfers from different addresses proceed in parallel. The nonce used
//! is `max(chain pending nonce, last broadcast nonce + 1)`; the chain is
//! the source of truth, the local floor guards against a lagging endpoint
//! replaying an already-used nonce.
//!
//! If the nonce-advance write fails after a node accepted the broadcast,
//! the sending address is quarantined: every later transfer for it fails
//! `broadcast_aborted` until an operator restarts the process and
//! reconciles. A re-used nonce must never leave this core.

use alloy_consensus::{SignableTransaction, TxEip1559, TxEnvelope};
use alloy_dyn_abi::TypedData;
use alloy_eips::eip2718::Encodable2718;
use alloy_network::TxSignerSync;
use alloy_primitives::{Address, B256, TxKind, U256};
use alloy_signer::SignerSync;
use alloy_signer_local::coins_bip39::English;
use alloy_signer_local::{MnemonicBuilder, PrivateKeySigner};
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::chain::ChainOps;
use crate::config::{PolicyConfig, SecretString};
use crate::error::CoreError;
use crate::keystore::KeyStore;
use crate::units::NativeAmount;

/// Spend gating and export gating, fixed at startup.
#[derive(Debug, Clone, Default)]
pub struct SpendPolicy {
    /// Transfers above this require the confirmation code.
    pub spend_threshold: Option<NativeAmount>,
    pub confirmation_code: Option<SecretString>,
    pub plaintext_export_enabled: bool,
    pub plaintext_export_code: Option<SecretString>,
}

impl SpendPolicy {
    pub fn from_config(config: &PolicyConfig) -> Self {
        Self {
            spend_threshold: config.spend_threshold,
            confirmation_code: config.confirmation_code.as_ref().map(|c| c.inner().clone()),
            plaintext_export_enabled: config.plaintext_export_enabled,
            plaintext_export_code: config
                .plaintext_export_code
                .as_ref()
                .map(|c| c.inner().clone()),
        }
    }
}

/// Pre-flight figures for a transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSimulation {
    pub gas: u64,
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
    pub fee_native: NativeAmount,
    pub total_native: NativeAmount,
    pub balance: NativeAmount,
    pub sufficient_balance: bool,
}

/// Result of `execute_transfer`.
#[derive(Debug, Clone)]
pub enum TransferOutcome {
    Sent { tx_hash: B256, nonce: u64 },
    DryRun(TransferSimulation),
}

/// Wallet creation, import, signing, and policy-gated transfers.
pub struct WalletManager {
    chain_id: u64,
    chain: Arc<dyn ChainOps>,
    keystore: Arc<KeyStore>,
    policy: SpendPolicy,
    /// One serialization token per sender address. The dashmap lock is
    /// held only long enough to clone the Arc, never across an await.
    transfer_tokens: DashMap<Address, Arc<Mutex<()>>>,
    /// Addresses with an accepted broadcast the store failed to record.
    quarantined: DashSet<Address>,
}

impl WalletManager {
    pub fn new(
        chain_id: u64,
        chain: Arc<dyn ChainOps>,
        keystore: Arc<KeyStore>,
        policy: SpendPolicy,
    ) -> Self {
        Self {
            chain_id,
            chain,
            keystore,
            policy,
            transfer_tokens: DashMap::new(),
            quarantined: DashSet::new(),
        }
    }

    pub fn keystore(&self) -> &KeyStore {
        &self.keystore
    }

    /// Generates a fresh key for `agent_id` and stores it sealed.
    ///
    /// An address collision with an existing record is astronomically
    /// unlikely but cheap to retry, so generation tries a few times before
    /// surfacing `address_reuse`.
    pub fn create_wallet(&self, agent_id: &str) -> Result<Address, CoreError> {
        validate_agent_id(agent_id)?;
        let mut last_err = CoreError::AddressReuse;
        for _ in 0..3 {
            let signer = PrivateKeySigner::random();
            let address = signer.address();
            let key = signer.to_bytes();
            let sealed = self.keystore.seal(agent_id, key.as_slice());
            let metadata = BTreeMap::from([("origin".to_string(), "generated".to_string())]);
            match self
                .keystore
                .put(agent_id, address, sealed, self.chain_id, metadata)
            {
                Ok(()) => {
                    tracing::info!(agent_id, %address, "wallet created");
                    return Ok(address);
                }
                Err(CoreError::AddressReuse) => last_err = CoreError::AddressReuse,
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }

    /// Imports a raw 32-byte private key.
    pub fn import_privkey(&self, agent_id: &str, private_key: &str) -> Result<Address, CoreError> {
        validate_agent_id(agent_id)?;
        let bytes = B256::from_str(private_key.trim()).map_err(|_| CoreError::BadKey)?;
        let signer = PrivateKeySigner::from_bytes(&bytes).map_err(|_| CoreError::BadKey)?;
        self.store_imported(agent_id, signer, "imported_privkey")
    }

    /// Imports the first account of a BIP-39 mnemonic (standard EVM
    /// derivation path).
    pub fn import_mnemonic(&self, agent_id: &str, mnemonic: &str) -> Result<Address, CoreError> {
        validate_agent_id(agent_id)?;
        let signer = MnemonicBuilder::<English>::default()
            .phrase(mnemonic.trim())
            .build()
            .map_err(|_| CoreError::BadKey)?;
        self.store_imported(agent_id, signer, "imported_mnemonic")
    }

    fn store_imported(
        &self,
        agent_id: &str,
        signer: PrivateKeySigner,
        origin: &str,
    ) -> Result<Address, CoreError> {
        let address = signer.address();
        let key = signer.to_bytes();
        let sealed = self.keystore.seal(agent_id, key.as_slice());
        let metadata = BTreeMap::from([("origin".to_string(), origin.to_string())]);
        self.keystore
            .put(agent_id, address, sealed, self.chain_id, metadata)?;
        tracing::info!(agent_id, %address, origin, "wallet imported");
        Ok(address)
    }

    pub fn list_wallets(&self) -> Vec<(String, Address)> {
        self.keystore.list()
    }

    pub async fn query_balance(&self, agent_id: &str) -> Result<NativeAmount, CoreError> {
        let record = self.keystore.get(agent_id)?;
        let balance = self.chain.balance(record.address).await?;
        Ok(NativeAmount::from_wei(balance))
    }

    /// Pre-flight for a transfer without touching any state.
    pub async fn simulate_transfer(
        &self,
        agent_id: &str,
        to: &str,
        amount: NativeAmount,
    ) -> Result<TransferSimulation, CoreError> {
        let to_addr = parse_address(to)?;
        let record = self.keystore.get(agent_id)?;
        self.build_simulation(record.address, to_addr, amount).await
    }

    async fn build_simulation(
        &self,
        from: Address,
        to: Address,
        amount: NativeAmount,
    ) -> Result<TransferSimulation, CoreError> {
        let fees = self.chain.fee_suggestion().await?;
        let gas = self
            .chain
            .estimate_gas(from, to, amount.wei(), None)
            .await?;
        let fee_wei = U256::from(gas) * U256::from(fees.max_fee_per_gas);
        let total = amount
            .wei()
            .checked_add(fee_wei)
            .ok_or_else(|| CoreError::InvalidParams("amount overflows".into()))?;
        let balance = self.chain.balance(from).await?;
        Ok(TransferSimulation {
            gas,
            max_fee_per_gas: fees.max_fee_per_gas,
            max_priority_fee_per_gas: fees.max_priority_fee_per_gas,
            fee_native: NativeAmount::from_wei(fee_wei),
            total_native: NativeAmount::from_wei(total),
            balance: NativeAmount::from_wei(balance),
            sufficient_balance: total <= balance,
        })
    }

    /// Executes a native transfer under the per-address token.
    ///
    /// Order of operations inside the critical section: nonce resolution,
    /// fee and gas pre-flight, balance check, spend-threshold gate,
    /// dry-run short-circuit, sign, broadcast, nonce advance. A failure
    /// before broadcast leaves no trace; a broadcast the store could not
    /// record quarantines the address.
    pub async fn execute_transfer(
        &self,
        agent_id: &str,
        to: &str,
        amount: NativeAmount,
        confirmation_code: Option<&str>,
        dry_run: bool,
    ) -> Result<TransferOutcome, CoreError> {
        let to_addr = parse_address(to)?;
        let record = self.keystore.get(agent_id)?;
        if record.chain_id != self.chain_id {
            return Err(CoreError::InvalidParams(format!(
                "wallet is bound to chain {}, active chain is {}",
                record.chain_id, self.chain_id
            )));
        }
        let from = record.address;

        let token = self.transfer_token(from);
        let _guard = token.lock().await;

        // Checked under the token: a concurrent transfer may have tripped
        // the quarantine while this one waited.
        if self.quarantined.contains(&from) {
            return Err(CoreError::BroadcastAborted(from.to_string()));
        }

        // Reload inside the critical section; `last_nonce` may have moved
        // while this call waited for the token.
        let record = self.keystore.get(agent_id)?;
        let pending = self.chain.pending_nonce(from).await?;
        let floor = record.last_nonce.map_or(0, |last| last + 1);
        let nonce = pending.max(floor);

        let simulation = self.build_simulation(from, to_addr, amount).await?;
        if !simulation.sufficient_balance {
            return Err(CoreError::InsufficientFunds {
                needed: simulation.total_native.to_string(),
                available: simulation.balance.to_string(),
            });
        }

        if let Some(threshold) = self.policy.spend_threshold {
            if amount > threshold {
                match (&self.policy.confirmation_code, confirmation_code) {
                    (Some(expected), Some(supplied)) => {
                        if !expected.matches(supplied) {
                            return Err(CoreError::ConfirmationMismatch);
                        }
                    }
                    (_, None) => return Err(CoreError::ConfirmationRequired),
                    // A threshold without a configured code can never be
                    // satisfied; fail closed.
                    (None, Some(_)) => return Err(CoreError::ConfirmationRequired),
                }
            }
        }

        if dry_run {
            return Ok(TransferOutcome::DryRun(simulation));
        }

        let raw = {
            let key = self.keystore.decrypt(agent_id)?;
            if key.len() != 32 {
                return Err(CoreError::DecryptFailed(agent_id.to_string()));
            }
            let signer = PrivateKeySigner::from_bytes(&B256::from_slice(&key))
                .map_err(|_| CoreError::BadKey)?;
            // `key` zeroizes on drop here; the signer's own copy zeroizes
            // when the signer drops at the end of this block.
            let mut tx = TxEip1559 {
                chain_id: self.chain_id,
                nonce,
                gas_limit: simulation.gas,
                max_fee_per_gas: simulation.max_fee_per_gas,
                max_priority_fee_per_gas: simulation.max_priority_fee_per_gas,
                to: TxKind::Call(to_addr),
                value: amount.wei(),
                access_list: Default::default(),
                input: Default::default(),
            };
            let signature = signer
                .sign_transaction_sync(&mut tx)
                .map_err(|_| CoreError::BadKey)?;
            TxEnvelope::Eip1559(tx.into_signed(signature)).encoded_2718()
        };

        let tx_hash = self.chain.send_raw(raw).await?;

        if let Err(e) = self.keystore.advance_nonce(agent_id, nonce) {
            self.quarantined.insert(from);
            tracing::error!(
                agent_id,
                address = %from,
                nonce,
                %tx_hash,
                error = %e,
                "broadcast_aborted_persistence: nonce advance failed after accepted broadcast, address quarantined"
            );
            return Err(CoreError::BroadcastAborted(from.to_string()));
        }

        tracing::info!(agent_id, address = %from, nonce, %tx_hash, amount = %amount, "transfer broadcast");
        Ok(TransferOutcome::Sent { tx_hash, nonce })
    }

    /// EIP-191 personal signature over `message`. Deterministic.
    pub fn sign_message(&self, agent_id: &str, message: &str) -> Result<String, CoreError> {
        let signer = self.signer_for(agent_id)?;
        let signature = signer
            .sign_message_sync(message.as_bytes())
            .map_err(|_| CoreError::BadKey)?;
        Ok(format!("0x{}", hex::encode(signature.as_bytes())))
    }

    /// EIP-712 signature over a typed-data document. Deterministic.
    pub fn sign_typed_data(
        &self,
        agent_id: &str,
        typed_data: serde_json::Value,
    ) -> Result<String, CoreError> {
        let typed: TypedData = serde_json::from_value(typed_data)
            .map_err(|e| CoreError::InvalidParams(format!("typed data: {e}")))?;
        let hash = typed
            .eip712_signing_hash()
            .map_err(|e| CoreError::InvalidParams(format!("typed data: {e}")))?;
        let signer = self.signer_for(agent_id)?;
        let signature = signer.sign_hash_sync(&hash).map_err(|_| CoreError::BadKey)?;
        Ok(format!("0x{}", hex::encode(signature.as_bytes())))
    }

    /// Password-based keystore export; safe by default.
    pub fn export_keystore(
        &self,
        agent_id: &str,
        passphrase: &str,
    ) -> Result<serde_json::Value, CoreError> {
        self.keystore.export_keystore(agent_id, passphrase)
    }

    /// Plaintext key export behind the deployment double gate.
    pub fn export_private_key(
        &self,
        agent_id: &str,
        confirmation_code: Option<&str>,
    ) -> Result<String, CoreError> {
        self.keystore.export_plaintext(
            agent_id,
            self.policy.plaintext_export_enabled,
            self.policy.plaintext_export_code.as_ref(),
            confirmation_code,
        )
    }

    fn signer_for(&self, agent_id: &str) -> Result<PrivateKeySigner, CoreError> {
        let key = self.keystore.decrypt(agent_id)?;
        if key.len() != 32 {
            return Err(CoreError::DecryptFailed(agent_id.to_string()));
        }
        PrivateKeySigner::from_bytes(&B256::from_slice(&key)).map_err(|_| CoreError::BadKey)
    }

    fn transfer_token(&self, address: Address) -> Arc<Mutex<()>> {
        let entry = self
            .transfer_tokens
            .entry(address)
            .or_insert_with(|| Arc::new(Mutex::new(())));
        Arc::clone(entry.value())
    }
}

fn validate_agent_id(agent_id: &str) -> Result<(), CoreError> {
    if agent_id.is_empty() || agent_id.len() > 128 {
        return Err(CoreError::InvalidParams(
            "agent_id must be 1..=128 characters".into(),
        ));
    }
    Ok(())
}

/// Parses a destination address, enforcing the EIP-55 checksum when the
/// input is mixed-case, and returns the canonical form.
pub fn parse_address(input: &str) -> Result<Address, CoreError> {
    let trimmed = input.trim();
    let address =
        Address::from_str(trimmed).map_err(|_| CoreError::BadAddress(trimmed.to_string()))?;
    let body = trimmed.trim_start_matches("0x");
    let mixed_case = body.chars().any(|c| c.is_ascii_uppercase())
        && body.chars().any(|c| c.is_ascii_lowercase());
    let has_alpha = body.chars().any(|c| c.is_ascii_alphabetic());
    if has_alpha && mixed_case {
        Address::parse_checksummed(trimmed, None)
            .map_err(|_| CoreError::BadAddress(trimmed.to_string()))?;
    }
    Ok(address)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::testing::MockChain;
    use crate::config::DeploymentSecret;
    use alloy_primitives::utils::parse_ether;

    const CHAIN_ID: u64 = 31337;
    const DEST: &str = "0x0000000000000000000000000000000000000001";

    struct Harness {
        wallet: WalletManager,
        chain: Arc<MockChain>,
        _dir: tempfile::TempDir,
        dir_path: std::path::PathBuf,
    }

    fn harness(policy: SpendPolicy) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let dir_path = dir.path().to_path_buf();
        let keystore = Arc::new(
            KeyStore::open(dir.path(), Some(DeploymentSecret::from_bytes([3u8; 32]))).unwrap(),
        );
        let chain = Arc::new(MockChain::new(CHAIN_ID));
        let wallet = WalletManager::new(CHAIN_ID, chain.clone(), keystore, policy);
        Harness {
            wallet,
            chain,
            _dir: dir,
            dir_path,
        }
    }

    fn eth(s: &str) -> U256 {
        parse_ether(s).unwrap()
    }

    fn amount(s: &str) -> NativeAmount {
        NativeAmount::parse(s).unwrap()
    }

    #[test]
    fn create_wallet_and_list() {
        let h = harness(SpendPolicy::default());
        let address = h.wallet.create_wallet("a1").unwrap();
        assert_eq!(h.wallet.list_wallets(), vec![("a1".to_string(), address)]);
        assert_eq!(
            h.wallet.create_wallet("a1").unwrap_err().kind(),
            "agent_exists"
        );
    }

    #[test]
    fn import_privkey_derives_expected_address() {
        let h = harness(SpendPolicy::default());
        let signer = PrivateKeySigner::random();
        let key_hex = format!("0x{}", hex::encode(signer.to_bytes()));
        let address = h.wallet.import_privkey("a1", &key_hex).unwrap();
        assert_eq!(address, signer.address());

        assert_eq!(
            h.wallet.import_privkey("a2", "0x1234").unwrap_err().kind(),
            "bad_key"
        );
    }

    #[test]
    fn import_mnemonic_is_deterministic() {
        let phrase = "test test test test test test test test test test test junk";
        let h1 = harness(SpendPolicy::default());
        let h2 = harness(SpendPolicy::default());
        let a = h1.wallet.import_mnemonic("a1", phrase).unwrap();
        let b = h2.wallet.import_mnemonic("a1", phrase).unwrap();
        assert_eq!(a, b);

        assert_eq!(
            h1.wallet
                .import_mnemonic("a2", "not a mnemonic")
                .unwrap_err()
                .kind(),
            "bad_key"
        );
    }

    #[test]
    fn parse_address_checksums() {
        // Valid EIP-55 checksum.
        assert!(parse_address("0xd8dA6BF26964aF9D7eEd9e03E53415D37aA96045").is_ok());
        // Broken checksum.
        assert_eq!(
            parse_address("0xd8da6BF26964aF9D7eEd9e03E53415D37aA96045")
                .unwrap_err()
                .kind(),
            "bad_address"
        );
        // All-lowercase is accepted.
        assert!(parse_address("0xd8da6bf26964af9d7eed9e03e53415d37aa96045").is_ok());
        assert_eq!(parse_address("0x123").unwrap_err().kind(), "bad_address");
    }

    #[tokio::test]
    async fn basic_transfer_advances_nonce() {
        let h = harness(SpendPolicy {
            spend_threshold: Some(amount("1")),
            confirmation_code: Some(SecretString::new("OK-42")),
            ..SpendPolicy::default()
        });
        let address = h.wallet.create_wallet("a1").unwrap();
        h.chain.fund(address, eth("0.5"));

        let outcome = h
            .wallet
            .execute_transfer("a1", DEST, amount("0.1"), None, false)
            .await
            .unwrap();
        let TransferOutcome::Sent { tx_hash, nonce } = outcome else {
            panic!("expected broadcast");
        };
        assert_eq!(tx_hash.len(), 32);
        assert_eq!(nonce, 0);

        let outcome = h
            .wallet
            .execute_transfer("a1", DEST, amount("0.1"), None, false)
            .await
            .unwrap();
        let TransferOutcome::Sent { nonce, .. } = outcome else {
            panic!("expected broadcast");
        };
        assert_eq!(nonce, 1);

        assert_eq!(h.chain.sent_nonces(), vec![0, 1]);
        let sent = h.chain.sent.lock().unwrap();
        assert_eq!(sent[0].to, Some(parse_address(DEST).unwrap()));
        assert_eq!(sent[0].value, eth("0.1"));
        assert_eq!(sent[0].from, address);
    }

    #[tokio::test]
    async fn threshold_gate_requires_matching_code() {
        let h = harness(SpendPolicy {
            spend_threshold: Some(amount("0.1")),
            confirmation_code: Some(SecretString::new("OK-42")),
            ..SpendPolicy::default()
        });
        let address = h.wallet.create_wallet("a1").unwrap();
        h.chain.fund(address, eth("10"));

        let err = h
            .wallet
            .execute_transfer("a1", DEST, amount("0.2"), None, false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "confirmation_required");

        let err = h
            .wallet
            .execute_transfer("a1", DEST, amount("0.2"), Some("nope"), false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "confirmation_mismatch");

        let outcome = h
            .wallet
            .execute_transfer("a1", DEST, amount("0.2"), Some("OK-42"), false)
            .await
            .unwrap();
        assert!(matches!(outcome, TransferOutcome::Sent { .. }));

        // At or below the threshold no code is needed.
        let outcome = h
            .wallet
            .execute_transfer("a1", DEST, amount("0.1"), None, false)
            .await
            .unwrap();
        assert!(matches!(outcome, TransferOutcome::Sent { .. }));
    }

    #[tokio::test]
    async fn insufficient_funds_leaves_no_trace() {
        let h = harness(SpendPolicy::default());
        let address = h.wallet.create_wallet("a1").unwrap();
        h.chain.fund(address, eth("0.01"));

        let err = h
            .wallet
            .execute_transfer("a1", DEST, amount("0.02"), None, false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "insufficient_funds");
        assert!(h.chain.sent.lock().unwrap().is_empty());
        assert_eq!(h.wallet.keystore().get("a1").unwrap().last_nonce, None);
    }

    #[tokio::test]
    async fn dry_run_signs_and_broadcasts_nothing() {
        let h = harness(SpendPolicy::default());
        let address = h.wallet.create_wallet("a1").unwrap();
        h.chain.fund(address, eth("1"));

        let outcome = h
            .wallet
            .execute_transfer("a1", DEST, amount("0.1"), None, true)
            .await
            .unwrap();
        let TransferOutcome::DryRun(simulation) = outcome else {
            panic!("expected dry run");
        };
        assert!(simulation.sufficient_balance);
        assert_eq!(simulation.gas, 21_000);
        assert!(h.chain.sent.lock().unwrap().is_empty());
        assert_eq!(h.wallet.keystore().get("a1").unwrap().last_nonce, None);
    }

    #[tokio::test]
    async fn rejected_broadcast_does_not_advance_nonce() {
        let h = harness(SpendPolicy::default());
        let address = h.wallet.create_wallet("a1").unwrap();
        h.chain.fund(address, eth("1"));
        *h.chain.reject_sends.lock().unwrap() = Some("nonce too low".into());

        let err = h
            .wallet
            .execute_transfer("a1", DEST, amount("0.1"), None, false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "rpc_rejected");
        assert_eq!(h.wallet.keystore().get("a1").unwrap().last_nonce, None);

        // The address is not quarantined; the next attempt goes through.
        *h.chain.reject_sends.lock().unwrap() = None;
        let outcome = h
            .wallet
            .execute_transfer("a1", DEST, amount("0.1"), None, false)
            .await
            .unwrap();
        assert!(matches!(outcome, TransferOutcome::Sent { nonce: 0, .. }));
    }

    #[tokio::test]
    async fn local_floor_beats_lagging_pending_nonce() {
        let h = harness(SpendPolicy::default());
        let address = h.wallet.create_wallet("a1").unwrap();
        h.chain.fund(address, eth("1"));
        // A broadcast happened before; the endpoint still reports 0.
        h.wallet.keystore().advance_nonce("a1", 5).unwrap();

        let outcome = h
            .wallet
            .execute_transfer("a1", DEST, amount("0.1"), None, false)
            .await
            .unwrap();
        assert!(matches!(outcome, TransferOutcome::Sent { nonce: 6, .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_transfers_serialize_per_address() {
        let h = harness(SpendPolicy::default());
        let address = h.wallet.create_wallet("a1").unwrap();
        h.chain.fund(address, eth("10"));
        let wallet = Arc::new(h.wallet);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let wallet = Arc::clone(&wallet);
            handles.push(tokio::spawn(async move {
                wallet
                    .execute_transfer("a1", DEST, amount("0.1"), None, false)
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let mut nonces = h.chain.sent_nonces();
        nonces.sort_unstable();
        assert_eq!(nonces, vec![0, 1, 2, 3]);
        assert_eq!(
            wallet.keystore().get("a1").unwrap().last_nonce,
            Some(3)
        );
    }

    #[tokio::test]
    async fn failed_nonce_persist_quarantines_address() {
        let h = harness(SpendPolicy::default());
        let address = h.wallet.create_wallet("a1").unwrap();
        h.chain.fund(address, eth("1"));

        // Pull the store directory out from under the keystore so the
        // nonce-advance commit cannot happen.
        std::fs::remove_dir_all(&h.dir_path).unwrap();

        let err = h
            .wallet
            .execute_transfer("a1", DEST, amount("0.1"), None, false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "broadcast_aborted");
        // The broadcast did happen.
        assert_eq!(h.chain.sent.lock().unwrap().len(), 1);

        // Further transfers on the address are refused outright.
        let err = h
            .wallet
            .execute_transfer("a1", DEST, amount("0.1"), None, false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "broadcast_aborted");
        assert_eq!(h.chain.sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn sign_message_is_deterministic() {
        let h = harness(SpendPolicy::default());
        h.wallet.create_wallet("a1").unwrap();
        let first = h.wallet.sign_message("a1", "hello world").unwrap();
        let second = h.wallet.sign_message("a1", "hello world").unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 2 + 65 * 2);

        assert_eq!(
            h.wallet.sign_message("ghost", "x").unwrap_err().kind(),
            "not_found"
        );
    }

    #[test]
    fn sign_typed_data_is_deterministic() {
        let h = harness(SpendPolicy::default());
        h.wallet.create_wallet("a1").unwrap();
        let doc = serde_json::json!({
            "types": {
                "EIP712Domain": [
                    {"name": "name", "type": "string"},
                    {"name": "chainId", "type": "uint256"}
                ],
                "Agreement": [
                    {"name": "payer", "type": "address"},
                    {"name": "amount", "type": "uint256"}
                ]
            },
            "primaryType": "Agreement",
            "domain": {"name": "custody", "chainId": 31337},
            "message": {
                "payer": "0x0000000000000000000000000000000000000001",
                "amount": 1000
            }
        });
        let first = h.wallet.sign_typed_data("a1", doc.clone()).unwrap();
        let second = h.wallet.sign_typed_data("a1", doc).unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn chain_mismatch_is_rejected() {
        let h = harness(SpendPolicy::default());
        h.wallet.create_wallet("a1").unwrap();
        let other_chain = Arc::new(MockChain::new(1));
        let wallet = WalletManager::new(
            1,
            other_chain,
            Arc::clone(&h.wallet.keystore),
            SpendPolicy::default(),
        );
        let err = wallet
            .execute_transfer("a1", DEST, amount("0.1"), None, false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_params");
    }
}
