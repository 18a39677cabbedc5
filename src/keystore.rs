//! Encrypted custody of agent signing keys.
//!
//! Each agent's private key is sealed under the deployment secret with
//! AES-256-GCM and persisted inside a single atomically-replaced JSON file.
//! Sealing derives a fresh single-use AEAD key per record through
//! HKDF-SHA256 over a random 32-byte key id, so the fixed zero nonce is
//! never reused under the same key. The agent id is bound as additional
//! authenticated data: a ciphertext copied between records fails to open.
//!
//! Envelope layout: `[version:1][key_id:32][ciphertext][tag:16]`.

use alloy_primitives::{Address, Bytes};
use rand::RngCore;
use ring::{aead, digest, hkdf};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use zeroize::Zeroizing;

use crate::config::{DeploymentSecret, SecretString};
use crate::error::CoreError;
use crate::store::{self, StoreError};
use crate::timestamp::UnixTimestamp;

const SEAL_VERSION: u8 = 1;
const KEY_ID_LEN: usize = 32;
const TAG_LEN: usize = 16;
const HKDF_SALT: &[u8] = b"custodian-rs/keystore/seal/v1";

/// Name of the generated sidecar secret under the data dir.
const SIDECAR_FILE: &str = "custody-secret.key";
/// Name of the wallets store under the data dir.
const WALLETS_FILE: &str = "wallets.json";

/// One agent's custody record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletRecord {
    pub agent_id: String,
    pub address: Address,
    /// Sealed key envelope; opens only under the deployment secret.
    pub ciphertext: Bytes,
    pub chain_id: u64,
    /// Last nonce this core successfully broadcast, `None` before the
    /// first broadcast. Monotone non-decreasing.
    pub last_nonce: Option<u64>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub created_at: UnixTimestamp,
    pub updated_at: UnixTimestamp,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct WalletsFile {
    /// Truncated digest of the sealing secret; a mismatch on open means
    /// the records cannot be decrypted and startup must stop.
    secret_fingerprint: String,
    wallets: BTreeMap<String, WalletRecord>,
}

/// Startup failures. Operational failures after open use [`CoreError`].
#[derive(Debug, thiserror::Error)]
pub enum KeyStoreInitError {
    #[error("failed to prepare data dir {0}: {1}")]
    DataDir(PathBuf, std::io::Error),
    #[error("failed to read sidecar secret {0}: {1}")]
    SidecarRead(PathBuf, std::io::Error),
    #[error("sidecar secret {0} is not 32 bytes of hex")]
    SidecarCorrupt(PathBuf),
    #[error("failed to write sidecar secret {0}: {1}")]
    SidecarWrite(PathBuf, std::io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(
        "configured secret does not match the secret that sealed the existing wallet records"
    )]
    SecretMismatch,
}

/// The wallet-record store. Owns records exclusively; every write is a
/// single atomic file replacement.
#[derive(Debug)]
pub struct KeyStore {
    secret: DeploymentSecret,
    path: PathBuf,
    inner: Mutex<WalletsFile>,
}

impl KeyStore {
    /// Opens the store under `data_dir`.
    ///
    /// When no secret is configured, a sidecar secret is loaded from, or
    /// generated into, the data dir. If records exist that were sealed
    /// under a different secret the open fails: continuing would strand
    /// every key behind `decrypt_failed`.
    pub fn open(
        data_dir: &Path,
        configured: Option<DeploymentSecret>,
    ) -> Result<Self, KeyStoreInitError> {
        fs::create_dir_all(data_dir)
            .map_err(|e| KeyStoreInitError::DataDir(data_dir.to_path_buf(), e))?;

        let secret = match configured {
            Some(secret) => secret,
            None => Self::load_or_generate_sidecar(&data_dir.join(SIDECAR_FILE))?,
        };
        let fingerprint = secret_fingerprint(&secret);

        let path = data_dir.join(WALLETS_FILE);
        let file = match store::load::<WalletsFile>(&path)? {
            Some(file) => {
                if file.secret_fingerprint != fingerprint {
                    return Err(KeyStoreInitError::SecretMismatch);
                }
                file
            }
            None => WalletsFile {
                secret_fingerprint: fingerprint,
                wallets: BTreeMap::new(),
            },
        };
        tracing::info!(wallets = file.wallets.len(), path = %path.display(), "key store opened");
        Ok(Self {
            secret,
            path,
            inner: Mutex::new(file),
        })
    }

    fn load_or_generate_sidecar(path: &Path) -> Result<DeploymentSecret, KeyStoreInitError> {
        match fs::read_to_string(path) {
            Ok(content) => {
                let mut bytes = [0u8; 32];
                hex::decode_to_slice(content.trim().trim_start_matches("0x"), &mut bytes)
                    .map_err(|_| KeyStoreInitError::SidecarCorrupt(path.to_path_buf()))?;
                Ok(DeploymentSecret::from_bytes(bytes))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let mut bytes = [0u8; 32];
                rand::thread_rng().fill_bytes(&mut bytes);
                let encoded = hex::encode(bytes);
                fs::write(path, &encoded)
                    .map_err(|e| KeyStoreInitError::SidecarWrite(path.to_path_buf(), e))?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o600));
                }
                tracing::warn!(
                    path = %path.display(),
                    "no custody secret configured, generated sidecar secret; back it up"
                );
                Ok(DeploymentSecret::from_bytes(bytes))
            }
            Err(e) => Err(KeyStoreInitError::SidecarRead(path.to_path_buf(), e)),
        }
    }

    /// Seals key bytes for `agent_id` under the deployment secret.
    pub fn seal(&self, agent_id: &str, key_bytes: &[u8]) -> Bytes {
        let mut key_id = [0u8; KEY_ID_LEN];
        rand::thread_rng().fill_bytes(&mut key_id);
        let key = derive_seal_key(&self.secret, &key_id);

        let mut out = Vec::with_capacity(1 + KEY_ID_LEN + key_bytes.len() + TAG_LEN);
        out.push(SEAL_VERSION);
        out.extend_from_slice(&key_id);

        let mut buf = key_bytes.to_vec();
        let tag = key
            .seal_in_place_separate_tag(
                zero_nonce(),
                aead::Aad::from(agent_id.as_bytes()),
                &mut buf,
            )
            .expect("plaintext far below AEAD size limit");
        out.extend_from_slice(&buf);
        out.extend_from_slice(tag.as_ref());
        Bytes::from(out)
    }

    /// Opens the sealed envelope for `agent_id`.
    ///
    /// Any modification of the envelope, and any attempt to open it under
    /// a different agent id, fails authentication.
    pub fn decrypt(&self, agent_id: &str) -> Result<Zeroizing<Vec<u8>>, CoreError> {
        let record = self.get(agent_id)?;
        self.unseal(agent_id, &record.ciphertext)
    }

    fn unseal(&self, agent_id: &str, data: &[u8]) -> Result<Zeroizing<Vec<u8>>, CoreError> {
        let fail = || CoreError::DecryptFailed(agent_id.to_string());
        if data.len() < 1 + KEY_ID_LEN + TAG_LEN || data[0] != SEAL_VERSION {
            return Err(fail());
        }
        let mut key_id = [0u8; KEY_ID_LEN];
        key_id.copy_from_slice(&data[1..1 + KEY_ID_LEN]);
        let key = derive_seal_key(&self.secret, &key_id);

        let mut buf = Zeroizing::new(data[1 + KEY_ID_LEN..].to_vec());
        let plaintext = key
            .open_in_place(zero_nonce(), aead::Aad::from(agent_id.as_bytes()), &mut buf)
            .map_err(|_| fail())?;
        Ok(Zeroizing::new(plaintext.to_vec()))
    }

    /// Inserts a new wallet record. The write is atomic: a failed persist
    /// leaves no trace of the record.
    pub fn put(
        &self,
        agent_id: &str,
        address: Address,
        ciphertext: Bytes,
        chain_id: u64,
        metadata: BTreeMap<String, String>,
    ) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().expect("keystore lock poisoned");
        if inner.wallets.contains_key(agent_id) {
            return Err(CoreError::AgentExists(agent_id.to_string()));
        }
        if inner.wallets.values().any(|w| w.address == address) {
            return Err(CoreError::AddressReuse);
        }
        let now = UnixTimestamp::try_now().map_err(|e| CoreError::Storage(e.to_string()))?;
        inner.wallets.insert(
            agent_id.to_string(),
            WalletRecord {
                agent_id: agent_id.to_string(),
                address,
                ciphertext,
                chain_id,
                last_nonce: None,
                metadata,
                created_at: now,
                updated_at: now,
            },
        );
        if let Err(e) = store::save(&self.path, &*inner) {
            inner.wallets.remove(agent_id);
            return Err(CoreError::Storage(e.to_string()));
        }
        Ok(())
    }

    pub fn get(&self, agent_id: &str) -> Result<WalletRecord, CoreError> {
        self.inner
            .lock()
            .expect("keystore lock poisoned")
            .wallets
            .get(agent_id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(agent_id.to_string()))
    }

    /// Records a broadcast nonce: `last_nonce = max(last_nonce, used_nonce)`.
    ///
    /// Called inside the transfer critical section right after the node
    /// accepts the broadcast; a failure here is what quarantines the
    /// sending address.
    pub fn advance_nonce(&self, agent_id: &str, used_nonce: u64) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().expect("keystore lock poisoned");
        let record = inner
            .wallets
            .get_mut(agent_id)
            .ok_or_else(|| CoreError::NotFound(agent_id.to_string()))?;
        let previous = record.last_nonce;
        record.last_nonce = Some(previous.map_or(used_nonce, |last| last.max(used_nonce)));
        record.updated_at =
            UnixTimestamp::try_now().map_err(|e| CoreError::Storage(e.to_string()))?;
        if let Err(e) = store::save(&self.path, &*inner) {
            // Roll the in-memory view back so it matches the file.
            let record = inner
                .wallets
                .get_mut(agent_id)
                .expect("record present above");
            record.last_nonce = previous;
            return Err(CoreError::Storage(e.to_string()));
        }
        Ok(())
    }

    pub fn list(&self) -> Vec<(String, Address)> {
        self.inner
            .lock()
            .expect("keystore lock poisoned")
            .wallets
            .values()
            .map(|w| (w.agent_id.clone(), w.address))
            .collect()
    }

    /// Re-encrypts the agent's key under a caller-supplied passphrase using
    /// the standard EVM keystore scheme (scrypt + AES-128-CTR), returning
    /// the keystore JSON document.
    pub fn export_keystore(
        &self,
        agent_id: &str,
        passphrase: &str,
    ) -> Result<serde_json::Value, CoreError> {
        use alloy_signer_local::PrivateKeySigner;

        let key = self.decrypt(agent_id)?;
        let export_dir = self
            .path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("exports");
        fs::create_dir_all(&export_dir).map_err(|e| CoreError::Storage(e.to_string()))?;

        let file_name = format!("{agent_id}.keystore.json");
        let (_, _uuid) = PrivateKeySigner::encrypt_keystore(
            &export_dir,
            &mut rand::thread_rng(),
            key.as_slice(),
            passphrase,
            Some(&file_name),
        )
        .map_err(|e| CoreError::Storage(format!("keystore encryption failed: {e}")))?;

        let file_path = export_dir.join(&file_name);
        let content =
            fs::read_to_string(&file_path).map_err(|e| CoreError::Storage(e.to_string()))?;
        // The caller receives the document; nothing stays on disk.
        let _ = fs::remove_file(&file_path);
        serde_json::from_str(&content).map_err(|e| CoreError::Storage(e.to_string()))
    }

    /// Returns the raw key hex, gated twice: the deployment must enable
    /// plaintext export AND the caller must present the matching code.
    ///
    /// Both gates are checked before the agent lookup so a denial reveals
    /// nothing about which agents exist.
    pub fn export_plaintext(
        &self,
        agent_id: &str,
        enabled: bool,
        expected_code: Option<&SecretString>,
        supplied_code: Option<&str>,
    ) -> Result<String, CoreError> {
        let code_ok = match (expected_code, supplied_code) {
            (Some(expected), Some(supplied)) => expected.matches(supplied),
            _ => false,
        };
        if !enabled || !code_ok {
            return Err(CoreError::ExportDenied);
        }
        let key = self.decrypt(agent_id)?;
        Ok(format!("0x{}", hex::encode(key.as_slice())))
    }
}

fn secret_fingerprint(secret: &DeploymentSecret) -> String {
    let hash = digest::digest(&digest::SHA256, secret.as_bytes());
    hex::encode(&hash.as_ref()[..8])
}

fn derive_seal_key(secret: &DeploymentSecret, key_id: &[u8; KEY_ID_LEN]) -> aead::LessSafeKey {
    let prk = hkdf::Salt::new(hkdf::HKDF_SHA256, HKDF_SALT).extract(secret.as_bytes());
    let info: [&[u8]; 1] = [key_id];
    let okm = prk
        .expand(&info, &aead::AES_256_GCM)
        .expect("HKDF expand of AES-256 key length");
    aead::LessSafeKey::new(aead::UnboundKey::from(okm))
}

/// Each derived key seals exactly one envelope, so the nonce never repeats
/// under the same key.
fn zero_nonce() -> aead::Nonce {
    aead::Nonce::assume_unique_for_key([0u8; 12])
}
