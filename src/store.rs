//! Atomic, versioned JSON files backing the persistent stores.
//!
//! Each store file is a single JSON document wrapped in a
//! `{"version": N, ...}` envelope. Writes go to a temp file in the same
//! directory, are fsynced, then renamed over the target, so readers observe
//! either the previous document or the new one, never a partial write.
//! Loading dispatches on the envelope version; unknown versions are a
//! distinct error so a schema bump cannot be silently misread.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Current schema version for every store file in this crate.
pub const STORE_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to read {0}: {1}")]
    Read(PathBuf, std::io::Error),
    #[error("failed to write {0}: {1}")]
    Write(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    Parse(PathBuf, serde_json::Error),
    #[error("{path}: unsupported store version {found}, this release reads version {expected}")]
    UnsupportedVersion {
        path: PathBuf,
        found: u32,
        expected: u32,
    },
}

#[derive(Debug, Serialize, serde::Deserialize)]
struct Envelope<T> {
    version: u32,
    #[serde(flatten)]
    data: T,
}

/// Loads a store file, returning `None` when it does not exist yet.
pub fn load<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::Read(path.to_path_buf(), e)),
    };
    let raw: serde_json::Value =
        serde_json::from_str(&content).map_err(|e| StoreError::Parse(path.to_path_buf(), e))?;
    let found = raw
        .get("version")
        .and_then(|v| v.as_u64())
        .unwrap_or(0) as u32;
    // Migration dispatch. New versions add an arm that rewrites `raw`
    // before the final parse.
    match found {
        STORE_VERSION => {
            let envelope: Envelope<T> = serde_json::from_value(raw)
                .map_err(|e| StoreError::Parse(path.to_path_buf(), e))?;
            Ok(Some(envelope.data))
        }
        _ => Err(StoreError::UnsupportedVersion {
            path: path.to_path_buf(),
            found,
            expected: STORE_VERSION,
        }),
    }
}

/// Atomically replaces the store file with the serialized document.
pub fn save<T: Serialize>(path: &Path, data: &T) -> Result<(), StoreError> {
    let envelope = Envelope {
        version: STORE_VERSION,
        data,
    };
    let bytes = serde_json::to_vec_pretty(&envelope)
        .map_err(|e| StoreError::Parse(path.to_path_buf(), e))?;

    let tmp = path.with_extension("json.tmp");
    let write = |tmp: &Path| -> std::io::Result<()> {
        let mut file = fs::File::create(tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        Ok(())
    };
    write(&tmp).map_err(|e| StoreError::Write(tmp.clone(), e))?;
    fs::rename(&tmp, path).map_err(|e| StoreError::Write(path.to_path_buf(), e))?;

    // Make the rename durable across a crash.
    if let Some(dir) = path.parent() {
        if let Ok(dir_handle) = fs::File::open(dir) {
            let _ = dir_handle.sync_all();
        }
    }
    Ok(())
}
