//! Encrypted persistence codec.
//!
//! Every persistent store serializes to JSON and is wrapped in an
//! AES-256-GCM envelope `{ iv, authTag, data }` (hex fields) before touching
//! disk.  Store keys are derived from the master key with Argon2id and a
//! per-store label salt, so a compromise of one store file never yields the
//! master key or a sibling store's key.
//!
//! Failure to open an envelope is a non-recoverable corrupt-store condition.
//! Callers must surface it; nothing in this crate resets or re-creates a
//! store that fails authentication.

mod envelope;
mod file;

pub use envelope::{Envelope, open, seal};
pub use file::{EncryptedFile, EncryptedLineLog};

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use argon2::{Algorithm, Argon2, Params, Version};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Environment variable holding the master encryption key.
pub const MASTER_KEY_ENV: &str = "MASTER_ENCRYPTION_KEY";

/// Minimum accepted master key length in bytes.
pub const MIN_MASTER_KEY_LEN: usize = 32;

/// Argon2id memory cost for store-key derivation (64 MiB, in KiB units).
const KDF_MEMORY_KIB: u32 = 64 * 1024;
/// Argon2id time cost (iterations).
const KDF_TIME_COST: u32 = 3;
/// Argon2id lane count.
const KDF_PARALLELISM: u32 = 4;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("{MASTER_KEY_ENV} is not set")]
    KeyMissing,

    #[error("master key must be at least {MIN_MASTER_KEY_LEN} bytes, got {0}")]
    KeyTooShort(usize),

    #[error("corrupt store: {0}")]
    Corrupt(String),

    #[error("encryption failed: {0}")]
    Crypto(String),

    #[error("key derivation failed: {0}")]
    Derivation(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

pub type VaultResult<T> = Result<T, VaultError>;

/// The process-wide master key, read once at startup.
///
/// Holds raw bytes; store keys are always derived, never the master key
/// used directly as a cipher key.
#[derive(Clone)]
pub struct MasterKey {
    bytes: Vec<u8>,
}

impl MasterKey {
    pub fn new(bytes: Vec<u8>) -> VaultResult<Self> {
        if bytes.len() < MIN_MASTER_KEY_LEN {
            return Err(VaultError::KeyTooShort(bytes.len()));
        }
        Ok(Self { bytes })
    }

    /// Read the key from `MASTER_ENCRYPTION_KEY`.  Startup must treat any
    /// error here as a configuration failure (exit code 64).
    pub fn from_env() -> VaultResult<Self> {
        let raw = std::env::var(MASTER_KEY_ENV).map_err(|_| VaultError::KeyMissing)?;
        Self::new(raw.into_bytes())
    }

    fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.debug_struct("MasterKey").field("len", &self.bytes.len()).finish()
    }
}

/// Process-wide memo of completed derivations, keyed by a digest of the
/// master key plus the store label.  Derivation is deterministic and
/// deliberately slow (memory-hard); a process pays for each store once.
fn derivation_cache() -> &'static Mutex<HashMap<(String, String), [u8; 32]>> {
    static CACHE: OnceLock<Mutex<HashMap<(String, String), [u8; 32]>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Derive the 32-byte cipher key for `store_name` from `master`.
///
/// Argon2id, 64 MiB / t=3 / p=4.  Deterministic: the same master key and
/// store name always yield the same subkey, so stores written before a
/// restart remain readable after it.
pub fn derive_store_key(master: &MasterKey, store_name: &str) -> VaultResult<[u8; 32]> {
    let cache_key = (
        hex_digest(master.as_bytes()),
        store_name.to_string(),
    );
    if let Some(key) = derivation_cache()
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .get(&cache_key)
    {
        return Ok(*key);
    }

    let params = Params::new(KDF_MEMORY_KIB, KDF_TIME_COST, KDF_PARALLELISM, Some(32))
        .map_err(|e| VaultError::Derivation(e.to_string()))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let salt = format!("sentra-store:{store_name}");
    let mut out = [0u8; 32];
    argon
        .hash_password_into(master.as_bytes(), salt.as_bytes(), &mut out)
        .map_err(|e| VaultError::Derivation(e.to_string()))?;

    derivation_cache()
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .insert(cache_key, out);
    Ok(out)
}

fn hex_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Memoizing wrapper around [`derive_store_key`].
///
/// Derivation is deliberately expensive (memory-hard KDF); the keyring pays
/// that cost once per store per process.  Async callers should run the first
/// [`StoreKeyring::key_for`] of each store under `spawn_blocking`.
pub struct StoreKeyring {
    master: MasterKey,
    derived: Mutex<HashMap<String, [u8; 32]>>,
}

impl StoreKeyring {
    pub fn new(master: MasterKey) -> Self {
        Self {
            master,
            derived: Mutex::new(HashMap::new()),
        }
    }

    pub fn key_for(&self, store_name: &str) -> VaultResult<[u8; 32]> {
        if let Some(key) = self
            .derived
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(store_name)
        {
            return Ok(*key);
        }

        let key = derive_store_key(&self.master, store_name)?;
        self.derived
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(store_name.to_string(), key);
        Ok(key)
    }
}
