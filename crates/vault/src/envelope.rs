//! AES-256-GCM envelope wrap/unwrap.
//!
//! Wire format per file (or per audit line):
//! `{ "iv": hex(12 bytes), "authTag": hex(16 bytes), "data": hex(ciphertext) }`.
//! A fresh random nonce is generated for every seal; the GCM tag is split
//! from the ciphertext tail into its own field.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use serde::{Deserialize, Serialize};

use crate::{VaultError, VaultResult};

/// AES-256-GCM nonce length (96 bits).
const IV_LEN: usize = 12;
/// GCM authentication tag length.
const TAG_LEN: usize = 16;

/// On-disk envelope.  All three fields are lowercase hex.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub iv: String,
    #[serde(rename = "authTag")]
    pub auth_tag: String,
    pub data: String,
}

/// Encrypt `plaintext` under `key`.
pub fn seal(key: &[u8; 32], plaintext: &[u8]) -> VaultResult<Envelope> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| VaultError::Crypto(e.to_string()))?;
    let nonce = Aes256Gcm::generate_nonce(OsRng);

    // aes-gcm appends the tag to the ciphertext; split it into its own field.
    let mut sealed = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| VaultError::Crypto(e.to_string()))?;
    if sealed.len() < TAG_LEN {
        return Err(VaultError::Crypto("ciphertext shorter than tag".to_string()));
    }
    let tag = sealed.split_off(sealed.len() - TAG_LEN);

    Ok(Envelope {
        iv: hex::encode(nonce),
        auth_tag: hex::encode(tag),
        data: hex::encode(sealed),
    })
}

/// Decrypt an envelope.  Every failure mode — bad hex, wrong iv length,
/// failed tag authentication — is [`VaultError::Corrupt`]: the caller must
/// treat the store as unrecoverable, never silently reset it.
pub fn open(key: &[u8; 32], envelope: &Envelope) -> VaultResult<Vec<u8>> {
    let iv = hex::decode(&envelope.iv)
        .map_err(|_| VaultError::Corrupt("iv is not valid hex".to_string()))?;
    if iv.len() != IV_LEN {
        return Err(VaultError::Corrupt(format!(
            "iv must be {IV_LEN} bytes, got {}",
            iv.len()
        )));
    }

    let tag = hex::decode(&envelope.auth_tag)
        .map_err(|_| VaultError::Corrupt("authTag is not valid hex".to_string()))?;
    if tag.len() != TAG_LEN {
        return Err(VaultError::Corrupt(format!(
            "authTag must be {TAG_LEN} bytes, got {}",
            tag.len()
        )));
    }

    let mut ciphertext = hex::decode(&envelope.data)
        .map_err(|_| VaultError::Corrupt("data is not valid hex".to_string()))?;
    ciphertext.extend_from_slice(&tag);

    let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| VaultError::Crypto(e.to_string()))?;
    let nonce = Nonce::from_slice(&iv);
    cipher
        .decrypt(nonce, ciphertext.as_slice())
        .map_err(|_| VaultError::Corrupt("authentication tag mismatch".to_string()))
}
