//! AES-256-GCM symmetric keys.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use taask_common::encoding::b64;
use taask_common::{Result, TaaskError};

use super::{Message, derive_kid};

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Symmetric key used for task bodies, group wraps and partner data keys
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymKey {
    pub kid: String,
    #[serde(with = "b64")]
    key: Vec<u8>,
}

impl SymKey {
    /// Generate a fresh random key
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self::from_bytes(bytes)
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self {
            kid: derive_kid(&bytes),
            key: bytes.to_vec(),
        }
    }

    /// Deterministically derive a key from secret material under a domain label
    pub fn derive(domain: &[u8], material: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(domain);
        hasher.update(material);
        Self::from_bytes(hasher.finalize().into())
    }

    /// Parse the serialized (JSON) form
    pub fn from_json(json: &[u8]) -> Result<Self> {
        let key: SymKey = serde_json::from_slice(json)
            .map_err(|e| TaaskError::Crypto(format!("invalid sym key JSON: {}", e)))?;

        if key.key.len() != KEY_LEN {
            return Err(TaaskError::Crypto(format!(
                "invalid sym key length (expected {}, got {})",
                KEY_LEN,
                key.key.len()
            )));
        }

        let derived = derive_kid(&key.key);
        if derived != key.kid {
            return Err(TaaskError::Crypto(format!(
                "sym key KID mismatch (claimed {}, derived {})",
                key.kid, derived
            )));
        }

        Ok(key)
    }

    /// Serialized (JSON) form, the payload that gets wrapped for recipients
    pub fn to_json(&self) -> Vec<u8> {
        // A struct of a String and a byte field always serializes
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Message> {
        let (nonce, data) = seal(&self.key, plaintext)?;

        Ok(Message {
            kid: self.kid.clone(),
            nonce,
            data,
            ephemeral_key: None,
        })
    }

    pub fn decrypt(&self, message: &Message) -> Result<Vec<u8>> {
        if message.kid != self.kid {
            return Err(TaaskError::Crypto(format!(
                "message sealed with KID {}, key has KID {}",
                message.kid, self.kid
            )));
        }

        open(&self.key, &message.nonce, &message.data)
    }
}

impl fmt::Debug for SymKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymKey").field("kid", &self.kid).finish_non_exhaustive()
    }
}

/// AES-256-GCM encrypt with a random nonce; returns (nonce, ciphertext || tag)
pub(crate) fn seal(key: &[u8], plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| TaaskError::Crypto("invalid AES key length".to_string()))?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|_| TaaskError::Crypto("encryption failed".to_string()))?;

    Ok((nonce_bytes.to_vec(), ciphertext))
}

/// AES-256-GCM decrypt; fails if the tag does not authenticate
pub(crate) fn open(key: &[u8], nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    if nonce.len() != NONCE_LEN {
        return Err(TaaskError::Crypto("invalid nonce length".to_string()));
    }

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| TaaskError::Crypto("invalid AES key length".to_string()))?;

    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| TaaskError::Crypto("decryption failed (tag mismatch)".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let key = SymKey::generate();
        let message = key.encrypt(b"{\"First\":3}").unwrap();

        assert_eq!(message.kid, key.kid);
        assert!(message.ephemeral_key.is_none());
        assert_eq!(key.decrypt(&message).unwrap(), b"{\"First\":3}");
    }

    #[test]
    fn test_wrong_key_rejected() {
        let key = SymKey::generate();
        let other = SymKey::generate();
        let message = key.encrypt(b"secret").unwrap();

        assert!(matches!(other.decrypt(&message), Err(TaaskError::Crypto(_))));

        // Same KID but tampered ciphertext still fails authentication
        let mut tampered = message.clone();
        tampered.data[0] ^= 0xff;
        assert!(key.decrypt(&tampered).is_err());
    }

    #[test]
    fn test_json_form_preserves_kid() {
        let key = SymKey::generate();
        let parsed = SymKey::from_json(&key.to_json()).unwrap();
        assert_eq!(parsed, key);

        assert!(SymKey::from_json(br#"{"kid":"x","key":"AAAA"}"#).is_err());
        assert!(SymKey::from_json(b"not json").is_err());
    }

    #[test]
    fn test_json_with_foreign_kid_rejected() {
        let key = SymKey::generate();
        let mut value: serde_json::Value = serde_json::from_slice(&key.to_json()).unwrap();
        value["kid"] = SymKey::generate().kid.into();

        let forged = serde_json::to_vec(&value).unwrap();
        assert!(matches!(SymKey::from_json(&forged), Err(TaaskError::Crypto(_))));
    }

    #[test]
    fn test_derived_keys_are_deterministic() {
        let a = SymKey::derive(b"group", b"passphrase");
        let b = SymKey::derive(b"group", b"passphrase");
        let c = SymKey::derive(b"group", b"other");

        assert_eq!(a.kid, b.kid);
        assert_ne!(a.kid, c.kid);

        let message = a.encrypt(b"payload").unwrap();
        assert_eq!(b.decrypt(&message).unwrap(), b"payload");
    }
}
