//! Cryptographic building blocks.
//!
//! Composes audited primitives into the two key types the rest of the crate
//! speaks:
//! - [`KeyPair`]: ed25519 signing plus an x25519 sealing key
//! - [`SymKey`]: AES-256-GCM with a key identifier (KID)
//!
//! Both serialize to compact JSON with base64 byte fields.

mod keypair;
mod symkey;

pub use keypair::{KeyPair, SerializablePubKey};
pub use symkey::SymKey;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use taask_common::encoding::{b64, b64_opt};

/// Ciphertext sealed under a [`SymKey`] or to a [`KeyPair`]'s public half
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// KID of the key this message was sealed under
    pub kid: String,
    #[serde(with = "b64")]
    pub nonce: Vec<u8>,
    #[serde(with = "b64")]
    pub data: Vec<u8>,
    /// Sender's ephemeral x25519 public key (asymmetric seals only)
    #[serde(with = "b64_opt", default, skip_serializing_if = "Option::is_none")]
    pub ephemeral_key: Option<Vec<u8>>,
}

/// Detached ed25519 signature
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    /// KID of the signing keypair
    pub kid: String,
    #[serde(with = "b64")]
    pub data: Vec<u8>,
}

/// Short identifier derived from key material
pub(crate) fn derive_kid(material: &[u8]) -> String {
    let digest = Sha256::digest(material);
    URL_SAFE_NO_PAD.encode(&digest[..9])
}
