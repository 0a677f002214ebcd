//! Asymmetric identities: ed25519 for signatures, x25519 for sealing.
//!
//! Sealing follows the usual ephemeral-static ECDH pattern: the sender draws a
//! one-off x25519 secret, derives an AES-256-GCM key from the shared secret,
//! and ships its ephemeral public key alongside the ciphertext.

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use taask_common::encoding::b64;
use taask_common::{Result, TaaskError};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use super::symkey::{open, seal};
use super::{Message, Signature, derive_kid};

const SEAL_DOMAIN: &[u8] = b"taask-seal-v1";

/// Public half of a [`KeyPair`] as it travels over the wire
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializablePubKey {
    pub kid: String,
    #[serde(with = "b64")]
    pub signing_key: Vec<u8>,
    #[serde(with = "b64")]
    pub encryption_key: Vec<u8>,
}

/// An asymmetric identity.
///
/// A keypair rebuilt from a [`SerializablePubKey`] has no private halves and
/// can only verify and encrypt.
#[derive(Clone)]
pub struct KeyPair {
    kid: String,
    signing: Option<SigningKey>,
    verifying: VerifyingKey,
    decryption: Option<StaticSecret>,
    encryption: X25519PublicKey,
}

impl KeyPair {
    /// Generate a new keypair with both private halves
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        let verifying = signing.verifying_key();
        let decryption = StaticSecret::random_from_rng(OsRng);
        let encryption = X25519PublicKey::from(&decryption);

        Self {
            kid: public_kid(&verifying, &encryption),
            signing: Some(signing),
            verifying,
            decryption: Some(decryption),
            encryption,
        }
    }

    /// Rebuild a public-only keypair from its wire form
    pub fn from_serialized_pub_key(pub_key: &SerializablePubKey) -> Result<Self> {
        let signing_bytes: [u8; 32] = pub_key
            .signing_key
            .as_slice()
            .try_into()
            .map_err(|_| TaaskError::Crypto("invalid signing key length".to_string()))?;
        let encryption_bytes: [u8; 32] = pub_key
            .encryption_key
            .as_slice()
            .try_into()
            .map_err(|_| TaaskError::Crypto("invalid encryption key length".to_string()))?;

        let verifying = VerifyingKey::from_bytes(&signing_bytes)
            .map_err(|e| TaaskError::Crypto(format!("invalid signing key: {}", e)))?;

        let encryption = X25519PublicKey::from(encryption_bytes);

        let kid = public_kid(&verifying, &encryption);
        if kid != pub_key.kid {
            return Err(TaaskError::Crypto(format!(
                "public key KID mismatch (claimed {}, derived {})",
                pub_key.kid, kid
            )));
        }

        Ok(Self {
            kid,
            signing: None,
            verifying,
            decryption: None,
            encryption,
        })
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    pub fn has_private_key(&self) -> bool {
        self.signing.is_some() && self.decryption.is_some()
    }

    pub fn serializable_pub_key(&self) -> SerializablePubKey {
        SerializablePubKey {
            kid: self.kid.clone(),
            signing_key: self.verifying.as_bytes().to_vec(),
            encryption_key: self.encryption.as_bytes().to_vec(),
        }
    }

    /// A copy of this keypair without its private halves
    pub fn public_only(&self) -> Self {
        Self {
            kid: self.kid.clone(),
            signing: None,
            verifying: self.verifying,
            decryption: None,
            encryption: self.encryption,
        }
    }

    pub fn sign(&self, message: &[u8]) -> Result<Signature> {
        let signing = self
            .signing
            .as_ref()
            .ok_or_else(|| TaaskError::Crypto("keypair has no signing key".to_string()))?;

        Ok(Signature {
            kid: self.kid.clone(),
            data: signing.sign(message).to_bytes().to_vec(),
        })
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<()> {
        let bytes: [u8; 64] = signature
            .data
            .as_slice()
            .try_into()
            .map_err(|_| TaaskError::Crypto("invalid signature length".to_string()))?;

        self.verifying
            .verify(message, &ed25519_dalek::Signature::from_bytes(&bytes))
            .map_err(|_| {
                TaaskError::Crypto(format!("signature does not verify against key {}", self.kid))
            })
    }

    /// Seal `plaintext` so only the holder of this keypair's private half can read it
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Message> {
        let ephemeral = StaticSecret::random_from_rng(OsRng);
        let ephemeral_public = X25519PublicKey::from(&ephemeral);
        let shared = ephemeral.diffie_hellman(&self.encryption);

        let key = seal_key(
            ephemeral_public.as_bytes(),
            self.encryption.as_bytes(),
            shared.as_bytes(),
        );
        let (nonce, data) = seal(&key, plaintext)?;

        Ok(Message {
            kid: self.kid.clone(),
            nonce,
            data,
            ephemeral_key: Some(ephemeral_public.as_bytes().to_vec()),
        })
    }

    pub fn decrypt(&self, message: &Message) -> Result<Vec<u8>> {
        let secret = self
            .decryption
            .as_ref()
            .ok_or_else(|| TaaskError::Crypto("keypair has no decryption key".to_string()))?;

        if message.kid != self.kid {
            return Err(TaaskError::Crypto(format!(
                "message sealed to KID {}, keypair has KID {}",
                message.kid, self.kid
            )));
        }

        let ephemeral_bytes: [u8; 32] = message
            .ephemeral_key
            .as_deref()
            .ok_or_else(|| TaaskError::Crypto("message has no ephemeral key".to_string()))?
            .try_into()
            .map_err(|_| TaaskError::Crypto("invalid ephemeral key length".to_string()))?;

        let ephemeral_public = X25519PublicKey::from(ephemeral_bytes);
        let shared = secret.diffie_hellman(&ephemeral_public);

        let key = seal_key(&ephemeral_bytes, self.encryption.as_bytes(), shared.as_bytes());
        open(&key, &message.nonce, &message.data)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("kid", &self.kid)
            .field("private", &self.has_private_key())
            .finish()
    }
}

/// KID covering both public halves
fn public_kid(verifying: &VerifyingKey, encryption: &X25519PublicKey) -> String {
    let mut material = Vec::with_capacity(64);
    material.extend_from_slice(verifying.as_bytes());
    material.extend_from_slice(encryption.as_bytes());
    derive_kid(&material)
}

fn seal_key(ephemeral: &[u8], recipient: &[u8], shared: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(SEAL_DOMAIN);
    hasher.update(ephemeral);
    hasher.update(recipient);
    hasher.update(shared);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let keypair = KeyPair::generate();
        let signature = keypair.sign(b"challenge").unwrap();

        assert!(keypair.verify(b"challenge", &signature).is_ok());
        assert!(keypair.verify(b"tampered", &signature).is_err());

        let other = KeyPair::generate();
        assert!(other.verify(b"challenge", &signature).is_err());
    }

    #[test]
    fn test_seal_to_public_key() {
        let recipient = KeyPair::generate();
        let public = KeyPair::from_serialized_pub_key(&recipient.serializable_pub_key()).unwrap();
        assert!(!public.has_private_key());

        let message = public.encrypt(b"task key").unwrap();
        assert_eq!(recipient.decrypt(&message).unwrap(), b"task key");

        // Public-only keypairs can neither open nor sign
        assert!(public.decrypt(&message).is_err());
        assert!(public.sign(b"x").is_err());

        // A different keypair cannot open it
        let stranger = KeyPair::generate();
        assert!(stranger.decrypt(&message).is_err());
    }

    #[test]
    fn test_pub_key_roundtrips_through_json() {
        let keypair = KeyPair::generate();
        let json = serde_json::to_string(&keypair.serializable_pub_key()).unwrap();
        let parsed: SerializablePubKey = serde_json::from_str(&json).unwrap();
        let public = KeyPair::from_serialized_pub_key(&parsed).unwrap();

        assert_eq!(public.kid(), keypair.kid());
        let signature = keypair.sign(b"hello").unwrap();
        assert!(public.verify(b"hello", &signature).is_ok());
    }

    #[test]
    fn test_forged_kid_rejected() {
        let keypair = KeyPair::generate();
        let mut pub_key = keypair.serializable_pub_key();
        pub_key.kid = "forged".to_string();

        assert!(KeyPair::from_serialized_pub_key(&pub_key).is_err());
    }

    #[test]
    fn test_swapped_encryption_key_rejected() {
        let keypair = KeyPair::generate();
        let mut pub_key = keypair.serializable_pub_key();
        pub_key.encryption_key = KeyPair::generate().serializable_pub_key().encryption_key;

        assert!(matches!(
            KeyPair::from_serialized_pub_key(&pub_key),
            Err(TaaskError::Crypto(_))
        ));
    }
}
